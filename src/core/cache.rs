//! Cache and read-batching for local tool operations.
//!
//! Repeated read-style tool calls (same operation, equivalent arguments) hit
//! a process-wide cache instead of the filesystem. Keys canonicalize the
//! argument object so differently-ordered but equivalent requests collide.
//! Entries are immutable; writes to the same key are last-write-wins and a
//! reader never observes a torn entry (all access goes through one mutex).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_entries: 256,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    /// Path-like resource the entry was derived from; used for invalidation.
    resource: Option<String>,
    created_at: Instant,
}

#[derive(Debug)]
pub struct ToolCache {
    policy: CachePolicy,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

/// Builds the canonical cache key for an operation and its arguments.
/// Object keys are sorted recursively so `{"a":1,"b":2}` and `{"b":2,"a":1}`
/// produce the same key.
pub fn cache_key(operation: &str, args: &Map<String, Value>) -> String {
    let canonical = canonicalize(&Value::Object(args.clone()));
    format!("{operation}:{canonical}")
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        Value::String(key.clone()),
                        canonicalize(&map[key])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

impl ToolCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value for `operation`+`args`, or `None` on a miss
    /// or an expired entry (expired entries are dropped on the way out).
    pub fn get(&self, operation: &str, args: &Map<String, Value>) -> Option<Value> {
        let key = cache_key(operation, args);
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(&key) {
            Some(entry) if entry.created_at.elapsed() < self.policy.ttl => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Stores a value, evicting the oldest entry when the size bound is hit.
    pub fn put(
        &self,
        operation: &str,
        args: &Map<String, Value>,
        resource: Option<String>,
        value: Value,
    ) {
        let key = cache_key(operation, args);
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        if entries.len() >= self.policy.max_entries && !entries.contains_key(&key) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(key, _)| key.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value,
                resource,
                created_at: Instant::now(),
            },
        );
    }

    /// Drops every entry whose resource path starts with `prefix`. Called
    /// after write-style operations so stale reads cannot be served.
    pub fn invalidate(&self, prefix: &str) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.retain(|_, entry| {
            entry
                .resource
                .as_deref()
                .is_none_or(|resource| !resource.starts_with(prefix))
        });
    }

    /// Drops everything. Used after operations with unknowable side effects
    /// (shell commands).
    pub fn clear(&self) {
        self.entries.lock().expect("cache mutex poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serves a batch of compatible read requests: cache hits are answered
    /// directly, the remaining misses are coalesced into one `run_batch`
    /// call, and fresh results populate the cache. Results come back in the
    /// order the requests were given.
    ///
    /// `resource_of` names the path-like argument used for invalidation.
    pub async fn batch_reads<F, Fut>(
        &self,
        operation: &str,
        requests: Vec<Map<String, Value>>,
        resource_of: impl Fn(&Map<String, Value>) -> Option<String>,
        run_batch: F,
    ) -> Vec<Result<Value, String>>
    where
        F: FnOnce(Vec<Map<String, Value>>) -> Fut,
        Fut: Future<Output = Vec<Result<Value, String>>>,
    {
        let mut results: Vec<Option<Result<Value, String>>> = vec![None; requests.len()];
        let mut misses: Vec<(usize, Map<String, Value>)> = Vec::new();

        for (position, args) in requests.iter().enumerate() {
            match self.get(operation, args) {
                Some(value) => results[position] = Some(Ok(value)),
                None => misses.push((position, args.clone())),
            }
        }

        if !misses.is_empty() {
            let batch_args: Vec<Map<String, Value>> =
                misses.iter().map(|(_, args)| args.clone()).collect();
            let outcomes = run_batch(batch_args).await;

            for ((position, args), outcome) in misses.into_iter().zip(outcomes) {
                if let Ok(value) = &outcome {
                    self.put(operation, &args, resource_of(&args), value.clone());
                }
                results[position] = Some(outcome);
            }
        }

        results
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err("batch produced no result".to_string())))
            .collect()
    }
}
