//! Tool registry and per-turn execution.
//!
//! Handlers are registered under unique names with a JSON-schema parameter
//! spec; the schema is compiled at registration so a bad schema fails at
//! startup rather than at call time. Executing a turn produces exactly one
//! [`ToolResult`] per [`ToolCall`]: unknown names, malformed arguments, and
//! handler failures all become error payloads the model can read, never
//! crashes.

pub mod fs;
pub mod search;
pub mod shell;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::api::ChatToolDefinition;
use crate::core::cache::ToolCache;
use crate::core::message::{ToolCall, ToolResult};

/// How a tool interacts with local resources; drives cache routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Read-style: routed through the cache, results are reusable until
    /// something invalidates them.
    Read,
    /// Write-style: bypasses the cache and invalidates read entries for the
    /// resource it touched.
    Write,
    /// Side effects on paths the engine cannot know in advance; bypasses
    /// and clears the whole cache on success.
    Volatile,
    /// No local resource involvement (e.g. network lookups); bypasses the
    /// cache entirely.
    External,
}

/// One registered tool capability. Handlers must be reentrant: the executor
/// invokes them concurrently for different calls within a turn.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON-schema parameter spec, advertised to the model and enforced on
    /// every call.
    fn parameters(&self) -> Value;

    fn kind(&self) -> ToolKind;

    async fn run(&self, args: Map<String, Value>) -> Result<Value, String>;

    /// Batch form for read-style handlers that can answer several requests
    /// in one underlying operation. The default runs requests one by one;
    /// overriding it is what makes coalescing worthwhile.
    async fn run_batch(&self, requests: Vec<Map<String, Value>>) -> Vec<Result<Value, String>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.run(request).await);
        }
        results
    }
}

#[derive(Debug, Error)]
pub enum ToolRegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateName(String),
    #[error("tool '{name}' has an invalid parameter schema: {reason}")]
    InvalidSchema { name: String, reason: String },
}

struct RegisteredTool {
    handler: Arc<dyn ToolHandler>,
    validator: jsonschema::Validator,
}

/// Name → capability mapping, validated at startup.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> Result<(), ToolRegistryError> {
        let name = handler.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolRegistryError::DuplicateName(name));
        }
        let schema = handler.parameters();
        let validator =
            jsonschema::validator_for(&schema).map_err(|error| ToolRegistryError::InvalidSchema {
                name: name.clone(),
                reason: error.to_string(),
            })?;
        self.tools.insert(name, RegisteredTool { handler, validator });
        Ok(())
    }

    /// Tool schema list for the request payload, in stable name order.
    pub fn definitions(&self) -> Vec<ChatToolDefinition> {
        let sorted: BTreeMap<&String, &RegisteredTool> = self.tools.iter().collect();
        sorted
            .values()
            .map(|tool| {
                ChatToolDefinition::function(
                    tool.handler.name(),
                    tool.handler.description(),
                    tool.handler.parameters(),
                )
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }
}

/// The path-like argument a call operates on, used as the cache resource.
fn resource_path(args: &Map<String, Value>) -> Option<String> {
    for key in ["filename", "path", "directory"] {
        if let Some(value) = args.get(key).and_then(Value::as_str) {
            return Some(value.to_string());
        }
    }
    None
}

enum CallPlan {
    Ready {
        handler: Arc<dyn ToolHandler>,
        args: Map<String, Value>,
    },
    Rejected(ToolResult),
}

/// Dispatches the tool calls of one assistant turn.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    cache: Arc<ToolCache>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, cache: Arc<ToolCache>) -> Self {
        Self { registry, cache }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Executes every call of one turn and returns exactly one result per
    /// call, in the order the calls were requested. Calls run concurrently;
    /// read-style calls to the same tool are coalesced through the cache.
    pub async fn execute_turn(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        let mut plans: Vec<CallPlan> = Vec::with_capacity(calls.len());
        for call in calls {
            plans.push(self.plan_call(call));
        }

        let mut results: Vec<Option<ToolResult>> = Vec::with_capacity(calls.len());
        results.resize_with(calls.len(), || None);

        // Read-style calls grouped per tool; everything else dispatched
        // individually. All futures run concurrently and each yields the
        // results for the positions it owns.
        let mut read_groups: HashMap<String, Vec<(usize, Map<String, Value>)>> = HashMap::new();
        let mut futures: Vec<BoxFuture<'static, Vec<(usize, ToolResult)>>> = Vec::new();

        for (position, plan) in plans.into_iter().enumerate() {
            match plan {
                CallPlan::Rejected(result) => results[position] = Some(result),
                CallPlan::Ready { handler, args } => {
                    if handler.kind() == ToolKind::Read {
                        read_groups
                            .entry(handler.name().to_string())
                            .or_default()
                            .push((position, args));
                    } else {
                        let call_id = calls[position].id.clone();
                        let cache = Arc::clone(&self.cache);
                        futures.push(
                            async move {
                                let kind = handler.kind();
                                let resource = resource_path(&args);
                                let outcome = handler.run(args).await;
                                if outcome.is_ok() {
                                    match kind {
                                        ToolKind::Write => {
                                            if let Some(resource) = resource {
                                                cache.invalidate(&resource);
                                            }
                                        }
                                        ToolKind::Volatile => cache.clear(),
                                        _ => {}
                                    }
                                }
                                vec![(position, into_result(call_id, outcome))]
                            }
                            .boxed(),
                        );
                    }
                }
            }
        }

        for (name, group) in read_groups {
            let handler = Arc::clone(
                &self
                    .registry
                    .get(&name)
                    .expect("read group built from registered tools")
                    .handler,
            );
            let cache = Arc::clone(&self.cache);
            let call_ids: Vec<(usize, String)> = group
                .iter()
                .map(|(position, _)| (*position, calls[*position].id.clone()))
                .collect();
            let requests: Vec<Map<String, Value>> =
                group.into_iter().map(|(_, args)| args).collect();

            futures.push(
                async move {
                    if requests.len() > 1 {
                        debug!(tool = %name, count = requests.len(), "coalescing read calls");
                    }
                    let outcomes = cache
                        .batch_reads(&name, requests, resource_path, move |misses| async move {
                            handler.run_batch(misses).await
                        })
                        .await;
                    call_ids
                        .into_iter()
                        .zip(outcomes)
                        .map(|((position, call_id), outcome)| {
                            (position, into_result(call_id, outcome))
                        })
                        .collect()
                }
                .boxed(),
            );
        }

        for batch in join_all(futures).await {
            for (position, result) in batch {
                results[position] = Some(result);
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(position, slot)| {
                slot.unwrap_or_else(|| {
                    ToolResult::error(calls[position].id.clone(), "tool dispatch produced no result")
                })
            })
            .collect()
    }

    /// Resolves a call against the registry and validates its arguments.
    /// Any failure becomes an error result; no side effects have happened
    /// at this point.
    fn plan_call(&self, call: &ToolCall) -> CallPlan {
        let Some(registered) = self.registry.get(&call.name) else {
            return CallPlan::Rejected(ToolResult::error(
                call.id.clone(),
                format!("unknown tool: {}", call.name),
            ));
        };

        let Some(args) = call.parsed.clone() else {
            return CallPlan::Rejected(ToolResult::error(
                call.id.clone(),
                format!("invalid JSON arguments for {}: {}", call.name, call.arguments),
            ));
        };

        let instance = Value::Object(args.clone());
        if let Err(error) = registered.validator.validate(&instance) {
            return CallPlan::Rejected(ToolResult::error(
                call.id.clone(),
                format!("invalid arguments for {}: {error}", call.name),
            ));
        }

        CallPlan::Ready {
            handler: Arc::clone(&registered.handler),
            args,
        }
    }
}

fn into_result(call_id: String, outcome: Result<Value, String>) -> ToolResult {
    match outcome {
        Ok(payload) => ToolResult::success(call_id, payload),
        Err(description) => ToolResult::error(call_id, description),
    }
}
