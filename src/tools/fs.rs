//! Local filesystem tools.
//!
//! All handlers are rooted in a workspace directory. Reads may range
//! anywhere below it; writes refuse to leave it. Payload shapes follow the
//! `{"success": true, ...}` convention the model is prompted to expect.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ignore::WalkBuilder;
use serde_json::{json, Map, Value};

use super::{ToolHandler, ToolKind};

fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required argument '{key}'"))
}

/// Resolves a user-supplied path against the workspace root.
fn resolve(root: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    }
}

/// Collapses `.` and `..` components without touching the filesystem, so the
/// boundary check below cannot be bypassed with paths like `inside/../../out`.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(Component::ParentDir);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Write targets must stay inside the workspace.
pub(crate) fn resolve_for_write(root: &Path, path: &str) -> Result<PathBuf, String> {
    let resolved = resolve(root, path);
    let absolute = std::path::absolute(&resolved)
        .map_err(|error| format!("cannot resolve '{path}': {error}"))?;
    let root_absolute = std::path::absolute(root)
        .map_err(|error| format!("cannot resolve workspace root: {error}"))?;
    let absolute = normalize(&absolute);
    let root_absolute = normalize(&root_absolute);
    if absolute.starts_with(&root_absolute) {
        Ok(absolute)
    } else {
        Err(format!("cannot write outside the workspace: {path}"))
    }
}

pub struct ReadFile {
    root: PathBuf,
}

impl ReadFile {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    async fn read_one(&self, filename: &str) -> Result<Value, String> {
        let path = resolve(&self.root, filename);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(json!({ "success": true, "content": content })),
            Err(error) => Err(format!("cannot read '{filename}': {error}")),
        }
    }
}

#[async_trait]
impl ToolHandler for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the complete content of a file in the workspace"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filename": {
                    "type": "string",
                    "description": "Path of the file to read, relative to the workspace"
                }
            },
            "required": ["filename"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    async fn run(&self, args: Map<String, Value>) -> Result<Value, String> {
        let filename = required_str(&args, "filename")?;
        self.read_one(filename).await
    }

    /// Batch form: several coalesced reads answered in one pass.
    async fn run_batch(&self, requests: Vec<Map<String, Value>>) -> Vec<Result<Value, String>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let result = match required_str(&request, "filename") {
                Ok(filename) => self.read_one(filename).await,
                Err(error) => Err(error),
            };
            results.push(result);
        }
        results
    }
}

/// Model-facing multi-file read: one call, many files, per-file outcomes.
pub struct BatchReadFiles {
    root: PathBuf,
}

impl BatchReadFiles {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ToolHandler for BatchReadFiles {
    fn name(&self) -> &str {
        "batch_read_files"
    }

    fn description(&self) -> &str {
        "Read multiple files in one operation; returns per-file results"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filenames": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Paths of the files to read"
                }
            },
            "required": ["filenames"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    async fn run(&self, args: Map<String, Value>) -> Result<Value, String> {
        let filenames = args
            .get("filenames")
            .and_then(Value::as_array)
            .ok_or_else(|| "missing required argument 'filenames'".to_string())?;

        let mut results = Map::new();
        for filename in filenames {
            let Some(filename) = filename.as_str() else {
                continue;
            };
            let path = resolve(&self.root, filename);
            let outcome = match tokio::fs::read_to_string(&path).await {
                Ok(content) => json!({ "success": true, "content": content }),
                Err(error) => json!({ "error": format!("cannot read '{filename}': {error}") }),
            };
            results.insert(filename.to_string(), outcome);
        }
        Ok(json!({ "success": true, "results": results }))
    }
}

pub struct CreateFile {
    root: PathBuf,
}

impl CreateFile {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ToolHandler for CreateFile {
    fn name(&self) -> &str {
        "create_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file inside the workspace"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filename": {
                    "type": "string",
                    "description": "Path of the file to create, relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                }
            },
            "required": ["filename"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Write
    }

    async fn run(&self, args: Map<String, Value>) -> Result<Value, String> {
        let filename = required_str(&args, "filename")?;
        let content = args.get("content").and_then(Value::as_str).unwrap_or("");
        let path = resolve_for_write(&self.root, filename)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| format!("cannot create parent directories: {error}"))?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|error| format!("cannot write '{filename}': {error}"))?;
        Ok(json!({ "success": true, "message": format!("Created file '{filename}'") }))
    }
}

pub struct StrReplace {
    root: PathBuf,
}

impl StrReplace {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ToolHandler for StrReplace {
    fn name(&self) -> &str {
        "str_replace"
    }

    fn description(&self) -> &str {
        "Replace every occurrence of a string in a file"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filename": { "type": "string" },
                "old_str": { "type": "string", "description": "Exact text to replace" },
                "new_str": { "type": "string", "description": "Replacement text" }
            },
            "required": ["filename", "old_str", "new_str"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Write
    }

    async fn run(&self, args: Map<String, Value>) -> Result<Value, String> {
        let filename = required_str(&args, "filename")?;
        let old_str = required_str(&args, "old_str")?;
        let new_str = required_str(&args, "new_str")?;
        let path = resolve_for_write(&self.root, filename)?;

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|error| format!("cannot read '{filename}': {error}"))?;
        if !content.contains(old_str) {
            return Err(format!("string not found in '{filename}'"));
        }
        let replaced = content.replace(old_str, new_str);
        tokio::fs::write(&path, replaced)
            .await
            .map_err(|error| format!("cannot write '{filename}': {error}"))?;
        Ok(json!({ "success": true, "message": format!("Replaced string in '{filename}'") }))
    }
}

pub struct ListFiles {
    root: PathBuf,
}

impl ListFiles {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ToolHandler for ListFiles {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files under a directory recursively, honoring .gitignore"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "directory": {
                    "type": "string",
                    "description": "Directory to start from (default: workspace root)"
                }
            }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    async fn run(&self, args: Map<String, Value>) -> Result<Value, String> {
        let directory = args
            .get("directory")
            .and_then(Value::as_str)
            .unwrap_or(".");
        let base = resolve(&self.root, directory);
        if !base.is_dir() {
            return Err(format!("'{directory}' is not a directory"));
        }

        // The walker is synchronous; keep it off the async worker.
        let files = tokio::task::spawn_blocking(move || {
            let mut files: Vec<String> = WalkBuilder::new(&base)
                .hidden(false)
                // Honor .gitignore even when the workspace is not a git repo.
                .require_git(false)
                .filter_entry(|entry| entry.file_name() != ".git")
                .build()
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
                .filter_map(|entry| {
                    entry
                        .path()
                        .strip_prefix(&base)
                        .ok()
                        .map(|relative| relative.to_string_lossy().into_owned())
                })
                .collect();
            files.sort();
            files
        })
        .await
        .map_err(|error| format!("listing task failed: {error}"))?;

        Ok(json!({ "success": true, "files": files }))
    }
}
