//! Restricted shell tool.
//!
//! Only an allowlisted set of file-manipulation commands is implemented,
//! each natively, so nothing is ever handed to a real shell. Paths are
//! confined to the workspace. Because a command can touch paths the engine
//! cannot predict, the tool is [`ToolKind::Volatile`] and a successful run
//! clears the read cache.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::fs::resolve_for_write;
use super::{ToolHandler, ToolKind};

const ALLOWED: &[&str] = &["cat", "echo", "touch", "mkdir", "rm", "ls", "pwd"];

pub struct ShellCommand {
    root: PathBuf,
}

impl ShellCommand {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        resolve_for_write(&self.root, path)
    }

    async fn cat(&self, args: &[String]) -> Result<Value, String> {
        if args.is_empty() {
            return Err("cat: missing file operand".to_string());
        }
        let mut results = Map::new();
        for filename in args {
            let outcome = match tokio::fs::read_to_string(self.resolve(filename)?).await {
                Ok(content) => json!({ "success": true, "content": content }),
                Err(error) => json!({ "error": format!("cat: {filename}: {error}") }),
            };
            results.insert(filename.clone(), outcome);
        }
        Ok(json!({ "success": true, "command": "cat", "results": results }))
    }

    async fn touch(&self, args: &[String]) -> Result<Value, String> {
        if args.is_empty() {
            return Err("touch: missing file operand".to_string());
        }
        for filename in args {
            let path = self.resolve(filename)?;
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                continue;
            }
            tokio::fs::write(&path, b"")
                .await
                .map_err(|error| format!("touch: {filename}: {error}"))?;
        }
        Ok(json!({ "success": true, "command": "touch" }))
    }

    async fn mkdir(&self, args: &[String]) -> Result<Value, String> {
        let create_parents = args.iter().any(|arg| arg == "-p");
        let paths: Vec<&String> = args.iter().filter(|arg| *arg != "-p").collect();
        if paths.is_empty() {
            return Err("mkdir: missing operand".to_string());
        }
        for dir in paths {
            let path = self.resolve(dir)?;
            let made = if create_parents {
                tokio::fs::create_dir_all(&path).await
            } else {
                tokio::fs::create_dir(&path).await
            };
            made.map_err(|error| format!("mkdir: {dir}: {error}"))?;
        }
        Ok(json!({ "success": true, "command": "mkdir" }))
    }

    async fn rm(&self, args: &[String]) -> Result<Value, String> {
        let recursive = args
            .iter()
            .any(|arg| matches!(arg.as_str(), "-r" | "-R" | "-rf" | "-fr"));
        let paths: Vec<&String> = args.iter().filter(|arg| !arg.starts_with('-')).collect();
        if paths.is_empty() {
            return Err("rm: missing operand".to_string());
        }
        for target in paths {
            let path = self.resolve(target)?;
            let metadata = tokio::fs::metadata(&path)
                .await
                .map_err(|error| format!("rm: {target}: {error}"))?;
            let removed = if metadata.is_dir() {
                if !recursive {
                    return Err(format!("rm: {target}: is a directory (use -r)"));
                }
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            removed.map_err(|error| format!("rm: {target}: {error}"))?;
        }
        Ok(json!({ "success": true, "command": "rm" }))
    }

    async fn ls(&self, args: &[String]) -> Result<Value, String> {
        let target = args.first().map_or(".", String::as_str);
        let path = self.resolve(target)?;
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|error| format!("ls: {target}: {error}"))?;
        let mut files = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
        files.sort();
        Ok(json!({ "success": true, "command": "ls", "files": files }))
    }
}

#[async_trait]
impl ToolHandler for ShellCommand {
    fn name(&self) -> &str {
        "shell_command"
    }

    fn description(&self) -> &str {
        "Run an allowlisted shell command (cat, echo, touch, mkdir, rm, ls, pwd) inside the workspace"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "enum": ALLOWED,
                    "description": "Command to run"
                },
                "args": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Command arguments"
                }
            },
            "required": ["command"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Volatile
    }

    async fn run(&self, args: Map<String, Value>) -> Result<Value, String> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| "missing required argument 'command'".to_string())?;
        let arguments: Vec<String> = args
            .get("args")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        match command {
            "cat" => self.cat(&arguments).await,
            "echo" => Ok(json!({
                "success": true,
                "command": "echo",
                "output": arguments.join(" ")
            })),
            "touch" => self.touch(&arguments).await,
            "mkdir" => self.mkdir(&arguments).await,
            "rm" => self.rm(&arguments).await,
            "ls" => self.ls(&arguments).await,
            "pwd" => Ok(json!({
                "success": true,
                "command": "pwd",
                "directory": self.root.to_string_lossy()
            })),
            other => Err(format!(
                "command '{other}' not allowed; available: {}",
                ALLOWED.join(", ")
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn call(command: &str, args: &[&str]) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("command".to_string(), Value::String(command.to_string()));
        map.insert(
            "args".to_string(),
            Value::Array(args.iter().map(|arg| Value::String((*arg).to_string())).collect()),
        );
        map
    }

    #[tokio::test]
    async fn disallowed_commands_are_rejected() {
        let dir = TempDir::new().unwrap();
        let handler = ShellCommand::new(dir.path().to_path_buf());
        let error = handler
            .run(call("curl", &["http://example.com"]))
            .await
            .unwrap_err();
        assert!(error.contains("not allowed"));
    }

    #[tokio::test]
    async fn mkdir_touch_ls_round_trip() {
        let dir = TempDir::new().unwrap();
        let handler = ShellCommand::new(dir.path().to_path_buf());

        handler
            .run(call("mkdir", &["-p", "sub/dir"]))
            .await
            .unwrap();
        handler
            .run(call("touch", &["sub/dir/a.txt"]))
            .await
            .unwrap();
        let listing = handler
            .run(call("ls", &["sub/dir"]))
            .await
            .unwrap();
        assert_eq!(listing["files"], json!(["a.txt"]));
    }

    #[tokio::test]
    async fn rm_requires_recursive_for_directories() {
        let dir = TempDir::new().unwrap();
        let handler = ShellCommand::new(dir.path().to_path_buf());
        handler
            .run(call("mkdir", &["sub"]))
            .await
            .unwrap();

        let error = handler
            .run(call("rm", &["sub"]))
            .await
            .unwrap_err();
        assert!(error.contains("use -r"));

        handler
            .run(call("rm", &["-r", "sub"]))
            .await
            .unwrap();
        assert!(!dir.path().join("sub").exists());
    }

    #[tokio::test]
    async fn ls_cannot_leave_the_workspace() {
        let dir = TempDir::new().unwrap();
        let handler = ShellCommand::new(dir.path().to_path_buf());
        let error = handler.run(call("ls", &["/"])).await.unwrap_err();
        assert!(error.contains("outside the workspace"));

        let error = handler.run(call("ls", &[".."])).await.unwrap_err();
        assert!(error.contains("outside the workspace"));
    }

    #[tokio::test]
    async fn paths_outside_workspace_are_refused() {
        let dir = TempDir::new().unwrap();
        let handler = ShellCommand::new(dir.path().to_path_buf());
        let error = handler
            .run(call("touch", &["../escape.txt"]))
            .await
            .unwrap_err();
        assert!(error.contains("outside the workspace"));
    }
}
