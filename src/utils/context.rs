//! Project context from a `.parley/` directory.
//!
//! Markdown files found there are appended to the system prompt so a
//! repository can describe itself to the model.

use std::path::Path;

use tracing::debug;

const CONTEXT_DIR: &str = ".parley";

/// Collects `.md` files under `<root>/.parley/`, sorted by file name, into
/// one context block. Returns `None` when the directory is absent or holds
/// no readable markdown.
pub fn load_project_context(root: &Path) -> Option<String> {
    let dir = root.join(CONTEXT_DIR);
    let entries = std::fs::read_dir(&dir).ok()?;

    let mut files: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "md"))
        .collect();
    files.sort();

    let mut sections = Vec::new();
    for path in files {
        match std::fs::read_to_string(&path) {
            Ok(contents) if !contents.trim().is_empty() => {
                sections.push(contents.trim().to_string());
            }
            Ok(_) => {}
            Err(error) => {
                debug!(path = %path.display(), %error, "skipping unreadable context file");
            }
        }
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_directory_yields_none() {
        let dir = TempDir::new().unwrap();
        assert!(load_project_context(dir.path()).is_none());
    }

    #[test]
    fn markdown_files_are_concatenated_in_name_order() {
        let dir = TempDir::new().unwrap();
        let context_dir = dir.path().join(CONTEXT_DIR);
        std::fs::create_dir(&context_dir).unwrap();
        std::fs::write(context_dir.join("02-style.md"), "Use tabs.").unwrap();
        std::fs::write(context_dir.join("01-about.md"), "A web service.").unwrap();
        std::fs::write(context_dir.join("notes.txt"), "not markdown").unwrap();

        let context = load_project_context(dir.path()).unwrap();
        assert_eq!(context, "A web service.\n\nUse tabs.");
    }

    #[test]
    fn empty_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        let context_dir = dir.path().join(CONTEXT_DIR);
        std::fs::create_dir(&context_dir).unwrap();
        std::fs::write(context_dir.join("empty.md"), "  \n").unwrap();
        assert!(load_project_context(dir.path()).is_none());
    }
}
