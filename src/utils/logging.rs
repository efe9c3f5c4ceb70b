//! Transcript logging to a user-chosen markdown file.
//!
//! Separate from diagnostic tracing: this records the conversation itself,
//! appending as the session runs, with pause/resume support.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;

pub struct TranscriptLog {
    file_path: Option<String>,
    is_active: bool,
}

impl TranscriptLog {
    /// Creates the logger; with a path, write access is probed immediately
    /// so a bad path fails at startup rather than mid-conversation.
    pub fn new(log_file: Option<String>) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(path) = &log_file {
            test_file_access(path)?;
        }
        Ok(TranscriptLog {
            is_active: log_file.is_some(),
            file_path: log_file,
        })
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn pause(&mut self) {
        self.is_active = false;
    }

    pub fn resume(&mut self) {
        if self.file_path.is_some() {
            self.is_active = true;
        }
    }

    pub fn log_user(&self, content: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.log_section("You", content)
    }

    pub fn log_assistant(&self, content: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.log_section("Assistant", content)
    }

    fn log_section(&self, speaker: &str, content: &str) -> Result<(), Box<dyn std::error::Error>> {
        if !self.is_active {
            return Ok(());
        }
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        self.write_to_log(&format!("## {speaker} ({timestamp})\n\n{content}"))
    }

    fn write_to_log(&self, content: &str) -> Result<(), Box<dyn std::error::Error>> {
        let Some(file_path) = self.file_path.as_ref() else {
            return Ok(());
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let mut writer = BufWriter::new(file);
        for line in content.lines() {
            writeln!(writer, "{line}")?;
        }
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn status(&self) -> String {
        match (&self.file_path, self.is_active) {
            (None, _) => "disabled".to_string(),
            (Some(path), active) => {
                let name = Path::new(path)
                    .file_name()
                    .unwrap_or_default()
                    .to_string_lossy();
                if active {
                    format!("active ({name})")
                } else {
                    format!("paused ({name})")
                }
            }
        }
    }
}

fn test_file_access(path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_are_appended_with_speaker_headers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chat.md");
        let log = TranscriptLog::new(Some(path.to_string_lossy().into_owned())).unwrap();

        log.log_user("hello").unwrap();
        log.log_assistant("hi there").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("## You ("));
        assert!(contents.contains("hello"));
        assert!(contents.contains("## Assistant ("));
        assert!(contents.contains("hi there"));
    }

    #[test]
    fn unwritable_path_fails_at_startup() {
        let result = TranscriptLog::new(Some("/nonexistent/dir/chat.md".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn paused_logger_drops_messages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chat.md");
        let mut log = TranscriptLog::new(Some(path.to_string_lossy().into_owned())).unwrap();

        log.pause();
        assert!(!log.is_active());
        log.log_user("dropped").unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().is_empty());

        log.resume();
        log.log_user("kept").unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("kept"));
    }

    #[test]
    fn disabled_logger_is_a_no_op() {
        let log = TranscriptLog::new(None).unwrap();
        assert!(!log.is_active());
        assert_eq!(log.status(), "disabled");
        log.log_user("ignored").unwrap();
    }
}
