//! Append-only daemon journal
//!
//! One line per event: `[ISO-timestamp] [LEVEL] message`. This file is
//! part of the external contract, separate from tracing output.

use crate::error::{HermesError, Result};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub struct DaemonJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl DaemonJournal {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| HermesError::Storage(format!("create {}: {}", parent.display(), e)))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| HermesError::Storage(format!("open {}: {}", path.display(), e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, level: &str, message: &str) {
        let line = format!("[{}] [{}] {}\n", Utc::now().to_rfc3339(), level, message);
        let mut file = self.file.lock().expect("journal poisoned");
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!("Journal write failed: {}", e);
        }
    }

    pub fn info(&self, message: &str) {
        self.log("INFO", message);
    }

    pub fn warn(&self, message: &str) {
        self.log("WARN", message);
    }

    pub fn error(&self, message: &str) {
        self.log("ERROR", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_journal_appends_formatted_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("daemon.log");

        let journal = DaemonJournal::open(&path).unwrap();
        journal.info("daemon started");
        journal.warn("worker deferred");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[INFO] daemon started"));
        assert!(lines[1].contains("[WARN] worker deferred"));
        // Each line leads with a bracketed ISO timestamp
        assert!(lines[0].starts_with('['));
        assert!(lines[0].contains("T"));
    }

    #[test]
    fn test_journal_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.log");

        DaemonJournal::open(&path).unwrap().info("first");
        DaemonJournal::open(&path).unwrap().info("second");

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
