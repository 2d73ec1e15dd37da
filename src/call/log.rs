//! Best-effort JSONL call log.
//!
//! One line per terminated call, appended under the platform data
//! directory. Append failures surface as warnings only: losing a log line
//! must never take the phone down.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};

use super::HistoryEntry;

pub struct CallLog {
    path: PathBuf,
}

impl CallLog {
    pub fn new(path: PathBuf) -> Self {
        CallLog { path }
    }

    /// Appends one entry as a JSON line.
    pub fn append(&self, entry: &HistoryEntry) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).context("Failed to create data directory")?;
        }
        let line = serde_json::to_string(entry).context("Failed to serialize call log entry")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open call log {}", self.path.display()))?;
        writeln!(file, "{line}").context("Failed to append call log entry")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{Call, CallId, CallOutcome};

    #[test]
    fn test_appends_one_json_line_per_entry() {
        let path = std::env::temp_dir().join(format!("calls-{}.jsonl", uuid::Uuid::new_v4()));
        let log = CallLog::new(path.clone());

        let completed = HistoryEntry::from_call(
            &Call::outbound("0501234567"),
            CallOutcome::Completed,
        );
        let missed = HistoryEntry::from_call(
            &Call::inbound(CallId::new(), "200", Some("North Station".to_string())),
            CallOutcome::Missed,
        );
        log.append(&completed).unwrap();
        log.append(&missed).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["remote"], "0501234567");
        assert_eq!(first["outcome"], "completed");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["display_name"], "North Station");
        assert_eq!(second["outcome"], "missed");

        fs::remove_file(&path).unwrap();
    }
}
