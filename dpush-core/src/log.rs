//! Push log: one JSON line per push in `<dest>/push-log.jsonl`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOG_FILE: &str = "push-log.jsonl";

/// Record of one push attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushLogEntry {
    pub id: uuid::Uuid,
    pub timestamp: DateTime<Utc>,
    /// Directory or URL pushed to.
    pub destination: String,
    pub revisions: usize,
    pub objects: usize,
    pub refs: usize,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl PushLogEntry {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            destination: destination.into(),
            revisions: 0,
            objects: 0,
            refs: 0,
            duration_ms: 0,
            success: false,
            error: None,
        }
    }
}

/// Append-only push log of a destination.
pub struct PushLog {
    path: PathBuf,
}

impl PushLog {
    pub fn new(dest: &Path) -> Self {
        Self {
            path: dest.join(LOG_FILE),
        }
    }

    pub fn append(&self, entry: &PushLogEntry) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open push log {:?}", self.path))?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// All entries, oldest first. Unparseable lines are skipped.
    pub fn all(&self) -> Result<Vec<PushLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read push log {:?}", self.path))?;
        Ok(data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    pub fn latest(&self) -> Result<Option<PushLogEntry>> {
        Ok(self.all()?.into_iter().last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_push_log_append_and_read() {
        let tmp = TempDir::new().unwrap();
        let log = PushLog::new(tmp.path());
        assert!(log.all().unwrap().is_empty());
        assert!(log.latest().unwrap().is_none());

        let mut first = PushLogEntry::new("/srv/mirror");
        first.revisions = 3;
        first.success = true;
        log.append(&first).unwrap();

        let mut second = PushLogEntry::new("/srv/mirror");
        second.error = Some("peer rejected the push".to_string());
        log.append(&second).unwrap();

        let entries = log.all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], first);
        assert_eq!(log.latest().unwrap().unwrap().id, second.id);
    }

    #[test]
    fn test_push_log_skips_garbage() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(LOG_FILE), "not json\n\n").unwrap();
        let log = PushLog::new(tmp.path());
        log.append(&PushLogEntry::new("x")).unwrap();
        assert_eq!(log.all().unwrap().len(), 1);
    }
}
