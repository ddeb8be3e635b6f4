//! Push log output for the dpush CLI.
//!
//! Human-readable wrappers around the core PushLog.

use anyhow::Result;
use dpush_core::log::{PushLog, PushLogEntry};
use std::io::Write;
use std::path::Path;

/// Format a push log entry for display.
pub fn format_entry(entry: &PushLogEntry) -> String {
    let date = entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC");
    let status = if entry.success { "OK" } else { "FAILED" };

    format!(
        "[{}] {} | {} revisions, {} objects, {} refs | {}ms | {}{}",
        date,
        entry.destination,
        entry.revisions,
        entry.objects,
        entry.refs,
        entry.duration_ms,
        status,
        entry
            .error
            .as_ref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default(),
    )
}

/// Print the push log of a destination.
pub fn print_push_log(dest: &Path, limit: Option<usize>, writer: &mut dyn Write) -> Result<()> {
    let mut entries = PushLog::new(dest).all()?;
    if let Some(limit) = limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }

    if entries.is_empty() {
        writeln!(writer, "No pushes recorded.")?;
        return Ok(());
    }

    writeln!(writer, "Push Log ({} entries):", entries.len())?;
    writeln!(writer, "{}", "-".repeat(80))?;
    for entry in &entries {
        writeln!(writer, "  {}", format_entry(entry))?;
    }
    writeln!(writer, "{}", "-".repeat(80))?;

    let total_revisions: usize = entries.iter().map(|e| e.revisions).sum();
    let total_objects: usize = entries.iter().map(|e| e.objects).sum();
    let successes = entries.iter().filter(|e| e.success).count();
    writeln!(
        writer,
        "Summary: {} pushes ({} successful), {} revisions, {} objects",
        entries.len(),
        successes,
        total_revisions,
        total_objects,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_entry_failed() {
        let mut entry = PushLogEntry::new("http://mirror/repo");
        entry.error = Some("non-fast-forward".to_string());
        let line = format_entry(&entry);
        assert!(line.contains("http://mirror/repo"));
        assert!(line.contains("FAILED (non-fast-forward)"));
    }

    #[test]
    fn test_print_push_log_limit() {
        let tmp = TempDir::new().unwrap();
        let log = PushLog::new(tmp.path());
        for n in 0..3 {
            let mut entry = PushLogEntry::new("dest");
            entry.revisions = n;
            entry.success = true;
            log.append(&entry).unwrap();
        }
        let mut out = Vec::new();
        print_push_log(tmp.path(), Some(2), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Push Log (2 entries)"));
        assert!(text.contains("Summary: 2 pushes (2 successful), 3 revisions"));
    }

    #[test]
    fn test_print_empty_log() {
        let tmp = TempDir::new().unwrap();
        let mut out = Vec::new();
        print_push_log(tmp.path(), None, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "No pushes recorded.\n");
    }
}
