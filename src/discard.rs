//! Discard log for rejected inbound messages.
//!
//! Messages that fail validation or are duplicate deliveries never reach a
//! group. Each rejection is traced at `warn` level and, when a log path is
//! configured, appended to a JSONL file so operators can inspect or replay
//! it later.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Why a message was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// The message could not be decoded into a fragment.
    Invalid,
    /// The event id was already admitted for the group.
    Duplicate,
}

/// One line of the discard log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscardEntry {
    /// Why the message was rejected.
    pub reason: DiscardReason,
    /// Human-readable error message.
    pub error: String,
    /// Transport headers of the rejected message.
    pub headers: BTreeMap<String, String>,
    /// Raw payload of the rejected message.
    pub payload: String,
    /// Unix timestamp (seconds since epoch) of the rejection.
    pub ts: u64,
}

/// Append-only JSONL log of discarded messages.
///
/// Without a path the log only traces rejections and
/// [`read_all`](DiscardLog::read_all) returns nothing.
#[derive(Debug, Default)]
pub struct DiscardLog {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl DiscardLog {
    /// Log that traces only.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Log that appends to the JSONL file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_owned()),
            write_lock: Mutex::new(()),
        }
    }

    /// The configured file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record one rejected message.
    ///
    /// Creates the file and its parent directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if file I/O fails.
    pub fn append(
        &self,
        reason: DiscardReason,
        error: &str,
        headers: BTreeMap<String, String>,
        payload: String,
    ) -> io::Result<()> {
        tracing::warn!(?reason, %error, "message discarded");
        let Some(path) = &self.path else {
            return Ok(());
        };
        let ts = std::time::SystemTime::UNIX_EPOCH
            .elapsed()
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let entry = DiscardEntry {
            reason,
            error: error.to_owned(),
            headers,
            payload,
            ts,
        };
        let mut line = serde_json::to_string(&entry).map_err(io::Error::other)?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| io::Error::other("discard log lock poisoned"))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(line.as_bytes())
    }

    /// Read every entry written so far, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the file cannot be read or a line is not a
    /// valid entry.
    pub fn read_all(&self) -> io::Result<Vec<DiscardEntry>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut entries = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn headers() -> BTreeMap<String, String> {
        BTreeMap::from([("messageEventType".to_owned(), "MESSAGE_LOST".to_owned())])
    }

    #[test]
    fn append_creates_readable_jsonl() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let log = DiscardLog::new(tmp.path().join("nested").join("discards.jsonl"));

        log.append(
            DiscardReason::Invalid,
            "unknown message event type 'MESSAGE_LOST'",
            headers(),
            "{}".to_owned(),
        )
        .expect("append should succeed");
        log.append(DiscardReason::Duplicate, "dup", BTreeMap::new(), String::new())
            .expect("append should succeed");

        let entries = log.read_all().expect("read should succeed");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].reason, DiscardReason::Invalid);
        assert_eq!(entries[0].headers, headers());
        assert_eq!(entries[0].payload, "{}");
        assert!(entries[0].ts > 0);
        assert_eq!(entries[1].reason, DiscardReason::Duplicate);
    }

    #[test]
    fn reason_serializes_snake_case() {
        let json = serde_json::to_string(&DiscardReason::Duplicate).unwrap();
        assert_eq!(json, r#""duplicate""#);
    }

    #[test]
    fn disabled_log_accepts_and_reads_nothing() {
        let log = DiscardLog::disabled();
        log.append(DiscardReason::Invalid, "bad", headers(), "x".to_owned())
            .expect("append should succeed");
        assert!(log.path().is_none());
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn missing_file_reads_empty() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let log = DiscardLog::new(tmp.path().join("discards.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn corrupt_line_is_invalid_data() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join("discards.jsonl");
        std::fs::write(&path, "not json\n").unwrap();
        let err = DiscardLog::new(&path).read_all().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
