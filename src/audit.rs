//! Key-event audit records.
//!
//! Every committed or previewed rotation and every grant change produces
//! one record. The log is append-only and can forward each record to
//! pluggable sinks (a file, a database, an external audit service).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ResourceId, UserId};

/// A sink that receives audit records.
pub trait AuditSink: Send {
    /// Append a record. Called once per key event.
    fn append(&mut self, record: AuditRecord);
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A rotation persisted its results.
    RotationCommitted {
        user_id: UserId,
        from_version: u64,
        to_version: u64,
        resources_processed: usize,
        resources_failed: usize,
    },
    /// A dry run reported what a rotation would do.
    RotationPreviewed {
        user_id: UserId,
        from_version: u64,
        to_version: u64,
        resources_processed: usize,
        resources_failed: usize,
    },
    AccessGranted {
        resource_id: ResourceId,
        grantee_user_id: UserId,
        granted_by: UserId,
    },
    AccessRevoked {
        resource_id: ResourceId,
        user_id: UserId,
    },
}

/// A permanent record of one key event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde(flatten)]
    pub event: AuditEvent,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn now(event: AuditEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Default)]
struct AuditLogInner {
    records: Vec<AuditRecord>,
    forward_sinks: Vec<Box<dyn AuditSink>>,
    forward_only: bool,
}

/// An append-only log of key events.
///
/// Thread-safe; clones share the same records and sinks. A log from
/// [`AuditLog::new`] keeps every record in memory for its whole life, so a
/// long-running server should use [`AuditLog::forward_only`] with a sink
/// instead.
#[derive(Clone, Default)]
pub struct AuditLog {
    inner: Arc<Mutex<AuditLogInner>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("AuditLog")
            .field("records", &inner.records)
            .field("forward_sinks", &inner.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that hands records to its sinks and keeps none in memory.
    pub fn forward_only() -> Self {
        Self {
            inner: Arc::new(Mutex::new(AuditLogInner {
                forward_only: true,
                ..AuditLogInner::default()
            })),
        }
    }

    /// Add a sink to receive a copy of every record.
    pub fn add_forward_sink(&self, sink: Box<dyn AuditSink>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forward_sinks
            .push(sink);
    }

    /// Append an event stamped with the current time and forward it.
    pub fn record(&self, event: AuditEvent) {
        let record = AuditRecord::now(event);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for sink in inner.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }
        if !inner.forward_only {
            inner.records.push(record);
        }
    }

    /// Number of records held in memory.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every record held in memory, oldest first. Always empty for
    /// a forward-only log.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit records as JSON lines (one per record) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    /// Open or create a file for append-only audit logging.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("audit record not serializable: {}", e);
                return;
            }
        };
        if let Err(e) = writeln!(self.file, "{line}").and_then(|()| self.file.flush()) {
            tracing::warn!("audit sink write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let log = AuditLog::new();
        log.add_forward_sink(Box::new(FileAuditSink::new(&path).unwrap()));
        log.record(AuditEvent::AccessRevoked {
            resource_id: "doc-1".into(),
            user_id: "bob".into(),
        });
        log.record(AuditEvent::AccessGranted {
            resource_id: "doc-1".into(),
            grantee_user_id: "carol".into(),
            granted_by: "alice".into(),
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(
            first.event,
            AuditEvent::AccessRevoked {
                resource_id: "doc-1".into(),
                user_id: "bob".into(),
            }
        );
        assert!(lines[1].contains(r#""event":"access_granted""#));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_forward_only_log_keeps_nothing_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let log = AuditLog::forward_only();
        log.add_forward_sink(Box::new(FileAuditSink::new(&path).unwrap()));
        for user_id in ["bob", "carol", "dave"] {
            log.record(AuditEvent::AccessRevoked {
                resource_id: "doc-1".into(),
                user_id: user_id.into(),
            });
        }

        assert!(log.is_empty());
        assert!(log.records().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);
    }
}
