//! Transfer Records and the audit log.
//!
//! Every attempt that got as far as planning leaves exactly one line in
//! `transfers.jsonl`, whatever its outcome. Once the log reaches
//! [`AuditLog::MAX_BYTES`] it is moved to `transfers.jsonl.1`, replacing the
//! previous generation.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::state::private_file_options;
use crate::error::PersistenceError;
use crate::snapshot::{SnapshotRef, TransferMode};
use crate::streaming::channel::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed,
    Aborted,
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pending => "pending",
            Outcome::Succeeded => "succeeded",
            Outcome::Failed => "failed",
            Outcome::Aborted => "aborted",
        }
    }
}

/// One transfer attempt, as seen by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    /// Source snapshot, carrying the parent label when incremental.
    pub snapshot: SnapshotRef,
    pub remote: String,
    pub direction: Direction,
    pub mode: TransferMode,
    pub bytes: u64,
    outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl TransferRecord {
    /// A pending record for `snapshot` (already labelled with its parent).
    pub fn begin(snapshot: SnapshotRef, remote: impl Into<String>, direction: Direction) -> Self {
        let mut id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id);
        Self {
            id: hex::encode(id),
            mode: snapshot.mode(),
            snapshot,
            remote: remote.into(),
            direction,
            bytes: 0,
            outcome: Outcome::Pending,
            error: None,
            started: Utc::now(),
            finished: None,
        }
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Set the terminal outcome. Returns false, leaving the record untouched,
    /// if it already has one.
    #[must_use]
    pub(crate) fn finish(&mut self, outcome: Outcome, error: Option<String>) -> bool {
        if self.outcome.is_terminal() || !outcome.is_terminal() {
            return false;
        }
        self.outcome = outcome;
        self.error = error;
        self.finished = Some(Utc::now());
        true
    }
}

/// Append-only JSON-lines log of finished Transfer Records.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    rotated: PathBuf,
    max_bytes: u64,
}

impl AuditLog {
    pub const FILE_NAME: &'static str = "transfers.jsonl";

    /// Size at which the log is rotated.
    pub const MAX_BYTES: u64 = 4 * 1024 * 1024;

    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(Self::FILE_NAME),
            rotated: state_dir.join(format!("{}.1", Self::FILE_NAME)),
            max_bytes: Self::MAX_BYTES,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &TransferRecord) -> Result<(), PersistenceError> {
        let line = serde_json::to_string(record)
            .map_err(|e| PersistenceError::Serialize(e.to_string()))?;
        self.rotate_if_full()?;

        let mut file = private_file_options()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        writeln!(file, "{}", line).map_err(|e| PersistenceError::io(&self.path, e))?;
        file.sync_data()
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        Ok(())
    }

    fn rotate_if_full(&self) -> Result<(), PersistenceError> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() >= self.max_bytes => {
                fs::rename(&self.path, &self.rotated)
                    .map_err(|e| PersistenceError::io(&self.rotated, e))?;
                debug!(path = %self.rotated.display(), "rotated transfer log");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io(&self.path, e)),
        }
    }

    /// The most recent `limit` records, oldest first. Reads the previous
    /// generation only when the current one holds fewer.
    pub fn recent(&self, limit: usize) -> Result<Vec<TransferRecord>, PersistenceError> {
        let mut records = read_records(&self.path)?;
        if records.len() < limit {
            let mut older = read_records(&self.rotated)?;
            older.append(&mut records);
            records = older;
        }

        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }
}

fn read_records(path: &Path) -> Result<Vec<TransferRecord>, PersistenceError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(PersistenceError::io(path, e)),
    };

    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| PersistenceError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TransferRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(line = idx + 1, error = %e, "skipping unreadable audit entry"),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::parse_timestamp;
    use tempfile::TempDir;

    fn record() -> TransferRecord {
        let base = SnapshotRef::new("alpha", "home", parse_timestamp("20240101000000").unwrap());
        let snap = SnapshotRef::new("alpha", "home", parse_timestamp("20240102000000").unwrap())
            .with_parent(&base);
        TransferRecord::begin(snap, "backup01", Direction::Push)
    }

    #[test]
    fn test_terminal_outcome_set_once() {
        let mut rec = record();
        assert_eq!(rec.outcome(), Outcome::Pending);
        assert_eq!(rec.mode, TransferMode::Incremental);

        assert!(!rec.finish(Outcome::Pending, None));
        assert!(rec.finish(Outcome::Failed, Some("network".into())));
        assert!(!rec.finish(Outcome::Succeeded, None));
        assert_eq!(rec.outcome(), Outcome::Failed);
        assert_eq!(rec.error.as_deref(), Some("network"));
        assert!(rec.finished.is_some());
    }

    #[test]
    fn test_audit_log_keeps_most_recent() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path());
        assert!(log.recent(10).unwrap().is_empty());

        let mut ids = Vec::new();
        for _ in 0..5 {
            let mut rec = record();
            assert!(rec.finish(Outcome::Succeeded, None));
            ids.push(rec.id.clone());
            log.append(&rec).unwrap();
        }

        let recent = log.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, ids[3]);
        assert_eq!(recent[1].id, ids[4]);
        assert_eq!(recent[1].snapshot.parent_taken(), record().snapshot.parent_taken());
    }

    #[test]
    fn test_unreadable_entries_skipped() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path());
        let mut rec = record();
        assert!(rec.finish(Outcome::Aborted, None));
        log.append(&rec).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap()
            .write_all(b"{not json\n")
            .unwrap();

        let recent = log.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].outcome(), Outcome::Aborted);
    }

    #[test]
    fn test_full_log_is_rotated() {
        let tmp = TempDir::new().unwrap();
        let mut log = AuditLog::new(tmp.path());
        log.max_bytes = 1;

        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut rec = record();
            assert!(rec.finish(Outcome::Succeeded, None));
            ids.push(rec.id.clone());
            log.append(&rec).unwrap();
        }

        // Only the newest record is current; one older generation is kept.
        let current = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(current.lines().count(), 1);
        let ids_seen: Vec<_> = log.recent(10).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids_seen, ids[1..].to_vec());
        assert_eq!(log.recent(1).unwrap()[0].id, ids[2]);
    }

    #[cfg(unix)]
    #[test]
    fn test_audit_log_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path());
        let mut rec = record();
        assert!(rec.finish(Outcome::Failed, None));
        log.append(&rec).unwrap();

        let mode = std::fs::metadata(log.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
