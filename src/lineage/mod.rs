//! Lineage Tracker.
//!
//! Per (subvolume, remote) record of the capture most recently confirmed
//! delivered to that remote. Planning takes an exclusive per-key lease that
//! the resulting [`TransferPlan`] holds until it is committed or discarded,
//! so transfers for the same key are serialized while distinct keys proceed
//! in parallel.

pub mod record;
pub mod state;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as KeyLock, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::error::{Error, LineageError};
use crate::snapshot::{SnapshotRef, TransferMode};

pub use record::{AuditLog, Outcome, TransferRecord};
pub use state::{LineageFile, LineageMap};

/// Lineage key: a local subvolume and the remote it is delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LineageKey {
    pub subvolume: String,
    pub remote: String,
}

impl LineageKey {
    pub fn new(subvolume: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            subvolume: subvolume.into(),
            remote: remote.into(),
        }
    }
}

impl fmt::Display for LineageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.subvolume, self.remote)
    }
}

/// Decision for one transfer, holding the key's lease.
#[derive(Debug)]
pub struct TransferPlan {
    key: LineageKey,
    snapshot: SnapshotRef,
    prior: Option<SnapshotRef>,
    _lease: OwnedMutexGuard<()>,
}

impl TransferPlan {
    pub fn key(&self) -> &LineageKey {
        &self.key
    }

    /// The candidate, labelled with its parent when incremental.
    pub fn snapshot(&self) -> &SnapshotRef {
        &self.snapshot
    }

    pub fn mode(&self) -> TransferMode {
        self.snapshot.mode()
    }

    pub fn parent(&self) -> Option<SnapshotRef> {
        self.snapshot.parent()
    }

    /// Record in place when the plan was made.
    pub fn prior(&self) -> Option<&SnapshotRef> {
        self.prior.as_ref()
    }

    /// Send the candidate standalone instead, e.g. when the recorded parent
    /// is no longer held locally. The lease is kept.
    pub fn into_full(mut self) -> Self {
        debug!(key = %self.key, snapshot = %self.snapshot, "falling back to full transfer");
        self.snapshot = self.snapshot.without_parent();
        self
    }
}

pub struct LineageTracker {
    state_dir: PathBuf,
    file: LineageFile,
    records: Mutex<LineageMap>,
    leases: Mutex<HashMap<LineageKey, Arc<KeyLock<()>>>>,
    audit: AuditLog,
}

impl fmt::Debug for LineageTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineageTracker")
            .field("state_dir", &self.state_dir)
            .finish_non_exhaustive()
    }
}

impl LineageTracker {
    /// Lock `state_dir` for this process and load the records.
    pub fn open(state_dir: &Path) -> Result<Self, Error> {
        let (file, records) = LineageFile::open(state_dir)?;
        debug!(path = %file.path().display(), records = records.len(), "loaded lineage");
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            file,
            records: Mutex::new(records),
            leases: Mutex::new(HashMap::new()),
            audit: AuditLog::new(state_dir),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn records(&self) -> MutexGuard<'_, LineageMap> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn lease(&self, key: &LineageKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
            // Forget locks nobody holds or waits on.
            leases.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
            Arc::clone(leases.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Decide full or incremental for `candidate`, waiting for any other
    /// transfer on the same key to finish first.
    ///
    /// Incremental only when the recorded capture is an ancestor of the
    /// candidate. A candidate not newer than the record is
    /// [`LineageError::StaleSnapshot`] unless `force_full` is set.
    pub async fn plan_transfer(
        &self,
        subvolume: &str,
        remote: &str,
        candidate: &SnapshotRef,
        force_full: bool,
    ) -> Result<TransferPlan, Error> {
        let key = LineageKey::new(subvolume, remote);
        let lease = self.lease(&key).await;
        let prior = self.records().get(&key).cloned();

        let snapshot = match &prior {
            _ if force_full => candidate.clone().without_parent(),
            None => candidate.clone().without_parent(),
            Some(recorded) if candidate.cmp_taken(recorded).is_le() => {
                return Err(LineageError::StaleSnapshot {
                    candidate: candidate.clone().without_parent(),
                    recorded: recorded.clone(),
                }
                .into());
            }
            Some(recorded) if recorded.is_ancestor_of(candidate) => {
                candidate.clone().with_parent(recorded)
            }
            Some(_) => candidate.clone().without_parent(),
        };

        debug!(
            %key,
            snapshot = %snapshot,
            mode = %snapshot.mode(),
            "planned transfer"
        );
        Ok(TransferPlan {
            key,
            snapshot,
            prior,
            _lease: lease,
        })
    }

    /// Advance the record to the plan's snapshot after a confirmed delivery.
    ///
    /// The lineage file is rewritten before memory changes; if that fails the
    /// record stays where it was and the attempt is logged as failed.
    pub fn commit(
        &self,
        plan: TransferPlan,
        mut record: TransferRecord,
    ) -> Result<TransferRecord, Error> {
        let result = self.advance(&plan);
        match &result {
            Ok(()) => {
                let _ = record.finish(Outcome::Succeeded, None);
            }
            Err(e) => {
                let _ = record.finish(Outcome::Failed, Some(e.to_string()));
            }
        }
        self.audit_append(&record);
        drop(plan);

        result.map(|()| record)
    }

    fn advance(&self, plan: &TransferPlan) -> Result<(), Error> {
        let mut records = self.records();
        if records.get(&plan.key) != plan.prior.as_ref() {
            return Err(LineageError::Conflict {
                subvolume: plan.key.subvolume.clone(),
                remote: plan.key.remote.clone(),
            }
            .into());
        }

        let mut next = records.clone();
        next.insert(plan.key.clone(), plan.snapshot.clone().without_parent());
        self.file.save(&next)?;
        *records = next;

        info!(
            key = %plan.key,
            snapshot = %plan.snapshot,
            "lineage advanced"
        );
        Ok(())
    }

    /// Close a failed or aborted attempt. Lineage is left untouched.
    pub fn discard(
        &self,
        plan: TransferPlan,
        mut record: TransferRecord,
        outcome: Outcome,
        error: Option<String>,
    ) -> TransferRecord {
        let outcome = if outcome == Outcome::Succeeded || !outcome.is_terminal() {
            Outcome::Failed
        } else {
            outcome
        };
        let _ = record.finish(outcome, error);
        self.audit_append(&record);
        drop(plan);
        record
    }

    fn audit_append(&self, record: &TransferRecord) {
        if let Err(e) = self.audit.append(record) {
            warn!(id = %record.id, error = %e, "failed to append transfer record");
        }
    }

    /// Recorded capture for a key.
    pub fn record(&self, subvolume: &str, remote: &str) -> Option<SnapshotRef> {
        self.records()
            .get(&LineageKey::new(subvolume, remote))
            .cloned()
    }

    /// All records, sorted by key.
    pub fn entries(&self) -> Vec<(LineageKey, SnapshotRef)> {
        let mut entries: Vec<_> = self
            .records()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Forget the record for a key, so the next transfer is full.
    pub async fn reset(&self, subvolume: &str, remote: &str) -> Result<Option<SnapshotRef>, Error> {
        let key = LineageKey::new(subvolume, remote);
        let _lease = self.lease(&key).await;

        let mut records = self.records();
        if !records.contains_key(&key) {
            return Ok(None);
        }
        let mut next = records.clone();
        let removed = next.remove(&key);
        self.file.save(&next)?;
        *records = next;

        info!(%key, "lineage reset");
        Ok(removed)
    }

    pub fn recent_transfers(&self, limit: usize) -> Result<Vec<TransferRecord>, Error> {
        Ok(self.audit.recent(limit)?)
    }
}
