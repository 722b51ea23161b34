//! Snapshot references and the external snapshot collaborator.
//!
//! A [`SnapshotRef`] names a read-only capture of one subvolume on its host of
//! origin. Creation, deletion and the on-disk format belong to the underlying
//! copy-on-write filesystem; this crate only orders the bytes it produces.

#[cfg(feature = "btrfs")]
pub mod btrfs;
pub mod dir;
pub mod store;

use std::cmp::Ordering;
use std::fmt;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[cfg(feature = "btrfs")]
pub use btrfs::BtrfsStore;
pub use dir::DirStore;
pub use store::{ExportStream, ImportSink, SnapshotStore};

/// Timestamp format used in snapshot names and on the wire.
pub const TIMESTAMP_FMT: &str = "%Y%m%d%H%M%S";

/// Parse a `YYYYMMDDHHMMSS` timestamp.
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FMT)
        .with_context(|| format!("Invalid snapshot timestamp: {}", s))
}

/// Format a timestamp as `YYYYMMDDHHMMSS`.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FMT).to_string()
}

/// Whether a name is usable as a host or subvolume identifier.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c == '/' || c == '\\' || c.is_control())
}

/// Full or incremental transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Full,
    Incremental,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Full => "full",
            TransferMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subvolume on its host of origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Volume {
    pub host: String,
    pub subvolume: String,
}

impl Volume {
    pub fn new(host: impl Into<String>, subvolume: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            subvolume: subvolume.into(),
        }
    }

    /// Parse `host/subvolume`.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, subvolume) = s
            .split_once('/')
            .with_context(|| format!("Volume must be written as host/subvolume: {}", s))?;
        if !is_valid_name(host) || !is_valid_name(subvolume) {
            anyhow::bail!("Invalid volume name: {}", s);
        }
        Ok(Self::new(host, subvolume))
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.subvolume)
    }
}

/// A point-in-time capture. Immutable once created.
///
/// `parent` is `None` for a full capture and holds the timestamp of the
/// ancestor (same volume) for an incremental one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotRef {
    host: String,
    subvolume: String,
    taken: NaiveDateTime,
    parent: Option<NaiveDateTime>,
}

impl SnapshotRef {
    /// A full capture.
    pub fn new(host: impl Into<String>, subvolume: impl Into<String>, taken: NaiveDateTime) -> Self {
        Self {
            host: host.into(),
            subvolume: subvolume.into(),
            taken,
            parent: None,
        }
    }

    /// Parse a snapshot name (`<subvol>_<timestamp>`) captured on `host`.
    pub fn from_name(host: &str, name: &str) -> Result<Self> {
        let (subvolume, ts) = name
            .rsplit_once('_')
            .with_context(|| format!("Snapshot name lacks a timestamp: {}", name))?;
        if !is_valid_name(subvolume) {
            anyhow::bail!("Invalid subvolume in snapshot name: {}", name);
        }
        Ok(Self::new(host, subvolume, parse_timestamp(ts)?))
    }

    /// Same capture, labelled as incremental relative to `parent`.
    pub fn with_parent(mut self, parent: &SnapshotRef) -> Self {
        self.parent = Some(parent.taken);
        self
    }

    /// Same capture, labelled as a standalone full capture.
    pub fn without_parent(mut self) -> Self {
        self.parent = None;
        self
    }

    pub(crate) fn with_parent_taken(mut self, parent: Option<NaiveDateTime>) -> Self {
        self.parent = parent;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn subvolume(&self) -> &str {
        &self.subvolume
    }

    pub fn taken(&self) -> NaiveDateTime {
        self.taken
    }

    pub fn parent_taken(&self) -> Option<NaiveDateTime> {
        self.parent
    }

    /// The parent capture, if this reference is incremental.
    pub fn parent(&self) -> Option<SnapshotRef> {
        self.parent
            .map(|taken| SnapshotRef::new(self.host.clone(), self.subvolume.clone(), taken))
    }

    pub fn mode(&self) -> TransferMode {
        if self.parent.is_some() {
            TransferMode::Incremental
        } else {
            TransferMode::Full
        }
    }

    pub fn volume(&self) -> Volume {
        Volume::new(self.host.clone(), self.subvolume.clone())
    }

    /// `<subvol>_<timestamp>`
    pub fn name(&self) -> String {
        format!("{}_{}", self.subvolume, format_timestamp(&self.taken))
    }

    /// Identity ignoring the parent label.
    pub fn same_capture(&self, other: &SnapshotRef) -> bool {
        self.host == other.host && self.subvolume == other.subvolume && self.taken == other.taken
    }

    /// Whether `self` can serve as incremental parent of `candidate`:
    /// same volume and strictly older.
    pub fn is_ancestor_of(&self, candidate: &SnapshotRef) -> bool {
        self.host == candidate.host
            && self.subvolume == candidate.subvolume
            && self.taken < candidate.taken
    }

    /// Chronological order within one volume.
    pub fn cmp_taken(&self, other: &SnapshotRef) -> Ordering {
        self.taken.cmp(&other.taken)
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        parse_timestamp(s).unwrap()
    }

    #[test]
    fn test_snapshot_name_roundtrip() {
        let snap = SnapshotRef::new("alpha", "home", ts("20240101000000"));
        assert_eq!(snap.name(), "home_20240101000000");
        assert_eq!(SnapshotRef::from_name("alpha", &snap.name()).unwrap(), snap);
    }

    #[test]
    fn test_subvolume_with_underscore() {
        let snap = SnapshotRef::from_name("alpha", "var_log_20240101000000").unwrap();
        assert_eq!(snap.subvolume(), "var_log");
        assert_eq!(snap.taken(), ts("20240101000000"));
    }

    #[test]
    fn test_invalid_names() {
        assert!(SnapshotRef::from_name("alpha", "home").is_err());
        assert!(SnapshotRef::from_name("alpha", "home_2024").is_err());
        assert!(SnapshotRef::from_name("alpha", "_20240101000000").is_err());
        assert!(!is_valid_name("a b"));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name(".."));
        assert!(is_valid_name("backup01"));
    }

    #[test]
    fn test_ancestry() {
        let old = SnapshotRef::new("alpha", "home", ts("20240101000000"));
        let new = SnapshotRef::new("alpha", "home", ts("20240102000000"));
        let other_host = SnapshotRef::new("beta", "home", ts("20231231000000"));
        let other_subvol = SnapshotRef::new("alpha", "root", ts("20231231000000"));

        assert!(old.is_ancestor_of(&new));
        assert!(!new.is_ancestor_of(&old));
        assert!(!old.is_ancestor_of(&old));
        assert!(!other_host.is_ancestor_of(&new));
        assert!(!other_subvol.is_ancestor_of(&new));
    }

    #[test]
    fn test_parent_label() {
        let old = SnapshotRef::new("alpha", "home", ts("20240101000000"));
        let new = SnapshotRef::new("alpha", "home", ts("20240102000000")).with_parent(&old);

        assert_eq!(new.mode(), TransferMode::Incremental);
        assert_eq!(new.parent(), Some(old.clone()));
        assert!(new.same_capture(&new.clone().without_parent()));
        assert_eq!(new.without_parent().mode(), TransferMode::Full);
    }

    #[test]
    fn test_volume_parse() {
        let v = Volume::parse("alpha/home").unwrap();
        assert_eq!(v, Volume::new("alpha", "home"));
        assert_eq!(v.to_string(), "alpha/home");
        assert!(Volume::parse("alpha").is_err());
        assert!(Volume::parse("alpha/").is_err());
    }
}
