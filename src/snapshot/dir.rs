//! Directory-backed snapshot store.
//!
//! Captures are files holding an export stream produced by an external tool
//! (for example `btrfs send -f`). Received backups are stored per origin host:
//!
//! ```text
//! <backup_dir>/<host>/<subvol>_<ts>.full
//! <backup_dir>/<host>/<subvol>_<ts>.incr-<parent ts>
//! ```
//!
//! The suffix records the parent label so recovery can replay the chain.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use super::store::{staging_path, ExportStream, ImportSink, SnapshotStore};
use super::{format_timestamp, parse_timestamp, SnapshotRef, Volume};

/// Buffer size for staged writes.
const WRITE_BUFFER_SIZE: usize = 512 * 1024;

/// List captures named `<subvol>_<ts>` in `dir`, oldest first.
pub(crate) async fn scan_snapshot_dir(
    dir: &Path,
    host: &str,
    subvolume: &str,
) -> Result<Vec<SnapshotRef>> {
    let mut found = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", dir.display()))
        }
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with(".part") {
            continue;
        }
        match SnapshotRef::from_name(host, name) {
            Ok(snap) if snap.subvolume() == subvolume => found.push(snap),
            Ok(_) => {}
            Err(e) => debug!(name, error = %e, "ignoring foreign entry in snapshot directory"),
        }
    }

    found.sort_by(|a, b| a.cmp_taken(b));
    Ok(found)
}

/// Storage for backups received from other hosts.
#[derive(Debug, Clone)]
pub(crate) struct BackupDir {
    root: PathBuf,
}

impl BackupDir {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn host_dir(&self, host: &str) -> PathBuf {
        self.root.join(host)
    }

    /// Final location of a backup, derived from its parent label.
    pub(crate) fn path_for(&self, snapshot: &SnapshotRef) -> PathBuf {
        let suffix = match snapshot.parent_taken() {
            Some(parent) => format!("incr-{}", format_timestamp(&parent)),
            None => "full".to_string(),
        };
        self.host_dir(snapshot.host())
            .join(format!("{}.{}", snapshot.name(), suffix))
    }

    /// Parse `<subvol>_<ts>.full` / `<subvol>_<ts>.incr-<ts>`.
    fn parse_entry(host: &str, file_name: &str) -> Result<SnapshotRef> {
        let (name, suffix) = file_name
            .rsplit_once('.')
            .with_context(|| format!("Backup name lacks a lineage suffix: {}", file_name))?;
        let snap = SnapshotRef::from_name(host, name)?;
        match suffix {
            "full" => Ok(snap),
            s => {
                let parent = s
                    .strip_prefix("incr-")
                    .with_context(|| format!("Unknown backup suffix: {}", file_name))?;
                Ok(snap.with_parent_taken(Some(parse_timestamp(parent)?)))
            }
        }
    }

    /// Locate the stored file for a capture regardless of its parent label.
    pub(crate) async fn find(&self, snapshot: &SnapshotRef) -> Result<Option<(SnapshotRef, PathBuf)>> {
        let dir = self.host_dir(snapshot.host());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", dir.display()))
            }
        };
        let prefix = format!("{}.", snapshot.name());

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&prefix) || name.ends_with(".part") {
                continue;
            }
            if let Ok(found) = Self::parse_entry(snapshot.host(), name) {
                return Ok(Some((found, entry.path())));
            }
        }
        Ok(None)
    }

    pub(crate) async fn list(&self, volume: Option<&Volume>) -> Result<Vec<SnapshotRef>> {
        let mut hosts = Vec::new();
        match volume {
            Some(v) => hosts.push(v.host.clone()),
            None => {
                let mut entries = match fs::read_dir(&self.root).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("Failed to read {}", self.root.display()))
                    }
                };
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        if let Some(name) = entry.file_name().to_str() {
                            hosts.push(name.to_string());
                        }
                    }
                }
            }
        }

        let mut found = Vec::new();
        for host in hosts {
            let dir = self.host_dir(&host);
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {}", dir.display()))
                }
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.ends_with(".part") {
                    continue;
                }
                match Self::parse_entry(&host, name) {
                    Ok(snap) => {
                        if volume.map_or(true, |v| v.subvolume == snap.subvolume()) {
                            found.push(snap);
                        }
                    }
                    Err(e) => debug!(name, error = %e, "ignoring foreign entry in backup directory"),
                }
            }
        }

        found.sort_by(|a, b| {
            (a.host(), a.subvolume(), a.taken()).cmp(&(b.host(), b.subvolume(), b.taken()))
        });
        Ok(found)
    }

    pub(crate) async fn begin_import(&self, snapshot: &SnapshotRef) -> Result<Box<dyn ImportSink>> {
        if let Some((existing, _)) = self.find(snapshot).await? {
            anyhow::bail!("Backup {} already exists", existing);
        }
        let dir = self.host_dir(snapshot.host());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let sink = FileSink::create(self.path_for(snapshot)).await?;
        Ok(Box::new(sink))
    }

    pub(crate) async fn open(&self, snapshot: &SnapshotRef) -> Result<(SnapshotRef, ExportStream)> {
        let (found, path) = self
            .find(snapshot)
            .await?
            .with_context(|| format!("No backup of {} on {}", snapshot, snapshot.host()))?;
        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok((found, Box::new(file)))
    }
}

/// Writes to `<final>.part` and renames on commit. Refuses to replace an
/// existing final file.
pub(crate) struct FileSink {
    staging: PathBuf,
    target: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    pub(crate) async fn create(target: PathBuf) -> Result<Self> {
        let staging = staging_path(&target);
        // A leftover .part from an interrupted attempt is overwritten.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&staging)
            .await
            .with_context(|| format!("Failed to create {}", staging.display()))?;

        Ok(Self {
            staging,
            target,
            writer: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
        })
    }
}

#[async_trait]
impl ImportSink for FileSink {
    fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        &mut self.writer
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await?;

        if fs::try_exists(&self.target).await.unwrap_or(false) {
            anyhow::bail!("{} already exists", self.target.display());
        }

        fs::rename(&self.staging, &self.target)
            .await
            .with_context(|| format!("Failed to promote {}", self.staging.display()))?;
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        drop(self);
    }
}

impl Drop for FileSink {
    // Uncommitted data never outlives the sink.
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.staging) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.staging.display(), error = %e, "failed to remove staging file");
            }
        }
    }
}

/// Plain-directory store.
#[derive(Debug, Clone)]
pub struct DirStore {
    host: String,
    snapshot_dir: PathBuf,
    backups: BackupDir,
}

impl DirStore {
    pub fn new(host: impl Into<String>, snapshot_dir: PathBuf, backup_dir: PathBuf) -> Self {
        Self {
            host: host.into(),
            snapshot_dir,
            backups: BackupDir::new(backup_dir),
        }
    }

    fn snapshot_path(&self, snapshot: &SnapshotRef) -> PathBuf {
        self.snapshot_dir.join(snapshot.name())
    }

    /// Record an already serialized capture.
    pub async fn write_snapshot(&self, snapshot: &SnapshotRef, data: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.snapshot_dir).await?;
        fs::write(self.snapshot_path(snapshot), data)
            .await
            .with_context(|| format!("Failed to write snapshot {}", snapshot))
    }

    /// Path of a stored backup, if present.
    pub async fn backup_path(&self, snapshot: &SnapshotRef) -> Result<Option<PathBuf>> {
        Ok(self.backups.find(snapshot).await?.map(|(_, path)| path))
    }
}

#[async_trait]
impl SnapshotStore for DirStore {
    async fn list_snapshots(&self, subvolume: &str) -> Result<Vec<SnapshotRef>> {
        scan_snapshot_dir(&self.snapshot_dir, &self.host, subvolume).await
    }

    async fn capture(&self, subvolume: &str) -> Result<SnapshotRef> {
        anyhow::bail!(
            "Directory store cannot capture {}: write the export stream into {} instead",
            subvolume,
            self.snapshot_dir.display()
        )
    }

    async fn export(
        &self,
        snapshot: &SnapshotRef,
        parent: Option<&SnapshotRef>,
    ) -> Result<ExportStream> {
        if let Some(parent) = parent {
            if !fs::try_exists(self.snapshot_path(parent)).await.unwrap_or(false) {
                anyhow::bail!("Parent snapshot {} is no longer available", parent);
            }
        }
        let path = self.snapshot_path(snapshot);
        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open snapshot {}", path.display()))?;
        Ok(Box::new(file))
    }

    async fn has_backup(&self, snapshot: &SnapshotRef) -> Result<bool> {
        Ok(self.backups.find(snapshot).await?.is_some())
    }

    async fn list_backups(&self, volume: Option<&Volume>) -> Result<Vec<SnapshotRef>> {
        self.backups.list(volume).await
    }

    async fn begin_import(&self, snapshot: &SnapshotRef) -> Result<Box<dyn ImportSink>> {
        self.backups.begin_import(snapshot).await
    }

    async fn open_backup(&self, snapshot: &SnapshotRef) -> Result<(SnapshotRef, ExportStream)> {
        self.backups.open(snapshot).await
    }

    async fn begin_restore(&self, snapshot: &SnapshotRef) -> Result<Box<dyn ImportSink>> {
        fs::create_dir_all(&self.snapshot_dir).await?;
        let target = self.snapshot_path(snapshot);
        if fs::try_exists(&target).await.unwrap_or(false) {
            anyhow::bail!("Snapshot {} already exists locally", snapshot);
        }
        // Same contract as `btrfs receive`: the parent must be restored first.
        if let Some(parent) = snapshot.parent() {
            if !fs::try_exists(self.snapshot_path(&parent)).await.unwrap_or(false) {
                anyhow::bail!("Restore {} before {}", parent, snapshot);
            }
        }
        Ok(Box::new(FileSink::create(target).await?))
    }
}
