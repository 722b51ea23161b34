//! The snapshot collaborator seam.
//!
//! Transfer sessions only see opaque byte streams: an export stream on the
//! source and an import sink on the destination. Both adapters
//! ([`DirStore`](super::DirStore), [`BtrfsStore`](super::BtrfsStore)) stage
//! received data in a `.part` file and only promote it on `commit`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{SnapshotRef, Volume};

/// Ordered snapshot bytes with a defined end-of-stream.
pub type ExportStream = Box<dyn AsyncRead + Send + Unpin>;

/// Destination of an inbound stream. Nothing is visible to readers of the
/// store until `commit` succeeds.
#[async_trait]
pub trait ImportSink: Send {
    /// Writer for the decrypted payload, in order.
    fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin);

    /// Flush and atomically promote the staged data.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard any staged data. Never fails; cleanup errors are logged.
    async fn abort(self: Box<Self>);
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Local captures of an owned subvolume, oldest first.
    async fn list_snapshots(&self, subvolume: &str) -> Result<Vec<SnapshotRef>>;

    /// Most recent local capture of an owned subvolume.
    async fn latest_snapshot(&self, subvolume: &str) -> Result<Option<SnapshotRef>> {
        Ok(self.list_snapshots(subvolume).await?.into_iter().last())
    }

    /// Take a new read-only capture.
    async fn capture(&self, subvolume: &str) -> Result<SnapshotRef>;

    /// Stream a local capture, relative to `parent` when given.
    async fn export(
        &self,
        snapshot: &SnapshotRef,
        parent: Option<&SnapshotRef>,
    ) -> Result<ExportStream>;

    /// Whether a fully received backup of this capture exists.
    async fn has_backup(&self, snapshot: &SnapshotRef) -> Result<bool>;

    /// Received backups of one volume (or all volumes), oldest first.
    async fn list_backups(&self, volume: Option<&Volume>) -> Result<Vec<SnapshotRef>>;

    /// Stage an inbound backup. `snapshot` carries the parent label.
    async fn begin_import(&self, snapshot: &SnapshotRef) -> Result<Box<dyn ImportSink>>;

    /// Stream a stored backup back to its owner. The returned reference
    /// carries the parent label the backup was received with.
    async fn open_backup(&self, snapshot: &SnapshotRef) -> Result<(SnapshotRef, ExportStream)>;

    /// Sink that restores a recovered capture into local snapshots.
    async fn begin_restore(&self, snapshot: &SnapshotRef) -> Result<Box<dyn ImportSink>>;
}

/// `<path>.part`
pub(crate) fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_path() {
        let p = Path::new("/backups/alpha/home_20240101000000.full");
        assert_eq!(
            staging_path(p),
            PathBuf::from("/backups/alpha/home_20240101000000.full.part")
        );
    }
}
