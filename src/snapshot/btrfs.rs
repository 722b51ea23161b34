//! btrfs-backed snapshot store.
//!
//! Local captures are read-only subvolumes under `snapshot_dir`, exported with
//! `btrfs send` and restored with `btrfs receive`. Backups received from other
//! hosts are kept as raw send streams, so the backup host does not need the
//! sender's subvolumes to exist locally.

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{ready, Context as TaskContext, Poll};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Timelike, Utc};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::dir::{scan_snapshot_dir, BackupDir};
use super::store::{ExportStream, ImportSink, SnapshotStore};
use super::{SnapshotRef, Volume};

const PIPE_BUFFER_SIZE: usize = 512 * 1024;

type StatusFuture = Pin<Box<dyn Future<Output = io::Result<ExitStatus>> + Send>>;

/// stdout of a child process. End-of-stream is only reported once the child
/// exited successfully; a failing exporter surfaces as a read error.
pub(crate) struct ChildStream {
    stdout: ChildStdout,
    status: StatusFuture,
    program: &'static str,
    finished: bool,
}

impl ChildStream {
    pub(crate) fn spawn(mut cmd: Command, program: &'static str) -> Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", program))?;
        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("Failed to open {} stdout", program))?;

        Ok(Self {
            stdout,
            status: Box::pin(async move { child.wait().await }),
            program,
            finished: false,
        })
    }
}

impl AsyncRead for ChildStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 || self.finished {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut self.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }

        // EOF on stdout: the stream is only complete if the exporter agrees.
        let status = ready!(self.status.as_mut().poll(cx))?;
        if status.success() {
            self.finished = true;
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} exited with {}", self.program, status),
            )))
        }
    }
}

/// Arguments for `btrfs send`.
fn send_args(snapshot: &Path, parent: Option<&Path>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["send".into()];
    if let Some(parent) = parent {
        args.push("-p".into());
        args.push(parent.into());
    }
    args.push(snapshot.into());
    args
}

async fn run_btrfs(args: &[&OsStr]) -> Result<()> {
    let output = Command::new("btrfs")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to run btrfs")?;

    if !output.status.success() {
        anyhow::bail!(
            "btrfs {:?} failed ({}): {}",
            args,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Pipes a recovered stream into `btrfs receive`.
struct ReceiveSink {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    target: PathBuf,
}

#[async_trait]
impl ImportSink for ReceiveSink {
    fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        &mut self.stdin
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let ReceiveSink {
            mut child,
            mut stdin,
            target,
        } = *self;

        stdin.flush().await?;
        stdin.shutdown().await?;
        drop(stdin);

        let status = child.wait().await.context("Failed to wait for btrfs receive")?;
        if !status.success() {
            anyhow::bail!("btrfs receive of {} exited with {}", target.display(), status);
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let ReceiveSink {
            mut child, target, ..
        } = *self;

        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill btrfs receive");
        }
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            let args = [OsStr::new("subvolume"), OsStr::new("delete"), target.as_os_str()];
            if let Err(e) = run_btrfs(&args).await {
                warn!(path = %target.display(), error = %e, "failed to delete partial subvolume");
            }
        }
    }
}

/// Store backed by btrfs subvolumes.
#[derive(Debug, Clone)]
pub struct BtrfsStore {
    host: String,
    /// Mount point holding the live subvolumes.
    mountpoint: PathBuf,
    snapshot_dir: PathBuf,
    backups: BackupDir,
}

impl BtrfsStore {
    pub fn new(
        host: impl Into<String>,
        mountpoint: PathBuf,
        snapshot_dir: PathBuf,
        backup_dir: PathBuf,
    ) -> Self {
        Self {
            host: host.into(),
            mountpoint,
            snapshot_dir,
            backups: BackupDir::new(backup_dir),
        }
    }

    fn snapshot_path(&self, snapshot: &SnapshotRef) -> PathBuf {
        self.snapshot_dir.join(snapshot.name())
    }
}

#[async_trait]
impl SnapshotStore for BtrfsStore {
    async fn list_snapshots(&self, subvolume: &str) -> Result<Vec<SnapshotRef>> {
        scan_snapshot_dir(&self.snapshot_dir, &self.host, subvolume).await
    }

    async fn capture(&self, subvolume: &str) -> Result<SnapshotRef> {
        let now = Utc::now().naive_utc();
        let taken = now.with_nanosecond(0).unwrap_or(now);
        let snapshot = SnapshotRef::new(self.host.clone(), subvolume, taken);

        let src = self.mountpoint.join(subvolume);
        let dst = self.snapshot_path(&snapshot);
        if tokio::fs::try_exists(&dst).await.unwrap_or(false) {
            anyhow::bail!("Snapshot {} already exists", snapshot);
        }

        run_btrfs(&[
            OsStr::new("subvolume"),
            OsStr::new("snapshot"),
            OsStr::new("-r"),
            src.as_os_str(),
            dst.as_os_str(),
        ])
        .await?;
        debug!(snapshot = %snapshot, "captured snapshot");
        Ok(snapshot)
    }

    async fn export(
        &self,
        snapshot: &SnapshotRef,
        parent: Option<&SnapshotRef>,
    ) -> Result<ExportStream> {
        let parent_path = parent.map(|p| self.snapshot_path(p));
        let mut cmd = Command::new("btrfs");
        cmd.args(send_args(&self.snapshot_path(snapshot), parent_path.as_deref()));
        let stream = ChildStream::spawn(cmd, "btrfs send")?;
        Ok(Box::new(tokio::io::BufReader::with_capacity(
            PIPE_BUFFER_SIZE,
            stream,
        )))
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
        let target = self.snapshot_path(snapshot);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            anyhow::bail!("Snapshot {} already exists locally", snapshot);
        }
        if let Some(parent) = snapshot.parent() {
            if !tokio::fs::try_exists(self.snapshot_path(&parent)).await.unwrap_or(false) {
                anyhow::bail!("Restore {} before {}", parent, snapshot);
            }
        }

        let mut child = Command::new("btrfs")
            .arg("receive")
            .arg(&self.snapshot_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn btrfs receive")?;
        let stdin = child
            .stdin
            .take()
            .context("Failed to open btrfs receive stdin")?;

        Ok(Box::new(ReceiveSink {
            child,
            stdin: BufWriter::with_capacity(PIPE_BUFFER_SIZE, stdin),
            target,
        }))
    }
}
