//! Shared fixtures for the integration tests: on-disk nodes backed by
//! [`DirStore`], an in-memory connection between two sessions and a stream
//! wrapper that injects wire faults.

#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::NaiveDateTime;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use snapvault::auth::{AccessPolicy, Authenticator, RemoteAccess, SecretStore, SharedKey};
use snapvault::lineage::LineageTracker;
use snapvault::snapshot::{parse_timestamp, DirStore, SnapshotRef};
use snapvault::streaming::{
    Role, SessionContext, SessionOutcome, ShutdownSignal, TransferIntent, TransferSession,
};
use snapvault::Error;

pub const KEY: [u8; 32] = [7u8; 32];

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn ts(s: &str) -> NaiveDateTime {
    parse_timestamp(s).unwrap()
}

/// Deterministic, non-repeating payload so corruption is always visible.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// One peer: its store, lineage state and the remotes it knows.
pub struct Node {
    pub name: String,
    pub dir: TempDir,
    pub store: Arc<DirStore>,
    pub lineage: Arc<LineageTracker>,
    keys: Vec<(String, SharedKey)>,
    access: AccessPolicy,
}

impl Node {
    pub fn new(name: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let store = DirStore::new(
            name,
            dir.path().join("snapshots"),
            dir.path().join("backups"),
        );
        let lineage = LineageTracker::open(&dir.path().join("state")).unwrap();
        Self {
            name: name.to_string(),
            dir,
            store: Arc::new(store),
            lineage: Arc::new(lineage),
            keys: Vec::new(),
            access: AccessPolicy::default(),
        }
    }

    /// Share `key` with `remote`, granting it `access` here.
    pub fn knows(mut self, remote: &str, key: SharedKey, access: RemoteAccess) -> Self {
        self.keys.push((remote.to_string(), key));
        self.access.insert(remote, access);
        self
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.dir.path().join("snapshots")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    /// Write a capture of an own subvolume.
    pub async fn capture(&self, subvolume: &str, taken: &str, data: &[u8]) -> SnapshotRef {
        let snapshot = SnapshotRef::new(self.name.clone(), subvolume, ts(taken));
        self.store.write_snapshot(&snapshot, data).await.unwrap();
        snapshot
    }

    pub fn context(&self, shutdown: ShutdownSignal) -> SessionContext {
        let mut secrets = SecretStore::new(Duration::from_secs(30));
        for (remote, key) in &self.keys {
            secrets.insert(remote.clone(), key.clone());
        }
        SessionContext {
            node_name: self.name.clone(),
            store: self.store.clone(),
            lineage: Arc::clone(&self.lineage),
            authenticator: Authenticator::new(Arc::new(secrets), HANDSHAKE_TIMEOUT),
            access: Arc::new(self.access.clone()),
            idle_timeout: IDLE_TIMEOUT,
            shutdown,
        }
    }

    /// Names of staging files left in the backup directory.
    pub fn staging_files(&self) -> Vec<String> {
        let mut found = Vec::new();
        let Ok(hosts) = std::fs::read_dir(self.backup_dir()) else {
            return found;
        };
        for host in hosts.flatten() {
            let Ok(entries) = std::fs::read_dir(host.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".part") {
                    found.push(name);
                }
            }
        }
        found
    }
}

/// `alpha` pushing to and pulling from `backup01`, both sharing [`KEY`].
///
/// alpha lets backup01 pull `home`. backup01 accepts pushes of alpha's
/// `home` and `root` and lets alpha recover them.
pub fn pair() -> (Node, Node) {
    let alpha = Node::new("alpha").knows(
        "backup01",
        SharedKey::from_bytes(KEY),
        RemoteAccess::default().allow_pull("home"),
    );
    let backup01 = Node::new("backup01").knows(
        "alpha",
        SharedKey::from_bytes(KEY),
        RemoteAccess::default()
            .accept_push("home")
            .accept_push("root")
            .allow_recover(),
    );
    (alpha, backup01)
}

pub type SessionResult = Result<SessionOutcome, Error>;

/// Run one session between `initiator` and `responder` over an in-memory
/// pipe. `fault` wraps the initiator's end, `responder_fault` the other.
pub async fn run_pair_with(
    initiator: SessionContext,
    remote: &str,
    intent: TransferIntent,
    responder: SessionContext,
    fault: Option<Fault>,
    responder_fault: Option<Fault>,
) -> (SessionResult, SessionResult) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let a = FaultyStream::new(a, fault);
    let b = FaultyStream::new(b, responder_fault);

    let init = async move {
        // Dropping the session closes its end of the pipe.
        let mut session = TransferSession::new(initiator, a, Role::Initiator);
        session.initiate(remote, intent).await
    };
    let resp = async move {
        let mut session = TransferSession::new(responder, b, Role::Responder);
        session.respond().await
    };
    tokio::join!(init, resp)
}

pub async fn run_pair(
    initiator: &Node,
    remote: &str,
    intent: TransferIntent,
    responder: &Node,
) -> (SessionResult, SessionResult) {
    run_pair_with(
        initiator.context(ShutdownSignal::never()),
        remote,
        intent,
        responder.context(ShutdownSignal::never()),
        None,
        None,
    )
    .await
}

pub fn push(subvolume: &str) -> TransferIntent {
    TransferIntent::Push {
        subvolume: subvolume.to_string(),
        force_full: false,
    }
}

// =============================================================================
// Fault injection
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Writes fail with BrokenPipe once this many bytes went out.
    FailWritesAfter(usize),
    /// Reads never complete once this many bytes came in.
    StallReadsAfter(usize),
    /// Invert the byte written at this offset.
    FlipWrittenByte(u64),
}

pub struct FaultyStream<S> {
    inner: S,
    fault: Option<Fault>,
    written: u64,
    read: u64,
}

impl<S> FaultyStream<S> {
    pub fn new(inner: S, fault: Option<Fault>) -> Self {
        Self {
            inner,
            fault,
            written: 0,
            read: 0,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FaultyStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let limit = match this.fault {
            Some(Fault::StallReadsAfter(n)) => n as u64,
            _ => u64::MAX,
        };
        if this.read >= limit {
            // Never woken again: the peer looks alive but silent.
            return Poll::Pending;
        }

        let allowed = (limit - this.read).min(buf.remaining() as u64) as usize;
        let mut scratch = vec![0u8; allowed];
        let mut limited = ReadBuf::new(&mut scratch);
        match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                buf.put_slice(limited.filled());
                this.read += limited.filled().len() as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FaultyStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match this.fault {
            Some(Fault::FailWritesAfter(n)) => {
                let remaining = (n as u64).saturating_sub(this.written) as usize;
                if remaining == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "injected write failure",
                    )));
                }
                let chunk = &buf[..buf.len().min(remaining)];
                let res = Pin::new(&mut this.inner).poll_write(cx, chunk);
                if let Poll::Ready(Ok(n)) = &res {
                    this.written += *n as u64;
                }
                res
            }
            Some(Fault::FlipWrittenByte(at))
                if at >= this.written && at < this.written + buf.len() as u64 =>
            {
                let offset = (at - this.written) as usize;
                let mut copy = buf.to_vec();
                copy[offset] ^= 0xff;
                let res = Pin::new(&mut this.inner).poll_write(cx, &copy);
                if let Poll::Ready(Ok(n)) = &res {
                    this.written += *n as u64;
                    // Disarm only once the flipped byte actually went out.
                    if *n > offset {
                        this.fault = None;
                    }
                }
                res
            }
            _ => {
                let res = Pin::new(&mut this.inner).poll_write(cx, buf);
                if let Poll::Ready(Ok(n)) = &res {
                    this.written += *n as u64;
                }
                res
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
