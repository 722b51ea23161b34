//! Transfer Session state machine.
//!
//! ```text
//! Connected -> Authenticating -> Planning -> Streaming -> Verifying -> Completed
//!                    |               |           |            |
//!                    +---------------+-----------+------------+--> Failed | Aborted
//! ```
//!
//! One machine serves both ends of every direction. The [`Role`] says who
//! opened the connection; together with the requested [`Direction`] it
//! decides whether this end is the source (plans, exports, commits lineage)
//! or the destination (stages, verifies, acknowledges):
//!
//! | direction | initiator   | responder   |
//! |-----------|-------------|-------------|
//! | push      | source      | destination |
//! | pull      | destination | source      |
//! | recover   | restore     | backup server |

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::channel::{payload_channel, Direction, PayloadSummary};
use super::cipher::generate_stream_nonce;
use super::protocol::{
    read_frame, Abort, AbortCode, Complete, Label, LabelAck, MessageType, TransferRequest,
    UpToDate,
};
use super::receiver::{write_import, Receiver};
use super::sender::{read_export, Sender};
use super::{recv_frame, send_frame};
use crate::auth::{AccessPolicy, AuthenticatedPeer, Authenticator, SessionKeys};
use crate::error::{Error, LineageError, TransferError};
use crate::lineage::{LineageTracker, Outcome, TransferPlan, TransferRecord};
use crate::snapshot::{ExportStream, ImportSink, SnapshotRef, SnapshotStore, TransferMode, Volume};

/// How long to wait for an explanatory Abort after the wire broke.
const ABORT_PEEK: Duration = Duration::from_millis(500);

// =============================================================================
// Shutdown
// =============================================================================

/// Process-wide shutdown flag. Cheap to clone into every session.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal and the handle that triggers it (`send(true)`).
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown was requested.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Trigger handle gone without firing: never resolves.
                std::future::pending::<()>().await;
            }
        }
    }
}

// =============================================================================
// Session types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticating,
    Planning,
    Streaming,
    Verifying,
    Completed,
    Failed,
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connected => "connected",
            SessionState::Authenticating => "authenticating",
            SessionState::Planning => "planning",
            SessionState::Streaming => "streaming",
            SessionState::Verifying => "verifying",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Aborted
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an initiator asks the remote for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferIntent {
    /// Send the captures of an own subvolume the remote lacks.
    Push { subvolume: String, force_full: bool },
    /// Fetch the captures of a volume owned by the remote.
    Pull { volume: Volume, force_full: bool },
    /// Fetch back a stored backup of an own capture, with the chain it
    /// depends on.
    Recover { snapshot: SnapshotRef },
}

impl TransferIntent {
    pub fn direction(&self) -> Direction {
        match self {
            TransferIntent::Push { .. } => Direction::Push,
            TransferIntent::Pull { .. } => Direction::Pull,
            TransferIntent::Recover { .. } => Direction::Recover,
        }
    }

    pub fn subvolume(&self) -> &str {
        match self {
            TransferIntent::Push { subvolume, .. } => subvolume,
            TransferIntent::Pull { volume, .. } => &volume.subvolume,
            TransferIntent::Recover { snapshot } => snapshot.subvolume(),
        }
    }

    fn force_full(&self) -> bool {
        match self {
            TransferIntent::Push { force_full, .. } | TransferIntent::Pull { force_full, .. } => {
                *force_full
            }
            TransferIntent::Recover { .. } => false,
        }
    }

    fn request(&self, local_node: &str) -> TransferRequest {
        match self {
            TransferIntent::Push { subvolume, .. } => TransferRequest {
                host: local_node.to_string(),
                subvolume: subvolume.clone(),
                taken: None,
            },
            TransferIntent::Pull { volume, .. } => TransferRequest {
                host: volume.host.clone(),
                subvolume: volume.subvolume.clone(),
                taken: None,
            },
            TransferIntent::Recover { snapshot } => TransferRequest {
                host: snapshot.host().to_string(),
                subvolume: snapshot.subvolume().to_string(),
                taken: Some(snapshot.taken()),
            },
        }
    }
}

/// How a session that did not fail ended.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    /// At least one capture delivered and acknowledged. `snapshot` is the
    /// newest of them; the source side carries one Transfer Record each.
    Completed {
        snapshot: SnapshotRef,
        bytes: u64,
        transfers: usize,
        records: Vec<TransferRecord>,
    },
    /// Nothing needed transferring.
    UpToDate { snapshot: Option<SnapshotRef> },
}

impl SessionOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            SessionOutcome::Completed { bytes, .. } => *bytes,
            SessionOutcome::UpToDate { .. } => 0,
        }
    }
}

/// Shared handles every session runs against.
#[derive(Clone)]
pub struct SessionContext {
    pub node_name: String,
    pub store: Arc<dyn SnapshotStore>,
    pub lineage: Arc<LineageTracker>,
    pub authenticator: Authenticator,
    pub access: Arc<AccessPolicy>,
    pub idle_timeout: Duration,
    pub shutdown: ShutdownSignal,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("node_name", &self.node_name)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// Source-side result of the label and payload exchange.
enum Delivery {
    Delivered(PayloadSummary),
    /// Destination already holds the labelled capture.
    AlreadyHeld,
}

/// Running tally of a session that moves several captures.
#[derive(Default)]
struct Progress {
    delivered: Option<SnapshotRef>,
    held: Option<SnapshotRef>,
    bytes: u64,
    transfers: usize,
    records: Vec<TransferRecord>,
}

impl Progress {
    fn delivered(&mut self, snapshot: SnapshotRef, bytes: u64, record: Option<TransferRecord>) {
        self.delivered = Some(snapshot);
        self.bytes += bytes;
        self.transfers += 1;
        self.records.extend(record);
    }

    fn held(&mut self, snapshot: SnapshotRef) {
        self.held = Some(snapshot);
    }

    /// `current` names the capture already in place when nothing moved.
    fn into_outcome(self, current: Option<SnapshotRef>) -> SessionOutcome {
        match self.delivered {
            Some(snapshot) => SessionOutcome::Completed {
                snapshot,
                bytes: self.bytes,
                transfers: self.transfers,
                records: self.records,
            },
            None => SessionOutcome::UpToDate {
                snapshot: self.held.or(current),
            },
        }
    }
}

/// The capture to send next: the oldest one newer than the record, or the
/// latest when nothing usable is recorded or a full resend was requested.
/// `None` only for an empty capture list.
fn next_candidate<'a>(
    captures: &'a [SnapshotRef],
    recorded: Option<&SnapshotRef>,
    force_full: bool,
) -> Option<&'a SnapshotRef> {
    let latest = captures.last()?;
    match recorded {
        Some(recorded) if !force_full && captures.iter().any(|c| c.same_capture(recorded)) => {
            Some(
                captures
                    .iter()
                    .find(|c| c.cmp_taken(recorded).is_gt())
                    .unwrap_or(latest),
            )
        }
        _ => Some(latest),
    }
}

/// Labels within one session strictly advance in time.
fn check_order(previous: Option<&SnapshotRef>, next: &SnapshotRef) -> Result<(), Error> {
    match previous {
        Some(prev) if next.cmp_taken(prev).is_le() => Err(TransferError::Protocol(format!(
            "label {} does not follow {}",
            next, prev
        ))
        .into()),
        _ => Ok(()),
    }
}

// =============================================================================
// Transfer Session
// =============================================================================

/// One connection, one transfer attempt.
pub struct TransferSession<S> {
    ctx: SessionContext,
    io: S,
    role: Role,
    state: SessionState,
    peer_addr: Option<SocketAddr>,
    remote: Option<String>,
    subvolume: Option<String>,
    direction: Option<Direction>,
    mode: Option<TransferMode>,
}

impl<S> TransferSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(ctx: SessionContext, io: S, role: Role) -> Self {
        Self {
            ctx,
            io,
            role,
            state: SessionState::Connected,
            peer_addr: None,
            remote: None,
            subvolume: None,
            direction: None,
            mode: None,
        }
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Run the session as initiator against `remote`.
    pub async fn initiate(
        &mut self,
        remote: &str,
        intent: TransferIntent,
    ) -> Result<SessionOutcome, Error> {
        self.remote = Some(remote.to_string());
        self.subvolume = Some(intent.subvolume().to_string());
        self.direction = Some(intent.direction());

        let mut shutdown = self.ctx.shutdown.clone();
        let result = tokio::select! {
            biased;
            r = self.drive_initiator(remote, intent) => r,
            _ = shutdown.triggered() => Err(TransferError::Cancelled.into()),
        };
        self.finish(result).await
    }

    /// Run the session as responder for an accepted connection.
    pub async fn respond(&mut self) -> Result<SessionOutcome, Error> {
        let mut shutdown = self.ctx.shutdown.clone();
        let result = tokio::select! {
            biased;
            r = self.drive_responder() => r,
            _ = shutdown.triggered() => Err(TransferError::Cancelled.into()),
        };
        self.finish(result).await
    }

    async fn drive_initiator(
        &mut self,
        remote: &str,
        intent: TransferIntent,
    ) -> Result<SessionOutcome, Error> {
        self.state = SessionState::Authenticating;
        let request = intent.request(&self.ctx.node_name);
        let peer = self
            .ctx
            .authenticator
            .initiate(
                &mut self.io,
                &self.ctx.node_name,
                remote,
                intent.direction(),
                intent.force_full(),
                request,
            )
            .await?;
        self.drive(&peer).await
    }

    async fn drive_responder(&mut self) -> Result<SessionOutcome, Error> {
        self.state = SessionState::Authenticating;
        let peer = self.ctx.authenticator.respond(&mut self.io).await?;

        let direction = peer.direction();
        self.remote = Some(peer.remote.clone());
        self.subvolume = Some(peer.hello.request.subvolume.clone());
        self.direction = Some(direction);

        if !self.ctx.access.permits(
            &self.ctx.node_name,
            &peer.remote,
            direction,
            &peer.hello.request,
        ) {
            return Err(TransferError::Unauthorized.into());
        }
        self.drive(&peer).await
    }

    async fn drive(&mut self, peer: &AuthenticatedPeer) -> Result<SessionOutcome, Error> {
        self.state = SessionState::Planning;
        match (self.role, peer.direction()) {
            (Role::Initiator, Direction::Push) | (Role::Responder, Direction::Pull) => {
                self.run_source(peer).await
            }
            (Role::Initiator, Direction::Pull) | (Role::Responder, Direction::Push) => {
                self.run_destination(peer).await
            }
            (Role::Responder, Direction::Recover) => self.serve_recovery(peer).await,
            (Role::Initiator, Direction::Recover) => self.run_restore(peer).await,
        }
    }

    // =========================================================================
    // Source side
    // =========================================================================

    /// Send every capture newer than the remote's record, oldest first, each
    /// incremental on the one before. Lineage advances after each delivery,
    /// so an interrupted backlog resumes where it stopped.
    async fn run_source(&mut self, peer: &AuthenticatedPeer) -> Result<SessionOutcome, Error> {
        let subvolume = peer.hello.request.subvolume.clone();
        let captures = self
            .ctx
            .store
            .list_snapshots(&subvolume)
            .await
            .map_err(store_err)?;
        let latest = captures
            .last()
            .cloned()
            .ok_or_else(|| TransferError::SourceMissing(subvolume.clone()))?;

        let lineage = Arc::clone(&self.ctx.lineage);
        let mut force_full = peer.hello.force_full();
        let mut progress = Progress::default();
        loop {
            let recorded = lineage.record(&subvolume, &peer.remote);
            let candidate = next_candidate(&captures, recorded.as_ref(), force_full)
                .unwrap_or(&latest)
                .clone();
            let plan = match lineage
                .plan_transfer(&subvolume, &peer.remote, &candidate, force_full)
                .await
            {
                Ok(plan) => plan,
                Err(Error::Lineage(LineageError::StaleSnapshot { recorded, .. }))
                    if captures.iter().any(|c| c.same_capture(&recorded)) =>
                {
                    if recorded.same_capture(&latest) {
                        break;
                    }
                    // Advanced by a concurrent session while we waited.
                    continue;
                }
                Err(e) => return Err(e),
            };
            force_full = false;

            let plan = match plan.parent() {
                Some(parent) if !captures.iter().any(|c| c.same_capture(&parent)) => {
                    plan.into_full()
                }
                _ => plan,
            };
            self.send_planned(peer, plan, &mut progress).await?;
            if candidate.same_capture(&latest) {
                break;
            }
        }

        send_frame(
            &mut self.io,
            &UpToDate::signed(&peer.keys).encode(),
            self.ctx.idle_timeout,
        )
        .await?;
        Ok(progress.into_outcome(Some(latest)))
    }

    async fn send_planned(
        &mut self,
        peer: &AuthenticatedPeer,
        plan: TransferPlan,
        progress: &mut Progress,
    ) -> Result<(), Error> {
        let lineage = Arc::clone(&self.ctx.lineage);
        let snapshot = plan.snapshot().clone();
        self.mode = Some(plan.mode());
        let mut record = TransferRecord::begin(snapshot.clone(), &peer.remote, peer.direction());

        let store = Arc::clone(&self.ctx.store);
        let (export_snap, export_parent) = (snapshot.clone(), plan.parent());
        let export = async move { store.export(&export_snap, export_parent.as_ref()).await };

        let sent = AtomicU64::new(0);
        let mut shutdown = self.ctx.shutdown.clone();
        let result = tokio::select! {
            biased;
            r = self.deliver(&peer.keys, &snapshot, export, &sent) => r,
            _ = shutdown.triggered() => Err(TransferError::Cancelled.into()),
        };

        match result {
            Ok(Delivery::Delivered(summary)) => {
                record.bytes = summary.bytes;
                let record = lineage.commit(plan, record)?;
                progress.delivered(snapshot, summary.bytes, Some(record));
                Ok(())
            }
            Ok(Delivery::AlreadyHeld) => {
                lineage.commit(plan, record)?;
                progress.held(snapshot);
                Ok(())
            }
            Err(e) => {
                record.bytes = sent.load(Ordering::Relaxed);
                let outcome = if is_cancelled(&e) {
                    Outcome::Aborted
                } else {
                    Outcome::Failed
                };
                lineage.discard(plan, record, outcome, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Replay the stored chain ending at the requested backup, oldest first.
    async fn serve_recovery(&mut self, peer: &AuthenticatedPeer) -> Result<SessionOutcome, Error> {
        let request = &peer.hello.request;
        let taken = request.taken.ok_or_else(|| {
            TransferError::Protocol("recovery request without a timestamp".into())
        })?;
        let wanted = SnapshotRef::new(request.host.clone(), request.subvolume.clone(), taken);
        let chain = self.recovery_chain(&wanted).await?;
        debug!(snapshot = %wanted, links = chain.len(), "serving recovery");

        let mut progress = Progress::default();
        for link in chain {
            self.mode = Some(link.mode());
            let store = Arc::clone(&self.ctx.store);
            let stored = link.clone();
            let export = async move { store.open_backup(&stored).await.map(|(_, stream)| stream) };

            let sent = AtomicU64::new(0);
            let mut shutdown = self.ctx.shutdown.clone();
            let result = tokio::select! {
                biased;
                r = self.deliver(&peer.keys, &link, export, &sent) => r,
                _ = shutdown.triggered() => Err(TransferError::Cancelled.into()),
            };
            match result? {
                Delivery::Delivered(summary) => progress.delivered(link, summary.bytes, None),
                Delivery::AlreadyHeld => progress.held(link),
            }
        }

        send_frame(
            &mut self.io,
            &UpToDate::signed(&peer.keys).encode(),
            self.ctx.idle_timeout,
        )
        .await?;
        Ok(progress.into_outcome(None))
    }

    /// `wanted` and its stored ancestors back to the full backup, oldest
    /// first, each labelled with the parent it was received against.
    async fn recovery_chain(&self, wanted: &SnapshotRef) -> Result<Vec<SnapshotRef>, Error> {
        let backups = self
            .ctx
            .store
            .list_backups(Some(&wanted.volume()))
            .await
            .map_err(store_err)?;
        let find = |target: &SnapshotRef| backups.iter().find(|b| b.same_capture(target)).cloned();

        let mut link = find(wanted).ok_or_else(|| {
            debug!(snapshot = %wanted, "backup not available");
            TransferError::SourceMissing(wanted.to_string())
        })?;
        let mut chain = Vec::new();
        while let Some(parent) = link.parent() {
            if parent.cmp_taken(&link).is_ge() {
                return Err(TransferError::Store(format!(
                    "backup {} names a parent that is not older",
                    link
                ))
                .into());
            }
            let Some(next) = find(&parent) else {
                debug!(snapshot = %link, parent = %parent, "backup chain is broken");
                return Err(TransferError::SourceMissing(parent.to_string()).into());
            };
            chain.push(std::mem::replace(&mut link, next));
        }
        chain.push(link);
        chain.reverse();
        Ok(chain)
    }

    /// Label exchange, payload and completion check. The export stream is
    /// only opened once the destination accepted the label.
    async fn deliver<F>(
        &mut self,
        keys: &SessionKeys,
        snapshot: &SnapshotRef,
        export: F,
        sent: &AtomicU64,
    ) -> Result<Delivery, Error>
    where
        F: Future<Output = anyhow::Result<ExportStream>> + Send,
    {
        let idle = self.ctx.idle_timeout;
        let stream_nonce = generate_stream_nonce();
        let label = Label::signed(snapshot.clone(), stream_nonce, keys);
        if let Err(e) = send_frame(&mut self.io, &label.encode(), idle).await {
            return Err(self.explain(e).await.into());
        }

        match recv_frame(&mut self.io, idle).await? {
            (MessageType::LabelAck, payload) => {
                let ack = LabelAck::decode(payload).map_err(TransferError::from_wire)?;
                if !ack.verify(&label, keys) {
                    return Err(TransferError::Integrity.into());
                }
            }
            (MessageType::UpToDate, payload) => {
                let held = UpToDate::decode(payload).map_err(TransferError::from_wire)?;
                if !held.verify_held(&label, keys) {
                    return Err(TransferError::Integrity.into());
                }
                return Ok(Delivery::AlreadyHeld);
            }
            (MessageType::Abort, payload) => return Err(peer_abort(payload)),
            (other, _) => return Err(unexpected(other, "label exchange")),
        }

        self.state = SessionState::Streaming;
        let export = export.await.map_err(store_err)?;
        let (tx, mut rx) = payload_channel();
        let producer = tokio::spawn(read_export(export, tx));
        let result = Sender::new(keys.stream_key(), &stream_nonce, idle)
            .run(&mut rx, &mut self.io, sent)
            .await;
        producer.abort();

        let summary = match result {
            Ok(summary) => summary,
            Err(e) => return Err(self.explain(e).await.into()),
        };

        self.state = SessionState::Verifying;
        let complete = match recv_frame(&mut self.io, idle).await? {
            (MessageType::Complete, payload) => {
                Complete::decode(payload).map_err(TransferError::from_wire)?
            }
            (MessageType::Abort, payload) => return Err(peer_abort(payload)),
            (other, _) => return Err(unexpected(other, "verification")),
        };
        if !complete.verify(keys) {
            return Err(TransferError::Integrity.into());
        }
        if complete.bytes != summary.bytes || complete.digest != summary.digest {
            return Err(TransferError::DigestMismatch {
                received: complete.bytes,
            }
            .into());
        }

        Ok(Delivery::Delivered(summary))
    }

    /// A write failed: the peer may have said why before closing.
    async fn explain(&mut self, err: TransferError) -> TransferError {
        if !matches!(err, TransferError::Network(_) | TransferError::Timeout) {
            return err;
        }
        match tokio::time::timeout(ABORT_PEEK, read_frame(&mut self.io)).await {
            Ok(Ok((MessageType::Abort, payload))) => match Abort::decode(payload) {
                Ok(abort) => TransferError::PeerAbort {
                    code: abort.code,
                    message: abort.message,
                },
                Err(_) => err,
            },
            _ => err,
        }
    }

    // =========================================================================
    // Destination side
    // =========================================================================

    /// Receive labels until the source's end marker, storing each capture
    /// as a backup.
    async fn run_destination(&mut self, peer: &AuthenticatedPeer) -> Result<SessionOutcome, Error> {
        let request = &peer.hello.request;
        let mut progress = Progress::default();
        let mut previous: Option<SnapshotRef> = None;

        while let Some(label) = self.await_label(&peer.keys).await? {
            let snapshot = label.snapshot.clone();
            if snapshot.host() != request.host || snapshot.subvolume() != request.subvolume {
                return Err(TransferError::Protocol(format!(
                    "label {} does not match the requested volume {}/{}",
                    snapshot, request.host, request.subvolume
                ))
                .into());
            }
            check_order(previous.as_ref(), &snapshot)?;
            previous = Some(snapshot.clone());
            self.mode = Some(snapshot.mode());

            if self.ctx.store.has_backup(&snapshot).await.map_err(store_err)? {
                self.answer_held(&label, &peer.keys).await?;
                progress.held(snapshot);
                continue;
            }
            if let Some(parent) = snapshot.parent() {
                if !self.ctx.store.has_backup(&parent).await.map_err(store_err)? {
                    debug!(snapshot = %snapshot, parent = %parent, "incremental parent missing");
                    return Err(TransferError::Rejected(AbortCode::ParentMissing).into());
                }
            }

            let sink = match self.ctx.store.begin_import(&snapshot).await {
                Ok(sink) => sink,
                // Lost a race against a concurrent delivery of the same capture.
                Err(_) if self.ctx.store.has_backup(&snapshot).await.unwrap_or(false) => {
                    return Err(TransferError::Rejected(AbortCode::AlreadyPresent).into());
                }
                Err(e) => return Err(store_err(e)),
            };
            let bytes = self.receive_into(&peer.keys, &label, sink).await?;
            progress.delivered(snapshot, bytes, None);
        }
        Ok(progress.into_outcome(None))
    }

    /// Restore the chain the backup server replays, ending at the requested
    /// capture. Links already present locally are skipped.
    async fn run_restore(&mut self, peer: &AuthenticatedPeer) -> Result<SessionOutcome, Error> {
        let request = &peer.hello.request;
        let mut progress = Progress::default();
        let mut previous: Option<SnapshotRef> = None;

        while let Some(label) = self.await_label(&peer.keys).await? {
            let snapshot = label.snapshot.clone();
            if snapshot.host() != request.host
                || snapshot.subvolume() != request.subvolume
                || request.taken.map_or(true, |t| snapshot.taken() > t)
            {
                return Err(TransferError::Protocol(format!(
                    "label {} does not belong to the requested backup",
                    snapshot
                ))
                .into());
            }
            check_order(previous.as_ref(), &snapshot)?;
            previous = Some(snapshot.clone());
            self.mode = Some(snapshot.mode());

            let local = self
                .ctx
                .store
                .list_snapshots(snapshot.subvolume())
                .await
                .map_err(store_err)?;
            if local.iter().any(|s| s.same_capture(&snapshot)) {
                self.answer_held(&label, &peer.keys).await?;
                progress.held(snapshot);
                continue;
            }

            let sink = self
                .ctx
                .store
                .begin_restore(&snapshot)
                .await
                .map_err(store_err)?;
            let bytes = self.receive_into(&peer.keys, &label, sink).await?;
            progress.delivered(snapshot, bytes, None);
        }

        if previous.map(|s| s.taken()) != request.taken {
            return Err(TransferError::Protocol(
                "backup server ended before the requested capture".into(),
            )
            .into());
        }
        Ok(progress.into_outcome(None))
    }

    /// Wait for the source's label. `None` when the source reported that
    /// there is nothing newer to send.
    async fn await_label(&mut self, keys: &SessionKeys) -> Result<Option<Label>, Error> {
        match recv_frame(&mut self.io, self.ctx.idle_timeout).await? {
            (MessageType::Label, payload) => {
                let label = Label::decode(payload).map_err(TransferError::from_wire)?;
                if !label.verify(keys) {
                    return Err(TransferError::Integrity.into());
                }
                Ok(Some(label))
            }
            (MessageType::UpToDate, payload) => {
                let msg = UpToDate::decode(payload).map_err(TransferError::from_wire)?;
                if !msg.verify(keys) {
                    return Err(TransferError::Integrity.into());
                }
                Ok(None)
            }
            (MessageType::Abort, payload) => Err(peer_abort(payload)),
            (other, _) => Err(unexpected(other, "label exchange")),
        }
    }

    async fn answer_held(&mut self, label: &Label, keys: &SessionKeys) -> Result<(), Error> {
        send_frame(
            &mut self.io,
            &UpToDate::held(label, keys).encode(),
            self.ctx.idle_timeout,
        )
        .await?;
        Ok(())
    }

    /// Accept the label, receive the payload into `sink` and acknowledge.
    ///
    /// The sink is committed before Complete is sent and aborted on every
    /// other path.
    async fn receive_into(
        &mut self,
        keys: &SessionKeys,
        label: &Label,
        mut sink: Box<dyn ImportSink>,
    ) -> Result<u64, Error> {
        let idle = self.ctx.idle_timeout;
        if let Err(e) = send_frame(&mut self.io, &LabelAck::signed(label, keys).encode(), idle).await
        {
            sink.abort().await;
            return Err(e.into());
        }
        self.state = SessionState::Streaming;

        let mut shutdown = self.ctx.shutdown.clone();
        let received = {
            let (tx, rx) = payload_channel();
            let receiver = Receiver::new(keys.stream_key(), &label.stream_nonce, idle);
            let io = &mut self.io;
            let writer = sink.as_mut();
            let pipeline = async move {
                tokio::try_join!(receiver.run(io, tx), write_import(writer, rx))
            };
            tokio::select! {
                biased;
                r = pipeline => r,
                _ = shutdown.triggered() => Err(TransferError::Cancelled),
            }
        };

        let summary = match received {
            Ok((summary, _)) => summary,
            Err(e) => {
                sink.abort().await;
                return Err(e.into());
            }
        };

        self.state = SessionState::Verifying;
        sink.commit().await.map_err(store_err)?;
        send_frame(
            &mut self.io,
            &Complete::signed(summary.bytes, summary.digest, keys).encode(),
            idle,
        )
        .await?;
        Ok(summary.bytes)
    }

    // =========================================================================
    // Terminal states
    // =========================================================================

    fn mode_label(&self) -> &'static str {
        self.mode.map_or("none", |m| m.as_str())
    }

    async fn finish(&mut self, result: Result<SessionOutcome, Error>) -> Result<SessionOutcome, Error> {
        let remote = self.remote.as_deref().unwrap_or("-");
        let subvolume = self.subvolume.as_deref().unwrap_or("-");
        let direction = self.direction.map_or("-", |d| d.as_str());

        match &result {
            Ok(outcome) => {
                self.state = SessionState::Completed;
                match outcome {
                    SessionOutcome::Completed {
                        snapshot,
                        bytes,
                        transfers,
                        ..
                    } => info!(
                        remote,
                        subvolume,
                        direction,
                        mode = self.mode_label(),
                        snapshot = %snapshot,
                        transfers,
                        bytes,
                        "transfer completed"
                    ),
                    SessionOutcome::UpToDate { snapshot } => info!(
                        remote,
                        subvolume,
                        direction,
                        snapshot = ?snapshot.as_ref().map(|s| s.name()),
                        "already up to date"
                    ),
                }
            }
            Err(e) => {
                self.state = if is_cancelled(e) {
                    SessionState::Aborted
                } else {
                    SessionState::Failed
                };
                if e.should_notify_peer() {
                    let abort = Abort::new(e.abort_code(), e.to_string()).encode();
                    let _ = send_frame(&mut self.io, &abort, ABORT_PEEK).await;
                }
                match (self.role, e) {
                    (Role::Responder, Error::Auth(reason)) => warn!(
                        peer = ?self.peer_addr,
                        reason = reason.as_str(),
                        "rejected peer"
                    ),
                    _ => warn!(
                        remote,
                        subvolume,
                        direction,
                        mode = self.mode_label(),
                        state = %self.state,
                        kind = e.kind(),
                        error = %e,
                        "transfer failed"
                    ),
                }
            }
        }
        result
    }
}

fn is_cancelled(e: &Error) -> bool {
    matches!(e, Error::Transfer(TransferError::Cancelled))
}

fn store_err(e: anyhow::Error) -> Error {
    TransferError::Store(format!("{:#}", e)).into()
}

fn unexpected(msg_type: MessageType, during: &str) -> Error {
    TransferError::Protocol(format!("unexpected {:?} during {}", msg_type, during)).into()
}

fn peer_abort(payload: Bytes) -> Error {
    match Abort::decode(payload) {
        Ok(abort) => TransferError::PeerAbort {
            code: abort.code,
            message: abort.message,
        }
        .into(),
        Err(e) => TransferError::from_wire(e).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (tx, mut signal) = ShutdownSignal::new();
        assert!(!signal.is_triggered());

        let pending = tokio::time::timeout(Duration::from_millis(20), signal.triggered()).await;
        assert!(pending.is_err());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), signal.triggered())
            .await
            .unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_never_signal_stays_quiet() {
        let mut signal = ShutdownSignal::never();
        let res = tokio::time::timeout(Duration::from_millis(20), signal.triggered()).await;
        assert!(res.is_err());
    }

    #[test]
    fn test_intent_requests() {
        let pull = TransferIntent::Pull {
            volume: Volume::new("beta", "srv"),
            force_full: true,
        };
        let req = pull.request("alpha");
        assert_eq!(req.host, "beta");
        assert_eq!(req.subvolume, "srv");
        assert!(pull.force_full());
        assert_eq!(pull.direction(), Direction::Pull);

        let push = TransferIntent::Push {
            subvolume: "home".into(),
            force_full: false,
        };
        assert_eq!(push.request("alpha").host, "alpha");
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Aborted.is_terminal());
        assert!(!SessionState::Verifying.is_terminal());
    }
}
