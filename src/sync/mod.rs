//! Initiator side of the Connection Dispatcher.
//!
//! Opens one connection per transfer and drives the session as initiator.
//! Push, pull and recovery differ only in the [`TransferIntent`].

pub mod cycle;

use std::time::Duration;

use tracing::warn;

use crate::error::{Error, TransferError};
use crate::snapshot::{SnapshotRef, Volume};
use crate::streaming::{Role, SessionContext, SessionOutcome, TransferIntent, TransferSession};
use crate::transport;

pub use cycle::{plan_jobs, run_cycle, BackupJob, CycleReport, JobReport};

/// Where to reach a remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub address: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Initiator {
    ctx: SessionContext,
    connect_timeout: Duration,
}

impl Initiator {
    pub fn new(ctx: SessionContext, connect_timeout: Duration) -> Self {
        Self {
            ctx,
            connect_timeout,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Send the latest capture of an own subvolume to `remote`.
    pub async fn push(
        &self,
        remote: &Endpoint,
        subvolume: &str,
        force_full: bool,
    ) -> Result<SessionOutcome, Error> {
        self.run(
            remote,
            TransferIntent::Push {
                subvolume: subvolume.to_string(),
                force_full,
            },
        )
        .await
    }

    /// Fetch the latest capture of a volume owned by `remote`.
    pub async fn pull(
        &self,
        remote: &Endpoint,
        volume: &Volume,
        force_full: bool,
    ) -> Result<SessionOutcome, Error> {
        self.run(
            remote,
            TransferIntent::Pull {
                volume: volume.clone(),
                force_full,
            },
        )
        .await
    }

    /// Fetch back a backup of an own capture stored on `remote`.
    pub async fn recover(
        &self,
        remote: &Endpoint,
        snapshot: &SnapshotRef,
    ) -> Result<SessionOutcome, Error> {
        self.run(
            remote,
            TransferIntent::Recover {
                snapshot: snapshot.clone(),
            },
        )
        .await
    }

    pub async fn run(
        &self,
        remote: &Endpoint,
        intent: TransferIntent,
    ) -> Result<SessionOutcome, Error> {
        if self.ctx.shutdown.is_triggered() {
            return Err(TransferError::Cancelled.into());
        }
        let stream = match transport::connect(&remote.address, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                let err: Error =
                    TransferError::Network(std::io::Error::other(format!("{:#}", e))).into();
                warn!(
                    remote = %remote.name,
                    subvolume = intent.subvolume(),
                    direction = intent.direction().as_str(),
                    mode = "none",
                    kind = err.kind(),
                    error = %err,
                    "transfer failed"
                );
                return Err(err);
            }
        };
        let peer = stream.peer_addr().ok();

        let mut session = TransferSession::new(self.ctx.clone(), stream, Role::Initiator);
        if let Some(addr) = peer {
            session = session.with_peer_addr(addr);
        }
        session.initiate(&remote.name, intent).await
    }
}
