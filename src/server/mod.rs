//! Daemon side of the Connection Dispatcher.
//!
//! Accepts connections on the well-known port and runs one independent
//! responder [`TransferSession`] per connection. Sessions share only the
//! handles in [`SessionContext`].

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::streaming::{Role, SessionContext, TransferSession};

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Daemon {
    ctx: SessionContext,
    listener: TcpListener,
    grace: Duration,
}

impl Daemon {
    pub fn new(ctx: SessionContext, listener: TcpListener, grace: Duration) -> Self {
        Self {
            ctx,
            listener,
            grace,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the context's shutdown signal fires, then give in-flight
    /// sessions the grace period to wind down before aborting them.
    pub async fn run(self) -> Result<()> {
        let Self {
            ctx,
            listener,
            grace,
        } = self;
        let mut shutdown = ctx.shutdown.clone();
        let mut sessions = JoinSet::new();

        info!(addr = %listener.local_addr()?, node = %ctx.node_name, "daemon listening");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "set_nodelay failed");
                        }
                        debug!(%peer, "accepted connection");
                        let ctx = ctx.clone();
                        sessions.spawn(async move {
                            let mut session =
                                TransferSession::new(ctx, stream, Role::Responder).with_peer_addr(peer);
                            // Outcomes are logged by the session itself.
                            let _ = session.respond().await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!(error = %e, "session task panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        let in_flight = sessions.len();
        if in_flight > 0 {
            info!(sessions = in_flight, grace_secs = grace.as_secs(), "draining sessions");
            let drained = tokio::time::timeout(grace, async {
                while sessions.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(sessions = sessions.len(), "grace period elapsed, aborting sessions");
                sessions.shutdown().await;
            }
        }
        info!("daemon stopped");
        Ok(())
    }
}
