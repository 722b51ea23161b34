//! Error taxonomy for snapvault.
//!
//! Four domain families map onto how a failure is handled:
//! - [`AuthError`] closes the connection and is never retried on it.
//! - [`LineageError`] fails the transfer but keeps the daemon running.
//! - [`TransferError`] is retried by the next backup cycle.
//! - [`PersistenceError`] stops work for the affected remote.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::snapshot::SnapshotRef;
use crate::streaming::protocol::AbortCode;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Lineage(#[from] LineageError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Stable label used in structured log entries.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Auth(_) => "auth",
            Error::Lineage(_) => "lineage",
            Error::Transfer(_) => "transfer",
            Error::Persistence(_) => "persistence",
            Error::Config(_) => "config",
        }
    }

    /// Whether the next scheduled cycle may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transfer(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Code sent to the peer when this error ends a session locally.
    pub fn abort_code(&self) -> AbortCode {
        match self {
            Error::Auth(_) => AbortCode::AuthFailed,
            Error::Lineage(LineageError::StaleSnapshot { .. }) => AbortCode::Stale,
            Error::Transfer(e) => e.abort_code(),
            Error::Lineage(_) | Error::Persistence(_) | Error::Config(_) => AbortCode::Io,
        }
    }

    /// Whether the peer is still listening and should be told why the
    /// session ends. Handshake failures are answered by the authenticator.
    pub fn should_notify_peer(&self) -> bool {
        !matches!(
            self,
            Error::Auth(_)
                | Error::Transfer(TransferError::Network(_) | TransferError::PeerAbort { .. })
        )
    }
}

/// Handshake failures. The peer only ever learns "authentication failed".
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication timed out")]
    Timeout,

    #[error("authentication code mismatch")]
    Mismatch,

    #[error("unknown remote")]
    UnknownRemote,
}

impl AuthError {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthError::Timeout => "timeout",
            AuthError::Mismatch => "mismatch",
            AuthError::UnknownRemote => "unknown_remote",
        }
    }
}

#[derive(Debug, Error)]
pub enum LineageError {
    #[error("candidate {candidate} is not newer than recorded lineage {recorded}")]
    StaleSnapshot {
        candidate: SnapshotRef,
        recorded: SnapshotRef,
    },

    #[error("corrupted lineage record at line {line}: {reason}")]
    Corrupted { line: usize, reason: String },

    #[error("lineage for ({subvolume}, {remote}) changed while the transfer was in flight")]
    Conflict { subvolume: String, remote: String },
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {0}")]
    Network(#[from] io::Error),

    #[error("peer stopped responding")]
    Timeout,

    #[error("payload integrity check failed")]
    Integrity,

    #[error("payload digest mismatch: receiver reported {received} bytes")]
    DigestMismatch { received: u64 },

    #[error("peer aborted ({code:?}): {message}")]
    PeerAbort { code: AbortCode, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cancelled by local shutdown")]
    Cancelled,

    #[error("transfer rejected locally ({0:?})")]
    Rejected(AbortCode),

    #[error("remote is not authorized for this operation")]
    Unauthorized,

    #[error("no snapshot available for {0}")]
    SourceMissing(String),

    #[error("snapshot store error: {0}")]
    Store(String),
}

impl TransferError {
    /// Classify a wire-level error: anything rooted in an I/O failure is a
    /// network error, the rest is a protocol violation.
    pub fn from_wire(err: anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                return TransferError::Network(io::Error::new(io_err.kind(), err.to_string()));
            }
        }
        TransferError::Protocol(format!("{:#}", err))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Network(_)
                | TransferError::Timeout
                | TransferError::Integrity
                | TransferError::DigestMismatch { .. }
                | TransferError::PeerAbort { .. }
                | TransferError::Cancelled
        )
    }

    /// Code sent to the peer when this error ends the session locally.
    pub fn abort_code(&self) -> AbortCode {
        match self {
            TransferError::Network(_) | TransferError::Store(_) => AbortCode::Io,
            TransferError::Timeout => AbortCode::Io,
            TransferError::Integrity | TransferError::DigestMismatch { .. } => {
                AbortCode::Integrity
            }
            TransferError::PeerAbort { code, .. } => *code,
            TransferError::Protocol(_) => AbortCode::Protocol,
            TransferError::Cancelled => AbortCode::Shutdown,
            TransferError::Rejected(code) => *code,
            TransferError::Unauthorized => AbortCode::Unauthorized,
            TransferError::SourceMissing(_) => AbortCode::NotFound,
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {0} is locked by another process")]
    Locked(PathBuf),

    #[error("serialization error: {0}")]
    Serialize(String),
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {0} not found")]
    Missing(PathBuf),

    #[error("insecure permissions on {0} (restrict access to the owner)")]
    InsecurePermissions(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(Error::from(AuthError::Mismatch).kind(), "auth");
        assert_eq!(Error::from(TransferError::Integrity).kind(), "transfer");
        assert_eq!(
            Error::from(PersistenceError::Locked(PathBuf::from("/x"))).kind(),
            "persistence"
        );
    }

    #[test]
    fn test_from_wire_classifies_io() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let wrapped = anyhow::Error::from(io_err).context("Failed to read frame length");
        assert!(matches!(
            TransferError::from_wire(wrapped),
            TransferError::Network(_)
        ));

        let proto = anyhow::anyhow!("Unknown message type");
        assert!(matches!(
            TransferError::from_wire(proto),
            TransferError::Protocol(_)
        ));
    }

    #[test]
    fn test_abort_codes() {
        let stale = LineageError::Conflict {
            subvolume: "home".into(),
            remote: "backup01".into(),
        };
        assert_eq!(Error::from(stale).abort_code(), AbortCode::Io);
        assert_eq!(
            Error::from(TransferError::Cancelled).abort_code(),
            AbortCode::Shutdown
        );
        let gone = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        assert!(!Error::from(TransferError::Network(gone)).should_notify_peer());
        assert!(Error::from(TransferError::Integrity).should_notify_peer());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::from(TransferError::Timeout).is_retryable());
        assert!(!Error::from(AuthError::Mismatch).is_retryable());
        assert!(!Error::from(TransferError::Unauthorized).is_retryable());
    }
}
