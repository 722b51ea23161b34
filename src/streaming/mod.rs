//! Transfer streaming for snapvault.
//!
//! One connection carries one snapshot. After the handshake the source sends
//! a label, then the payload as a sequence of encrypted segments, and the
//! destination answers with a signed completion acknowledgment.
//!
//! # Architecture
//!
//! ```text
//! source:
//! +--------------+   bounded   +--------------+
//! | export read  | ----------> |    Sender    | --> Data... DataEnd --> wire
//! | (snapshot)   |   channel   | (seal+frame) |
//! +--------------+             +--------------+
//!
//! destination:
//! +--------------+   bounded   +--------------+
//! |   Receiver   | ----------> | import write | --> staged backup
//! | (open+check) |   channel   |   (sink)     |
//! +--------------+             +--------------+
//! ```
//!
//! [`session::TransferSession`] drives both ends with a single state machine;
//! the role and the requested direction decide which end it plays.

pub mod channel;
pub mod cipher;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransferError;
use protocol::{read_frame, write_frame, MessageType};

pub use channel::{Direction, PayloadDigest, PayloadSummary, DATA_CHUNK_SIZE};
pub use receiver::{write_import, Receiver};
pub use sender::{read_export, Sender};
pub use session::{
    Role, SessionContext, SessionOutcome, SessionState, ShutdownSignal, TransferIntent,
    TransferSession,
};

/// Read one frame, failing if the peer stays silent for `idle`.
pub(crate) async fn recv_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    idle: Duration,
) -> Result<(MessageType, Bytes), TransferError> {
    match tokio::time::timeout(idle, read_frame(r)).await {
        Ok(frame) => frame.map_err(TransferError::from_wire),
        Err(_) => Err(TransferError::Timeout),
    }
}

/// Write one frame, failing if the peer stops draining for `idle`.
pub(crate) async fn send_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &Bytes,
    idle: Duration,
) -> Result<(), TransferError> {
    match tokio::time::timeout(idle, write_frame(w, frame)).await {
        Ok(res) => res.map_err(TransferError::from_wire),
        Err(_) => Err(TransferError::Timeout),
    }
}
