//! Destination half of the payload pipeline.
//!
//! [`Receiver`] reads segments off the wire, opens them in order and hands
//! plaintext to [`write_import`], which feeds the staged import. Nothing is
//! committed here; the session decides once both halves have finished.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::trace;

use super::channel::{
    PayloadDigest, PayloadMessage, PayloadReceiver, PayloadSender, PayloadSummary,
};
use super::cipher::{SegmentOpener, STREAM_NONCE_LEN};
use super::protocol::{Abort, MessageType};
use super::recv_frame;
use crate::error::TransferError;
use crate::snapshot::ImportSink;

pub struct Receiver {
    opener: SegmentOpener,
    digest: PayloadDigest,
    idle: Duration,
}

impl Receiver {
    pub fn new(key: &[u8; 32], nonce: &[u8; STREAM_NONCE_LEN], idle: Duration) -> Self {
        Self {
            opener: SegmentOpener::new(key, nonce),
            digest: PayloadDigest::new(),
            idle,
        }
    }

    /// Read `Data` frames until `DataEnd`, forwarding plaintext to `tx`.
    ///
    /// Any segment that fails to open ends the transfer; bytes already
    /// forwarded stay in the staged import and are discarded with it.
    pub async fn run<R>(self, r: &mut R, tx: PayloadSender) -> Result<PayloadSummary, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let Self {
            mut opener,
            mut digest,
            idle,
        } = self;

        loop {
            let (msg_type, payload) = recv_frame(r, idle).await?;
            match msg_type {
                MessageType::Data => {
                    let plain = opener.open(&payload)?;
                    trace!(bytes = plain.len(), "received segment");
                    forward(&tx, &mut digest, plain).await?;
                }
                MessageType::DataEnd => {
                    let plain = opener.open_last(&payload)?;
                    forward(&tx, &mut digest, plain).await?;
                    tx.send(PayloadMessage::End)
                        .await
                        .map_err(|_| import_stopped())?;
                    return Ok(digest.finish());
                }
                MessageType::Abort => {
                    let abort = Abort::decode(payload).map_err(TransferError::from_wire)?;
                    return Err(TransferError::PeerAbort {
                        code: abort.code,
                        message: abort.message,
                    });
                }
                other => {
                    return Err(TransferError::Protocol(format!(
                        "unexpected {:?} during payload",
                        other
                    )))
                }
            }
        }
    }
}

async fn forward(
    tx: &PayloadSender,
    digest: &mut PayloadDigest,
    plain: Vec<u8>,
) -> Result<(), TransferError> {
    if plain.is_empty() {
        return Ok(());
    }
    digest.update(&plain);
    tx.send(PayloadMessage::Chunk(Bytes::from(plain)))
        .await
        .map_err(|_| import_stopped())
}

fn import_stopped() -> TransferError {
    TransferError::Store("import writer stopped".into())
}

/// Consumer: write plaintext into the staged import, in order.
pub async fn write_import(
    sink: &mut dyn ImportSink,
    mut rx: PayloadReceiver,
) -> Result<u64, TransferError> {
    let mut written = 0u64;
    while let Some(msg) = rx.recv().await {
        match msg {
            PayloadMessage::Chunk(chunk) => {
                sink.writer()
                    .write_all(&chunk)
                    .await
                    .map_err(|e| TransferError::Store(format!("import write: {}", e)))?;
                written += chunk.len() as u64;
            }
            PayloadMessage::End => {
                sink.writer()
                    .flush()
                    .await
                    .map_err(|e| TransferError::Store(format!("import flush: {}", e)))?;
                return Ok(written);
            }
            PayloadMessage::Failed(msg) => return Err(TransferError::Store(msg)),
        }
    }
    Err(TransferError::Protocol(
        "payload ended without end-of-stream".into(),
    ))
}
