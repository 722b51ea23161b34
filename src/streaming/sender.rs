//! Source half of the payload pipeline.
//!
//! [`read_export`] pulls the snapshot export stream into fixed-size chunks;
//! [`Sender`] seals each chunk and writes it to the wire, one chunk behind
//! so the final segment can carry the last-block flag.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWrite};
use tracing::trace;

use super::channel::{
    PayloadDigest, PayloadMessage, PayloadReceiver, PayloadSender, PayloadSummary,
    DATA_CHUNK_SIZE,
};
use super::cipher::{SegmentSealer, STREAM_NONCE_LEN};
use super::protocol::{Data, DataEnd};
use super::send_frame;
use crate::error::TransferError;
use crate::snapshot::ExportStream;

/// Producer: read `stream` until end-of-data, forwarding full chunks.
///
/// Ends with `End` on success or `Failed` on a read error. Returns early if
/// the consumer went away.
pub async fn read_export(mut stream: ExportStream, tx: PayloadSender) {
    loop {
        let mut buf = BytesMut::with_capacity(DATA_CHUNK_SIZE);
        let mut eof = false;
        while buf.len() < DATA_CHUNK_SIZE {
            match stream.read_buf(&mut buf).await {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = tx
                        .send(PayloadMessage::Failed(format!("export stream: {}", e)))
                        .await;
                    return;
                }
            }
        }

        if !buf.is_empty() && tx.send(PayloadMessage::Chunk(buf.freeze())).await.is_err() {
            return;
        }
        if eof {
            let _ = tx.send(PayloadMessage::End).await;
            return;
        }
    }
}

/// Consumer: seal chunks in order and frame them onto the wire.
pub struct Sender {
    sealer: SegmentSealer,
    digest: PayloadDigest,
    idle: Duration,
}

impl Sender {
    pub fn new(key: &[u8; 32], nonce: &[u8; STREAM_NONCE_LEN], idle: Duration) -> Self {
        Self {
            sealer: SegmentSealer::new(key, nonce),
            digest: PayloadDigest::new(),
            idle,
        }
    }

    /// Drain `rx` onto `w`. `sent` tracks plaintext bytes already on the
    /// wire, so a failed attempt can still report how far it got.
    pub async fn run<W>(
        mut self,
        rx: &mut PayloadReceiver,
        w: &mut W,
        sent: &AtomicU64,
    ) -> Result<PayloadSummary, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut pending: Option<Bytes> = None;

        loop {
            let next = tokio::time::timeout(self.idle, rx.recv())
                .await
                .map_err(|_| {
                    TransferError::Store(format!(
                        "export stream produced nothing for {}s",
                        self.idle.as_secs()
                    ))
                })?;
            match next {
                Some(PayloadMessage::Chunk(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    if let Some(prev) = pending.replace(chunk) {
                        self.write_segment(w, prev, sent).await?;
                    }
                }
                Some(PayloadMessage::End) => break,
                Some(PayloadMessage::Failed(msg)) => return Err(TransferError::Store(msg)),
                None => {
                    return Err(TransferError::Store(
                        "export stream stopped without end-of-data".into(),
                    ))
                }
            }
        }

        // An empty final segment still authenticates end-of-stream.
        let last = pending.unwrap_or_default();
        self.digest.update(&last);
        let segment = self.sealer.seal_last(&last)?;
        send_frame(
            w,
            &DataEnd {
                segment: Bytes::from(segment),
            }
            .encode(),
            self.idle,
        )
        .await?;
        sent.fetch_add(last.len() as u64, Ordering::Relaxed);

        Ok(self.digest.finish())
    }

    async fn write_segment<W>(
        &mut self,
        w: &mut W,
        chunk: Bytes,
        sent: &AtomicU64,
    ) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        self.digest.update(&chunk);
        let segment = self.sealer.seal(&chunk)?;
        trace!(bytes = chunk.len(), "sending segment");
        send_frame(
            w,
            &Data {
                segment: Bytes::from(segment),
            }
            .encode(),
            self.idle,
        )
        .await?;
        sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::payload_channel;
    use crate::streaming::cipher::SegmentOpener;
    use crate::streaming::protocol::{read_frame, MessageType};

    #[tokio::test]
    async fn test_export_is_chunked() {
        let data = vec![7u8; DATA_CHUNK_SIZE + 10];
        let (tx, mut rx) = payload_channel();
        tokio::spawn(read_export(Box::new(std::io::Cursor::new(data)), tx));

        let mut sizes = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                PayloadMessage::Chunk(c) => sizes.push(c.len()),
                PayloadMessage::End => break,
                PayloadMessage::Failed(e) => panic!("{}", e),
            }
        }
        assert_eq!(sizes, vec![DATA_CHUNK_SIZE, 10]);
    }

    #[tokio::test]
    async fn test_last_segment_is_flagged() {
        let key = [1u8; 32];
        let nonce = [2u8; STREAM_NONCE_LEN];
        let (tx, mut rx) = payload_channel();
        tx.send(PayloadMessage::Chunk(Bytes::from_static(b"one")))
            .await
            .unwrap();
        tx.send(PayloadMessage::Chunk(Bytes::from_static(b"two")))
            .await
            .unwrap();
        tx.send(PayloadMessage::End).await.unwrap();

        let (mut a, mut b) = tokio::io::duplex(4096);
        let sent = AtomicU64::new(0);
        let summary = Sender::new(&key, &nonce, Duration::from_secs(5))
            .run(&mut rx, &mut a, &sent)
            .await
            .unwrap();
        assert_eq!(summary.bytes, 6);
        assert_eq!(sent.load(Ordering::Relaxed), 6);

        let mut opener = SegmentOpener::new(&key, &nonce);
        let (t, p) = read_frame(&mut b).await.unwrap();
        assert_eq!(t, MessageType::Data);
        assert_eq!(opener.open(&p).unwrap(), b"one");
        let (t, p) = read_frame(&mut b).await.unwrap();
        assert_eq!(t, MessageType::DataEnd);
        assert_eq!(opener.open_last(&p).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_vanished_producer_is_an_error() {
        let (tx, mut rx) = payload_channel();
        tx.send(PayloadMessage::Chunk(Bytes::from_static(b"partial")))
            .await
            .unwrap();
        drop(tx);

        let (mut a, _b) = tokio::io::duplex(4096);
        let res = Sender::new(&[0; 32], &[0; STREAM_NONCE_LEN], Duration::from_secs(5))
            .run(&mut rx, &mut a, &AtomicU64::new(0))
            .await;
        assert!(matches!(res, Err(TransferError::Store(_))));
    }

    #[tokio::test]
    async fn test_stalled_export_times_out() {
        let (tx, mut rx) = payload_channel();
        tx.send(PayloadMessage::Chunk(Bytes::from_static(b"first")))
            .await
            .unwrap();

        let (mut a, _b) = tokio::io::duplex(4096);
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            Sender::new(&[0; 32], &[0; STREAM_NONCE_LEN], Duration::from_millis(50))
                .run(&mut rx, &mut a, &AtomicU64::new(0)),
        )
        .await
        .expect("sender waited on a silent export");
        assert!(matches!(res, Err(TransferError::Store(_))));
        drop(tx);
    }
}
