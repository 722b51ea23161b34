//! Wire protocol v1 message types.
//!
//! One connection carries one transfer attempt:
//! handshake (Hello, Challenge, Response, AuthOk), label exchange
//! (Label, LabelAck), encrypted payload (Data..., DataEnd) and the receiver's
//! completion acknowledgment (Complete). Abort may be sent by either side at
//! any point and ends the connection.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::NaiveDateTime;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::handshake::{SessionKeys, Tag, TAG_LEN};
use crate::auth::secrets::{Nonce, NONCE_LEN};
use crate::snapshot::{format_timestamp, parse_timestamp, SnapshotRef};
use crate::streaming::channel::Direction;
use crate::streaming::cipher::STREAM_NONCE_LEN;

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u16 len + UTF-8)
/// Frame format: len:u32 | type:u8 | payload

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Challenge = 0x02,
    Response = 0x03,
    AuthOk = 0x04,
    Label = 0x05,
    LabelAck = 0x06,
    Data = 0x07,
    DataEnd = 0x08,
    Complete = 0x09,
    Abort = 0x0A,
    UpToDate = 0x0B,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Challenge),
            0x03 => Some(Self::Response),
            0x04 => Some(Self::AuthOk),
            0x05 => Some(Self::Label),
            0x06 => Some(Self::LabelAck),
            0x07 => Some(Self::Data),
            0x08 => Some(Self::DataEnd),
            0x09 => Some(Self::Complete),
            0x0A => Some(Self::Abort),
            0x0B => Some(Self::UpToDate),
            _ => None,
        }
    }
}

// =============================================================================
// Hello Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HelloFlags: u32 {
        const PULL = 1 << 0;
        const RECOVER = 1 << 1;
        const FORCE_FULL = 1 << 2;
    }
}

// =============================================================================
// Abort Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AbortCode {
    AuthFailed = 1,
    Unauthorized = 2,
    ParentMissing = 3,
    AlreadyPresent = 4,
    Integrity = 5,
    Io = 6,
    Stale = 7,
    Shutdown = 8,
    Protocol = 9,
    NotFound = 10,
}

impl AbortCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::AuthFailed),
            2 => Some(Self::Unauthorized),
            3 => Some(Self::ParentMissing),
            4 => Some(Self::AlreadyPresent),
            5 => Some(Self::Integrity),
            6 => Some(Self::Io),
            7 => Some(Self::Stale),
            8 => Some(Self::Shutdown),
            9 => Some(Self::Protocol),
            10 => Some(Self::NotFound),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailed => "auth-failed",
            Self::Unauthorized => "unauthorized",
            Self::ParentMissing => "parent-missing",
            Self::AlreadyPresent => "already-present",
            Self::Integrity => "integrity",
            Self::Io => "io",
            Self::Stale => "stale",
            Self::Shutdown => "shutdown",
            Self::Protocol => "protocol",
            Self::NotFound => "not-found",
        }
    }
}

// =============================================================================
// Encoding helpers
// =============================================================================

fn start_frame(msg_type: MessageType, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
    buf
}

/// Longest prefix of `s` whose length fits the u16 prefix, cut on a char
/// boundary.
fn wire_str(s: &str) -> &str {
    let mut end = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn put_str(buf: &mut BytesMut, s: &str) {
    let s = wire_str(s);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn str_len(s: &str) -> usize {
    2 + wire_str(s).len()
}

fn get_str(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        anyhow::bail!("{} length truncated", what);
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        anyhow::bail!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        );
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .with_context(|| format!("Invalid UTF-8 in {}", what))
}

/// Optional timestamp: empty string for none.
fn put_ts(buf: &mut BytesMut, ts: Option<NaiveDateTime>) {
    match ts {
        Some(ts) => put_str(buf, &format_timestamp(&ts)),
        None => buf.put_u16(0),
    }
}

fn ts_len(ts: Option<NaiveDateTime>) -> usize {
    // YYYYMMDDHHMMSS
    2 + if ts.is_some() { 14 } else { 0 }
}

fn get_ts(payload: &mut Bytes, what: &str) -> Result<Option<NaiveDateTime>> {
    let s = get_str(payload, what)?;
    if s.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parse_timestamp(&s)?))
    }
}

fn get_array<const N: usize>(payload: &mut Bytes, what: &str) -> Result<[u8; N]> {
    if payload.remaining() < N {
        anyhow::bail!("{} truncated", what);
    }
    let mut out = [0u8; N];
    payload.copy_to_slice(&mut out);
    Ok(out)
}

fn put_snapshot(buf: &mut BytesMut, snapshot: &SnapshotRef) {
    put_str(buf, snapshot.host());
    put_str(buf, snapshot.subvolume());
    put_ts(buf, Some(snapshot.taken()));
    put_ts(buf, snapshot.parent_taken());
}

fn snapshot_len(snapshot: &SnapshotRef) -> usize {
    str_len(snapshot.host())
        + str_len(snapshot.subvolume())
        + ts_len(Some(snapshot.taken()))
        + ts_len(snapshot.parent_taken())
}

fn get_snapshot(payload: &mut Bytes) -> Result<SnapshotRef> {
    let host = get_str(payload, "snapshot host")?;
    let subvolume = get_str(payload, "snapshot subvolume")?;
    let taken = get_ts(payload, "snapshot timestamp")?.context("Snapshot timestamp missing")?;
    let parent = get_ts(payload, "parent timestamp")?;
    if let Some(parent) = parent {
        if parent >= taken {
            anyhow::bail!("Parent timestamp is not older than the snapshot");
        }
    }
    Ok(SnapshotRef::new(host, subvolume, taken).with_parent_taken(parent))
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

/// What the initiator asks for. Push and pull name a volume; recover also
/// names the capture to fetch back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Host owning the volume.
    pub host: String,
    pub subvolume: String,
    pub taken: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct Hello {
    pub version: u16,
    pub flags: HelloFlags,
    pub node_name: String,
    pub nonce: Nonce,
    pub request: TransferRequest,
}

impl Hello {
    pub fn new(
        direction: Direction,
        force_full: bool,
        node_name: impl Into<String>,
        nonce: Nonce,
        request: TransferRequest,
    ) -> Self {
        let mut flags = match direction {
            Direction::Push => HelloFlags::empty(),
            Direction::Pull => HelloFlags::PULL,
            Direction::Recover => HelloFlags::RECOVER,
        };
        if force_full {
            flags |= HelloFlags::FORCE_FULL;
        }
        Self {
            version: PROTOCOL_VERSION,
            flags,
            node_name: node_name.into(),
            nonce,
            request,
        }
    }

    pub fn direction(&self) -> Result<Direction> {
        let pull = self.flags.contains(HelloFlags::PULL);
        let recover = self.flags.contains(HelloFlags::RECOVER);
        match (pull, recover) {
            (false, false) => Ok(Direction::Push),
            (true, false) => Ok(Direction::Pull),
            (false, true) => Ok(Direction::Recover),
            (true, true) => anyhow::bail!("Hello requests both pull and recover"),
        }
    }

    pub fn force_full(&self) -> bool {
        self.flags.contains(HelloFlags::FORCE_FULL)
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = 2
            + 4
            + str_len(&self.node_name)
            + NONCE_LEN
            + str_len(&self.request.host)
            + str_len(&self.request.subvolume)
            + ts_len(self.request.taken);
        let mut buf = start_frame(MessageType::Hello, payload_len);

        buf.put_u16(self.version);
        buf.put_u32(self.flags.bits());
        put_str(&mut buf, &self.node_name);
        buf.put_slice(&self.nonce);
        put_str(&mut buf, &self.request.host);
        put_str(&mut buf, &self.request.subvolume);
        put_ts(&mut buf, self.request.taken);

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 6 {
            anyhow::bail!("Hello payload too short");
        }
        let version = payload.get_u16();
        let flags = HelloFlags::from_bits_truncate(payload.get_u32());
        let node_name = get_str(&mut payload, "Hello node name")?;
        let nonce = get_array::<NONCE_LEN>(&mut payload, "Hello nonce")?;
        let host = get_str(&mut payload, "Hello request host")?;
        let subvolume = get_str(&mut payload, "Hello request subvolume")?;
        let taken = get_ts(&mut payload, "Hello request timestamp")?;

        Ok(Self {
            version,
            flags,
            node_name,
            nonce,
            request: TransferRequest {
                host,
                subvolume,
                taken,
            },
        })
    }
}

// =============================================================================
// CHALLENGE (0x02)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Challenge {
    pub nonce: Nonce,
    /// Responder's proof of key possession.
    pub proof: Tag,
}

impl Challenge {
    pub fn encode(&self) -> Bytes {
        let mut buf = start_frame(MessageType::Challenge, NONCE_LEN + TAG_LEN);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.proof);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let nonce = get_array::<NONCE_LEN>(&mut payload, "Challenge nonce")?;
        let proof = get_array::<TAG_LEN>(&mut payload, "Challenge proof")?;
        Ok(Self { nonce, proof })
    }
}

// =============================================================================
// RESPONSE (0x03)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Response {
    pub proof: Tag,
}

impl Response {
    pub fn encode(&self) -> Bytes {
        let mut buf = start_frame(MessageType::Response, TAG_LEN);
        buf.put_slice(&self.proof);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let proof = get_array::<TAG_LEN>(&mut payload, "Response proof")?;
        Ok(Self { proof })
    }
}

// =============================================================================
// AUTH_OK (0x04)
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct AuthOk;

impl AuthOk {
    pub fn encode(&self) -> Bytes {
        start_frame(MessageType::AuthOk, 0).freeze()
    }
}

// =============================================================================
// LABEL (0x05)
// =============================================================================

/// Transfer label, sent by the source before any payload byte. Carries the
/// snapshot (with its parent label) and the payload stream nonce.
#[derive(Debug, Clone)]
pub struct Label {
    pub snapshot: SnapshotRef,
    pub stream_nonce: [u8; STREAM_NONCE_LEN],
    pub mac: Tag,
}

impl Label {
    pub fn signed(
        snapshot: SnapshotRef,
        stream_nonce: [u8; STREAM_NONCE_LEN],
        keys: &SessionKeys,
    ) -> Self {
        let body = Self::body(&snapshot, &stream_nonce);
        let mac = keys.control_tag(MessageType::Label, &body);
        Self {
            snapshot,
            stream_nonce,
            mac,
        }
    }

    fn body(snapshot: &SnapshotRef, stream_nonce: &[u8; STREAM_NONCE_LEN]) -> Bytes {
        let mut buf = BytesMut::with_capacity(snapshot_len(snapshot) + STREAM_NONCE_LEN);
        put_snapshot(&mut buf, snapshot);
        buf.put_slice(stream_nonce);
        buf.freeze()
    }

    /// Authenticated body bytes, also bound by the matching LabelAck.
    pub fn signed_body(&self) -> Bytes {
        Self::body(&self.snapshot, &self.stream_nonce)
    }

    pub fn verify(&self, keys: &SessionKeys) -> bool {
        keys.verify_control(MessageType::Label, &self.signed_body(), &self.mac)
    }

    pub fn encode(&self) -> Bytes {
        let body = self.signed_body();
        let mut buf = start_frame(MessageType::Label, body.len() + TAG_LEN);
        buf.put_slice(&body);
        buf.put_slice(&self.mac);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let snapshot = get_snapshot(&mut payload)?;
        let stream_nonce = get_array::<STREAM_NONCE_LEN>(&mut payload, "Label stream nonce")?;
        let mac = get_array::<TAG_LEN>(&mut payload, "Label mac")?;
        Ok(Self {
            snapshot,
            stream_nonce,
            mac,
        })
    }
}

// =============================================================================
// LABEL_ACK (0x06)
// =============================================================================

/// Destination accepted the label and staged an import.
#[derive(Debug, Clone)]
pub struct LabelAck {
    pub mac: Tag,
}

impl LabelAck {
    pub fn signed(label: &Label, keys: &SessionKeys) -> Self {
        Self {
            mac: keys.control_tag(MessageType::LabelAck, &label.signed_body()),
        }
    }

    pub fn verify(&self, label: &Label, keys: &SessionKeys) -> bool {
        keys.verify_control(MessageType::LabelAck, &label.signed_body(), &self.mac)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = start_frame(MessageType::LabelAck, TAG_LEN);
        buf.put_slice(&self.mac);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let mac = get_array::<TAG_LEN>(&mut payload, "LabelAck mac")?;
        Ok(Self { mac })
    }
}

// =============================================================================
// DATA (0x07) / DATA_END (0x08)
// =============================================================================

/// One encrypted payload segment.
#[derive(Debug, Clone)]
pub struct Data {
    pub segment: Bytes,
}

impl Data {
    pub fn encode(&self) -> Bytes {
        let mut buf = start_frame(MessageType::Data, self.segment.len());
        buf.put_slice(&self.segment);
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        Ok(Self { segment: payload })
    }
}

/// Final encrypted segment, sealed with the last-block flag. May encrypt an
/// empty plaintext.
#[derive(Debug, Clone)]
pub struct DataEnd {
    pub segment: Bytes,
}

impl DataEnd {
    pub fn encode(&self) -> Bytes {
        let mut buf = start_frame(MessageType::DataEnd, self.segment.len());
        buf.put_slice(&self.segment);
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        Ok(Self { segment: payload })
    }
}

// =============================================================================
// COMPLETE (0x09)
// =============================================================================

/// Receiver's verdict: payload received, decrypted, verified and committed.
#[derive(Debug, Clone)]
pub struct Complete {
    pub bytes: u64,
    pub digest: [u8; 32],
    pub mac: Tag,
}

impl Complete {
    pub fn signed(bytes: u64, digest: [u8; 32], keys: &SessionKeys) -> Self {
        let mac = keys.control_tag(MessageType::Complete, &Self::body(bytes, &digest));
        Self { bytes, digest, mac }
    }

    fn body(bytes: u64, digest: &[u8; 32]) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + 32);
        buf.put_u64(bytes);
        buf.put_slice(digest);
        buf.freeze()
    }

    pub fn verify(&self, keys: &SessionKeys) -> bool {
        keys.verify_control(
            MessageType::Complete,
            &Self::body(self.bytes, &self.digest),
            &self.mac,
        )
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = start_frame(MessageType::Complete, 8 + 32 + TAG_LEN);
        buf.put_u64(self.bytes);
        buf.put_slice(&self.digest);
        buf.put_slice(&self.mac);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 8 {
            anyhow::bail!("Complete payload too short");
        }
        let bytes = payload.get_u64();
        let digest = get_array::<32>(&mut payload, "Complete digest")?;
        let mac = get_array::<TAG_LEN>(&mut payload, "Complete mac")?;
        Ok(Self { bytes, digest, mac })
    }
}

// =============================================================================
// ABORT (0x0A)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Abort {
    pub code: AbortCode,
    pub message: String,
}

impl Abort {
    pub fn new(code: AbortCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = start_frame(MessageType::Abort, 2 + str_len(&self.message));
        buf.put_u16(self.code as u16);
        put_str(&mut buf, &self.message);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            anyhow::bail!("Abort payload too short");
        }
        let raw = payload.get_u16();
        let code = AbortCode::from_u16(raw)
            .with_context(|| format!("Unknown abort code {}", raw))?;
        let message = get_str(&mut payload, "Abort message")?;
        Ok(Self { code, message })
    }
}

// =============================================================================
// UP_TO_DATE (0x0B)
// =============================================================================

/// Nothing to transfer. Sent by the source instead of a label when the
/// recorded lineage already matches its latest capture, or by the
/// destination in reply to a label naming a capture it already holds.
#[derive(Debug, Clone)]
pub struct UpToDate {
    pub mac: Tag,
}

impl UpToDate {
    /// Source side: no label follows.
    pub fn signed(keys: &SessionKeys) -> Self {
        Self {
            mac: keys.control_tag(MessageType::UpToDate, &[]),
        }
    }

    pub fn verify(&self, keys: &SessionKeys) -> bool {
        keys.verify_control(MessageType::UpToDate, &[], &self.mac)
    }

    /// Destination side: bound to the label it answers.
    pub fn held(label: &Label, keys: &SessionKeys) -> Self {
        Self {
            mac: keys.control_tag(MessageType::UpToDate, &label.signed_body()),
        }
    }

    pub fn verify_held(&self, label: &Label, keys: &SessionKeys) -> bool {
        keys.verify_control(MessageType::UpToDate, &label.signed_body(), &self.mac)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = start_frame(MessageType::UpToDate, TAG_LEN);
        buf.put_slice(&self.mac);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let mac = get_array::<TAG_LEN>(&mut payload, "UpToDate mac")?;
        Ok(Self { mac })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await.context("Failed to read frame length")?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        anyhow::bail!(
            "Frame size {} exceeds maximum allowed size {}",
            len,
            MAX_FRAME_SIZE
        );
    }

    let msg_type = r.read_u8().await.context("Failed to read message type")?;
    let msg_type = MessageType::from_u8(msg_type).context("Unknown message type")?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("Failed to read frame payload")?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.context("Failed to write frame")?;
    w.flush().await.context("Failed to flush frame")?;
    Ok(())
}

// =============================================================================
// Version Negotiation
// =============================================================================

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    /// Version is supported
    Supported(u16),
    /// Version is too old (client needs upgrade)
    TooOld { client: u16, min_supported: u16 },
    /// Version is too new (server needs upgrade)
    TooNew { client: u16, max_supported: u16 },
}

/// Check if a client protocol version is supported.
pub fn negotiate_version(client_version: u16) -> VersionNegotiationResult {
    if client_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            client: client_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if client_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            client: client_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(client_version)
    }
}

// =============================================================================
// Tests
// =============================================================================
