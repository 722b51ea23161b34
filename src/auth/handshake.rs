//! Mutual challenge-response handshake.
//!
//! ```text
//! initiator                                   responder
//!   Hello { name, nonce_i, request }   -->
//!                                      <--    Challenge { nonce_r, proof_r }
//!   Response { proof_i }               -->
//!                                      <--    AuthOk | Abort(AuthFailed)
//! ```
//!
//! Both proofs are HMAC-SHA256 under the shared key over role label, both
//! nonces and a digest of the Hello payload, so the request cannot be altered
//! in flight. The passphrase never crosses the wire.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::kdf::{SharedKey, KEY_LEN};
use super::secrets::{generate_nonce, Nonce, Redemption, SecretStore};
use crate::error::{AuthError, Error, TransferError};
use crate::streaming::channel::Direction;
use crate::streaming::protocol::{
    negotiate_version, read_frame, write_frame, Abort, AbortCode, AuthOk, Challenge, Hello,
    MessageType, Response, TransferRequest, VersionNegotiationResult,
};

/// HMAC-SHA256 output length.
pub const TAG_LEN: usize = 32;

pub type Tag = [u8; TAG_LEN];

type HmacSha256 = Hmac<Sha256>;

const RESPONDER_LABEL: &[u8] = b"snapvault/responder";
const INITIATOR_LABEL: &[u8] = b"snapvault/initiator";
const STREAM_LABEL: &[u8] = b"snapvault/stream";
const CONTROL_LABEL: &[u8] = b"snapvault/control";

// =============================================================================
// Proofs and session keys
// =============================================================================

fn keyed(key: &[u8; KEY_LEN]) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC takes keys of any length")
}

fn mac_over(key: &[u8; KEY_LEN], label: &[u8], parts: &[&[u8]]) -> HmacSha256 {
    let mut mac = keyed(key);
    mac.update(label);
    for part in parts {
        mac.update(part);
    }
    mac
}

fn tag(key: &[u8; KEY_LEN], label: &[u8], parts: &[&[u8]]) -> Tag {
    mac_over(key, label, parts).finalize().into_bytes().into()
}

fn verify(key: &[u8; KEY_LEN], label: &[u8], parts: &[&[u8]], expected: &[u8]) -> bool {
    mac_over(key, label, parts).verify_slice(expected).is_ok()
}

/// Digest binding a Hello payload into both proofs.
pub fn hello_digest(hello_payload: &[u8]) -> [u8; 32] {
    *blake3::hash(hello_payload).as_bytes()
}

/// Proof the responder sends with its challenge.
pub fn responder_proof(key: &SharedKey, nonce_i: &Nonce, nonce_r: &Nonce, hello: &[u8; 32]) -> Tag {
    tag(key.as_bytes(), RESPONDER_LABEL, &[nonce_i, nonce_r, hello])
}

pub fn verify_responder_proof(
    key: &SharedKey,
    nonce_i: &Nonce,
    nonce_r: &Nonce,
    hello: &[u8; 32],
    proof: &[u8],
) -> bool {
    verify(key.as_bytes(), RESPONDER_LABEL, &[nonce_i, nonce_r, hello], proof)
}

/// Proof the initiator returns.
pub fn initiator_proof(key: &SharedKey, nonce_r: &Nonce, nonce_i: &Nonce, hello: &[u8; 32]) -> Tag {
    tag(key.as_bytes(), INITIATOR_LABEL, &[nonce_r, nonce_i, hello])
}

pub fn verify_initiator_proof(
    key: &SharedKey,
    nonce_r: &Nonce,
    nonce_i: &Nonce,
    hello: &[u8; 32],
    proof: &[u8],
) -> bool {
    verify(key.as_bytes(), INITIATOR_LABEL, &[nonce_r, nonce_i, hello], proof)
}

/// Per-session keys, derived from the shared key and both nonces.
#[derive(Clone)]
pub struct SessionKeys {
    stream: [u8; 32],
    control: [u8; 32],
}

impl SessionKeys {
    pub fn derive(key: &SharedKey, nonce_r: &Nonce, nonce_i: &Nonce) -> Self {
        Self {
            stream: tag(key.as_bytes(), STREAM_LABEL, &[nonce_r, nonce_i]),
            control: tag(key.as_bytes(), CONTROL_LABEL, &[nonce_r, nonce_i]),
        }
    }

    /// Payload cipher key.
    pub fn stream_key(&self) -> &[u8; 32] {
        &self.stream
    }

    /// Tag for a post-handshake control frame body.
    pub fn control_tag(&self, msg_type: MessageType, body: &[u8]) -> Tag {
        tag(&self.control, &[msg_type as u8], &[body])
    }

    pub fn verify_control(&self, msg_type: MessageType, body: &[u8], expected: &[u8]) -> bool {
        verify(&self.control, &[msg_type as u8], &[body], expected)
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

// =============================================================================
// Authenticator
// =============================================================================

/// Outcome of a successful handshake.
#[derive(Debug)]
pub struct AuthenticatedPeer {
    pub remote: String,
    pub hello: Hello,
    pub keys: SessionKeys,
}

impl AuthenticatedPeer {
    pub fn direction(&self) -> Direction {
        // Validated during the handshake.
        self.hello.direction().unwrap_or(Direction::Push)
    }
}

/// Runs handshakes against the shared [`SecretStore`].
#[derive(Debug, Clone)]
pub struct Authenticator {
    secrets: Arc<SecretStore>,
    timeout: Duration,
}

impl Authenticator {
    pub fn new(secrets: Arc<SecretStore>, timeout: Duration) -> Self {
        Self { secrets, timeout }
    }

    pub fn secrets(&self) -> &Arc<SecretStore> {
        &self.secrets
    }

    /// Authenticate to `remote` as `local_name` and submit `request`.
    pub async fn initiate<S>(
        &self,
        io: &mut S,
        local_name: &str,
        remote: &str,
        direction: Direction,
        force_full: bool,
        request: TransferRequest,
    ) -> Result<AuthenticatedPeer, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let key = self
            .secrets
            .key(remote)
            .cloned()
            .ok_or(AuthError::UnknownRemote)?;
        let hello = Hello::new(direction, force_full, local_name, generate_nonce(), request);

        let outcome =
            tokio::time::timeout(self.timeout, initiate_inner(io, &key, remote, hello)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(AuthError::Timeout.into()),
        }
    }

    /// Authenticate an inbound peer.
    pub async fn respond<S>(&self, io: &mut S) -> Result<AuthenticatedPeer, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let outcome = tokio::time::timeout(self.timeout, respond_inner(io, &self.secrets)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                reject(io, AbortCode::AuthFailed, AUTH_FAILED).await;
                Err(AuthError::Timeout.into())
            }
        }
    }
}

/// The only reason a rejected peer is ever told.
const AUTH_FAILED: &str = "authentication failed";

/// Send a best-effort Abort; the peer may already be gone.
async fn reject<S: AsyncWrite + Unpin>(io: &mut S, code: AbortCode, message: &str) {
    let _ = write_frame(io, &Abort::new(code, message).encode()).await;
}

fn wire(err: anyhow::Error) -> Error {
    TransferError::from_wire(err).into()
}

fn unexpected(msg_type: MessageType, during: &str) -> Error {
    TransferError::Protocol(format!("unexpected {:?} during {}", msg_type, during)).into()
}

/// Map an Abort received during the handshake.
fn peer_abort(payload: Bytes) -> Error {
    match Abort::decode(payload) {
        Ok(abort) if abort.code == AbortCode::AuthFailed => AuthError::Mismatch.into(),
        Ok(abort) => TransferError::PeerAbort {
            code: abort.code,
            message: abort.message,
        }
        .into(),
        Err(e) => wire(e),
    }
}

async fn initiate_inner<S>(
    io: &mut S,
    key: &SharedKey,
    remote: &str,
    hello: Hello,
) -> Result<AuthenticatedPeer, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = hello.encode();
    let digest = hello_digest(&frame[5..]);
    write_frame(io, &frame).await.map_err(wire)?;

    let challenge = match read_frame(io).await.map_err(wire)? {
        (MessageType::Challenge, payload) => Challenge::decode(payload).map_err(wire)?,
        (MessageType::Abort, payload) => return Err(peer_abort(payload)),
        (other, _) => return Err(unexpected(other, "handshake")),
    };

    if !verify_responder_proof(key, &hello.nonce, &challenge.nonce, &digest, &challenge.proof) {
        reject(io, AbortCode::AuthFailed, AUTH_FAILED).await;
        return Err(AuthError::Mismatch.into());
    }

    let proof = initiator_proof(key, &challenge.nonce, &hello.nonce, &digest);
    write_frame(io, &Response { proof }.encode())
        .await
        .map_err(wire)?;

    match read_frame(io).await.map_err(wire)? {
        (MessageType::AuthOk, _) => {}
        (MessageType::Abort, payload) => return Err(peer_abort(payload)),
        (other, _) => return Err(unexpected(other, "handshake")),
    }

    debug!(remote, "authenticated to remote");
    let keys = SessionKeys::derive(key, &challenge.nonce, &hello.nonce);
    Ok(AuthenticatedPeer {
        remote: remote.to_string(),
        hello,
        keys,
    })
}

async fn respond_inner<S>(io: &mut S, secrets: &SecretStore) -> Result<AuthenticatedPeer, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (hello, digest) = match read_frame(io).await.map_err(wire)? {
        (MessageType::Hello, payload) => {
            let digest = hello_digest(&payload);
            (Hello::decode(payload).map_err(wire)?, digest)
        }
        (other, _) => return Err(unexpected(other, "handshake")),
    };

    if let VersionNegotiationResult::TooOld { .. } | VersionNegotiationResult::TooNew { .. } =
        negotiate_version(hello.version)
    {
        let msg = format!("unsupported protocol version {}", hello.version);
        reject(io, AbortCode::Protocol, &msg).await;
        return Err(TransferError::Protocol(msg).into());
    }
    if let Err(e) = hello.direction() {
        reject(io, AbortCode::Protocol, &e.to_string()).await;
        return Err(TransferError::Protocol(e.to_string()).into());
    }

    let issued = secrets.issue_challenge(&hello.node_name);
    let proof = responder_proof(&issued.key, &hello.nonce, &issued.nonce, &digest);
    write_frame(
        io,
        &Challenge {
            nonce: issued.nonce,
            proof,
        }
        .encode(),
    )
    .await
    .map_err(wire)?;

    let response = match read_frame(io).await.map_err(wire)? {
        (MessageType::Response, payload) => Response::decode(payload).map_err(wire)?,
        // The initiator rejected our proof: it holds a different key.
        (MessageType::Abort, payload) => {
            secrets.redeem(&hello.node_name, &issued.nonce);
            return Err(match peer_abort(payload) {
                Error::Auth(_) if !issued.known => AuthError::UnknownRemote.into(),
                other => other,
            });
        }
        (other, _) => {
            secrets.redeem(&hello.node_name, &issued.nonce);
            return Err(unexpected(other, "handshake"));
        }
    };

    let redemption = secrets.redeem(&hello.node_name, &issued.nonce);
    let proof_ok = verify_initiator_proof(
        &issued.key,
        &issued.nonce,
        &hello.nonce,
        &digest,
        &response.proof,
    );

    let verdict = if !issued.known {
        Err(AuthError::UnknownRemote)
    } else {
        match redemption {
            Redemption::Valid if proof_ok => Ok(()),
            Redemption::Valid | Redemption::Unknown => Err(AuthError::Mismatch),
            Redemption::Expired => Err(AuthError::Timeout),
        }
    };

    if let Err(reason) = verdict {
        reject(io, AbortCode::AuthFailed, AUTH_FAILED).await;
        return Err(reason.into());
    }

    write_frame(io, &AuthOk.encode()).await.map_err(wire)?;
    debug!(remote = %hello.node_name, "authenticated peer");

    let keys = SessionKeys::derive(&issued.key, &issued.nonce, &hello.nonce);
    Ok(AuthenticatedPeer {
        remote: hello.node_name.clone(),
        hello,
        keys,
    })
}
