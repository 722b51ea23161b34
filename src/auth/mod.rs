//! Peer authentication and authorization.
//!
//! - [`kdf`]: passphrase stretching into per-remote [`SharedKey`]s
//! - [`secrets`]: the [`SecretStore`] with per-handshake challenge nonces
//! - [`handshake`]: the mutual challenge-response [`Authenticator`]
//! - [`access`]: what an authenticated remote may request

pub mod access;
pub mod handshake;
pub mod kdf;
pub mod secrets;

pub use access::{AccessPolicy, RemoteAccess};
pub use handshake::{AuthenticatedPeer, Authenticator, SessionKeys};
pub use kdf::{Argon2idKdf, KdfParams, KeyDerivation, SharedKey};
pub use secrets::{SecretStore, MAX_OUTSTANDING_CHALLENGES};
