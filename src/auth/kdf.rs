//! Passphrase stretching.
//!
//! Keys are derived once when the configuration is loaded; the handshake only
//! ever sees the fixed-length [`SharedKey`]. Swapping the derivation function
//! therefore never changes the wire protocol.

use std::fmt;

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Derived key length in bytes.
pub const KEY_LEN: usize = 32;

/// Salt length used by `derive-key`.
pub const SALT_LEN: usize = 16;

/// A key shared with exactly one remote.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; KEY_LEN]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a hex-encoded key as written by `derive-key`.
    pub fn from_hex(s: &str) -> Result<Self, ConfigError> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| ConfigError::Invalid(format!("key is not valid hex: {}", e)))?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            ConfigError::Invalid(format!("key must be {} bytes, got {}", KEY_LEN, v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Random key, used as decoy for unknown remotes.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// Stretches a low-entropy passphrase into a [`SharedKey`].
pub trait KeyDerivation: Send + Sync {
    /// Identifier shown in diagnostics.
    fn name(&self) -> &'static str;

    fn derive(&self, passphrase: &[u8], salt: &[u8]) -> Result<SharedKey, ConfigError>;
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 256 * 1024,
            iterations: 4,
            parallelism: 4,
        }
    }
}

/// Argon2id (v0x13) with configurable cost.
#[derive(Debug, Clone, Copy, Default)]
pub struct Argon2idKdf {
    params: KdfParams,
}

impl Argon2idKdf {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }
}

impl KeyDerivation for Argon2idKdf {
    fn name(&self) -> &'static str {
        "argon2id"
    }

    fn derive(&self, passphrase: &[u8], salt: &[u8]) -> Result<SharedKey, ConfigError> {
        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| ConfigError::KeyDerivation(e.to_string()))?;

        let mut okm = [0u8; KEY_LEN];
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(passphrase, salt, &mut okm)
            .map_err(|e| ConfigError::KeyDerivation(e.to_string()))?;
        Ok(SharedKey(okm))
    }
}

/// Random salt for a new shared secret.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
