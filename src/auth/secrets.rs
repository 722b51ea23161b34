//! Secret Store: per-remote shared keys and outstanding challenge nonces.
//!
//! Every handshake gets its own nonce slot, so concurrent handshakes from the
//! same remote never race on a shared "current nonce". A slot is consumed by
//! the first redemption attempt, successful or not.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::debug;

use super::kdf::SharedKey;

/// Challenge nonce length.
pub const NONCE_LEN: usize = 32;

/// Upper bound on unredeemed challenges per remote.
pub const MAX_OUTSTANDING_CHALLENGES: usize = 16;

pub type Nonce = [u8; NONCE_LEN];

/// Fresh random nonce.
pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Result of redeeming a challenge nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redemption {
    /// Issued to this remote, unused and not expired.
    Valid,
    /// Issued, but older than the challenge lifetime.
    Expired,
    /// Never issued to this remote or already consumed.
    Unknown,
}

/// A challenge issued to a peer claiming some identity.
#[derive(Debug, Clone)]
pub struct IssuedChallenge {
    pub nonce: Nonce,
    /// Key to compute the responder proof with. A decoy for unknown remotes.
    pub key: SharedKey,
    /// Whether the claimed identity is configured.
    pub known: bool,
}

#[derive(Debug)]
struct RemoteSecret {
    key: SharedKey,
    outstanding: Mutex<HashMap<Nonce, Instant>>,
}

impl RemoteSecret {
    fn new(key: SharedKey) -> Self {
        Self {
            key,
            outstanding: Mutex::new(HashMap::new()),
        }
    }
}

/// Owned store passed by handle into every session.
#[derive(Debug)]
pub struct SecretStore {
    remotes: HashMap<String, RemoteSecret>,
    decoy: SharedKey,
    challenge_ttl: Duration,
}

impl SecretStore {
    pub fn new(challenge_ttl: Duration) -> Self {
        Self {
            remotes: HashMap::new(),
            decoy: SharedKey::random(),
            challenge_ttl,
        }
    }

    /// Register a remote's derived key. Replaces any previous key.
    pub fn insert(&mut self, remote: impl Into<String>, key: SharedKey) {
        self.remotes.insert(remote.into(), RemoteSecret::new(key));
    }

    pub fn with_remote(mut self, remote: impl Into<String>, key: SharedKey) -> Self {
        self.insert(remote, key);
        self
    }

    pub fn contains(&self, remote: &str) -> bool {
        self.remotes.contains_key(remote)
    }

    pub fn key(&self, remote: &str) -> Option<&SharedKey> {
        self.remotes.get(remote).map(|r| &r.key)
    }

    pub fn challenge_ttl(&self) -> Duration {
        self.challenge_ttl
    }

    /// Issue a fresh nonce for one handshake with `remote`.
    ///
    /// Unknown remotes get a decoy key and an untracked nonce, so the
    /// exchange looks the same to the peer until the final verdict.
    pub fn issue_challenge(&self, remote: &str) -> IssuedChallenge {
        let nonce = generate_nonce();
        let Some(secret) = self.remotes.get(remote) else {
            return IssuedChallenge {
                nonce,
                key: self.decoy.clone(),
                known: false,
            };
        };

        let now = Instant::now();
        let mut outstanding = lock(&secret.outstanding);
        outstanding.retain(|_, issued| now.duration_since(*issued) < self.challenge_ttl);
        if outstanding.len() >= MAX_OUTSTANDING_CHALLENGES {
            // Evict the oldest challenge; its handshake will fail.
            if let Some(oldest) = outstanding
                .iter()
                .min_by_key(|(_, issued)| **issued)
                .map(|(nonce, _)| *nonce)
            {
                outstanding.remove(&oldest);
                debug!(remote, "evicted oldest outstanding challenge");
            }
        }
        outstanding.insert(nonce, now);

        IssuedChallenge {
            nonce,
            key: secret.key.clone(),
            known: true,
        }
    }

    /// Consume a nonce. It is removed whatever the outcome.
    pub fn redeem(&self, remote: &str, nonce: &Nonce) -> Redemption {
        let Some(secret) = self.remotes.get(remote) else {
            return Redemption::Unknown;
        };
        match lock(&secret.outstanding).remove(nonce) {
            Some(issued) if issued.elapsed() < self.challenge_ttl => Redemption::Valid,
            Some(_) => Redemption::Expired,
            None => Redemption::Unknown,
        }
    }

    /// Number of unredeemed challenges for `remote`.
    pub fn outstanding(&self, remote: &str) -> usize {
        self.remotes
            .get(remote)
            .map_or(0, |r| lock(&r.outstanding).len())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // The guarded maps stay consistent even if a holder panicked.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SecretStore {
        SecretStore::new(Duration::from_secs(30)).with_remote("backup01", SharedKey::random())
    }

    #[test]
    fn test_nonce_redeemed_once() {
        let store = store();
        let issued = store.issue_challenge("backup01");
        assert!(issued.known);
        assert_eq!(store.redeem("backup01", &issued.nonce), Redemption::Valid);
        assert_eq!(store.redeem("backup01", &issued.nonce), Redemption::Unknown);
    }

    #[test]
    fn test_concurrent_challenges_have_own_slots() {
        let store = store();
        let a = store.issue_challenge("backup01");
        let b = store.issue_challenge("backup01");
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(store.outstanding("backup01"), 2);
        assert_eq!(store.redeem("backup01", &b.nonce), Redemption::Valid);
        assert_eq!(store.redeem("backup01", &a.nonce), Redemption::Valid);
    }

    #[test]
    fn test_nonce_bound_to_remote() {
        let store = store().with_remote("backup02", SharedKey::random());
        let issued = store.issue_challenge("backup01");
        assert_eq!(store.redeem("backup02", &issued.nonce), Redemption::Unknown);
        assert_eq!(store.redeem("backup01", &issued.nonce), Redemption::Valid);
    }

    #[test]
    fn test_expired_challenge() {
        let store = SecretStore::new(Duration::ZERO).with_remote("backup01", SharedKey::random());
        let issued = store.issue_challenge("backup01");
        assert_ne!(store.redeem("backup01", &issued.nonce), Redemption::Valid);
    }

    #[test]
    fn test_unknown_remote_gets_decoy() {
        let store = store();
        let issued = store.issue_challenge("intruder");
        assert!(!issued.known);
        assert_eq!(store.outstanding("intruder"), 0);
        assert_eq!(store.redeem("intruder", &issued.nonce), Redemption::Unknown);
    }

    #[test]
    fn test_outstanding_is_bounded() {
        let store = store();
        let first = store.issue_challenge("backup01");
        std::thread::sleep(Duration::from_millis(2));
        for _ in 0..MAX_OUTSTANDING_CHALLENGES {
            store.issue_challenge("backup01");
        }
        assert_eq!(store.outstanding("backup01"), MAX_OUTSTANDING_CHALLENGES);
        assert_eq!(store.redeem("backup01", &first.nonce), Redemption::Unknown);
    }
}
