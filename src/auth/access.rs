//! Per-remote authorization of transfer requests.
//!
//! Authentication only proves who the peer is. What it may do is decided
//! here, on the responder, from the configured lists.

use std::collections::{HashMap, HashSet};

use crate::streaming::channel::Direction;
use crate::streaming::protocol::TransferRequest;

/// What one remote may ask of this node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteAccess {
    /// Subvolumes of the remote it may push here.
    pub accept_push: HashSet<String>,
    /// Subvolumes of this node the remote may pull.
    pub allow_pull: HashSet<String>,
    /// Whether the remote may fetch back its own backups.
    pub allow_recover: bool,
}

impl RemoteAccess {
    pub fn accept_push(mut self, subvolume: impl Into<String>) -> Self {
        self.accept_push.insert(subvolume.into());
        self
    }

    pub fn allow_pull(mut self, subvolume: impl Into<String>) -> Self {
        self.allow_pull.insert(subvolume.into());
        self
    }

    pub fn allow_recover(mut self) -> Self {
        self.allow_recover = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    remotes: HashMap<String, RemoteAccess>,
}

impl AccessPolicy {
    pub fn insert(&mut self, remote: impl Into<String>, access: RemoteAccess) {
        self.remotes.insert(remote.into(), access);
    }

    pub fn with_remote(mut self, remote: impl Into<String>, access: RemoteAccess) -> Self {
        self.insert(remote, access);
        self
    }

    /// Whether `remote` may run `direction` for `request` against the node
    /// named `local_node`.
    ///
    /// Pushes and recoveries only ever concern the remote's own volumes;
    /// pulls only concern volumes of this node.
    pub fn permits(
        &self,
        local_node: &str,
        remote: &str,
        direction: Direction,
        request: &TransferRequest,
    ) -> bool {
        let Some(access) = self.remotes.get(remote) else {
            return false;
        };
        match direction {
            Direction::Push => {
                request.host == remote && access.accept_push.contains(&request.subvolume)
            }
            Direction::Pull => {
                request.host == local_node && access.allow_pull.contains(&request.subvolume)
            }
            Direction::Recover => {
                request.host == remote && access.allow_recover && request.taken.is_some()
            }
        }
    }
}
