//! snapvault: decentralized, end-to-end encrypted snapshot backup.
//!
//! Nodes replicate read-only filesystem captures to each other over one TCP
//! connection per transfer. Either end may open the connection (push or
//! pull), so hosts behind one-way firewalls can still be backed up.
//!
//! - [`auth`]: key derivation, challenge nonces, mutual handshake
//! - [`lineage`]: which capture each remote is known to hold
//! - [`streaming`]: wire protocol and the Transfer Session state machine
//! - [`server`] / [`sync`]: responder and initiator dispatch
//! - [`snapshot`]: the snapshot store collaborator

pub mod auth;
pub mod config;
pub mod error;
pub mod lineage;
pub mod logging;
pub mod server;
pub mod snapshot;
pub mod streaming;
pub mod sync;
pub mod transport;

pub use error::{Error, Result};
