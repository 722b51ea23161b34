//! Connection transport.
//!
//! One TCP connection per transfer attempt on a fixed well-known port.

pub mod tcp;

pub use tcp::{bind, connect, resolve, DEFAULT_PORT};
