//! One-shot loopback transfer between the registering side and the bridge.
//!
//! This module provides:
//! - A listener that serves a registered artifact to exactly one peer
//! - A bridge that dials the listener for a code and relays the bytes
//!
//! The invite code doubles as the loopback port, so no separate rendezvous
//! table is needed between the two halves.

pub mod bridge;
pub mod listener;

// Re-export public API
pub use bridge::{FALLBACK_FILE_NAME, Retrieval, fetch};
pub use listener::serve;

use std::time::Duration;

/// Bound on the bridge's connect attempt to a listener
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffer size for the artifact copy (16KB)
pub const COPY_BUFFER_SIZE: usize = 16 * 1024;
