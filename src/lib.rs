//! One-shot artifact sharing over short numeric codes.
//!
//! A sender uploads one or more files; the service stores them locally,
//! allocates a short numeric invite code and starts a one-shot loopback
//! listener for it. Whoever presents the code first gets the bytes streamed
//! back, after which the code is dead. Nothing survives a restart.

pub mod broker;
pub mod config;
pub mod error;
pub mod http_share;
pub mod ingest;
pub mod multipart;
pub mod transfer;
