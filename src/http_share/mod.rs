//! HTTP surface for one-shot artifact sharing
//!
//! Wires upload, download and share-link endpoints to the core pipeline.

pub mod server;

pub use server::{AppState, ShareRequest, ShareResponse, UploadResponse, create_router, start_http_server};
