//! Retrieval bridge.
//!
//! Turns an inbound "give me code N" request into an outbound loopback
//! connection to the one-shot listener for N and hands the socket back so
//! the caller can relay the bytes into its response. The broker lookup here
//! is a filename hint only; whether a code is actually live is decided by
//! the listener's socket.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::TcpStream;

use super::CONNECT_TIMEOUT;
use crate::broker::CodeBroker;
use crate::error::TransferError;

/// Suggested filename when the code has no registered path to borrow from
pub const FALLBACK_FILE_NAME: &str = "download";

/// A successfully opened retrieval: the artifact bytes arrive on `stream`
/// until the listener closes it; no length is known in advance.
#[derive(Debug)]
pub struct Retrieval {
    pub file_name: String,
    pub stream: TcpStream,
}

/// Connect to the listener for `code`.
///
/// Connect failures map to [`TransferError::NotRegistered`] when the broker
/// has no offer for the code (it never existed, or was already consumed) and
/// to [`TransferError::ConnectTimeout`] when an offer exists but its listener
/// is not reachable within the bound.
pub async fn fetch(broker: &CodeBroker, code: u16) -> Result<Retrieval, TransferError> {
    let registered = broker.lookup(code);
    let file_name = registered
        .as_deref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, code));
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(code, error = %e, "connect to one-shot listener failed");
            return Err(unreachable_listener(code, registered.is_some()));
        }
        Err(_) => return Err(unreachable_listener(code, registered.is_some())),
    };

    tracing::info!(code, file_name = %file_name, "bridging retrieval to listener");
    Ok(Retrieval { file_name, stream })
}

fn unreachable_listener(code: u16, known: bool) -> TransferError {
    if known {
        TransferError::ConnectTimeout {
            code,
            timeout: CONNECT_TIMEOUT,
        }
    } else {
        TransferError::NotRegistered { code }
    }
}
