//! One-shot transfer listener.
//!
//! `serve` binds a loopback socket on the code's port, streams the
//! registered artifact to the first peer that connects and tears everything
//! down. Whatever happens, the code is revoked on exit, so a code never
//! serves more than one transfer attempt.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use super::COPY_BUFFER_SIZE;
use crate::broker::CodeBroker;
use crate::error::TransferError;

/// Serve the artifact registered for `code` to exactly one peer.
///
/// Blocks (asynchronously) until the transfer finishes either way; callers
/// spawn it so registration can return the code immediately. Returns the
/// number of bytes sent.
pub async fn serve(broker: &CodeBroker, code: u16) -> Result<u64, TransferError> {
    let result = serve_inner(broker, code).await;
    // Unconditional revocation on every exit path: success, bind failure,
    // missing registration or a broken copy all end this code's life.
    broker.revoke(code);
    if let Err(e) = &result {
        tracing::warn!(code, error = %e, "one-shot transfer failed");
    }
    result
}

async fn serve_inner(broker: &CodeBroker, code: u16) -> Result<u64, TransferError> {
    let artifact = broker
        .lookup(code)
        .ok_or(TransferError::NotRegistered { code })?;

    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, code));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| TransferError::BindFailure { code, source })?;
    tracing::info!(code, artifact = %artifact.display(), "listening for one-shot transfer");

    let (mut peer, remote) = listener
        .accept()
        .await
        .map_err(|source| TransferError::TransferIo { code, source })?;
    // Close the listening socket right away; there is no second connection.
    drop(listener);
    tracing::info!(code, peer = %remote, "peer connected, streaming artifact");

    let file = File::open(&artifact)
        .await
        .map_err(|source| TransferError::TransferIo { code, source })?;
    let mut reader = BufReader::with_capacity(COPY_BUFFER_SIZE, file);

    let sent = tokio::io::copy_buf(&mut reader, &mut peer)
        .await
        .map_err(|source| TransferError::TransferIo { code, source })?;
    peer.shutdown()
        .await
        .map_err(|source| TransferError::TransferIo { code, source })?;

    tracing::info!(code, bytes = sent, "transfer complete");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    async fn register_temp_artifact(
        broker: &CodeBroker,
        dir: &Path,
        name: &str,
        content: &[u8],
    ) -> u16 {
        let path = dir.join(name);
        tokio::fs::write(&path, content).await.unwrap();
        broker.register(&path).unwrap()
    }

    #[tokio::test]
    async fn test_serve_unregistered_code() {
        let broker = CodeBroker::new();
        let err = serve(&broker, 50_123).await.unwrap_err();
        assert!(matches!(err, TransferError::NotRegistered { code: 50_123 }));
    }

    #[tokio::test]
    async fn test_serve_streams_file_once_then_revokes() {
        let dir = tempfile::tempdir().unwrap();
        let broker = std::sync::Arc::new(CodeBroker::new());
        let content = b"the quick brown fox".repeat(1000);
        let code = register_temp_artifact(&broker, dir.path(), "a.bin", &content).await;

        let server = {
            let broker = broker.clone();
            tokio::spawn(async move { serve(&broker, code).await })
        };

        // Give the listener a moment to bind
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let mut peer = TcpStream::connect((Ipv4Addr::LOCALHOST, code)).await.unwrap();
        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, content);

        let sent = server.await.unwrap().unwrap();
        assert_eq!(sent, content.len() as u64);

        // Consumed: the offer is gone and nothing listens anymore
        assert_eq!(broker.lookup(code), None);
        assert!(
            TcpStream::connect((Ipv4Addr::LOCALHOST, code)).await.is_err(),
            "listener socket should be closed after the first transfer"
        );
    }

    #[tokio::test]
    async fn test_bind_failure_revokes_code() {
        let dir = tempfile::tempdir().unwrap();
        let broker = CodeBroker::new();
        let code = register_temp_artifact(&broker, dir.path(), "b.bin", b"x").await;

        // Occupy the port so serve cannot bind it
        let _squatter = TcpListener::bind((Ipv4Addr::LOCALHOST, code)).await.unwrap();

        let err = serve(&broker, code).await.unwrap_err();
        assert!(matches!(err, TransferError::BindFailure { .. }));
        assert_eq!(broker.lookup(code), None);
    }

    #[tokio::test]
    async fn test_peer_disconnect_mid_copy_is_transfer_io() {
        let dir = tempfile::tempdir().unwrap();
        let broker = std::sync::Arc::new(CodeBroker::new());
        // Large enough that the copy cannot fit in socket buffers
        let content = vec![0x5Au8; 32 * 1024 * 1024];
        let code = register_temp_artifact(&broker, dir.path(), "big.bin", &content).await;

        let server = {
            let broker = broker.clone();
            tokio::spawn(async move { serve(&broker, code).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // Read a little, then drop the connection with data still in flight
        let mut peer = TcpStream::connect((Ipv4Addr::LOCALHOST, code)).await.unwrap();
        let mut small = [0u8; 1024];
        peer.read_exact(&mut small).await.unwrap();
        drop(peer);

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::TransferIo { .. }));
        // Failed transfers burn the code too
        assert_eq!(broker.lookup(code), None);
    }
}
