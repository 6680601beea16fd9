//! Error taxonomy for the share pipeline.
//!
//! Retrieval callers need to tell "never existed" apart from "existed but
//! failed mid-stream", so the transfer errors keep distinct kinds instead of
//! collapsing into one opaque failure.

use std::time::Duration;
use thiserror::Error;

/// Failure while decoding a multipart request body.
///
/// Any decode failure aborts the whole submission; the part index identifies
/// how far the ingestor got so it can roll back the files written so far.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("multipart stream ended before the first boundary")]
    MissingBoundary,

    #[error("multipart stream truncated in part {part_index}")]
    Truncated { part_index: usize },

    #[error("malformed header in part {part_index}: {reason}")]
    MalformedHeader { part_index: usize, reason: String },

    #[error("i/o error while decoding part {part_index}: {source}")]
    Io {
        part_index: usize,
        #[source]
        source: std::io::Error,
    },
}

impl DecodeError {
    /// Index of the part being decoded when the failure happened.
    /// 0 means the stream failed before the first part.
    pub fn part_index(&self) -> usize {
        match self {
            DecodeError::MissingBoundary => 0,
            DecodeError::Truncated { part_index }
            | DecodeError::MalformedHeader { part_index, .. }
            | DecodeError::Io { part_index, .. } => *part_index,
        }
    }
}

/// Failure while writing decoded parts to the upload directory.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("failed to store artifact: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bundle artifacts: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Failure to allocate an invite code.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no free invite code after {attempts} attempts")]
    PortExhausted { attempts: u32 },
}

/// Failure in the listener/bridge transfer path.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no artifact registered for code {code}")]
    NotRegistered { code: u16 },

    #[error("cannot bind one-shot listener on port {code}: {source}")]
    BindFailure {
        code: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("no listener reachable for code {code} within {timeout:?}")]
    ConnectTimeout { code: u16, timeout: Duration },

    #[error("transfer i/o failure for code {code}: {source}")]
    TransferIo {
        code: u16,
        #[source]
        source: std::io::Error,
    },
}
