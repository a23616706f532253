use crate::errors::BackendError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed pkt-line: {0}")]
    Framing(String),

    #[error("invalid pack: {0}")]
    InvalidPack(String),

    #[error("pack checksum mismatch (expected {expected}, computed {computed})")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("delta base {0} not found")]
    DeltaBaseNotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
