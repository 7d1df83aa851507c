//! Typed error surface returned by every `loopstore` operation.

use thiserror::Error;

/// Error taxonomy for the blob store, per the error surface enumerated for
/// the excluded HTTP layer: every operation returns one of these variants.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid fingerprint: {0}")]
    InvalidHash(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob already exists: {fingerprint}")]
    AlreadyExists { fingerprint: String },

    #[error("loop device limit reached ({count} attached)")]
    LoopDeviceLimit { count: u32 },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("I/O failure: {0}")]
    IoFailure(#[source] anyhow::Error),
}

impl StoreError {
    pub fn io<E: Into<anyhow::Error>>(err: E) -> Self {
        StoreError::IoFailure(err.into())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            // Callers that have a more specific fingerprint context map this
            // themselves; this blanket conversion only covers generic I/O.
            return StoreError::IoFailure(err.into());
        }
        StoreError::IoFailure(err.into())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
