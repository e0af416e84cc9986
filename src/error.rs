use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced at the crate boundary: configuration and cursor persistence.
///
/// Classification, correlation and aggregation never fail; they only decide
/// whether an input produces an event.
#[derive(Debug, Error)]
pub enum KillfeedError {
    #[error("invalid pipeline settings: {0}")]
    InvalidSettings(String),

    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KillfeedError>;
