use std::path::PathBuf;

use thiserror::Error;

use crate::storage::StorageError;

pub type Result<T> = std::result::Result<T, BackupError>;

/// The primary error type for all operations in the `blitzbackup` crate.
///
/// Per-file problems (a file vanishing between enumeration and read) never
/// surface as a `BackupError`; they are logged and the file is excluded.
#[derive(Debug, Error)]
pub enum BackupError {
    /// An I/O error occurred while reading or writing a local file.
    /// Includes the path where the error happened.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// The storage layer failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A backup was requested by name but has no sentinel.
    #[error("backup '{0}' not found")]
    BackupNotFound(String),

    /// The sentinel exists but cannot be decoded.
    #[error("sentinel of backup '{name}' is corrupt: {source}")]
    CorruptSentinel {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// A strategy prerequisite is missing or the configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// An output stream failed; the whole run is aborted.
    #[error("stream '{stream}' failed: {reason}")]
    StreamFailed { stream: String, reason: String },

    /// The run was cancelled because another stream failed.
    #[error("composition cancelled after a stream failure")]
    Cancelled,

    /// The composer was used in a state that does not allow the call.
    #[error("composer is {0}")]
    ComposerState(&'static str),

    /// An increment body failed validation.
    #[error("invalid increment for '{path}': {reason}")]
    InvalidIncrement { path: String, reason: String },

    /// The backup chain is longer than the configured bound or loops.
    #[error("backup chain starting at '{0}' is too deep or cyclic")]
    ChainTooDeep(String),

    /// An error during serialization or deserialization of a manifest.
    #[error("serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl BackupError {
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        BackupError::Io { source, path: path.into() }
    }
}

// Generic IO error conversion that doesn't require a path
impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        BackupError::Io { source: err, path: PathBuf::new() }
    }
}
