//! # Storage Folders
//!
//! The composer, the chain resolver and the fetcher only ever talk to storage
//! through the [`Folder`] trait: whole objects addressed by `/`-separated keys.
//! Two backends ship with the crate: [`LocalFolder`] (a directory on disk) and
//! [`MemoryFolder`] (a process-local map used by tests and dry runs).

mod local;
mod memory;

pub use local::LocalFolder;
pub use memory::MemoryFolder;

use std::io::Read;
use std::path::Component;
use std::time::SystemTime;

use thiserror::Error;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("unsafe storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("I/O error on object '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write to '{0}' was rejected by the backend")]
    Rejected(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// A listed storage object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Full key of the object, relative to the folder root.
    pub key: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// Whole-object storage used for stream objects, manifests and sentinels.
pub trait Folder: Send + Sync {
    /// Reads a whole object. A missing object is [`StorageError::NotFound`].
    fn get_object(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Stores an object, replacing any previous content. Readers never observe
    /// a partially written object.
    fn put_object(&self, key: &str, content: &mut dyn Read) -> StorageResult<()>;

    /// Lists every object whose key starts with `prefix`, recursively.
    fn list_folder(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>>;

    /// Removes objects; keys that do not exist are ignored.
    fn delete_objects(&self, keys: &[String]) -> StorageResult<()>;

    fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.get_object(key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Convenience wrapper for in-memory content.
    fn put_bytes(&self, key: &str, content: &[u8]) -> StorageResult<()> {
        let mut reader = content;
        self.put_object(key, &mut reader)
    }
}

/// Reject storage keys that could escape the folder root.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    let invalid = |reason| Err(StorageError::InvalidKey { key: key.to_string(), reason });
    if key.is_empty() {
        return invalid("empty");
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return invalid("absolute path");
    }
    if key.contains('\\') {
        return invalid("contains backslash");
    }
    if std::path::Path::new(key).components().any(|c| c == Component::ParentDir) {
        return invalid("parent traversal");
    }
    Ok(())
}
