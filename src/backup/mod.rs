//! # Backups in Storage
//!
//! A backup is a set of stream objects, a tar file sets manifest and a
//! sentinel, all under `basebackups_005/`. The sentinel is uploaded last, so
//! a backup without one is treated as if it did not exist.

mod sentinel;

pub use sentinel::{BlockDigests, BundleFiles, FileDescription, Sentinel};

use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use tracing::debug;

use crate::compose::TarFileSets;
use crate::error::{BackupError, Result};
use crate::storage::Folder;

pub const BASE_BACKUP_PREFIX: &str = "basebackups_005/";
pub const SENTINEL_SUFFIX: &str = "_backup_stop_sentinel.json";
pub const TAR_FILE_SETS_NAME: &str = "tar_file_sets.json";
const TAR_PARTITIONS_DIR: &str = "tar_partitions";

/// Name for a new backup started now.
pub fn new_backup_name() -> String {
    format!("base_{}", Utc::now().format("%Y%m%dT%H%M%SZ"))
}

/// Backup names become one component of a storage key and must also not
/// collide with the `LATEST` alias.
pub fn validate_backup_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name == crate::fetch::LATEST
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if bad {
        return Err(BackupError::Config(format!("invalid backup name '{name}'")));
    }
    Ok(())
}

/// Handle to one named backup in a folder.
#[derive(Clone)]
pub struct Backup {
    pub name: String,
    folder: Arc<dyn Folder>,
}

impl std::fmt::Debug for Backup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backup").field("name", &self.name).finish()
    }
}

impl Backup {
    pub fn new(folder: Arc<dyn Folder>, name: impl Into<String>) -> Self {
        Self { name: name.into(), folder }
    }

    pub fn folder(&self) -> &Arc<dyn Folder> {
        &self.folder
    }

    pub fn sentinel_key(&self) -> String {
        format!("{BASE_BACKUP_PREFIX}{}{SENTINEL_SUFFIX}", self.name)
    }

    pub fn tar_file_sets_key(&self) -> String {
        format!("{BASE_BACKUP_PREFIX}{}/{TAR_FILE_SETS_NAME}", self.name)
    }

    /// Prefix shared by every stream object of this backup.
    pub fn streams_prefix(&self) -> String {
        format!("{BASE_BACKUP_PREFIX}{}/{TAR_PARTITIONS_DIR}/", self.name)
    }

    /// Storage key of a stream given its name (e.g. `part_001.tar.zst`).
    pub fn stream_key(&self, stream_name: &str) -> String {
        format!("{}{stream_name}", self.streams_prefix())
    }

    /// Fetches and decodes the sentinel. A missing sentinel is `BackupNotFound`.
    pub fn fetch_sentinel(&self) -> Result<Sentinel> {
        let raw = self.folder.get_object(&self.sentinel_key()).map_err(|e| {
            if e.is_not_found() {
                BackupError::BackupNotFound(self.name.clone())
            } else {
                e.into()
            }
        })?;
        serde_json::from_slice(&raw).map_err(|source| BackupError::CorruptSentinel {
            name: self.name.clone(),
            source,
        })
    }

    pub fn upload_sentinel(&self, sentinel: &Sentinel) -> Result<()> {
        let raw = serde_json::to_vec_pretty(sentinel)?;
        self.folder.put_bytes(&self.sentinel_key(), &raw)?;
        debug!(backup = %self.name, "sentinel uploaded");
        Ok(())
    }

    pub fn fetch_tar_file_sets(&self) -> Result<TarFileSets> {
        let raw = self.folder.get_object(&self.tar_file_sets_key())?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn upload_tar_file_sets(&self, sets: &TarFileSets) -> Result<()> {
        let raw = serde_json::to_vec_pretty(sets)?;
        self.folder.put_bytes(&self.tar_file_sets_key(), &raw)?;
        Ok(())
    }

    /// True if a sentinel or any data object already uses this name.
    pub fn is_taken(&self) -> Result<bool> {
        if self.folder.exists(&self.sentinel_key())? {
            return Ok(true);
        }
        let prefix = format!("{BASE_BACKUP_PREFIX}{}/", self.name);
        Ok(!self.folder.list_folder(&prefix)?.is_empty())
    }

    /// Removes every object of this backup except the sentinel.
    pub fn delete_data(&self) -> Result<()> {
        let prefix = format!("{BASE_BACKUP_PREFIX}{}/", self.name);
        let keys: Vec<String> = self.folder.list_folder(&prefix)?.into_iter().map(|o| o.key).collect();
        self.folder.delete_objects(&keys)?;
        Ok(())
    }
}

/// A backup found in storage, by its sentinel object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupListing {
    pub name: String,
    pub modified: SystemTime,
}

/// Every backup with a sentinel, oldest first (sentinel modification time,
/// then name).
pub fn list_backups(folder: &dyn Folder) -> Result<Vec<BackupListing>> {
    let mut backups: Vec<BackupListing> = folder
        .list_folder(BASE_BACKUP_PREFIX)?
        .into_iter()
        .filter_map(|o| {
            let rest = o.key.strip_prefix(BASE_BACKUP_PREFIX)?;
            let name = rest.strip_suffix(SENTINEL_SUFFIX)?;
            // Sentinels live directly under the prefix.
            if name.is_empty() || name.contains('/') {
                return None;
            }
            Some(BackupListing { name: name.to_string(), modified: o.modified })
        })
        .collect();
    backups.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(backups)
}

/// Name of the most recent backup, or `None` if storage holds none.
pub fn latest_backup_name(folder: &dyn Folder) -> Result<Option<String>> {
    Ok(list_backups(folder)?.pop().map(|b| b.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryFolder;

    #[test]
    fn keys_follow_layout() {
        let folder: Arc<dyn Folder> = Arc::new(MemoryFolder::new());
        let backup = Backup::new(folder, "base_1");
        assert_eq!(backup.sentinel_key(), "basebackups_005/base_1_backup_stop_sentinel.json");
        assert_eq!(backup.stream_key("part_001.tar.zst"), "basebackups_005/base_1/tar_partitions/part_001.tar.zst");
        assert_eq!(backup.tar_file_sets_key(), "basebackups_005/base_1/tar_file_sets.json");
    }

    #[test]
    fn latest_ignores_data_objects() {
        let folder = MemoryFolder::new();
        folder.put_bytes("basebackups_005/base_a_backup_stop_sentinel.json", b"{}").unwrap();
        folder.put_bytes("basebackups_005/base_b_backup_stop_sentinel.json", b"{}").unwrap();
        folder.put_bytes("basebackups_005/base_c/tar_partitions/part_001.tar.zst", b"").unwrap();
        assert_eq!(latest_backup_name(&folder).unwrap().as_deref(), Some("base_b"));
        assert_eq!(list_backups(&folder).unwrap().len(), 2);
    }

    #[test]
    fn names_are_single_components() {
        for bad in ["", ".", "..", "a/b", "a\\b", "LATEST"] {
            assert!(matches!(validate_backup_name(bad), Err(BackupError::Config(_))), "{bad:?}");
        }
        validate_backup_name("base_20260101T000000Z").unwrap();
    }

    #[test]
    fn taken_by_sentinel_or_data() {
        let folder = Arc::new(MemoryFolder::new());
        let done = Backup::new(folder.clone(), "base_a");
        let partial = Backup::new(folder.clone(), "base_b");
        let free = Backup::new(folder.clone(), "base_bb");
        folder.put_bytes(&done.sentinel_key(), b"{}").unwrap();
        folder.put_bytes(&partial.stream_key("part_001.tar.zst"), b"").unwrap();
        assert!(done.is_taken().unwrap());
        assert!(partial.is_taken().unwrap());
        assert!(!free.is_taken().unwrap());
    }

    #[test]
    fn missing_and_corrupt_sentinels() {
        let folder = Arc::new(MemoryFolder::new());
        let backup = Backup::new(folder.clone(), "base_x");
        assert!(matches!(backup.fetch_sentinel(), Err(BackupError::BackupNotFound(_))));
        folder.put_bytes(&backup.sentinel_key(), b"not json").unwrap();
        assert!(matches!(backup.fetch_sentinel(), Err(BackupError::CorruptSentinel { .. })));
    }
}
