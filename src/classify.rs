//! # File Classification
//!
//! Decides, per regular file, whether the ancestor backup already holds its
//! bytes (`was_in_base`), whether only changed blocks need storing
//! (`is_incremented`), or whether the whole file is archived.

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backup::{FileDescription, Sentinel};
use crate::common::FileMetadata;
use crate::compose::ComposeFileInfo;
use crate::config::PathRules;
use crate::increment::scan_blocks;

/// Result of classifying one file.
#[derive(Debug)]
pub enum Classification {
    Ready(ComposeFileInfo),
    /// The file cannot be backed up in this run (vanished, unreadable, no
    /// longer a regular file). Never fatal.
    Unavailable { archive_path: String, reason: String },
}

pub struct FileClassifier {
    ancestor: Option<Arc<Sentinel>>,
    rules: PathRules,
    block_size: u32,
    verify_fingerprints: bool,
}

impl FileClassifier {
    pub fn new(ancestor: Option<Arc<Sentinel>>, rules: PathRules, block_size: u32, verify_fingerprints: bool) -> Self {
        Self { ancestor, rules, block_size, verify_fingerprints }
    }

    pub fn has_ancestor(&self) -> bool {
        self.ancestor.is_some()
    }

    fn unavailable(archive_path: &str, reason: String) -> Classification {
        warn!(path = %archive_path, %reason, "file excluded from this backup");
        Classification::Unavailable { archive_path: archive_path.to_string(), reason }
    }

    pub fn classify(&self, abs_path: &Path, archive_path: &str) -> Classification {
        let fs_meta = match fs::symlink_metadata(abs_path) {
            Ok(m) => m,
            Err(e) => return Self::unavailable(archive_path, e.to_string()),
        };
        let meta = FileMetadata::from_fs(&fs_meta);
        if !meta.is_regular() {
            return Self::unavailable(archive_path, "no longer a regular file".into());
        }

        let mut header = tar::Header::new_gnu();
        header.set_metadata_in_mode(&fs_meta, tar::HeaderMode::Complete);
        let mut info = ComposeFileInfo::new(abs_path.to_path_buf(), archive_path.to_string(), meta, false, false, header);

        let Some(base) = self.base_record(archive_path) else {
            return Classification::Ready(info);
        };

        if base.size == info.meta.size && base.mtime == info.meta.mtime {
            match self.same_content(abs_path, base) {
                Ok(true) => {
                    debug!(path = %archive_path, "unchanged since ancestor");
                    info.was_in_base = true;
                    info.base_description = Some(base.clone());
                    return Classification::Ready(info);
                }
                Ok(false) => {}
                Err(reason) => return Self::unavailable(archive_path, reason),
            }
        }

        let diffable_base = base
            .block_digests
            .as_ref()
            .is_some_and(|blocks| blocks.block_size == self.block_size);
        if diffable_base && self.rules.is_diffable(archive_path) {
            info.is_incremented = true;
            info.base_description = Some(base.clone());
        }
        Classification::Ready(info)
    }

    fn base_record(&self, archive_path: &str) -> Option<&FileDescription> {
        self.ancestor
            .as_ref()?
            .files
            .get(archive_path)
            .filter(|d| !d.is_skipped && !d.fingerprint.is_empty())
    }

    fn same_content(&self, abs_path: &Path, base: &FileDescription) -> Result<bool, String> {
        if !self.verify_fingerprints {
            return Ok(true);
        }
        let mut file = File::open(abs_path).map_err(|e| e.to_string())?;
        let scanned = scan_blocks(&mut file, self.block_size).map_err(|e| e.to_string())?;
        Ok(scanned.fingerprint == base.fingerprint)
    }
}
