//! The sentinel document that finalizes a backup.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compose::ComposerKind;

/// Per-block content digests of a block-diffable file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockDigests {
    pub block_size: u32,
    /// First 8 bytes of each block's blake3 hash, little-endian.
    pub digests: Vec<u64>,
}

/// What a backup knows about one regular file; read back by the classifier on
/// the next incremental run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileDescription {
    /// blake3 of the full file content, hex encoded. Empty for skipped files.
    pub fingerprint: String,
    pub size: u64,
    pub mtime: i64,
    #[serde(default)]
    pub is_incremented: bool,
    #[serde(default)]
    pub is_skipped: bool,
    #[serde(default)]
    pub was_in_base: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_digests: Option<BlockDigests>,
}

impl FileDescription {
    pub fn skipped(size: u64, mtime: i64) -> Self {
        Self {
            fingerprint: String::new(),
            size,
            mtime,
            is_incremented: false,
            is_skipped: true,
            was_in_base: false,
            block_digests: None,
        }
    }
}

/// Archive path → description, for every regular file the run saw.
pub type BundleFiles = BTreeMap<String, FileDescription>;

/// The metadata document written as the very last object of a backup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Sentinel {
    pub name: String,
    /// Backup this one was diffed against, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment_from: Option<String>,
    /// Full backup at the root of the chain, if this backup is incremental.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increment_full_name: Option<String>,
    #[serde(default)]
    pub increment_count: u32,
    pub composer: ComposerKind,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub stream_count: usize,
    #[serde(default)]
    pub files: BundleFiles,
}

impl Sentinel {
    pub fn is_incremental(&self) -> bool {
        self.increment_from.is_some()
    }

    /// Name a backup diffed against this one should record as its chain root.
    pub fn chain_root(&self) -> &str {
        self.increment_full_name.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_field_names_are_stable() {
        let now = Utc::now();
        let sentinel = Sentinel {
            name: "base_2".into(),
            increment_from: Some("base_1".into()),
            increment_full_name: Some("base_1".into()),
            increment_count: 1,
            composer: ComposerKind::AncestorCopy,
            start_time: now,
            finish_time: now,
            uncompressed_size: 10,
            compressed_size: 5,
            stream_count: 2,
            files: BundleFiles::new(),
        };
        let json = serde_json::to_value(&sentinel).unwrap();
        assert_eq!(json["IncrementFullName"], "base_1");
        assert_eq!(json["Composer"], "ancestor-copy");
        let back: Sentinel = serde_json::from_value(json).unwrap();
        assert_eq!(back, sentinel);
        assert_eq!(back.chain_root(), "base_1");
    }

    #[test]
    fn full_backup_is_its_own_root() {
        let json = r#"{"Name":"base_1","Composer":"plain","StartTime":"2026-01-01T00:00:00Z",
            "FinishTime":"2026-01-01T00:01:00Z","UncompressedSize":0,"CompressedSize":0,"StreamCount":1}"#;
        let sentinel: Sentinel = serde_json::from_str(json).unwrap();
        assert!(!sentinel.is_incremental());
        assert_eq!(sentinel.chain_root(), "base_1");
        assert!(sentinel.files.is_empty());
    }
}
