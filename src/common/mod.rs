//! Common utilities and types module.
// Shared structs and path helpers used by the classifier, composer and fetcher.

use std::fs::Metadata;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fsx;

/// What kind of filesystem object an entry describes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Regular,
    Dir,
    Symlink,
}

/// Metadata for a single file or directory entry discovered during traversal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
    pub mode: u32,
    pub mtime: i64, // Unix timestamp, seconds
    pub kind: FileKind,
}

impl FileMetadata {
    /// Build from `symlink_metadata` output so that links are not followed.
    pub fn from_fs(meta: &Metadata) -> Self {
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_dir() {
            FileKind::Dir
        } else {
            FileKind::Regular
        };
        Self {
            size: if kind == FileKind::Regular { meta.len() } else { 0 },
            mode: fsx::file_mode(meta),
            mtime: fsx::mtime_secs(meta),
            kind,
        }
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }
}

/// Normalize an archive path: forward slashes, no leading `./`, no doubled separators.
/// Example: "./base/1/1259" becomes "base/1/1259"
pub fn normalize_path(path: &str) -> String {
    let s = path.replace('\\', "/");
    let trimmed = s.strip_prefix("./").unwrap_or(&s);
    let mut res = trimmed.to_string();
    while res.contains("//") {
        res = res.replace("//", "/");
    }
    res.trim_end_matches('/').to_string()
}

/// Archive path of `path` relative to `root`, or `None` for the root itself.
pub fn archive_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some(normalize_path(&rel.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn normalize_strips_noise() {
        assert_eq!(normalize_path("./base//1/1259"), "base/1/1259");
        assert_eq!(normalize_path("global\\pg_control"), "global/pg_control");
        assert_eq!(normalize_path("pg_xact/"), "pg_xact");
    }

    #[test]
    fn archive_path_is_relative() {
        let root = PathBuf::from("/data");
        assert_eq!(archive_path(&root, Path::new("/data/base/1")).as_deref(), Some("base/1"));
        assert_eq!(archive_path(&root, Path::new("/data")), None);
        assert_eq!(archive_path(&root, Path::new("/elsewhere/x")), None);
    }
}
