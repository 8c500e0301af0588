//! Unpacking of a single stream object into the restore target.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::common::normalize_path;
use crate::compose::{ENTRY_KIND_KEY, KIND_INCREMENT, KIND_MARKER};
use crate::error::{BackupError, Result};
use crate::fsx;
use crate::increment::apply_increment;
use crate::storage::Folder;

/// What unpacking one stream did.
#[derive(Debug, Default, Clone)]
pub(crate) struct StreamRestore {
    pub full: u64,
    pub markers: u64,
    pub increments: u64,
    pub bytes: u64,
    /// Directories to chmod once every stream of the layer is done.
    pub dir_modes: Vec<(PathBuf, u32)>,
}

/// Target path for `archive_path`, refusing anything that would escape `root`.
pub(crate) fn target_path(root: &Path, archive_path: &str) -> Result<PathBuf> {
    let rel = Path::new(archive_path);
    if rel.as_os_str().is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(BackupError::Other(format!("unsafe path '{archive_path}' in backup")));
    }
    Ok(root.join(rel))
}

fn entry_kind(entry: &mut tar::Entry<'_, impl io::Read>) -> io::Result<Option<String>> {
    let Some(exts) = entry.pax_extensions()? else { return Ok(None) };
    for ext in exts {
        let ext = ext?;
        if ext.key().ok() == Some(ENTRY_KIND_KEY) {
            return Ok(ext.value().ok().map(str::to_string));
        }
    }
    Ok(None)
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Downloads the stream at `key` and unpacks it into `root`. With `wanted`,
/// only those archive paths are written.
pub(crate) fn restore_stream(
    folder: &dyn Folder,
    key: &str,
    root: &Path,
    wanted: Option<&HashSet<String>>,
) -> Result<StreamRestore> {
    let raw = folder.get_object(key)?;
    let decoder = zstd::Decoder::new(Cursor::new(raw)).map_err(|e| BackupError::io(e, key))?;
    let mut archive = tar::Archive::new(decoder);
    let mut done = StreamRestore::default();

    for entry in archive.entries().map_err(|e| BackupError::io(e, key))? {
        let mut entry = entry.map_err(|e| BackupError::io(e, key))?;
        let path = entry.path().map_err(|e| BackupError::io(e, key))?;
        let archive_path = normalize_path(&path.to_string_lossy());
        if wanted.is_some_and(|w| !w.contains(&archive_path)) {
            continue;
        }
        let dest = target_path(root, &archive_path)?;
        let mode = entry.header().mode().unwrap_or(0o600);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| BackupError::io(e, parent))?;
        }

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                fs::create_dir_all(&dest).map_err(|e| BackupError::io(e, &dest))?;
                done.dir_modes.push((dest, mode));
            }
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(|e| BackupError::io(e, &dest))?
                    .map(|t| t.into_owned())
                    .ok_or_else(|| BackupError::Other(format!("symlink '{archive_path}' has no target")))?;
                remove_existing(&dest).map_err(|e| BackupError::io(e, &dest))?;
                fsx::symlink(&target, &dest).map_err(|e| BackupError::io(e, &dest))?;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let kind = entry_kind(&mut entry).map_err(|e| BackupError::io(e, key))?;
                match kind.as_deref() {
                    Some(KIND_MARKER) => {
                        if !dest.exists() {
                            warn!(path = %archive_path, "marker without an ancestor copy in the target");
                        }
                        done.markers += 1;
                    }
                    Some(KIND_INCREMENT) => {
                        let len = entry.size();
                        apply_increment(&mut entry, &dest, &archive_path)?;
                        fsx::set_unix_permissions(&dest, mode).map_err(|e| BackupError::io(e, &dest))?;
                        done.increments += 1;
                        done.bytes += len;
                    }
                    _ => {
                        remove_existing(&dest).map_err(|e| BackupError::io(e, &dest))?;
                        let mut out = File::create(&dest).map_err(|e| BackupError::io(e, &dest))?;
                        let n = io::copy(&mut entry, &mut out).map_err(|e| BackupError::io(e, &dest))?;
                        fsx::set_unix_permissions(&dest, mode).map_err(|e| BackupError::io(e, &dest))?;
                        done.full += 1;
                        done.bytes += n;
                    }
                }
            }
            other => debug!(path = %archive_path, entry_type = ?other, "entry type not restored"),
        }
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_paths() {
        let root = Path::new("/restore");
        assert_eq!(target_path(root, "base/1/2").unwrap(), PathBuf::from("/restore/base/1/2"));
        assert!(target_path(root, "../etc/passwd").is_err());
        assert!(target_path(root, "/etc/passwd").is_err());
        assert!(target_path(root, "").is_err());
    }
}
