//! # Backup Fetch
//!
//! Restores a backup into an empty directory. The chain is replayed from its
//! root: each layer's streams are unpacked in parallel, then everything the
//! layer does not list is removed, so the target ends up exactly as the
//! requested backup describes it.

mod stream;

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::backup::{latest_backup_name, list_backups, Backup, Sentinel};
use crate::common::{archive_path, normalize_path};
use crate::compose::{ComposerKind, TarFileSets};
use crate::error::{BackupError, Result};
use crate::fsx;
use crate::resolve::BackupChain;
use crate::storage::Folder;

use self::stream::{restore_stream, StreamRestore};

/// Name accepted in place of a backup name for the most recent backup.
pub const LATEST: &str = "LATEST";

/// One line of `backup-list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSummary {
    pub name: String,
    pub composer: ComposerKind,
    pub increment_from: Option<String>,
    pub increment_count: u32,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
    pub files: usize,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
}

impl From<&Sentinel> for BackupSummary {
    fn from(s: &Sentinel) -> Self {
        Self {
            name: s.name.clone(),
            composer: s.composer,
            increment_from: s.increment_from.clone(),
            increment_count: s.increment_count,
            start_time: s.start_time,
            finish_time: s.finish_time,
            files: s.files.values().filter(|d| !d.is_skipped).count(),
            uncompressed_size: s.uncompressed_size,
            compressed_size: s.compressed_size,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FetchReport {
    pub backup_name: String,
    /// Backups replayed, root first.
    pub chain: Vec<String>,
    pub full: u64,
    pub markers: u64,
    pub increments: u64,
    pub removed: u64,
    pub bytes: u64,
}

impl FetchReport {
    fn absorb(&mut self, s: &StreamRestore) {
        self.full += s.full;
        self.markers += s.markers;
        self.increments += s.increments;
        self.bytes += s.bytes;
    }
}

pub struct BackupFetcher {
    folder: Arc<dyn Folder>,
    max_chain_depth: usize,
}

impl BackupFetcher {
    pub fn new(folder: Arc<dyn Folder>, max_chain_depth: usize) -> Self {
        Self { folder, max_chain_depth }
    }

    fn resolve_name(&self, name: &str) -> Result<String> {
        if name == LATEST {
            return latest_backup_name(self.folder.as_ref())?
                .ok_or_else(|| BackupError::BackupNotFound(LATEST.to_string()));
        }
        Ok(name.to_string())
    }

    /// Restores backup `name` (or [`LATEST`]) into `target`, which must be
    /// absent or empty.
    pub fn fetch(&self, name: &str, target: &Path) -> Result<FetchReport> {
        self.restore(name, target, None)
    }

    /// Restores only `paths` (archive paths) of backup `name`. Streams that
    /// hold none of them are not downloaded.
    pub fn fetch_paths(&self, name: &str, paths: &[String], target: &Path) -> Result<FetchReport> {
        let wanted: HashSet<String> = paths.iter().map(|p| normalize_path(p)).collect();
        if wanted.is_empty() {
            return Err(BackupError::Config("no paths requested".into()));
        }
        self.restore(name, target, Some(&wanted))
    }

    fn restore(&self, name: &str, target: &Path, wanted: Option<&HashSet<String>>) -> Result<FetchReport> {
        let name = self.resolve_name(name)?;
        prepare_target(target)?;
        let chain = BackupChain::walk(self.folder.clone(), &name, self.max_chain_depth)?;

        if let (Some(wanted), Some(last)) = (wanted, chain.sentinel(&name)) {
            if let Some(missing) = wanted.iter().find(|p| !last.files.contains_key(*p)) {
                return Err(BackupError::Other(format!("path '{missing}' is not a file of backup '{name}'")));
            }
        }

        let mut report = FetchReport { backup_name: name.clone(), ..Default::default() };
        for (layer, (backup, sentinel)) in chain.iter().enumerate() {
            let sets = backup.fetch_tar_file_sets()?;
            let keys = stream_keys(&backup, sentinel, &sets, wanted);
            info!(backup = %backup.name, streams = keys.len(), "restoring layer");

            let folder = self.folder.as_ref();
            let restored: Vec<StreamRestore> = keys
                .par_iter()
                .map(|key| restore_stream(folder, key, target, wanted))
                .collect::<Result<_>>()?;
            for r in &restored {
                report.absorb(r);
                for (dir, mode) in &r.dir_modes {
                    fsx::set_unix_permissions(dir, *mode).map_err(|e| BackupError::io(e, dir))?;
                }
            }
            if layer > 0 {
                report.removed += prune(target, &sets, wanted)?;
            }
            report.chain.push(backup.name.clone());
        }

        info!(
            backup = %name,
            layers = report.chain.len(),
            full = report.full,
            markers = report.markers,
            increments = report.increments,
            "backup restored"
        );
        Ok(report)
    }

    /// Every backup with a readable sentinel, oldest finish time first.
    pub fn list(&self) -> Result<Vec<BackupSummary>> {
        let mut out = Vec::new();
        for listing in list_backups(self.folder.as_ref())? {
            match Backup::new(self.folder.clone(), listing.name.clone()).fetch_sentinel() {
                Ok(sentinel) => out.push(BackupSummary::from(&sentinel)),
                Err(e) => warn!(backup = %listing.name, error = %e, "unreadable sentinel, not listed"),
            }
        }
        out.sort_by(|a, b| a.finish_time.cmp(&b.finish_time).then_with(|| a.name.cmp(&b.name)));
        Ok(out)
    }
}

fn prepare_target(target: &Path) -> Result<()> {
    if target.exists() {
        let mut entries = fs::read_dir(target).map_err(|e| BackupError::io(e, target))?;
        if entries.next().is_some() {
            return Err(BackupError::Config(format!("restore target {} is not empty", target.display())));
        }
    } else {
        fs::create_dir_all(target).map_err(|e| BackupError::io(e, target))?;
    }
    Ok(())
}

/// Storage keys of the streams to unpack for one layer.
fn stream_keys(backup: &Backup, sentinel: &Sentinel, sets: &TarFileSets, wanted: Option<&HashSet<String>>) -> Vec<String> {
    if sets.len() != sentinel.stream_count {
        warn!(backup = %backup.name, manifest = sets.len(), sentinel = sentinel.stream_count, "stream count mismatch");
    }
    sets.iter()
        .filter(|(_, paths)| wanted.map_or(true, |w| paths.iter().any(|p| w.contains(p))))
        .map(|(stream, _)| backup.stream_key(stream))
        .collect()
}

/// Removes whatever the layer does not contain. Returns the number of
/// entries removed.
fn prune(target: &Path, sets: &TarFileSets, wanted: Option<&HashSet<String>>) -> Result<u64> {
    let keep: BTreeSet<&str> = sets.values().flatten().map(String::as_str).collect();
    let mut removed = 0;
    for entry in WalkDir::new(target).contents_first(true) {
        let entry = entry.map_err(|e| BackupError::Other(e.to_string()))?;
        let Some(rel) = archive_path(target, entry.path()) else { continue };
        if keep.contains(rel.as_str()) {
            continue;
        }
        if let Some(w) = wanted {
            // Only requested files are managed in a partial restore.
            if !w.contains(&rel) || entry.file_type().is_dir() {
                continue;
            }
        }
        let res = if entry.file_type().is_dir() {
            fs::remove_dir_all(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        res.map_err(|e| BackupError::io(e, entry.path()))?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn target_must_be_empty() {
        let dir = tempdir().unwrap();
        prepare_target(dir.path()).unwrap();
        prepare_target(&dir.path().join("fresh/nested")).unwrap();
        assert!(dir.path().join("fresh/nested").is_dir());
        fs::write(dir.path().join("x"), b"1").unwrap();
        assert!(matches!(prepare_target(dir.path()), Err(BackupError::Config(_))));
    }

    #[test]
    fn prune_removes_unlisted_entries() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("base/1")).unwrap();
        fs::create_dir_all(dir.path().join("old")).unwrap();
        fs::write(dir.path().join("base/1/10"), b"keep").unwrap();
        fs::write(dir.path().join("base/1/11"), b"gone").unwrap();
        fs::write(dir.path().join("old/f"), b"gone").unwrap();

        let mut sets = TarFileSets::new();
        sets.insert("part_001.tar.zst".into(), vec!["base".into(), "base/1".into(), "base/1/10".into()]);
        let removed = prune(dir.path(), &sets, None).unwrap();
        assert_eq!(removed, 3);
        assert!(dir.path().join("base/1/10").exists());
        assert!(!dir.path().join("base/1/11").exists());
        assert!(!dir.path().join("old").exists());
    }
}
