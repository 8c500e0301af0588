//! # Backup Push
//!
//! Drives one backup run end to end: choose a composer, walk the data
//! directory, classify and place every file, upload the tar file sets
//! manifest, then the sentinel. The sentinel goes last; a run that fails
//! before it leaves no trace in storage.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::backup::{Backup, Sentinel};
use crate::classify::{Classification, FileClassifier};
use crate::common::{archive_path, FileKind, FileMetadata};
use crate::compose::{Composer, ComposerKind, ComposerMaker, TarBallComposer, TarFileSets};
use crate::config::{ComposeConfig, PathRules};
use crate::error::{BackupError, Result};
use crate::progress::{ProgressCallback, ProgressState};
use crate::storage::Folder;

/// What a finished push produced.
#[derive(Debug, Clone)]
pub struct PushReport {
    pub backup_name: String,
    /// The strategy actually used; may differ from the requested one after a fallback.
    pub composer: ComposerKind,
    pub increment_from: Option<String>,
    pub files: usize,
    pub markers: usize,
    pub increments: usize,
    pub skipped: usize,
    /// Files that could not be read in this run.
    pub unavailable: Vec<String>,
    pub streams: usize,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub start_time: DateTime<Utc>,
    pub finish_time: DateTime<Utc>,
}

pub struct BackupPusher {
    folder: Arc<dyn Folder>,
    config: ComposeConfig,
    progress: Option<Arc<ProgressCallback>>,
}

#[derive(Default)]
struct Walked {
    unavailable: Vec<String>,
}

impl BackupPusher {
    pub fn new(folder: Arc<dyn Folder>, config: ComposeConfig) -> Self {
        Self { folder, config, progress: None }
    }

    /// Reports progress of each push to `callback`, throttled, plus the final state.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressState) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn push(&self, data_dir: &Path) -> Result<PushReport> {
        let root = data_dir.canonicalize().map_err(|e| BackupError::io(e, data_dir))?;
        if !root.is_dir() {
            return Err(BackupError::Config(format!("{} is not a directory", root.display())));
        }
        let start_time = Utc::now();
        let rules = self.config.path_rules()?;
        let mut composer = ComposerMaker::make_with_progress(
            self.config.composer,
            &self.config,
            self.folder.clone(),
            self.progress.clone(),
        )?;
        let backup = composer.backup().clone();
        info!(backup = %backup.name, data_dir = %root.display(), composer = %composer.kind(), "backup started");

        match self.compose(&mut composer, &root, rules, start_time) {
            Ok(report) => Ok(report),
            Err(e) => {
                composer.abort();
                if let Err(cleanup) = backup.delete_data() {
                    warn!(backup = %backup.name, error = %cleanup, "could not remove partial backup data");
                }
                Err(e)
            }
        }
    }

    fn compose(
        &self,
        composer: &mut Composer,
        root: &Path,
        rules: PathRules,
        start_time: DateTime<Utc>,
    ) -> Result<PushReport> {
        let classifier = FileClassifier::new(
            composer.ancestor_sentinel(),
            rules.clone(),
            self.config.block_size,
            self.config.verify_fingerprints,
        );
        let walked = walk(composer, &classifier, &rules, root)?;

        let sets: TarFileSets = composer.pack_tarballs()?;
        let backup: Backup = composer.backup().clone();
        backup.upload_tar_file_sets(&sets)?;

        let files = composer.get_files();
        let summary = composer.summary().cloned().unwrap_or_default();
        let (increment_from, increment_full_name, increment_count) = match composer.ancestor() {
            Some((base, sentinel)) => (
                Some(base.name.clone()),
                Some(sentinel.chain_root().to_string()),
                sentinel.increment_count + 1,
            ),
            None => (None, None, 0),
        };

        let mut unavailable = walked.unavailable;
        unavailable.extend(summary.excluded.iter().cloned());
        let finish_time = Utc::now();
        let report = PushReport {
            backup_name: backup.name.clone(),
            composer: composer.kind(),
            increment_from: increment_from.clone(),
            files: files.values().filter(|d| !d.is_skipped).count(),
            markers: files.values().filter(|d| d.was_in_base).count(),
            increments: files.values().filter(|d| d.is_incremented).count(),
            skipped: files.values().filter(|d| d.is_skipped).count(),
            unavailable,
            streams: composer.stream_count(),
            uncompressed_size: summary.uncompressed_size,
            compressed_size: summary.compressed_size,
            start_time,
            finish_time,
        };

        let sentinel = Sentinel {
            name: backup.name.clone(),
            increment_from,
            increment_full_name,
            increment_count,
            composer: composer.kind(),
            start_time,
            finish_time,
            uncompressed_size: summary.uncompressed_size,
            compressed_size: summary.compressed_size,
            stream_count: composer.stream_count(),
            files,
        };
        backup.upload_sentinel(&sentinel)?;
        info!(
            backup = %report.backup_name,
            files = report.files,
            markers = report.markers,
            increments = report.increments,
            unavailable = report.unavailable.len(),
            "backup finished"
        );
        Ok(report)
    }
}

/// Feeds every entry under `root` to the composer in file name order.
fn walk(composer: &mut Composer, classifier: &FileClassifier, rules: &PathRules, root: &Path) -> Result<Walked> {
    let mut walked = Walked::default();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                warn!(path = %path.display(), error = %e, "cannot read directory entry, skipped");
                if let Some(rel) = archive_path(root, &path) {
                    walked.unavailable.push(rel);
                }
                continue;
            }
        };
        let Some(rel) = archive_path(root, entry.path()) else { continue };
        let file_type = entry.file_type();

        if rules.is_excluded(&rel) {
            if file_type.is_file() {
                let meta = entry
                    .metadata()
                    .map(|m| FileMetadata::from_fs(&m))
                    .unwrap_or(FileMetadata { size: 0, mode: 0, mtime: 0, kind: FileKind::Regular });
                composer.skip_file(&rel, &meta)?;
            } else {
                debug!(path = %rel, "excluded");
            }
            continue;
        }

        if file_type.is_dir() || file_type.is_symlink() {
            let Some((header, link)) = entry_header(entry.path(), file_type.is_symlink(), &rel) else {
                walked.unavailable.push(rel);
                continue;
            };
            composer.add_header(&rel, header, link)?;
        } else if file_type.is_file() {
            match classifier.classify(entry.path(), &rel) {
                Classification::Ready(info) => composer.add_file(info)?,
                Classification::Unavailable { archive_path, .. } => walked.unavailable.push(archive_path),
            }
        } else {
            debug!(path = %rel, "special file ignored");
        }
    }
    Ok(walked)
}

fn entry_header(path: &Path, is_symlink: bool, rel: &str) -> Option<(tar::Header, Option<PathBuf>)> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %rel, error = %e, "entry vanished, skipped");
            return None;
        }
    };
    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&meta, tar::HeaderMode::Complete);
    if !is_symlink {
        return Some((header, None));
    }
    match fs::read_link(path) {
        Ok(target) => Some((header, Some(target))),
        Err(e) => {
            warn!(path = %rel, error = %e, "cannot read symlink, skipped");
            None
        }
    }
}
