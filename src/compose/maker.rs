use std::sync::Arc;

use tracing::info;

use super::composer::{Composer, StreamSettings};
use super::placement::Placement;
use super::ComposerKind;
use crate::backup::{new_backup_name, validate_backup_name, Backup};
use crate::config::ComposeConfig;
use crate::error::{BackupError, Result};
use crate::progress::ProgressCallback;
use crate::resolve::{ChainResolver, Resolution};
use crate::storage::Folder;
use crate::weight::{RelFileStatistics, SizeWeight, StatsWeight, WeightEstimator};

/// Builds a ready [`Composer`] for the requested strategy.
///
/// Every prerequisite (backup name, configuration, statistics, ancestor) is
/// checked here, before any stream is opened.
pub struct ComposerMaker;

impl ComposerMaker {
    pub fn make(kind: ComposerKind, config: &ComposeConfig, folder: Arc<dyn Folder>) -> Result<Composer> {
        Self::make_with_progress(kind, config, folder, None)
    }

    /// Like [`make`](Self::make), reporting progress of the run to `progress`.
    pub fn make_with_progress(
        kind: ComposerKind,
        config: &ComposeConfig,
        folder: Arc<dyn Folder>,
        progress: Option<Arc<ProgressCallback>>,
    ) -> Result<Composer> {
        config.validate()?;
        let settings = StreamSettings {
            queue_capacity: config.queue_capacity,
            zstd_level: config.zstd_level,
            block_size: config.block_size,
            rules: Arc::new(config.path_rules()?),
            progress,
        };
        let streams = config.effective_parallelism();
        let backup = Self::claim_backup(config, &folder)?;

        match kind {
            ComposerKind::Plain => {
                Composer::open(ComposerKind::Plain, backup, None, Placement::round_robin(streams), settings)
            }
            ComposerKind::WeightBalanced => {
                let estimator = Self::estimator(config, true)?;
                let ancestor = ChainResolver::new(folder)
                    .resolve(kind)?
                    .into_ancestor()
                    .map(|(b, s)| (b, Arc::new(s)));
                let placement = Placement::weight_balanced(streams, estimator);
                Composer::open(kind, backup, ancestor, placement, settings)
            }
            ComposerKind::AncestorCopy => match ChainResolver::new(folder).resolve(kind)? {
                Resolution::Ancestor { backup: base, sentinel } => {
                    let placement = Placement::ancestor_copy(streams, Self::estimator(config, false)?);
                    Composer::open(kind, backup, Some((base, Arc::new(sentinel))), placement, settings)
                }
                Resolution::Fallback | Resolution::NotRequested => {
                    info!("no ancestor to copy from, falling back to the plain composer");
                    Composer::open(ComposerKind::Plain, backup, None, Placement::round_robin(streams), settings)
                }
            },
        }
    }

    /// The backup this run writes. A requested name must be unused; a
    /// generated one gets a numeric suffix when its second is already taken.
    fn claim_backup(config: &ComposeConfig, folder: &Arc<dyn Folder>) -> Result<Backup> {
        if let Some(name) = &config.backup_name {
            validate_backup_name(name)?;
            let backup = Backup::new(folder.clone(), name.clone());
            if backup.is_taken()? {
                return Err(BackupError::Config(format!("backup '{name}' already exists")));
            }
            return Ok(backup);
        }

        let base = new_backup_name();
        for attempt in 0..1000u32 {
            let name = if attempt == 0 { base.clone() } else { format!("{base}_{attempt}") };
            let backup = Backup::new(folder.clone(), name);
            if !backup.is_taken()? {
                return Ok(backup);
            }
        }
        Err(BackupError::Config(format!("no free backup name for '{base}'")))
    }

    /// Weight-balanced packing needs relation statistics; ancestor copy
    /// uses them when configured and file sizes otherwise.
    fn estimator(config: &ComposeConfig, required: bool) -> Result<Arc<dyn WeightEstimator>> {
        match &config.statistics_file {
            Some(path) => {
                let stats = RelFileStatistics::load(path)?;
                info!(path = %path.display(), relations = stats.len(), "loaded relation statistics");
                Ok(Arc::new(StatsWeight::new(stats)))
            }
            None if required => {
                Err(BackupError::Config("weight-balanced packing needs a statistics file".into()))
            }
            None => Ok(Arc::new(SizeWeight)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::TarBallComposer;
    use crate::storage::MemoryFolder;
    use std::path::PathBuf;

    fn config(streams: usize) -> ComposeConfig {
        ComposeConfig { parallelism: streams, backup_name: Some("base_test".into()), ..Default::default() }
    }

    fn stats_file(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("stats.json");
        std::fs::write(&path, br#"{"relations": {}}"#).unwrap();
        path
    }

    #[test]
    fn plain_touches_no_sentinel() {
        let folder = Arc::new(MemoryFolder::new());
        let composer = ComposerMaker::make(ComposerKind::Plain, &config(3), folder.clone()).unwrap();
        assert_eq!(composer.kind(), ComposerKind::Plain);
        assert_eq!(composer.stream_count(), 3);
        assert!(folder.get_log().is_empty());
    }

    #[test]
    fn ancestor_copy_without_backups_falls_back() {
        let folder = Arc::new(MemoryFolder::new());
        let mut composer = ComposerMaker::make(ComposerKind::AncestorCopy, &config(2), folder).unwrap();
        assert_eq!(composer.kind(), ComposerKind::Plain);
        assert!(composer.ancestor().is_none());
        composer.pack_tarballs().unwrap();
    }

    #[test]
    fn weight_balanced_without_backups_keeps_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let folder = Arc::new(MemoryFolder::new());
        let cfg = ComposeConfig { statistics_file: Some(stats_file(&dir)), ..config(2) };
        let composer = ComposerMaker::make(ComposerKind::WeightBalanced, &cfg, folder).unwrap();
        assert_eq!(composer.kind(), ComposerKind::WeightBalanced);
        assert!(composer.ancestor().is_none());
    }

    #[test]
    fn weight_balanced_requires_statistics() {
        let folder = Arc::new(MemoryFolder::new());
        let err = ComposerMaker::make(ComposerKind::WeightBalanced, &config(2), folder.clone()).unwrap_err();
        assert!(matches!(err, BackupError::Config(ref msg) if msg.contains("statistics")), "{err}");
        assert!(folder.keys().is_empty());
    }

    #[test]
    fn unreadable_statistics_is_a_config_error() {
        let folder = Arc::new(MemoryFolder::new());
        let cfg = ComposeConfig { statistics_file: Some("/nonexistent/stats.json".into()), ..config(2) };
        let err = ComposerMaker::make(ComposerKind::WeightBalanced, &cfg, folder.clone()).unwrap_err();
        assert!(matches!(err, BackupError::Config(ref msg) if msg.contains("/nonexistent/stats.json")), "{err}");
        assert!(folder.keys().is_empty());
    }

    #[test]
    fn existing_backup_name_is_refused() {
        let folder = Arc::new(MemoryFolder::new());
        let existing = Backup::new(folder.clone(), "base_test");
        folder.put_bytes(&existing.sentinel_key(), b"{}").unwrap();
        let before = folder.keys();

        for kind in [ComposerKind::Plain, ComposerKind::AncestorCopy] {
            let err = ComposerMaker::make(kind, &config(2), folder.clone()).unwrap_err();
            assert!(matches!(err, BackupError::Config(ref msg) if msg.contains("already exists")), "{err}");
        }
        assert_eq!(folder.keys(), before);
    }

    #[test]
    fn path_like_names_are_refused() {
        let folder = Arc::new(MemoryFolder::new());
        let cfg = ComposeConfig { backup_name: Some("a/b".into()), ..config(2) };
        let err = ComposerMaker::make(ComposerKind::Plain, &cfg, folder.clone()).unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
        assert!(folder.keys().is_empty());
    }

    #[test]
    fn generated_names_skip_taken_ones() {
        let folder = Arc::new(MemoryFolder::new());
        let cfg = ComposeConfig { parallelism: 1, ..Default::default() };
        let mut first = ComposerMaker::make(ComposerKind::Plain, &cfg, folder.clone()).unwrap();
        first.pack_tarballs().unwrap();
        let second = ComposerMaker::make(ComposerKind::Plain, &cfg, folder.clone()).unwrap();
        assert_ne!(first.backup().name, second.backup().name);
    }
}
