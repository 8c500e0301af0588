use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::compose::ComposerKind;
use crate::config::ComposeConfig;
use crate::error::{BackupError, Result};
use crate::storage::{Folder, LocalFolder};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Root directory of the backup storage.
    #[arg(long, global = true, env = "BLITZBACKUP_STORAGE")]
    pub storage: Option<PathBuf>,

    /// JSON configuration file. Environment variables and flags override it.
    #[arg(long, global = true, env = "BLITZBACKUP_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Back up a data directory into the storage.
    #[command(alias = "push")]
    BackupPush {
        /// The data directory to back up.
        #[arg(required = true)]
        data_dir: PathBuf,

        /// Packing strategy.
        #[arg(long, value_enum)]
        composer: Option<ComposerKind>,

        /// Number of output streams. [0 = one per CPU core]
        #[arg(long)]
        parallelism: Option<usize>,

        /// Zstandard compression level for the stream objects.
        #[arg(long)]
        level: Option<i32>,

        /// Relation statistics file used to weigh files; required for weight-balanced packing.
        #[arg(long)]
        stats_file: Option<PathBuf>,

        /// Name for the new backup. Generated from the current time if omitted.
        #[arg(long)]
        name: Option<String>,

        /// Trust size and mtime alone when deciding a file is unchanged.
        #[arg(long)]
        no_verify: bool,
    },

    /// Restore a backup (and the backups it depends on) into an empty directory.
    #[command(alias = "fetch")]
    BackupFetch {
        /// Backup name, or LATEST.
        #[arg(required = true)]
        backup_name: String,

        /// The directory to restore into.
        #[arg(required = true)]
        target: PathBuf,

        /// Restore only these paths (relative to the data directory). Repeatable.
        #[arg(long = "path")]
        paths: Vec<String>,
    },

    /// List backups in the storage, oldest first.
    #[command(alias = "list")]
    BackupList {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print which stream holds which file for a backup.
    TarFileSets {
        /// Backup name, or LATEST.
        #[arg(required = true)]
        backup_name: String,
    },
}

impl Args {
    /// Storage folder from `--storage` or `BLITZBACKUP_STORAGE`.
    pub fn folder(&self) -> Result<Arc<dyn Folder>> {
        let root = self.storage.as_ref().ok_or_else(|| {
            BackupError::Config("no storage given, use --storage or BLITZBACKUP_STORAGE".into())
        })?;
        Ok(Arc::new(LocalFolder::new(root)))
    }

    /// Defaults, then the config file, then the environment.
    pub fn base_config(&self) -> Result<ComposeConfig> {
        load_config(self.config.as_deref())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<ComposeConfig> {
    let mut config = match path {
        Some(p) => ComposeConfig::load(p)?,
        None => ComposeConfig::default(),
    };
    config.apply_env()?;
    Ok(config)
}

/// Applies `backup-push` flags on top of `config`.
pub fn apply_push_flags(command: &Commands, config: &mut ComposeConfig) {
    if let Commands::BackupPush { composer, parallelism, level, stats_file, name, no_verify, .. } = command {
        if let Some(c) = composer {
            config.composer = *c;
        }
        if let Some(p) = parallelism {
            config.parallelism = *p;
        }
        if let Some(l) = level {
            config.zstd_level = *l;
        }
        if let Some(s) = stats_file {
            config.statistics_file = Some(s.clone());
        }
        if let Some(n) = name {
            config.backup_name = Some(n.clone());
        }
        if *no_verify {
            config.verify_fingerprints = false;
        }
    }
}

/// Parses command-line arguments using `clap`; exits on usage errors.
pub fn run() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_flags_override_config() {
        let args = Args::try_parse_from([
            "blitzbackup",
            "--storage",
            "/tmp/store",
            "backup-push",
            "/data",
            "--composer",
            "ancestor-copy",
            "--parallelism",
            "4",
            "--no-verify",
        ])
        .unwrap();
        let mut config = ComposeConfig::default();
        apply_push_flags(&args.command, &mut config);
        assert_eq!(config.composer, ComposerKind::AncestorCopy);
        assert_eq!(config.parallelism, 4);
        assert!(!config.verify_fingerprints);
        assert_eq!(config.zstd_level, ComposeConfig::default().zstd_level);
    }

    #[test]
    fn fetch_collects_paths() {
        let args = Args::try_parse_from([
            "blitzbackup",
            "backup-fetch",
            "LATEST",
            "/restore",
            "--path",
            "PG_VERSION",
            "--path",
            "base/1/1259",
        ])
        .unwrap();
        match args.command {
            Commands::BackupFetch { paths, .. } => assert_eq!(paths, vec!["PG_VERSION", "base/1/1259"]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
