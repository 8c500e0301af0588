//! Run configuration.
//!
//! Precedence, lowest first: built-in defaults, a JSON config file, `BLITZBACKUP_*`
//! environment variables, then command-line flags (applied by the binary).

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::compose::ComposerKind;
use crate::error::{BackupError, Result};

/// PostgreSQL relation segments (`base/16384/16385.1`, `_fsm`/`_vm` forks).
pub const DEFAULT_DIFFABLE_PATTERN: &str =
    r"^(base|global|pg_tblspc)/(.+/)?[0-9]+(_(fsm|vm|init))?(\.[0-9]+)?$";

/// Size of a diffable page.
pub const DEFAULT_BLOCK_SIZE: u32 = 8192;

fn default_excludes() -> Vec<String> {
    vec![
        r"^postmaster\.(pid|opts)$".into(),
        r"^(pg_wal|pg_xlog|pg_replslot|pg_stat_tmp|pg_dynshmem|pg_notify|pg_serial|pg_snapshots|pg_subtrans)/".into(),
        r"(^|/)pgsql_tmp".into(),
    ]
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ComposeConfig {
    /// Packing strategy.
    pub composer: ComposerKind,
    /// Number of output streams. `0` means one per CPU core.
    pub parallelism: usize,
    /// Per-stream queue capacity; the producer blocks when a queue is full.
    pub queue_capacity: usize,
    /// zstd level used for every stream object.
    pub zstd_level: i32,
    /// Relation statistics backing weight-balanced packing.
    pub statistics_file: Option<PathBuf>,
    pub block_size: u32,
    /// Paths (relative to the data directory) eligible for block-level increments.
    pub diffable_pattern: String,
    /// Paths skipped entirely; still recorded in the sentinel as skipped.
    pub exclude_patterns: Vec<String>,
    /// Hash unchanged-looking files before trusting the ancestor's copy.
    pub verify_fingerprints: bool,
    /// Upper bound on `increment_from` hops when restoring.
    pub max_chain_depth: usize,
    /// Explicit name for the new backup; generated from the clock otherwise.
    pub backup_name: Option<String>,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            composer: ComposerKind::Plain,
            parallelism: 0,
            queue_capacity: 64,
            zstd_level: 3,
            statistics_file: None,
            block_size: DEFAULT_BLOCK_SIZE,
            diffable_pattern: DEFAULT_DIFFABLE_PATTERN.into(),
            exclude_patterns: default_excludes(),
            verify_fingerprints: true,
            max_chain_depth: 16,
            backup_name: None,
        }
    }
}

impl ComposeConfig {
    /// Reads a JSON config file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| BackupError::io(e, path))?;
        serde_json::from_slice(&raw)
            .map_err(|e| BackupError::Config(format!("{}: {e}", path.display())))
    }

    /// Applies `BLITZBACKUP_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("BLITZBACKUP_COMPOSER") {
            self.composer = v.parse()?;
        }
        if let Some(v) = var("BLITZBACKUP_PARALLELISM") {
            self.parallelism = v
                .parse()
                .map_err(|_| BackupError::Config(format!("BLITZBACKUP_PARALLELISM: invalid number '{v}'")))?;
        }
        if let Some(v) = var("BLITZBACKUP_ZSTD_LEVEL") {
            self.zstd_level = v
                .parse()
                .map_err(|_| BackupError::Config(format!("BLITZBACKUP_ZSTD_LEVEL: invalid level '{v}'")))?;
        }
        if let Some(v) = var("BLITZBACKUP_STATS_FILE").filter(|v| !v.is_empty()) {
            self.statistics_file = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism == 0 { num_cpus::get().max(1) } else { self.parallelism }
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(BackupError::Config("queue_capacity must be at least 1".into()));
        }
        if self.block_size == 0 || self.block_size % 512 != 0 {
            return Err(BackupError::Config(format!(
                "block_size must be a positive multiple of 512, got {}",
                self.block_size
            )));
        }
        if !(-7..=22).contains(&self.zstd_level) {
            return Err(BackupError::Config(format!("zstd_level {} out of range", self.zstd_level)));
        }
        self.path_rules().map(|_| ())
    }

    pub fn path_rules(&self) -> Result<PathRules> {
        let compile = |p: &str| {
            Regex::new(p).map_err(|e| BackupError::Config(format!("invalid pattern '{p}': {e}")))
        };
        Ok(PathRules {
            diffable: compile(&self.diffable_pattern)?,
            excludes: self.exclude_patterns.iter().map(|p| compile(p.as_str())).collect::<Result<_>>()?,
        })
    }
}

/// Compiled path patterns.
#[derive(Debug, Clone)]
pub struct PathRules {
    diffable: Regex,
    excludes: Vec<Regex>,
}

impl PathRules {
    pub fn is_excluded(&self, archive_path: &str) -> bool {
        self.excludes.iter().any(|re| re.is_match(archive_path))
    }

    pub fn is_diffable(&self, archive_path: &str) -> bool {
        self.diffable.is_match(archive_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_rules_match_postgres_layout() {
        let rules = ComposeConfig::default().path_rules().unwrap();
        assert!(rules.is_diffable("base/16384/16385"));
        assert!(rules.is_diffable("base/16384/16385.2"));
        assert!(rules.is_diffable("global/1262_vm"));
        assert!(!rules.is_diffable("global/pg_control"));
        assert!(!rules.is_diffable("PG_VERSION"));

        assert!(rules.is_excluded("postmaster.pid"));
        assert!(rules.is_excluded("pg_wal/000000010000000000000001"));
        assert!(rules.is_excluded("base/pgsql_tmp/pgsql_tmp123.0"));
        assert!(!rules.is_excluded("pg_wal"));
        assert!(!rules.is_excluded("base/1/1259"));
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("BLITZBACKUP_COMPOSER", "weight-balanced"),
            ("BLITZBACKUP_PARALLELISM", "6"),
            ("BLITZBACKUP_STATS_FILE", "/tmp/stats.json"),
        ]
        .into_iter()
        .collect();
        let mut config = ComposeConfig::default();
        config.apply_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.composer, ComposerKind::WeightBalanced);
        assert_eq!(config.effective_parallelism(), 6);
        assert_eq!(config.statistics_file.as_deref(), Some(Path::new("/tmp/stats.json")));

        let mut config = ComposeConfig::default();
        let err = config.apply_vars(|k| (k == "BLITZBACKUP_PARALLELISM").then(|| "many".to_string()));
        assert!(matches!(err, Err(BackupError::Config(_))));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ComposeConfig = serde_json::from_str(r#"{"composer":"ancestor-copy","parallelism":3}"#).unwrap();
        assert_eq!(config.composer, ComposerKind::AncestorCopy);
        assert_eq!(config.parallelism, 3);
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let config = ComposeConfig { block_size: 1000, ..Default::default() };
        assert!(config.validate().is_err());
        let config = ComposeConfig { exclude_patterns: vec!["(".into()], ..Default::default() };
        assert!(config.validate().is_err());
    }
}
