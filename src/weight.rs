//! # Weight Estimation
//!
//! Weight-aware placement only ever sees the number returned by a
//! [`WeightEstimator`]; why a file weighs what it does stays behind this trait.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::compose::ComposeFileInfo;
use crate::error::{BackupError, Result};

pub trait WeightEstimator: Send + Sync {
    /// Relative packing cost of `file`. Never zero for a regular file.
    fn weight(&self, file: &ComposeFileInfo) -> u64;
}

/// Weight equals the file size in bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SizeWeight;

impl WeightEstimator for SizeWeight {
    fn weight(&self, file: &ComposeFileInfo) -> u64 {
        file.meta.size.max(1)
    }
}

/// Row churn counters of one relation file.
#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(default)]
pub struct RelFileStats {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub live: u64,
}

impl RelFileStats {
    /// Fraction of rows touched since the statistics were reset, capped at 1.
    fn churn(&self) -> f64 {
        let touched = self.inserted.saturating_add(self.updated).saturating_add(self.deleted);
        (touched as f64 / self.live.max(1) as f64).min(1.0)
    }
}

#[derive(Deserialize)]
struct StatisticsDocument {
    relations: HashMap<String, RelFileStats>,
}

/// Relation statistics keyed by archive path (e.g. `base/16384/16385`).
#[derive(Debug, Clone, Default)]
pub struct RelFileStatistics {
    relations: HashMap<String, RelFileStats>,
}

impl RelFileStatistics {
    pub fn load(path: &Path) -> Result<Self> {
        let unavailable =
            |reason: String| BackupError::Config(format!("statistics source '{}' unavailable: {reason}", path.display()));
        let raw = std::fs::read(path).map_err(|e| unavailable(e.to_string()))?;
        let doc: StatisticsDocument = serde_json::from_slice(&raw).map_err(|e| unavailable(e.to_string()))?;
        Ok(Self { relations: doc.relations })
    }

    pub fn from_map(relations: HashMap<String, RelFileStats>) -> Self {
        Self { relations }
    }

    /// Stats for a relation file; segment suffixes (`.1`, `.2`) share the
    /// statistics of their relation.
    pub fn get(&self, archive_path: &str) -> Option<&RelFileStats> {
        self.relations.get(archive_path).or_else(|| {
            let (base, seg) = archive_path.rsplit_once('.')?;
            if seg.chars().all(|c| c.is_ascii_digit()) { self.relations.get(base) } else { None }
        })
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

/// Heavier weight for files whose relations see a lot of churn: such files
/// compress worse than their size suggests. Up to twice the size.
#[derive(Debug, Clone)]
pub struct StatsWeight {
    stats: RelFileStatistics,
}

impl StatsWeight {
    pub fn new(stats: RelFileStatistics) -> Self {
        Self { stats }
    }
}

impl WeightEstimator for StatsWeight {
    fn weight(&self, file: &ComposeFileInfo) -> u64 {
        let size = file.meta.size.max(1);
        match self.stats.get(&file.archive_path) {
            Some(stats) => size.saturating_add((size as f64 * stats.churn()) as u64),
            None => size,
        }
    }
}
