//! Stream selection rules.
//!
//! All three rules are online: files are placed in arrival order, since the
//! full set is unknown until traversal ends. Ties go to the lowest index.

use std::sync::Arc;

use super::ComposeFileInfo;
use crate::weight::WeightEstimator;

/// Index of the smallest value, lowest index on ties.
pub(crate) fn argmin(values: &[u64]) -> usize {
    let mut best = 0;
    for (idx, v) in values.iter().enumerate().skip(1) {
        if *v < values[best] {
            best = idx;
        }
    }
    best
}

pub enum Placement {
    /// Fewest files so far.
    RoundRobin { counts: Vec<u64> },
    /// Smallest running weight; every file pays its estimated weight.
    WeightBalanced { estimator: Arc<dyn WeightEstimator>, loads: Vec<u64> },
    /// Smallest running weight; files already in the ancestor cost nothing.
    AncestorCopy { estimator: Arc<dyn WeightEstimator>, loads: Vec<u64> },
}

impl std::fmt::Debug for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (name, loads) = match self {
            Placement::RoundRobin { counts } => ("RoundRobin", counts),
            Placement::WeightBalanced { loads, .. } => ("WeightBalanced", loads),
            Placement::AncestorCopy { loads, .. } => ("AncestorCopy", loads),
        };
        f.debug_struct(name).field("loads", loads).finish()
    }
}

impl Placement {
    pub fn round_robin(streams: usize) -> Self {
        Placement::RoundRobin { counts: vec![0; streams] }
    }

    pub fn weight_balanced(streams: usize, estimator: Arc<dyn WeightEstimator>) -> Self {
        Placement::WeightBalanced { estimator, loads: vec![0; streams] }
    }

    pub fn ancestor_copy(streams: usize, estimator: Arc<dyn WeightEstimator>) -> Self {
        Placement::AncestorCopy { estimator, loads: vec![0; streams] }
    }

    pub fn streams(&self) -> usize {
        self.loads().len()
    }

    /// Running totals: file counts for round-robin, weights otherwise.
    pub fn loads(&self) -> &[u64] {
        match self {
            Placement::RoundRobin { counts } => counts,
            Placement::WeightBalanced { loads, .. } | Placement::AncestorCopy { loads, .. } => loads,
        }
    }

    /// Picks the stream for `file` and charges its cost there.
    pub fn place(&mut self, file: &ComposeFileInfo) -> usize {
        match self {
            Placement::RoundRobin { counts } => {
                let idx = argmin(counts);
                counts[idx] += 1;
                idx
            }
            Placement::WeightBalanced { estimator, loads } => {
                let idx = argmin(loads);
                loads[idx] = loads[idx].saturating_add(estimator.weight(file));
                idx
            }
            Placement::AncestorCopy { estimator, loads } => {
                let idx = argmin(loads);
                if !file.was_in_base {
                    loads[idx] = loads[idx].saturating_add(estimator.weight(file));
                }
                idx
            }
        }
    }
}
