//! # Chain Resolution
//!
//! Finds the ancestor an incremental run may reuse content from. The latest
//! backup in storage is the starting point; if it is itself incremental, the
//! resolver follows its `increment_full_name` pointer exactly one hop, so new
//! incrementals always diff against the full backup at the root of the chain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::info;

use crate::backup::{latest_backup_name, Backup, Sentinel};
use crate::compose::ComposerKind;
use crate::error::{BackupError, Result};
use crate::storage::Folder;

/// Outcome of resolving an ancestor for a run.
#[derive(Debug)]
pub enum Resolution {
    /// The strategy does not use an ancestor.
    NotRequested,
    /// An ancestor was wanted but storage holds no backup yet.
    Fallback,
    Ancestor { backup: Backup, sentinel: Sentinel },
}

impl Resolution {
    pub fn ancestor(&self) -> Option<(&Backup, &Sentinel)> {
        match self {
            Resolution::Ancestor { backup, sentinel } => Some((backup, sentinel)),
            _ => None,
        }
    }

    pub fn into_ancestor(self) -> Option<(Backup, Sentinel)> {
        match self {
            Resolution::Ancestor { backup, sentinel } => Some((backup, sentinel)),
            _ => None,
        }
    }
}

pub struct ChainResolver {
    folder: Arc<dyn Folder>,
}

impl ChainResolver {
    pub fn new(folder: Arc<dyn Folder>) -> Self {
        Self { folder }
    }

    pub fn resolve(&self, kind: ComposerKind) -> Result<Resolution> {
        if kind == ComposerKind::Plain {
            return Ok(Resolution::NotRequested);
        }

        let Some(latest_name) = latest_backup_name(self.folder.as_ref())? else {
            info!(composer = %kind, "no previous backup found, composing a full backup");
            return Ok(Resolution::Fallback);
        };

        let mut backup = Backup::new(self.folder.clone(), latest_name);
        let mut sentinel = backup.fetch_sentinel()?;

        if let Some(full_name) = sentinel.increment_full_name.clone() {
            // One hop only; a broken pointer fails the run instead of silently
            // degrading to a full backup.
            info!(latest = %backup.name, full = %full_name, "latest backup is incremental, using its full backup");
            backup = Backup::new(self.folder.clone(), full_name);
            sentinel = backup.fetch_sentinel()?;
        }

        info!(ancestor = %backup.name, files = sentinel.files.len(), "resolved ancestor backup");
        Ok(Resolution::Ancestor { backup, sentinel })
    }
}

/// Sentinels of a backup and all of its ancestors, keyed by backup name.
pub struct BackupChain {
    folder: Arc<dyn Folder>,
    sentinels: HashMap<String, Sentinel>,
    /// Oldest first; the last element is the requested backup.
    order: Vec<String>,
}

impl BackupChain {
    /// Follows `increment_from` links starting at `name`, at most `max_depth`
    /// hops. Every sentinel on the way must exist.
    pub fn walk(folder: Arc<dyn Folder>, name: &str, max_depth: usize) -> Result<Self> {
        let mut sentinels = HashMap::new();
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(name.to_string());

        while let Some(cur) = current {
            if !seen.insert(cur.clone()) || order.len() > max_depth {
                return Err(BackupError::ChainTooDeep(name.to_string()));
            }
            let sentinel = Backup::new(folder.clone(), cur.clone()).fetch_sentinel()?;
            current = sentinel.increment_from.clone();
            order.push(cur.clone());
            sentinels.insert(cur, sentinel);
        }
        order.reverse();
        Ok(Self { folder, sentinels, order })
    }

    /// Backups from the chain root to the requested one.
    pub fn iter(&self) -> impl Iterator<Item = (Backup, &Sentinel)> + '_ {
        self.order.iter().filter_map(move |name| {
            let sentinel = self.sentinels.get(name)?;
            Some((Backup::new(self.folder.clone(), name.clone()), sentinel))
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn sentinel(&self, name: &str) -> Option<&Sentinel> {
        self.sentinels.get(name)
    }
}
