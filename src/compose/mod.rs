//! # Backup Composition
//!
//! The composer turns classified files into N parallel stream objects.
//!
//! ## Lifecycle
//!
//! 1. **Open**: [`ComposerMaker`] allocates exactly N streams, each served by its
//!    own worker thread with a bounded job queue and a private spool file.
//! 2. **Accepting**: [`TarBallComposer::add_file`] places every regular file
//!    with the active [`Placement`] rule and hands it to that stream's worker.
//!    Directories and symlinks go through `add_header`, excluded paths through
//!    `skip_file`; neither affects the weight balance.
//! 3. **Draining / Closed**: [`TarBallComposer::pack_tarballs`] closes the
//!    queues, waits for every worker, uploads the streams and freezes the
//!    [`TarFileSets`]. Calling it again returns the same sets.
//!
//! A failing stream cancels the whole run: the other workers stop writing,
//! nothing is uploaded afterwards, and already uploaded stream objects are
//! deleted.

mod composer;
mod maker;
mod placement;
mod registry;
mod stream;

pub use composer::{Composer, PackSummary, StreamSettings, StreamSummary};
pub use maker::ComposerMaker;
pub use placement::Placement;
pub use registry::{TarFileSetRegistry, TarFileSets};
pub use stream::{stream_name, ENTRY_KIND_KEY};
pub(crate) use stream::{KIND_INCREMENT, KIND_MARKER};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::backup::{BundleFiles, FileDescription};
use crate::common::FileMetadata;
use crate::error::{BackupError, Result};

/// Which packing strategy a run uses.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ComposerKind {
    /// Every file stored in full; files spread by count.
    #[default]
    Plain,
    /// Files spread by estimated weight; incremental against the latest full backup.
    WeightBalanced,
    /// Like weight-balanced, but unchanged files become free markers.
    AncestorCopy,
}

impl ComposerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComposerKind::Plain => "plain",
            ComposerKind::WeightBalanced => "weight-balanced",
            ComposerKind::AncestorCopy => "ancestor-copy",
        }
    }
}

impl fmt::Display for ComposerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ComposerKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "regular" => Ok(ComposerKind::Plain),
            "weight-balanced" | "rating" => Ok(ComposerKind::WeightBalanced),
            "ancestor-copy" | "copy" => Ok(ComposerKind::AncestorCopy),
            other => Err(BackupError::Config(format!("unknown composer '{other}'"))),
        }
    }
}

/// A regular file ready to be packed.
#[derive(Debug, Clone)]
pub struct ComposeFileInfo {
    pub abs_path: PathBuf,
    /// Path inside the backup, relative to the data directory.
    pub archive_path: String,
    pub meta: FileMetadata,
    /// An identical copy exists in the ancestor; only a marker is written.
    pub was_in_base: bool,
    /// Only blocks that differ from the ancestor's copy are written.
    pub is_incremented: bool,
    pub header: tar::Header,
    /// The ancestor's record for this path, when one is relevant.
    pub base_description: Option<FileDescription>,
}

impl ComposeFileInfo {
    pub fn new(
        abs_path: PathBuf,
        archive_path: String,
        meta: FileMetadata,
        was_in_base: bool,
        is_incremented: bool,
        header: tar::Header,
    ) -> Self {
        Self { abs_path, archive_path, meta, was_in_base, is_incremented, header, base_description: None }
    }
}

/// The capability every composer variant offers to the backup pusher.
pub trait TarBallComposer {
    /// Places a classified regular file into a stream.
    fn add_file(&mut self, info: ComposeFileInfo) -> Result<()>;

    /// Writes a non-regular entry (directory, symlink) without weight accounting.
    fn add_header(&mut self, archive_path: &str, header: tar::Header, link_target: Option<PathBuf>) -> Result<()>;

    /// Records an excluded path; nothing is written for it.
    fn skip_file(&mut self, archive_path: &str, meta: &FileMetadata) -> Result<()>;

    /// Finishes every stream and returns the final placement.
    fn pack_tarballs(&mut self) -> Result<TarFileSets>;

    /// Descriptions of every regular file seen so far.
    fn get_files(&self) -> BundleFiles;
}

#[cfg(test)]
pub(crate) fn test_file(archive_path: &str, size: u64) -> ComposeFileInfo {
    use crate::common::FileKind;
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o600);
    ComposeFileInfo::new(
        PathBuf::from("/nonexistent").join(archive_path),
        archive_path.to_string(),
        FileMetadata { size, mode: 0o600, mtime: 0, kind: FileKind::Regular },
        false,
        false,
        header,
    )
}
