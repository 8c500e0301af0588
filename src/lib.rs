//! # BlitzBackup Core Library
//!
//! This crate provides the core functionality for the `blitzbackup` tool: parallel,
//! optionally incremental physical backups of a database data directory, packed
//! into N zstd-compressed tar streams and stored in a [`storage::Folder`].
//!
//! ## Key Modules
//!
//! - [`compose`]: The composer: placement strategies and the per-stream workers.
//! - [`resolve`]: Finds the ancestor backup an incremental run diffs against.
//! - [`classify`]: Decides per file between full copy, block increment and marker.
//! - [`push`]: End-to-end backup run, sentinel written last.
//! - [`fetch`]: Restore of a backup chain, whole or by path.
//! - [`storage`]: The object storage abstraction and its local/in-memory backends.
//!
//! ## Examples
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use blitzbackup::{BackupPusher, ComposeConfig, ComposerKind, LocalFolder};
//!
//! let folder = Arc::new(LocalFolder::new("/var/backups/pg"));
//! let config = ComposeConfig { composer: ComposerKind::AncestorCopy, ..Default::default() };
//! let report = BackupPusher::new(folder, config).push(Path::new("/var/lib/postgresql/16/main"))?;
//! println!("{} files in {}", report.files, report.backup_name);
//! # Ok::<(), blitzbackup::BackupError>(())
//! ```

pub mod backup;
pub mod classify;
pub mod cli;
pub mod common;
pub mod compose;
pub mod config;
pub mod error;
pub mod fetch;
pub mod increment;
pub mod progress;
pub mod push;
pub mod resolve;
pub mod storage;
pub mod weight;

// Cross-platform filesystem wrapper
pub mod fsx;

pub use compose::{ComposeFileInfo, Composer, ComposerKind, ComposerMaker, TarBallComposer, TarFileSets};
pub use config::ComposeConfig;
pub use error::{BackupError, Result};
pub use fetch::BackupFetcher;
pub use push::{BackupPusher, PushReport};
pub use storage::{Folder, LocalFolder, MemoryFolder};
