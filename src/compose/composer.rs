use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, info};

use super::placement::{argmin, Placement};
use super::registry::{TarFileSetRegistry, TarFileSets};
use super::stream::{run_stream, stream_name, StreamContext, StreamJob, StreamOutcome};
use super::{ComposeFileInfo, ComposerKind, TarBallComposer};
use crate::backup::{Backup, BundleFiles, FileDescription, Sentinel};
use crate::common::FileMetadata;
use crate::config::PathRules;
use crate::error::{BackupError, Result};
use crate::progress::{ProgressCallback, ProgressTracker};

/// Knobs the stream workers are opened with.
#[derive(Clone)]
pub struct StreamSettings {
    pub queue_capacity: usize,
    pub zstd_level: i32,
    pub block_size: u32,
    pub rules: Arc<PathRules>,
    /// Receives throttled progress while the run lasts, and the final state.
    pub progress: Option<Arc<ProgressCallback>>,
}

impl std::fmt::Debug for StreamSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSettings")
            .field("queue_capacity", &self.queue_capacity)
            .field("zstd_level", &self.zstd_level)
            .field("block_size", &self.block_size)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub name: String,
    pub key: String,
    pub files: u64,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
}

impl From<StreamOutcome> for StreamSummary {
    fn from(o: StreamOutcome) -> Self {
        Self {
            name: o.name,
            key: o.key,
            files: o.files,
            uncompressed_size: o.uncompressed_size,
            compressed_size: o.compressed_size,
        }
    }
}

/// Totals of a successfully packed run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackSummary {
    pub streams: Vec<StreamSummary>,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    /// Files that disappeared between classification and writing.
    pub excluded: Vec<String>,
}

enum State {
    Accepting,
    Closed { sets: TarFileSets, summary: PackSummary },
    Failed { stream: String, reason: String },
}

struct Worker {
    name: String,
    key: String,
    sender: Option<Sender<StreamJob>>,
    handle: Option<JoinHandle<Result<StreamOutcome>>>,
}

/// N parallel output streams fed by one producer.
pub struct Composer {
    kind: ComposerKind,
    backup: Backup,
    ancestor: Option<(Backup, Arc<Sentinel>)>,
    placement: Placement,
    entry_counts: Vec<u64>,
    workers: Vec<Worker>,
    registry: Arc<TarFileSetRegistry>,
    cancel: Arc<AtomicBool>,
    progress: Arc<ProgressTracker>,
    state: State,
}

impl std::fmt::Debug for Composer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composer")
            .field("kind", &self.kind)
            .field("backup", &self.backup.name)
            .field("streams", &self.workers.len())
            .field("placement", &self.placement)
            .finish()
    }
}

impl Composer {
    /// Opens one stream per slot of `placement`, each with its own worker.
    pub fn open(
        kind: ComposerKind,
        backup: Backup,
        ancestor: Option<(Backup, Arc<Sentinel>)>,
        placement: Placement,
        settings: StreamSettings,
    ) -> Result<Self> {
        let streams = placement.streams();
        if streams == 0 {
            return Err(BackupError::Config("a composer needs at least one stream".into()));
        }
        let names: Vec<String> = (0..streams).map(stream_name).collect();
        let registry = Arc::new(TarFileSetRegistry::new(names.iter().map(String::as_str)));
        let cancel = Arc::new(AtomicBool::new(false));
        let mut tracker = ProgressTracker::new(streams, Duration::from_secs(5));
        if let Some(callback) = settings.progress.clone() {
            tracker = tracker.with_shared_callback(callback);
        }
        let progress = Arc::new(tracker);

        let mut composer = Self {
            kind,
            backup: backup.clone(),
            ancestor,
            placement,
            entry_counts: vec![0; streams],
            workers: Vec::with_capacity(streams),
            registry: registry.clone(),
            cancel: cancel.clone(),
            progress: progress.clone(),
            state: State::Accepting,
        };

        for (idx, name) in names.into_iter().enumerate() {
            let (tx, rx) = bounded::<StreamJob>(settings.queue_capacity.max(1));
            let key = backup.stream_key(&name);
            let ctx = StreamContext {
                name: name.clone(),
                key: key.clone(),
                backup: backup.clone(),
                zstd_level: settings.zstd_level,
                block_size: settings.block_size,
                rules: settings.rules.clone(),
                registry: registry.clone(),
                cancel: cancel.clone(),
                metrics: progress.stream_metrics(idx).unwrap_or_default(),
            };
            let tracker = progress.clone();
            // If a spawn fails, Drop aborts the workers started so far.
            let handle = thread::Builder::new().name(format!("stream-{:03}", idx + 1)).spawn(move || {
                let outcome = run_stream(ctx, rx);
                if outcome.is_ok() {
                    tracker.record_stream_completed();
                }
                outcome
            })?;
            composer.workers.push(Worker { name, key, sender: Some(tx), handle: Some(handle) });
        }

        info!(backup = %backup.name, composer = %kind, streams, "composer opened");
        Ok(composer)
    }

    pub fn kind(&self) -> ComposerKind {
        self.kind
    }

    pub fn backup(&self) -> &Backup {
        &self.backup
    }

    /// The backup this run reuses content from, if any.
    pub fn ancestor(&self) -> Option<(&Backup, &Sentinel)> {
        self.ancestor.as_ref().map(|(b, s)| (b, s.as_ref()))
    }

    pub fn ancestor_sentinel(&self) -> Option<Arc<Sentinel>> {
        self.ancestor.as_ref().map(|(_, s)| s.clone())
    }

    pub fn stream_count(&self) -> usize {
        self.workers.len()
    }

    /// Running placement totals per stream.
    pub fn loads(&self) -> &[u64] {
        self.placement.loads()
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Present once `pack_tarballs` has succeeded.
    pub fn summary(&self) -> Option<&PackSummary> {
        match &self.state {
            State::Closed { summary, .. } => Some(summary),
            _ => None,
        }
    }

    fn check_accepting(&mut self) -> Result<()> {
        match &self.state {
            State::Accepting => {}
            State::Closed { .. } => return Err(BackupError::ComposerState("closed")),
            State::Failed { stream, reason } => {
                return Err(BackupError::StreamFailed { stream: stream.clone(), reason: reason.clone() })
            }
        }
        if self.cancel.load(Ordering::SeqCst) {
            return Err(self.fail(None));
        }
        Ok(())
    }

    fn send(&mut self, stream: usize, job: StreamJob) -> Result<()> {
        let sent = match self.workers[stream].sender.as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        };
        if sent {
            self.entry_counts[stream] += 1;
            Ok(())
        } else {
            // The worker hung up; it has already raised the cancellation flag.
            self.cancel.store(true, Ordering::SeqCst);
            Err(self.fail(None))
        }
    }

    /// Closes every queue and joins every worker.
    fn join_all(&mut self) -> (Vec<StreamOutcome>, Option<BackupError>) {
        for w in &mut self.workers {
            w.sender.take();
        }
        let mut outcomes = Vec::with_capacity(self.workers.len());
        let mut first_error: Option<BackupError> = None;
        for w in &mut self.workers {
            let Some(handle) = w.handle.take() else { continue };
            let result = handle.join().unwrap_or_else(|_| {
                Err(BackupError::StreamFailed { stream: w.name.clone(), reason: "worker panicked".into() })
            });
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(BackupError::Cancelled) => {}
                Err(e) => {
                    self.cancel.store(true, Ordering::SeqCst);
                    first_error.get_or_insert(e);
                }
            }
        }
        if first_error.is_none() && self.cancel.load(Ordering::SeqCst) {
            first_error = Some(BackupError::Cancelled);
        }
        (outcomes, first_error)
    }

    /// Deletes every stream object of this run.
    fn remove_streams(&self) {
        let keys: Vec<String> = self.workers.iter().map(|w| w.key.clone()).collect();
        if let Err(e) = self.backup.folder().delete_objects(&keys) {
            error!(backup = %self.backup.name, error = %e, orphans = ?keys, "could not remove stream objects");
        }
    }

    /// Stops the run after a stream failure and returns the error. `collected`
    /// is the failure already taken from joined workers; without it the
    /// workers are joined here to find the failing stream.
    fn fail(&mut self, collected: Option<BackupError>) -> BackupError {
        let err = match collected {
            Some(err) => Some(err),
            None => self.join_all().1,
        };
        self.remove_streams();
        let (stream, reason) = match err {
            Some(BackupError::StreamFailed { stream, reason }) => (stream, reason),
            Some(other) => (String::from("-"), other.to_string()),
            None => (String::from("-"), BackupError::Cancelled.to_string()),
        };
        error!(backup = %self.backup.name, %stream, %reason, "composition aborted");
        self.state = State::Failed { stream: stream.clone(), reason: reason.clone() };
        BackupError::StreamFailed { stream, reason }
    }

    /// Cancels an unfinished run; nothing it wrote stays in storage.
    pub fn abort(&mut self) {
        if matches!(self.state, State::Accepting) {
            self.cancel.store(true, Ordering::SeqCst);
            self.join_all();
            self.remove_streams();
            self.state = State::Failed { stream: String::from("-"), reason: "aborted".into() };
            info!(backup = %self.backup.name, "composition aborted by caller");
        }
    }
}

impl TarBallComposer for Composer {
    fn add_file(&mut self, info: ComposeFileInfo) -> Result<()> {
        self.check_accepting()?;
        let stream = self.placement.place(&info);
        debug!(path = %info.archive_path, stream, was_in_base = info.was_in_base, is_incremented = info.is_incremented, "placed");
        self.send(stream, StreamJob::File(info))?;
        self.progress.maybe_emit();
        Ok(())
    }

    fn add_header(&mut self, archive_path: &str, header: tar::Header, link_target: Option<PathBuf>) -> Result<()> {
        self.check_accepting()?;
        let stream = argmin(&self.entry_counts);
        self.send(stream, StreamJob::Header { archive_path: archive_path.to_string(), header, link_target })
    }

    fn skip_file(&mut self, archive_path: &str, meta: &FileMetadata) -> Result<()> {
        self.check_accepting()?;
        self.registry.describe(archive_path, FileDescription::skipped(meta.size, meta.mtime));
        Ok(())
    }

    fn pack_tarballs(&mut self) -> Result<TarFileSets> {
        match &self.state {
            State::Closed { sets, .. } => return Ok(sets.clone()),
            State::Failed { stream, reason } => {
                return Err(BackupError::StreamFailed { stream: stream.clone(), reason: reason.clone() })
            }
            State::Accepting => {}
        }

        let (outcomes, err) = self.join_all();
        if let Some(err) = err {
            return Err(self.fail(Some(err)));
        }

        let mut summary = PackSummary { excluded: self.registry.excluded(), ..Default::default() };
        for outcome in outcomes {
            summary.uncompressed_size += outcome.uncompressed_size;
            summary.compressed_size += outcome.compressed_size;
            summary.streams.push(outcome.into());
        }
        let sets = self.registry.snapshot();
        self.progress.emit();
        self.progress.log_summary();
        info!(
            backup = %self.backup.name,
            streams = summary.streams.len(),
            uncompressed = summary.uncompressed_size,
            compressed = summary.compressed_size,
            "tarballs packed"
        );
        self.state = State::Closed { sets: sets.clone(), summary };
        Ok(sets)
    }

    fn get_files(&self) -> BundleFiles {
        self.registry.files()
    }
}

impl Drop for Composer {
    fn drop(&mut self) {
        self.abort();
    }
}
