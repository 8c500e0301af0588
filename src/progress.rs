//! Progress tracking for backup runs.
//!
//! Every stream worker owns one [`StreamMetrics`] handle and bumps relaxed
//! atomics, so workers never contend with each other. The tracker aggregates
//! on demand.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

/// Counters for one stream.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    pub files: AtomicU64,
    pub bytes: AtomicU64,
    pub markers: AtomicU64,
    pub increments: AtomicU64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A regular file stored in full; `bytes` is what went into the stream.
    pub fn record_full(&self, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_marker(&self) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.markers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_increment(&self, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.increments.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn files(&self) -> u64 {
        self.files.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn markers(&self) -> u64 {
        self.markers.load(Ordering::Relaxed)
    }

    pub fn increments(&self) -> u64 {
        self.increments.load(Ordering::Relaxed)
    }
}

/// Aggregated view over all streams.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    pub processed_files: u64,
    pub processed_bytes: u64,
    pub markers: u64,
    pub increments: u64,
    pub completed_streams: u32,
    pub total_streams: u32,
    pub elapsed_time: Duration,
    pub speed_mbps: f32,
}

pub type ProgressCallback = dyn Fn(ProgressState) + Send + Sync;

pub struct ProgressTracker {
    streams: Vec<Arc<StreamMetrics>>,
    completed_streams: AtomicUsize,
    start_time: Instant,
    last_emit_time: Mutex<Instant>,
    emit_interval: Duration,
    callback: Option<Arc<ProgressCallback>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("streams", &self.streams.len())
            .field("completed_streams", &self.completed_streams.load(Ordering::Relaxed))
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(streams: usize, emit_interval: Duration) -> Self {
        Self {
            streams: (0..streams).map(|_| Arc::new(StreamMetrics::new())).collect(),
            completed_streams: AtomicUsize::new(0),
            start_time: Instant::now(),
            last_emit_time: Mutex::new(Instant::now()),
            emit_interval,
            callback: None,
        }
    }

    /// Installs a callback invoked at most once per emit interval.
    pub fn with_callback<F>(self, callback: F) -> Self
    where
        F: Fn(ProgressState) + Send + Sync + 'static,
    {
        self.with_shared_callback(Arc::new(callback))
    }

    pub fn with_shared_callback(mut self, callback: Arc<ProgressCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn stream_metrics(&self, stream: usize) -> Option<Arc<StreamMetrics>> {
        self.streams.get(stream).cloned()
    }

    pub fn record_stream_completed(&self) {
        self.completed_streams.fetch_add(1, Ordering::Relaxed);
        self.maybe_emit();
    }

    /// Emits regardless of the interval; used for the final state.
    pub fn emit(&self) {
        if let Some(callback) = &self.callback {
            *self.last_emit_time.lock() = Instant::now();
            callback(self.state());
        }
    }

    /// Emits only if the interval has passed since the last emission.
    pub fn maybe_emit(&self) {
        let Some(callback) = &self.callback else { return };
        let now = Instant::now();
        {
            let mut last = self.last_emit_time.lock();
            if now.duration_since(*last) < self.emit_interval {
                return;
            }
            *last = now;
        }
        callback(self.state());
    }

    pub fn state(&self) -> ProgressState {
        let (processed_files, processed_bytes, markers, increments) =
            self.streams.iter().fold((0, 0, 0, 0), |(f, b, m, i), s| {
                (f + s.files(), b + s.bytes(), m + s.markers(), i + s.increments())
            });
        let elapsed_time = self.start_time.elapsed();
        let speed_mbps = if elapsed_time.as_secs_f32() > 0.0 {
            processed_bytes as f32 / (1024.0 * 1024.0) / elapsed_time.as_secs_f32()
        } else {
            0.0
        };
        ProgressState {
            processed_files,
            processed_bytes,
            markers,
            increments,
            completed_streams: self.completed_streams.load(Ordering::Relaxed) as u32,
            total_streams: self.streams.len() as u32,
            elapsed_time,
            speed_mbps,
        }
    }

    /// Logs the final totals.
    pub fn log_summary(&self) {
        let s = self.state();
        info!(
            files = s.processed_files,
            markers = s.markers,
            increments = s.increments,
            streams = s.total_streams,
            mib = format_args!("{:.2}", s.processed_bytes as f64 / (1024.0 * 1024.0)),
            elapsed_ms = s.elapsed_time.as_millis() as u64,
            "streams packed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn stream_metrics_count_kinds() {
        let m = StreamMetrics::new();
        m.record_full(1024);
        m.record_marker();
        m.record_increment(512);
        assert_eq!(m.files(), 3);
        assert_eq!(m.bytes(), 1536);
        assert_eq!(m.markers(), 1);
        assert_eq!(m.increments(), 1);
    }

    #[test]
    fn aggregates_across_threads() {
        let tracker = Arc::new(ProgressTracker::new(4, Duration::from_secs(60)));
        let handles: Vec<_> = (0..4)
            .map(|id| {
                let metrics = tracker.stream_metrics(id).unwrap();
                thread::spawn(move || {
                    for _ in 0..250 {
                        metrics.record_full(1024);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let state = tracker.state();
        assert_eq!(state.processed_files, 1000);
        assert_eq!(state.processed_bytes, 1024 * 1000);
        assert_eq!(state.total_streams, 4);
        assert!(tracker.stream_metrics(4).is_none());
    }

    #[test]
    fn callback_fires_after_interval() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let tracker = ProgressTracker::new(1, Duration::ZERO)
            .with_callback(move |state| sink.lock().push(state.completed_streams));
        tracker.record_stream_completed();
        assert_eq!(*seen.lock(), vec![1]);
    }
}
