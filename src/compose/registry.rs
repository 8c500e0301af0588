use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::backup::{BundleFiles, FileDescription};

/// Stream name → archive paths in the order they were written to that stream.
pub type TarFileSets = BTreeMap<String, Vec<String>>;

/// Shared record of where every entry went.
///
/// Stream workers append concurrently, each to its own stream's list; the
/// lock keeps the map itself consistent.
#[derive(Debug, Default)]
pub struct TarFileSetRegistry {
    sets: Mutex<TarFileSets>,
    files: Mutex<BundleFiles>,
    excluded: Mutex<Vec<String>>,
}

impl TarFileSetRegistry {
    pub fn new<'a>(stream_names: impl IntoIterator<Item = &'a str>) -> Self {
        let sets = stream_names.into_iter().map(|n| (n.to_string(), Vec::new())).collect();
        Self { sets: Mutex::new(sets), ..Default::default() }
    }

    /// Records that `archive_path` was written to `stream`.
    pub fn record(&self, stream: &str, archive_path: &str) {
        self.sets
            .lock()
            .entry(stream.to_string())
            .or_default()
            .push(archive_path.to_string());
    }

    pub fn describe(&self, archive_path: &str, description: FileDescription) {
        self.files.lock().insert(archive_path.to_string(), description);
    }

    /// A file that could not be written in this run.
    pub fn exclude(&self, archive_path: &str) {
        self.excluded.lock().push(archive_path.to_string());
    }

    pub fn snapshot(&self) -> TarFileSets {
        self.sets.lock().clone()
    }

    pub fn files(&self) -> BundleFiles {
        self.files.lock().clone()
    }

    pub fn excluded(&self) -> Vec<String> {
        self.excluded.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_appends_keep_per_stream_order() {
        let registry = Arc::new(TarFileSetRegistry::new(["part_001.tar.zst", "part_002.tar.zst"]));
        let handles: Vec<_> = ["part_001.tar.zst", "part_002.tar.zst"]
            .into_iter()
            .map(|stream| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        registry.record(stream, &format!("{stream}/{i}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let sets = registry.snapshot();
        for (stream, paths) in &sets {
            let expected: Vec<_> = (0..100).map(|i| format!("{stream}/{i}")).collect();
            assert_eq!(paths, &expected);
        }
    }

    #[test]
    fn empty_streams_are_listed() {
        let registry = TarFileSetRegistry::new(["a", "b"]);
        registry.record("a", "x");
        let sets = registry.snapshot();
        assert_eq!(sets.len(), 2);
        assert!(sets["b"].is_empty());
    }
}
