use std::collections::BTreeMap;
use std::io::Read;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use super::{validate_key, Folder, ObjectInfo, StorageError, StorageResult};

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, (Vec<u8>, SystemTime)>,
    // Logical clock so that "latest" is well defined even within one second.
    clock: u64,
    reject_puts: Vec<String>,
    gets: Vec<String>,
}

/// Folder kept entirely in memory.
///
/// Besides dry runs this backend is what the test-suite uses: it records every
/// `get_object` key and can be told to reject writes to matching keys.
#[derive(Default)]
pub struct MemoryFolder {
    inner: Mutex<Inner>,
}

impl MemoryFolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent `put_object` whose key contains `pattern` fails.
    pub fn reject_puts_containing(&self, pattern: &str) {
        self.inner.lock().reject_puts.push(pattern.to_string());
    }

    /// Keys read through `get_object`, in call order.
    pub fn get_log(&self) -> Vec<String> {
        self.inner.lock().gets.clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().objects.keys().cloned().collect()
    }
}

impl Folder for MemoryFolder {
    fn get_object(&self, key: &str) -> StorageResult<Vec<u8>> {
        validate_key(key)?;
        let mut inner = self.inner.lock();
        inner.gets.push(key.to_string());
        inner
            .objects
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn put_object(&self, key: &str, content: &mut dyn Read) -> StorageResult<()> {
        validate_key(key)?;
        if self.inner.lock().reject_puts.iter().any(|p| key.contains(p.as_str())) {
            return Err(StorageError::Rejected(key.to_string()));
        }
        let mut data = Vec::new();
        content
            .read_to_end(&mut data)
            .map_err(|source| StorageError::Io { key: key.to_string(), source })?;
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let modified = UNIX_EPOCH + Duration::from_secs(inner.clock);
        inner.objects.insert(key.to_string(), (data, modified));
        Ok(())
    }

    fn list_folder(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        let inner = self.inner.lock();
        Ok(inner
            .objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (data, modified))| ObjectInfo {
                key: k.clone(),
                size: data.len() as u64,
                modified: *modified,
            })
            .collect())
    }

    fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.objects.remove(key);
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.inner.lock().objects.contains_key(key))
    }
}
