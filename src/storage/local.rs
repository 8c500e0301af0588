use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use super::{validate_key, Folder, ObjectInfo, StorageError, StorageResult};

/// Folder backed by a directory on the local filesystem.
pub struct LocalFolder {
    root: PathBuf,
}

impl LocalFolder {
    /// Create a folder rooted at `root`; the directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        // Canonicalize if the path already exists so that listing can strip the
        // prefix even when the root is reached through a symlink.
        let root = fs::canonicalize(&root).unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn list_recursive(&self, dir: &Path, out: &mut Vec<ObjectInfo>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), out)?;
            } else if file_type.is_file() {
                let path = entry.path();
                // Skip in-flight temp files from a concurrent put.
                if path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with(".tmp")) {
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    let meta = entry.metadata()?;
                    out.push(ObjectInfo { key, size: meta.len(), modified: meta.modified()? });
                }
            }
        }
        Ok(())
    }
}

fn io_err(key: &str) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io { key: key.to_string(), source }
}

impl Folder for LocalFolder {
    fn get_object(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(io_err(key)(e)),
        }
    }

    fn put_object(&self, key: &str, content: &mut dyn Read) -> StorageResult<()> {
        let path = self.resolve(key)?;
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(io_err(key))?;
        // Write to a temp file in the same directory, then rename into place.
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(dir)
            .map_err(io_err(key))?;
        io::copy(content, &mut tmp).map_err(io_err(key))?;
        tmp.as_file().sync_all().map_err(io_err(key))?;
        tmp.persist(&path).map_err(|e| io_err(key)(e.error))?;
        Ok(())
    }

    fn list_folder(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        // The prefix may end in a partial name, so list its directory and filter.
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let dir = if dir_part.is_empty() { self.root.clone() } else { self.resolve(dir_part)? };
        let mut out = Vec::new();
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => self.list_recursive(&dir, &mut out).map_err(io_err(prefix))?,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(prefix)(e)),
        }
        out.retain(|o| o.key.starts_with(prefix));
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
        for key in keys {
            let path = self.resolve(key)?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(key)(e)),
            }
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(key)(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_list_delete() {
        let dir = tempdir().unwrap();
        let folder = LocalFolder::new(dir.path());
        folder.put_bytes("basebackups_005/a/one", b"1").unwrap();
        folder.put_bytes("basebackups_005/a/two", b"22").unwrap();
        folder.put_bytes("other/x", b"x").unwrap();

        assert_eq!(folder.get_object("basebackups_005/a/two").unwrap(), b"22");
        let listed: Vec<_> = folder
            .list_folder("basebackups_005/")
            .unwrap()
            .into_iter()
            .map(|o| (o.key, o.size))
            .collect();
        assert_eq!(
            listed,
            vec![("basebackups_005/a/one".to_string(), 1), ("basebackups_005/a/two".to_string(), 2)]
        );

        folder.delete_objects(&["basebackups_005/a/one".to_string(), "missing".to_string()]).unwrap();
        assert!(!folder.exists("basebackups_005/a/one").unwrap());
        assert!(folder.get_object("basebackups_005/a/one").unwrap_err().is_not_found());
    }

    #[test]
    fn list_with_partial_name_prefix() {
        let dir = tempdir().unwrap();
        let folder = LocalFolder::new(dir.path());
        folder.put_bytes("b/base_1_backup_stop_sentinel.json", b"{}").unwrap();
        folder.put_bytes("b/other.json", b"{}").unwrap();
        let listed = folder.list_folder("b/base_").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "b/base_1_backup_stop_sentinel.json");
    }
}
