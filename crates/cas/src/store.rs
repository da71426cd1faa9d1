//! Content store contract and an on-disk reference store
//!
//! The cache client never hashes or persists file content itself; it asks a
//! [`ContentStore`] for keys and for the stored payload of a key. Embedders
//! normally back this with their own storage engine. [`DiskStore`] is a small
//! directory-backed implementation that keeps payloads in a two-level layout:
//!
//! ```text
//! <root>/
//!   ab/
//!     cd/
//!       abcd0123...  (payload, zstd frame for compressed keys)
//! ```

use crate::{CasKey, Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::{debug, trace};

/// Storage collaborator used by the cache client.
///
/// Keys handed out by a store always carry the compressed tag: stored
/// payloads are zstd frames.
pub trait ContentStore: Send + Sync {
    /// Hash the file at `path` without retaining its content.
    ///
    /// Returns `Ok(None)` when the file does not exist. `file_is_compressed`
    /// says the file on disk is already a zstd frame.
    fn store_cas_key(&self, path: &Path, file_is_compressed: bool) -> Result<Option<CasKey>>;

    /// Hash the file at `path` and retain its payload so it can be uploaded.
    fn store_cas_file(&self, path: &Path, file_is_compressed: bool) -> Result<Option<CasKey>>;

    /// Returns true if the payload for `key` is held by this store
    fn has_cas_file(&self, key: CasKey) -> bool;

    /// Location of the retained payload for `key`
    fn cas_file_name(&self, key: CasKey) -> Option<PathBuf>;

    /// Register `path` as already holding the content of `key`, so later
    /// lookups do not rehash it.
    fn fake_copy(&self, key: CasKey, path: &Path, size: u64, last_written: SystemTime) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct FileEntry {
    key: CasKey,
    size: u64,
    last_written: SystemTime,
}

/// Directory-backed [`ContentStore`]
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    files: RwLock<HashMap<PathBuf, FileEntry>>,
}

impl DiskStore {
    /// Create a store keeping payloads under `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Root directory of the payloads
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a payload: `{root}/{hex[0:2]}/{hex[2:4]}/{hex}`
    fn blob_path(&self, key: CasKey) -> PathBuf {
        let hex = key.to_string();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    fn file_stamp(path: &Path) -> Result<Option<(u64, SystemTime)>> {
        match fs::metadata(path) {
            Ok(meta) => {
                let modified = meta.modified().map_err(|e| Error::io(e, path, "metadata"))?;
                Ok(Some((meta.len(), modified)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(e, path, "metadata")),
        }
    }

    fn cached_key(&self, path: &Path, size: u64, last_written: SystemTime) -> Option<CasKey> {
        self.files
            .read()
            .get(path)
            .filter(|entry| entry.size == size && entry.last_written == last_written)
            .map(|entry| entry.key)
    }

    fn hash_file(&self, path: &Path, file_is_compressed: bool) -> Result<Option<(CasKey, Vec<u8>)>> {
        let Some((size, last_written)) = Self::file_stamp(path)? else {
            return Ok(None);
        };
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, path, "read")),
        };
        let key = CasKey::for_file_bytes(&data, file_is_compressed)?.as_compressed(true);
        self.files.write().insert(
            path.to_path_buf(),
            FileEntry {
                key,
                size,
                last_written,
            },
        );
        trace!(path = %path.display(), %key, "Hashed file");
        Ok(Some((key, data)))
    }

    fn write_blob(&self, key: CasKey, payload: &[u8]) -> Result<()> {
        let path = self.blob_path(key);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }

        // Each writer gets its own temporary file; payloads for one key are identical
        let dir = path.parent().unwrap_or(self.root.as_path());
        let mut file = NamedTempFile::new_in(dir).map_err(|e| Error::io(e, dir, "create"))?;
        file.write_all(payload)
            .map_err(|e| Error::io(e, file.path(), "write"))?;
        file.as_file()
            .sync_all()
            .map_err(|e| Error::io(e, file.path(), "sync"))?;
        if let Err(e) = file.persist(&path) {
            if path.exists() {
                trace!(%key, "Payload stored by another writer");
                return Ok(());
            }
            return Err(Error::io(e.error, &path, "persist"));
        }

        debug!(%key, bytes = payload.len(), "Stored payload");
        Ok(())
    }
}

impl ContentStore for DiskStore {
    fn store_cas_key(&self, path: &Path, file_is_compressed: bool) -> Result<Option<CasKey>> {
        let Some((size, last_written)) = Self::file_stamp(path)? else {
            return Ok(None);
        };
        if let Some(key) = self.cached_key(path, size, last_written) {
            return Ok(Some(key));
        }
        Ok(self.hash_file(path, file_is_compressed)?.map(|(key, _)| key))
    }

    fn store_cas_file(&self, path: &Path, file_is_compressed: bool) -> Result<Option<CasKey>> {
        let Some((key, data)) = self.hash_file(path, file_is_compressed)? else {
            return Ok(None);
        };
        if !self.has_cas_file(key) {
            if file_is_compressed {
                self.write_blob(key, &data)?;
            } else {
                self.write_blob(key, &crate::compress(&data)?)?;
            }
        }
        Ok(Some(key))
    }

    fn has_cas_file(&self, key: CasKey) -> bool {
        self.blob_path(key).exists()
    }

    fn cas_file_name(&self, key: CasKey) -> Option<PathBuf> {
        let path = self.blob_path(key);
        path.exists().then_some(path)
    }

    fn fake_copy(&self, key: CasKey, path: &Path, size: u64, last_written: SystemTime) -> Result<()> {
        self.files.write().insert(
            path.to_path_buf(),
            FileEntry {
                key,
                size,
                last_written,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_cas_key_missing_file() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::new(tmp.path().join("cas"));
        let key = store
            .store_cas_key(&tmp.path().join("nope.obj"), false)
            .unwrap();
        assert!(key.is_none());
    }

    #[test]
    fn test_store_cas_key_is_compressed_and_stable() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::new(tmp.path().join("cas"));
        let file = tmp.path().join("a.cpp");
        fs::write(&file, b"int a;").unwrap();

        let key = store.store_cas_key(&file, false).unwrap().unwrap();
        assert!(key.is_compressed());
        assert_eq!(key.as_compressed(false), CasKey::from_content(b"int a;"));
        assert_eq!(store.store_cas_key(&file, false).unwrap(), Some(key));
        // Only hashing, no payload retained
        assert!(!store.has_cas_file(key));
    }

    #[test]
    fn test_store_cas_file_retains_compressed_payload() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::new(tmp.path().join("cas"));
        let file = tmp.path().join("a.obj");
        fs::write(&file, b"object bytes").unwrap();

        let key = store.store_cas_file(&file, false).unwrap().unwrap();
        assert!(store.has_cas_file(key));
        let blob = store.cas_file_name(key).unwrap();
        assert_eq!(crate::decompress(&fs::read(blob).unwrap()).unwrap(), b"object bytes");
    }

    #[test]
    fn test_compressed_on_disk_file_is_stored_as_is() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::new(tmp.path().join("cas"));
        let file = tmp.path().join("a.obj");
        let frame = crate::compress(b"raw object").unwrap();
        fs::write(&file, &frame).unwrap();

        let key = store.store_cas_file(&file, true).unwrap().unwrap();
        assert_eq!(key, CasKey::from_content(b"raw object").as_compressed(true));
        assert_eq!(fs::read(store.cas_file_name(key).unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_concurrent_stores_of_same_content_succeed() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::new(tmp.path().join("cas"));
        let files: Vec<_> = (0..8)
            .map(|i| {
                let file = tmp.path().join(format!("out{i}.obj"));
                fs::write(&file, b"identical object").unwrap();
                file
            })
            .collect();

        let key = CasKey::from_content(b"identical object").as_compressed(true);
        for _ in 0..20 {
            if let Some(blob) = store.cas_file_name(key) {
                fs::remove_file(blob).unwrap();
            }
            std::thread::scope(|scope| {
                let handles: Vec<_> = files
                    .iter()
                    .map(|file| scope.spawn(|| store.store_cas_file(file, false)))
                    .collect();
                for handle in handles {
                    assert_eq!(handle.join().unwrap().unwrap(), Some(key));
                }
            });
            assert!(store.has_cas_file(key));
        }
        // No temporaries left next to the payload
        let shard = store.blob_path(key).parent().unwrap().to_path_buf();
        assert_eq!(fs::read_dir(shard).unwrap().count(), 1);
    }

    #[test]
    fn test_fake_copy_skips_rehash() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::new(tmp.path().join("cas"));
        let file = tmp.path().join("out.o");
        fs::write(&file, b"real").unwrap();
        let meta = fs::metadata(&file).unwrap();

        let claimed = CasKey::from_content(b"claimed").as_compressed(true);
        store
            .fake_copy(claimed, &file, meta.len(), meta.modified().unwrap())
            .unwrap();
        assert_eq!(store.store_cas_key(&file, false).unwrap(), Some(claimed));
    }
}
