use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::TorrentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
}

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0:?} is already open for writing by another storage")]
    Collision(PathBuf),
}

struct Entry {
    file: Arc<RwLock<File>>,
    mode: FileMode,
    last_use: Instant,
    path: PathBuf,
}

struct Inner {
    entries: HashMap<(TorrentId, usize), Entry>,
    writers_by_path: HashMap<PathBuf, TorrentId>,
}

/// Bounded LRU of open file handles keyed by `(storage, file_index)`, shared
/// by every torrent's disk-side storage (spec.md §4.A). Serialised by an
/// internal mutex; handles are reference-counted so an entry evicted or
/// released while an I/O job still holds it stays open until that job drops it.
pub struct FilePool {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl FilePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner { entries: HashMap::new(), writers_by_path: HashMap::new() }),
        }
    }

    /// Returns a handle for `(storage, file_index)` at `path`, opening it if
    /// necessary. A read-only handle is transparently upgraded (closed and
    /// reopened) when a write is requested. Two storages opening the same
    /// path for writing is a collision error, not silently serialised.
    pub fn acquire(
        &self,
        storage: TorrentId,
        file_index: usize,
        path: &Path,
        mode: FileMode,
    ) -> Result<Arc<RwLock<File>>, PoolError> {
        let mut inner = self.inner.lock().expect("file pool mutex poisoned");

        if let Some(entry) = inner.entries.get_mut(&(storage, file_index)) {
            if entry.mode == FileMode::Read && mode == FileMode::Write {
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                entry.file = Arc::new(RwLock::new(file));
                entry.mode = FileMode::Write;
                inner.writers_by_path.insert(path.to_path_buf(), storage);
            }
            entry.last_use = Instant::now();
            return Ok(Arc::clone(&entry.file));
        }

        if mode == FileMode::Write {
            if let Some(&owner) = inner.writers_by_path.get(path) {
                if owner != storage {
                    return Err(PoolError::Collision(path.to_path_buf()));
                }
            }
        }

        if inner.entries.len() >= self.capacity {
            Self::evict_oldest(&mut inner);
        }

        let file =
            OpenOptions::new().create(true).read(true).write(mode == FileMode::Write).open(path)?;

        if mode == FileMode::Write {
            inner.writers_by_path.insert(path.to_path_buf(), storage);
        }

        let handle = Arc::new(RwLock::new(file));
        inner.entries.insert(
            (storage, file_index),
            Entry { file: Arc::clone(&handle), mode, last_use: Instant::now(), path: path.to_path_buf() },
        );
        Ok(handle)
    }

    fn evict_oldest(inner: &mut Inner) {
        let oldest = inner.entries.iter().min_by_key(|(_, e)| e.last_use).map(|(&k, _)| k);
        if let Some(key) = oldest {
            if let Some(entry) = inner.entries.remove(&key) {
                if entry.mode == FileMode::Write {
                    inner.writers_by_path.remove(&entry.path);
                }
            }
        }
    }

    /// Closes every handle belonging to `storage`. Handles already borrowed
    /// by an in-flight job outlive this call.
    pub fn release(&self, storage: TorrentId) {
        let mut inner = self.inner.lock().expect("file pool mutex poisoned");
        let paths: Vec<PathBuf> = inner
            .entries
            .iter()
            .filter(|((id, _), _)| *id == storage)
            .map(|(_, e)| e.path.clone())
            .collect();
        inner.entries.retain(|(id, _), _| *id != storage);
        for path in paths {
            if inner.writers_by_path.get(&path) == Some(&storage) {
                inner.writers_by_path.remove(&path);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("file pool mutex poisoned").entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_reuses_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        let pool = FilePool::new(2);
        let storage = [1; 20];
        let h1 = pool.acquire(storage, 0, &path, FileMode::Read).unwrap();
        let h2 = pool.acquire(storage, 0, &path, FileMode::Read).unwrap();
        assert!(Arc::ptr_eq(&h1, &h2));
    }

    #[test]
    fn test_write_collision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        let pool = FilePool::new(2);
        pool.acquire([1; 20], 0, &path, FileMode::Write).unwrap();
        let err = pool.acquire([2; 20], 0, &path, FileMode::Write).unwrap_err();
        assert!(matches!(err, PoolError::Collision(_)));
    }

    #[test]
    fn test_pool_bound_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FilePool::new(1);
        let storage = [1; 20];
        pool.acquire(storage, 0, &dir.path().join("a"), FileMode::Read).unwrap();
        pool.acquire(storage, 1, &dir.path().join("b"), FileMode::Read).unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_release_closes_storage_handles() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FilePool::new(4);
        let storage = [1; 20];
        pool.acquire(storage, 0, &dir.path().join("a"), FileMode::Write).unwrap();
        pool.release(storage);
        assert_eq!(pool.len(), 0);
        // Path is free again for a different storage.
        pool.acquire([2; 20], 0, &dir.path().join("a"), FileMode::Write).unwrap();
    }
}
