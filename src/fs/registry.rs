//! Process-wide registry of open ciphertext files.
//!
//! For any physical ciphertext path there is at most one [`OpenCryptoFile`]
//! at any instant. Concurrent opens of the same path return the same handle
//! with its channel count incremented; the per-key locking of the underlying
//! map makes get-or-create atomic, so two racing openers cannot both
//! instantiate a handle for one path.
//!
//! An entry in `Closing` state is treated as absent for new opens, but it is
//! only removed from the map after its final flush completes. An opener that
//! loses this race re-looks the path up until the closer has finished.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use crate::crypto::keys::MasterKey;
use crate::fs::content::{ContentError, FileContext};
use crate::fs::open_file::{FileError, OpenCryptoFile};

/// Registry mapping canonical ciphertext paths to their open-file handles.
#[derive(Debug)]
pub struct OpenFileRegistry {
    files: DashMap<PathBuf, Arc<OpenCryptoFile>>,
    master_key: Arc<MasterKey>,
    cache_capacity: usize,
}

impl OpenFileRegistry {
    pub fn new(master_key: Arc<MasterKey>, cache_capacity: usize) -> Self {
        Self {
            files: DashMap::new(),
            master_key,
            cache_capacity,
        }
    }

    /// Atomically return the open file for `path`, creating it if absent.
    ///
    /// The handle's channel count is incremented (existing entry) or starts
    /// at 1 (fresh entry). Every successful call must be paired with one
    /// [`release`](OpenFileRegistry::release).
    pub fn get_or_create(
        &self,
        path: &Path,
        create: bool,
    ) -> Result<Arc<OpenCryptoFile>, FileError> {
        let key = canonical_key(path)
            .map_err(|e| ContentError::io_with_context(e, FileContext::new().with_path(path)))?;

        loop {
            match self.files.entry(key.clone()) {
                Entry::Occupied(occupied) => {
                    let existing = Arc::clone(occupied.get());
                    drop(occupied);
                    if existing.retain() {
                        trace!(path = %key.display(), "Reusing open ciphertext file");
                        return Ok(existing);
                    }
                    // The entry is mid-close; its final flush will remove it.
                    // Re-look it up rather than racing the closer.
                    std::thread::yield_now();
                }
                Entry::Vacant(vacant) => {
                    let file = OpenCryptoFile::open(
                        key.clone(),
                        create,
                        Arc::clone(&self.master_key),
                        self.cache_capacity,
                    )?;
                    let file = Arc::new(file);
                    vacant.insert(Arc::clone(&file));
                    trace!(path = %key.display(), "Registered open ciphertext file");
                    return Ok(file);
                }
            }
        }
    }

    /// Look up the open file for `path` without taking a reference.
    ///
    /// Used by size observation: an open file's in-memory length is more
    /// current than the ciphertext size on disk.
    pub fn peek(&self, path: &Path) -> Option<Arc<OpenCryptoFile>> {
        let key = canonical_key(path).ok()?;
        self.files.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    /// Release one channel reference on `file`. If it was the last, the file
    /// is flushed, closed, and unregistered.
    pub fn release(&self, file: &Arc<OpenCryptoFile>) -> Result<(), FileError> {
        if !file.release() {
            return Ok(());
        }

        // Last channel gone: finalize, then unregister. Removal happens even
        // when the flush fails, otherwise the Closing entry would block the
        // path forever.
        let result = file.finalize();
        self.files
            .remove_if(file.path(), |_, registered| Arc::ptr_eq(registered, file));
        result
    }

    /// Number of currently registered open files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Stable registry key for a ciphertext path.
///
/// The file itself may not exist yet (pending create), so the parent is
/// canonicalized and the final component appended.
fn canonical_key(path: &Path) -> io::Result<PathBuf> {
    match path.canonicalize() {
        Ok(canonical) => Ok(canonical),
        Err(_) => {
            let parent = path.parent().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "path has no parent")
            })?;
            let name = path.file_name().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "path has no file name")
            })?;
            Ok(parent.canonicalize()?.join(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn test_registry() -> (TempDir, Arc<OpenFileRegistry>) {
        let dir = TempDir::new().unwrap();
        let key = Arc::new(MasterKey::new([1u8; 32], [2u8; 32]).unwrap());
        (dir, Arc::new(OpenFileRegistry::new(key, 5)))
    }

    #[test]
    fn test_same_path_shares_one_handle() {
        let (dir, registry) = test_registry();
        let path = dir.path().join("file.enc");

        let a = registry.get_or_create(&path, true).unwrap();
        let b = registry.get_or_create(&path, true).unwrap();

        assert!(Arc::ptr_eq(&a, &b), "same path must share one OpenCryptoFile");
        assert_eq!(registry.len(), 1);

        registry.release(&a).unwrap();
        assert_eq!(registry.len(), 1, "entry stays while channels remain");
        registry.release(&b).unwrap();
        assert_eq!(registry.len(), 0, "entry removed after last release");
    }

    #[test]
    fn test_distinct_paths_get_distinct_handles() {
        let (dir, registry) = test_registry();
        let a = registry
            .get_or_create(&dir.path().join("a.enc"), true)
            .unwrap();
        let b = registry
            .get_or_create(&dir.path().join("b.enc"), true)
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);

        registry.release(&a).unwrap();
        registry.release(&b).unwrap();
    }

    #[test]
    fn test_reopen_after_close_creates_fresh_handle() {
        let (dir, registry) = test_registry();
        let path = dir.path().join("file.enc");

        let first = registry.get_or_create(&path, true).unwrap();
        first.write_at(b"hello", 0).unwrap();
        registry.release(&first).unwrap();

        let second = registry.get_or_create(&path, false).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.size(), 5);

        let mut buf = [0u8; 5];
        assert_eq!(second.read_at(&mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        registry.release(&second).unwrap();
    }

    #[test]
    fn test_peek_does_not_retain() {
        let (dir, registry) = test_registry();
        let path = dir.path().join("file.enc");

        assert!(registry.peek(&path).is_none());

        let handle = registry.get_or_create(&path, true).unwrap();
        let peeked = registry.peek(&path).unwrap();
        assert!(Arc::ptr_eq(&handle, &peeked));

        // One release (matching the one get_or_create) must close the file
        registry.release(&handle).unwrap();
        assert!(registry.peek(&path).is_none());
    }

    #[test]
    fn test_concurrent_opens_never_duplicate() {
        let (dir, registry) = test_registry();
        let path = dir.path().join("contended.enc");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let path = path.clone();
            handles.push(thread::spawn(move || {
                let file = registry.get_or_create(&path, true).unwrap();
                let ptr = Arc::as_ptr(&file) as usize;
                registry.release(&file).unwrap();
                ptr
            }));
        }

        let pointers: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // At any instant there is at most one handle per path, and the map
        // never holds two entries for it
        assert!(registry.len() <= 1);
        assert!(!pointers.is_empty());
    }

    #[test]
    fn test_open_while_closing_waits_for_fresh_handle() {
        let (dir, registry) = test_registry();
        let path = dir.path().join("file.enc");

        let first = registry.get_or_create(&path, true).unwrap();
        first.write_at(b"payload", 0).unwrap();

        let opener = {
            let registry = Arc::clone(&registry);
            let path = path.clone();
            thread::spawn(move || {
                let file = registry.get_or_create(&path, false).unwrap();
                let size = file.size();
                registry.release(&file).unwrap();
                size
            })
        };

        registry.release(&first).unwrap();
        // Whether the opener ran before or after the close, it must observe
        // the flushed contents
        assert_eq!(opener.join().unwrap(), 7);
    }
}
