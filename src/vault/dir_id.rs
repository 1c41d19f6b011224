//! Directory-id resolution and caching.
//!
//! Every cleartext directory is represented by a pointer file in its
//! parent's data-tree location; the pointer's *name* encodes the cleartext
//! name, its *contents* are the directory's UUID. A directory move relocates
//! the pointer file but never rewrites its contents, so cached ids stay
//! valid across renames as long as they are keyed by the pointer's current
//! location. Readers may observe a stale absence after an invalidation, but
//! never a stale presence.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::vault::cache::BoundedCache;
use crate::vault::path::DirId;

/// Upper bound on cached pointer-file → id mappings.
const CACHE_CAPACITY: usize = 5000;

/// A UUID string is 36 bytes; anything much larger in a pointer file is junk.
const MAX_DIR_ID_LENGTH: u64 = 72;

/// Errors from directory-id resolution.
#[derive(Error, Debug)]
pub enum DirIdError {
    /// The pointer file does not exist.
    #[error("Directory pointer file not found: {path}")]
    NotFound { path: PathBuf },

    /// The pointer file is empty, oversized, or not UTF-8.
    #[error("Malformed directory pointer file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// Underlying filesystem error.
    #[error("IO error reading directory pointer {path}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

/// Cached mapping from pointer-file paths to directory ids.
#[derive(Debug)]
pub struct DirectoryIdProvider {
    cache: Mutex<BoundedCache<PathBuf, DirId>>,
}

impl Default for DirectoryIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryIdProvider {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(BoundedCache::new(CACHE_CAPACITY)),
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, BoundedCache<PathBuf, DirId>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve the directory id stored in the pointer file at `pointer_path`.
    ///
    /// On a cache miss the file's contents are read as UTF-8 and cached.
    pub fn load(&self, pointer_path: &Path) -> Result<DirId, DirIdError> {
        if let Some(cached) = self.lock_cache().get(&pointer_path.to_path_buf()) {
            trace!(pointer = %pointer_path.display(), "Directory id cache hit");
            return Ok(cached.clone());
        }

        let metadata = fs::metadata(pointer_path).map_err(|e| classify_io(e, pointer_path))?;
        if metadata.len() == 0 || metadata.len() > MAX_DIR_ID_LENGTH {
            return Err(DirIdError::Malformed {
                path: pointer_path.to_path_buf(),
                reason: format!("pointer file has implausible size {}", metadata.len()),
            });
        }

        let bytes = fs::read(pointer_path).map_err(|e| classify_io(e, pointer_path))?;
        let id = String::from_utf8(bytes).map_err(|_| DirIdError::Malformed {
            path: pointer_path.to_path_buf(),
            reason: "pointer contents are not valid UTF-8".to_string(),
        })?;

        let dir_id = DirId::from_raw(id);
        self.lock_cache()
            .insert(pointer_path.to_path_buf(), dir_id.clone());
        debug!(pointer = %pointer_path.display(), dir_id = %dir_id, "Loaded directory id");
        Ok(dir_id)
    }

    /// Generate a fresh v4 UUID for a directory about to be created, caching
    /// it under `pointer_path`.
    ///
    /// The caller is responsible for persisting the id into the pointer
    /// file; caching up front means the create path never re-reads its own
    /// write.
    pub fn create(&self, pointer_path: &Path) -> DirId {
        let dir_id = DirId::from_raw(Uuid::new_v4().to_string());
        self.lock_cache()
            .insert(pointer_path.to_path_buf(), dir_id.clone());
        debug!(pointer = %pointer_path.display(), dir_id = %dir_id, "Created directory id");
        dir_id
    }

    /// Forget the cached id for `pointer_path`.
    ///
    /// Called when the pointer file is deleted or moved away; a stale
    /// presence must never be served.
    pub fn invalidate(&self, pointer_path: &Path) {
        self.lock_cache().remove(&pointer_path.to_path_buf());
    }

    /// Re-key a cached id after its pointer file moved.
    pub fn moved(&self, old_pointer: &Path, new_pointer: &Path) {
        let mut cache = self.lock_cache();
        if let Some(id) = cache.remove(&old_pointer.to_path_buf()) {
            cache.insert(new_pointer.to_path_buf(), id);
        }
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.lock_cache().len()
    }
}

fn classify_io(e: io::Error, path: &Path) -> DirIdError {
    if e.kind() == io::ErrorKind::NotFound {
        DirIdError::NotFound {
            path: path.to_path_buf(),
        }
    } else {
        DirIdError::Io {
            source: e,
            path: path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_reads_pointer_contents() {
        let tmp = TempDir::new().unwrap();
        let pointer = tmp.path().join("0POINTER");
        fs::write(&pointer, "e9250eb8-078d-4fc0-8835-be92a313360c").unwrap();

        let provider = DirectoryIdProvider::new();
        let id = provider.load(&pointer).unwrap();
        assert_eq!(id.as_str(), "e9250eb8-078d-4fc0-8835-be92a313360c");
        assert_eq!(provider.cached_len(), 1);
    }

    #[test]
    fn test_load_serves_cached_value_after_file_removal() {
        let tmp = TempDir::new().unwrap();
        let pointer = tmp.path().join("0POINTER");
        fs::write(&pointer, "some-id").unwrap();

        let provider = DirectoryIdProvider::new();
        provider.load(&pointer).unwrap();

        // The cache answers even though the file is gone; only an explicit
        // invalidation flushes the key
        fs::remove_file(&pointer).unwrap();
        assert_eq!(provider.load(&pointer).unwrap().as_str(), "some-id");

        provider.invalidate(&pointer);
        assert!(matches!(
            provider.load(&pointer),
            Err(DirIdError::NotFound { .. })
        ));
    }

    #[test]
    fn test_missing_pointer() {
        let tmp = TempDir::new().unwrap();
        let provider = DirectoryIdProvider::new();
        let result = provider.load(&tmp.path().join("0NOPE"));
        assert!(matches!(result, Err(DirIdError::NotFound { .. })));
    }

    #[test]
    fn test_empty_pointer_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let pointer = tmp.path().join("0EMPTY");
        fs::write(&pointer, "").unwrap();

        let provider = DirectoryIdProvider::new();
        let result = provider.load(&pointer);
        assert!(matches!(result, Err(DirIdError::Malformed { .. })));
    }

    #[test]
    fn test_oversized_pointer_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let pointer = tmp.path().join("0BIG");
        fs::write(&pointer, "x".repeat(100)).unwrap();

        let provider = DirectoryIdProvider::new();
        let result = provider.load(&pointer);
        assert!(matches!(result, Err(DirIdError::Malformed { .. })));
    }

    #[test]
    fn test_create_generates_distinct_uuids() {
        let tmp = TempDir::new().unwrap();
        let provider = DirectoryIdProvider::new();

        let a = provider.create(&tmp.path().join("0A"));
        let b = provider.create(&tmp.path().join("0B"));

        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36, "v4 UUID string form");
        assert_eq!(provider.cached_len(), 2);
    }

    #[test]
    fn test_moved_rekeys_cache() {
        let tmp = TempDir::new().unwrap();
        let old_pointer = tmp.path().join("0OLD");
        let new_pointer = tmp.path().join("0NEW");
        fs::write(&old_pointer, "moving-id").unwrap();

        let provider = DirectoryIdProvider::new();
        provider.load(&old_pointer).unwrap();

        provider.moved(&old_pointer, &new_pointer);

        // New key answers from cache without the file existing there
        assert_eq!(provider.load(&new_pointer).unwrap().as_str(), "moving-id");
        // Old key no longer answers from cache
        fs::remove_file(&old_pointer).unwrap();
        assert!(provider.load(&old_pointer).is_err());
    }
}
