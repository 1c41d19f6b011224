//! Cleartext-to-ciphertext path translation.
//!
//! A cleartext path is resolved component by component: each directory
//! contributes a pointer file (named by encrypting the component under the
//! parent's id) whose contents are the child's id, and the child's entries
//! live at `d/<h[0..2]>/<h[2..]>` where `h` hashes that id. The physical
//! location of a directory therefore depends only on its id, never on its
//! cleartext name, which is what makes renaming a deep subtree cheap.
//!
//! Resolution results are cached (bounded, LRU) and invalidated on every
//! structural change.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::trace;

use crate::crypto::keys::MasterKey;
use crate::fs::longname::{self, LongNameError, LongNameStore};
use crate::fs::name::{self, NameError, DIRECTORY_PREFIX, SYMLINK_PREFIX};
use crate::vault::cache::BoundedCache;
use crate::vault::dir_id::{DirIdError, DirectoryIdProvider};
use crate::vault::path::{DirId, VaultPath};

/// Name of the data subtree inside the vault root.
pub const DATA_DIR_NAME: &str = "d";

/// Name of the long-name sidecar subtree inside the vault root.
pub const METADATA_DIR_NAME: &str = "m";

/// Bound on cached cleartext-path resolutions.
const CACHE_CAPACITY: usize = 1000;

/// The kind of an entry in the ciphertext data tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiphertextFileType {
    File,
    Directory,
    Symlink,
}

impl CiphertextFileType {
    /// Marker prefix this kind carries in the data tree.
    fn prefix(self) -> &'static str {
        match self {
            CiphertextFileType::File => "",
            CiphertextFileType::Directory => DIRECTORY_PREFIX,
            CiphertextFileType::Symlink => SYMLINK_PREFIX,
        }
    }
}

/// A resolved cleartext directory: its id and its physical location.
#[derive(Debug, Clone)]
pub struct CiphertextDirectory {
    pub dir_id: DirId,
    pub path: PathBuf,
}

/// Errors from path resolution.
#[derive(Error, Debug)]
pub enum PathMapError {
    /// A path component does not exist as a directory.
    #[error("No such directory: {path}")]
    NotFound { path: VaultPath },

    /// Filename encryption/decryption failed.
    #[error(transparent)]
    Name(#[from] NameError),

    /// Long-name sidecar handling failed.
    #[error(transparent)]
    LongName(#[from] LongNameError),

    /// Directory pointer handling failed.
    #[error(transparent)]
    DirId(#[from] DirIdError),

    /// Underlying filesystem error.
    #[error("IO error during path resolution: {0}")]
    Io(#[from] std::io::Error),
}

/// Translates cleartext vault paths into ciphertext host paths.
#[derive(Debug)]
pub struct PathMapper {
    data_root: PathBuf,
    long_names: LongNameStore,
    dir_ids: DirectoryIdProvider,
    master_key: Arc<MasterKey>,
    dir_cache: Mutex<BoundedCache<VaultPath, CiphertextDirectory>>,
}

impl PathMapper {
    pub fn new(vault_root: &Path, master_key: Arc<MasterKey>) -> Self {
        Self {
            data_root: vault_root.join(DATA_DIR_NAME),
            long_names: LongNameStore::new(vault_root.join(METADATA_DIR_NAME)),
            dir_ids: DirectoryIdProvider::new(),
            master_key: master_key.clone(),
            dir_cache: Mutex::new(BoundedCache::new(CACHE_CAPACITY)),
        }
    }

    /// The vault's `d/` directory.
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// The long-name sidecar store (`m/`).
    pub fn long_names(&self) -> &LongNameStore {
        &self.long_names
    }

    /// The directory-id provider.
    pub fn dir_ids(&self) -> &DirectoryIdProvider {
        &self.dir_ids
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, BoundedCache<VaultPath, CiphertextDirectory>> {
        self.dir_cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Physical data-tree location for a directory id.
    pub fn physical_dir_path(&self, dir_id: &DirId) -> Result<PathBuf, PathMapError> {
        let hash = name::hash_dir_id(dir_id.as_str(), &self.master_key)?;
        Ok(self.data_root.join(&hash[0..2]).join(&hash[2..]))
    }

    /// Resolve the root's ciphertext directory.
    pub fn root_directory(&self) -> Result<CiphertextDirectory, PathMapError> {
        let root_id = DirId::root();
        Ok(CiphertextDirectory {
            path: self.physical_dir_path(&root_id)?,
            dir_id: root_id,
        })
    }

    /// Resolve a cleartext directory path to its id and physical location.
    ///
    /// Walks from the root, resolving one pointer file per component and
    /// caching every prefix on the way down.
    pub fn ciphertext_dir(&self, path: &VaultPath) -> Result<CiphertextDirectory, PathMapError> {
        if let Some(cached) = self.lock_cache().get(path) {
            trace!(path = %path, "Path resolution cache hit");
            return Ok(cached.clone());
        }

        let mut current = self.root_directory()?;
        let mut prefix = VaultPath::root();

        for component in path.components() {
            prefix = prefix.join(component);

            if let Some(cached) = self.lock_cache().get(&prefix) {
                current = cached.clone();
                continue;
            }

            let pointer_path = self.pointer_file_path(&current, component)?;
            let dir_id = match self.dir_ids.load(&pointer_path) {
                Ok(id) => id,
                Err(DirIdError::NotFound { .. }) => {
                    return Err(PathMapError::NotFound {
                        path: prefix.clone(),
                    })
                }
                Err(e) => return Err(e.into()),
            };

            current = CiphertextDirectory {
                path: self.physical_dir_path(&dir_id)?,
                dir_id,
            };
            self.lock_cache().insert(prefix.clone(), current.clone());
        }

        Ok(current)
    }

    /// Ciphertext path of the pointer file for child directory `name` of
    /// `parent`.
    pub fn pointer_file_path(
        &self,
        parent: &CiphertextDirectory,
        name: &str,
    ) -> Result<PathBuf, PathMapError> {
        let storage_name =
            self.storage_entry_name(name, &parent.dir_id, CiphertextFileType::Directory, false)?;
        Ok(parent.path.join(storage_name))
    }

    /// The on-disk entry name for a cleartext name of the given kind,
    /// deflating long names.
    ///
    /// With `persist_sidecar` the deflated name's sidecar is written (create
    /// paths); without, deflation stays pure (lookup paths).
    pub fn storage_entry_name(
        &self,
        name: &str,
        dir_id: &DirId,
        kind: CiphertextFileType,
        persist_sidecar: bool,
    ) -> Result<String, PathMapError> {
        let encrypted = name::encrypt_name(name, dir_id.as_str(), &self.master_key)?;
        let full = format!("{}{}", kind.prefix(), encrypted);

        if !longname::needs_deflation(&full) {
            return Ok(full);
        }
        if persist_sidecar {
            Ok(self.long_names.deflate_and_persist(&full)?)
        } else {
            Ok(longname::deflate(&full))
        }
    }

    /// Decrypt an on-disk entry name back to its cleartext name and kind.
    ///
    /// Deflated names are inflated through the sidecar store first.
    pub fn decrypt_storage_name(
        &self,
        storage_name: &str,
        dir_id: &DirId,
    ) -> Result<(String, CiphertextFileType), PathMapError> {
        let full = if longname::is_deflated(storage_name) {
            self.long_names.inflate(storage_name)?
        } else {
            storage_name.to_string()
        };

        // Precedence in prefix parsing: "1S" before the bare-file fallback;
        // "0" cannot collide because BASE32 has no '0'
        let (kind, encrypted) = if let Some(rest) = full.strip_prefix(DIRECTORY_PREFIX) {
            (CiphertextFileType::Directory, rest)
        } else if let Some(rest) = full.strip_prefix(SYMLINK_PREFIX) {
            (CiphertextFileType::Symlink, rest)
        } else {
            (CiphertextFileType::File, full.as_str())
        };

        let cleartext = name::decrypt_name(encrypted, dir_id.as_str(), &self.master_key)?;
        Ok((cleartext, kind))
    }

    /// Ciphertext host path for the cleartext `path` of the given kind.
    ///
    /// Purely derivational; existence is not checked.
    pub fn ciphertext_path(
        &self,
        path: &VaultPath,
        kind: CiphertextFileType,
    ) -> Result<PathBuf, PathMapError> {
        self.ciphertext_path_inner(path, kind, false)
    }

    /// Like [`ciphertext_path`](Self::ciphertext_path), but persists the
    /// long-name sidecar when the entry name needs deflation. Use on create
    /// and move targets.
    pub fn ciphertext_path_for_create(
        &self,
        path: &VaultPath,
        kind: CiphertextFileType,
    ) -> Result<PathBuf, PathMapError> {
        self.ciphertext_path_inner(path, kind, true)
    }

    fn ciphertext_path_inner(
        &self,
        path: &VaultPath,
        kind: CiphertextFileType,
        persist_sidecar: bool,
    ) -> Result<PathBuf, PathMapError> {
        let (parent, name) = path.split().ok_or_else(|| PathMapError::NotFound {
            path: path.clone(),
        })?;
        let parent_dir = self.ciphertext_dir(&parent)?;
        let storage_name =
            self.storage_entry_name(name, &parent_dir.dir_id, kind, persist_sidecar)?;
        Ok(parent_dir.path.join(storage_name))
    }

    /// Determine what kind of entry a cleartext path denotes, if any.
    ///
    /// When multiple ciphertext candidates exist for the same cleartext name
    /// (possible under concurrent external writes), precedence is
    /// directory > symlink > file.
    pub fn ciphertext_file_type(
        &self,
        path: &VaultPath,
    ) -> Result<Option<CiphertextFileType>, PathMapError> {
        if path.is_root() {
            return Ok(Some(CiphertextFileType::Directory));
        }

        let (parent, name) = path.split().expect("non-root path splits");
        let parent_dir = match self.ciphertext_dir(&parent) {
            Ok(dir) => dir,
            Err(PathMapError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        for kind in [
            CiphertextFileType::Directory,
            CiphertextFileType::Symlink,
            CiphertextFileType::File,
        ] {
            let storage_name =
                self.storage_entry_name(name, &parent_dir.dir_id, kind, false)?;
            if parent_dir.path.join(storage_name).symlink_metadata().is_ok() {
                return Ok(Some(kind));
            }
        }
        Ok(None)
    }

    /// Drop cached resolutions for `path` and everything below it.
    ///
    /// Must be called on every structural change (create, delete, move).
    pub fn invalidate(&self, path: &VaultPath) {
        self.lock_cache().remove_where(|cached| cached.starts_with(path));
    }

    /// Drop every cached resolution.
    pub fn invalidate_all(&self) {
        self.lock_cache().clear();
    }
}
