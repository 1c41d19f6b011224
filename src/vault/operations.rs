//! High-level cleartext operations over a vault.
//!
//! [`CryptoFs`] is the surface callers interact with: initialize and open
//! vaults, then manipulate cleartext paths. Every operation translates
//! through the [`PathMapper`] into reads and writes of encrypted content in
//! the data tree, with file I/O multiplexed through the process-wide
//! [`OpenFileRegistry`].
//!
//! Vaults are scoped: opening the same root twice shares one in-memory
//! state behind a global table; the master key is dropped (and zeroized)
//! when the last handle closes.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::crypto::keys::MasterKey;
use crate::crypto::CryptoError;
use crate::fs::content::{cleartext_size_or_zero, ContentError};
use crate::fs::longname::{is_deflated, LongNameError};
use crate::fs::name::NameError;
use crate::fs::open_file::{CleartextFileChannel, FileError, OpenOptionsCleartext};
use crate::fs::registry::OpenFileRegistry;
use crate::fs::symlink::{
    decrypt_symlink_target, encrypt_symlink_target, SymlinkContext, SymlinkError,
};
use crate::vault::master_key::{create_masterkey_file, MasterKeyError, MasterKeyFile};
use crate::vault::options::{VaultOptions, VaultOptionsError};
use crate::vault::path::VaultPath;
use crate::vault::path_mapper::{
    CiphertextFileType, PathMapError, PathMapper, DATA_DIR_NAME, METADATA_DIR_NAME,
};

/// Default chunk-cache capacity per open file.
const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 5;

/// The kind of a cleartext directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
}

impl From<CiphertextFileType> for EntryType {
    fn from(kind: CiphertextFileType) -> Self {
        match kind {
            CiphertextFileType::File => EntryType::File,
            CiphertextFileType::Directory => EntryType::Directory,
            CiphertextFileType::Symlink => EntryType::Symlink,
        }
    }
}

/// One entry of a cleartext directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryType,
}

/// Errors surfaced by vault operations.
#[derive(Error, Debug)]
pub enum VaultOperationError {
    #[error("No such file or directory: {path}")]
    NotFound { path: VaultPath },

    #[error("Not a directory: {path}")]
    NotADirectory { path: VaultPath },

    #[error("Not a file: {path}")]
    NotAFile { path: VaultPath },

    #[error("Path already exists: {path}")]
    PathAlreadyExists { path: VaultPath },

    #[error("Directory not empty: {path}")]
    DirectoryNotEmpty { path: VaultPath },

    #[error("No vault at {root}: masterkey file missing")]
    NotAVault { root: PathBuf },

    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Unsupported vault version {found}")]
    UnsupportedVaultVersion { found: u32 },

    #[error("Vault version {found} needs migration")]
    VaultNeedsMigration { found: u32 },

    #[error("Filesystem is closed")]
    FilesystemClosed,

    #[error("Vault is opened read-only")]
    ReadOnly,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Options(#[from] VaultOptionsError),

    #[error("Masterkey failure: {0}")]
    MasterKey(MasterKeyError),

    #[error(transparent)]
    PathMap(#[from] PathMapError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Symlink(#[from] SymlinkError),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error(transparent)]
    LongName(#[from] LongNameError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<MasterKeyError> for VaultOperationError {
    fn from(e: MasterKeyError) -> Self {
        match e {
            MasterKeyError::UnsupportedVaultVersion { found } => {
                VaultOperationError::UnsupportedVaultVersion { found }
            }
            MasterKeyError::VaultNeedsMigration { found } => {
                VaultOperationError::VaultNeedsMigration { found }
            }
            MasterKeyError::Crypto(CryptoError::KeyUnwrapIntegrityFailed) => {
                VaultOperationError::InvalidPassphrase
            }
            MasterKeyError::Io(e) => VaultOperationError::Io(e),
            other => VaultOperationError::MasterKey(other),
        }
    }
}

/// Shared per-vault state, one instance per open vault root.
#[derive(Debug)]
struct VaultState {
    root: PathBuf,
    mapper: PathMapper,
    registry: Arc<OpenFileRegistry>,
    master_key: Arc<MasterKey>,
}

#[derive(Debug)]
struct VaultSlot {
    state: Arc<VaultState>,
    open_count: usize,
}

/// Global table of open vaults, keyed by canonicalized root.
static OPEN_VAULTS: OnceLock<DashMap<PathBuf, VaultSlot>> = OnceLock::new();

fn open_vaults() -> &'static DashMap<PathBuf, VaultSlot> {
    OPEN_VAULTS.get_or_init(DashMap::new)
}

/// A handle on an open vault.
///
/// Handles on the same root share state (path caches, open files, master
/// key); each handle carries its own read-only flag and closed state.
/// Dropping a handle closes it.
#[derive(Debug)]
pub struct CryptoFs {
    state: Arc<VaultState>,
    readonly: bool,
    closed: AtomicBool,
}

impl CryptoFs {
    /// Initialize a new vault: masterkey file, `d/` and `m/` subtrees, and
    /// the root directory's storage location.
    #[instrument(skip(options))]
    pub fn initialize(root: &Path, options: &VaultOptions) -> Result<(), VaultOperationError> {
        fs::create_dir_all(root)?;

        let masterkey_path = root.join(options.masterkey_filename());
        if masterkey_path.exists() {
            return Err(VaultOperationError::PathAlreadyExists {
                path: VaultPath::root(),
            });
        }

        let master_key = MasterKey::random().map_err(|e| {
            VaultOperationError::MasterKey(MasterKeyError::KeyAccess(e))
        })?;
        let json = create_masterkey_file(&master_key, options.passphrase(), options.pepper())?;
        fs::write(&masterkey_path, json)?;

        fs::create_dir_all(root.join(DATA_DIR_NAME))?;
        fs::create_dir_all(root.join(METADATA_DIR_NAME))?;

        // Bootstrap the root directory's physical location
        let mapper = PathMapper::new(root, Arc::new(master_key));
        let root_dir = mapper.root_directory()?;
        fs::create_dir_all(&root_dir.path)?;

        info!(root = %root.display(), "Initialized vault");
        Ok(())
    }

    /// Open a vault with the given options.
    ///
    /// The passphrase is always verified, even when the vault is already
    /// open and its in-memory state gets shared.
    #[instrument(skip(options))]
    pub fn open(root: &Path, options: &VaultOptions) -> Result<Self, VaultOperationError> {
        let root = root
            .canonicalize()
            .map_err(|_| VaultOperationError::NotAVault {
                root: root.to_path_buf(),
            })?;

        let masterkey_path = root.join(options.masterkey_filename());
        if !masterkey_path.exists() {
            return Err(VaultOperationError::NotAVault { root });
        }

        let masterkey_file = MasterKeyFile::load(&masterkey_path)?;
        let master_key = masterkey_file.unlock(options.passphrase(), options.pepper())?;

        let mut slot = open_vaults()
            .entry(root.clone())
            .or_insert_with(|| {
                let master_key = Arc::new(master_key);
                let state = Arc::new(VaultState {
                    root: root.clone(),
                    mapper: PathMapper::new(&root, Arc::clone(&master_key)),
                    registry: Arc::new(OpenFileRegistry::new(
                        Arc::clone(&master_key),
                        DEFAULT_CHUNK_CACHE_CAPACITY,
                    )),
                    master_key,
                });
                VaultSlot {
                    state,
                    open_count: 0,
                }
            });
        slot.open_count += 1;
        let state = Arc::clone(&slot.state);
        drop(slot);

        debug!(root = %state.root.display(), "Opened vault");
        Ok(Self {
            state,
            readonly: options.is_readonly(),
            closed: AtomicBool::new(false),
        })
    }

    /// Close this handle. The vault's cached state and key material are
    /// released when the last handle on this root closes.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let vaults = open_vaults();
        let remove = match vaults.get_mut(&self.state.root) {
            Some(mut slot) => {
                slot.open_count = slot.open_count.saturating_sub(1);
                slot.open_count == 0
            }
            None => false,
        };
        if remove {
            vaults.remove_if(&self.state.root, |_, slot| slot.open_count == 0);
            debug!(root = %self.state.root.display(), "Released vault state");
        }
    }

    /// The vault root directory on the host filesystem.
    pub fn vault_root(&self) -> &Path {
        &self.state.root
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    fn ensure_open(&self) -> Result<(), VaultOperationError> {
        if self.closed.load(Ordering::Acquire) {
            Err(VaultOperationError::FilesystemClosed)
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self) -> Result<(), VaultOperationError> {
        self.ensure_open()?;
        if self.readonly {
            Err(VaultOperationError::ReadOnly)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Observation
    // ========================================================================

    /// The kind of entry at `path`, or `None` when nothing exists there.
    pub fn file_type(
        &self,
        path: impl Into<VaultPath>,
    ) -> Result<Option<EntryType>, VaultOperationError> {
        self.ensure_open()?;
        let path = path.into();
        Ok(self
            .state
            .mapper
            .ciphertext_file_type(&path)?
            .map(EntryType::from))
    }

    pub fn exists(&self, path: impl Into<VaultPath>) -> Result<bool, VaultOperationError> {
        Ok(self.file_type(path)?.is_some())
    }

    /// Cleartext size of the file at `path`.
    ///
    /// If the file is currently open, the in-memory length (which includes
    /// not-yet-flushed extensions) takes precedence over the value derived
    /// from the ciphertext size on disk.
    pub fn size(&self, path: impl Into<VaultPath>) -> Result<u64, VaultOperationError> {
        self.ensure_open()?;
        let path = path.into();
        match self.state.mapper.ciphertext_file_type(&path)? {
            Some(CiphertextFileType::File) => {}
            Some(_) => return Err(VaultOperationError::NotAFile { path }),
            None => return Err(VaultOperationError::NotFound { path }),
        }

        let ciphertext_path = self
            .state
            .mapper
            .ciphertext_path(&path, CiphertextFileType::File)?;
        if let Some(open_file) = self.state.registry.peek(&ciphertext_path) {
            return Ok(open_file.size());
        }
        let metadata = fs::metadata(&ciphertext_path)?;
        Ok(cleartext_size_or_zero(metadata.len()))
    }

    /// List the cleartext entries of the directory at `path`, sorted by name.
    ///
    /// Entries whose names fail inflation or authentication are skipped with
    /// a warning rather than failing the whole listing; an external tool may
    /// have dropped foreign files into the data tree.
    pub fn list_dir(
        &self,
        path: impl Into<VaultPath>,
    ) -> Result<Vec<DirEntry>, VaultOperationError> {
        self.ensure_open()?;
        let path = path.into();
        match self.state.mapper.ciphertext_file_type(&path)? {
            Some(CiphertextFileType::Directory) => {}
            Some(_) => return Err(VaultOperationError::NotADirectory { path }),
            None => return Err(VaultOperationError::NotFound { path }),
        }

        let dir = self.state.mapper.ciphertext_dir(&path)?;
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&dir.path)? {
            let dir_entry = dir_entry?;
            let storage_name = dir_entry.file_name();
            let Some(storage_name) = storage_name.to_str() else {
                warn!(entry = ?storage_name, "Skipping non-UTF-8 entry in data tree");
                continue;
            };

            match self
                .state
                .mapper
                .decrypt_storage_name(storage_name, &dir.dir_id)
            {
                Ok((name, kind)) => entries.push(DirEntry {
                    name,
                    kind: kind.into(),
                }),
                Err(e) => {
                    warn!(
                        entry = storage_name,
                        error = %e,
                        "Skipping undecryptable entry in data tree"
                    );
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    // ========================================================================
    // File channels
    // ========================================================================

    /// Open a cleartext channel on the file at `path`.
    pub fn open_file(
        &self,
        path: impl Into<VaultPath>,
        options: OpenOptionsCleartext,
    ) -> Result<CleartextFileChannel, VaultOperationError> {
        self.ensure_open()?;
        if options.write {
            self.ensure_writable()?;
        }
        let path = path.into();

        let existing = self.state.mapper.ciphertext_file_type(&path)?;
        let creating = match existing {
            Some(CiphertextFileType::File) => {
                if options.create_new {
                    return Err(VaultOperationError::PathAlreadyExists { path });
                }
                false
            }
            Some(_) => return Err(VaultOperationError::NotAFile { path }),
            None => {
                if !options.create && !options.create_new {
                    return Err(VaultOperationError::NotFound { path });
                }
                true
            }
        };

        let ciphertext_path = if creating {
            self.state
                .mapper
                .ciphertext_path_for_create(&path, CiphertextFileType::File)?
        } else {
            self.state
                .mapper
                .ciphertext_path(&path, CiphertextFileType::File)?
        };

        let file = self
            .state
            .registry
            .get_or_create(&ciphertext_path, creating)?;
        if options.truncate && options.write {
            file.truncate(0)?;
        }

        Ok(CleartextFileChannel::new(
            file,
            Arc::clone(&self.state.registry),
            &options,
        ))
    }

    /// Read the whole file at `path`.
    pub fn read(&self, path: impl Into<VaultPath>) -> Result<Vec<u8>, VaultOperationError> {
        let channel = self.open_file(path, OpenOptionsCleartext::read())?;
        let size = channel.size()?;
        let mut data = vec![0u8; size as usize];
        let mut offset = 0usize;
        while offset < data.len() {
            let n = channel.read_at(&mut data[offset..], offset as u64)?;
            if n == 0 {
                data.truncate(offset);
                break;
            }
            offset += n;
        }
        channel.close()?;
        Ok(data)
    }

    /// Create or replace the file at `path` with `data`.
    pub fn write(
        &self,
        path: impl Into<VaultPath>,
        data: &[u8],
    ) -> Result<(), VaultOperationError> {
        let channel = self.open_file(path, OpenOptionsCleartext::write().with_truncate())?;
        channel.write_at(data, 0)?;
        channel.close()?;
        Ok(())
    }

    /// Append `data` to the file at `path`, creating it if absent.
    pub fn append(
        &self,
        path: impl Into<VaultPath>,
        data: &[u8],
    ) -> Result<(), VaultOperationError> {
        let channel = self.open_file(path, OpenOptionsCleartext::write().with_append())?;
        channel.write(data)?;
        channel.close()?;
        Ok(())
    }

    /// Copy the file at `src` to `dst` at the cleartext level.
    ///
    /// The destination gets its own content key and nonces; the two
    /// ciphertexts share no bytes.
    pub fn copy_file(
        &self,
        src: impl Into<VaultPath>,
        dst: impl Into<VaultPath>,
    ) -> Result<(), VaultOperationError> {
        let data = self.read(src)?;
        self.write(dst, &data)
    }

    // ========================================================================
    // Directories
    // ========================================================================

    /// Create the directory at `path`. The parent must already exist.
    pub fn create_directory(
        &self,
        path: impl Into<VaultPath>,
    ) -> Result<(), VaultOperationError> {
        self.ensure_writable()?;
        let path = path.into();
        if path.is_root() {
            return Err(VaultOperationError::PathAlreadyExists { path });
        }
        if self.state.mapper.ciphertext_file_type(&path)?.is_some() {
            return Err(VaultOperationError::PathAlreadyExists { path });
        }

        let pointer_path = self
            .state
            .mapper
            .ciphertext_path_for_create(&path, CiphertextFileType::Directory)?;

        let dir_id = self.state.mapper.dir_ids().create(&pointer_path);
        let physical = self.state.mapper.physical_dir_path(&dir_id)?;

        if let Err(e) = fs::write(&pointer_path, dir_id.as_str()) {
            self.state.mapper.dir_ids().invalidate(&pointer_path);
            return Err(e.into());
        }
        if let Err(e) = fs::create_dir_all(&physical) {
            let _ = fs::remove_file(&pointer_path);
            self.state.mapper.dir_ids().invalidate(&pointer_path);
            return Err(e.into());
        }

        self.state.mapper.invalidate(&path);
        debug!(path = %path, dir_id = %dir_id, "Created directory");
        Ok(())
    }

    /// Create `path` and any missing ancestors.
    pub fn create_directory_all(
        &self,
        path: impl Into<VaultPath>,
    ) -> Result<(), VaultOperationError> {
        let path = path.into();
        let mut prefix = VaultPath::root();
        for component in path.components() {
            prefix = prefix.join(component);
            match self.state.mapper.ciphertext_file_type(&prefix)? {
                Some(CiphertextFileType::Directory) => continue,
                Some(_) => {
                    return Err(VaultOperationError::NotADirectory { path: prefix })
                }
                None => self.create_directory(prefix.clone())?,
            }
        }
        Ok(())
    }

    /// Delete the empty directory at `path`.
    pub fn delete_directory(
        &self,
        path: impl Into<VaultPath>,
    ) -> Result<(), VaultOperationError> {
        self.ensure_writable()?;
        let path = path.into();
        if path.is_root() {
            return Err(VaultOperationError::InvalidArgument(
                "cannot delete the vault root".to_string(),
            ));
        }
        match self.state.mapper.ciphertext_file_type(&path)? {
            Some(CiphertextFileType::Directory) => {}
            Some(_) => return Err(VaultOperationError::NotADirectory { path }),
            None => return Err(VaultOperationError::NotFound { path }),
        }

        let dir = self.state.mapper.ciphertext_dir(&path)?;
        match fs::read_dir(&dir.path) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Err(VaultOperationError::DirectoryNotEmpty { path });
                }
                fs::remove_dir(&dir.path)?;
                // Prune now-empty shard directory, best-effort
                if let Some(shard) = dir.path.parent() {
                    let _ = fs::remove_dir(shard);
                }
            }
            // A missing physical directory counts as empty
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let pointer_path = self
            .state
            .mapper
            .ciphertext_path(&path, CiphertextFileType::Directory)?;
        fs::remove_file(&pointer_path)?;
        self.state.mapper.dir_ids().invalidate(&pointer_path);
        self.remove_orphaned_sidecar(&pointer_path);
        self.state.mapper.invalidate(&path);
        debug!(path = %path, "Deleted directory");
        Ok(())
    }

    // ========================================================================
    // Files and symlinks
    // ========================================================================

    /// Delete the file or symlink at `path`.
    pub fn delete_file(&self, path: impl Into<VaultPath>) -> Result<(), VaultOperationError> {
        self.ensure_writable()?;
        let path = path.into();
        let kind = match self.state.mapper.ciphertext_file_type(&path)? {
            Some(CiphertextFileType::Directory) => {
                return Err(VaultOperationError::NotAFile { path })
            }
            Some(kind) => kind,
            None => return Err(VaultOperationError::NotFound { path }),
        };

        let ciphertext_path = self.state.mapper.ciphertext_path(&path, kind)?;
        fs::remove_file(&ciphertext_path)?;
        self.remove_orphaned_sidecar(&ciphertext_path);
        self.state.mapper.invalidate(&path);
        debug!(path = %path, "Deleted file");
        Ok(())
    }

    /// Create a symlink at `link` pointing at `target`.
    ///
    /// The target string is encrypted as file content inside a
    /// symlink-marked entry; it is never resolved by the core.
    pub fn create_symlink(
        &self,
        link: impl Into<VaultPath>,
        target: &str,
    ) -> Result<(), VaultOperationError> {
        self.ensure_writable()?;
        let link = link.into();
        if self.state.mapper.ciphertext_file_type(&link)?.is_some() {
            return Err(VaultOperationError::PathAlreadyExists { path: link });
        }

        let ciphertext_path = self
            .state
            .mapper
            .ciphertext_path_for_create(&link, CiphertextFileType::Symlink)?;
        let encrypted = encrypt_symlink_target(target, &self.state.master_key)?;
        fs::write(&ciphertext_path, encrypted)?;
        debug!(link = %link, "Created symlink");
        Ok(())
    }

    /// Read the target of the symlink at `path`.
    pub fn read_symlink(
        &self,
        path: impl Into<VaultPath>,
    ) -> Result<String, VaultOperationError> {
        self.ensure_open()?;
        let path = path.into();
        match self.state.mapper.ciphertext_file_type(&path)? {
            Some(CiphertextFileType::Symlink) => {}
            Some(_) => return Err(VaultOperationError::NotAFile { path }),
            None => return Err(VaultOperationError::NotFound { path }),
        }

        let ciphertext_path = self
            .state
            .mapper
            .ciphertext_path(&path, CiphertextFileType::Symlink)?;
        let encrypted = fs::read(&ciphertext_path)?;
        let context = SymlinkContext::new().with_name(path.as_str());
        Ok(decrypt_symlink_target(
            &encrypted,
            &self.state.master_key,
            &context,
        )?)
    }

    // ========================================================================
    // Rename / move
    // ========================================================================

    /// Move the file or symlink at `src` to `dst`.
    ///
    /// The entry name is re-encrypted under the destination directory's id;
    /// the content bytes move untouched.
    pub fn move_file(
        &self,
        src: impl Into<VaultPath>,
        dst: impl Into<VaultPath>,
    ) -> Result<(), VaultOperationError> {
        self.ensure_writable()?;
        let src = src.into();
        let dst = dst.into();

        let kind = match self.state.mapper.ciphertext_file_type(&src)? {
            Some(CiphertextFileType::Directory) => {
                return Err(VaultOperationError::NotAFile { path: src })
            }
            Some(kind) => kind,
            None => return Err(VaultOperationError::NotFound { path: src }),
        };
        if self.state.mapper.ciphertext_file_type(&dst)?.is_some() {
            return Err(VaultOperationError::PathAlreadyExists { path: dst });
        }

        let src_ciphertext = self.state.mapper.ciphertext_path(&src, kind)?;
        let dst_ciphertext = self.state.mapper.ciphertext_path_for_create(&dst, kind)?;
        fs::rename(&src_ciphertext, &dst_ciphertext)?;

        self.remove_orphaned_sidecar(&src_ciphertext);
        self.state.mapper.invalidate(&src);
        self.state.mapper.invalidate(&dst);
        debug!(src = %src, dst = %dst, "Moved file");
        Ok(())
    }

    /// Rename the file or symlink at `path` within its directory.
    pub fn rename_file(
        &self,
        path: impl Into<VaultPath>,
        new_name: &str,
    ) -> Result<(), VaultOperationError> {
        let path = path.into();
        let (parent, _) = path.split().ok_or_else(|| VaultOperationError::NotAFile {
            path: path.clone(),
        })?;
        self.move_file(path, parent.join(new_name))
    }

    /// Move the directory at `src` to `dst`.
    ///
    /// Only the pointer file moves; the directory's physical location is
    /// keyed by its id and stays put, so the cost is independent of the
    /// subtree size.
    pub fn move_directory(
        &self,
        src: impl Into<VaultPath>,
        dst: impl Into<VaultPath>,
    ) -> Result<(), VaultOperationError> {
        self.ensure_writable()?;
        let src = src.into();
        let dst = dst.into();

        if src.is_root() {
            return Err(VaultOperationError::InvalidArgument(
                "cannot move the vault root".to_string(),
            ));
        }
        if dst.starts_with(&src) {
            return Err(VaultOperationError::InvalidArgument(format!(
                "cannot move {src} into its own subtree {dst}"
            )));
        }
        match self.state.mapper.ciphertext_file_type(&src)? {
            Some(CiphertextFileType::Directory) => {}
            Some(_) => return Err(VaultOperationError::NotADirectory { path: src }),
            None => return Err(VaultOperationError::NotFound { path: src }),
        }
        if self.state.mapper.ciphertext_file_type(&dst)?.is_some() {
            return Err(VaultOperationError::PathAlreadyExists { path: dst });
        }

        let src_pointer = self
            .state
            .mapper
            .ciphertext_path(&src, CiphertextFileType::Directory)?;
        let dst_pointer = self
            .state
            .mapper
            .ciphertext_path_for_create(&dst, CiphertextFileType::Directory)?;
        fs::rename(&src_pointer, &dst_pointer)?;

        self.state.mapper.dir_ids().moved(&src_pointer, &dst_pointer);
        self.remove_orphaned_sidecar(&src_pointer);
        self.state.mapper.invalidate(&src);
        self.state.mapper.invalidate(&dst);
        debug!(src = %src, dst = %dst, "Moved directory");
        Ok(())
    }

    /// Rename the directory at `path` within its parent.
    pub fn rename_directory(
        &self,
        path: impl Into<VaultPath>,
        new_name: &str,
    ) -> Result<(), VaultOperationError> {
        let path = path.into();
        let (parent, _) = path
            .split()
            .ok_or_else(|| VaultOperationError::InvalidArgument(
                "cannot rename the vault root".to_string(),
            ))?;
        self.move_directory(path, parent.join(new_name))
    }

    /// If the on-disk entry name was deflated, drop its now-unreferenced
    /// sidecar. Best-effort; a stale sidecar is garbage, not corruption.
    fn remove_orphaned_sidecar(&self, ciphertext_path: &Path) {
        let Some(name) = ciphertext_path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        if is_deflated(name) {
            if let Err(e) = self.state.mapper.long_names().remove(name) {
                warn!(entry = name, error = %e, "Failed to remove orphaned long-name sidecar");
            }
        }
    }
}

impl Drop for CryptoFs {
    fn drop(&mut self) {
        self.close();
    }
}

/// Open a vault from a string property map (the shape command-line style
/// callers produce). Unrecognized keys are rejected.
pub fn open_with_properties(
    root: &Path,
    properties: &HashMap<String, String>,
) -> Result<CryptoFs, VaultOperationError> {
    let options = VaultOptions::from_properties(properties)?;
    CryptoFs::open(root, &options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_kdf() {
        std::env::set_var("CRYPTOFS_FAST_KDF", "1");
    }

    fn new_vault(passphrase: &str) -> (TempDir, CryptoFs) {
        fast_kdf();
        let tmp = TempDir::new().unwrap();
        let options = VaultOptions::new(passphrase);
        CryptoFs::initialize(tmp.path(), &options).unwrap();
        let vault = CryptoFs::open(tmp.path(), &options).unwrap();
        (tmp, vault)
    }

    #[test]
    fn test_initialize_creates_layout() {
        fast_kdf();
        let tmp = TempDir::new().unwrap();
        CryptoFs::initialize(tmp.path(), &VaultOptions::new("pw")).unwrap();

        assert!(tmp.path().join("masterkey.cryptomator").exists());
        assert!(tmp.path().join(DATA_DIR_NAME).is_dir());
        assert!(tmp.path().join(METADATA_DIR_NAME).is_dir());
    }

    #[test]
    fn test_initialize_twice_fails() {
        fast_kdf();
        let tmp = TempDir::new().unwrap();
        let options = VaultOptions::new("pw");
        CryptoFs::initialize(tmp.path(), &options).unwrap();

        let result = CryptoFs::initialize(tmp.path(), &options);
        assert!(matches!(
            result,
            Err(VaultOperationError::PathAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_open_missing_vault_fails() {
        fast_kdf();
        let tmp = TempDir::new().unwrap();
        let result = CryptoFs::open(&tmp.path().join("nope"), &VaultOptions::new("pw"));
        assert!(matches!(result, Err(VaultOperationError::NotAVault { .. })));
    }

    #[test]
    fn test_closed_handle_rejects_operations() {
        let (_tmp, vault) = new_vault("pw");
        vault.close();
        assert!(matches!(
            vault.file_type("anything"),
            Err(VaultOperationError::FilesystemClosed)
        ));
    }

    #[test]
    fn test_readonly_rejects_writes() {
        fast_kdf();
        let tmp = TempDir::new().unwrap();
        let options = VaultOptions::new("pw");
        CryptoFs::initialize(tmp.path(), &options).unwrap();

        let vault = CryptoFs::open(tmp.path(), &options.clone().readonly(true)).unwrap();
        assert!(matches!(
            vault.write("file", b"data"),
            Err(VaultOperationError::ReadOnly)
        ));
        assert!(matches!(
            vault.create_directory("dir"),
            Err(VaultOperationError::ReadOnly)
        ));
        // Observation still works
        assert_eq!(vault.list_dir("/").unwrap(), vec![]);
    }

    #[test]
    fn test_shared_state_for_same_root() {
        fast_kdf();
        let tmp = TempDir::new().unwrap();
        let options = VaultOptions::new("pw");
        CryptoFs::initialize(tmp.path(), &options).unwrap();

        let a = CryptoFs::open(tmp.path(), &options).unwrap();
        let b = CryptoFs::open(tmp.path(), &options).unwrap();
        assert!(Arc::ptr_eq(&a.state, &b.state));

        // Closing one handle keeps the other alive
        a.close();
        b.write("f", b"x").unwrap();
        assert_eq!(b.read("f").unwrap(), b"x");
    }

    #[test]
    fn test_second_open_still_verifies_passphrase() {
        fast_kdf();
        let tmp = TempDir::new().unwrap();
        let options = VaultOptions::new("pw");
        CryptoFs::initialize(tmp.path(), &options).unwrap();

        let _first = CryptoFs::open(tmp.path(), &options).unwrap();
        let second = CryptoFs::open(tmp.path(), &VaultOptions::new("wrong"));
        assert!(matches!(
            second,
            Err(VaultOperationError::InvalidPassphrase)
        ));
    }

    #[test]
    fn test_directory_lifecycle() {
        let (_tmp, vault) = new_vault("pw");

        vault.create_directory("docs").unwrap();
        assert_eq!(
            vault.file_type("docs").unwrap(),
            Some(EntryType::Directory)
        );

        vault.create_directory_all("docs/a/b/c").unwrap();
        assert!(vault.exists("docs/a/b/c").unwrap());

        // Non-empty directory refuses deletion
        assert!(matches!(
            vault.delete_directory("docs"),
            Err(VaultOperationError::DirectoryNotEmpty { .. })
        ));

        vault.delete_directory("docs/a/b/c").unwrap();
        vault.delete_directory("docs/a/b").unwrap();
        vault.delete_directory("docs/a").unwrap();
        vault.delete_directory("docs").unwrap();
        assert!(!vault.exists("docs").unwrap());
    }

    #[test]
    fn test_create_directory_requires_parent() {
        let (_tmp, vault) = new_vault("pw");
        let result = vault.create_directory("missing/child");
        assert!(matches!(result, Err(VaultOperationError::PathMap(_))));
    }

    #[test]
    fn test_write_read_delete_file() {
        let (_tmp, vault) = new_vault("pw");

        vault.write("hello.txt", b"hello world").unwrap();
        assert_eq!(vault.read("hello.txt").unwrap(), b"hello world");
        assert_eq!(vault.size("hello.txt").unwrap(), 11);

        vault.delete_file("hello.txt").unwrap();
        assert!(matches!(
            vault.read("hello.txt"),
            Err(VaultOperationError::NotFound { .. })
        ));
    }

    #[test]
    fn test_append() {
        let (_tmp, vault) = new_vault("pw");
        vault.write("log", b"one").unwrap();
        vault.append("log", b"-two").unwrap();
        assert_eq!(vault.read("log").unwrap(), b"one-two");
    }

    #[test]
    fn test_list_dir_returns_cleartext_names() {
        let (_tmp, vault) = new_vault("pw");
        vault.create_directory("sub").unwrap();
        vault.write("b.txt", b"b").unwrap();
        vault.write("a.txt", b"a").unwrap();
        vault.create_symlink("link", "./a.txt").unwrap();

        let entries = vault.list_dir("/").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "link", "sub"]);
        assert_eq!(entries[3].kind, EntryType::Directory);
        assert_eq!(entries[2].kind, EntryType::Symlink);
        assert_eq!(entries[0].kind, EntryType::File);
    }

    #[test]
    fn test_listing_skips_foreign_entries() {
        let (_tmp, vault) = new_vault("pw");
        vault.write("good.txt", b"ok").unwrap();

        // Drop a foreign file into the root's physical directory
        let root_dir = vault.state.mapper.ciphertext_dir(&VaultPath::root()).unwrap();
        fs::write(root_dir.path.join("NOTBASE32!"), b"junk").unwrap();

        let entries = vault.list_dir("/").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "good.txt");
    }

    #[test]
    fn test_move_file_between_directories() {
        let (_tmp, vault) = new_vault("pw");
        vault.create_directory("a").unwrap();
        vault.create_directory("b").unwrap();
        vault.write("a/file", b"payload").unwrap();

        vault.move_file("a/file", "b/renamed").unwrap();

        assert!(!vault.exists("a/file").unwrap());
        assert_eq!(vault.read("b/renamed").unwrap(), b"payload");
    }

    #[test]
    fn test_move_file_onto_existing_fails() {
        let (_tmp, vault) = new_vault("pw");
        vault.write("src", b"1").unwrap();
        vault.write("dst", b"2").unwrap();

        assert!(matches!(
            vault.move_file("src", "dst"),
            Err(VaultOperationError::PathAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_move_directory_into_itself_fails() {
        let (_tmp, vault) = new_vault("pw");
        vault.create_directory("d").unwrap();
        assert!(matches!(
            vault.move_directory("d", "d/sub"),
            Err(VaultOperationError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rename_directory_preserves_contents() {
        let (_tmp, vault) = new_vault("pw");
        vault.create_directory("old").unwrap();
        vault.write("old/keep.txt", b"kept").unwrap();

        vault.rename_directory("old", "new").unwrap();

        assert!(!vault.exists("old").unwrap());
        assert_eq!(vault.read("new/keep.txt").unwrap(), b"kept");
    }

    #[test]
    fn test_symlink_roundtrip() {
        let (_tmp, vault) = new_vault("pw");
        vault.create_directory("a").unwrap();
        vault.create_symlink("a/link", "./target").unwrap();

        assert_eq!(
            vault.file_type("a/link").unwrap(),
            Some(EntryType::Symlink)
        );
        assert_eq!(vault.read_symlink("a/link").unwrap(), "./target");
    }

    #[test]
    fn test_open_with_properties_rejects_unknown_keys() {
        fast_kdf();
        let tmp = TempDir::new().unwrap();
        CryptoFs::initialize(tmp.path(), &VaultOptions::new("pw")).unwrap();

        let mut properties = HashMap::new();
        properties.insert("passphrase".to_string(), "pw".to_string());
        properties.insert("journaling".to_string(), "on".to_string());

        let result = open_with_properties(tmp.path(), &properties);
        assert!(matches!(result, Err(VaultOperationError::Options(_))));
    }
}
