//! Vault-level abstractions: masterkey handling, configuration, path
//! translation, and the operations façade.

pub mod cache;
pub mod dir_id;
pub mod master_key;
pub mod operations;
pub mod options;
pub mod path;
pub mod path_mapper;

// Re-export commonly used types
pub use dir_id::{DirIdError, DirectoryIdProvider};
pub use master_key::{
    change_passphrase, create_masterkey_file, MasterKeyError, MasterKeyFile, VAULT_VERSION,
};
pub use operations::{
    open_with_properties, CryptoFs, DirEntry, EntryType, VaultOperationError,
};
pub use options::{VaultOptions, VaultOptionsError, DEFAULT_MASTERKEY_FILENAME};
pub use path::{DirId, VaultPath};
pub use path_mapper::{
    CiphertextDirectory, CiphertextFileType, PathMapError, PathMapper, DATA_DIR_NAME,
    METADATA_DIR_NAME,
};
