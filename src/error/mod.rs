//! Error types for the crate
//!
//! This module re-exports the error types and their context structures from
//! the modules that define them.

pub use crate::crypto::keys::KeyAccessError;
pub use crate::crypto::CryptoError;
pub use crate::fs::content::{ContentError, FileContext};
pub use crate::fs::longname::LongNameError;
pub use crate::fs::name::{NameContext, NameError};
pub use crate::fs::open_file::FileError;
pub use crate::fs::symlink::{SymlinkContext, SymlinkError};
pub use crate::vault::dir_id::DirIdError;
pub use crate::vault::master_key::MasterKeyError;
pub use crate::vault::operations::VaultOperationError;
pub use crate::vault::options::VaultOptionsError;
pub use crate::vault::path_mapper::PathMapError;
