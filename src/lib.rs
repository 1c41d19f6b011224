pub mod crypto;
pub mod error;
pub mod fs;
pub mod vault;

// Re-export commonly used types at crate root
pub use vault::operations::{CryptoFs, DirEntry, EntryType, VaultOperationError};
pub use vault::options::VaultOptions;
pub use vault::path::{DirId, VaultPath};
