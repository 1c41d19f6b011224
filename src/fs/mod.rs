//! Filesystem abstractions: content framing, name encryption, chunked I/O,
//! and open-file coordination.

pub mod chunks;
pub mod content;
pub mod longname;
pub mod name;
pub mod open_file;
pub mod registry;
pub mod symlink;

// Re-export commonly used types
pub use content::{
    ciphertext_size, cleartext_size, cleartext_size_or_zero, decrypt_header, encrypt_header,
    ContentError, FileContext, FileHeader, CHUNK_OVERHEAD, CHUNK_SIZE, HEADER_SIZE, PAYLOAD_SIZE,
};
pub use longname::{deflate, is_deflated, needs_deflation, LongNameError, LongNameStore};
pub use name::{
    decrypt_name, encrypt_name, hash_dir_id, NameContext, NameError, DIRECTORY_PREFIX,
    SYMLINK_PREFIX,
};
pub use open_file::{
    CleartextFileChannel, FileError, FileState, OpenCryptoFile, OpenOptionsCleartext,
};
pub use registry::OpenFileRegistry;
pub use symlink::{decrypt_symlink_target, encrypt_symlink_target, SymlinkContext, SymlinkError};
