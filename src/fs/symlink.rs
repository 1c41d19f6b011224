//! Symlink target encryption.
//!
//! A symlink is stored as a `1S`-prefixed entry whose contents are the
//! encrypted target path, framed exactly like regular file content (header
//! plus authenticated chunks). Targets are almost always a single chunk, but
//! the framing does not assume it.

use std::fmt;

use thiserror::Error;

use crate::crypto::keys::MasterKey;
use crate::fs::content::{
    self, ContentError, FileContext, FileHeader, CHUNK_SIZE, HEADER_SIZE, PAYLOAD_SIZE,
};

/// Context for symlink operations, providing debugging information.
#[derive(Debug, Clone, Default)]
pub struct SymlinkContext {
    /// The cleartext symlink name (if available)
    pub name: Option<String>,
    /// The symlink target (if available)
    pub target: Option<String>,
}

impl SymlinkContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

impl fmt::Display for SymlinkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref name) = self.name {
            parts.push(format!("symlink '{name}'"));
        }
        if let Some(ref target) = self.target {
            let display_target = if target.len() > 40 {
                format!("{}...", &target[..37])
            } else {
                target.clone()
            };
            parts.push(format!("-> '{display_target}'"));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// Errors from symlink target encryption/decryption.
#[derive(Error, Debug)]
pub enum SymlinkError {
    /// The encrypted target is too short to contain a header.
    #[error("Symlink content too short for {context}: {actual} bytes")]
    ContentTooShort {
        actual: usize,
        context: SymlinkContext,
    },

    /// The decrypted target is not valid UTF-8.
    #[error("Symlink target is not valid UTF-8 for {context}")]
    InvalidTarget { context: SymlinkContext },

    /// Content-layer failure (header or chunk decryption).
    #[error(transparent)]
    Content(#[from] ContentError),
}

/// Encrypt a symlink target for storage inside a `1S`-prefixed entry.
pub fn encrypt_symlink_target(
    target: &str,
    master_key: &MasterKey,
) -> Result<Vec<u8>, SymlinkError> {
    let header = FileHeader::create();
    let mut out = content::encrypt_header(&header, master_key)?;

    for (index, chunk) in target.as_bytes().chunks(PAYLOAD_SIZE).enumerate() {
        let encrypted = content::encrypt_chunk(chunk, index as u64, &header, master_key)?;
        out.extend_from_slice(&encrypted);
    }
    Ok(out)
}

/// Decrypt a symlink target read from a `1S`-prefixed entry.
pub fn decrypt_symlink_target(
    encrypted: &[u8],
    master_key: &MasterKey,
    context: &SymlinkContext,
) -> Result<String, SymlinkError> {
    if encrypted.len() < HEADER_SIZE {
        return Err(SymlinkError::ContentTooShort {
            actual: encrypted.len(),
            context: context.clone(),
        });
    }

    let file_context = FileContext::new();
    let header = content::decrypt_header(&encrypted[..HEADER_SIZE], master_key, &file_context)?;

    let mut target = Vec::new();
    for (index, chunk) in encrypted[HEADER_SIZE..].chunks(CHUNK_SIZE).enumerate() {
        let decrypted =
            content::decrypt_chunk(chunk, index as u64, &header, master_key, &file_context)?;
        target.extend_from_slice(&decrypted);
    }

    String::from_utf8(target).map_err(|_| SymlinkError::InvalidTarget {
        context: context.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_master_key() -> MasterKey {
        MasterKey::new([3u8; 32], [4u8; 32]).unwrap()
    }

    #[test]
    fn test_symlink_target_roundtrip() {
        let master_key = test_master_key();

        for target in ["./target", "../up/and/over", "/absolute/path", "x"] {
            let encrypted = encrypt_symlink_target(target, &master_key).unwrap();
            assert!(encrypted.len() >= HEADER_SIZE);

            let decrypted =
                decrypt_symlink_target(&encrypted, &master_key, &SymlinkContext::new()).unwrap();
            assert_eq!(decrypted, target);
        }
    }

    #[test]
    fn test_encrypted_target_is_not_cleartext() {
        let master_key = test_master_key();
        let target = "./visible-target-name";
        let encrypted = encrypt_symlink_target(target, &master_key).unwrap();

        let haystack = encrypted.windows(target.len()).collect::<Vec<_>>();
        assert!(!haystack.contains(&target.as_bytes()));
    }

    #[test]
    fn test_tampered_target_fails() {
        let master_key = test_master_key();
        let mut encrypted = encrypt_symlink_target("./target", &master_key).unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0x01;

        let result = decrypt_symlink_target(&encrypted, &master_key, &SymlinkContext::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_too_short_content_rejected() {
        let master_key = test_master_key();
        let result = decrypt_symlink_target(&[0u8; 20], &master_key, &SymlinkContext::new());
        assert!(matches!(result, Err(SymlinkError::ContentTooShort { .. })));
    }

    #[test]
    fn test_wrong_key_fails() {
        let master_key = test_master_key();
        let other_key = MasterKey::new([9u8; 32], [10u8; 32]).unwrap();

        let encrypted = encrypt_symlink_target("./target", &master_key).unwrap();
        let result = decrypt_symlink_target(&encrypted, &other_key, &SymlinkContext::new());
        assert!(result.is_err());
    }
}
