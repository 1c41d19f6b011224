//! Filename encryption and directory-id hashing.
//!
//! Entry names in the data tree are the AES-SIV ciphertext of the cleartext
//! name, BASE32-encoded, with the owning directory's id as associated data.
//! The associated data binds a name to its directory: the same cleartext
//! under two directories yields distinct ciphertext, and moving an entry
//! between directories requires re-encryption.
//!
//! Marker prefixes distinguish entry kinds on disk: `0` for directory
//! pointers, `1S` for symlinks, no prefix for regular files.

use aes_siv::{siv::Aes256Siv, KeyInit};
use data_encoding::BASE32;
use ring::digest;
use std::fmt;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::crypto::keys::{KeyAccessError, MasterKey};

/// Marker prefix for directory pointer files.
pub const DIRECTORY_PREFIX: &str = "0";

/// Marker prefix for symlink files.
pub const SYMLINK_PREFIX: &str = "1S";

/// Context for filename operations, providing debugging information.
#[derive(Debug, Clone, Default)]
pub struct NameContext {
    /// The encrypted filename (if available)
    pub encrypted_name: Option<String>,
    /// The cleartext filename (if available, e.g., during encryption)
    pub cleartext_name: Option<String>,
    /// The parent directory ID
    pub dir_id: Option<String>,
}

impl NameContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encrypted_name(mut self, name: impl Into<String>) -> Self {
        self.encrypted_name = Some(name.into());
        self
    }

    pub fn with_cleartext_name(mut self, name: impl Into<String>) -> Self {
        self.cleartext_name = Some(name.into());
        self
    }

    pub fn with_dir_id(mut self, dir_id: impl Into<String>) -> Self {
        self.dir_id = Some(dir_id.into());
        self
    }
}

impl fmt::Display for NameContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref name) = self.cleartext_name {
            parts.push(format!("filename '{name}'"));
        } else if let Some(ref enc_name) = self.encrypted_name {
            // Truncate long encrypted names for readability
            let display_name = if enc_name.len() > 40 {
                format!("{}...", &enc_name[..37])
            } else {
                enc_name.clone()
            };
            parts.push(format!("encrypted name '{display_name}'"));
        }

        if let Some(ref dir_id) = self.dir_id {
            let display_id = if dir_id.is_empty() {
                "<root>".to_string()
            } else if dir_id.len() > 12 {
                format!("{}...", &dir_id[..12])
            } else {
                dir_id.clone()
            };
            parts.push(format!("in directory {display_id}"));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

/// Errors that can occur during filename encryption/decryption.
///
/// # Security Classification
///
/// Decryption failures indicate **integrity violations** since AES-SIV is
/// authenticated encryption. If decryption fails, the ciphertext has been
/// tampered with, the wrong key was used, or the wrong parent directory ID
/// was provided.
#[derive(Error, Debug)]
pub enum NameError {
    /// AES-SIV decryption failed - the ciphertext is invalid or tampered.
    ///
    /// **[INTEGRITY VIOLATION]** This indicates either:
    /// - The encrypted filename was tampered with
    /// - The wrong master key was used
    /// - The wrong parent directory ID was used (filename moved/swapped)
    #[error("[INTEGRITY VIOLATION] Failed to decrypt {context}: authentication failed - possible tampering, wrong key, or filename moved between directories")]
    DecryptionFailed { context: NameContext },

    /// BASE32 decoding failed - the encrypted filename is malformed.
    #[error("Invalid BASE32 encoding for {context}: {reason}")]
    Base32Decode { reason: String, context: NameContext },

    /// UTF-8 decoding failed after decryption.
    #[error("Invalid UTF-8 after decryption for {context}: {reason}")]
    Utf8Decode { reason: String, context: NameContext },

    /// Encryption failed unexpectedly.
    ///
    /// **[PROGRAMMING ERROR]** AES-SIV encryption should not fail with valid inputs.
    #[error("Unexpected encryption failure for {context}")]
    EncryptionFailed { context: NameContext },

    /// Directory ID hashing failed unexpectedly.
    #[error("Failed to hash directory ID '{dir_id}': encryption error")]
    DirIdHashFailed { dir_id: String },

    /// Key access failed due to memory protection error or lock poisoning.
    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// Hash a directory ID for use in the vault's data tree.
///
/// Computes the storage location for a directory by:
/// 1. Encrypting the directory ID (UTF-8 bytes) with AES-SIV (no associated data)
/// 2. Hashing the encrypted result with SHA-1 (20 bytes)
/// 3. Encoding the hash as uppercase BASE32 (RFC 4648)
///
/// The resulting 32-character hash is used to construct the directory path
/// `d/{hash[0:2]}/{hash[2:]}`. The location depends only on the directory's
/// id, never on its cleartext name, which is what makes directory renames
/// cheap.
///
/// # Errors
///
/// Returns `NameError::DirIdHashFailed` if AES-SIV encryption fails unexpectedly.
pub fn hash_dir_id(dir_id: &str, master_key: &MasterKey) -> Result<String, NameError> {
    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);

        // Encrypt directory ID with no associated data
        let associated_data: &[&[u8]] = &[];
        let encrypted = cipher
            .encrypt(associated_data, dir_id.as_bytes())
            .map_err(|_| NameError::DirIdHashFailed {
                dir_id: dir_id.to_string(),
            })?;

        let hashed = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &encrypted);
        Ok(BASE32.encode(hashed.as_ref()))
    })?
}

/// Encrypt a filename using AES-SIV with the parent directory ID as context.
///
/// The filename is normalized to Unicode NFC form before encryption to ensure
/// cross-platform compatibility (macOS uses NFD, Linux/Windows use NFC).
///
/// # Returns
///
/// The BASE32-encoded encrypted filename **without** any marker prefix. The
/// caller is responsible for prepending the appropriate marker (`0` for
/// directories, `1S` for symlinks).
///
/// # Errors
///
/// Returns `NameError::EncryptionFailed` if AES-SIV encryption fails unexpectedly.
pub fn encrypt_name(
    name: &str,
    parent_dir_id: &str,
    master_key: &MasterKey,
) -> Result<String, NameError> {
    let context = NameContext::new()
        .with_cleartext_name(name)
        .with_dir_id(parent_dir_id);

    // Normalize filename to NFC for cross-platform compatibility
    let normalized_name: String = name.nfc().collect();

    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);

        // Encrypt with parent directory ID as associated data
        let associated_data: &[&[u8]] = &[parent_dir_id.as_bytes()];
        let encrypted = cipher
            .encrypt(associated_data, normalized_name.as_bytes())
            .map_err(|_| NameError::EncryptionFailed {
                context: context.clone(),
            })?;

        Ok(BASE32.encode(&encrypted))
    })?
}

/// Decrypt a filename using AES-SIV with the parent directory ID as context.
///
/// `encrypted_name` must be the bare BASE32 portion, with any marker prefix
/// already stripped.
///
/// # Errors
///
/// - `NameError::Base32Decode`: The encrypted filename is not valid BASE32
/// - `NameError::DecryptionFailed`: **[INTEGRITY VIOLATION]** - The ciphertext is
///   invalid, tampered, or the wrong key/context was used
/// - `NameError::Utf8Decode`: The decrypted bytes are not valid UTF-8
pub fn decrypt_name(
    encrypted_name: &str,
    parent_dir_id: &str,
    master_key: &MasterKey,
) -> Result<String, NameError> {
    let context = NameContext::new()
        .with_encrypted_name(encrypted_name)
        .with_dir_id(parent_dir_id);

    let decoded =
        BASE32
            .decode(encrypted_name.as_bytes())
            .map_err(|e| NameError::Base32Decode {
                reason: e.to_string(),
                context: context.clone(),
            })?;

    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);

        // Decrypt with parent directory ID as associated data
        let associated_data: &[&[u8]] = &[parent_dir_id.as_bytes()];
        let decrypted = cipher
            .decrypt(associated_data, &decoded)
            .map_err(|_| NameError::DecryptionFailed {
                context: context.clone(),
            })?;

        String::from_utf8(decrypted.to_vec()).map_err(|e| NameError::Utf8Decode {
            reason: e.to_string(),
            context: context.clone(),
        })
    })?
}
