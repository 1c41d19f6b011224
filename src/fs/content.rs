//! AES-CTR + HMAC-SHA256 file content framing.
//!
//! Files are stored as a signed header followed by independently
//! authenticated chunks, so cleartext offsets can be served without reading
//! the whole ciphertext.
//!
//! # File Header Format (88 bytes)
//!
//! | Offset | Size | Description |
//! |--------|------|-------------|
//! | 0      | 16   | Nonce (IV for AES-CTR) |
//! | 16     | 40   | Encrypted payload (8-byte reserved + 32-byte content key) |
//! | 56     | 32   | HMAC-SHA256 over nonce + encrypted payload |
//!
//! # Content Chunk Format (up to 32816 bytes)
//!
//! | Offset | Size | Description |
//! |--------|------|-------------|
//! | 0      | 16   | Chunk nonce |
//! | 16     | n    | AES-CTR encrypted payload (up to 32768 bytes) |
//! | 16+n   | 32   | HMAC-SHA256 over (header_nonce + chunk_index + nonce + ciphertext) |
//!
//! Binding the big-endian chunk index and the header nonce into each MAC
//! prevents chunk reordering and cross-file chunk splicing.

use std::fmt;
use std::io;

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use ring::hmac;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};
use zeroize::Zeroizing;

use crate::crypto::keys::{KeyAccessError, MasterKey};

// ============================================================================
// Constants
// ============================================================================

/// Nonce size for AES-CTR (16 bytes)
pub const NONCE_SIZE: usize = 16;

/// HMAC-SHA256 output size (32 bytes)
pub const MAC_SIZE: usize = 32;

/// Cleartext payload size per chunk (32 KiB)
pub const PAYLOAD_SIZE: usize = 32 * 1024;

/// Per-chunk ciphertext overhead: nonce + MAC
pub const CHUNK_OVERHEAD: usize = NONCE_SIZE + MAC_SIZE;

/// Total encrypted chunk size: nonce + payload + MAC
pub const CHUNK_SIZE: usize = NONCE_SIZE + PAYLOAD_SIZE + MAC_SIZE;

/// File header size: nonce + encrypted payload + MAC
pub const HEADER_SIZE: usize = NONCE_SIZE + HEADER_PAYLOAD_SIZE + MAC_SIZE; // 88 bytes

/// Header payload size (8-byte reserved + 32-byte content key)
const HEADER_PAYLOAD_SIZE: usize = 40;

// ============================================================================
// Type Aliases
// ============================================================================

/// AES-256-CTR with big-endian 128-bit counter
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

// ============================================================================
// File Context
// ============================================================================

/// Context for file content operations, providing debugging information.
#[derive(Debug, Clone, Default)]
pub struct FileContext {
    /// The cleartext filename (if known)
    pub filename: Option<String>,
    /// The encrypted path on disk
    pub encrypted_path: Option<std::path::PathBuf>,
    /// The chunk index (for content errors)
    pub chunk_index: Option<u64>,
}

impl FileContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.encrypted_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_chunk(mut self, chunk_index: u64) -> Self {
        self.chunk_index = Some(chunk_index);
        self
    }
}

impl fmt::Display for FileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref filename) = self.filename {
            parts.push(format!("file '{filename}'"));
        }
        if let Some(chunk) = self.chunk_index {
            parts.push(format!("chunk {chunk}"));
        }
        if let Some(ref path) = self.encrypted_path {
            parts.push(format!("at {:?}", path.display()));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum ContentError {
    /// HMAC verification failed - possible tampering
    #[error("HMAC verification failed for {context}: possible tampering or wrong key")]
    MacVerification { context: FileContext },

    /// Invalid header structure
    #[error("Invalid header for {context}: {reason}")]
    InvalidHeader { reason: String, context: FileContext },

    /// Invalid chunk structure
    #[error("Invalid chunk for {context}: {reason}")]
    InvalidChunk { reason: String, context: FileContext },

    /// IO error during content access
    #[error("IO error for {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: FileContext,
    },

    /// Key access failed
    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

impl ContentError {
    /// Create an IO error with context
    #[must_use]
    pub fn io_with_context(source: io::Error, context: FileContext) -> Self {
        ContentError::Io { source, context }
    }
}

// ============================================================================
// File Header
// ============================================================================

/// Decrypted file header containing the per-file content encryption key.
pub struct FileHeader {
    /// The original nonce from the header (needed for chunk MAC calculation)
    pub nonce: [u8; NONCE_SIZE],
    /// The decrypted content encryption key
    pub content_key: Zeroizing<[u8; 32]>,
}

impl FileHeader {
    /// Create a fresh header with a random nonce and content key.
    pub fn create() -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        let mut content_key = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut nonce);
        rand::rng().fill_bytes(content_key.as_mut());
        FileHeader { nonce, content_key }
    }
}

impl fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHeader")
            .field("nonce", &hex::encode(self.nonce))
            .field("content_key", &"[REDACTED]")
            .finish()
    }
}

/// Encrypt a file header using AES-CTR + HMAC-SHA256.
///
/// The header's own nonce is used as the CTR IV; the payload is the 8-byte
/// reserved sentinel (all 0xFF) followed by the content key.
pub fn encrypt_header(header: &FileHeader, master_key: &MasterKey) -> Result<Vec<u8>, ContentError> {
    // Build plaintext: reserved sentinel (8 bytes of 0xFF) + content key
    let mut plaintext = Zeroizing::new(vec![0xFF; 8]);
    plaintext.extend_from_slice(header.content_key.as_ref());

    let ciphertext = master_key.with_aes_key(|aes_key| {
        let mut cipher = Aes256Ctr::new(aes_key.into(), (&header.nonce).into());
        let mut encrypted = Zeroizing::new(plaintext.to_vec());
        cipher.apply_keystream(&mut encrypted);
        encrypted.to_vec()
    })?;

    let mac = master_key.with_mac_key(|mac_key| {
        let key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
        let mut data = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        data.extend_from_slice(&header.nonce);
        data.extend_from_slice(&ciphertext);
        hmac::sign(&key, &data)
    })?;

    let mut encrypted_header = Vec::with_capacity(HEADER_SIZE);
    encrypted_header.extend_from_slice(&header.nonce);
    encrypted_header.extend_from_slice(&ciphertext);
    encrypted_header.extend_from_slice(mac.as_ref());

    Ok(encrypted_header)
}

/// Decrypt a file header using AES-CTR + HMAC-SHA256.
///
/// The MAC is verified before any decryption (authenticate-then-decrypt).
#[instrument(level = "debug", skip(encrypted_header, master_key), fields(header_size = encrypted_header.len()))]
pub fn decrypt_header(
    encrypted_header: &[u8],
    master_key: &MasterKey,
    context: &FileContext,
) -> Result<FileHeader, ContentError> {
    trace!("Decrypting file header");

    if encrypted_header.len() != HEADER_SIZE {
        warn!(
            actual_size = encrypted_header.len(),
            expected_size = HEADER_SIZE,
            "Invalid header size"
        );
        return Err(ContentError::InvalidHeader {
            reason: format!(
                "expected {} bytes, got {} bytes",
                HEADER_SIZE,
                encrypted_header.len()
            ),
            context: context.clone(),
        });
    }

    let nonce: [u8; NONCE_SIZE] = encrypted_header[..NONCE_SIZE].try_into().unwrap();
    let ciphertext = &encrypted_header[NONCE_SIZE..NONCE_SIZE + HEADER_PAYLOAD_SIZE];
    let expected_mac = &encrypted_header[NONCE_SIZE + HEADER_PAYLOAD_SIZE..];

    master_key.with_mac_key(|mac_key| {
        let key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
        let data_to_verify = &encrypted_header[..NONCE_SIZE + HEADER_PAYLOAD_SIZE];
        let computed_mac = hmac::sign(&key, data_to_verify);

        if computed_mac.as_ref().ct_eq(expected_mac).into() {
            Ok(())
        } else {
            warn!("Header HMAC verification failed");
            Err(ContentError::MacVerification {
                context: context.clone(),
            })
        }
    })??;

    let content_key = master_key.with_aes_key(|aes_key| {
        let mut cipher = Aes256Ctr::new(aes_key.into(), (&nonce).into());

        let mut plaintext = Zeroizing::new(ciphertext.to_vec());
        cipher.apply_keystream(&mut plaintext);

        // The reserved bytes are -1 as a signed 64-bit integer (all 0xFF)
        let reserved = &plaintext[..8];
        if reserved != [0xFF; 8] {
            debug!(
                reserved_bytes = ?hex::encode(reserved),
                "Header has non-standard reserved bytes (expected 0xFF padding)"
            );
        }

        let mut content_key = Zeroizing::new([0u8; 32]);
        content_key.copy_from_slice(&plaintext[8..HEADER_PAYLOAD_SIZE]);
        content_key
    })?;

    debug!("File header decrypted successfully");
    Ok(FileHeader { nonce, content_key })
}

// ============================================================================
// Content Chunks
// ============================================================================

/// Encrypt a single cleartext chunk at the given ordinal index.
///
/// `cleartext` must be at most [`PAYLOAD_SIZE`] bytes; the output is
/// `cleartext.len() + 48` bytes.
pub fn encrypt_chunk(
    cleartext: &[u8],
    chunk_index: u64,
    header: &FileHeader,
    master_key: &MasterKey,
) -> Result<Vec<u8>, ContentError> {
    debug_assert!(cleartext.len() <= PAYLOAD_SIZE);

    let mut chunk_nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut chunk_nonce);

    let content_key: &[u8; 32] = &header.content_key;
    let mut cipher = Aes256Ctr::new(content_key.into(), (&chunk_nonce).into());
    let mut ciphertext = cleartext.to_vec();
    cipher.apply_keystream(&mut ciphertext);

    // MAC over header_nonce || chunk_index_be || chunk_nonce || ciphertext
    let mac = master_key.with_mac_key(|mac_key| {
        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
        let mut mac_context = hmac::Context::with_key(&hmac_key);
        mac_context.update(&header.nonce);
        mac_context.update(&chunk_index.to_be_bytes());
        mac_context.update(&chunk_nonce);
        mac_context.update(&ciphertext);
        mac_context.sign()
    })?;

    let mut encrypted = Vec::with_capacity(CHUNK_OVERHEAD + ciphertext.len());
    encrypted.extend_from_slice(&chunk_nonce);
    encrypted.extend_from_slice(&ciphertext);
    encrypted.extend_from_slice(mac.as_ref());

    Ok(encrypted)
}

/// Decrypt a single ciphertext chunk at the given ordinal index.
///
/// The MAC binds the header nonce and the chunk index, so a chunk moved to a
/// different position (or a different file) fails verification.
pub fn decrypt_chunk(
    encrypted_chunk: &[u8],
    chunk_index: u64,
    header: &FileHeader,
    master_key: &MasterKey,
    base_context: &FileContext,
) -> Result<Vec<u8>, ContentError> {
    let context = base_context.clone().with_chunk(chunk_index);

    if encrypted_chunk.len() < CHUNK_OVERHEAD {
        warn!(
            chunk = chunk_index,
            actual_size = encrypted_chunk.len(),
            min_size = CHUNK_OVERHEAD,
            "Incomplete chunk"
        );
        return Err(ContentError::InvalidChunk {
            reason: format!(
                "chunk too small: expected at least {} bytes, got {}",
                CHUNK_OVERHEAD,
                encrypted_chunk.len()
            ),
            context,
        });
    }
    if encrypted_chunk.len() > CHUNK_SIZE {
        return Err(ContentError::InvalidChunk {
            reason: format!(
                "chunk too large: expected at most {} bytes, got {}",
                CHUNK_SIZE,
                encrypted_chunk.len()
            ),
            context,
        });
    }

    let chunk_nonce: [u8; NONCE_SIZE] = encrypted_chunk[..NONCE_SIZE].try_into().unwrap();
    let ciphertext = &encrypted_chunk[NONCE_SIZE..encrypted_chunk.len() - MAC_SIZE];
    let expected_mac = &encrypted_chunk[encrypted_chunk.len() - MAC_SIZE..];

    // Verify HMAC: MAC(header_nonce || chunk_index_be || chunk_nonce || ciphertext)
    master_key.with_mac_key(|mac_key| {
        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
        let mut mac_context = hmac::Context::with_key(&hmac_key);
        mac_context.update(&header.nonce);
        mac_context.update(&chunk_index.to_be_bytes());
        mac_context.update(&chunk_nonce);
        mac_context.update(ciphertext);
        let computed_mac = mac_context.sign();

        if bool::from(computed_mac.as_ref().ct_eq(expected_mac)) {
            Ok(())
        } else {
            warn!(chunk = chunk_index, "Chunk HMAC verification failed");
            Err(ContentError::MacVerification {
                context: context.clone(),
            })
        }
    })??;

    let content_key: &[u8; 32] = &header.content_key;
    let mut cipher = Aes256Ctr::new(content_key.into(), (&chunk_nonce).into());
    let mut plaintext = ciphertext.to_vec();
    cipher.apply_keystream(&mut plaintext);

    trace!(
        chunk = chunk_index,
        decrypted_size = plaintext.len(),
        "Chunk decrypted successfully"
    );
    Ok(plaintext)
}

// ============================================================================
// Size Arithmetic
// ============================================================================

/// Byte offset of chunk `index` within the ciphertext file.
#[inline]
pub fn chunk_offset(index: u64) -> u64 {
    HEADER_SIZE as u64 + index * CHUNK_SIZE as u64
}

/// Ciphertext file size for a given cleartext length.
///
/// An empty file is just the header; a trailing partial chunk carries the
/// full 48-byte overhead.
pub fn ciphertext_size(cleartext_len: u64) -> u64 {
    let full_chunks = cleartext_len / PAYLOAD_SIZE as u64;
    let remainder = cleartext_len % PAYLOAD_SIZE as u64;
    let tail = if remainder > 0 {
        remainder + CHUNK_OVERHEAD as u64
    } else {
        0
    };
    HEADER_SIZE as u64 + full_chunks * CHUNK_SIZE as u64 + tail
}

/// Cleartext length derived from a ciphertext file size.
///
/// Returns `None` when the size cannot correspond to any well-formed
/// ciphertext (shorter than a header, or a trailing fragment smaller than
/// the per-chunk overhead).
pub fn cleartext_size(ciphertext_len: u64) -> Option<u64> {
    let content_len = ciphertext_len.checked_sub(HEADER_SIZE as u64)?;
    let full_chunks = content_len / CHUNK_SIZE as u64;
    let remainder = content_len % CHUNK_SIZE as u64;
    // A trailing remainder of exactly CHUNK_OVERHEAD is an empty final chunk.
    let tail = match remainder {
        0 => 0,
        r if r >= CHUNK_OVERHEAD as u64 => r - CHUNK_OVERHEAD as u64,
        _ => return None,
    };
    Some(full_chunks * PAYLOAD_SIZE as u64 + tail)
}

/// Like [`cleartext_size`], but degrades to 0 on malformed sizes.
///
/// Size observation must never fail (partially written files exist on disk),
/// so a malformed ciphertext size is logged and reported as empty.
pub fn cleartext_size_or_zero(ciphertext_len: u64) -> u64 {
    match cleartext_size(ciphertext_len) {
        Some(len) => len,
        None => {
            warn!(
                ciphertext_len,
                "Malformed ciphertext size, reporting cleartext size 0"
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_master_key() -> MasterKey {
        let mut aes_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        for i in 0..32 {
            aes_key[i] = i as u8;
            mac_key[i] = (32 + i) as u8;
        }
        MasterKey::new(aes_key, mac_key).unwrap()
    }

    #[test]
    fn test_header_roundtrip() {
        let master_key = test_master_key();
        let header = FileHeader::create();

        let encrypted = encrypt_header(&header, &master_key).unwrap();
        assert_eq!(encrypted.len(), HEADER_SIZE);

        let decrypted = decrypt_header(&encrypted, &master_key, &FileContext::new()).unwrap();
        assert_eq!(decrypted.nonce, header.nonce);
        assert_eq!(decrypted.content_key.as_ref(), header.content_key.as_ref());
    }

    #[test]
    fn test_chunk_roundtrip() {
        let master_key = test_master_key();
        let header = FileHeader::create();

        let plaintext = b"Hello, vault!";
        let encrypted = encrypt_chunk(plaintext, 0, &header, &master_key).unwrap();
        assert_eq!(encrypted.len(), plaintext.len() + CHUNK_OVERHEAD);

        let decrypted =
            decrypt_chunk(&encrypted, 0, &header, &master_key, &FileContext::new()).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_full_chunk_roundtrip() {
        let master_key = test_master_key();
        let header = FileHeader::create();

        let plaintext: Vec<u8> = (0..PAYLOAD_SIZE).map(|i| (i % 256) as u8).collect();
        let encrypted = encrypt_chunk(&plaintext, 7, &header, &master_key).unwrap();
        assert_eq!(encrypted.len(), CHUNK_SIZE);

        let decrypted =
            decrypt_chunk(&encrypted, 7, &header, &master_key, &FileContext::new()).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_chunk_roundtrip() {
        let master_key = test_master_key();
        let header = FileHeader::create();

        let encrypted = encrypt_chunk(&[], 0, &header, &master_key).unwrap();
        assert_eq!(encrypted.len(), CHUNK_OVERHEAD);

        let decrypted =
            decrypt_chunk(&encrypted, 0, &header, &master_key, &FileContext::new()).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_tampered_header_mac() {
        let master_key = test_master_key();
        let header = FileHeader::create();

        let mut encrypted = encrypt_header(&header, &master_key).unwrap();
        encrypted[HEADER_SIZE - 1] ^= 0xFF;

        let result = decrypt_header(&encrypted, &master_key, &FileContext::new());
        assert!(matches!(result, Err(ContentError::MacVerification { .. })));
    }

    #[test]
    fn test_tampered_chunk_mac() {
        let master_key = test_master_key();
        let header = FileHeader::create();

        let mut encrypted = encrypt_chunk(b"data", 0, &header, &master_key).unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;

        let result = decrypt_chunk(&encrypted, 0, &header, &master_key, &FileContext::new());
        assert!(matches!(result, Err(ContentError::MacVerification { .. })));
    }

    #[test]
    fn test_chunk_index_bound_into_mac() {
        let master_key = test_master_key();
        let header = FileHeader::create();

        // A chunk encrypted at index 0 must not verify at index 1
        let encrypted = encrypt_chunk(b"data", 0, &header, &master_key).unwrap();
        let result = decrypt_chunk(&encrypted, 1, &header, &master_key, &FileContext::new());
        assert!(matches!(result, Err(ContentError::MacVerification { .. })));
    }

    #[test]
    fn test_chunk_bound_to_header_nonce() {
        let master_key = test_master_key();
        let header_a = FileHeader::create();
        let mut header_b = FileHeader::create();
        header_b.content_key = header_a.content_key.clone();

        // Same content key, different header nonce: chunk must not transplant
        let encrypted = encrypt_chunk(b"data", 0, &header_a, &master_key).unwrap();
        let result = decrypt_chunk(&encrypted, 0, &header_b, &master_key, &FileContext::new());
        assert!(matches!(result, Err(ContentError::MacVerification { .. })));
    }

    #[test]
    fn test_truncated_chunk_rejected() {
        let master_key = test_master_key();
        let header = FileHeader::create();

        let result = decrypt_chunk(&[0u8; 20], 0, &header, &master_key, &FileContext::new());
        assert!(matches!(result, Err(ContentError::InvalidChunk { .. })));
    }

    #[test]
    fn test_size_arithmetic_roundtrip() {
        for len in [
            0u64,
            1,
            7,
            PAYLOAD_SIZE as u64 - 1,
            PAYLOAD_SIZE as u64,
            PAYLOAD_SIZE as u64 + 1,
            3 * PAYLOAD_SIZE as u64 + 12345,
        ] {
            let ct = ciphertext_size(len);
            assert_eq!(cleartext_size(ct), Some(len), "len={len}");
        }
    }

    #[test]
    fn test_size_of_header_only_file_is_zero() {
        assert_eq!(cleartext_size(HEADER_SIZE as u64), Some(0));
        assert_eq!(ciphertext_size(0), HEADER_SIZE as u64);
        // An empty trailing chunk also reads as size 0
        assert_eq!(
            cleartext_size(HEADER_SIZE as u64 + CHUNK_OVERHEAD as u64),
            Some(0)
        );
    }

    #[test]
    fn test_malformed_sizes_degrade_to_zero() {
        // shorter than a header
        assert_eq!(cleartext_size(0), None);
        assert_eq!(cleartext_size(87), None);
        // trailing fragment smaller than the chunk overhead
        assert_eq!(cleartext_size(HEADER_SIZE as u64 + 30), None);
        assert_eq!(cleartext_size_or_zero(HEADER_SIZE as u64 + 30), 0);
        assert_eq!(cleartext_size_or_zero(12), 0);
    }

    #[test]
    fn test_chunk_offsets() {
        assert_eq!(chunk_offset(0), 88);
        assert_eq!(chunk_offset(1), 88 + 32816);
        assert_eq!(chunk_offset(2), 88 + 2 * 32816);
    }
}
