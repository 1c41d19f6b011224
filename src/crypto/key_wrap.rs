#![forbid(unsafe_code)]

//! AES key wrapping as defined in IETF RFC 3394.
//!
//! The master keys are persisted wrapped under a KEK derived from the user's
//! passphrase. RFC 3394 carries a 64-bit integrity register through every
//! wrapping round; an unwrap that ends with the wrong register value means
//! the KEK was wrong (in practice: wrong passphrase) or the ciphertext was
//! tampered with. The two cases are cryptographically indistinguishable.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use generic_array::{typenum::U16, GenericArray};
use secrecy::{ExposeSecret, SecretBox};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

type Block = GenericArray<u8, U16>;

/// Initial value from RFC 3394 Section 2.2.3.1.
const IV_3394: [u8; 8] = [0xa6; 8];

/// Errors that can occur when wrapping a key.
#[derive(Debug, Error)]
pub enum WrapError {
    /// The key material must be a non-empty multiple of 64 bits.
    #[error("Key data length {0} is not a non-empty multiple of 8 bytes")]
    InvalidKeyDataLength(usize),
}

/// Errors that can occur when unwrapping a key.
#[derive(Debug, Error)]
pub enum UnwrapError {
    /// The ciphertext must be a multiple of 64 bits.
    #[error("Ciphertext length is not a multiple of 8 bytes")]
    InvalidCiphertextLength,

    /// The ciphertext must contain the integrity register plus at least one block.
    #[error("Ciphertext too short to contain wrapped key material")]
    CiphertextTooShort,

    /// The integrity register did not match after unwrapping.
    ///
    /// This typically means the wrong KEK (wrong passphrase) was used, or the
    /// wrapped key has been tampered with.
    #[error("Key unwrap integrity check failed")]
    InvalidIntegrityCheck,
}

/// Wrap `key_data` under `kek` per RFC 3394.
///
/// Returns the 8-byte integrity register followed by the wrapped blocks, so
/// the output is always `key_data.len() + 8` bytes.
///
/// # Errors
///
/// Returns `WrapError::InvalidKeyDataLength` if `key_data` is empty or not a
/// multiple of 8 bytes.
pub fn wrap_key(key_data: &[u8], kek: &SecretBox<[u8; 32]>) -> Result<Vec<u8>, WrapError> {
    if key_data.is_empty() || key_data.len() % 8 != 0 {
        return Err(WrapError::InvalidKeyDataLength(key_data.len()));
    }

    let cipher = Aes256::new(kek.expose_secret().into());
    let n_blocks = key_data.len() / 8;

    // A: the 64-bit integrity check register; R: the data registers
    let mut integrity_check = IV_3394;
    let mut registers = Zeroizing::new(key_data.to_vec());

    for j in 0..6u64 {
        for (i, chunk) in registers.chunks_mut(8).enumerate() {
            let t = (n_blocks as u64) * j + (i as u64 + 1);

            // B = AES(K, A | R[i])
            let mut block = Block::default();
            block[..8].copy_from_slice(&integrity_check);
            block[8..].copy_from_slice(chunk);
            cipher.encrypt_block(&mut block);

            // A = MSB(64, B) ^ t
            for (a, (b, t)) in integrity_check
                .iter_mut()
                .zip(block[..8].iter().zip(t.to_be_bytes()))
            {
                *a = b ^ t;
            }
            // R[i] = LSB(64, B)
            chunk.copy_from_slice(&block[8..]);
        }
    }

    let mut ciphertext = Vec::with_capacity(8 + registers.len());
    ciphertext.extend_from_slice(&integrity_check);
    ciphertext.extend_from_slice(&registers);
    Ok(ciphertext)
}

/// Unwrap `ciphertext` under `kek` per RFC 3394, verifying the integrity register.
///
/// # Errors
///
/// - `UnwrapError::InvalidCiphertextLength` / `CiphertextTooShort` on malformed input
/// - `UnwrapError::InvalidIntegrityCheck` on wrong KEK or tampered ciphertext
pub fn unwrap_key(
    ciphertext: &[u8],
    kek: &SecretBox<[u8; 32]>,
) -> Result<Zeroizing<Vec<u8>>, UnwrapError> {
    if ciphertext.len() % 8 != 0 {
        return Err(UnwrapError::InvalidCiphertextLength);
    }
    if ciphertext.len() < 24 {
        return Err(UnwrapError::CiphertextTooShort);
    }

    let cipher = Aes256::new(kek.expose_secret().into());
    let n_blocks = (ciphertext.len() - 8) / 8;

    let mut integrity_check: [u8; 8] = ciphertext[..8].try_into().unwrap();
    let mut registers = Zeroizing::new(ciphertext[8..].to_vec());

    for j in (0..6u64).rev() {
        for (i, chunk) in registers.chunks_mut(8).enumerate().rev() {
            let t = (n_blocks as u64) * j + (i as u64 + 1);

            // B = AES-1(K, (A ^ t) | R[i])
            let mut block = Block::default();
            for (b, (a, t)) in block[..8]
                .iter_mut()
                .zip(integrity_check.iter().zip(t.to_be_bytes()))
            {
                *b = a ^ t;
            }
            block[8..].copy_from_slice(chunk);
            cipher.decrypt_block(&mut block);

            // A = MSB(64, B); R[i] = LSB(64, B)
            integrity_check.copy_from_slice(&block[..8]);
            chunk.copy_from_slice(&block[8..]);
        }
    }

    if bool::from(integrity_check.ct_eq(&IV_3394)) {
        Ok(registers)
    } else {
        Err(UnwrapError::InvalidIntegrityCheck)
    }
}
