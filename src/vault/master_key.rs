#![forbid(unsafe_code)]

//! The `masterkey.cryptomator` file: load, unlock, persist.
//!
//! The file is JSON carrying the scrypt parameters, the two master keys
//! wrapped per RFC 3394 under a passphrase-derived KEK, and an HMAC over the
//! vault format version. Unlocking derives the KEK, unwraps both keys, and
//! verifies the version MAC; an unwrap integrity failure is the
//! wrong-passphrase signal.

use std::path::Path;

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::SecretBox;
use thiserror::Error;
use zeroize::Zeroizing;

use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use unicode_normalization::UnicodeNormalization;

use crate::crypto::{
    key_wrap,
    keys::{KeyAccessError, MasterKey},
    CryptoError,
};

/// Vault format version written to and expected in masterkey files.
pub const VAULT_VERSION: u32 = 6;

/// Default scrypt parameters for new vaults.
///
/// - Salt length 8 bytes
/// - Cost parameter N = 2^15 (32768)
/// - Block size r = 8
/// - Parallelization p = 1
const DEFAULT_SCRYPT_SALT_LENGTH: usize = 8;
const DEFAULT_SCRYPT_COST_PARAM_LOG2: u8 = 15;
const DEFAULT_SCRYPT_BLOCK_SIZE: u32 = 8;
const DEFAULT_SCRYPT_PARALLELIZATION: u32 = 1;

/// Fast scrypt cost parameter for testing (N = 2^10 = 1024).
///
/// This is ~32x faster than the default and should ONLY be used for testing.
/// Enable by setting the `CRYPTOFS_FAST_KDF` environment variable to `1`.
const FAST_SCRYPT_COST_PARAM_LOG2: u8 = 10;

/// Check if fast KDF mode is enabled via environment variable.
///
/// **WARNING**: This is for testing only. Never use in production!
#[inline]
fn is_fast_kdf_enabled() -> bool {
    std::env::var("CRYPTOFS_FAST_KDF")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn scrypt_cost_param_log2() -> u8 {
    if is_fast_kdf_enabled() {
        FAST_SCRYPT_COST_PARAM_LOG2
    } else {
        DEFAULT_SCRYPT_COST_PARAM_LOG2
    }
}

/// Errors from loading, unlocking, or persisting a masterkey file.
#[derive(Error, Debug)]
pub enum MasterKeyError {
    /// The masterkey file could not be read or written.
    #[error("Failed to access masterkey file: {0}")]
    Io(#[from] std::io::Error),

    /// The masterkey file is not valid JSON (or misses recognized fields).
    #[error("Failed to parse masterkey file: {0}")]
    Parse(#[from] serde_json::Error),

    /// The vault was created by a newer format than this implementation
    /// supports.
    #[error("Unsupported vault version {found} (supported: {VAULT_VERSION})")]
    UnsupportedVaultVersion { found: u32 },

    /// The vault uses an older format and must be migrated first.
    #[error("Vault version {found} needs migration to {VAULT_VERSION}")]
    VaultNeedsMigration { found: u32 },

    /// RNG failure while generating salt.
    #[error("RNG failed: {0}")]
    Rng(String),

    /// Cryptographic failure (wrong passphrase, bad scrypt parameters,
    /// tampered version MAC).
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Key wrap failure while persisting.
    #[error("Key wrap failed: {0}")]
    KeyWrap(#[from] key_wrap::WrapError),

    /// Key access failed.
    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// The masterkey file format.
///
/// Recognized fields only; the KEK is derived as
/// `scrypt(NFC(passphrase), scryptSalt || pepper, N, r, p=1)` and both keys
/// are RFC 3394 wrapped under it.
#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeyFile {
    /// Vault format version, authenticated by `version_mac`.
    pub version: u32,

    /// Salt for scrypt key derivation (8 bytes in vaults we create).
    #[serde_as(as = "Base64")]
    pub scrypt_salt: Vec<u8>,

    /// Scrypt cost parameter N (must be a power of 2).
    pub scrypt_cost_param: i32,

    /// Scrypt block size parameter r.
    pub scrypt_block_size: i32,

    /// The wrapped (encrypted) AES master key.
    #[serde_as(as = "Base64")]
    pub primary_master_key: Vec<u8>,

    /// The wrapped (encrypted) MAC master key.
    #[serde_as(as = "Base64")]
    pub hmac_master_key: Vec<u8>,

    /// HMAC-SHA256 of the vault version (as big-endian 4-byte integer).
    #[serde_as(as = "Base64")]
    pub version_mac: Vec<u8>,
}

impl MasterKeyFile {
    /// Load a masterkey file from disk.
    pub fn load(path: &Path) -> Result<Self, MasterKeyError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Check the (not yet authenticated) version field against what this
    /// implementation supports.
    ///
    /// Performed before key derivation so a user with an outdated vault gets
    /// a version error, not a passphrase prompt loop.
    pub fn check_version(&self) -> Result<(), MasterKeyError> {
        if self.version > VAULT_VERSION {
            return Err(MasterKeyError::UnsupportedVaultVersion {
                found: self.version,
            });
        }
        if self.version < VAULT_VERSION {
            return Err(MasterKeyError::VaultNeedsMigration {
                found: self.version,
            });
        }
        Ok(())
    }

    /// Derive the key encryption key from a passphrase and pepper.
    ///
    /// The pepper is concatenated with the salt before derivation:
    /// `scrypt(passphrase, salt || pepper, ...)`. The passphrase is
    /// NFC-normalized first.
    pub fn derive_key(
        &self,
        passphrase: &str,
        pepper: &[u8],
    ) -> Result<SecretBox<[u8; 32]>, CryptoError> {
        let normalized_passphrase = Zeroizing::new(passphrase.nfc().collect::<String>());

        let log2_n: u8 = log_2(self.scrypt_cost_param) as u8;
        let r: u32 = self.scrypt_block_size as u32;
        let p: u32 = DEFAULT_SCRYPT_PARALLELIZATION;

        let scrypt_params = scrypt::Params::new(log2_n, r, p, 32).map_err(|e| {
            CryptoError::InvalidScryptParams(format!(
                "Invalid scrypt parameters (N=2^{log2_n}, r={r}, p={p}): {e}"
            ))
        })?;

        let mut salt_and_pepper =
            Zeroizing::new(Vec::with_capacity(self.scrypt_salt.len() + pepper.len()));
        salt_and_pepper.extend_from_slice(&self.scrypt_salt);
        salt_and_pepper.extend_from_slice(pepper);

        let mut kek = Zeroizing::new([0u8; 32]);
        scrypt::scrypt(
            normalized_passphrase.as_bytes(),
            &salt_and_pepper,
            &scrypt_params,
            &mut kek[..],
        )
        .map_err(|e| CryptoError::KeyDerivationFailed(format!("Scrypt derivation failed: {e}")))?;

        Ok(SecretBox::new(Box::new(*kek)))
    }

    /// Unlock the vault: check the version, derive the KEK, unwrap both
    /// keys, verify the version MAC.
    ///
    /// # Errors
    ///
    /// - `MasterKeyError::UnsupportedVaultVersion` / `VaultNeedsMigration`
    /// - `CryptoError::KeyUnwrapIntegrityFailed` via `MasterKeyError::Crypto`:
    ///   wrong passphrase (or tampered file)
    /// - `CryptoError::HmacVerificationFailed`: version field tampered
    pub fn unlock(&self, passphrase: &str, pepper: &[u8]) -> Result<MasterKey, MasterKeyError> {
        self.check_version()?;
        let kek = self.derive_key(passphrase, pepper)?;
        self.unlock_with_kek(&kek)
    }

    fn unlock_with_kek(&self, kek: &SecretBox<[u8; 32]>) -> Result<MasterKey, MasterKeyError> {
        // Unwrap the primary (encryption) key first, then the MAC key.
        // Unwrap failure typically means wrong passphrase.
        let aes_key = key_wrap::unwrap_key(&self.primary_master_key, kek).map_err(CryptoError::from)?;
        let aes_key: [u8; 32] =
            aes_key
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: aes_key.len(),
                })?;

        let mac_key = key_wrap::unwrap_key(&self.hmac_master_key, kek).map_err(CryptoError::from)?;
        let mac_key: [u8; 32] =
            mac_key
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: mac_key.len(),
                })?;

        // Verify the version MAC - failure indicates an integrity violation
        self.check_version_mac(&mac_key)?;

        Ok(MasterKey::new(aes_key, mac_key).map_err(CryptoError::from)?)
    }

    /// Verify the version MAC using HMAC-SHA256 over the big-endian version.
    fn check_version_mac(&self, mac_key: &[u8; 32]) -> Result<(), CryptoError> {
        let key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
        hmac::verify(&key, &self.version.to_be_bytes(), &self.version_mac)
            .map_err(|_| CryptoError::HmacVerificationFailed)
    }
}

// From: https://users.rust-lang.org/t/logarithm-of-integers/8506/5
const fn num_bits<T>() -> usize {
    std::mem::size_of::<T>() * 8
}

fn log_2(x: i32) -> u32 {
    assert!(x > 0);
    num_bits::<i32>() as u32 - x.leading_zeros() - 1
}

/// Serialize a masterkey file wrapping `master_key` under `passphrase` (and
/// optional `pepper`), with a freshly generated salt.
pub fn create_masterkey_file(
    master_key: &MasterKey,
    passphrase: &str,
    pepper: &[u8],
) -> Result<String, MasterKeyError> {
    let mut salt = vec![0u8; DEFAULT_SCRYPT_SALT_LENGTH];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| MasterKeyError::Rng("Failed to generate salt".to_string()))?;

    let log2_n = scrypt_cost_param_log2();
    let r = DEFAULT_SCRYPT_BLOCK_SIZE;
    let p = DEFAULT_SCRYPT_PARALLELIZATION;

    let mut salt_and_pepper = Zeroizing::new(Vec::with_capacity(salt.len() + pepper.len()));
    salt_and_pepper.extend_from_slice(&salt);
    salt_and_pepper.extend_from_slice(pepper);

    let normalized_passphrase = Zeroizing::new(passphrase.nfc().collect::<String>());
    let scrypt_params = scrypt::Params::new(log2_n, r, p, 32).map_err(|e| {
        CryptoError::InvalidScryptParams(format!(
            "Invalid scrypt parameters (N=2^{log2_n}, r={r}, p={p}): {e}"
        ))
    })?;
    let mut kek = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(
        normalized_passphrase.as_bytes(),
        &salt_and_pepper,
        &scrypt_params,
        &mut kek[..],
    )
    .map_err(|e| CryptoError::KeyDerivationFailed(format!("Scrypt derivation failed: {e}")))?;
    let kek_secret = SecretBox::new(Box::new(*kek));

    // Wrap the encryption key first, then the MAC key
    let wrapped_aes = master_key.with_aes_key(|key| key_wrap::wrap_key(key, &kek_secret))??;
    let wrapped_mac = master_key.with_mac_key(|key| key_wrap::wrap_key(key, &kek_secret))??;

    let version_mac = master_key.with_mac_key(|key| {
        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key);
        let tag = hmac::sign(&hmac_key, &VAULT_VERSION.to_be_bytes());
        tag.as_ref().to_vec()
    })?;

    let masterkey_file = MasterKeyFile {
        version: VAULT_VERSION,
        scrypt_salt: salt,
        scrypt_cost_param: 1i32 << log2_n,
        scrypt_block_size: r as i32,
        primary_master_key: wrapped_aes,
        hmac_master_key: wrapped_mac,
        version_mac,
    };

    Ok(serde_json::to_string_pretty(&masterkey_file)?)
}

/// Change the vault passphrase by re-wrapping the master keys.
///
/// The master keys never change, only the KEK derived from the passphrase.
/// Both passphrases use the same pepper. Returns the new file content;
/// writing it back is the caller's responsibility.
pub fn change_passphrase(
    masterkey_path: &Path,
    old_passphrase: &str,
    new_passphrase: &str,
    pepper: &[u8],
) -> Result<String, MasterKeyError> {
    let masterkey_file = MasterKeyFile::load(masterkey_path)?;
    let master_key = masterkey_file.unlock(old_passphrase, pepper)?;
    create_masterkey_file(&master_key, new_passphrase, pepper)
}
