#![forbid(unsafe_code)]

use std::sync::RwLock;

use generic_array::{typenum::U64, GenericArray};
use memsafe::{MemSafe, NoAccess};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

/// Adapter so `memsafe::MemoryError` (which does not implement `std::error::Error`)
/// can be boxed via [`KeyAccessError::memory_protection`].
#[derive(Debug)]
struct MemSafeError(memsafe::MemoryError);

impl std::fmt::Display for MemSafeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.inner())
    }
}

impl std::error::Error for MemSafeError {}

/// Error type for key access operations.
///
/// This error can occur when accessing protected key material, either due to
/// memory protection failures or lock poisoning (a thread panicked while holding the lock).
#[derive(Debug, Error)]
pub enum KeyAccessError {
    /// Memory protection operation failed (mlock, mprotect, etc.)
    #[error("Memory protection operation failed: {0}")]
    MemoryProtection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Lock was poisoned (a thread panicked while holding it)
    #[error("Key lock was poisoned")]
    LockPoisoned,
}

impl KeyAccessError {
    /// Create a memory protection error from any error type.
    pub fn memory_protection<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        KeyAccessError::MemoryProtection(Box::new(err))
    }
}

/// Master key pair for vault operations.
///
/// Holds both the AES encryption key and the MAC authentication key, each
/// 256 bits (32 bytes) for a total of 512 bits of key material.
///
/// # Security
///
/// The keys are stored using the `memsafe` crate's `MemSafe` type, which provides:
/// - **Memory locking**: Keys are pinned in RAM via `mlock`, preventing swap to disk
/// - **Access control**: Memory is protected with `mprotect(PROT_NONE)` when not in use
/// - **Dump exclusion**: On Linux, `MADV_DONTDUMP` excludes keys from core dumps
/// - **Zeroization**: Memory is securely zeroed when the key is dropped
///
/// Access to key material is provided through scoped access methods
/// (`with_aes_key`, `with_mac_key`, `with_siv_key`) that temporarily elevate
/// memory permissions to read the key, then immediately revoke access when
/// the operation completes. The fields are intentionally private to enforce
/// this pattern.
///
/// # Thread Safety
///
/// `MasterKey` is thread-safe (`Send + Sync`) and can be shared across threads
/// using `Arc<MasterKey>`. The internal `RwLock` ensures safe concurrent access.
/// If a thread panics while holding the lock, the key becomes inaccessible
/// (lock poisoning) as a safety measure.
pub struct MasterKey {
    aes_master_key: RwLock<Option<MemSafe<[u8; 32], NoAccess>>>,
    mac_master_key: RwLock<Option<MemSafe<[u8; 32], NoAccess>>>,
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey").finish_non_exhaustive()
    }
}

/// Briefly elevate a `NoAccess`-guarded key slot to `ReadOnly`, copy out its
/// bytes, then immediately revoke access again.
fn read_locked(
    lock: &RwLock<Option<MemSafe<[u8; 32], NoAccess>>>,
) -> Result<[u8; 32], KeyAccessError> {
    let mut guard = lock.write().map_err(|_| KeyAccessError::LockPoisoned)?;
    let no_access = guard.take().expect("key slot is always populated");
    let read_only = no_access
        .read_only()
        .map_err(|e| KeyAccessError::memory_protection(MemSafeError(e)))?;
    let bytes = *read_only;
    let no_access = read_only
        .no_access()
        .map_err(|e| KeyAccessError::memory_protection(MemSafeError(e)))?;
    *guard = Some(no_access);
    Ok(bytes)
}

impl MasterKey {
    /// Generate a new random master key pair using a cryptographically secure RNG.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if memory protection initialization fails.
    /// This can happen if the system's mlock limit is exceeded or if the
    /// memory protection syscalls fail.
    pub fn random() -> Result<Self, KeyAccessError> {
        let mut aes_master_key = [0u8; 32];
        let mut mac_master_key = [0u8; 32];
        rand::rng().fill_bytes(&mut aes_master_key);
        rand::rng().fill_bytes(&mut mac_master_key);
        Self::new(aes_master_key, mac_master_key)
    }

    /// Create a new master key pair from raw key material.
    ///
    /// The provided key arrays are copied into `MemSafe` containers. The caller
    /// is responsible for zeroing the original arrays if they contain
    /// sensitive data.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if memory protection initialization fails.
    pub fn new(aes_key: [u8; 32], mac_key: [u8; 32]) -> Result<Self, KeyAccessError> {
        Ok(MasterKey {
            aes_master_key: RwLock::new(Some(
                MemSafe::new(aes_key).map_err(|e| KeyAccessError::memory_protection(MemSafeError(e)))?,
            )),
            mac_master_key: RwLock::new(Some(
                MemSafe::new(mac_key).map_err(|e| KeyAccessError::memory_protection(MemSafeError(e)))?,
            )),
        })
    }

    /// Try to clone the master key, returning an error on failure.
    pub fn try_clone(&self) -> Result<Self, KeyAccessError> {
        let aes_key = read_locked(&self.aes_master_key)?;
        let mac_key = read_locked(&self.mac_master_key)?;
        Self::new(aes_key, mac_key)
    }

    /// Execute a function with access to the raw 512-bit combined key material.
    ///
    /// The key material (AES key || MAC key) never escapes this function and
    /// is automatically zeroed when the callback completes.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if the lock is poisoned or if
    /// memory protection operations fail.
    pub fn with_raw_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8]) -> R,
    {
        // Custom wrapper for zeroization
        struct ZeroOnDrop([u8; 64]);
        impl Drop for ZeroOnDrop {
            fn drop(&mut self) {
                self.0.zeroize();
            }
        }

        let mut key = ZeroOnDrop([0u8; 64]);

        key.0[..32].copy_from_slice(&read_locked(&self.aes_master_key)?);
        key.0[32..].copy_from_slice(&read_locked(&self.mac_master_key)?);

        Ok(f(&key.0))
    }

    /// Execute a function with access to just the AES encryption key.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if the lock is poisoned or if
    /// memory protection operations fail.
    pub fn with_aes_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        let mut key = read_locked(&self.aes_master_key)?;
        let result = f(&key);
        key.zeroize();
        Ok(result)
    }

    /// Execute a function with access to just the MAC key.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if the lock is poisoned or if
    /// memory protection operations fail.
    pub fn with_mac_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        let mut key = read_locked(&self.mac_master_key)?;
        let result = f(&key);
        key.zeroize();
        Ok(result)
    }

    /// Execute a function with access to both keys in AES-SIV order (MAC || AES).
    ///
    /// For AES-SIV operations, the key order is MAC key first, then AES key.
    /// The 64-byte combined key is automatically zeroed after the callback
    /// completes.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if the lock is poisoned or if
    /// memory protection operations fail.
    pub fn with_siv_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&GenericArray<u8, U64>) -> R,
    {
        // Custom wrapper since GenericArray doesn't implement DefaultIsZeroes
        struct ZeroizeOnDrop(GenericArray<u8, U64>);

        impl Drop for ZeroizeOnDrop {
            fn drop(&mut self) {
                self.0.zeroize();
            }
        }

        let mut key = ZeroizeOnDrop(GenericArray::<u8, U64>::default());

        // Note: SIV uses MAC key first, then AES key
        key.0[..32].copy_from_slice(&read_locked(&self.mac_master_key)?);
        key.0[32..].copy_from_slice(&read_locked(&self.aes_master_key)?);

        Ok(f(&key.0))
    }

    /// Create an AES-SIV cipher for filename encryption/decryption.
    ///
    /// Convenience method that creates an `Aes256Siv` cipher with the correct
    /// key ordering for filename operations.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if the lock is poisoned or if
    /// memory protection operations fail.
    pub fn create_name_cipher(&self) -> Result<aes_siv::siv::Aes256Siv, KeyAccessError> {
        self.with_siv_key(|key| {
            use aes_siv::KeyInit;
            aes_siv::siv::Aes256Siv::new(key)
        })
    }
}
