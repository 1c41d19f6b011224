//! Long filename deflation and the sidecar store under `m/`.
//!
//! Host filesystems cap name lengths well below what BASE32-encoded
//! ciphertext names can reach. Encoded names longer than
//! [`SHORTENING_THRESHOLD`] are replaced on disk by a deflated form:
//! `BASE32(SHA-1(name)) + ".lng"`, stored in the data tree, while the full
//! name is written to a sidecar file at `m/<c0c1>/<c2c3>/<deflated>`.
//!
//! The sidecar's filename contains a hash of its own contents, so it is
//! content-addressed: once written it is never rewritten, and the same long
//! name always deflates to byte-identical sidecar contents.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use data_encoding::BASE32;
use ring::digest;
use thiserror::Error;
use tracing::{debug, warn};

/// Encoded names longer than this (marker prefix included) are deflated.
pub const SHORTENING_THRESHOLD: usize = 222;

/// Suffix of deflated names and their sidecar files.
pub const LONG_NAME_SUFFIX: &str = ".lng";

/// Errors from long-name deflation and the sidecar store.
#[derive(Error, Debug)]
pub enum LongNameError {
    /// The sidecar file for a deflated name does not exist.
    #[error("Missing long-name sidecar for '{deflated}'")]
    MissingSidecar { deflated: String },

    /// A sidecar exists but holds a different name than the one being deflated.
    ///
    /// Sidecar names are content-addressed, so this means the store is
    /// corrupt (or SHA-1 collided, which is not expected in this domain).
    #[error("Long-name sidecar '{deflated}' holds conflicting contents")]
    SidecarConflict { deflated: String },

    /// Sidecar contents are not valid UTF-8.
    #[error("Long-name sidecar '{deflated}' is not valid UTF-8")]
    InvalidSidecar { deflated: String },

    /// Underlying filesystem error.
    #[error("IO error accessing long-name sidecar: {0}")]
    Io(#[from] io::Error),
}

/// Whether an on-disk entry name is a deflated long-name reference.
#[inline]
pub fn is_deflated(name: &str) -> bool {
    name.ends_with(LONG_NAME_SUFFIX)
}

/// Whether an encoded entry name must be stored in deflated form.
#[inline]
pub fn needs_deflation(encoded_name: &str) -> bool {
    encoded_name.len() > SHORTENING_THRESHOLD
}

/// Deflate a long encoded name to its on-disk reference.
///
/// Pure function: `BASE32(SHA-1(utf8(name))) + ".lng"`. The persisted sidecar
/// is handled separately by [`LongNameStore`].
pub fn deflate(encoded_name: &str) -> String {
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, encoded_name.as_bytes());
    format!("{}{}", BASE32.encode(hash.as_ref()), LONG_NAME_SUFFIX)
}

/// The sidecar store rooted at the vault's `m/` directory.
///
/// Maps deflated references back to their full encoded names. Writing is
/// idempotent; rewriting a sidecar with different contents is treated as
/// corruption, never performed.
#[derive(Debug, Clone)]
pub struct LongNameStore {
    metadata_root: PathBuf,
}

impl LongNameStore {
    pub fn new(metadata_root: PathBuf) -> Self {
        Self { metadata_root }
    }

    /// Physical path of the sidecar for a deflated reference.
    ///
    /// Sidecars are sharded two levels deep by the first four characters of
    /// the deflated name: `m/<c0c1>/<c2c3>/<deflated>`.
    pub fn sidecar_path(&self, deflated: &str) -> PathBuf {
        self.metadata_root
            .join(&deflated[0..2])
            .join(&deflated[2..4])
            .join(deflated)
    }

    /// Deflate `encoded_name` and persist its sidecar if not yet present.
    ///
    /// Returns the deflated on-disk reference. If the sidecar already exists
    /// its contents must match `encoded_name` exactly; anything else is
    /// corruption.
    pub fn deflate_and_persist(&self, encoded_name: &str) -> Result<String, LongNameError> {
        let deflated = deflate(encoded_name);
        let path = self.sidecar_path(&deflated);

        match fs::read(&path) {
            Ok(existing) => {
                if existing == encoded_name.as_bytes() {
                    return Ok(deflated);
                }
                warn!(
                    sidecar = %path.display(),
                    "Sidecar exists with conflicting contents"
                );
                return Err(LongNameError::SidecarConflict { deflated });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write-to-temp then rename, so a half-written sidecar is never
        // observable under its content-addressed name.
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(encoded_name.as_bytes())?;
        }
        fs::rename(&tmp, &path)?;

        debug!(sidecar = %path.display(), "Persisted long-name sidecar");
        Ok(deflated)
    }

    /// Resolve a deflated reference back to its full encoded name.
    pub fn inflate(&self, deflated: &str) -> Result<String, LongNameError> {
        let path = self.sidecar_path(deflated);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                LongNameError::MissingSidecar {
                    deflated: deflated.to_string(),
                }
            } else {
                LongNameError::Io(e)
            }
        })?;

        String::from_utf8(bytes).map_err(|_| LongNameError::InvalidSidecar {
            deflated: deflated.to_string(),
        })
    }

    /// Remove the sidecar for a deflated reference, if present.
    ///
    /// Called when the last data-tree entry referencing it is deleted.
    pub fn remove(&self, deflated: &str) -> Result<(), LongNameError> {
        let path = self.sidecar_path(deflated);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Root of the sidecar tree (the vault's `m/` directory).
    pub fn metadata_root(&self) -> &Path {
        &self.metadata_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_deflate_is_deterministic() {
        let name = "A".repeat(300);
        assert_eq!(deflate(&name), deflate(&name));
    }

    #[test]
    fn test_deflate_format() {
        let deflated = deflate("SOMEVERYLONGENCODEDNAME");
        // BASE32 of a 20-byte SHA-1 is 32 chars, plus the suffix
        assert_eq!(deflated.len(), 32 + LONG_NAME_SUFFIX.len());
        assert!(deflated.ends_with(LONG_NAME_SUFFIX));
        assert!(is_deflated(&deflated));
    }

    #[test]
    fn test_needs_deflation_threshold() {
        assert!(!needs_deflation(&"A".repeat(222)));
        assert!(needs_deflation(&"A".repeat(223)));
    }

    #[test]
    fn test_persist_and_inflate_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = LongNameStore::new(tmp.path().to_path_buf());

        let long_name = format!("{}=", "Z".repeat(250));
        let deflated = store.deflate_and_persist(&long_name).unwrap();

        assert_eq!(store.inflate(&deflated).unwrap(), long_name);

        // Sidecar lives in the two-level sharded layout
        let sidecar = store.sidecar_path(&deflated);
        assert!(sidecar.exists());
        assert_eq!(
            sidecar.parent().unwrap().file_name().unwrap().len(),
            2,
            "second shard level should be two chars"
        );
    }

    #[test]
    fn test_persist_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = LongNameStore::new(tmp.path().to_path_buf());

        let long_name = "Q".repeat(240);
        let first = store.deflate_and_persist(&long_name).unwrap();
        let second = store.deflate_and_persist(&long_name).unwrap();
        assert_eq!(first, second);

        let contents = fs::read(store.sidecar_path(&first)).unwrap();
        assert_eq!(contents, long_name.as_bytes());
    }

    #[test]
    fn test_conflicting_sidecar_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let store = LongNameStore::new(tmp.path().to_path_buf());

        let long_name = "Q".repeat(240);
        let deflated = store.deflate_and_persist(&long_name).unwrap();

        // Forge a conflicting sidecar under the same name
        fs::write(store.sidecar_path(&deflated), b"SOMETHINGELSE").unwrap();

        let result = store.deflate_and_persist(&long_name);
        assert!(matches!(
            result,
            Err(LongNameError::SidecarConflict { .. })
        ));
    }

    #[test]
    fn test_inflate_missing_sidecar() {
        let tmp = TempDir::new().unwrap();
        let store = LongNameStore::new(tmp.path().to_path_buf());

        let result = store.inflate(&deflate("NEVERSTORED"));
        assert!(matches!(result, Err(LongNameError::MissingSidecar { .. })));
    }

    #[test]
    fn test_remove_is_tolerant_of_absence() {
        let tmp = TempDir::new().unwrap();
        let store = LongNameStore::new(tmp.path().to_path_buf());

        let long_name = "R".repeat(230);
        let deflated = store.deflate_and_persist(&long_name).unwrap();

        store.remove(&deflated).unwrap();
        assert!(!store.sidecar_path(&deflated).exists());
        // Second removal is a no-op
        store.remove(&deflated).unwrap();
    }
}
