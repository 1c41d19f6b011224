//! Vault configuration.
//!
//! The recognized options are a closed set: passphrase, pepper, masterkey
//! filename, readonly, and migration. Building from a string map (the shape
//! URI-style callers hand over) rejects any other key.

use std::collections::HashMap;

use thiserror::Error;
use zeroize::Zeroizing;

/// Default name of the masterkey file inside the vault root.
pub const DEFAULT_MASTERKEY_FILENAME: &str = "masterkey.cryptomator";

/// Errors from option construction.
#[derive(Error, Debug)]
pub enum VaultOptionsError {
    /// A key outside the recognized set was passed.
    #[error("Unrecognized vault option '{key}'")]
    UnrecognizedOption { key: String },

    /// The required passphrase is missing.
    #[error("Missing required vault option 'passphrase'")]
    MissingPassphrase,

    /// A boolean option held a value other than "true"/"false".
    #[error("Invalid value '{value}' for vault option '{key}'")]
    InvalidValue { key: String, value: String },
}

/// Configuration for opening (or initializing) a vault.
#[derive(Debug, Clone)]
pub struct VaultOptions {
    passphrase: Zeroizing<String>,
    pepper: Vec<u8>,
    masterkey_filename: String,
    readonly: bool,
    migration: bool,
}

impl VaultOptions {
    /// Options with the given passphrase and all defaults.
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
            pepper: Vec::new(),
            masterkey_filename: DEFAULT_MASTERKEY_FILENAME.to_string(),
            readonly: false,
            migration: false,
        }
    }

    /// Additional secret bytes mixed into key derivation.
    #[must_use]
    pub fn with_pepper(mut self, pepper: impl Into<Vec<u8>>) -> Self {
        self.pepper = pepper.into();
        self
    }

    /// Use a non-default masterkey filename.
    #[must_use]
    pub fn with_masterkey_filename(mut self, filename: impl Into<String>) -> Self {
        self.masterkey_filename = filename.into();
        self
    }

    /// Open the vault read-only; every mutating operation is rejected.
    #[must_use]
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Accept vaults that would need migration.
    ///
    /// Recognized for interface completeness; migration machinery is not
    /// part of this crate, so outdated vaults still fail to open.
    #[must_use]
    pub fn migration(mut self, migration: bool) -> Self {
        self.migration = migration;
        self
    }

    /// Build options from a string map, rejecting unrecognized keys.
    pub fn from_properties(
        properties: &HashMap<String, String>,
    ) -> Result<Self, VaultOptionsError> {
        let mut options: Option<VaultOptions> = properties
            .get("passphrase")
            .map(|p| VaultOptions::new(p.clone()));

        for (key, value) in properties {
            match key.as_str() {
                "passphrase" => {}
                "pepper" => {
                    if let Some(ref mut opts) = options {
                        opts.pepper = value.clone().into_bytes();
                    }
                }
                "masterkeyFilename" => {
                    if let Some(ref mut opts) = options {
                        opts.masterkey_filename = value.clone();
                    }
                }
                "readonly" => {
                    let parsed = parse_bool(key, value)?;
                    if let Some(ref mut opts) = options {
                        opts.readonly = parsed;
                    }
                }
                "migration" => {
                    let parsed = parse_bool(key, value)?;
                    if let Some(ref mut opts) = options {
                        opts.migration = parsed;
                    }
                }
                other => {
                    return Err(VaultOptionsError::UnrecognizedOption {
                        key: other.to_string(),
                    })
                }
            }
        }

        options.ok_or(VaultOptionsError::MissingPassphrase)
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    pub fn pepper(&self) -> &[u8] {
        &self.pepper
    }

    pub fn masterkey_filename(&self) -> &str {
        &self.masterkey_filename
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_migration_enabled(&self) -> bool {
        self.migration
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, VaultOptionsError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(VaultOptionsError::InvalidValue {
            key: key.to_string(),
            value: other.to_string(),
        }),
    }
}
