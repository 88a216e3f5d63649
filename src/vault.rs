//! Local storage for the long-lived refresh credential.
//!
//! Implementations never log, print, or put the secret into an error message.

use std::sync::{Arc, Mutex};

use keyring::Entry;
use thiserror::Error;

use crate::{config::VaultConfig, secret::Secret};

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("cannot read from credential store: {0}")]
    Read(String),

    #[error("cannot write to credential store: {0}")]
    Write(String),

    #[error("cannot delete from credential store: {0}")]
    Delete(String),
}

/// A single-slot secret store scoped to one `(service, account)` pair.
pub trait CredentialVault: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    fn get(&self) -> Result<Option<Secret>, VaultError>;

    /// Overwrites any existing value.
    fn set(&self, secret: &Secret) -> Result<(), VaultError>;

    /// Succeeds when the slot is already empty.
    fn delete(&self) -> Result<(), VaultError>;

    fn exists(&self) -> Result<bool, VaultError> {
        Ok(self.get()?.is_some())
    }
}

/// The OS keychain via `keyring`: macOS Keychain, Windows Credential Manager,
/// Linux Secret Service (with the kernel keyring as a cache in front of it).
#[derive(Debug, Clone)]
pub struct KeyringVault {
    service: String,
    account: String,
}

impl KeyringVault {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    pub fn from_config(config: &VaultConfig) -> Self {
        Self::new(&config.service, &config.account)
    }

    fn entry(&self) -> Result<Entry, VaultError> {
        Entry::new(&self.service, &self.account)
            .map_err(|e| VaultError::Read(format!("cannot open keyring entry: {e}")))
    }
}

impl CredentialVault for KeyringVault {
    fn get(&self) -> Result<Option<Secret>, VaultError> {
        match self.entry()?.get_password() {
            Ok(password) => Ok(Some(Secret::new(password))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(keyring::Error::Ambiguous(_)) => {
                Err(VaultError::Read("ambiguous keychain entry".into()))
            }
            Err(e) => Err(VaultError::Read(e.to_string())),
        }
    }

    fn set(&self, secret: &Secret) -> Result<(), VaultError> {
        self.entry()?
            .set_password(secret.expose())
            .map_err(|e| VaultError::Write(e.to_string()))
    }

    fn delete(&self) -> Result<(), VaultError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(VaultError::Delete(e.to_string())),
        }
    }
}

/// Process-local vault for tests and headless embedding. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryVault {
    slot: Arc<Mutex<Option<Secret>>>,
    writes: Arc<Mutex<usize>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(secret: impl Into<Secret>) -> Self {
        let vault = Self::new();
        if let Ok(mut slot) = vault.slot.lock() {
            *slot = Some(secret.into());
        }
        vault
    }

    /// Number of successful `set` calls, for asserting "nothing was stored".
    pub fn write_count(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }
}

impl CredentialVault for MemoryVault {
    fn get(&self) -> Result<Option<Secret>, VaultError> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| VaultError::Read("vault lock poisoned".into()))?;
        Ok(slot.clone())
    }

    fn set(&self, secret: &Secret) -> Result<(), VaultError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| VaultError::Write("vault lock poisoned".into()))?;
        *slot = Some(secret.clone());
        if let Ok(mut writes) = self.writes.lock() {
            *writes += 1;
        }
        Ok(())
    }

    fn delete(&self) -> Result<(), VaultError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| VaultError::Delete("vault lock poisoned".into()))?;
        *slot = None;
        Ok(())
    }
}
