//! Vault: the at-rest key for forward-security session state.
//!
//! The 32-byte key lives in memory only while the vault is unlocked. Locking
//! zeroizes it; every session read or write fails with
//! [`StoreError::VaultLocked`] until it is unlocked again.

use std::sync::Arc;

use tokio::sync::RwLock;
use zeroize::ZeroizeOnDrop;

use crate::error::StoreError;
use im_crypto::kdf::{generate_key, generate_salt, vault_key_from_password};

#[derive(ZeroizeOnDrop)]
struct VaultKeyMaterial {
    key: [u8; 32],
}

/// Shared vault handle. Clones refer to the same key slot.
#[derive(Clone, Default)]
pub struct Vault {
    inner: Arc<RwLock<Option<VaultKeyMaterial>>>,
}

impl Vault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unlock with an operator password and the salt stored beside the database.
    pub async fn unlock(&self, password: &[u8], salt: &[u8; 16]) -> Result<(), StoreError> {
        let vault_key = vault_key_from_password(password, salt)?;
        *self.inner.write().await = Some(VaultKeyMaterial { key: vault_key.0 });
        Ok(())
    }

    /// Unlock with raw key material, e.g. from a key file.
    pub async fn unlock_with_key(&self, key: [u8; 32]) {
        *self.inner.write().await = Some(VaultKeyMaterial { key });
    }

    /// A vault unlocked with a throwaway key, for in-memory deployments.
    pub async fn unlocked_random() -> Self {
        let vault = Self::new();
        vault.unlock_with_key(generate_key()).await;
        vault
    }

    pub async fn lock(&self) {
        *self.inner.write().await = None;
    }

    pub async fn is_locked(&self) -> bool {
        self.inner.read().await.is_none()
    }

    /// Run `f` with the key. Fails when locked.
    pub async fn with_key<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&[u8; 32]) -> Result<R, StoreError>,
    {
        match self.inner.read().await.as_ref() {
            Some(material) => f(&material.key),
            None => Err(StoreError::VaultLocked),
        }
    }
}

/// Fresh salt for a new database. Not secret.
pub fn new_vault_salt() -> [u8; 16] {
    generate_salt()
}
