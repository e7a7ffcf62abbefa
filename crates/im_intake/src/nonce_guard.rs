//! Replay protection: has this nonce completed the pipeline before?

use std::sync::Arc;

use im_crypto::hash::hashed_nonce;
use im_proto::Identity;
use im_store::{NonceStore, StoreError};
use tracing::trace;

pub struct NonceGuard {
    own_identity: Identity,
    store: Arc<dyn NonceStore>,
}

impl NonceGuard {
    pub fn new(own_identity: Identity, store: Arc<dyn NonceStore>) -> Self {
        Self { own_identity, store }
    }

    fn key(&self, nonce: &[u8]) -> Result<[u8; 32], StoreError> {
        Ok(hashed_nonce(self.own_identity.as_str(), nonce)?)
    }

    pub async fn is_processed(&self, nonce: &[u8]) -> Result<bool, StoreError> {
        self.store.contains(&self.key(nonce)?).await
    }

    /// Idempotent.
    pub async fn mark_processed(&self, nonce: &[u8]) -> Result<(), StoreError> {
        let fresh = self.store.insert(&self.key(nonce)?).await?;
        trace!(fresh, "nonce marked processed");
        Ok(())
    }
}
