//! Processed-nonce set.
//!
//! Keys are the 32-byte keyed digests produced by
//! [`im_crypto::hash::hashed_nonce`]. The set only grows.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::SqlitePool;

use crate::error::StoreError;

pub type NonceHash = [u8; 32];

#[async_trait]
pub trait NonceStore: Send + Sync {
    async fn contains(&self, hash: &NonceHash) -> Result<bool, StoreError>;

    /// Record `hash`. Returns `false` if it was already present.
    async fn insert(&self, hash: &NonceHash) -> Result<bool, StoreError>;

    async fn len(&self) -> Result<u64, StoreError>;
}

#[derive(Default)]
pub struct MemoryNonceStore {
    seen: Mutex<HashSet<NonceHash>>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn contains(&self, hash: &NonceHash) -> Result<bool, StoreError> {
        Ok(self.seen.lock().contains(hash))
    }

    async fn insert(&self, hash: &NonceHash) -> Result<bool, StoreError> {
        Ok(self.seen.lock().insert(*hash))
    }

    async fn len(&self) -> Result<u64, StoreError> {
        Ok(self.seen.lock().len() as u64)
    }
}

#[derive(Clone)]
pub struct SqliteNonceStore {
    pool: SqlitePool,
}

impl SqliteNonceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NonceStore for SqliteNonceStore {
    async fn contains(&self, hash: &NonceHash) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM processed_nonces WHERE nonce_hash = ?")
            .bind(hex::encode(hash))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert(&self, hash: &NonceHash) -> Result<bool, StoreError> {
        let result = sqlx::query("INSERT OR IGNORE INTO processed_nonces (nonce_hash, processed_at) VALUES (?, ?)")
            .bind(hex::encode(hash))
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn len(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_nonces")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::Store, vault::Vault};

    async fn exercise(store: &dyn NonceStore) {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert!(!store.contains(&a).await.unwrap());
        assert!(store.insert(&a).await.unwrap());
        assert!(!store.insert(&a).await.unwrap());
        assert!(store.contains(&a).await.unwrap());
        assert!(!store.contains(&b).await.unwrap());
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_store_semantics() {
        exercise(&MemoryNonceStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_semantics() {
        let store = Store::open_in_memory(Vault::new()).await.unwrap();
        exercise(&SqliteNonceStore::new(store.pool.clone())).await;
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonces.db");
        {
            let store = Store::open(&path, Vault::new()).await.unwrap();
            SqliteNonceStore::new(store.pool.clone()).insert(&[9u8; 32]).await.unwrap();
            store.pool.close().await;
        }
        let store = Store::open(&path, Vault::new()).await.unwrap();
        assert!(SqliteNonceStore::new(store.pool).contains(&[9u8; 32]).await.unwrap());
    }
}
