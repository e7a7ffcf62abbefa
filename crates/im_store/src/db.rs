//! Database handle over SQLite via sqlx.

use std::path::Path;
use std::str::FromStr;

use base64::Engine as _;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::{error::StoreError, vault::Vault};

const VALUE_AAD: &[u8] = b"im-store-v1";

/// Central store handle. Cheap to clone (the pool and vault are shared).
#[derive(Clone)]
pub struct Store {
    pub pool: SqlitePool,
    pub vault: Vault,
}

impl Store {
    /// Open (or create) the database at `db_path` and run pending migrations.
    ///
    /// WAL mode is set on the connection options; SQLite refuses to change
    /// `journal_mode` inside the transaction sqlx wraps each migration in.
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool, vault })
    }

    /// Private in-memory database. A single connection, since every
    /// connection to `:memory:` gets its own database.
    pub async fn open_in_memory(vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool, vault })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))
    }

    /// Encrypt a value with the vault key; base64 for the TEXT column.
    pub async fn encrypt_value(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        self.vault
            .with_key(|key| {
                let ct = im_crypto::aead::encrypt(key, plaintext, VALUE_AAD)?;
                Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(ct))
            })
            .await
    }

    pub async fn decrypt_value(&self, b64: &str) -> Result<Vec<u8>, StoreError> {
        let ct = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(b64)?;
        self.vault
            .with_key(|key| Ok(im_crypto::aead::decrypt(key, &ct, VALUE_AAD)?.to_vec()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn value_encryption_needs_unlocked_vault() {
        let store = Store::open_in_memory(Vault::unlocked_random().await).await.unwrap();
        let enc = store.encrypt_value(b"chain key").await.unwrap();
        assert_eq!(store.decrypt_value(&enc).await.unwrap(), b"chain key");

        store.vault.lock().await;
        assert!(matches!(
            store.decrypt_value(&enc).await,
            Err(StoreError::VaultLocked)
        ));
    }

    #[tokio::test]
    async fn opens_file_database_with_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intake.db");
        let store = Store::open(&path, Vault::unlocked_random().await).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM fs_sessions")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(path.exists());
    }
}
