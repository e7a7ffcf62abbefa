//! Forward-security session storage.
//!
//! Sessions are keyed by (own identity, peer identity, session id). A peer
//! may have several sessions on record (a fresh `Init` races with an older
//! one); the most recently written one is the "best" session used for
//! outgoing frames.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use im_crypto::dh_session::SESSION_ID_LEN;
use im_crypto::DhSession;
use parking_lot::Mutex;
use tracing::debug;

use crate::{db::Store, error::StoreError, models::SessionRow};

pub type SessionId = [u8; SESSION_ID_LEN];

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn best_session(&self, my_identity: &str, peer_identity: &str) -> Result<Option<DhSession>, StoreError>;

    async fn session(
        &self,
        my_identity: &str,
        peer_identity: &str,
        session_id: &SessionId,
    ) -> Result<Option<DhSession>, StoreError>;

    /// Insert or replace.
    async fn store_session(&self, session: &DhSession) -> Result<(), StoreError>;

    /// Returns whether a session was removed.
    async fn delete_session(
        &self,
        my_identity: &str,
        peer_identity: &str,
        session_id: &SessionId,
    ) -> Result<bool, StoreError>;

    /// Remove every session with `peer_identity`. Returns the count.
    async fn delete_all(&self, my_identity: &str, peer_identity: &str) -> Result<u64, StoreError>;
}

type MemoryKey = (String, String, SessionId);

#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    write_seq: u64,
    sessions: HashMap<MemoryKey, (u64, DhSession)>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn best_session(&self, my_identity: &str, peer_identity: &str) -> Result<Option<DhSession>, StoreError> {
        let state = self.inner.lock();
        Ok(state
            .sessions
            .iter()
            .filter(|((my, peer, _), _)| my == my_identity && peer == peer_identity)
            .max_by_key(|(_, (seq, _))| *seq)
            .map(|(_, (_, s))| s.clone()))
    }

    async fn session(
        &self,
        my_identity: &str,
        peer_identity: &str,
        session_id: &SessionId,
    ) -> Result<Option<DhSession>, StoreError> {
        let key = (my_identity.to_string(), peer_identity.to_string(), *session_id);
        Ok(self.inner.lock().sessions.get(&key).map(|(_, s)| s.clone()))
    }

    async fn store_session(&self, session: &DhSession) -> Result<(), StoreError> {
        let mut state = self.inner.lock();
        state.write_seq += 1;
        let seq = state.write_seq;
        let key = (
            session.my_identity.clone(),
            session.peer_identity.clone(),
            *session.id(),
        );
        state.sessions.insert(key, (seq, session.clone()));
        Ok(())
    }

    async fn delete_session(
        &self,
        my_identity: &str,
        peer_identity: &str,
        session_id: &SessionId,
    ) -> Result<bool, StoreError> {
        let key = (my_identity.to_string(), peer_identity.to_string(), *session_id);
        Ok(self.inner.lock().sessions.remove(&key).is_some())
    }

    async fn delete_all(&self, my_identity: &str, peer_identity: &str) -> Result<u64, StoreError> {
        let mut state = self.inner.lock();
        let before = state.sessions.len();
        state
            .sessions
            .retain(|(my, peer, _), _| !(my == my_identity && peer == peer_identity));
        Ok((before - state.sessions.len()) as u64)
    }
}

/// SQLite-backed store; session state is vault-encrypted.
#[derive(Clone)]
pub struct SqliteSessionStore {
    store: Store,
}

impl SqliteSessionStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    async fn decode_row(&self, row: SessionRow) -> Result<DhSession, StoreError> {
        let plaintext = zeroize::Zeroizing::new(self.store.decrypt_value(&row.state_enc).await?);
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn best_session(&self, my_identity: &str, peer_identity: &str) -> Result<Option<DhSession>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT * FROM fs_sessions WHERE my_identity = ? AND peer_identity = ?
             ORDER BY updated_at DESC, rowid DESC LIMIT 1",
        )
        .bind(my_identity)
        .bind(peer_identity)
        .fetch_optional(&self.store.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.decode_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn session(
        &self,
        my_identity: &str,
        peer_identity: &str,
        session_id: &SessionId,
    ) -> Result<Option<DhSession>, StoreError> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT * FROM fs_sessions WHERE my_identity = ? AND peer_identity = ? AND session_id = ?",
        )
        .bind(my_identity)
        .bind(peer_identity)
        .bind(hex::encode(session_id))
        .fetch_optional(&self.store.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.decode_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn store_session(&self, session: &DhSession) -> Result<(), StoreError> {
        let json = zeroize::Zeroizing::new(serde_json::to_vec(session)?);
        let state_enc = self.store.encrypt_value(&json).await?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO fs_sessions
                (session_id, my_identity, peer_identity, fs_state, state_enc, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (my_identity, peer_identity, session_id)
             DO UPDATE SET fs_state = excluded.fs_state,
                           state_enc = excluded.state_enc,
                           updated_at = excluded.updated_at",
        )
        .bind(session.id_hex())
        .bind(&session.my_identity)
        .bind(&session.peer_identity)
        .bind(session.state().to_string())
        .bind(state_enc)
        .bind(session.created_at)
        .bind(now)
        .execute(&self.store.pool)
        .await?;
        debug!(peer = %session.peer_identity, session = %session.id_hex(), state = %session.state(), "stored fs session");
        Ok(())
    }

    async fn delete_session(
        &self,
        my_identity: &str,
        peer_identity: &str,
        session_id: &SessionId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM fs_sessions WHERE my_identity = ? AND peer_identity = ? AND session_id = ?",
        )
        .bind(my_identity)
        .bind(peer_identity)
        .bind(hex::encode(session_id))
        .execute(&self.store.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_all(&self, my_identity: &str, peer_identity: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM fs_sessions WHERE my_identity = ? AND peer_identity = ?")
            .bind(my_identity)
            .bind(peer_identity)
            .execute(&self.store.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::Vault;
    use im_crypto::{boxing::X25519Box, CryptoBox, FsVersion};

    fn new_session(peer: &str) -> DhSession {
        let me = X25519Box::generate();
        let them = X25519Box::generate();
        DhSession::initiate("MYSELF01", peer, &them.public_key(), &me, FsVersion::V1_2)
            .unwrap()
            .0
    }

    async fn exercise(store: &dyn SessionStore) {
        assert!(store.best_session("MYSELF01", "PEERPEER").await.unwrap().is_none());

        let first = new_session("PEERPEER");
        let second = new_session("PEERPEER");
        let other = new_session("OTHERPER");
        store.store_session(&first).await.unwrap();
        store.store_session(&other).await.unwrap();
        store.store_session(&second).await.unwrap();

        let best = store.best_session("MYSELF01", "PEERPEER").await.unwrap().unwrap();
        assert_eq!(best.id(), second.id());

        let loaded = store.session("MYSELF01", "PEERPEER", first.id()).await.unwrap().unwrap();
        assert_eq!(loaded.id(), first.id());
        assert_eq!(loaded.state(), first.state());

        assert!(store.delete_session("MYSELF01", "PEERPEER", second.id()).await.unwrap());
        assert!(!store.delete_session("MYSELF01", "PEERPEER", second.id()).await.unwrap());
        assert_eq!(store.delete_all("MYSELF01", "PEERPEER").await.unwrap(), 1);
        assert!(store.best_session("MYSELF01", "OTHERPER").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_store_semantics() {
        exercise(&MemorySessionStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_semantics() {
        let store = Store::open_in_memory(Vault::unlocked_random().await).await.unwrap();
        exercise(&SqliteSessionStore::new(store)).await;
    }

    #[tokio::test]
    async fn session_state_is_not_stored_in_clear() {
        let store = Store::open_in_memory(Vault::unlocked_random().await).await.unwrap();
        let sessions = SqliteSessionStore::new(store.clone());
        let s = new_session("PEERPEER");
        sessions.store_session(&s).await.unwrap();

        let (enc,): (String,) = sqlx::query_as("SELECT state_enc FROM fs_sessions")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert!(!enc.contains("chain_key"));

        store.vault.lock().await;
        assert!(matches!(
            sessions.best_session("MYSELF01", "PEERPEER").await,
            Err(StoreError::VaultLocked)
        ));
    }
}
