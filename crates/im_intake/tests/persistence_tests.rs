//! The pipeline on SQLite-backed nonce and session stores, across a restart.

mod common;

use std::sync::Arc;

use common::Harness;
use im_crypto::{FsState, X25519Box};
use im_intake::{DropReason, Outcome, ProcessorSettings};
use im_store::vault::new_vault_salt;
use im_store::{SqliteNonceStore, SqliteSessionStore, Store, StoreError, Vault};

const PASSWORD: &[u8] = b"operator passphrase";

async fn harness_on(db: &std::path::Path, salt: &[u8; 16], crypto: Arc<X25519Box>) -> Harness {
    let vault = Vault::new();
    vault.unlock(PASSWORD, salt).await.unwrap();
    let store = Store::open(db, vault).await.unwrap();
    Harness::assemble(
        ProcessorSettings::default(),
        crypto,
        Arc::new(SqliteNonceStore::new(store.pool.clone())),
        Arc::new(SqliteSessionStore::new(store)),
        None,
    )
}

#[tokio::test]
async fn test_nonces_and_sessions_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("intake.db");
    let salt = new_vault_salt();
    let crypto = Arc::new(X25519Box::generate());

    let first = harness_on(&db, &salt, crypto.clone()).await;
    let peer = first.peer("ECHOECHO");
    let text = peer.boxed_text("before restart");
    assert!(first.processor.process(&text).await.unwrap().processed().is_some());
    first.processor.process(&peer.init_session().await).await.unwrap();
    drop(first);

    let second = harness_on(&db, &salt, crypto).await;
    second.register(&peer);

    assert_eq!(
        second.processor.process(&text).await.unwrap(),
        Outcome::Dropped(DropReason::AlreadyProcessed)
    );

    let encapsulated = peer.encapsulate(&peer.text("after restart")).await;
    let outcome = second.processor.process(&encapsulated).await.unwrap();
    assert!(outcome.processed().is_some());
    assert_eq!(second.entities.stored(), vec!["after restart".to_string()]);

    let info = second
        .processor
        .forward_security()
        .session_info(&peer.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.state, FsState::L20);
}

#[tokio::test]
async fn test_wrong_password_cannot_read_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("intake.db");
    let salt = new_vault_salt();

    let first = harness_on(&db, &salt, Arc::new(X25519Box::generate())).await;
    let peer = first.peer("ECHOECHO");
    first.processor.process(&peer.init_session().await).await.unwrap();
    let me = first.me;
    drop(first);

    let vault = Vault::new();
    vault.unlock(b"not the passphrase", &salt).await.unwrap();
    let sessions = SqliteSessionStore::new(Store::open(&db, vault).await.unwrap());
    let err = im_store::SessionStore::best_session(&sessions, me.as_str(), peer.id.as_str())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Crypto(_)));
}
