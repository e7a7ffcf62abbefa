//! im_store — persistent state of the intake pipeline.
//!
//! # Encryption strategy
//! SQLite does not encrypt. Forward-security session state (ratchet chain
//! keys, ephemeral secrets) is serialized to JSON and stored as
//! XChaCha20-Poly1305 ciphertext under the vault key. Nonces are stored as
//! HMAC digests, never raw. Identities and timestamps stay in plaintext so
//! lookups remain plain indexed queries.
//!
//! # Migration
//! SQLx migrations in `migrations/` run on open.

pub mod db;
pub mod error;
pub mod models;
pub mod nonce_store;
pub mod session_store;
pub mod validation_log;
pub mod vault;

pub use db::Store;
pub use error::StoreError;
pub use nonce_store::{MemoryNonceStore, NonceStore, SqliteNonceStore};
pub use session_store::{MemorySessionStore, SessionStore, SqliteSessionStore};
pub use validation_log::{Rejection, ValidationLog, ValidationRecord};
pub use vault::Vault;
