use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Vault is locked, unlock before touching session state")]
    VaultLocked,

    #[error("Crypto error: {0}")]
    Crypto(#[from] im_crypto::CryptoError),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Stored value is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Validation log chain broken at seq {seq}")]
    ChainBroken { seq: u64 },
}
