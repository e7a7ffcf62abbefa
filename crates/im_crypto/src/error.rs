use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch)")]
    AeadDecrypt,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Ratchet counter {requested} is behind the current position {current}")]
    RatchetTooOld { current: u64, requested: u64 },

    #[error("Ratchet would skip {turns} steps (limit {limit})")]
    RatchetSkipTooLarge { turns: u64, limit: u64 },

    #[error("No {0} ratchet available in this session")]
    MissingRatchet(&'static str),

    #[error("Session is in state {0} and cannot perform this step")]
    InvalidSessionState(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
