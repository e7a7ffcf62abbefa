//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes.  Tag: 16 bytes.
//!
//! Two wire shapes are supported:
//!   - explicit nonce (`seal` / `open`): the caller transports the nonce
//!     separately, as the boxed wire message does;
//!   - prepended nonce (`encrypt` / `decrypt`): `[ nonce (24) | ciphertext + tag ]`,
//!     used for FS frames and for vault-encrypted columns.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Encrypt with a caller-supplied 24-byte nonce.
pub fn seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)
}

/// Decrypt with a caller-supplied 24-byte nonce.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

/// Encrypt `plaintext`, prepending a random 24-byte nonce.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let mut nonce_arr = [0u8; NONCE_LEN];
    nonce_arr.copy_from_slice(&nonce);
    let ciphertext = seal(key, &nonce_arr, plaintext, aad)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_arr);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);
    open(key, &nonce, ct, aad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepended_nonce_roundtrip() {
        let key = [7u8; 32];
        let ct = encrypt(&key, b"hello", b"aad").unwrap();
        assert_eq!(ct.len(), NONCE_LEN + 5 + TAG_LEN);
        let pt = decrypt(&key, &ct, b"aad").unwrap();
        assert_eq!(pt.as_slice(), b"hello");
    }

    #[test]
    fn wrong_aad_fails() {
        let key = [7u8; 32];
        let ct = encrypt(&key, b"hello", b"aad").unwrap();
        assert!(matches!(decrypt(&key, &ct, b"other"), Err(CryptoError::AeadDecrypt)));
    }

    #[test]
    fn truncated_input_fails() {
        let key = [1u8; 32];
        assert!(decrypt(&key, &[0u8; 10], b"").is_err());
        assert!(open(&key, &[0u8; NONCE_LEN], &[0u8; 3], b"").is_err());
    }
}
