//! Hash utilities
//!
//! - Keyed nonce hashing: the nonce store only ever sees
//!   `HMAC-SHA256(key = own identity, nonce)`, never a raw nonce.
//! - Plain SHA-256 for log chaining.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Hash a message nonce under the receiving identity.
pub fn hashed_nonce(own_identity: &str, nonce: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = HmacSha256::new_from_slice(own_identity.as_bytes())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac.update(nonce);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashed_nonce_is_identity_scoped() {
        let nonce = [0xAAu8; 24];
        let a = hashed_nonce("ECHOECHO", &nonce).unwrap();
        let b = hashed_nonce("ECHOECHO", &nonce).unwrap();
        let c = hashed_nonce("ABCDEFGH", &nonce).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
