//! The crypto box: authenticated public-key encryption between two identities.
//!
//! box_key = HKDF-SHA256(X25519(own_secret, peer_public), salt = "im-box-v1")
//! ciphertext = XChaCha20-Poly1305(box_key, nonce, plaintext)
//!
//! The nonce travels next to the ciphertext in the boxed wire message, so
//! the box itself never generates or prepends one.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::{aead, error::CryptoError, kdf};

const BOX_SALT: &[u8] = b"im-box-v1";

/// Public-key box capability consumed by the decoder and the FS processor.
pub trait CryptoBox: Send + Sync {
    /// Our long-term X25519 public key.
    fn public_key(&self) -> [u8; 32];

    /// Raw X25519 agreement with a peer key (static-static or static-ephemeral).
    fn shared_secret(&self, peer_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError>;

    /// Decrypt a box sent to us by `peer_public`.
    fn open(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; aead::NONCE_LEN],
        peer_public: &[u8; 32],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let key = self.box_key(peer_public)?;
        aead::open(&key, nonce, ciphertext, b"")
    }

    /// Encrypt a box for `peer_public`.
    fn seal(
        &self,
        plaintext: &[u8],
        nonce: &[u8; aead::NONCE_LEN],
        peer_public: &[u8; 32],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.box_key(peer_public)?;
        aead::seal(&key, nonce, plaintext, b"")
    }

    fn box_key(&self, peer_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = self.shared_secret(peer_public)?;
        Ok(Zeroizing::new(kdf::derive_key(&shared[..], BOX_SALT, b"box")?))
    }
}

/// `CryptoBox` backed by an in-memory X25519 secret.
pub struct X25519Box {
    secret: StaticSecret,
    public: X25519Public,
}

impl X25519Box {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }
}

impl CryptoBox for X25519Box {
    fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    fn shared_secret(&self, peer_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let shared = self.secret.diffie_hellman(&X25519Public::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey("low-order peer public key".into()));
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_roundtrip_between_two_parties() {
        let alice = X25519Box::generate();
        let bob = X25519Box::generate();
        let nonce = [3u8; 24];

        let ct = alice.seal(b"ping", &nonce, &bob.public_key()).unwrap();
        let pt = bob.open(&ct, &nonce, &alice.public_key()).unwrap();
        assert_eq!(pt.as_slice(), b"ping");
    }

    #[test]
    fn wrong_sender_key_fails() {
        let alice = X25519Box::generate();
        let bob = X25519Box::generate();
        let mallory = X25519Box::generate();
        let nonce = [3u8; 24];

        let ct = alice.seal(b"ping", &nonce, &bob.public_key()).unwrap();
        assert!(bob.open(&ct, &nonce, &mallory.public_key()).is_err());
    }

    #[test]
    fn low_order_point_rejected() {
        let bob = X25519Box::generate();
        assert!(bob.shared_secret(&[0u8; 32]).is_err());
    }
}
