//! Symmetric KDF ratchet.
//!
//! Each ratchet holds a chain key and the counter of the next message it
//! can produce a key for:
//!
//!   (CK[n+1], MK[n]) = chain_step(CK[n])
//!
//! Turning the ratchet deletes CK[n]; a key for a counter behind the
//! current position can never be recovered. Receivers fast-forward to the
//! counter carried by a frame, bounded by a skip limit so a forged counter
//! cannot make us spin through billions of HMACs.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{error::CryptoError, kdf};

/// Default bound on how far a single frame may advance a ratchet.
pub const DEFAULT_MAX_SKIP: u64 = 25_000;

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KdfRatchet {
    #[zeroize(skip)]
    counter: u64,
    chain_key: [u8; 32],
}

impl std::fmt::Debug for KdfRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KdfRatchet")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

impl KdfRatchet {
    pub fn new(counter: u64, chain_key: [u8; 32]) -> Self {
        Self { counter, chain_key }
    }

    /// Counter of the next key this ratchet will hand out.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Key for the current counter. Does not advance.
    pub fn current_key(&self) -> Result<[u8; 32], CryptoError> {
        let (_, mk) = kdf::chain_step(&self.chain_key)?;
        Ok(mk)
    }

    /// Advance by one step, discarding the current chain key.
    pub fn turn(&mut self) -> Result<(), CryptoError> {
        let (next, _) = kdf::chain_step(&self.chain_key)?;
        self.chain_key.zeroize();
        self.chain_key = next;
        self.counter += 1;
        Ok(())
    }

    /// Advance until `target` is the current counter.
    ///
    /// Returns the number of turns taken. Fails without mutating when
    /// `target` is behind us or further ahead than `max_skip`.
    pub fn turn_until(&mut self, target: u64, max_skip: u64) -> Result<u64, CryptoError> {
        if target < self.counter {
            return Err(CryptoError::RatchetTooOld {
                current: self.counter,
                requested: target,
            });
        }
        let turns = target - self.counter;
        if turns > max_skip {
            return Err(CryptoError::RatchetSkipTooLarge {
                turns,
                limit: max_skip,
            });
        }
        for _ in 0..turns {
            self.turn()?;
        }
        Ok(turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_and_receiver_agree() {
        let mut tx = KdfRatchet::new(1, [5u8; 32]);
        let mut rx = KdfRatchet::new(1, [5u8; 32]);

        for _ in 0..3 {
            let k = tx.current_key().unwrap();
            tx.turn().unwrap();
            assert_eq!(k, rx.current_key().unwrap());
            rx.turn().unwrap();
        }
        assert_eq!(tx.counter(), 4);
    }

    #[test]
    fn fast_forward_matches_stepwise() {
        let mut a = KdfRatchet::new(1, [1u8; 32]);
        let mut b = a.clone();
        for _ in 0..10 {
            a.turn().unwrap();
        }
        assert_eq!(b.turn_until(11, DEFAULT_MAX_SKIP).unwrap(), 10);
        assert_eq!(a.current_key().unwrap(), b.current_key().unwrap());
    }

    #[test]
    fn going_backwards_is_rejected() {
        let mut r = KdfRatchet::new(5, [1u8; 32]);
        let err = r.turn_until(4, DEFAULT_MAX_SKIP).unwrap_err();
        assert!(matches!(err, CryptoError::RatchetTooOld { current: 5, requested: 4 }));
        assert_eq!(r.counter(), 5);
    }

    #[test]
    fn excessive_skip_is_rejected_without_mutation() {
        let mut r = KdfRatchet::new(1, [1u8; 32]);
        assert!(matches!(
            r.turn_until(100, 10),
            Err(CryptoError::RatchetSkipTooLarge { turns: 99, limit: 10 })
        ));
        assert_eq!(r.counter(), 1);
    }
}
