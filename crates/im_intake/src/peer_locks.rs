//! One async mutex per peer identity.
//!
//! Messages from the same peer run their nonce check, forward-security
//! transition and dispatch strictly one after another; different peers
//! proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use im_proto::Identity;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Entries beyond this count get pruned when idle.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct PeerLocks {
    locks: Mutex<HashMap<Identity, Arc<AsyncMutex<()>>>>,
}

pub struct PeerGuard {
    _guard: OwnedMutexGuard<()>,
}

impl PeerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, peer: &Identity) -> PeerGuard {
        let mutex = {
            let mut locks = self.locks.lock();
            if locks.len() > PRUNE_THRESHOLD {
                locks.retain(|_, m| Arc::strong_count(m) > 1);
            }
            locks.entry(*peer).or_default().clone()
        };
        PeerGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
