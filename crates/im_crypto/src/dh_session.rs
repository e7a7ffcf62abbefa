//! Forward-secrecy DH session.
//!
//! A session binds (own identity, peer identity, peer public key) and holds
//! up to four KDF ratchets:
//!
//! ```text
//!   initiator                         responder
//!   ---------                         ---------
//!   Init(eph_i)  ───────────────────▶ 2DH chain (peer, i→r)
//!   my 2DH chain                      4DH chains (mine r→i, peer i→r)
//!                ◀─────────────────── Accept(eph_r)
//!   4DH chains (mine i→r, peer r→i)
//! ```
//!
//! 2DH = KDF(DH(I_s, R_s) || DH(I_e, R_s))
//! 4DH = KDF(DH(I_s, R_s) || DH(I_s, R_e) || DH(I_e, R_s) || DH(I_e, R_e))
//!
//! States:
//!   `L20` — 2DH negotiated. Initiator: waiting for Accept, can only send 2DH.
//!           Responder: both 4DH chains ready, peer may still send 2DH.
//!   `L40` — 4DH established in both directions; 2DH chains discarded.
//!   `Exhausted` — reported for a session that the frame just processed tore
//!           down (terminate / reject); such a session is never stored again.
//!   `NoSession` — nothing stored for the pair.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    aead,
    boxing::CryptoBox,
    error::CryptoError,
    kdf,
    ratchet::KdfRatchet,
};

pub const SESSION_ID_LEN: usize = 16;

const FS_SALT: &[u8] = b"im-fs-v1";
const LABEL_2DH_I2R: &[u8] = b"2dh-i2r";
const LABEL_4DH_I2R: &[u8] = b"4dh-i2r";
const LABEL_4DH_R2I: &[u8] = b"4dh-r2i";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsState {
    NoSession,
    L20,
    L40,
    Exhausted,
}

impl fmt::Display for FsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsState::NoSession => "NoSession",
            FsState::L20 => "L20",
            FsState::L40 => "L40",
            FsState::Exhausted => "Exhausted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// Which ratchet protected an encapsulated frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DhType {
    TwoDH = 1,
    FourDH = 2,
}

impl DhType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(DhType::TwoDH),
            2 => Some(DhType::FourDH),
            _ => None,
        }
    }
}

/// Protocol version, `major << 8 | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FsVersion(pub u16);

impl FsVersion {
    pub const V1_0: FsVersion = FsVersion(0x0100);
    pub const V1_1: FsVersion = FsVersion(0x0101);
    pub const V1_2: FsVersion = FsVersion(0x0102);
}

impl fmt::Display for FsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0 >> 8, self.0 & 0xff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub min: FsVersion,
    pub max: FsVersion,
}

impl VersionRange {
    pub fn contains(&self, v: FsVersion) -> bool {
        self.min <= v && v <= self.max
    }

    /// Highest version both sides support, if the ranges overlap.
    pub fn negotiate(&self, peer: &VersionRange) -> Option<FsVersion> {
        let lo = self.min.max(peer.min);
        let hi = self.max.min(peer.max);
        (lo <= hi).then_some(hi)
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self {
            min: FsVersion::V1_0,
            max: FsVersion::V1_2,
        }
    }
}

/// A random session id.
pub fn new_session_id() -> [u8; SESSION_ID_LEN] {
    let mut id = [0u8; SESSION_ID_LEN];
    OsRng.fill_bytes(&mut id);
    id
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DhSession {
    id: [u8; SESSION_ID_LEN],
    pub my_identity: String,
    pub peer_identity: String,
    peer_public_key: [u8; 32],
    role: SessionRole,
    state: FsState,
    version: FsVersion,
    my_ephemeral_secret: Option<[u8; 32]>,
    my_2dh: Option<KdfRatchet>,
    my_4dh: Option<KdfRatchet>,
    peer_2dh: Option<KdfRatchet>,
    peer_4dh: Option<KdfRatchet>,
    pub created_at: DateTime<Utc>,
}

impl Drop for DhSession {
    fn drop(&mut self) {
        if let Some(secret) = self.my_ephemeral_secret.as_mut() {
            secret.zeroize();
        }
    }
}

impl fmt::Debug for DhSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhSession")
            .field("id", &hex::encode(self.id))
            .field("peer", &self.peer_identity)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

fn ephemeral_dh(secret: &[u8; 32], public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let shared = StaticSecret::from(*secret).diffie_hellman(&X25519Public::from(*public));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("low-order ephemeral key".into()));
    }
    Ok(Zeroizing::new(shared.to_bytes()))
}

fn chain(ikm: &[u8], label: &[u8]) -> Result<KdfRatchet, CryptoError> {
    Ok(KdfRatchet::new(1, kdf::derive_key(ikm, FS_SALT, label)?))
}

fn concat(parts: &[&[u8; 32]]) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(Vec::with_capacity(parts.len() * 32));
    for p in parts {
        out.extend_from_slice(&p[..]);
    }
    out
}

impl DhSession {
    /// Start a new session towards `peer_public_key`.
    ///
    /// Returns the session (state `L20`, initiator) and the ephemeral public
    /// key to put into the `Init` frame.
    pub fn initiate(
        my_identity: &str,
        peer_identity: &str,
        peer_public_key: &[u8; 32],
        crypto: &dyn CryptoBox,
        version: FsVersion,
    ) -> Result<(Self, [u8; 32]), CryptoError> {
        let eph = StaticSecret::random_from_rng(OsRng);
        let eph_pub = X25519Public::from(&eph).to_bytes();
        let eph_bytes = eph.to_bytes();

        let ss = crypto.shared_secret(peer_public_key)?;
        let es = ephemeral_dh(&eph_bytes, peer_public_key)?;
        let my_2dh = chain(&concat(&[&*ss, &*es]), LABEL_2DH_I2R)?;

        let session = Self {
            id: new_session_id(),
            my_identity: my_identity.to_string(),
            peer_identity: peer_identity.to_string(),
            peer_public_key: *peer_public_key,
            role: SessionRole::Initiator,
            state: FsState::L20,
            version,
            my_ephemeral_secret: Some(eph_bytes),
            my_2dh: Some(my_2dh),
            my_4dh: None,
            peer_2dh: None,
            peer_4dh: None,
            created_at: Utc::now(),
        };
        Ok((session, eph_pub))
    }

    /// Accept a peer's `Init`.
    ///
    /// Returns the session (state `L20`, responder) and our ephemeral
    /// public key for the `Accept` frame.
    pub fn respond(
        id: [u8; SESSION_ID_LEN],
        my_identity: &str,
        peer_identity: &str,
        peer_public_key: &[u8; 32],
        peer_ephemeral: &[u8; 32],
        crypto: &dyn CryptoBox,
        version: FsVersion,
    ) -> Result<(Self, [u8; 32]), CryptoError> {
        let ss = crypto.shared_secret(peer_public_key)?;
        let se = crypto.shared_secret(peer_ephemeral)?;
        let peer_2dh = chain(&concat(&[&*ss, &*se]), LABEL_2DH_I2R)?;

        let eph = StaticSecret::random_from_rng(OsRng);
        let eph_pub = X25519Public::from(&eph).to_bytes();
        let mut eph_bytes = eph.to_bytes();
        let es = ephemeral_dh(&eph_bytes, peer_public_key)?;
        let ee = ephemeral_dh(&eph_bytes, peer_ephemeral)?;
        eph_bytes.zeroize();

        let ikm4 = concat(&[&*ss, &*es, &*se, &*ee]);
        let session = Self {
            id,
            my_identity: my_identity.to_string(),
            peer_identity: peer_identity.to_string(),
            peer_public_key: *peer_public_key,
            role: SessionRole::Responder,
            state: FsState::L20,
            version,
            my_ephemeral_secret: None,
            my_2dh: None,
            my_4dh: Some(chain(&ikm4, LABEL_4DH_R2I)?),
            peer_2dh: Some(peer_2dh),
            peer_4dh: Some(chain(&ikm4, LABEL_4DH_I2R)?),
            created_at: Utc::now(),
        };
        Ok((session, eph_pub))
    }

    /// Complete an initiated session with the peer's `Accept`.
    pub fn process_accept(
        &mut self,
        peer_ephemeral: &[u8; 32],
        crypto: &dyn CryptoBox,
        version: FsVersion,
    ) -> Result<(), CryptoError> {
        if self.role != SessionRole::Initiator || self.state != FsState::L20 {
            return Err(CryptoError::InvalidSessionState(format!(
                "{:?}/{}",
                self.role, self.state
            )));
        }
        let eph = Zeroizing::new(self.my_ephemeral_secret.ok_or_else(|| {
            CryptoError::InvalidSessionState("ephemeral key already consumed".into())
        })?);

        let ss = crypto.shared_secret(&self.peer_public_key)?;
        let se = crypto.shared_secret(peer_ephemeral)?;
        let es = ephemeral_dh(&eph, &self.peer_public_key)?;
        let ee = ephemeral_dh(&eph, peer_ephemeral)?;
        let ikm4 = concat(&[&*ss, &*se, &*es, &*ee]);

        self.my_4dh = Some(chain(&ikm4, LABEL_4DH_I2R)?);
        self.peer_4dh = Some(chain(&ikm4, LABEL_4DH_R2I)?);
        self.my_2dh = None;
        if let Some(mut secret) = self.my_ephemeral_secret.take() {
            secret.zeroize();
        }
        self.version = version;
        self.state = FsState::L40;
        Ok(())
    }

    /// Encrypt with the best outgoing ratchet (4DH when available).
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(DhType, u64, Vec<u8>), CryptoError> {
        let id = self.id;
        let (dh_type, ratchet) = match (self.my_4dh.as_mut(), self.my_2dh.as_mut()) {
            (Some(r), _) => (DhType::FourDH, r),
            (None, Some(r)) => (DhType::TwoDH, r),
            (None, None) => return Err(CryptoError::MissingRatchet("outgoing")),
        };
        let counter = ratchet.counter();
        let key = Zeroizing::new(ratchet.current_key()?);
        let ciphertext = aead::encrypt(&key, plaintext, &id)?;
        ratchet.turn()?;
        Ok((dh_type, counter, ciphertext))
    }

    /// Decrypt an encapsulated frame, advancing the peer ratchet.
    ///
    /// Mutates `self` even when the AEAD check fails; callers work on a
    /// clone and only persist it after success.
    pub fn decrypt(
        &mut self,
        dh_type: DhType,
        counter: u64,
        ciphertext: &[u8],
        max_skip: u64,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let id = self.id;
        let ratchet = match dh_type {
            DhType::TwoDH => self.peer_2dh.as_mut().ok_or(CryptoError::MissingRatchet("2DH"))?,
            DhType::FourDH => self.peer_4dh.as_mut().ok_or(CryptoError::MissingRatchet("4DH"))?,
        };
        ratchet.turn_until(counter, max_skip)?;
        let key = Zeroizing::new(ratchet.current_key()?);
        let plaintext = aead::decrypt(&key, ciphertext, &id)?;
        ratchet.turn()?;

        if dh_type == DhType::FourDH && self.role == SessionRole::Responder && self.state == FsState::L20 {
            // First 4DH frame from the initiator: it has our Accept.
            self.peer_2dh = None;
            self.state = FsState::L40;
        }
        Ok(plaintext)
    }

    pub fn id(&self) -> &[u8; SESSION_ID_LEN] {
        &self.id
    }

    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> FsState {
        self.state
    }

    pub fn version(&self) -> FsVersion {
        self.version
    }

    pub fn peer_public_key(&self) -> &[u8; 32] {
        &self.peer_public_key
    }

    /// True when the session was negotiated against `key`.
    pub fn is_bound_to(&self, key: &[u8; 32]) -> bool {
        &self.peer_public_key == key
    }

    pub fn peer_counter(&self, dh_type: DhType) -> Option<u64> {
        match dh_type {
            DhType::TwoDH => self.peer_2dh.as_ref().map(KdfRatchet::counter),
            DhType::FourDH => self.peer_4dh.as_ref().map(KdfRatchet::counter),
        }
    }
}
