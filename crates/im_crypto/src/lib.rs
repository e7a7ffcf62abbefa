//! im_crypto — cryptographic building blocks for the message intake pipeline
//!
//! # Design principles
//! - NO custom primitives; X25519, XChaCha20-Poly1305, HKDF and HMAC come
//!   from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Key material crosses module boundaries as fixed-size arrays or
//!   opaque newtypes, never as loose byte vectors.
//!
//! # Module layout
//! - `boxing`      — the "crypto box": X25519 + XChaCha20-Poly1305 with an explicit nonce
//! - `aead`        — XChaCha20-Poly1305 helpers (explicit or prepended nonce)
//! - `kdf`         — HKDF / HMAC chain steps / Argon2id vault key
//! - `hash`        — SHA-256 helpers and keyed nonce hashing
//! - `ratchet`     — symmetric KDF ratchet with a monotonically increasing counter
//! - `dh_session`  — forward-secrecy DH session (2DH / 4DH ratchets, state)
//! - `error`       — unified error type

pub mod aead;
pub mod boxing;
pub mod dh_session;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod ratchet;

pub use boxing::{CryptoBox, X25519Box};
pub use dh_session::{DhSession, DhType, FsState, FsVersion, SessionRole};
pub use error::CryptoError;
pub use ratchet::KdfRatchet;
