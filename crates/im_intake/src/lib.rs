//! im_intake — the incoming message pipeline
//!
//! Takes boxed messages from the transport and turns them into repository
//! updates, exactly once per message, in order per peer.
//!
//! # Module layout
//! - `processor`         — the dispatch router ([`MessageProcessor`])
//! - `decoder`           — open the box and parse the plaintext
//! - `nonce_guard`       — replay protection
//! - `forward_security`  — per-peer DH session state machine
//! - `peer_locks`        — same-peer serialization
//! - `collaborators`     — traits the host application implements
//! - `settings`          — JSON configuration
//! - `error`             — error taxonomy and dispositions

pub mod collaborators;
pub mod decoder;
pub mod error;
pub mod forward_security;
pub mod nonce_guard;
pub mod peer_locks;
pub mod processor;
pub mod settings;

pub use collaborators::{
    BlobDownloader, Collaborators, EntityStore, FsMessageSender, GroupDecision, GroupMessageProcessor, KeyResolver,
    NoopDelegate, ProcessorDelegate,
};
pub use decoder::{seal_message, DecodeFailure, MessageDecoder};
pub use error::{Disposition, DropReason, HandlerError, Outcome, ProcessError};
pub use forward_security::{FsConfig, FsDecryptionResult, FsProcessor, SessionInfo};
pub use nonce_guard::NonceGuard;
pub use peer_locks::PeerLocks;
pub use processor::MessageProcessor;
pub use settings::{ProcessorSettings, SettingsError};
