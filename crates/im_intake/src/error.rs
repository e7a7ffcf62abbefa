//! Intake error taxonomy.
//!
//! Every failure maps to a [`Disposition`]: the transport either acks the
//! message (it will never be processed again) or leaves it for redelivery.

use im_proto::{AbstractMessage, MessageId};
use im_store::StoreError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Acknowledge to the server; the message is done.
    Ack,
    /// Do not acknowledge; the server redelivers later.
    Retry,
}

/// Failure reported by an external collaborator.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("key lookup failed: {0}")]
    KeyLookup(String),
    #[error("repository: {0}")]
    Repository(String),
    #[error("group processing: {0}")]
    Group(String),
    #[error("blob download: {0}")]
    Blob(String),
    #[error("transport: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("sender {identity} unknown: {reason}")]
    SenderUnknown { identity: String, reason: String },

    #[error("bad message format from {sender}: {reason}")]
    BadMessageFormat { sender: String, reason: String },

    #[error("unknown message type 0x{type_byte:02x}")]
    UnknownMessageType { type_byte: u8 },

    #[error("invalid content in {kind}")]
    InvalidContent { kind: String },

    /// Only logged. A replay ends as `Outcome::Dropped(AlreadyProcessed)`
    /// so the transport acks it silently.
    #[error("message {message_id} already processed")]
    NonceReplay { message_id: MessageId },

    #[error("forward security rejected: {reason}")]
    ForwardSecurityReject { reason: String },

    #[error("forward security not ready: {reason}")]
    ForwardSecurityTransient { reason: String },

    #[error("no handler for message kind {kind}")]
    InvalidMessageClass { kind: String },

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("processing interrupted: {reason}")]
    Interrupted { reason: String },
}

impl ProcessError {
    pub fn disposition(&self) -> Disposition {
        match self {
            ProcessError::SenderUnknown { .. }
            | ProcessError::ForwardSecurityTransient { .. }
            | ProcessError::InvalidMessageClass { .. }
            | ProcessError::Store(_)
            | ProcessError::Interrupted { .. } => Disposition::Retry,
            ProcessError::BadMessageFormat { .. }
            | ProcessError::UnknownMessageType { .. }
            | ProcessError::InvalidContent { .. }
            | ProcessError::NonceReplay { .. }
            | ProcessError::ForwardSecurityReject { .. }
            | ProcessError::Handler(_) => Disposition::Ack,
        }
    }

    /// Short tag for logs and the validation log.
    pub fn reason(&self) -> &'static str {
        match self {
            ProcessError::SenderUnknown { .. } => "sender_unknown",
            ProcessError::BadMessageFormat { .. } => "bad_message_format",
            ProcessError::UnknownMessageType { .. } => "unknown_message_type",
            ProcessError::InvalidContent { .. } => "invalid_content",
            ProcessError::NonceReplay { .. } => "nonce_replay",
            ProcessError::ForwardSecurityReject { .. } => "forward_security_reject",
            ProcessError::ForwardSecurityTransient { .. } => "forward_security_transient",
            ProcessError::InvalidMessageClass { .. } => "invalid_message_class",
            ProcessError::Handler(_) => "handler",
            ProcessError::Store(_) => "store",
            ProcessError::Interrupted { .. } => "interrupted",
        }
    }

    pub(crate) fn fs_reject(reason: impl Into<String>) -> Self {
        ProcessError::ForwardSecurityReject { reason: reason.into() }
    }

    pub(crate) fn fs_transient(reason: impl Into<String>) -> Self {
        ProcessError::ForwardSecurityTransient { reason: reason.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    BlockedSender,
    InvalidContent,
    AlreadyProcessed,
    /// A forward-security control frame (init, accept, reject, terminate).
    ForwardSecurityControl,
}

/// Successful end of the pipeline. Both variants are acked.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Processed(Box<AbstractMessage>),
    Dropped(DropReason),
}

impl Outcome {
    pub fn processed(&self) -> Option<&AbstractMessage> {
        match self {
            Outcome::Processed(m) => Some(m),
            Outcome::Dropped(_) => None,
        }
    }
}
