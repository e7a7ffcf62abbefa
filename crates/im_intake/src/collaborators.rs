//! Seams to the rest of the application.
//!
//! The pipeline owns no contacts, conversations or groups. It reaches them
//! through these traits, injected once via [`Collaborators`].

use std::sync::Arc;

use async_trait::async_trait;
use im_crypto::CryptoBox;
use im_proto::message::{BlobRef, ReactionAction};
use im_proto::{AbstractMessage, FsEnvelope, GroupIdentity, Identity, MessageBody, MessageId, ReceiptType};
use im_store::{NonceStore, SessionStore, ValidationLog};

use crate::error::{HandlerError, ProcessError};

#[async_trait]
pub trait KeyResolver: Send + Sync {
    /// Long-term public key of `identity`. `None` when the identity is
    /// not known (yet); the message is retried later.
    async fn public_key(&self, identity: &Identity) -> Result<Option<[u8; 32]>, HandlerError>;
}

/// The persistent repository (contacts, conversations, messages).
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn is_blocked(&self, identity: &Identity) -> Result<bool, HandlerError>;

    /// Persist a conversation message (text, media, location, ballot, file).
    async fn store_incoming(&self, message: &AbstractMessage) -> Result<(), HandlerError>;

    async fn apply_receipt(
        &self,
        from: &Identity,
        group: Option<&GroupIdentity>,
        receipt_type: ReceiptType,
        message_ids: &[MessageId],
    ) -> Result<(), HandlerError>;

    async fn apply_reaction(
        &self,
        from: &Identity,
        group: Option<&GroupIdentity>,
        message_id: &MessageId,
        action: ReactionAction,
        emoji: &str,
    ) -> Result<(), HandlerError>;

    async fn apply_edit(
        &self,
        from: &Identity,
        group: Option<&GroupIdentity>,
        message_id: &MessageId,
        text: &str,
    ) -> Result<(), HandlerError>;

    async fn apply_delete(
        &self,
        from: &Identity,
        group: Option<&GroupIdentity>,
        message_id: &MessageId,
    ) -> Result<(), HandlerError>;

    /// `None` removes the photo.
    async fn set_contact_photo(&self, from: &Identity, photo: Option<&BlobRef>) -> Result<(), HandlerError>;

    /// The contact wants our profile picture with the next message.
    async fn contact_photo_requested(&self, from: &Identity) -> Result<(), HandlerError>;

    /// Forward-security state with this contact changed.
    async fn mark_contact_dirty(&self, identity: &Identity) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupDecision {
    /// The group processor consumed the message.
    Handled,
    /// Not a group concern; continue with per-type handling.
    Declined,
}

#[async_trait]
pub trait GroupMessageProcessor: Send + Sync {
    async fn handle(&self, message: &AbstractMessage, group: &GroupIdentity) -> Result<GroupDecision, HandlerError>;

    /// Whether the local user is an active member of `group`.
    async fn is_active_member(&self, group: &GroupIdentity) -> Result<bool, HandlerError>;
}

#[async_trait]
pub trait BlobDownloader: Send + Sync {
    /// Queue the blob(s) referenced by `message` for download.
    async fn schedule(&self, message: &AbstractMessage) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait FsMessageSender: Send + Sync {
    async fn send_envelope(&self, to: &Identity, envelope: FsEnvelope) -> Result<(), HandlerError>;
}

/// Lifecycle callbacks. Fire-and-forget; default to no-ops.
#[allow(unused_variables)]
pub trait ProcessorDelegate: Send + Sync {
    fn before_decode(&self) {}
    fn incoming_message_started(&self, message: &AbstractMessage) {}
    fn incoming_message_changed(&self, message: &AbstractMessage) {}
    fn incoming_message_finished(&self, message: &AbstractMessage) {}
    fn incoming_message_failed(&self, sender: &Identity, message_id: &MessageId, error: &ProcessError) {}
    fn process_typing_indicator(&self, from: &Identity, typing: bool) {}
    fn process_voip_call(&self, from: &Identity, call: &MessageBody) {}
    /// A peer with an established session sent `message` without forward security.
    fn forward_security_downgraded(&self, peer: &Identity, message: &AbstractMessage) {}
}

pub struct NoopDelegate;

impl ProcessorDelegate for NoopDelegate {}

/// Everything the processor needs from outside.
#[derive(Clone)]
pub struct Collaborators {
    pub crypto: Arc<dyn CryptoBox>,
    pub keys: Arc<dyn KeyResolver>,
    pub entities: Arc<dyn EntityStore>,
    pub groups: Arc<dyn GroupMessageProcessor>,
    pub blobs: Arc<dyn BlobDownloader>,
    pub fs_sender: Arc<dyn FsMessageSender>,
    pub delegate: Arc<dyn ProcessorDelegate>,
    pub nonces: Arc<dyn NonceStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub validation_log: Option<Arc<ValidationLog>>,
}
