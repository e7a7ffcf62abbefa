//! In-memory collaborators and a scripted peer for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use im_crypto::{CryptoBox, X25519Box};
use im_intake::collaborators::{
    BlobDownloader, Collaborators, EntityStore, FsMessageSender, GroupDecision, GroupMessageProcessor, KeyResolver,
    ProcessorDelegate,
};
use im_intake::{seal_message, FsConfig, FsProcessor, HandlerError, MessageProcessor, ProcessError, ProcessorSettings};
use im_proto::message::{BlobRef, ReactionAction};
use im_proto::{
    AbstractMessage, BoxedMessage, FsEnvelope, GroupIdentity, Identity, MessageBody, MessageFlags, MessageId,
    ReceiptType,
};
use im_store::{MemoryNonceStore, MemorySessionStore, NonceStore, SessionStore, ValidationLog};
use parking_lot::Mutex;
use rand::RngCore;

// ─── Collaborator fakes ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeKeys {
    keys: Mutex<HashMap<Identity, [u8; 32]>>,
}

impl FakeKeys {
    pub fn insert(&self, identity: Identity, key: [u8; 32]) {
        self.keys.lock().insert(identity, key);
    }
}

#[async_trait]
impl KeyResolver for FakeKeys {
    async fn public_key(&self, identity: &Identity) -> Result<Option<[u8; 32]>, HandlerError> {
        Ok(self.keys.lock().get(identity).copied())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    Stored(MessageId, String),
    Receipt(Option<GroupIdentity>, ReceiptType, Vec<MessageId>),
    Reaction(MessageId, ReactionAction, String),
    Edit(MessageId, String),
    Delete(MessageId),
    Photo(Option<BlobRef>),
    PhotoRequested(Identity),
    Dirty(Identity),
}

#[derive(Default)]
pub struct RecordingEntities {
    pub blocked: Mutex<HashSet<Identity>>,
    pub events: Mutex<Vec<EntityEvent>>,
}

impl RecordingEntities {
    pub fn block(&self, identity: Identity) {
        self.blocked.lock().insert(identity);
    }

    pub fn events(&self) -> Vec<EntityEvent> {
        self.events.lock().clone()
    }

    /// Texts of stored messages, in order.
    pub fn stored(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                EntityEvent::Stored(_, kind) => Some(kind.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: EntityEvent) {
        self.events.lock().push(event);
    }
}

fn summary(message: &AbstractMessage) -> String {
    match &message.body {
        MessageBody::Text { text } | MessageBody::GroupText { text, .. } => text.clone(),
        other => other.message_type().map_or("unknown", |t| t.name()).to_string(),
    }
}

#[async_trait]
impl EntityStore for RecordingEntities {
    async fn is_blocked(&self, identity: &Identity) -> Result<bool, HandlerError> {
        Ok(self.blocked.lock().contains(identity))
    }

    async fn store_incoming(&self, message: &AbstractMessage) -> Result<(), HandlerError> {
        self.push(EntityEvent::Stored(message.message_id, summary(message)));
        Ok(())
    }

    async fn apply_receipt(
        &self,
        _from: &Identity,
        group: Option<&GroupIdentity>,
        receipt_type: ReceiptType,
        message_ids: &[MessageId],
    ) -> Result<(), HandlerError> {
        self.push(EntityEvent::Receipt(group.copied(), receipt_type, message_ids.to_vec()));
        Ok(())
    }

    async fn apply_reaction(
        &self,
        _from: &Identity,
        _group: Option<&GroupIdentity>,
        message_id: &MessageId,
        action: ReactionAction,
        emoji: &str,
    ) -> Result<(), HandlerError> {
        self.push(EntityEvent::Reaction(*message_id, action, emoji.to_string()));
        Ok(())
    }

    async fn apply_edit(
        &self,
        _from: &Identity,
        _group: Option<&GroupIdentity>,
        message_id: &MessageId,
        text: &str,
    ) -> Result<(), HandlerError> {
        self.push(EntityEvent::Edit(*message_id, text.to_string()));
        Ok(())
    }

    async fn apply_delete(
        &self,
        _from: &Identity,
        _group: Option<&GroupIdentity>,
        message_id: &MessageId,
    ) -> Result<(), HandlerError> {
        self.push(EntityEvent::Delete(*message_id));
        Ok(())
    }

    async fn set_contact_photo(&self, _from: &Identity, photo: Option<&BlobRef>) -> Result<(), HandlerError> {
        self.push(EntityEvent::Photo(photo.cloned()));
        Ok(())
    }

    async fn contact_photo_requested(&self, from: &Identity) -> Result<(), HandlerError> {
        self.push(EntityEvent::PhotoRequested(*from));
        Ok(())
    }

    async fn mark_contact_dirty(&self, identity: &Identity) -> Result<(), HandlerError> {
        self.push(EntityEvent::Dirty(*identity));
        Ok(())
    }
}

/// Handles group control messages for groups we are a member of and
/// declines everything else.
#[derive(Default)]
pub struct FakeGroups {
    pub active: Mutex<HashSet<GroupIdentity>>,
    pub handled: Mutex<Vec<AbstractMessage>>,
}

impl FakeGroups {
    pub fn join(&self, group: GroupIdentity) {
        self.active.lock().insert(group);
    }

    pub fn handled(&self) -> Vec<AbstractMessage> {
        self.handled.lock().clone()
    }
}

#[async_trait]
impl GroupMessageProcessor for FakeGroups {
    async fn handle(&self, message: &AbstractMessage, group: &GroupIdentity) -> Result<GroupDecision, HandlerError> {
        let member = self.active.lock().contains(group) || matches!(message.body, MessageBody::GroupCreate { .. });
        if message.is_group_control() && member {
            self.handled.lock().push(message.clone());
            return Ok(GroupDecision::Handled);
        }
        Ok(GroupDecision::Declined)
    }

    async fn is_active_member(&self, group: &GroupIdentity) -> Result<bool, HandlerError> {
        Ok(self.active.lock().contains(group))
    }
}

#[derive(Default)]
pub struct RecordingBlobs {
    pub scheduled: Mutex<Vec<MessageId>>,
}

#[async_trait]
impl BlobDownloader for RecordingBlobs {
    async fn schedule(&self, message: &AbstractMessage) -> Result<(), HandlerError> {
        self.scheduled.lock().push(message.message_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct Outbox {
    sent: Mutex<Vec<(Identity, FsEnvelope)>>,
}

impl Outbox {
    pub fn take(&self) -> Vec<(Identity, FsEnvelope)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

#[async_trait]
impl FsMessageSender for Outbox {
    async fn send_envelope(&self, to: &Identity, envelope: FsEnvelope) -> Result<(), HandlerError> {
        self.sent.lock().push((*to, envelope));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<String>>,
}

impl RecordingDelegate {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl ProcessorDelegate for RecordingDelegate {
    fn before_decode(&self) {
        self.push("before_decode".into());
    }

    fn incoming_message_started(&self, message: &AbstractMessage) {
        self.push(format!("started {}", message.message_id));
    }

    fn incoming_message_changed(&self, message: &AbstractMessage) {
        self.push(format!("changed {}", message.message_id));
    }

    fn incoming_message_finished(&self, message: &AbstractMessage) {
        self.push(format!("finished {}", message.message_id));
    }

    fn incoming_message_failed(&self, _sender: &Identity, message_id: &MessageId, error: &ProcessError) {
        self.push(format!("failed {message_id} {}", error.reason()));
    }

    fn process_typing_indicator(&self, from: &Identity, typing: bool) {
        self.push(format!("typing {from} {typing}"));
    }

    fn process_voip_call(&self, from: &Identity, call: &MessageBody) {
        self.push(format!("voip {from} 0x{:02x}", call.type_byte()));
    }

    fn forward_security_downgraded(&self, peer: &Identity, _message: &AbstractMessage) {
        self.push(format!("downgraded {peer}"));
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

pub const ME: &str = "RECEIVER";

pub struct Harness {
    pub me: Identity,
    pub crypto: Arc<X25519Box>,
    pub keys: Arc<FakeKeys>,
    pub entities: Arc<RecordingEntities>,
    pub groups: Arc<FakeGroups>,
    pub blobs: Arc<RecordingBlobs>,
    pub outbox: Arc<Outbox>,
    pub delegate: Arc<RecordingDelegate>,
    pub nonces: Arc<dyn NonceStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub processor: Arc<MessageProcessor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(ProcessorSettings::default())
    }

    pub fn with_settings(settings: ProcessorSettings) -> Self {
        Self::assemble(
            settings,
            Arc::new(X25519Box::generate()),
            Arc::new(MemoryNonceStore::new()),
            Arc::new(MemorySessionStore::new()),
            None,
        )
    }

    pub fn with_validation_log(log: ValidationLog) -> Self {
        Self::assemble(
            ProcessorSettings::default(),
            Arc::new(X25519Box::generate()),
            Arc::new(MemoryNonceStore::new()),
            Arc::new(MemorySessionStore::new()),
            Some(Arc::new(log)),
        )
    }

    pub fn assemble(
        settings: ProcessorSettings,
        crypto: Arc<X25519Box>,
        nonces: Arc<dyn NonceStore>,
        sessions: Arc<dyn SessionStore>,
        validation_log: Option<Arc<ValidationLog>>,
    ) -> Self {
        let me: Identity = ME.parse().unwrap();
        let keys = Arc::new(FakeKeys::default());
        let entities = Arc::new(RecordingEntities::default());
        let groups = Arc::new(FakeGroups::default());
        let blobs = Arc::new(RecordingBlobs::default());
        let outbox = Arc::new(Outbox::default());
        let delegate = Arc::new(RecordingDelegate::default());

        let collab = Collaborators {
            crypto: crypto.clone(),
            keys: keys.clone(),
            entities: entities.clone(),
            groups: groups.clone(),
            blobs: blobs.clone(),
            fs_sender: outbox.clone(),
            delegate: delegate.clone(),
            nonces: nonces.clone(),
            sessions: sessions.clone(),
            validation_log,
        };
        let processor = Arc::new(MessageProcessor::new(me, &settings, collab).unwrap());
        Self {
            me,
            crypto,
            keys,
            entities,
            groups,
            blobs,
            outbox,
            delegate,
            nonces,
            sessions,
            processor,
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.crypto.public_key()
    }

    /// Make `peer`'s key resolvable.
    pub fn register(&self, peer: &Peer) {
        self.keys.insert(peer.id, peer.crypto.public_key());
    }

    /// A contact whose key the processor can resolve.
    pub fn peer(&self, name: &str) -> Peer {
        let peer = self.unknown_peer(name);
        self.register(&peer);
        peer
    }

    /// A contact the key resolver has never heard of.
    pub fn unknown_peer(&self, name: &str) -> Peer {
        let id: Identity = name.parse().unwrap();
        let crypto = Arc::new(X25519Box::generate());
        let outbox = Arc::new(Outbox::default());
        let sessions = Arc::new(MemorySessionStore::new());
        let fs = FsProcessor::new(id, crypto.clone(), sessions.clone(), outbox.clone(), FsConfig::default());
        Peer {
            id,
            crypto,
            fs,
            outbox,
            sessions,
            recipient: self.me,
            recipient_key: self.crypto.public_key(),
        }
    }

    /// Envelopes the processor sent to `peer`.
    pub fn sent_to(&self, peer: &Peer) -> Vec<FsEnvelope> {
        self.outbox
            .take()
            .into_iter()
            .filter(|(to, _)| *to == peer.id)
            .map(|(_, e)| e)
            .collect()
    }
}

// ─── Peer ───────────────────────────────────────────────────────────────────

/// The other end of the conversation: builds and seals messages the way a
/// remote client would, and runs its own forward-security processor.
pub struct Peer {
    pub id: Identity,
    pub crypto: Arc<X25519Box>,
    pub fs: FsProcessor,
    pub outbox: Arc<Outbox>,
    pub sessions: Arc<MemorySessionStore>,
    recipient: Identity,
    recipient_key: [u8; 32],
}

impl Peer {
    pub fn message(&self, body: MessageBody) -> AbstractMessage {
        AbstractMessage {
            message_id: MessageId::random(),
            from_identity: self.id,
            to_identity: self.recipient,
            date: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            flags: MessageFlags(MessageFlags::SEND_PUSH),
            push_from_name: Some(format!("Peer {}", self.id)),
            body,
        }
    }

    pub fn text(&self, text: &str) -> AbstractMessage {
        self.message(MessageBody::Text { text: text.into() })
    }

    pub fn seal(&self, message: &AbstractMessage) -> BoxedMessage {
        let mut nonce = [0u8; 24];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        seal_message(self.crypto.as_ref(), &self.recipient_key, message, nonce).unwrap()
    }

    pub fn boxed(&self, body: MessageBody) -> BoxedMessage {
        self.seal(&self.message(body))
    }

    pub fn boxed_text(&self, text: &str) -> BoxedMessage {
        self.seal(&self.text(text))
    }

    /// Box raw `type || body` plaintext, bypassing the body encoder.
    pub fn boxed_raw(&self, type_byte: u8, body: &[u8]) -> BoxedMessage {
        let mut boxed = self.boxed_text("placeholder");
        boxed.box_data = self
            .crypto
            .seal(
                &im_proto::codec::encode_for_wire(type_byte, body),
                &boxed.nonce,
                &self.recipient_key,
            )
            .unwrap();
        boxed
    }

    pub fn boxed_envelope(&self, envelope: FsEnvelope) -> BoxedMessage {
        self.boxed(MessageBody::ForwardSecurity(envelope))
    }

    /// Start a session with the receiver; returns the boxed `Init`.
    pub async fn init_session(&self) -> BoxedMessage {
        let init = self.fs.initiate_session(&self.recipient, &self.recipient_key).await.unwrap();
        self.boxed_envelope(init)
    }

    /// Encapsulate `message` in the current session and box it.
    pub async fn encapsulate(&self, message: &AbstractMessage) -> BoxedMessage {
        let envelope = self.fs.encapsulate(&self.recipient, message).await.unwrap();
        self.seal(&AbstractMessage {
            body: MessageBody::ForwardSecurity(envelope),
            ..message.clone()
        })
    }

    /// Feed an envelope the receiver sent us into our FS processor.
    pub async fn receive(&self, envelope: &FsEnvelope, receiver_key: &[u8; 32]) {
        let carrier = AbstractMessage {
            message_id: MessageId::random(),
            from_identity: self.recipient,
            to_identity: self.id,
            date: Utc::now(),
            flags: MessageFlags::default(),
            push_from_name: None,
            body: MessageBody::ForwardSecurity(envelope.clone()),
        };
        let result = self.fs.process_envelope(&carrier, receiver_key, envelope).await.unwrap();
        if let Some(session) = &result.pending {
            self.fs.commit(session).await.unwrap();
        }
    }
}
