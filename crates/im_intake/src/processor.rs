//! The dispatch router.
//!
//! ```text
//! boxed ─ key lookup ─ decode ─┬─ peer lock ─ blocklist ─ content ─ nonce guard ─┬─ FS envelope ─ inner ─┐
//!                              │                                                 └─ plain ───────────────┤
//!                              │                                    group processor / per-type handler ◄─┘
//!                              └─ BadMessageFormat / UnknownMessageType (validation log)
//! ```
//!
//! Every stage either hands the message on, finishes it with an
//! [`Outcome`], or fails it with a [`ProcessError`] whose disposition tells
//! the transport whether to acknowledge.

use std::collections::HashMap;
use std::sync::Arc;

use im_proto::validation::{is_content_valid_with, ContentLimits};
use im_proto::{AbstractMessage, BoxedMessage, FsEnvelope, Identity, MessageBody, MessageId};
use im_store::{Rejection, ValidationLog};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Collaborators, GroupDecision};
use crate::decoder::MessageDecoder;
use crate::error::{Disposition, DropReason, Outcome, ProcessError};
use crate::forward_security::{FsConfig, FsProcessor};
use crate::nonce_guard::NonceGuard;
use crate::peer_locks::PeerLocks;
use crate::settings::{ProcessorSettings, SettingsError};

pub struct MessageProcessor {
    own_identity: Identity,
    limits: ContentLimits,
    max_batch_concurrency: usize,
    decoder: MessageDecoder,
    nonce_guard: NonceGuard,
    fs: FsProcessor,
    peer_locks: PeerLocks,
    collab: Collaborators,
}

/// Where a message stands after the admission checks.
enum Admission {
    Admit,
    Drop(DropReason),
}

impl MessageProcessor {
    pub fn new(
        own_identity: Identity,
        settings: &ProcessorSettings,
        collab: Collaborators,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        let fs = FsProcessor::new(
            own_identity,
            collab.crypto.clone(),
            collab.sessions.clone(),
            collab.fs_sender.clone(),
            FsConfig::from_settings(settings)?,
        );
        Ok(Self {
            own_identity,
            limits: settings.content_limits(),
            max_batch_concurrency: settings.limits.max_batch_concurrency,
            decoder: MessageDecoder::new(collab.crypto.clone()),
            nonce_guard: NonceGuard::new(own_identity, collab.nonces.clone()),
            fs,
            peer_locks: PeerLocks::new(),
            collab,
        })
    }

    pub fn own_identity(&self) -> &Identity {
        &self.own_identity
    }

    pub fn forward_security(&self) -> &FsProcessor {
        &self.fs
    }

    pub fn nonce_guard(&self) -> &NonceGuard {
        &self.nonce_guard
    }

    /// Run one boxed message through the pipeline.
    pub async fn process(&self, boxed: &BoxedMessage) -> Result<Outcome, ProcessError> {
        self.collab.delegate.before_decode();
        let result = self.run(boxed).await;
        match &result {
            Ok(outcome) => debug!(
                sender = %boxed.from_identity,
                message_id = %boxed.message_id,
                ?outcome,
                "message done"
            ),
            Err(e) => {
                match e.disposition() {
                    Disposition::Retry => info!(
                        sender = %boxed.from_identity,
                        message_id = %boxed.message_id,
                        error = %e,
                        "message deferred"
                    ),
                    Disposition::Ack => warn!(
                        sender = %boxed.from_identity,
                        message_id = %boxed.message_id,
                        error = %e,
                        "message failed"
                    ),
                }
                self.collab
                    .delegate
                    .incoming_message_failed(&boxed.from_identity, &boxed.message_id, e);
            }
        }
        result
    }

    /// Process many messages. Different peers run in parallel, messages of
    /// one peer run in arrival order. Results come back in input order.
    pub async fn process_batch(self: &Arc<Self>, messages: Vec<BoxedMessage>) -> Vec<Result<Outcome, ProcessError>> {
        let total = messages.len();
        let mut per_peer: HashMap<Identity, Vec<(usize, BoxedMessage)>> = HashMap::new();
        for (index, boxed) in messages.into_iter().enumerate() {
            per_peer.entry(boxed.from_identity).or_default().push((index, boxed));
        }
        debug!(total, peers = per_peer.len(), "processing batch");

        let semaphore = Arc::new(Semaphore::new(self.max_batch_concurrency));
        let mut handles = Vec::with_capacity(per_peer.len());
        for (_, queue) in per_peer {
            let this = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let mut done = Vec::with_capacity(queue.len());
                for (index, boxed) in queue {
                    done.push((index, this.process(&boxed).await));
                }
                done
            }));
        }

        let mut done = Vec::with_capacity(total);
        for handle in handles {
            match handle.await {
                Ok(results) => done.extend(results),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => error!(error = %e, "batch task cancelled"),
            }
        }
        in_input_order(total, done)
    }

    async fn run(&self, boxed: &BoxedMessage) -> Result<Outcome, ProcessError> {
        let sender = boxed.from_identity;
        let sender_key = match self.collab.keys.public_key(&sender).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                return Err(ProcessError::SenderUnknown {
                    identity: sender.to_string(),
                    reason: "no public key".into(),
                })
            }
            Err(e) => {
                return Err(ProcessError::SenderUnknown {
                    identity: sender.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let message = self.decode(boxed, &sender_key)?;

        let _peer = self.peer_locks.lock(&sender).await;
        self.collab.delegate.incoming_message_started(&message);
        let outcome = self.handle(&message, &sender_key, &boxed.nonce).await?;
        self.collab.delegate.incoming_message_finished(&message);
        Ok(outcome)
    }

    fn decode(&self, boxed: &BoxedMessage, sender_key: &[u8; 32]) -> Result<AbstractMessage, ProcessError> {
        if boxed.to_identity != self.own_identity {
            let err = ProcessError::BadMessageFormat {
                sender: boxed.from_identity.to_string(),
                reason: format!("addressed to {}", boxed.to_identity),
            };
            self.record_rejection(&boxed.from_identity, &boxed.message_id, None, &err);
            return Err(err);
        }

        let message = self.decoder.try_decode(boxed, sender_key).map_err(|e| {
            let err = ProcessError::BadMessageFormat {
                sender: boxed.from_identity.to_string(),
                reason: e.to_string(),
            };
            self.record_rejection(&boxed.from_identity, &boxed.message_id, None, &err);
            err
        })?;

        if let MessageBody::Unknown { type_byte, .. } = message.body {
            let err = ProcessError::UnknownMessageType { type_byte };
            self.record_rejection(&boxed.from_identity, &boxed.message_id, Some(type_byte), &err);
            return Err(err);
        }
        Ok(message)
    }

    /// Everything after decoding, under the peer lock.
    async fn handle(
        &self,
        message: &AbstractMessage,
        sender_key: &[u8; 32],
        nonce: &[u8],
    ) -> Result<Outcome, ProcessError> {
        if let Admission::Drop(reason) = self.admit(message).await? {
            return Ok(Outcome::Dropped(reason));
        }

        if self.nonce_guard.is_processed(nonce).await? {
            let err = ProcessError::NonceReplay {
                message_id: message.message_id,
            };
            debug!(sender = %message.from_identity, error = %err, "dropping message");
            return Ok(Outcome::Dropped(DropReason::AlreadyProcessed));
        }

        let outcome = match &message.body {
            MessageBody::ForwardSecurity(envelope) => self.handle_envelope(message, sender_key, envelope).await?,
            _ => {
                if self.fs.check_downgrade(&message.from_identity, message).await? {
                    warn!(
                        sender = %message.from_identity,
                        message_id = %message.message_id,
                        kind = kind(message),
                        "message sent without forward security despite established session"
                    );
                    self.collab
                        .delegate
                        .forward_security_downgraded(&message.from_identity, message);
                }
                self.dispatch(message).await?
            }
        };

        if let Err(e) = self.nonce_guard.mark_processed(nonce).await {
            // The message is handled; a redelivery would be caught by the
            // FS ratchet or deduplicated by the repository.
            warn!(message_id = %message.message_id, error = %e, "failed to mark nonce processed");
        }
        Ok(outcome)
    }

    /// Blocklist and content checks.
    async fn admit(&self, message: &AbstractMessage) -> Result<Admission, ProcessError> {
        // The blocklist applies to what is inside the envelope.
        let is_envelope = matches!(message.body, MessageBody::ForwardSecurity(_));
        if !is_envelope && self.is_blocked(message).await? {
            debug!(sender = %message.from_identity, message_id = %message.message_id, "sender blocked, dropping");
            return Ok(Admission::Drop(DropReason::BlockedSender));
        }

        if !is_content_valid_with(message, &self.limits) {
            let err = ProcessError::InvalidContent {
                kind: kind(message).to_string(),
            };
            warn!(sender = %message.from_identity, message_id = %message.message_id, error = %err, "dropping message");
            self.record_rejection(
                &message.from_identity,
                &message.message_id,
                Some(message.type_byte()),
                &err,
            );
            return Ok(Admission::Drop(DropReason::InvalidContent));
        }
        Ok(Admission::Admit)
    }

    async fn is_blocked(&self, message: &AbstractMessage) -> Result<bool, ProcessError> {
        if !self.collab.entities.is_blocked(&message.from_identity).await? {
            return Ok(false);
        }
        if message.is_group_control() {
            if let Some(group) = message.group_identity() {
                if self.collab.groups.is_active_member(&group).await? {
                    debug!(sender = %message.from_identity, %group, "applying group control from blocked member");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn handle_envelope(
        &self,
        outer: &AbstractMessage,
        sender_key: &[u8; 32],
        envelope: &FsEnvelope,
    ) -> Result<Outcome, ProcessError> {
        let result = match self.fs.process_envelope(outer, sender_key, envelope).await {
            Ok(result) => result,
            Err(e) => {
                if matches!(e, ProcessError::ForwardSecurityReject { .. } | ProcessError::BadMessageFormat { .. }) {
                    self.record_rejection(&outer.from_identity, &outer.message_id, Some(outer.type_byte()), &e);
                }
                return Err(e);
            }
        };

        let Some(inner) = result.inner else {
            self.collab.entities.mark_contact_dirty(&outer.from_identity).await?;
            return Ok(Outcome::Dropped(DropReason::ForwardSecurityControl));
        };
        debug!(
            sender = %outer.from_identity,
            message_id = %outer.message_id,
            kind = kind(&inner),
            state = %result.session.state,
            "decapsulated"
        );

        let settled = self.handle_inner(outer, &inner).await;
        let Some(session) = result.pending else {
            return settled;
        };
        // A retried message must find the ratchet where it was.
        match &settled {
            Err(e) if e.disposition() == Disposition::Retry => {
                debug!(sender = %outer.from_identity, message_id = %outer.message_id, "session left uncommitted for redelivery");
            }
            _ => self.fs.commit(&session).await?,
        }
        settled
    }

    async fn handle_inner(&self, outer: &AbstractMessage, inner: &AbstractMessage) -> Result<Outcome, ProcessError> {
        match &inner.body {
            MessageBody::ForwardSecurity(_) => {
                let err = ProcessError::BadMessageFormat {
                    sender: outer.from_identity.to_string(),
                    reason: "nested forward security envelope".into(),
                };
                self.record_rejection(&outer.from_identity, &outer.message_id, Some(inner.type_byte()), &err);
                return Err(err);
            }
            MessageBody::Unknown { type_byte, .. } => {
                let err = ProcessError::UnknownMessageType { type_byte: *type_byte };
                self.record_rejection(&outer.from_identity, &outer.message_id, Some(*type_byte), &err);
                return Err(err);
            }
            _ => {}
        }

        if let Admission::Drop(reason) = self.admit(inner).await? {
            return Ok(Outcome::Dropped(reason));
        }
        self.dispatch(inner).await
    }

    async fn dispatch(&self, message: &AbstractMessage) -> Result<Outcome, ProcessError> {
        if let Some(group) = message.group_identity() {
            match self.collab.groups.handle(message, &group).await? {
                GroupDecision::Handled => {
                    debug!(sender = %message.from_identity, %group, kind = kind(message), "handled by group processor");
                    return Ok(Outcome::Processed(Box::new(message.clone())));
                }
                GroupDecision::Declined => {}
            }
        }
        self.handle_by_type(message).await?;
        Ok(Outcome::Processed(Box::new(message.clone())))
    }

    async fn handle_by_type(&self, message: &AbstractMessage) -> Result<(), ProcessError> {
        use MessageBody as B;

        let from = &message.from_identity;
        let entities = &self.collab.entities;
        let delegate = &self.collab.delegate;

        match &message.body {
            B::Text { .. }
            | B::Location(_)
            | B::Image(_)
            | B::Video(_)
            | B::Audio(_)
            | B::File { .. }
            | B::BallotCreate { .. }
            | B::BallotVote { .. }
            | B::GroupText { .. }
            | B::GroupLocation { .. }
            | B::GroupImage { .. }
            | B::GroupVideo { .. }
            | B::GroupAudio { .. }
            | B::GroupFile { .. }
            | B::GroupBallotCreate { .. }
            | B::GroupBallotVote { .. }
            | B::GroupCallStart { .. } => {
                entities.store_incoming(message).await?;
                delegate.incoming_message_changed(message);
            }
            B::ContactSetPhoto(photo) => entities.set_contact_photo(from, Some(photo)).await?,
            B::ContactDeletePhoto => entities.set_contact_photo(from, None).await?,
            B::ContactRequestPhoto => entities.contact_photo_requested(from).await?,
            B::DeliveryReceipt {
                receipt_type,
                message_ids,
            } => {
                entities.apply_receipt(from, None, *receipt_type, message_ids).await?;
                delegate.incoming_message_changed(message);
            }
            B::GroupDeliveryReceipt {
                group,
                receipt_type,
                message_ids,
            } => {
                entities
                    .apply_receipt(from, Some(group), *receipt_type, message_ids)
                    .await?;
                delegate.incoming_message_changed(message);
            }
            B::Reaction {
                message_id,
                action,
                emoji,
            } => {
                entities.apply_reaction(from, None, message_id, *action, emoji).await?;
                delegate.incoming_message_changed(message);
            }
            B::GroupReaction {
                group,
                message_id,
                action,
                emoji,
            } => {
                entities
                    .apply_reaction(from, Some(group), message_id, *action, emoji)
                    .await?;
                delegate.incoming_message_changed(message);
            }
            B::Edit { message_id, text } => {
                entities.apply_edit(from, None, message_id, text).await?;
                delegate.incoming_message_changed(message);
            }
            B::GroupEdit {
                group,
                message_id,
                text,
            } => {
                entities.apply_edit(from, Some(group), message_id, text).await?;
                delegate.incoming_message_changed(message);
            }
            B::Delete { message_id } => {
                entities.apply_delete(from, None, message_id).await?;
                delegate.incoming_message_changed(message);
            }
            B::GroupDelete { group, message_id } => {
                entities.apply_delete(from, Some(group), message_id).await?;
                delegate.incoming_message_changed(message);
            }
            B::TypingIndicator { typing } => delegate.process_typing_indicator(from, *typing),
            B::VoipCallOffer(_)
            | B::VoipCallAnswer(_)
            | B::VoipCallIceCandidate(_)
            | B::VoipCallHangup(_)
            | B::VoipCallRinging(_) => delegate.process_voip_call(from, &message.body),
            B::Empty => debug!(%from, message_id = %message.message_id, "empty message"),

            // Only the group processor may apply these.
            B::GroupCreate { .. }
            | B::GroupRename { .. }
            | B::GroupLeave { .. }
            | B::GroupSetPhoto { .. }
            | B::GroupRequestSync { .. }
            | B::GroupDeletePhoto { .. }
            | B::AuthToken { .. } => {
                return Err(ProcessError::InvalidMessageClass {
                    kind: kind(message).to_string(),
                })
            }
            B::ForwardSecurity(_) => {
                return Err(ProcessError::BadMessageFormat {
                    sender: from.to_string(),
                    reason: "nested forward security envelope".into(),
                })
            }
            B::Unknown { type_byte, .. } => {
                return Err(ProcessError::UnknownMessageType { type_byte: *type_byte })
            }
        }

        if message.needs_blob_download() {
            self.collab.blobs.schedule(message).await?;
        }
        Ok(())
    }

    fn record_rejection(&self, sender: &Identity, message_id: &MessageId, type_byte: Option<u8>, err: &ProcessError) {
        let Some(log) = &self.collab.validation_log else {
            return;
        };
        append_rejection(log, sender, message_id, type_byte, err);
    }
}

fn append_rejection(
    log: &ValidationLog,
    sender: &Identity,
    message_id: &MessageId,
    type_byte: Option<u8>,
    err: &ProcessError,
) {
    let id = message_id.to_hex();
    let rejection = Rejection {
        sender: sender.as_str(),
        message_id: &id,
        type_byte,
        reason: err.reason(),
        detail: Some(err.to_string()),
    };
    if let Err(e) = log.append(rejection) {
        error!(%sender, %message_id, error = %e, "validation log append failed");
    }
}

/// Results by input index. A slot whose task never reported is retried.
fn in_input_order(total: usize, done: Vec<(usize, Result<Outcome, ProcessError>)>) -> Vec<Result<Outcome, ProcessError>> {
    let mut slots: Vec<Option<Result<Outcome, ProcessError>>> = (0..total).map(|_| None).collect();
    for (index, result) in done {
        slots[index] = Some(result);
    }
    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| {
                Err(ProcessError::Interrupted {
                    reason: "batch task cancelled".into(),
                })
            })
        })
        .collect()
}

fn kind(message: &AbstractMessage) -> &'static str {
    message.message_type().map_or("unknown", |t| t.name())
}
