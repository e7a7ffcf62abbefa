//! Forward-security session processor.
//!
//! Consumes `FsEnvelope`s from a peer and drives the per-peer DH session
//! through its states:
//!
//! ```text
//! NoSession --Init (peer)--> L20 responder --first 4DH frame--> L40
//! NoSession --initiate-----> L20 initiator --Accept (peer)----> L40
//! any       --Reject/Terminate----------------------------------> NoSession
//! ```
//!
//! Encapsulated frames are decrypted on a copy of the stored session. The
//! advanced copy comes back as [`FsDecryptionResult::pending`] and is only
//! written back through [`FsProcessor::commit`] once the inner message is
//! settled, so a failed or retried message never burns keys.

use std::sync::Arc;

use im_crypto::dh_session::{DhSession, DhType, FsState, FsVersion, SessionRole, VersionRange, SESSION_ID_LEN};
use im_crypto::CryptoBox;
use im_proto::codec::{decode_from_wire, encode_for_wire};
use im_proto::decoder::{decode_body, encode_body};
use im_proto::{AbstractMessage, FsCause, FsEnvelope, FsFrame, GroupIdentity, Identity, MessageBody, MessageId};
use im_store::SessionStore;
use tracing::{debug, info, warn};

use crate::collaborators::FsMessageSender;
use crate::error::ProcessError;
use crate::settings::{ProcessorSettings, SettingsError};

type SessionId = [u8; SESSION_ID_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsConfig {
    pub enabled: bool,
    pub max_skip: u64,
    pub versions: VersionRange,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_skip: im_crypto::ratchet::DEFAULT_MAX_SKIP,
            versions: VersionRange::default(),
        }
    }
}

impl FsConfig {
    pub fn from_settings(settings: &ProcessorSettings) -> Result<Self, SettingsError> {
        Ok(Self {
            enabled: settings.forward_security.enabled,
            max_skip: settings.forward_security.max_counter_skip,
            versions: settings.version_range()?,
        })
    }
}

/// Session as seen after a frame was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub state: FsState,
    pub version: Option<FsVersion>,
    pub role: Option<SessionRole>,
}

impl SessionInfo {
    fn of(session: &DhSession) -> Self {
        Self {
            session_id: *session.id(),
            state: session.state(),
            version: Some(session.version()),
            role: Some(session.role()),
        }
    }

    fn gone(session_id: SessionId) -> Self {
        Self {
            session_id,
            state: FsState::NoSession,
            version: None,
            role: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FsDecryptionResult {
    /// `None` when the envelope was a control frame.
    pub inner: Option<AbstractMessage>,
    pub session: SessionInfo,
    /// Ratchet state after decrypting `inner`, not stored yet.
    pub pending: Option<DhSession>,
}

impl FsDecryptionResult {
    fn control(session: SessionInfo) -> Self {
        Self {
            inner: None,
            session,
            pending: None,
        }
    }
}

pub struct FsProcessor {
    own_identity: Identity,
    crypto: Arc<dyn CryptoBox>,
    sessions: Arc<dyn SessionStore>,
    sender: Arc<dyn FsMessageSender>,
    config: FsConfig,
}

impl FsProcessor {
    pub fn new(
        own_identity: Identity,
        crypto: Arc<dyn CryptoBox>,
        sessions: Arc<dyn SessionStore>,
        sender: Arc<dyn FsMessageSender>,
        config: FsConfig,
    ) -> Self {
        Self {
            own_identity,
            crypto,
            sessions,
            sender,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Process an envelope received inside `outer` from a peer whose
    /// long-term key is `sender_key`.
    pub async fn process_envelope(
        &self,
        outer: &AbstractMessage,
        sender_key: &[u8; 32],
        envelope: &FsEnvelope,
    ) -> Result<FsDecryptionResult, ProcessError> {
        let peer = outer.from_identity;
        let session_id = envelope.session_id;
        debug!(
            %peer,
            session = %hex::encode(session_id),
            frame = envelope.frame.kind(),
            "forward security envelope"
        );

        if !self.config.enabled {
            return self.reject_disabled(outer, envelope).await;
        }

        match &envelope.frame {
            FsFrame::Init {
                version_range,
                ephemeral_public_key,
            } => self.handle_init(&peer, sender_key, session_id, version_range, ephemeral_public_key).await,
            FsFrame::Accept {
                version_range,
                ephemeral_public_key,
            } => self.handle_accept(&peer, session_id, version_range, ephemeral_public_key).await,
            FsFrame::Reject {
                rejected_message_id,
                cause,
            } => {
                let removed = self.sessions.delete_session(self.own(), peer.as_str(), &session_id).await?;
                info!(%peer, rejected = %rejected_message_id, ?cause, removed, "peer rejected a message, session dropped");
                Ok(FsDecryptionResult::control(SessionInfo::gone(session_id)))
            }
            FsFrame::Terminate { cause } => {
                let removed = self.sessions.delete_session(self.own(), peer.as_str(), &session_id).await?;
                info!(%peer, ?cause, removed, "peer terminated session");
                Ok(FsDecryptionResult::control(SessionInfo::gone(session_id)))
            }
            FsFrame::Encapsulated {
                dh_type,
                counter,
                applied_version,
                group_identity,
                ciphertext,
                ..
            } => {
                self.handle_encapsulated(
                    outer,
                    sender_key,
                    session_id,
                    *dh_type,
                    *counter,
                    *applied_version,
                    group_identity.as_ref(),
                    ciphertext,
                )
                .await
            }
        }
    }

    async fn reject_disabled(
        &self,
        outer: &AbstractMessage,
        envelope: &FsEnvelope,
    ) -> Result<FsDecryptionResult, ProcessError> {
        let peer = outer.from_identity;
        match envelope.frame {
            // Answering these would start a reject ping-pong.
            FsFrame::Reject { .. } | FsFrame::Terminate { .. } => {
                debug!(%peer, frame = envelope.frame.kind(), "forward security disabled, frame ignored");
                Ok(FsDecryptionResult::control(SessionInfo::gone(envelope.session_id)))
            }
            FsFrame::Init { .. } | FsFrame::Accept { .. } => {
                self.send_reject(&peer, envelope.session_id, outer.message_id, FsCause::DisabledByLocal)
                    .await?;
                Ok(FsDecryptionResult::control(SessionInfo::gone(envelope.session_id)))
            }
            FsFrame::Encapsulated { .. } => {
                self.send_reject(&peer, envelope.session_id, outer.message_id, FsCause::DisabledByLocal)
                    .await?;
                Err(ProcessError::fs_reject("forward security disabled"))
            }
        }
    }

    async fn handle_init(
        &self,
        peer: &Identity,
        sender_key: &[u8; 32],
        session_id: SessionId,
        offered: &VersionRange,
        peer_ephemeral: &[u8; 32],
    ) -> Result<FsDecryptionResult, ProcessError> {
        let Some(version) = self.config.versions.negotiate(offered) else {
            warn!(%peer, min = %offered.min, max = %offered.max, "no common forward security version");
            self.send(peer, session_id, FsFrame::Terminate { cause: FsCause::Reset }).await?;
            return Ok(FsDecryptionResult::control(SessionInfo::gone(session_id)));
        };

        // A fresh Init supersedes whatever we had with this peer.
        let replaced = self.sessions.delete_all(self.own(), peer.as_str()).await?;
        let (session, ephemeral_public_key) = DhSession::respond(
            session_id,
            self.own(),
            peer.as_str(),
            sender_key,
            peer_ephemeral,
            self.crypto.as_ref(),
            version,
        )
        .map_err(|e| ProcessError::fs_reject(format!("init: {e}")))?;
        self.sessions.store_session(&session).await?;

        self.send(
            peer,
            session_id,
            FsFrame::Accept {
                version_range: self.config.versions,
                ephemeral_public_key,
            },
        )
        .await?;
        info!(%peer, session = %session.id_hex(), %version, replaced, "accepted forward security session");
        Ok(FsDecryptionResult::control(SessionInfo::of(&session)))
    }

    async fn handle_accept(
        &self,
        peer: &Identity,
        session_id: SessionId,
        offered: &VersionRange,
        peer_ephemeral: &[u8; 32],
    ) -> Result<FsDecryptionResult, ProcessError> {
        let Some(mut session) = self.sessions.session(self.own(), peer.as_str(), &session_id).await? else {
            warn!(%peer, session = %hex::encode(session_id), "accept for unknown session");
            self.send(peer, session_id, FsFrame::Terminate { cause: FsCause::UnknownSession })
                .await?;
            return Ok(FsDecryptionResult::control(SessionInfo::gone(session_id)));
        };

        if session.role() != SessionRole::Initiator || session.state() != FsState::L20 {
            debug!(%peer, state = %session.state(), role = ?session.role(), "stray accept ignored");
            return Ok(FsDecryptionResult::control(SessionInfo::of(&session)));
        }

        let Some(version) = self.config.versions.negotiate(offered) else {
            self.sessions.delete_session(self.own(), peer.as_str(), &session_id).await?;
            self.send(peer, session_id, FsFrame::Terminate { cause: FsCause::Reset }).await?;
            return Ok(FsDecryptionResult::control(SessionInfo::gone(session_id)));
        };

        session
            .process_accept(peer_ephemeral, self.crypto.as_ref(), version)
            .map_err(|e| ProcessError::fs_reject(format!("accept: {e}")))?;
        self.sessions.store_session(&session).await?;
        info!(%peer, session = %session.id_hex(), %version, "forward security session established");
        Ok(FsDecryptionResult::control(SessionInfo::of(&session)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_encapsulated(
        &self,
        outer: &AbstractMessage,
        sender_key: &[u8; 32],
        session_id: SessionId,
        dh_type: DhType,
        counter: u64,
        applied_version: FsVersion,
        group_identity: Option<&GroupIdentity>,
        ciphertext: &[u8],
    ) -> Result<FsDecryptionResult, ProcessError> {
        let peer = outer.from_identity;
        let Some(stored) = self.sessions.session(self.own(), peer.as_str(), &session_id).await? else {
            return self
                .reject(&peer, session_id, outer.message_id, FsCause::UnknownSession, "unknown session")
                .await;
        };

        if !stored.is_bound_to(sender_key) {
            self.sessions.delete_session(self.own(), peer.as_str(), &session_id).await?;
            return self
                .reject(&peer, session_id, outer.message_id, FsCause::StateMismatch, "peer key changed")
                .await;
        }

        if !self.config.versions.contains(applied_version) {
            return self
                .drop_and_reject(&peer, session_id, outer.message_id, &format!("unsupported version {applied_version}"))
                .await;
        }

        if dh_type == DhType::FourDH && stored.role() == SessionRole::Initiator && stored.state() == FsState::L20 {
            // The peer already has our Init; its Accept is probably queued behind this message.
            return Err(ProcessError::fs_transient("4DH message before accept"));
        }

        let mut session = stored.clone();
        let plaintext = match session.decrypt(dh_type, counter, ciphertext, self.config.max_skip) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                return self
                    .drop_and_reject(&peer, session_id, outer.message_id, &format!("decrypt: {e}"))
                    .await;
            }
        };

        let inner = match decode_inner(outer, &plaintext, group_identity) {
            Ok(inner) => inner,
            Err(reason) => {
                // The frame decrypted, so its counter is spent either way.
                self.commit(&session).await?;
                return Err(ProcessError::BadMessageFormat {
                    sender: peer.to_string(),
                    reason,
                });
            }
        };

        Ok(FsDecryptionResult {
            inner: Some(inner),
            session: SessionInfo::of(&session),
            pending: Some(session),
        })
    }

    /// Store a session advanced by [`FsProcessor::process_envelope`].
    pub async fn commit(&self, session: &DhSession) -> Result<(), ProcessError> {
        let previous = self
            .sessions
            .session(self.own(), &session.peer_identity, session.id())
            .await?;
        self.sessions.store_session(session).await?;
        if previous.is_some_and(|p| p.state() != session.state()) {
            info!(
                peer = %session.peer_identity,
                session = %session.id_hex(),
                state = %session.state(),
                "forward security session upgraded"
            );
        }
        Ok(())
    }

    /// Start a session with `peer`. Returns the `Init` envelope to send.
    pub async fn initiate_session(&self, peer: &Identity, peer_key: &[u8; 32]) -> Result<FsEnvelope, ProcessError> {
        let (session, ephemeral_public_key) = DhSession::initiate(
            self.own(),
            peer.as_str(),
            peer_key,
            self.crypto.as_ref(),
            self.config.versions.max,
        )
        .map_err(|e| ProcessError::fs_reject(format!("initiate: {e}")))?;
        self.sessions.store_session(&session).await?;
        info!(%peer, session = %session.id_hex(), "initiated forward security session");
        Ok(FsEnvelope {
            session_id: *session.id(),
            frame: FsFrame::Init {
                version_range: self.config.versions,
                ephemeral_public_key,
            },
        })
    }

    /// Wrap `message` for `peer` in the best available session.
    pub async fn encapsulate(&self, peer: &Identity, message: &AbstractMessage) -> Result<FsEnvelope, ProcessError> {
        if matches!(message.body, MessageBody::ForwardSecurity(_)) {
            return Err(ProcessError::BadMessageFormat {
                sender: self.own_identity.to_string(),
                reason: "refusing to encapsulate a forward security envelope".into(),
            });
        }
        let Some(mut session) = self.sessions.best_session(self.own(), peer.as_str()).await? else {
            return Err(ProcessError::fs_reject(format!("no session with {peer}")));
        };

        let (type_byte, body) = encode_body(&message.body).map_err(|e| ProcessError::BadMessageFormat {
            sender: self.own_identity.to_string(),
            reason: e.to_string(),
        })?;
        let (dh_type, counter, ciphertext) = session
            .encrypt(&encode_for_wire(type_byte, &body))
            .map_err(|e| ProcessError::fs_reject(format!("encrypt: {e}")))?;
        self.sessions.store_session(&session).await?;

        Ok(FsEnvelope {
            session_id: *session.id(),
            frame: FsFrame::Encapsulated {
                dh_type,
                counter,
                offered_version: self.config.versions.max,
                applied_version: session.version(),
                group_identity: message.group_identity(),
                ciphertext,
            },
        })
    }

    /// True when `sender` has an established session but sent `message`
    /// without forward security.
    pub async fn check_downgrade(&self, sender: &Identity, message: &AbstractMessage) -> Result<bool, ProcessError> {
        if !self.config.enabled || message.allows_without_fs() {
            return Ok(false);
        }
        let best = self.sessions.best_session(self.own(), sender.as_str()).await?;
        Ok(best.is_some_and(|s| s.state() == FsState::L40))
    }

    pub async fn session_info(&self, peer: &Identity) -> Result<Option<SessionInfo>, ProcessError> {
        let best = self.sessions.best_session(self.own(), peer.as_str()).await?;
        Ok(best.as_ref().map(SessionInfo::of))
    }

    fn own(&self) -> &str {
        self.own_identity.as_str()
    }

    async fn drop_and_reject(
        &self,
        peer: &Identity,
        session_id: SessionId,
        message_id: MessageId,
        reason: &str,
    ) -> Result<FsDecryptionResult, ProcessError> {
        self.sessions.delete_session(self.own(), peer.as_str(), &session_id).await?;
        self.reject(peer, session_id, message_id, FsCause::StateMismatch, reason).await
    }

    async fn reject(
        &self,
        peer: &Identity,
        session_id: SessionId,
        message_id: MessageId,
        cause: FsCause,
        reason: &str,
    ) -> Result<FsDecryptionResult, ProcessError> {
        warn!(%peer, session = %hex::encode(session_id), %message_id, ?cause, reason, "rejecting forward security message");
        self.send_reject(peer, session_id, message_id, cause).await?;
        Err(ProcessError::fs_reject(reason))
    }

    async fn send_reject(
        &self,
        peer: &Identity,
        session_id: SessionId,
        rejected_message_id: MessageId,
        cause: FsCause,
    ) -> Result<(), ProcessError> {
        self.send(
            peer,
            session_id,
            FsFrame::Reject {
                rejected_message_id,
                cause,
            },
        )
        .await
    }

    async fn send(&self, peer: &Identity, session_id: SessionId, frame: FsFrame) -> Result<(), ProcessError> {
        let envelope = FsEnvelope { session_id, frame };
        self.sender
            .send_envelope(peer, envelope)
            .await
            .map_err(|e| ProcessError::fs_transient(format!("sending to {peer}: {e}")))
    }
}

fn decode_inner(
    outer: &AbstractMessage,
    plaintext: &[u8],
    group_identity: Option<&GroupIdentity>,
) -> Result<AbstractMessage, String> {
    let (type_byte, body) = decode_from_wire(plaintext).map_err(|e| format!("inner: {e}"))?;
    let body = decode_body(type_byte, body).map_err(|e| format!("inner: {e}"))?;
    let inner = AbstractMessage {
        body,
        ..outer.clone()
    };
    if inner.group_identity().as_ref() != group_identity {
        return Err("group identity of envelope and message differ".into());
    }
    Ok(inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use async_trait::async_trait;
    use chrono::Utc;
    use im_crypto::X25519Box;
    use im_proto::MessageFlags;
    use im_store::MemorySessionStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<(Identity, FsEnvelope)>>);

    impl Outbox {
        fn take(&self) -> Vec<(Identity, FsEnvelope)> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    #[async_trait]
    impl FsMessageSender for Outbox {
        async fn send_envelope(&self, to: &Identity, envelope: FsEnvelope) -> Result<(), HandlerError> {
            self.0.lock().push((*to, envelope));
            Ok(())
        }
    }

    struct Party {
        id: Identity,
        key: [u8; 32],
        fs: FsProcessor,
        outbox: Arc<Outbox>,
        sessions: Arc<MemorySessionStore>,
    }

    fn party(name: &str, config: FsConfig) -> Party {
        let id: Identity = name.parse().unwrap();
        let crypto = Arc::new(X25519Box::generate());
        let key = crypto.public_key();
        let outbox = Arc::new(Outbox::default());
        let sessions = Arc::new(MemorySessionStore::new());
        let fs = FsProcessor::new(id, crypto, sessions.clone(), outbox.clone(), config);
        Party {
            id,
            key,
            fs,
            outbox,
            sessions,
        }
    }

    fn message(from: &Party, to: &Party, body: MessageBody) -> AbstractMessage {
        AbstractMessage {
            message_id: MessageId::random(),
            from_identity: from.id,
            to_identity: to.id,
            date: Utc::now(),
            flags: MessageFlags::default(),
            push_from_name: None,
            body,
        }
    }

    fn carrier(from: &Party, to: &Party, envelope: &FsEnvelope) -> AbstractMessage {
        message(from, to, MessageBody::ForwardSecurity(envelope.clone()))
    }

    fn text(from: &Party, to: &Party, body: &str) -> AbstractMessage {
        message(from, to, MessageBody::Text { text: body.into() })
    }

    /// Process and commit, as the router does for a settled message.
    async fn deliver(from: &Party, to: &Party, envelope: &FsEnvelope) -> Result<FsDecryptionResult, ProcessError> {
        let result = to.fs.process_envelope(&carrier(from, to, envelope), &from.key, envelope).await?;
        if let Some(session) = &result.pending {
            to.fs.commit(session).await?;
        }
        Ok(result)
    }

    /// Alice initiates, Bob accepts. Returns the Accept envelope (not yet delivered).
    async fn handshake(alice: &Party, bob: &Party) -> FsEnvelope {
        let init = alice.fs.initiate_session(&bob.id, &bob.key).await.unwrap();
        let result = deliver(alice, bob, &init).await.unwrap();
        assert!(result.inner.is_none());
        assert_eq!(result.session.state, FsState::L20);
        assert_eq!(result.session.role, Some(SessionRole::Responder));

        let mut sent = bob.outbox.take();
        assert_eq!(sent.len(), 1);
        let (to, accept) = sent.remove(0);
        assert_eq!(to, alice.id);
        assert!(matches!(accept.frame, FsFrame::Accept { .. }));
        accept
    }

    #[tokio::test]
    async fn full_session_lifecycle() {
        let alice = party("ALICE001", FsConfig::default());
        let bob = party("BOB00001", FsConfig::default());
        let accept = handshake(&alice, &bob).await;

        // 2DH message before Alice has seen the Accept.
        let early = alice.fs.encapsulate(&bob.id, &text(&alice, &bob, "early")).await.unwrap();
        assert!(matches!(early.frame, FsFrame::Encapsulated { dh_type: DhType::TwoDH, .. }));
        let got = deliver(&alice, &bob, &early).await.unwrap();
        assert_eq!(got.inner.unwrap().body, MessageBody::Text { text: "early".into() });

        let result = deliver(&bob, &alice, &accept).await.unwrap();
        assert_eq!(result.session.state, FsState::L40);

        let late = alice.fs.encapsulate(&bob.id, &text(&alice, &bob, "late")).await.unwrap();
        assert!(matches!(late.frame, FsFrame::Encapsulated { dh_type: DhType::FourDH, .. }));
        let got = deliver(&alice, &bob, &late).await.unwrap();
        assert_eq!(got.session.state, FsState::L40);
        assert_eq!(got.inner.unwrap().body, MessageBody::Text { text: "late".into() });

        let reply = bob.fs.encapsulate(&alice.id, &text(&bob, &alice, "reply")).await.unwrap();
        let got = deliver(&bob, &alice, &reply).await.unwrap();
        assert_eq!(got.inner.unwrap().body, MessageBody::Text { text: "reply".into() });
    }

    #[tokio::test]
    async fn four_dh_before_accept_is_transient() {
        let alice = party("ALICE001", FsConfig::default());
        let bob = party("BOB00001", FsConfig::default());
        let accept = handshake(&alice, &bob).await;

        let from_bob = bob.fs.encapsulate(&alice.id, &text(&bob, &alice, "hi")).await.unwrap();
        let err = deliver(&bob, &alice, &from_bob).await.unwrap_err();
        assert!(matches!(err, ProcessError::ForwardSecurityTransient { .. }));
        assert!(alice.outbox.take().is_empty());

        // Redelivered after the Accept it decrypts.
        deliver(&bob, &alice, &accept).await.unwrap();
        let got = deliver(&bob, &alice, &from_bob).await.unwrap();
        assert_eq!(got.inner.unwrap().body, MessageBody::Text { text: "hi".into() });
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let alice = party("ALICE001", FsConfig::default());
        let bob = party("BOB00001", FsConfig::default());
        handshake(&alice, &bob).await;
        let msg = alice.fs.encapsulate(&bob.id, &text(&alice, &bob, "x")).await.unwrap();
        bob.sessions.delete_all(bob.id.as_str(), alice.id.as_str()).await.unwrap();

        let err = deliver(&alice, &bob, &msg).await.unwrap_err();
        assert!(matches!(err, ProcessError::ForwardSecurityReject { .. }));
        let sent = bob.outbox.take();
        assert!(matches!(
            sent[0].1.frame,
            FsFrame::Reject {
                cause: FsCause::UnknownSession,
                ..
            }
        ));

        // Alice drops her side on the Reject.
        let reject = &sent[0].1;
        let result = deliver(&bob, &alice, reject).await.unwrap();
        assert_eq!(result.session.state, FsState::NoSession);
        assert!(alice.fs.session_info(&bob.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replayed_counter_is_rejected_without_touching_state() {
        let alice = party("ALICE001", FsConfig::default());
        let bob = party("BOB00001", FsConfig::default());
        handshake(&alice, &bob).await;
        let first = alice.fs.encapsulate(&bob.id, &text(&alice, &bob, "one")).await.unwrap();
        deliver(&alice, &bob, &first).await.unwrap();

        let err = deliver(&alice, &bob, &first).await.unwrap_err();
        assert!(matches!(err, ProcessError::ForwardSecurityReject { .. }));
        assert!(bob.fs.session_info(&alice.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn uncommitted_decrypt_leaves_stored_session_alone() {
        let alice = party("ALICE001", FsConfig::default());
        let bob = party("BOB00001", FsConfig::default());
        handshake(&alice, &bob).await;
        let msg = alice.fs.encapsulate(&bob.id, &text(&alice, &bob, "again")).await.unwrap();

        let first = bob
            .fs
            .process_envelope(&carrier(&alice, &bob, &msg), &alice.key, &msg)
            .await
            .unwrap();
        assert!(first.pending.is_some());

        // Not committed: the same frame decrypts a second time.
        let second = deliver(&alice, &bob, &msg).await.unwrap();
        assert_eq!(second.inner.unwrap().body, MessageBody::Text { text: "again".into() });
        assert!(bob.outbox.take().is_empty());

        // Committed: now it is a replay.
        assert!(deliver(&alice, &bob, &msg).await.is_err());
    }

    #[tokio::test]
    async fn counter_jump_beyond_limit_is_rejected() {
        let config = FsConfig {
            max_skip: 2,
            ..FsConfig::default()
        };
        let alice = party("ALICE001", FsConfig::default());
        let bob = party("BOB00001", config);
        handshake(&alice, &bob).await;
        for _ in 0..3 {
            alice.fs.encapsulate(&bob.id, &text(&alice, &bob, "lost")).await.unwrap();
        }
        let far = alice.fs.encapsulate(&bob.id, &text(&alice, &bob, "far")).await.unwrap();
        assert!(matches!(
            deliver(&alice, &bob, &far).await,
            Err(ProcessError::ForwardSecurityReject { .. })
        ));
    }

    #[tokio::test]
    async fn disabled_host_rejects_every_envelope() {
        let alice = party("ALICE001", FsConfig::default());
        let bob = party(
            "BOB00001",
            FsConfig {
                enabled: false,
                ..FsConfig::default()
            },
        );
        let init = alice.fs.initiate_session(&bob.id, &bob.key).await.unwrap();
        let result = deliver(&alice, &bob, &init).await.unwrap();
        assert!(result.inner.is_none());
        let sent = bob.outbox.take();
        assert!(matches!(
            sent[0].1.frame,
            FsFrame::Reject {
                cause: FsCause::DisabledByLocal,
                ..
            }
        ));

        let msg = alice.fs.encapsulate(&bob.id, &text(&alice, &bob, "x")).await.unwrap();
        assert!(deliver(&alice, &bob, &msg).await.is_err());
        assert_eq!(bob.outbox.take().len(), 1);

        let terminate = FsEnvelope {
            session_id: init.session_id,
            frame: FsFrame::Terminate { cause: FsCause::Reset },
        };
        deliver(&alice, &bob, &terminate).await.unwrap();
        assert!(bob.outbox.take().is_empty());
    }

    #[tokio::test]
    async fn new_init_replaces_existing_session() {
        let alice = party("ALICE001", FsConfig::default());
        let bob = party("BOB00001", FsConfig::default());
        handshake(&alice, &bob).await;
        let first = bob.fs.session_info(&alice.id).await.unwrap().unwrap();
        handshake(&alice, &bob).await;
        let second = bob.fs.session_info(&alice.id).await.unwrap().unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert!(bob
            .sessions
            .session(bob.id.as_str(), alice.id.as_str(), &first.session_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn nested_envelope_is_never_encapsulated() {
        let alice = party("ALICE001", FsConfig::default());
        let bob = party("BOB00001", FsConfig::default());
        handshake(&alice, &bob).await;
        let envelope = FsEnvelope {
            session_id: [1; 16],
            frame: FsFrame::Terminate { cause: FsCause::Reset },
        };
        let err = alice.fs.encapsulate(&bob.id, &carrier(&alice, &bob, &envelope)).await.unwrap_err();
        assert!(matches!(err, ProcessError::BadMessageFormat { .. }));
    }

    #[tokio::test]
    async fn downgrade_only_reported_for_established_sessions() {
        let alice = party("ALICE001", FsConfig::default());
        let bob = party("BOB00001", FsConfig::default());
        let plain = text(&alice, &bob, "plain");
        assert!(!bob.fs.check_downgrade(&alice.id, &plain).await.unwrap());

        let accept = handshake(&alice, &bob).await;
        // L20 on Bob's side until a 4DH frame arrives.
        assert!(!bob.fs.check_downgrade(&alice.id, &plain).await.unwrap());

        deliver(&bob, &alice, &accept).await.unwrap();
        let msg = alice.fs.encapsulate(&bob.id, &text(&alice, &bob, "x")).await.unwrap();
        deliver(&alice, &bob, &msg).await.unwrap();
        assert!(bob.fs.check_downgrade(&alice.id, &plain).await.unwrap());

        let empty = message(&alice, &bob, MessageBody::Empty);
        assert!(!bob.fs.check_downgrade(&alice.id, &empty).await.unwrap());
    }
}
