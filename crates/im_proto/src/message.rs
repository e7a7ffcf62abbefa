//! Decoded (abstract) messages.
//!
//! `AbstractMessage` is the common header every message carries;
//! `MessageBody` holds the type-specific payload, one variant per wire type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MessageFlags, MessageType, ReceiptType, NONCE_LEN};
use crate::fs_frame::FsEnvelope;
use crate::ids::{BallotId, BlobId, GroupId, GroupIdentity, Identity, MessageId};

/// Blob reference with its symmetric key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub blob_id: BlobId,
    pub size: u32,
    #[serde(with = "hex_bytes")]
    pub key: [u8; 32],
}

/// Legacy image: the blob is encrypted with the crypto box, hence the nonce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub blob_id: BlobId,
    pub size: u32,
    #[serde(with = "hex_bytes")]
    pub nonce: [u8; NONCE_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoPayload {
    pub duration_secs: u16,
    pub video_blob_id: BlobId,
    pub video_size: u32,
    pub thumbnail_blob_id: BlobId,
    pub thumbnail_size: u32,
    #[serde(with = "hex_bytes")]
    pub key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPayload {
    pub duration_secs: u16,
    pub blob_id: BlobId,
    pub size: u32,
    #[serde(with = "hex_bytes")]
    pub key: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPayload {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poi_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poi_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub sdp_type: String,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoipCallOffer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u32>,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoipCallAnswer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u32>,
    /// 0 = reject, 1 = accept.
    pub action: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ufrag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoipIceCandidates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u32>,
    #[serde(default)]
    pub removed: bool,
    pub candidates: Vec<IceCandidate>,
}

/// Hangup and ringing carry only the call id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoipCallRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionAction {
    Apply,
    Withdraw,
}

impl ReactionAction {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Apply),
            1 => Some(Self::Withdraw),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Apply => 0,
            Self::Withdraw => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text { text: String },
    Image(ImagePayload),
    Location(LocationPayload),
    Video(VideoPayload),
    Audio(AudioPayload),
    BallotCreate { ballot_id: BallotId, ballot: serde_json::Value },
    BallotVote { ballot_creator: Identity, ballot_id: BallotId, votes: serde_json::Value },
    File { file: serde_json::Value },
    ContactSetPhoto(BlobRef),
    ContactDeletePhoto,
    ContactRequestPhoto,

    GroupText { group: GroupIdentity, text: String },
    GroupLocation { group: GroupIdentity, location: LocationPayload },
    GroupImage { group: GroupIdentity, image: BlobRef },
    GroupVideo { group: GroupIdentity, video: VideoPayload },
    GroupAudio { group: GroupIdentity, audio: AudioPayload },
    GroupFile { group: GroupIdentity, file: serde_json::Value },
    /// Creator is the sender.
    GroupCreate { group_id: GroupId, members: Vec<Identity> },
    GroupRename { group_id: GroupId, name: String },
    GroupLeave { group: GroupIdentity },
    GroupCallStart { group: GroupIdentity, call: serde_json::Value },
    GroupSetPhoto { group_id: GroupId, photo: BlobRef },
    /// Sent to the creator, so the creator is the receiver.
    GroupRequestSync { group_id: GroupId },
    GroupBallotCreate { group: GroupIdentity, ballot_id: BallotId, ballot: serde_json::Value },
    GroupBallotVote {
        group: GroupIdentity,
        ballot_creator: Identity,
        ballot_id: BallotId,
        votes: serde_json::Value,
    },
    GroupDeletePhoto { group_id: GroupId },

    VoipCallOffer(VoipCallOffer),
    VoipCallAnswer(VoipCallAnswer),
    VoipCallIceCandidate(VoipIceCandidates),
    VoipCallHangup(VoipCallRef),
    VoipCallRinging(VoipCallRef),

    DeliveryReceipt { receipt_type: ReceiptType, message_ids: Vec<MessageId> },
    GroupDeliveryReceipt {
        group: GroupIdentity,
        receipt_type: ReceiptType,
        message_ids: Vec<MessageId>,
    },
    Reaction { message_id: MessageId, action: ReactionAction, emoji: String },
    GroupReaction {
        group: GroupIdentity,
        message_id: MessageId,
        action: ReactionAction,
        emoji: String,
    },
    TypingIndicator { typing: bool },
    Edit { message_id: MessageId, text: String },
    Delete { message_id: MessageId },
    GroupEdit { group: GroupIdentity, message_id: MessageId, text: String },
    GroupDelete { group: GroupIdentity, message_id: MessageId },

    ForwardSecurity(FsEnvelope),
    Empty,
    AuthToken { token: String },

    /// Type byte we do not know. Kept so the router can report it.
    Unknown {
        type_byte: u8,
        #[serde(with = "hex_vec")]
        body: Vec<u8>,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> Option<MessageType> {
        use MessageBody as B;
        use MessageType as T;
        Some(match self {
            B::Text { .. } => T::Text,
            B::Image(_) => T::Image,
            B::Location(_) => T::Location,
            B::Video(_) => T::Video,
            B::Audio(_) => T::Audio,
            B::BallotCreate { .. } => T::BallotCreate,
            B::BallotVote { .. } => T::BallotVote,
            B::File { .. } => T::File,
            B::ContactSetPhoto(_) => T::ContactSetPhoto,
            B::ContactDeletePhoto => T::ContactDeletePhoto,
            B::ContactRequestPhoto => T::ContactRequestPhoto,
            B::GroupText { .. } => T::GroupText,
            B::GroupLocation { .. } => T::GroupLocation,
            B::GroupImage { .. } => T::GroupImage,
            B::GroupVideo { .. } => T::GroupVideo,
            B::GroupAudio { .. } => T::GroupAudio,
            B::GroupFile { .. } => T::GroupFile,
            B::GroupCreate { .. } => T::GroupCreate,
            B::GroupRename { .. } => T::GroupRename,
            B::GroupLeave { .. } => T::GroupLeave,
            B::GroupCallStart { .. } => T::GroupCallStart,
            B::GroupSetPhoto { .. } => T::GroupSetPhoto,
            B::GroupRequestSync { .. } => T::GroupRequestSync,
            B::GroupBallotCreate { .. } => T::GroupBallotCreate,
            B::GroupBallotVote { .. } => T::GroupBallotVote,
            B::GroupDeletePhoto { .. } => T::GroupDeletePhoto,
            B::VoipCallOffer(_) => T::VoipCallOffer,
            B::VoipCallAnswer(_) => T::VoipCallAnswer,
            B::VoipCallIceCandidate(_) => T::VoipCallIceCandidate,
            B::VoipCallHangup(_) => T::VoipCallHangup,
            B::VoipCallRinging(_) => T::VoipCallRinging,
            B::DeliveryReceipt { .. } => T::DeliveryReceipt,
            B::GroupDeliveryReceipt { .. } => T::GroupDeliveryReceipt,
            B::Reaction { .. } => T::Reaction,
            B::GroupReaction { .. } => T::GroupReaction,
            B::TypingIndicator { .. } => T::TypingIndicator,
            B::Edit { .. } => T::Edit,
            B::Delete { .. } => T::Delete,
            B::GroupEdit { .. } => T::GroupEdit,
            B::GroupDelete { .. } => T::GroupDelete,
            B::ForwardSecurity(_) => T::ForwardSecurity,
            B::Empty => T::Empty,
            B::AuthToken { .. } => T::AuthToken,
            B::Unknown { .. } => return None,
        })
    }

    /// The wire type byte, including for unknown messages.
    pub fn type_byte(&self) -> u8 {
        match self {
            MessageBody::Unknown { type_byte, .. } => *type_byte,
            other => other.message_type().map(|t| t as u8).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbstractMessage {
    pub message_id: MessageId,
    pub from_identity: Identity,
    pub to_identity: Identity,
    pub date: DateTime<Utc>,
    pub flags: MessageFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_from_name: Option<String>,
    pub body: MessageBody,
}

impl AbstractMessage {
    pub fn type_byte(&self) -> u8 {
        self.body.type_byte()
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.body.message_type()
    }

    pub fn flag(&self, bit: u8) -> bool {
        self.flags.contains(bit)
    }

    /// The group this message belongs to, if any.
    pub fn group_identity(&self) -> Option<GroupIdentity> {
        use MessageBody as B;
        match &self.body {
            B::GroupText { group, .. }
            | B::GroupLocation { group, .. }
            | B::GroupImage { group, .. }
            | B::GroupVideo { group, .. }
            | B::GroupAudio { group, .. }
            | B::GroupFile { group, .. }
            | B::GroupLeave { group }
            | B::GroupCallStart { group, .. }
            | B::GroupBallotCreate { group, .. }
            | B::GroupBallotVote { group, .. }
            | B::GroupDeliveryReceipt { group, .. }
            | B::GroupReaction { group, .. }
            | B::GroupEdit { group, .. }
            | B::GroupDelete { group, .. } => Some(*group),
            B::GroupCreate { group_id, .. }
            | B::GroupRename { group_id, .. }
            | B::GroupSetPhoto { group_id, .. }
            | B::GroupDeletePhoto { group_id } => Some(GroupIdentity {
                id: *group_id,
                creator: self.from_identity,
            }),
            B::GroupRequestSync { group_id } => Some(GroupIdentity {
                id: *group_id,
                creator: self.to_identity,
            }),
            _ => None,
        }
    }

    pub fn is_group(&self) -> bool {
        self.group_identity().is_some()
    }

    /// Group membership and metadata changes.
    pub fn is_group_control(&self) -> bool {
        matches!(
            self.body,
            MessageBody::GroupCreate { .. }
                | MessageBody::GroupRename { .. }
                | MessageBody::GroupLeave { .. }
                | MessageBody::GroupSetPhoto { .. }
                | MessageBody::GroupDeletePhoto { .. }
                | MessageBody::GroupRequestSync { .. }
        )
    }

    /// Message kinds a peer may legitimately send outside a forward-security
    /// session even when one is established.
    pub fn allows_without_fs(&self) -> bool {
        self.is_group()
            || matches!(
                self.body,
                MessageBody::ForwardSecurity(_)
                    | MessageBody::Empty
                    | MessageBody::AuthToken { .. }
                    | MessageBody::Unknown { .. }
            )
    }

    pub fn needs_blob_download(&self) -> bool {
        matches!(
            self.body,
            MessageBody::Image(_)
                | MessageBody::Video(_)
                | MessageBody::Audio(_)
                | MessageBody::File { .. }
                | MessageBody::ContactSetPhoto(_)
                | MessageBody::GroupImage { .. }
                | MessageBody::GroupVideo { .. }
                | MessageBody::GroupAudio { .. }
                | MessageBody::GroupFile { .. }
                | MessageBody::GroupSetPhoto { .. }
        )
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(v: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {N} bytes")))
    }
}

mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(body: MessageBody) -> AbstractMessage {
        AbstractMessage {
            message_id: MessageId([1; 8]),
            from_identity: "SENDER01".parse().unwrap(),
            to_identity: "RECEIVER".parse().unwrap(),
            date: Utc::now(),
            flags: MessageFlags::default(),
            push_from_name: None,
            body,
        }
    }

    #[test]
    fn group_creator_depends_on_kind() {
        let create = msg(MessageBody::GroupCreate {
            group_id: GroupId([2; 8]),
            members: vec![],
        });
        assert_eq!(create.group_identity().unwrap().creator.as_str(), "SENDER01");
        assert!(create.is_group_control());

        let sync = msg(MessageBody::GroupRequestSync { group_id: GroupId([2; 8]) });
        assert_eq!(sync.group_identity().unwrap().creator.as_str(), "RECEIVER");
    }

    #[test]
    fn unknown_keeps_type_byte() {
        let m = msg(MessageBody::Unknown {
            type_byte: 0x77,
            body: vec![],
        });
        assert_eq!(m.type_byte(), 0x77);
        assert_eq!(m.message_type(), None);
        assert!(!m.is_group());
    }

    #[test]
    fn text_is_fs_eligible() {
        let m = msg(MessageBody::Text { text: "hi".into() });
        assert_eq!(m.type_byte(), 0x01);
        assert!(!m.allows_without_fs());
        assert!(!m.needs_blob_download());
    }

    #[test]
    fn json_shape_is_tagged() {
        let v = serde_json::to_value(MessageBody::TypingIndicator { typing: true }).unwrap();
        assert_eq!(v["type"], "typing_indicator");
        assert_eq!(v["typing"], true);
    }
}
