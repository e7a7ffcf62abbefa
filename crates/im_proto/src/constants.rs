//! Wire constants: field lengths, message type bytes, flag bits, receipt types.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const IDENTITY_LEN: usize = 8;
pub const MESSAGE_ID_LEN: usize = 8;
pub const NONCE_LEN: usize = 24;
pub const PUSH_FROM_NAME_LEN: usize = 32;
pub const BLOB_ID_LEN: usize = 16;
pub const BLOB_KEY_LEN: usize = 32;
pub const GROUP_ID_LEN: usize = 8;
pub const BALLOT_ID_LEN: usize = 8;

/// Text message size limit in bytes (not characters).
pub const MAX_MESSAGE_LEN: usize = 7000;
pub const MAX_CAPTION_LEN: usize = 1000;
pub const MAX_PACKET_LEN: usize = 8192;
pub const MIN_MESSAGE_PADDED_LEN: usize = 32;
pub const MAX_GROUP_NAME_LEN: usize = 256;

macro_rules! message_types {
    ($( $(#[$meta:meta])* $variant:ident = $byte:literal, $name:literal; )*) => {
        /// Message type byte, first byte of every decrypted body.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum MessageType {
            $( $(#[$meta])* $variant = $byte, )*
        }

        impl MessageType {
            pub const ALL: &'static [MessageType] = &[ $( MessageType::$variant, )* ];

            pub fn from_byte(b: u8) -> Option<Self> {
                match b {
                    $( $byte => Some(MessageType::$variant), )*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( MessageType::$variant => $name, )*
                }
            }
        }
    };
}

message_types! {
    Text = 0x01, "text";
    Image = 0x02, "image";
    Location = 0x10, "location";
    Video = 0x13, "video";
    Audio = 0x14, "audio";
    BallotCreate = 0x15, "ballot-create";
    BallotVote = 0x16, "ballot-vote";
    File = 0x17, "file";
    ContactSetPhoto = 0x18, "contact-set-photo";
    ContactDeletePhoto = 0x19, "contact-delete-photo";
    ContactRequestPhoto = 0x1a, "contact-request-photo";
    GroupText = 0x41, "group-text";
    GroupLocation = 0x42, "group-location";
    GroupImage = 0x43, "group-image";
    GroupVideo = 0x44, "group-video";
    GroupAudio = 0x45, "group-audio";
    GroupFile = 0x46, "group-file";
    GroupCreate = 0x4a, "group-create";
    GroupRename = 0x4b, "group-rename";
    GroupLeave = 0x4c, "group-leave";
    GroupCallStart = 0x4f, "group-call-start";
    GroupSetPhoto = 0x50, "group-set-photo";
    GroupRequestSync = 0x51, "group-request-sync";
    GroupBallotCreate = 0x52, "group-ballot-create";
    GroupBallotVote = 0x53, "group-ballot-vote";
    GroupDeletePhoto = 0x54, "group-delete-photo";
    VoipCallOffer = 0x60, "voip-call-offer";
    VoipCallAnswer = 0x61, "voip-call-answer";
    VoipCallIceCandidate = 0x62, "voip-call-ice-candidate";
    VoipCallHangup = 0x63, "voip-call-hangup";
    VoipCallRinging = 0x64, "voip-call-ringing";
    DeliveryReceipt = 0x80, "delivery-receipt";
    GroupDeliveryReceipt = 0x81, "group-delivery-receipt";
    Reaction = 0x82, "reaction";
    GroupReaction = 0x83, "group-reaction";
    TypingIndicator = 0x90, "typing-indicator";
    Edit = 0x91, "edit";
    Delete = 0x92, "delete";
    GroupEdit = 0x93, "group-edit";
    GroupDelete = 0x94, "group-delete";
    ForwardSecurity = 0xa0, "forward-security";
    Empty = 0xfc, "empty";
    AuthToken = 0xff, "auth-token";
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02x})", self.name(), *self as u8)
    }
}

/// Message flag bitmask carried by the boxed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MessageFlags(pub u8);

impl MessageFlags {
    pub const SEND_PUSH: u8 = 0x01;
    pub const DONT_QUEUE: u8 = 0x02;
    pub const DONT_ACK: u8 = 0x04;
    pub const GROUP: u8 = 0x10;
    pub const IMMEDIATE_DELIVERY: u8 = 0x20;
    /// Only ever set by the server.
    pub const NO_DELIVERY_RECEIPT: u8 = 0x80;

    pub fn contains(self, bit: u8) -> bool {
        self.0 & bit == bit
    }

    pub fn send_push(self) -> bool {
        self.contains(Self::SEND_PUSH)
    }

    pub fn dont_ack(self) -> bool {
        self.contains(Self::DONT_ACK)
    }

    pub fn group(self) -> bool {
        self.contains(Self::GROUP)
    }

    pub fn immediate_delivery(self) -> bool {
        self.contains(Self::IMMEDIATE_DELIVERY)
    }

    pub fn no_delivery_receipt(self) -> bool {
        self.contains(Self::NO_DELIVERY_RECEIPT)
    }

    /// Human-readable names of the set bits.
    pub fn names(self) -> Vec<&'static str> {
        [
            (Self::SEND_PUSH, "send-push"),
            (Self::DONT_QUEUE, "dont-queue"),
            (Self::DONT_ACK, "dont-ack"),
            (Self::GROUP, "group"),
            (Self::IMMEDIATE_DELIVERY, "immediate-delivery"),
            (Self::NO_DELIVERY_RECEIPT, "no-delivery-receipt"),
        ]
        .iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| *name)
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptType {
    Received,
    Read,
    UserAck,
    UserDecline,
    Consumed,
}

impl ReceiptType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Received),
            0x02 => Some(Self::Read),
            0x03 => Some(Self::UserAck),
            0x04 => Some(Self::UserDecline),
            0x05 => Some(Self::Consumed),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Self::Received => 0x01,
            Self::Read => 0x02,
            Self::UserAck => 0x03,
            Self::UserDecline => 0x04,
            Self::Consumed => 0x05,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bytes_roundtrip() {
        for t in MessageType::ALL {
            assert_eq!(MessageType::from_byte(*t as u8), Some(*t));
        }
        assert_eq!(MessageType::from_byte(0x03), None);
    }

    #[test]
    fn flag_names() {
        let f = MessageFlags(MessageFlags::SEND_PUSH | MessageFlags::GROUP);
        assert_eq!(f.names(), vec!["send-push", "group"]);
        assert!(f.group());
        assert!(!f.dont_ack());
    }
}
