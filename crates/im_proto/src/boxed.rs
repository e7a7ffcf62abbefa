//! The boxed message: what the transport hands us.
//!
//! Wire layout (little-endian integers):
//!
//! ```text
//!  0  from identity      8
//!  8  to identity        8
//! 16  message id         8
//! 24  date (unix secs)   u32
//! 28  flags              u8
//! 29  reserved           u8
//! 30  metadata length    u16
//! 32  push from name     32 (NUL padded UTF-8)
//! 64  metadata box       <metadata length>
//!     nonce              24
//!     box                rest
//! ```

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::constants::{MessageFlags, IDENTITY_LEN, MESSAGE_ID_LEN, NONCE_LEN, PUSH_FROM_NAME_LEN};
use crate::error::{need, DecodeError};
use crate::ids::{Identity, MessageId};

const HEADER_LEN: usize = 2 * IDENTITY_LEN + MESSAGE_ID_LEN + 4 + 1 + 1 + 2 + PUSH_FROM_NAME_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxedMessage {
    pub from_identity: Identity,
    pub to_identity: Identity,
    pub message_id: MessageId,
    pub date: DateTime<Utc>,
    pub flags: MessageFlags,
    pub push_from_name: Option<String>,
    pub metadata_box: Option<Vec<u8>>,
    pub nonce: [u8; NONCE_LEN],
    pub box_data: Vec<u8>,
}

impl BoxedMessage {
    pub fn from_wire(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = bytes;
        need(buf, HEADER_LEN, "boxed message header")?;

        let from_identity = Identity::from_bytes(&buf[..IDENTITY_LEN])?;
        buf.advance(IDENTITY_LEN);
        let to_identity = Identity::from_bytes(&buf[..IDENTITY_LEN])?;
        buf.advance(IDENTITY_LEN);
        let mut id = [0u8; MESSAGE_ID_LEN];
        buf.copy_to_slice(&mut id);
        let secs = buf.get_u32_le();
        let flags = MessageFlags(buf.get_u8());
        let _reserved = buf.get_u8();
        let metadata_len = buf.get_u16_le() as usize;

        let mut name = [0u8; PUSH_FROM_NAME_LEN];
        buf.copy_to_slice(&mut name);
        let name_end = name.iter().position(|&b| b == 0).unwrap_or(PUSH_FROM_NAME_LEN);
        let push_from_name = match &name[..name_end] {
            [] => None,
            n => Some(
                std::str::from_utf8(n)
                    .map_err(|_| DecodeError::InvalidUtf8("push from name"))?
                    .to_string(),
            ),
        };

        need(buf, metadata_len, "metadata box")?;
        let metadata_box = (metadata_len > 0).then(|| buf[..metadata_len].to_vec());
        buf.advance(metadata_len);

        need(buf, NONCE_LEN, "nonce")?;
        let mut nonce = [0u8; NONCE_LEN];
        buf.copy_to_slice(&mut nonce);

        if !buf.has_remaining() {
            return Err(DecodeError::Truncated {
                what: "box",
                need: 1,
                got: 0,
            });
        }
        let box_data = buf.to_vec();

        Ok(Self {
            from_identity,
            to_identity,
            message_id: MessageId(id),
            date: Utc
                .timestamp_opt(secs as i64, 0)
                .single()
                .unwrap_or_else(Utc::now),
            flags,
            push_from_name,
            metadata_box,
            nonce,
            box_data,
        })
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let metadata = self.metadata_box.as_deref().unwrap_or_default();
        let mut out = BytesMut::with_capacity(HEADER_LEN + metadata.len() + NONCE_LEN + self.box_data.len());
        out.put_slice(self.from_identity.as_bytes());
        out.put_slice(self.to_identity.as_bytes());
        out.put_slice(&self.message_id.0);
        out.put_u32_le(self.date.timestamp().clamp(0, u32::MAX as i64) as u32);
        out.put_u8(self.flags.0);
        out.put_u8(0);
        out.put_u16_le(metadata.len() as u16);

        let mut name = [0u8; PUSH_FROM_NAME_LEN];
        if let Some(n) = &self.push_from_name {
            let mut end = n.len().min(PUSH_FROM_NAME_LEN);
            while !n.is_char_boundary(end) {
                end -= 1;
            }
            name[..end].copy_from_slice(&n.as_bytes()[..end]);
        }
        out.put_slice(&name);
        out.put_slice(metadata);
        out.put_slice(&self.nonce);
        out.put_slice(&self.box_data);
        out.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BoxedMessage {
        BoxedMessage {
            from_identity: "ECHOECHO".parse().unwrap(),
            to_identity: "BOBBOB01".parse().unwrap(),
            message_id: MessageId([7; 8]),
            date: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            flags: MessageFlags(MessageFlags::SEND_PUSH),
            push_from_name: Some("Echo".into()),
            metadata_box: None,
            nonce: [9; 24],
            box_data: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn wire_layout_offsets() {
        let wire = sample().to_wire();
        assert_eq!(&wire[..8], b"ECHOECHO");
        assert_eq!(&wire[8..16], b"BOBBOB01");
        assert_eq!(wire[28], MessageFlags::SEND_PUSH);
        assert_eq!(&wire[64..88], &[9u8; 24]);
        assert_eq!(BoxedMessage::from_wire(&wire).unwrap(), sample());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let wire = sample().to_wire();
        assert!(BoxedMessage::from_wire(&wire[..40]).is_err());
        assert!(BoxedMessage::from_wire(&wire[..88]).is_err());
    }

    #[test]
    fn metadata_length_beyond_buffer_is_rejected() {
        let mut wire = sample().to_wire();
        wire[30] = 0xff;
        wire[31] = 0x00;
        assert!(matches!(
            BoxedMessage::from_wire(&wire),
            Err(DecodeError::Truncated { what: "metadata box", .. })
        ));
    }
}
