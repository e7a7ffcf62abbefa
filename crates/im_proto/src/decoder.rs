//! Type table: decrypted `(type, body)` ↔ [`MessageBody`].
//!
//! Group payloads prefix the body with the group creator (8) and group id
//! (8), except for the control messages that can only come from (or go to)
//! the creator, which carry the group id alone.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;

use crate::constants::{
    MessageType, ReceiptType, BALLOT_ID_LEN, BLOB_ID_LEN, BLOB_KEY_LEN, GROUP_ID_LEN, IDENTITY_LEN,
    MESSAGE_ID_LEN, NONCE_LEN,
};
use crate::error::{need, DecodeError};
use crate::fs_frame::FsEnvelope;
use crate::ids::{BallotId, BlobId, GroupId, GroupIdentity, Identity, MessageId};
use crate::message::{
    AudioPayload, BlobRef, ImagePayload, LocationPayload, MessageBody, ReactionAction, VideoPayload,
};

/// Cursor over a body with typed, length-checked reads.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], DecodeError> {
        need(self.buf, N, what)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        need(self.buf, 1, what)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, DecodeError> {
        need(self.buf, 2, what)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        need(self.buf, 4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn identity(&mut self, what: &'static str) -> Result<Identity, DecodeError> {
        let raw: [u8; IDENTITY_LEN] = self.array(what)?;
        Identity::from_bytes(&raw)
    }

    fn group(&mut self) -> Result<GroupIdentity, DecodeError> {
        let creator = self.identity("group creator")?;
        let id = GroupId(self.array::<GROUP_ID_LEN>("group id")?);
        Ok(GroupIdentity { id, creator })
    }

    fn group_id(&mut self) -> Result<GroupId, DecodeError> {
        Ok(GroupId(self.array::<GROUP_ID_LEN>("group id")?))
    }

    fn message_id(&mut self) -> Result<MessageId, DecodeError> {
        Ok(MessageId(self.array::<MESSAGE_ID_LEN>("message id")?))
    }

    fn ballot_id(&mut self) -> Result<BallotId, DecodeError> {
        Ok(BallotId(self.array::<BALLOT_ID_LEN>("ballot id")?))
    }

    fn blob_id(&mut self, what: &'static str) -> Result<BlobId, DecodeError> {
        Ok(BlobId(self.array::<BLOB_ID_LEN>(what)?))
    }

    fn blob_ref(&mut self) -> Result<BlobRef, DecodeError> {
        Ok(BlobRef {
            blob_id: self.blob_id("blob id")?,
            size: self.u32("blob size")?,
            key: self.array::<BLOB_KEY_LEN>("blob key")?,
        })
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }

    fn text(&mut self, what: &'static str) -> Result<String, DecodeError> {
        let rest = self.rest();
        std::str::from_utf8(rest)
            .map(str::to_string)
            .map_err(|_| DecodeError::InvalidUtf8(what))
    }

    fn json<T: DeserializeOwned>(&mut self) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(self.rest())?)
    }

    fn message_ids(&mut self) -> Result<Vec<MessageId>, DecodeError> {
        let rest = self.rest();
        if rest.len() % MESSAGE_ID_LEN != 0 {
            return Err(DecodeError::field(
                "message_ids",
                format!("{} bytes is not a multiple of {MESSAGE_ID_LEN}", rest.len()),
            ));
        }
        Ok(rest
            .chunks_exact(MESSAGE_ID_LEN)
            .filter_map(MessageId::from_slice)
            .collect())
    }

    fn receipt_type(&mut self) -> Result<ReceiptType, DecodeError> {
        let b = self.u8("receipt type")?;
        ReceiptType::from_byte(b).ok_or_else(|| DecodeError::field("receipt_type", format!("0x{b:02x}")))
    }

    fn reaction(&mut self) -> Result<(MessageId, ReactionAction, String), DecodeError> {
        let message_id = self.message_id()?;
        let b = self.u8("reaction action")?;
        let action =
            ReactionAction::from_byte(b).ok_or_else(|| DecodeError::field("action", format!("0x{b:02x}")))?;
        Ok((message_id, action, self.text("reaction emoji")?))
    }

    fn video(&mut self) -> Result<VideoPayload, DecodeError> {
        Ok(VideoPayload {
            duration_secs: self.u16("video duration")?,
            video_blob_id: self.blob_id("video blob id")?,
            video_size: self.u32("video size")?,
            thumbnail_blob_id: self.blob_id("thumbnail blob id")?,
            thumbnail_size: self.u32("thumbnail size")?,
            key: self.array::<BLOB_KEY_LEN>("video key")?,
        })
    }

    fn audio(&mut self) -> Result<AudioPayload, DecodeError> {
        Ok(AudioPayload {
            duration_secs: self.u16("audio duration")?,
            blob_id: self.blob_id("audio blob id")?,
            size: self.u32("audio size")?,
            key: self.array::<BLOB_KEY_LEN>("audio key")?,
        })
    }

    fn location(&mut self) -> Result<LocationPayload, DecodeError> {
        parse_location(&self.text("location")?)
    }
}

/// `lat,lon[,accuracy]` on the first line; with two more lines the second
/// is the POI name and the rest the address, with one more it is the address.
fn parse_location(text: &str) -> Result<LocationPayload, DecodeError> {
    let mut lines = text.lines();
    let coords = lines.next().ok_or(DecodeError::Empty)?;
    let parts: Vec<&str> = coords.split(',').map(str::trim).collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(DecodeError::field("location", format!("bad coordinates {coords:?}")));
    }
    let num = |s: &str| {
        s.parse::<f64>()
            .map_err(|_| DecodeError::field("location", format!("not a number: {s:?}")))
    };
    let latitude = num(parts[0])?;
    let longitude = num(parts[1])?;
    let accuracy = parts.get(2).copied().map(num).transpose()?;

    let rest: Vec<&str> = lines.collect();
    let (poi_name, poi_address) = match rest.as_slice() {
        [] => (None, None),
        [address] => (None, Some(address.to_string())),
        [name, address @ ..] => (Some(name.to_string()), Some(address.join("\n"))),
    };
    Ok(LocationPayload {
        latitude,
        longitude,
        accuracy,
        poi_name,
        poi_address,
    })
}

fn format_location(l: &LocationPayload) -> String {
    let mut out = match l.accuracy {
        Some(acc) => format!("{},{},{}", l.latitude, l.longitude, acc),
        None => format!("{},{}", l.latitude, l.longitude),
    };
    match (&l.poi_name, &l.poi_address) {
        (Some(name), Some(address)) => {
            out.push('\n');
            out.push_str(name);
            out.push('\n');
            out.push_str(address);
        }
        (None, Some(address)) => {
            out.push('\n');
            out.push_str(address);
        }
        (Some(name), None) => {
            out.push('\n');
            out.push_str(name);
            out.push('\n');
        }
        (None, None) => {}
    }
    out
}

/// Decode a body by its type byte.
///
/// Unknown type bytes yield [`MessageBody::Unknown`]; only malformed bodies
/// of known types are errors.
pub fn decode_body(type_byte: u8, body: &[u8]) -> Result<MessageBody, DecodeError> {
    use MessageType as T;

    let Some(message_type) = MessageType::from_byte(type_byte) else {
        return Ok(MessageBody::Unknown {
            type_byte,
            body: body.to_vec(),
        });
    };
    let mut r = Reader::new(body);

    let decoded = match message_type {
        T::Text => MessageBody::Text { text: r.text("text")? },
        T::Image => MessageBody::Image(ImagePayload {
            blob_id: r.blob_id("image blob id")?,
            size: r.u32("image size")?,
            nonce: r.array::<NONCE_LEN>("image nonce")?,
        }),
        T::Location => MessageBody::Location(r.location()?),
        T::Video => MessageBody::Video(r.video()?),
        T::Audio => MessageBody::Audio(r.audio()?),
        T::BallotCreate => MessageBody::BallotCreate {
            ballot_id: r.ballot_id()?,
            ballot: r.json()?,
        },
        T::BallotVote => MessageBody::BallotVote {
            ballot_creator: r.identity("ballot creator")?,
            ballot_id: r.ballot_id()?,
            votes: r.json()?,
        },
        T::File => MessageBody::File { file: r.json()? },
        T::ContactSetPhoto => MessageBody::ContactSetPhoto(r.blob_ref()?),
        T::ContactDeletePhoto => MessageBody::ContactDeletePhoto,
        T::ContactRequestPhoto => MessageBody::ContactRequestPhoto,

        T::GroupText => MessageBody::GroupText {
            group: r.group()?,
            text: r.text("group text")?,
        },
        T::GroupLocation => MessageBody::GroupLocation {
            group: r.group()?,
            location: r.location()?,
        },
        T::GroupImage => MessageBody::GroupImage {
            group: r.group()?,
            image: r.blob_ref()?,
        },
        T::GroupVideo => MessageBody::GroupVideo {
            group: r.group()?,
            video: r.video()?,
        },
        T::GroupAudio => MessageBody::GroupAudio {
            group: r.group()?,
            audio: r.audio()?,
        },
        T::GroupFile => MessageBody::GroupFile {
            group: r.group()?,
            file: r.json()?,
        },
        T::GroupCreate => {
            let group_id = r.group_id()?;
            let rest = r.rest();
            if rest.len() % IDENTITY_LEN != 0 {
                return Err(DecodeError::field(
                    "members",
                    format!("{} bytes is not a multiple of {IDENTITY_LEN}", rest.len()),
                ));
            }
            let members = rest
                .chunks_exact(IDENTITY_LEN)
                .map(Identity::from_bytes)
                .collect::<Result<Vec<_>, _>>()?;
            MessageBody::GroupCreate { group_id, members }
        }
        T::GroupRename => MessageBody::GroupRename {
            group_id: r.group_id()?,
            name: r.text("group name")?,
        },
        T::GroupLeave => MessageBody::GroupLeave { group: r.group()? },
        T::GroupCallStart => MessageBody::GroupCallStart {
            group: r.group()?,
            call: r.json()?,
        },
        T::GroupSetPhoto => MessageBody::GroupSetPhoto {
            group_id: r.group_id()?,
            photo: r.blob_ref()?,
        },
        T::GroupRequestSync => MessageBody::GroupRequestSync { group_id: r.group_id()? },
        T::GroupBallotCreate => MessageBody::GroupBallotCreate {
            group: r.group()?,
            ballot_id: r.ballot_id()?,
            ballot: r.json()?,
        },
        T::GroupBallotVote => MessageBody::GroupBallotVote {
            group: r.group()?,
            ballot_creator: r.identity("ballot creator")?,
            ballot_id: r.ballot_id()?,
            votes: r.json()?,
        },
        T::GroupDeletePhoto => MessageBody::GroupDeletePhoto { group_id: r.group_id()? },

        T::VoipCallOffer => MessageBody::VoipCallOffer(r.json()?),
        T::VoipCallAnswer => MessageBody::VoipCallAnswer(r.json()?),
        T::VoipCallIceCandidate => MessageBody::VoipCallIceCandidate(r.json()?),
        T::VoipCallHangup => MessageBody::VoipCallHangup(r.json()?),
        T::VoipCallRinging => MessageBody::VoipCallRinging(r.json()?),

        T::DeliveryReceipt => MessageBody::DeliveryReceipt {
            receipt_type: r.receipt_type()?,
            message_ids: r.message_ids()?,
        },
        T::GroupDeliveryReceipt => MessageBody::GroupDeliveryReceipt {
            group: r.group()?,
            receipt_type: r.receipt_type()?,
            message_ids: r.message_ids()?,
        },
        T::Reaction => {
            let (message_id, action, emoji) = r.reaction()?;
            MessageBody::Reaction {
                message_id,
                action,
                emoji,
            }
        }
        T::GroupReaction => {
            let group = r.group()?;
            let (message_id, action, emoji) = r.reaction()?;
            MessageBody::GroupReaction {
                group,
                message_id,
                action,
                emoji,
            }
        }
        T::TypingIndicator => MessageBody::TypingIndicator {
            typing: r.u8("typing flag")? != 0,
        },
        T::Edit => MessageBody::Edit {
            message_id: r.message_id()?,
            text: r.text("edit text")?,
        },
        T::Delete => MessageBody::Delete {
            message_id: r.message_id()?,
        },
        T::GroupEdit => MessageBody::GroupEdit {
            group: r.group()?,
            message_id: r.message_id()?,
            text: r.text("group edit text")?,
        },
        T::GroupDelete => MessageBody::GroupDelete {
            group: r.group()?,
            message_id: r.message_id()?,
        },

        T::ForwardSecurity => MessageBody::ForwardSecurity(FsEnvelope::decode(r.rest())?),
        T::Empty => MessageBody::Empty,
        T::AuthToken => MessageBody::AuthToken {
            token: r.text("auth token")?,
        },
    };
    Ok(decoded)
}

fn put_group(out: &mut BytesMut, g: &GroupIdentity) {
    out.put_slice(g.creator.as_bytes());
    out.put_slice(&g.id.0);
}

fn put_blob_ref(out: &mut BytesMut, b: &BlobRef) {
    out.put_slice(&b.blob_id.0);
    out.put_u32_le(b.size);
    out.put_slice(&b.key);
}

fn put_video(out: &mut BytesMut, v: &VideoPayload) {
    out.put_u16_le(v.duration_secs);
    out.put_slice(&v.video_blob_id.0);
    out.put_u32_le(v.video_size);
    out.put_slice(&v.thumbnail_blob_id.0);
    out.put_u32_le(v.thumbnail_size);
    out.put_slice(&v.key);
}

fn put_audio(out: &mut BytesMut, a: &AudioPayload) {
    out.put_u16_le(a.duration_secs);
    out.put_slice(&a.blob_id.0);
    out.put_u32_le(a.size);
    out.put_slice(&a.key);
}

fn put_json<T: serde::Serialize>(out: &mut BytesMut, value: &T) -> Result<(), DecodeError> {
    out.put_slice(&serde_json::to_vec(value)?);
    Ok(())
}

/// Inverse of [`decode_body`]: `(type byte, body)`.
pub fn encode_body(body: &MessageBody) -> Result<(u8, Vec<u8>), DecodeError> {
    use MessageBody as B;

    let mut out = BytesMut::new();
    match body {
        B::Text { text } | B::AuthToken { token: text } => out.put_slice(text.as_bytes()),
        B::Image(i) => {
            out.put_slice(&i.blob_id.0);
            out.put_u32_le(i.size);
            out.put_slice(&i.nonce);
        }
        B::Location(l) => out.put_slice(format_location(l).as_bytes()),
        B::Video(v) => put_video(&mut out, v),
        B::Audio(a) => put_audio(&mut out, a),
        B::BallotCreate { ballot_id, ballot } => {
            out.put_slice(&ballot_id.0);
            put_json(&mut out, ballot)?;
        }
        B::BallotVote {
            ballot_creator,
            ballot_id,
            votes,
        } => {
            out.put_slice(ballot_creator.as_bytes());
            out.put_slice(&ballot_id.0);
            put_json(&mut out, votes)?;
        }
        B::File { file } => put_json(&mut out, file)?,
        B::ContactSetPhoto(b) => put_blob_ref(&mut out, b),
        B::ContactDeletePhoto | B::ContactRequestPhoto | B::Empty => {}

        B::GroupText { group, text } => {
            put_group(&mut out, group);
            out.put_slice(text.as_bytes());
        }
        B::GroupLocation { group, location } => {
            put_group(&mut out, group);
            out.put_slice(format_location(location).as_bytes());
        }
        B::GroupImage { group, image } => {
            put_group(&mut out, group);
            put_blob_ref(&mut out, image);
        }
        B::GroupVideo { group, video } => {
            put_group(&mut out, group);
            put_video(&mut out, video);
        }
        B::GroupAudio { group, audio } => {
            put_group(&mut out, group);
            put_audio(&mut out, audio);
        }
        B::GroupFile { group, file } => {
            put_group(&mut out, group);
            put_json(&mut out, file)?;
        }
        B::GroupCreate { group_id, members } => {
            out.put_slice(&group_id.0);
            for m in members {
                out.put_slice(m.as_bytes());
            }
        }
        B::GroupRename { group_id, name } => {
            out.put_slice(&group_id.0);
            out.put_slice(name.as_bytes());
        }
        B::GroupLeave { group } => put_group(&mut out, group),
        B::GroupCallStart { group, call } => {
            put_group(&mut out, group);
            put_json(&mut out, call)?;
        }
        B::GroupSetPhoto { group_id, photo } => {
            out.put_slice(&group_id.0);
            put_blob_ref(&mut out, photo);
        }
        B::GroupRequestSync { group_id } | B::GroupDeletePhoto { group_id } => out.put_slice(&group_id.0),
        B::GroupBallotCreate {
            group,
            ballot_id,
            ballot,
        } => {
            put_group(&mut out, group);
            out.put_slice(&ballot_id.0);
            put_json(&mut out, ballot)?;
        }
        B::GroupBallotVote {
            group,
            ballot_creator,
            ballot_id,
            votes,
        } => {
            put_group(&mut out, group);
            out.put_slice(ballot_creator.as_bytes());
            out.put_slice(&ballot_id.0);
            put_json(&mut out, votes)?;
        }

        B::VoipCallOffer(v) => put_json(&mut out, v)?,
        B::VoipCallAnswer(v) => put_json(&mut out, v)?,
        B::VoipCallIceCandidate(v) => put_json(&mut out, v)?,
        B::VoipCallHangup(v) | B::VoipCallRinging(v) => put_json(&mut out, v)?,

        B::DeliveryReceipt {
            receipt_type,
            message_ids,
        } => {
            out.put_u8(receipt_type.to_byte());
            for id in message_ids {
                out.put_slice(&id.0);
            }
        }
        B::GroupDeliveryReceipt {
            group,
            receipt_type,
            message_ids,
        } => {
            put_group(&mut out, group);
            out.put_u8(receipt_type.to_byte());
            for id in message_ids {
                out.put_slice(&id.0);
            }
        }
        B::Reaction {
            message_id,
            action,
            emoji,
        } => {
            out.put_slice(&message_id.0);
            out.put_u8(action.to_byte());
            out.put_slice(emoji.as_bytes());
        }
        B::GroupReaction {
            group,
            message_id,
            action,
            emoji,
        } => {
            put_group(&mut out, group);
            out.put_slice(&message_id.0);
            out.put_u8(action.to_byte());
            out.put_slice(emoji.as_bytes());
        }
        B::TypingIndicator { typing } => out.put_u8(u8::from(*typing)),
        B::Edit { message_id, text } => {
            out.put_slice(&message_id.0);
            out.put_slice(text.as_bytes());
        }
        B::Delete { message_id } => out.put_slice(&message_id.0),
        B::GroupEdit {
            group,
            message_id,
            text,
        } => {
            put_group(&mut out, group);
            out.put_slice(&message_id.0);
            out.put_slice(text.as_bytes());
        }
        B::GroupDelete { group, message_id } => {
            put_group(&mut out, group);
            out.put_slice(&message_id.0);
        }
        B::ForwardSecurity(env) => out.put_slice(&env.encode()),
        B::Unknown { body, .. } => out.put_slice(body),
    }
    Ok((body.type_byte(), out.to_vec()))
}
