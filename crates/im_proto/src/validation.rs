//! Content validation for decoded messages.
//!
//! Structural decoding already succeeded at this point; these checks reject
//! payloads that parse but make no sense (empty text, zero-byte photos,
//! receipts for nothing, coordinates off the globe).

use crate::constants::{MAX_GROUP_NAME_LEN, MAX_MESSAGE_LEN};
use crate::message::{AbstractMessage, BlobRef, LocationPayload, MessageBody};

#[derive(Debug, Clone, Copy)]
pub struct ContentLimits {
    pub max_text_bytes: usize,
    pub max_group_name_bytes: usize,
}

impl Default for ContentLimits {
    fn default() -> Self {
        Self {
            max_text_bytes: MAX_MESSAGE_LEN,
            max_group_name_bytes: MAX_GROUP_NAME_LEN,
        }
    }
}

pub fn is_content_valid(message: &AbstractMessage) -> bool {
    is_content_valid_with(message, &ContentLimits::default())
}

fn text_ok(text: &str, limits: &ContentLimits) -> bool {
    !text.trim().is_empty() && text.len() <= limits.max_text_bytes
}

fn location_ok(l: &LocationPayload) -> bool {
    l.latitude.is_finite()
        && l.longitude.is_finite()
        && (-90.0..=90.0).contains(&l.latitude)
        && (-180.0..=180.0).contains(&l.longitude)
        && l.accuracy.map_or(true, |a| a.is_finite() && a >= 0.0)
}

fn photo_ok(b: &BlobRef) -> bool {
    b.size > 0
}

fn json_ok(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Null => false,
        serde_json::Value::Object(m) => !m.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

pub fn is_content_valid_with(message: &AbstractMessage, limits: &ContentLimits) -> bool {
    use MessageBody as B;
    match &message.body {
        B::Text { text } | B::GroupText { text, .. } => text_ok(text, limits),
        B::Edit { text, .. } | B::GroupEdit { text, .. } => text_ok(text, limits),
        B::Location(l) | B::GroupLocation { location: l, .. } => location_ok(l),
        B::ContactSetPhoto(photo) | B::GroupSetPhoto { photo, .. } => photo_ok(photo),
        B::Image(i) => i.size > 0,
        B::GroupImage { image, .. } => image.size > 0,
        B::Video(v) | B::GroupVideo { video: v, .. } => v.video_size > 0,
        B::Audio(a) | B::GroupAudio { audio: a, .. } => a.size > 0,
        B::BallotCreate { ballot, .. } | B::GroupBallotCreate { ballot, .. } => json_ok(ballot),
        B::BallotVote { votes, .. } | B::GroupBallotVote { votes, .. } => json_ok(votes),
        B::File { file } | B::GroupFile { file, .. } => json_ok(file),
        B::GroupCallStart { call, .. } => json_ok(call),
        B::GroupRename { name, .. } => name.len() <= limits.max_group_name_bytes,
        B::DeliveryReceipt { message_ids, .. } | B::GroupDeliveryReceipt { message_ids, .. } => {
            !message_ids.is_empty()
        }
        B::Reaction { emoji, .. } | B::GroupReaction { emoji, .. } => !emoji.is_empty(),
        B::VoipCallOffer(o) => !o.offer.sdp.is_empty(),
        B::VoipCallAnswer(a) => a.action == 0 || a.answer.as_ref().is_some_and(|d| !d.sdp.is_empty()),
        B::VoipCallIceCandidate(c) => !c.candidates.is_empty(),
        B::AuthToken { token } => !token.is_empty(),
        B::VoipCallHangup(_)
        | B::VoipCallRinging(_)
        | B::TypingIndicator { .. }
        | B::GroupCreate { .. }
        | B::GroupLeave { .. }
        | B::GroupRequestSync { .. }
        | B::GroupDeletePhoto { .. }
        | B::ContactDeletePhoto
        | B::ContactRequestPhoto
        | B::Delete { .. }
        | B::GroupDelete { .. }
        | B::ForwardSecurity(_)
        | B::Empty
        | B::Unknown { .. } => true,
    }
}
