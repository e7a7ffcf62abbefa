//! im_proto — wire formats for the message intake pipeline.
//!
//! # Modules
//! - `constants`  — field lengths, message type table, flags, receipt types
//! - `ids`        — identities and fixed-length ids
//! - `boxed`      — the boxed message as delivered by the transport
//! - `codec`      — type byte framing and padding inside the crypto box
//! - `message`    — abstract message header + typed bodies
//! - `decoder`    — type table: body bytes ↔ `MessageBody`
//! - `fs_frame`   — forward-security envelope codec
//! - `validation` — content checks on decoded messages

pub mod boxed;
pub mod codec;
pub mod constants;
pub mod decoder;
pub mod error;
pub mod fs_frame;
pub mod ids;
pub mod message;
pub mod validation;

pub use boxed::BoxedMessage;
pub use constants::{MessageFlags, MessageType, ReceiptType};
pub use error::DecodeError;
pub use fs_frame::{FsCause, FsEnvelope, FsFrame};
pub use ids::{BallotId, BlobId, GroupId, GroupIdentity, Identity, MessageId};
pub use message::{AbstractMessage, MessageBody};
