//! Boxed message → [`AbstractMessage`].

use std::sync::Arc;

use im_crypto::{CryptoBox, CryptoError};
use im_proto::codec::{decode_from_wire, encode_for_wire};
use im_proto::decoder::{decode_body, encode_body};
use im_proto::{AbstractMessage, BoxedMessage, DecodeError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DecodeFailure {
    #[error("box could not be opened: {0}")]
    Box(#[from] CryptoError),
    #[error("malformed plaintext: {0}")]
    Format(#[from] DecodeError),
}

pub struct MessageDecoder {
    crypto: Arc<dyn CryptoBox>,
}

impl MessageDecoder {
    pub fn new(crypto: Arc<dyn CryptoBox>) -> Self {
        Self { crypto }
    }

    /// Open the box from `sender_key`, unpad and parse the body.
    ///
    /// Unknown type bytes decode successfully into `MessageBody::Unknown`.
    pub fn try_decode(&self, boxed: &BoxedMessage, sender_key: &[u8; 32]) -> Result<AbstractMessage, DecodeFailure> {
        let plaintext = self.crypto.open(&boxed.box_data, &boxed.nonce, sender_key)?;
        let (type_byte, body) = decode_from_wire(&plaintext).map_err(DecodeError::from)?;
        let body = decode_body(type_byte, body)?;
        Ok(message_from_header(boxed, body))
    }

    pub fn decode(&self, boxed: &BoxedMessage, sender_key: &[u8; 32]) -> Option<AbstractMessage> {
        match self.try_decode(boxed, sender_key) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(sender = %boxed.from_identity, message_id = %boxed.message_id, error = %e, "decode failed");
                None
            }
        }
    }
}

fn message_from_header(boxed: &BoxedMessage, body: im_proto::MessageBody) -> AbstractMessage {
    AbstractMessage {
        message_id: boxed.message_id,
        from_identity: boxed.from_identity,
        to_identity: boxed.to_identity,
        date: boxed.date,
        flags: boxed.flags,
        push_from_name: boxed.push_from_name.clone(),
        body,
    }
}

/// Box `message` for `recipient_key`. The outgoing half of [`MessageDecoder`],
/// used by the command line tool and by tests that play the peer.
pub fn seal_message(
    crypto: &dyn CryptoBox,
    recipient_key: &[u8; 32],
    message: &AbstractMessage,
    nonce: [u8; 24],
) -> Result<BoxedMessage, DecodeFailure> {
    let (type_byte, body) = encode_body(&message.body)?;
    let box_data = crypto.seal(&encode_for_wire(type_byte, &body), &nonce, recipient_key)?;
    Ok(BoxedMessage {
        from_identity: message.from_identity,
        to_identity: message.to_identity,
        message_id: message.message_id,
        date: message.date,
        flags: message.flags,
        push_from_name: message.push_from_name.clone(),
        metadata_box: None,
        nonce,
        box_data,
    })
}
