use thiserror::Error;

use crate::codec::CodecError;

/// Failure to turn a decrypted body into a typed message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("body too short for {what}: need {need} bytes, got {got}")]
    Truncated {
        what: &'static str,
        need: usize,
        got: usize,
    },

    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("invalid field {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    #[error("empty body")]
    Empty,

    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

impl DecodeError {
    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

pub(crate) fn need(buf: &[u8], n: usize, what: &'static str) -> Result<(), DecodeError> {
    if buf.len() < n {
        return Err(DecodeError::Truncated {
            what,
            need: n,
            got: buf.len(),
        });
    }
    Ok(())
}
