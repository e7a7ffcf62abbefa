//! Plaintext framing inside the crypto box.
//!
//! Format: `[type: u8] [body] [padding]`
//!
//! Padding is PKCS#7 style: N bytes each equal to N, with N in 1..=255.
//! The padded plaintext is never shorter than [`MIN_MESSAGE_PADDED_LEN`],
//! so short messages (typing indicators, receipts) do not stand out by size.

use rand::Rng;

use crate::constants::MIN_MESSAGE_PADDED_LEN;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid padding: {0}")]
    InvalidPadding(String),
    #[error("Missing type byte")]
    MissingType,
}

/// Append random-length padding.
pub fn pad(plaintext: &[u8]) -> Vec<u8> {
    let mut n: usize = rand::thread_rng().gen_range(1..=255);
    if plaintext.len() + n < MIN_MESSAGE_PADDED_LEN {
        n = MIN_MESSAGE_PADDED_LEN - plaintext.len();
    }
    let mut out = Vec::with_capacity(plaintext.len() + n);
    out.extend_from_slice(plaintext);
    out.resize(plaintext.len() + n, n as u8);
    out
}

/// Strip padding after decryption.
pub fn unpad(padded: &[u8]) -> Result<&[u8], CodecError> {
    let n = *padded
        .last()
        .ok_or_else(|| CodecError::InvalidPadding("empty plaintext".into()))? as usize;
    if n == 0 || n > padded.len() {
        return Err(CodecError::InvalidPadding(format!(
            "pad length {n} for {} bytes",
            padded.len()
        )));
    }
    let (data, padding) = padded.split_at(padded.len() - n);
    if padding.iter().any(|&b| b as usize != n) {
        return Err(CodecError::InvalidPadding("inconsistent padding bytes".into()));
    }
    Ok(data)
}

/// `type || body`, padded, ready for the crypto box.
pub fn encode_for_wire(type_byte: u8, body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(1 + body.len());
    framed.push(type_byte);
    framed.extend_from_slice(body);
    pad(&framed)
}

/// Opened box → `(type, body)`.
pub fn decode_from_wire(padded_plaintext: &[u8]) -> Result<(u8, &[u8]), CodecError> {
    let data = unpad(padded_plaintext)?;
    let (&type_byte, body) = data.split_first().ok_or(CodecError::MissingType)?;
    Ok((type_byte, body))
}
