//! Forward-security envelope (message type 0xa0).
//!
//! ```text
//! session id   16
//! frame type   u8   (1 init, 2 accept, 3 reject, 4 terminate, 5 encapsulated)
//!
//! init/accept:   min version u16, max version u16, ephemeral public key 32
//! reject:        rejected message id 8, cause u8
//! terminate:     cause u8
//! encapsulated:  dh type u8, counter u64, offered version u16,
//!                applied version u16, group flag u8 [creator 8, group id 8],
//!                ciphertext
//! ```

use bytes::{Buf, BufMut, BytesMut};
use im_crypto::dh_session::{DhType, FsVersion, VersionRange, SESSION_ID_LEN};
use serde::{Deserialize, Serialize};

use crate::constants::{GROUP_ID_LEN, IDENTITY_LEN, MESSAGE_ID_LEN};
use crate::error::{need, DecodeError};
use crate::ids::{GroupId, GroupIdentity, Identity, MessageId};

const FRAME_INIT: u8 = 1;
const FRAME_ACCEPT: u8 = 2;
const FRAME_REJECT: u8 = 3;
const FRAME_TERMINATE: u8 = 4;
const FRAME_ENCAPSULATED: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FsCause {
    UnknownSession = 0,
    StateMismatch = 1,
    Reset = 2,
    DisabledByLocal = 3,
    DisabledByRemote = 4,
}

impl FsCause {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::UnknownSession),
            1 => Some(Self::StateMismatch),
            2 => Some(Self::Reset),
            3 => Some(Self::DisabledByLocal),
            4 => Some(Self::DisabledByRemote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum FsFrame {
    Init {
        version_range: VersionRange,
        ephemeral_public_key: [u8; 32],
    },
    Accept {
        version_range: VersionRange,
        ephemeral_public_key: [u8; 32],
    },
    Reject {
        rejected_message_id: MessageId,
        cause: FsCause,
    },
    Terminate {
        cause: FsCause,
    },
    Encapsulated {
        dh_type: DhType,
        counter: u64,
        offered_version: FsVersion,
        applied_version: FsVersion,
        group_identity: Option<GroupIdentity>,
        ciphertext: Vec<u8>,
    },
}

impl FsFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            FsFrame::Init { .. } => "init",
            FsFrame::Accept { .. } => "accept",
            FsFrame::Reject { .. } => "reject",
            FsFrame::Terminate { .. } => "terminate",
            FsFrame::Encapsulated { .. } => "encapsulated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEnvelope {
    pub session_id: [u8; SESSION_ID_LEN],
    pub frame: FsFrame,
}

fn read_range(buf: &mut &[u8]) -> Result<(VersionRange, [u8; 32]), DecodeError> {
    need(*buf, 4 + 32, "fs version range")?;
    let min = FsVersion(buf.get_u16_le());
    let max = FsVersion(buf.get_u16_le());
    if min > max {
        return Err(DecodeError::field("version_range", format!("{min} > {max}")));
    }
    let mut key = [0u8; 32];
    buf.copy_to_slice(&mut key);
    Ok((VersionRange { min, max }, key))
}

impl FsEnvelope {
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = body;
        need(buf, SESSION_ID_LEN + 1, "fs envelope header")?;
        let mut session_id = [0u8; SESSION_ID_LEN];
        buf.copy_to_slice(&mut session_id);

        let frame = match buf.get_u8() {
            FRAME_INIT => {
                let (version_range, ephemeral_public_key) = read_range(&mut buf)?;
                FsFrame::Init {
                    version_range,
                    ephemeral_public_key,
                }
            }
            FRAME_ACCEPT => {
                let (version_range, ephemeral_public_key) = read_range(&mut buf)?;
                FsFrame::Accept {
                    version_range,
                    ephemeral_public_key,
                }
            }
            FRAME_REJECT => {
                need(buf, MESSAGE_ID_LEN + 1, "fs reject")?;
                let mut id = [0u8; MESSAGE_ID_LEN];
                buf.copy_to_slice(&mut id);
                let b = buf.get_u8();
                let cause = FsCause::from_byte(b)
                    .ok_or_else(|| DecodeError::field("cause", format!("0x{b:02x}")))?;
                FsFrame::Reject {
                    rejected_message_id: MessageId(id),
                    cause,
                }
            }
            FRAME_TERMINATE => {
                need(buf, 1, "fs terminate")?;
                let b = buf.get_u8();
                let cause = FsCause::from_byte(b)
                    .ok_or_else(|| DecodeError::field("cause", format!("0x{b:02x}")))?;
                FsFrame::Terminate { cause }
            }
            FRAME_ENCAPSULATED => {
                need(buf, 1 + 8 + 2 + 2 + 1, "fs encapsulated header")?;
                let b = buf.get_u8();
                let dh_type = DhType::from_byte(b)
                    .ok_or_else(|| DecodeError::field("dh_type", format!("0x{b:02x}")))?;
                let counter = buf.get_u64_le();
                let offered_version = FsVersion(buf.get_u16_le());
                let applied_version = FsVersion(buf.get_u16_le());
                let group_identity = match buf.get_u8() {
                    0 => None,
                    1 => {
                        need(buf, IDENTITY_LEN + GROUP_ID_LEN, "fs group identity")?;
                        let creator = Identity::from_bytes(&buf[..IDENTITY_LEN])?;
                        buf.advance(IDENTITY_LEN);
                        let mut id = [0u8; GROUP_ID_LEN];
                        buf.copy_to_slice(&mut id);
                        Some(GroupIdentity {
                            id: GroupId(id),
                            creator,
                        })
                    }
                    other => {
                        return Err(DecodeError::field("group_flag", format!("0x{other:02x}")));
                    }
                };
                if !buf.has_remaining() {
                    return Err(DecodeError::Truncated {
                        what: "fs ciphertext",
                        need: 1,
                        got: 0,
                    });
                }
                FsFrame::Encapsulated {
                    dh_type,
                    counter,
                    offered_version,
                    applied_version,
                    group_identity,
                    ciphertext: buf.to_vec(),
                }
            }
            other => return Err(DecodeError::field("frame_type", format!("0x{other:02x}"))),
        };
        Ok(Self { session_id, frame })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(64);
        out.put_slice(&self.session_id);
        match &self.frame {
            FsFrame::Init {
                version_range,
                ephemeral_public_key,
            }
            | FsFrame::Accept {
                version_range,
                ephemeral_public_key,
            } => {
                out.put_u8(if matches!(self.frame, FsFrame::Init { .. }) {
                    FRAME_INIT
                } else {
                    FRAME_ACCEPT
                });
                out.put_u16_le(version_range.min.0);
                out.put_u16_le(version_range.max.0);
                out.put_slice(ephemeral_public_key);
            }
            FsFrame::Reject {
                rejected_message_id,
                cause,
            } => {
                out.put_u8(FRAME_REJECT);
                out.put_slice(&rejected_message_id.0);
                out.put_u8(*cause as u8);
            }
            FsFrame::Terminate { cause } => {
                out.put_u8(FRAME_TERMINATE);
                out.put_u8(*cause as u8);
            }
            FsFrame::Encapsulated {
                dh_type,
                counter,
                offered_version,
                applied_version,
                group_identity,
                ciphertext,
            } => {
                out.put_u8(FRAME_ENCAPSULATED);
                out.put_u8(*dh_type as u8);
                out.put_u64_le(*counter);
                out.put_u16_le(offered_version.0);
                out.put_u16_le(applied_version.0);
                match group_identity {
                    Some(g) => {
                        out.put_u8(1);
                        out.put_slice(g.creator.as_bytes());
                        out.put_slice(&g.id.0);
                    }
                    None => out.put_u8(0),
                }
                out.put_slice(ciphertext);
            }
        }
        out.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulated_with_group() {
        let env = FsEnvelope {
            session_id: [4; 16],
            frame: FsFrame::Encapsulated {
                dh_type: DhType::FourDH,
                counter: 42,
                offered_version: FsVersion::V1_2,
                applied_version: FsVersion::V1_1,
                group_identity: Some(GroupIdentity {
                    id: GroupId([1; 8]),
                    creator: "CREATOR1".parse().unwrap(),
                }),
                ciphertext: vec![0xaa; 40],
            },
        };
        let wire = env.encode();
        assert_eq!(wire[16], FRAME_ENCAPSULATED);
        assert_eq!(FsEnvelope::decode(&wire).unwrap(), env);
    }

    #[test]
    fn init_layout() {
        let env = FsEnvelope {
            session_id: [1; 16],
            frame: FsFrame::Init {
                version_range: VersionRange::default(),
                ephemeral_public_key: [2; 32],
            },
        };
        let wire = env.encode();
        assert_eq!(wire.len(), 16 + 1 + 4 + 32);
        assert_eq!(FsEnvelope::decode(&wire).unwrap(), env);
    }

    #[test]
    fn unknown_frame_type_and_truncation() {
        let mut wire = vec![0u8; 16];
        wire.push(9);
        assert!(FsEnvelope::decode(&wire).is_err());
        assert!(FsEnvelope::decode(&[0u8; 10]).is_err());

        let mut enc = vec![0u8; 16];
        enc.extend_from_slice(&[FRAME_ENCAPSULATED, 2, 1, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 1, 0]);
        assert!(matches!(
            FsEnvelope::decode(&enc),
            Err(DecodeError::Truncated { what: "fs ciphertext", .. })
        ));
    }

    #[test]
    fn inverted_version_range_is_rejected() {
        let mut wire = vec![0u8; 16];
        wire.push(FRAME_INIT);
        wire.extend_from_slice(&0x0102u16.to_le_bytes());
        wire.extend_from_slice(&0x0100u16.to_le_bytes());
        wire.extend_from_slice(&[3u8; 32]);
        assert!(FsEnvelope::decode(&wire).is_err());
    }
}
