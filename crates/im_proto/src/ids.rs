//! Identity handles and fixed-length ids.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::IDENTITY_LEN;
use crate::error::DecodeError;

/// 8-character identity handle (`A-Z`, `0-9`, `*`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let arr: [u8; IDENTITY_LEN] = bytes
            .try_into()
            .map_err(|_| DecodeError::InvalidIdentity(String::from_utf8_lossy(bytes).into_owned()))?;
        if !arr.iter().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || *c == b'*') {
            return Err(DecodeError::InvalidIdentity(String::from_utf8_lossy(bytes).into_owned()));
        }
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Validated ASCII at construction.
        std::str::from_utf8(&self.0).unwrap_or("????????")
    }
}

impl FromStr for Identity {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_bytes(s.as_bytes())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.as_str())
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! byte_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                bytes.try_into().ok().map(Self)
            }

            pub fn random() -> Self {
                use rand::RngCore;
                let mut b = [0u8; $len];
                rand::rngs::OsRng.fill_bytes(&mut b);
                Self(b)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                Self::from_slice(&bytes)
                    .ok_or_else(|| serde::de::Error::custom(concat!("wrong length for ", stringify!($name))))
            }
        }
    };
}

byte_id!(
    /// 8-byte message id, unique per sender.
    MessageId,
    crate::constants::MESSAGE_ID_LEN
);
byte_id!(GroupId, crate::constants::GROUP_ID_LEN);
byte_id!(BallotId, crate::constants::BALLOT_ID_LEN);
byte_id!(BlobId, crate::constants::BLOB_ID_LEN);

/// A group is addressed by its creator plus the creator-chosen id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupIdentity {
    pub id: GroupId,
    pub creator: Identity,
}

impl fmt::Display for GroupIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.creator, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_validation() {
        assert!("ECHOECHO".parse::<Identity>().is_ok());
        assert!("*THREEMA".parse::<Identity>().is_ok());
        assert!("echoecho".parse::<Identity>().is_err());
        assert!("SHORT".parse::<Identity>().is_err());
    }

    #[test]
    fn message_id_serde_as_hex() {
        let id = MessageId([1, 2, 3, 4, 5, 6, 7, 8]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0102030405060708\"");
        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
