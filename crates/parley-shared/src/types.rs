use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CodecError;

// Wallet address = version byte || BLAKE3-derived digest of the public key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub Vec<u8>);

impl Address {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// URL-safe identity tag used by the relay (base58, no checksum).
    pub fn to_tag(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_tag())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageId(pub Vec<u8>);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// One of the two redundant symmetric session keys negotiated per contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionSlot {
    A,
    B,
}

/// Bitmask choosing which session keys a keys message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyMask(u8);

impl KeyMask {
    pub const A: KeyMask = KeyMask(0b01);
    pub const B: KeyMask = KeyMask(0b10);
    pub const ALL: KeyMask = KeyMask(0b11);

    pub fn includes(self, slot: SessionSlot) -> bool {
        let bit = match slot {
            SessionSlot::A => Self::A.0,
            SessionSlot::B => Self::B.0,
        };
        self.0 & bit != 0
    }
}

/// Encryption mode of an envelope's data field. `Asymmetric` payloads are
/// sealed to the recipient's public key; the symmetric modes use the
/// contact's session key in the named slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum EncryptionType {
    None = 0,
    Asymmetric = 1,
    SymmetricA = 2,
    SymmetricB = 3,
}

impl EncryptionType {
    pub fn from_i32(value: i32) -> Result<Self, CodecError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Asymmetric),
            2 => Ok(Self::SymmetricA),
            3 => Ok(Self::SymmetricB),
            other => Err(CodecError::UnknownTag {
                field: "encryption type",
                value: other,
            }),
        }
    }

    pub fn session_slot(self) -> Option<SessionSlot> {
        match self {
            Self::SymmetricA => Some(SessionSlot::A),
            Self::SymmetricB => Some(SessionSlot::B),
            _ => None,
        }
    }
}

impl From<SessionSlot> for EncryptionType {
    fn from(slot: SessionSlot) -> Self {
        match slot {
            SessionSlot::A => Self::SymmetricA,
            SessionSlot::B => Self::SymmetricB,
        }
    }
}

/// Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
