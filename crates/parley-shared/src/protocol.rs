//! Envelope and application-message framing.
//!
//! Everything a peer sends is an [`Envelope`]: routing fields, an encryption
//! tag for the data field and an Ed25519 signature over the rest of the
//! envelope. The opened data field always decodes to an [`AppMessage`].

use crate::codec::{WireReader, WireRecord, WireWriter};
use crate::error::{CodecError, IdentityError};
use crate::identity::{verify_signature, Identity};
use crate::types::{Address, EncryptionType, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EnvelopeKind {
    /// Control traffic: handshake, receipts, nickname updates.
    Info = 0,
    /// User-visible content.
    Data = 1,
}

impl EnvelopeKind {
    pub fn from_i32(value: i32) -> Result<Self, CodecError> {
        match value {
            0 => Ok(Self::Info),
            1 => Ok(Self::Data),
            other => Err(CodecError::UnknownTag {
                field: "envelope kind",
                value: other,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Message id. Handshake messages carry a single byte holding their
    /// sequence number; everything else carries a generated id.
    pub id: Vec<u8>,
    pub kind: EnvelopeKind,
    pub sender: Address,
    pub recipient: Address,
    pub encryption: EncryptionType,
    pub data: Vec<u8>,
    pub timestamp: i64,
    pub signature: Option<Vec<u8>>,
}

impl Envelope {
    pub fn new(
        id: Vec<u8>,
        kind: EnvelopeKind,
        sender: Address,
        recipient: Address,
        encryption: EncryptionType,
        data: Vec<u8>,
    ) -> Self {
        Self {
            id,
            kind,
            sender,
            recipient,
            encryption,
            data,
            timestamp: crate::types::now_timestamp(),
            signature: None,
        }
    }

    /// Handshake sequence number, if this is a handshake message.
    pub fn handshake_sequence(&self) -> Option<u8> {
        match self.id.as_slice() {
            [seq] => Some(*seq),
            _ => None,
        }
    }

    pub fn message_id(&self) -> MessageId {
        MessageId(self.id.clone())
    }

    /// Bytes covered by the signature: every field except the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.write_unsigned(&mut w);
        w.finish()
    }

    pub fn sign(&mut self, identity: &Identity) {
        let signature = identity.sign(&self.signing_bytes());
        self.signature = Some(signature.to_bytes().to_vec());
    }

    pub fn verify(&self, public_key: &[u8]) -> Result<(), IdentityError> {
        let signature = self
            .signature
            .as_deref()
            .ok_or(IdentityError::InvalidSignature)?;
        verify_signature(public_key, &self.signing_bytes(), signature)
    }

    fn write_unsigned(&self, w: &mut WireWriter) {
        w.write_bytes(&self.id);
        w.write_i32(self.kind as i32);
        w.write_bytes(self.sender.as_bytes());
        w.write_bytes(self.recipient.as_bytes());
        w.write_i32(self.encryption as i32);
        w.write_bytes(&self.data);
        w.write_i64(self.timestamp);
    }
}

impl WireRecord for Envelope {
    fn write_to(&self, w: &mut WireWriter) {
        self.write_unsigned(w);
        w.write_optional_bytes(self.signature.as_deref());
    }

    fn read_from(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let id = r.read_bytes()?;
        if id.is_empty() {
            return Err(CodecError::Invalid("empty envelope id"));
        }
        let kind = EnvelopeKind::from_i32(r.read_i32()?)?;
        let sender = Address(r.read_bytes()?);
        if sender.as_bytes().is_empty() {
            return Err(CodecError::Invalid("empty sender address"));
        }
        Ok(Self {
            id,
            kind,
            sender,
            recipient: Address(r.read_bytes()?),
            encryption: EncryptionType::from_i32(r.read_i32()?)?,
            data: r.read_bytes()?,
            timestamp: r.read_i64()?,
            signature: r.read_optional_bytes()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AppMessageCode {
    Chat = 0,
    Keys = 1,
    /// Data: the sender's public key.
    RequestAdd = 2,
    AcceptAdd = 3,
    /// Data: id of the message being acknowledged.
    MsgReceived = 4,
    /// Data: id of the message being acknowledged.
    MsgRead = 5,
    /// Data: UTF-8 nickname.
    Nick = 6,
    RequestFunds = 7,
    SentFunds = 8,
    FileHeader = 9,
}

impl AppMessageCode {
    pub fn from_i32(value: i32) -> Result<Self, CodecError> {
        Ok(match value {
            0 => Self::Chat,
            1 => Self::Keys,
            2 => Self::RequestAdd,
            3 => Self::AcceptAdd,
            4 => Self::MsgReceived,
            5 => Self::MsgRead,
            6 => Self::Nick,
            7 => Self::RequestFunds,
            8 => Self::SentFunds,
            9 => Self::FileHeader,
            other => {
                return Err(CodecError::UnknownTag {
                    field: "app message code",
                    value: other,
                })
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppMessage {
    pub code: AppMessageCode,
    pub data: Vec<u8>,
}

impl AppMessage {
    pub fn new(code: AppMessageCode, data: impl Into<Vec<u8>>) -> Self {
        Self {
            code,
            data: data.into(),
        }
    }
}

impl WireRecord for AppMessage {
    fn write_to(&self, w: &mut WireWriter) {
        w.write_i32(self.code as i32);
        w.write_bytes(&self.data);
    }

    fn read_from(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            code: AppMessageCode::from_i32(r.read_i32()?)?,
            data: r.read_bytes()?,
        })
    }
}
