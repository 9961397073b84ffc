use thiserror::Error;

use crate::types::SessionSlot;

/// Malformed or truncated binary input. Always recoverable by discarding the
/// offending record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Negative length prefix: {0}")]
    NegativeLength(i32),

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Invalid boolean byte: {0:#04x}")]
    InvalidBool(u8),

    #[error("Unknown {field} tag: {value}")]
    UnknownTag { field: &'static str, value: i32 },

    #[error("Invalid field: {0}")]
    Invalid(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Secure random source unavailable")]
    RandomUnavailable,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Key file error: {0}")]
    KeyFile(String),
}

/// A structurally valid message that the session core refuses to act on.
/// The message is dropped; contact state is left untouched.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unexpected message: {0}")]
    Unexpected(String),

    #[error("Stale handshake message: timestamp {timestamp} older than {last_seen}")]
    StaleHandshake { timestamp: i64, last_seen: i64 },

    #[error("Message from unknown sender")]
    UnknownSender,

    #[error("Envelope signature does not verify")]
    BadSignature,

    #[error("No session key in slot {0:?}")]
    MissingSessionKey(SessionSlot),

    #[error("Malformed keys payload: {0}")]
    MalformedKeys(#[from] CodecError),
}
