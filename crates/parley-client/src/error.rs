use parley_net::{RelayError, TransportError};
use parley_shared::error::{CodecError, CryptoError, IdentityError, ProtocolError};
use parley_shared::types::Address;
use parley_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Decode error: {0}")]
    Codec(#[from] CodecError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Unknown contact {0}")]
    UnknownContact(Address),

    #[error("No public key for contact {0}")]
    MissingPublicKey(Address),
}

pub type Result<T> = std::result::Result<T, ClientError>;
