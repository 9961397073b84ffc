//! Peer transport seam.
//!
//! The session core never moves bytes itself. It hands signed envelopes to a
//! [`Transport`]; whatever sits behind it (a P2P stack, the relay pump in the
//! daemon, a test harness) drains them. [`ChannelTransport`] is the default
//! implementation: a bounded tokio mpsc queue drained by a separate task.

use parley_shared::codec::WireRecord;
use parley_shared::protocol::Envelope;
use parley_shared::types::Address;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Outbound queue is full")]
    QueueFull,

    #[error("Outbound queue is closed")]
    Closed,
}

/// Addressing information the transport needs about a contact.
#[derive(Debug, Clone, Copy)]
pub struct Recipient<'a> {
    pub address: &'a Address,
    pub public_key: Option<&'a [u8]>,
}

/// Outbound half of the peer transport.
pub trait Transport: Send + Sync {
    /// Queue an envelope for delivery. Must not block.
    fn send(&self, recipient: Recipient<'_>, envelope: &Envelope) -> Result<(), TransportError>;
}

/// An envelope waiting in the outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub recipient: Address,
    pub envelope: Envelope,
}

impl OutboundEnvelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.envelope.to_wire()
    }
}

/// [`Transport`] backed by a bounded tokio mpsc channel.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<OutboundEnvelope>,
}

impl ChannelTransport {
    /// Create the transport and the receiving end that drains it.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, recipient: Recipient<'_>, envelope: &Envelope) -> Result<(), TransportError> {
        let outbound = OutboundEnvelope {
            recipient: recipient.address.clone(),
            envelope: envelope.clone(),
        };
        self.tx.try_send(outbound).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })?;

        tracing::trace!(recipient = %recipient.address, "envelope queued");
        Ok(())
    }
}
