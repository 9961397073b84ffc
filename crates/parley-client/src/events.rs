//! Change notifications for whoever renders contacts and conversations.
//!
//! Records never hold references to presentation code. The registry
//! publishes [`ContactEvent`]s on a broadcast channel and observers
//! subscribe.

use parley_shared::types::{Address, MessageId};
use tokio::sync::broadcast;

use crate::handshake::KeyExchangeState;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactEvent {
    ContactAdded(Address),
    ContactRemoved(Address),
    /// Nickname, approval, keys or handshake stage changed.
    ContactUpdated(Address),
    MessageAdded { address: Address, id: MessageId },
    /// A read or confirmed flag flipped.
    MessageUpdated { address: Address, id: MessageId },
    HistoryDeleted(Address),
    HandshakeProgressed {
        address: Address,
        state: KeyExchangeState,
    },
}

pub fn emit_event(tx: &broadcast::Sender<ContactEvent>, event: ContactEvent) {
    // No subscribers is the normal headless case.
    if tx.send(event).is_err() {
        tracing::trace!("contact event dropped, no subscribers");
    }
}
