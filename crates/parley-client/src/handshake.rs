//! Key-exchange state machine and its driver.
//!
//! The state lives in memory next to each contact and is re-derived from the
//! persisted record at load. Transitions are pure; [`KeyExchange`] performs
//! the side effects (key generation, sending) through the registry.

use std::sync::Arc;

use parley_shared::constants::HANDSHAKE_SEQ_KEYS;
use parley_shared::protocol::Envelope;
use parley_shared::types::{Address, KeyMask};
use tracing::{debug, info, warn};

use crate::contact::{Contact, KeyGeneration};
use crate::registry::ContactRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyExchangeState {
    NoKeys,
    AwaitingLocalGeneration,
    LocalKeysSent,
    AwaitingRemoteKeys,
    EstablishedPartial,
    EstablishedFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeEvent {
    /// The contact exists and is ready to negotiate keys.
    Created,
    /// Both local keys exist and the keys message was handed to the transport.
    KeysSent,
    /// The relay accepted the keys push.
    PushAcknowledged,
    /// A keys message was merged; `shared` slots are now known to both sides.
    KeysReceived { shared: usize },
    /// The in-flight handshake was discarded together with its keys.
    Abandoned,
}

impl KeyExchangeState {
    pub fn apply(self, event: KeyExchangeEvent) -> Self {
        use KeyExchangeEvent as E;
        use KeyExchangeState as S;

        match (self, event) {
            (_, E::Abandoned) => S::NoKeys,
            (S::EstablishedFull, _) => S::EstablishedFull,
            (S::NoKeys, E::Created) => S::AwaitingLocalGeneration,
            (S::AwaitingLocalGeneration, E::KeysSent) => S::LocalKeysSent,
            (S::LocalKeysSent, E::PushAcknowledged) => S::AwaitingRemoteKeys,
            (_, E::KeysReceived { shared }) if shared >= 2 => S::EstablishedFull,
            (_, E::KeysReceived { shared: 1 }) => S::EstablishedPartial,
            (state, _) => state,
        }
    }

    /// Best reconstruction of the state from a persisted record. Keys sent
    /// but never acknowledged by the relay count as still in flight.
    pub fn from_contact(contact: &Contact) -> Self {
        let sent = contact.handshake_stage() >= i32::from(HANDSHAKE_SEQ_KEYS);
        match contact.session_key_count() {
            0 => Self::NoKeys,
            _ if !sent => Self::AwaitingLocalGeneration,
            2 if !contact.relay_push_acked() => Self::LocalKeysSent,
            1 => Self::EstablishedPartial,
            _ => Self::EstablishedFull,
        }
    }

    pub fn is_established(self) -> bool {
        matches!(self, Self::EstablishedPartial | Self::EstablishedFull)
    }

    /// Whether the local side has already offered its own keys.
    pub fn has_sent_keys(self) -> bool {
        matches!(self, Self::LocalKeysSent | Self::AwaitingRemoteKeys)
    }
}

/// Drives the handshake for contacts held by a [`ContactRegistry`].
#[derive(Clone)]
pub struct KeyExchange {
    registry: Arc<ContactRegistry>,
}

impl KeyExchange {
    pub fn new(registry: Arc<ContactRegistry>) -> Self {
        Self { registry }
    }

    /// Advance one contact and return the keys envelope it sent, if any, so
    /// the caller can push it to the relay.
    ///
    /// - `AwaitingLocalGeneration`: fill both key slots and send them.
    /// - `LocalKeysSent` without a relay acknowledgement: send them again.
    ///
    /// Failures are logged and leave the state for the next tick.
    pub fn tick(&self, address: &Address) -> Option<Envelope> {
        match self.registry.exchange_state(address)? {
            KeyExchangeState::AwaitingLocalGeneration => self.generate_and_send(address),
            KeyExchangeState::LocalKeysSent => self.resend_unacknowledged(address),
            _ => None,
        }
    }

    fn generate_and_send(&self, address: &Address) -> Option<Envelope> {
        loop {
            match self.registry.generate_session_keys(address) {
                Ok(KeyGeneration::Progressed(slot)) => {
                    debug!(contact = %address, ?slot, "session key generated");
                }
                Ok(KeyGeneration::NoOp) => break,
                Err(e) => {
                    warn!(contact = %address, error = %e, "key generation did not progress");
                    return None;
                }
            }
        }

        // Stage first: a push acknowledged before this would be reset by it.
        if let Err(e) = self
            .registry
            .set_handshake_stage(address, i32::from(HANDSHAKE_SEQ_KEYS))
        {
            warn!(contact = %address, error = %e, "failed to persist handshake stage");
            return None;
        }

        let envelope = match self.registry.send_keys_envelope(address, KeyMask::ALL) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(contact = %address, error = %e, "sending keys did not progress");
                return None;
            }
        };
        self.registry.apply_exchange(address, KeyExchangeEvent::KeysSent);

        info!(contact = %address, "session keys sent");
        Some(envelope)
    }

    fn resend_unacknowledged(&self, address: &Address) -> Option<Envelope> {
        if self.registry.get(address)?.relay_push_acked() {
            return None;
        }
        match self.registry.send_keys_envelope(address, KeyMask::ALL) {
            Ok(envelope) => {
                debug!(contact = %address, "unacknowledged session keys sent again");
                Some(envelope)
            }
            Err(e) => {
                warn!(contact = %address, error = %e, "resending keys failed");
                None
            }
        }
    }

    /// Tick every contact; returns the envelopes that were sent.
    pub fn tick_all(&self) -> Vec<Envelope> {
        self.registry
            .addresses()
            .iter()
            .filter_map(|address| self.tick(address))
            .collect()
    }
}
