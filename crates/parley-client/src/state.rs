//! User-facing operations over the contact registry.
//!
//! The [`Messenger`] is what a front end holds: it adds and accepts
//! contacts, sends messages and receipts, and drives the key exchange.

use std::sync::Arc;

use parley_shared::constants::HANDSHAKE_SEQ_REQUEST;
use parley_shared::error::ProtocolError;
use parley_shared::identity::derive_address;
use parley_shared::protocol::{AppMessage, AppMessageCode, Envelope, EnvelopeKind};
use parley_shared::types::{now_timestamp, Address, MessageId};
use tracing::{info, warn};

use crate::contact::Contact;
use crate::error::Result;
use crate::handshake::{KeyExchange, KeyExchangeEvent};
use crate::message::{FriendMessage, MessageKind};
use crate::registry::ContactRegistry;

fn app_code(kind: MessageKind) -> Option<AppMessageCode> {
    match kind {
        MessageKind::Standard => Some(AppMessageCode::Chat),
        MessageKind::FundsRequest => Some(AppMessageCode::RequestFunds),
        MessageKind::FundsSent => Some(AppMessageCode::SentFunds),
        MessageKind::FileHeader => Some(AppMessageCode::FileHeader),
        MessageKind::ContactRequest => None,
    }
}

#[derive(Clone)]
pub struct Messenger {
    registry: Arc<ContactRegistry>,
    exchange: KeyExchange,
}

impl Messenger {
    pub fn new(registry: Arc<ContactRegistry>) -> Self {
        let exchange = KeyExchange::new(registry.clone());
        Self { registry, exchange }
    }

    pub fn registry(&self) -> &Arc<ContactRegistry> {
        &self.registry
    }

    /// Add a contact by public key and send it a contact request.
    pub fn add_contact(&self, public_key: &[u8], nickname: &str) -> Result<Address> {
        let address = derive_address(public_key);
        let contact = Contact::new(address.clone(), Some(public_key.to_vec()), nickname, true);
        if !self.registry.add(contact)? {
            self.registry.set_public_key(&address, public_key)?;
            self.registry.approve(&address)?;
        }
        self.registry
            .set_handshake_stage(&address, i32::from(HANDSHAKE_SEQ_REQUEST))?;

        let own_key = self.registry.identity().public_key_bytes();
        self.registry.send_app_message(
            &address,
            vec![HANDSHAKE_SEQ_REQUEST],
            EnvelopeKind::Info,
            AppMessage::new(AppMessageCode::RequestAdd, own_key.to_vec()),
            false,
        )?;
        info!(contact = %address, "contact request sent");
        Ok(address)
    }

    /// Approve a pending request, tell the requester and start the key
    /// exchange. Returns the keys envelope when one was sent.
    pub fn accept_contact(&self, address: &Address) -> Result<Option<Envelope>> {
        self.registry.approve(address)?;
        self.registry.send_app_message(
            address,
            MessageId::generate().0,
            EnvelopeKind::Info,
            AppMessage::new(AppMessageCode::AcceptAdd, Vec::new()),
            false,
        )?;
        self.registry.apply_exchange(address, KeyExchangeEvent::Created);
        Ok(self.exchange.tick(address))
    }

    /// Remove a contact and its history.
    pub fn remove_contact(&self, address: &Address) -> Result<bool> {
        self.registry.remove(address)
    }

    /// Log a local message and send it, sealed when a session key exists.
    pub fn send_message(&self, address: &Address, body: &str, kind: MessageKind) -> Result<MessageId> {
        let code = app_code(kind).ok_or_else(|| {
            ProtocolError::Unexpected("contact requests are sent with add_contact".into())
        })?;

        let message = FriendMessage::new(None, kind, body, now_timestamp(), true);
        let id = message.id().clone();
        self.registry.append_message(address, message)?;
        self.registry.send_app_message(
            address,
            id.0.clone(),
            EnvelopeKind::Data,
            AppMessage::new(code, body.as_bytes()),
            true,
        )?;
        Ok(id)
    }

    /// Mark the conversation read and tell the sender. Returns the id of the
    /// message that was marked.
    pub fn mark_read(&self, address: &Address) -> Result<Option<MessageId>> {
        let marked = self.registry.mark_last_read(address)?;
        if let Some(id) = &marked {
            let receipt = AppMessage::new(AppMessageCode::MsgRead, id.0.clone());
            if let Err(e) = self.registry.send_app_message(
                address,
                MessageId::generate().0,
                EnvelopeKind::Info,
                receipt,
                true,
            ) {
                warn!(contact = %address, error = %e, "failed to send read receipt");
            }
        }
        Ok(marked)
    }

    /// Announce our nickname to one contact.
    pub fn send_nickname(&self, address: &Address, nickname: &str) -> Result<()> {
        self.registry.send_app_message(
            address,
            MessageId::generate().0,
            EnvelopeKind::Info,
            AppMessage::new(AppMessageCode::Nick, nickname.as_bytes()),
            true,
        )?;
        Ok(())
    }

    /// Advance every pending key exchange.
    pub fn tick_all(&self) -> Vec<Envelope> {
        self.exchange.tick_all()
    }
}
