//! Inbound decode path: envelope bytes from the transport or the relay are
//! verified, opened and dispatched to the registry.

use std::sync::Arc;

use parley_shared::codec::WireRecord;
use parley_shared::constants::{HANDSHAKE_SEQ_KEYS, HANDSHAKE_SEQ_REQUEST};
use parley_shared::crypto;
use parley_shared::error::ProtocolError;
use parley_shared::identity::{derive_address, Identity};
use parley_shared::protocol::{AppMessage, AppMessageCode, Envelope, EnvelopeKind};
use parley_shared::types::{now_timestamp, Address, EncryptionType, KeyMask, MessageId};
use tracing::{debug, info, warn};

use crate::contact::Contact;
use crate::error::{ClientError, Result};
use crate::handshake::{KeyExchange, KeyExchangeEvent};
use crate::message::{FriendMessage, MessageKind};
use crate::registry::ContactRegistry;

/// Receiver of raw envelope bytes. `source` is the peer the transport saw
/// the bytes come from, when it knows.
pub trait InboundSink: Send + Sync {
    fn receive_data(&self, raw: &[u8], source: Option<&Address>) -> Result<()>;
}

fn loggable_kind(code: AppMessageCode) -> Option<MessageKind> {
    match code {
        AppMessageCode::Chat => Some(MessageKind::Standard),
        AppMessageCode::RequestFunds => Some(MessageKind::FundsRequest),
        AppMessageCode::SentFunds => Some(MessageKind::FundsSent),
        AppMessageCode::FileHeader => Some(MessageKind::FileHeader),
        _ => None,
    }
}

/// Open the data field. Asymmetric payloads are sealed to the local
/// identity; symmetric ones use the slot the envelope names. Unencrypted
/// payloads are refused.
fn open_payload(identity: &Identity, contact: Option<&Contact>, envelope: &Envelope) -> Result<Vec<u8>> {
    if envelope.encryption == EncryptionType::Asymmetric {
        return Ok(identity.open_sealed(&envelope.data)?);
    }
    let slot = envelope
        .encryption
        .session_slot()
        .ok_or_else(|| ProtocolError::Unexpected("unencrypted payload".into()))?;
    let key = contact
        .and_then(|c| c.session_key(slot))
        .ok_or(ProtocolError::MissingSessionKey(slot))?;
    Ok(crypto::decrypt(slot, key, &envelope.data)?)
}

pub struct Inbound {
    registry: Arc<ContactRegistry>,
    exchange: KeyExchange,
}

impl Inbound {
    pub fn new(registry: Arc<ContactRegistry>) -> Self {
        let exchange = KeyExchange::new(registry.clone());
        Self { registry, exchange }
    }

    fn handle(&self, envelope: Envelope) -> Result<()> {
        let local = self.registry.identity().address();
        if envelope.recipient != local {
            return Err(ProtocolError::Unexpected(format!(
                "envelope addressed to {}",
                envelope.recipient
            ))
            .into());
        }

        let Some(contact) = self.registry.get(&envelope.sender) else {
            return self.handle_unknown_sender(&envelope);
        };

        if let Some(public_key) = &contact.public_key {
            envelope
                .verify(public_key)
                .map_err(|_| ProtocolError::BadSignature)?;
        }

        let plain = open_payload(self.registry.identity(), Some(&contact), &envelope)?;
        let message = AppMessage::from_wire(&plain)?;
        debug!(contact = %envelope.sender, code = ?message.code, "inbound message");
        self.dispatch(&contact, &envelope, message)
    }

    /// Only a self-authenticating contact request may introduce a new sender.
    fn handle_unknown_sender(&self, envelope: &Envelope) -> Result<()> {
        if envelope.encryption != EncryptionType::Asymmetric {
            return Err(ProtocolError::UnknownSender.into());
        }
        let plain = open_payload(self.registry.identity(), None, envelope)?;
        let message = AppMessage::from_wire(&plain)?;
        if message.code != AppMessageCode::RequestAdd {
            return Err(ProtocolError::UnknownSender.into());
        }

        let public_key = &message.data;
        if derive_address(public_key) != envelope.sender {
            return Err(ProtocolError::Unexpected("request key does not match sender".into()).into());
        }
        envelope
            .verify(public_key)
            .map_err(|_| ProtocolError::BadSignature)?;

        let address = self.registry.resolve_or_create(public_key)?;
        info!(contact = %address, "contact request from new sender");
        self.on_request_add(&address, envelope, public_key)
    }

    fn dispatch(&self, contact: &Contact, envelope: &Envelope, message: AppMessage) -> Result<()> {
        let sender = &contact.wallet_address;
        match message.code {
            AppMessageCode::RequestAdd => self.on_request_add(sender, envelope, &message.data),
            AppMessageCode::AcceptAdd => {
                self.registry.approve(sender)?;
                info!(contact = %sender, "contact accepted our request");
                self.exchange.tick(sender);
                Ok(())
            }
            AppMessageCode::Keys => self.on_keys(sender, envelope, &message.data),
            AppMessageCode::MsgReceived | AppMessageCode::MsgRead => {
                self.registry
                    .set_message_received(sender, &MessageId(message.data))?;
                Ok(())
            }
            AppMessageCode::Nick => {
                let nickname = String::from_utf8_lossy(&message.data);
                self.registry.set_nickname(sender, &nickname)?;
                Ok(())
            }
            code => match loggable_kind(code) {
                Some(kind) => self.on_loggable(contact, envelope, kind, &message.data),
                None => Err(ProtocolError::Unexpected(format!("unhandled code {code:?}")).into()),
            },
        }
    }

    fn on_request_add(&self, sender: &Address, envelope: &Envelope, public_key: &[u8]) -> Result<()> {
        if derive_address(public_key) != *sender {
            return Err(ProtocolError::Unexpected("request key does not match sender".into()).into());
        }
        self.registry.set_public_key(sender, public_key)?;
        self.registry
            .set_handshake_stage(sender, i32::from(HANDSHAKE_SEQ_REQUEST))?;

        let mut request = FriendMessage::new(
            Some(envelope.message_id()),
            MessageKind::ContactRequest,
            "",
            envelope.timestamp,
            false,
        );
        request.sender_address = Some(sender.clone());
        request.received_timestamp = now_timestamp();
        self.registry.append_message(sender, request)?;
        Ok(())
    }

    fn on_keys(&self, sender: &Address, envelope: &Envelope, payload: &[u8]) -> Result<()> {
        let initiated = self
            .registry
            .exchange_state(sender)
            .is_some_and(|s| s.has_sent_keys() || s.is_established());

        let merge = self
            .registry
            .receive_keys(sender, payload, envelope.timestamp)?;
        let state = self.registry.apply_exchange(
            sender,
            KeyExchangeEvent::KeysReceived {
                shared: merge.shared(),
            },
        );
        debug!(contact = %sender, ?merge, ?state, "keys merged");

        // Echo adopted keys so the initiator learns they are shared.
        if !initiated && merge.adopted_any() && self.registry.send_keys(sender, KeyMask::ALL) {
            self.registry
                .set_handshake_stage(sender, i32::from(HANDSHAKE_SEQ_KEYS))?;
        }
        Ok(())
    }

    fn on_loggable(
        &self,
        contact: &Contact,
        envelope: &Envelope,
        kind: MessageKind,
        body: &[u8],
    ) -> Result<()> {
        let sender = &contact.wallet_address;
        if contact.bot && !self.registry.record_bot_message(sender, &envelope.id)? {
            debug!(contact = %sender, "repeated bot message ignored");
            return Ok(());
        }

        let mut message = FriendMessage::new(
            Some(envelope.message_id()),
            kind,
            String::from_utf8_lossy(body),
            envelope.timestamp,
            false,
        );
        message.sender_address = Some(sender.clone());
        message.sender_nick = contact.nickname.clone();
        message.received_timestamp = now_timestamp();
        self.registry.append_message(sender, message)?;

        // Receipts are repeated for duplicates; the sender may have missed one.
        let receipt = AppMessage::new(AppMessageCode::MsgReceived, envelope.id.clone());
        if let Err(e) = self.registry.send_app_message(
            sender,
            MessageId::generate().0,
            EnvelopeKind::Info,
            receipt,
            true,
        ) {
            warn!(contact = %sender, error = %e, "failed to send delivery receipt");
        }
        Ok(())
    }
}

impl InboundSink for Inbound {
    fn receive_data(&self, raw: &[u8], source: Option<&Address>) -> Result<()> {
        let envelope = Envelope::from_wire(raw)?;
        if let Some(source) = source {
            if *source != envelope.sender {
                return Err(ClientError::Protocol(ProtocolError::Unexpected(format!(
                    "envelope from {} relayed by {}",
                    envelope.sender, source
                ))));
            }
        }
        self.handle(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::KeyExchangeState;
    use parley_net::{ChannelTransport, OutboundEnvelope};
    use parley_shared::types::SessionSlot;
    use parley_store::MemoryStore;
    use tokio::sync::mpsc;

    struct Peer {
        registry: Arc<ContactRegistry>,
        inbound: Inbound,
        outbound: mpsc::Receiver<OutboundEnvelope>,
    }

    impl Peer {
        fn new() -> Self {
            let (transport, outbound) = ChannelTransport::new(32);
            let registry = Arc::new(ContactRegistry::new(
                Arc::new(Identity::generate()),
                Arc::new(MemoryStore::new()),
                Arc::new(transport),
            ));
            Self {
                inbound: Inbound::new(registry.clone()),
                registry,
                outbound,
            }
        }

        fn address(&self) -> Address {
            self.registry.identity().address()
        }

        fn public_key(&self) -> Vec<u8> {
            self.registry.identity().public_key_bytes().to_vec()
        }

        fn know(&self, other: &Peer) {
            self.registry
                .add(Contact::new(other.address(), Some(other.public_key()), "peer", true))
                .unwrap();
        }

        fn take(&mut self) -> Envelope {
            self.outbound.try_recv().unwrap().envelope
        }
    }

    fn deliver(to: &Peer, envelope: &Envelope) -> Result<()> {
        to.inbound.receive_data(&envelope.to_wire(), None)
    }

    fn request_add(from: &Peer) -> AppMessage {
        AppMessage::new(AppMessageCode::RequestAdd, from.public_key())
    }

    /// Both sides know each other and share both keys.
    fn established_pair() -> (Peer, Peer) {
        let mut alice = Peer::new();
        let mut bob = Peer::new();
        alice.know(&bob);
        bob.know(&alice);

        let bob_addr = bob.address();
        bob.registry.apply_exchange(&alice.address(), KeyExchangeEvent::Created);
        KeyExchange::new(bob.registry.clone()).tick(&alice.address()).unwrap();
        let keys = bob.take();

        deliver(&alice, &keys).unwrap();
        let echo = alice.take();
        deliver(&bob, &echo).unwrap();

        assert_eq!(
            alice.registry.exchange_state(&bob_addr),
            Some(KeyExchangeState::EstablishedFull)
        );
        (alice, bob)
    }

    #[test]
    fn request_from_unknown_sender_creates_unapproved_contact() {
        let mut alice = Peer::new();
        let bob = Peer::new();
        alice.know(&bob);

        alice
            .registry
            .send_app_message(&bob.address(), vec![1], EnvelopeKind::Info, request_add(&alice), false)
            .unwrap();
        deliver(&bob, &alice.take()).unwrap();

        let contact = bob.registry.get(&alice.address()).unwrap();
        assert!(!contact.approved);
        assert_eq!(contact.handshake_stage(), 1);
        assert_eq!(contact.public_key, Some(alice.public_key()));

        let log = bob.registry.messages(&alice.address()).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, MessageKind::ContactRequest);
    }

    #[test]
    fn unknown_sender_without_request_is_rejected() {
        let mut alice = Peer::new();
        let bob = Peer::new();
        alice.know(&bob);

        alice
            .registry
            .send_app_message(
                &bob.address(),
                vec![9; 16],
                EnvelopeKind::Data,
                AppMessage::new(AppMessageCode::Chat, "hello"),
                false,
            )
            .unwrap();
        let err = deliver(&bob, &alice.take()).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(ProtocolError::UnknownSender)));
        assert!(bob.registry.is_empty());
    }

    #[test]
    fn request_with_foreign_key_is_rejected() {
        let mut alice = Peer::new();
        let bob = Peer::new();
        let mallory = Peer::new();
        alice.know(&bob);

        alice
            .registry
            .send_app_message(&bob.address(), vec![1], EnvelopeKind::Info, request_add(&mallory), false)
            .unwrap();
        assert!(deliver(&bob, &alice.take()).is_err());
        assert!(bob.registry.is_empty());
    }

    #[test]
    fn tampered_envelope_fails_signature_check() {
        let (mut alice, bob) = established_pair();
        alice
            .registry
            .send_app_message(
                &bob.address(),
                vec![3; 16],
                EnvelopeKind::Data,
                AppMessage::new(AppMessageCode::Chat, "hi"),
                true,
            )
            .unwrap();
        let mut envelope = alice.take();
        envelope.timestamp += 1;

        let err = deliver(&bob, &envelope).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(ProtocolError::BadSignature)));
        assert_eq!(bob.registry.message_count(&alice.address()).unwrap(), 0);
    }

    #[test]
    fn misaddressed_envelope_is_rejected() {
        let mut alice = Peer::new();
        let bob = Peer::new();
        let carol = Peer::new();
        alice.know(&bob);

        alice
            .registry
            .send_app_message(&bob.address(), vec![1], EnvelopeKind::Info, request_add(&alice), false)
            .unwrap();
        assert!(deliver(&carol, &alice.take()).is_err());
    }

    #[test]
    fn source_hint_must_match_sender() {
        let mut alice = Peer::new();
        let bob = Peer::new();
        alice.know(&bob);

        alice
            .registry
            .send_app_message(&bob.address(), vec![1], EnvelopeKind::Info, request_add(&alice), false)
            .unwrap();
        let raw = alice.take().to_wire();
        let stranger = Address(vec![1, 2, 3]);
        assert!(bob.inbound.receive_data(&raw, Some(&stranger)).is_err());
        assert!(bob.inbound.receive_data(&raw, Some(&alice.address())).is_ok());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let bob = Peer::new();
        let err = bob.inbound.receive_data(&[1, 2, 3], None).unwrap_err();
        assert!(matches!(err, ClientError::Codec(_)));
    }

    #[test]
    fn key_exchange_converges_on_both_sides() {
        let (alice, bob) = established_pair();
        assert_eq!(
            bob.registry.exchange_state(&alice.address()),
            Some(KeyExchangeState::EstablishedFull)
        );

        let a = alice.registry.get(&bob.address()).unwrap();
        let b = bob.registry.get(&alice.address()).unwrap();
        assert_eq!(a.session_key(SessionSlot::A), b.session_key(SessionSlot::A));
        assert_eq!(a.session_key(SessionSlot::B), b.session_key(SessionSlot::B));
        assert_eq!(a.handshake_stage(), 2);
    }

    #[test]
    fn keys_travel_sealed_to_the_recipient() {
        let (alice, mut bob) = established_pair();
        bob.registry.send_keys(&alice.address(), KeyMask::ALL);
        let keys = bob.take();
        assert_eq!(keys.encryption, EncryptionType::Asymmetric);

        let record = bob.registry.get(&alice.address()).unwrap();
        for slot in [SessionSlot::A, SessionSlot::B] {
            let key = record.session_key(slot).unwrap();
            assert!(!keys.data.windows(key.len()).any(|w| w == key.as_slice()));
        }

        let opened = alice.registry.identity().open_sealed(&keys.data).unwrap();
        assert_eq!(AppMessage::from_wire(&opened).unwrap().code, AppMessageCode::Keys);
        assert!(Peer::new().registry.identity().open_sealed(&keys.data).is_err());
    }

    #[test]
    fn unencrypted_payload_is_refused() {
        let (alice, bob) = established_pair();
        let mut envelope = Envelope::new(
            vec![6; 16],
            EnvelopeKind::Data,
            alice.address(),
            bob.address(),
            EncryptionType::None,
            AppMessage::new(AppMessageCode::Chat, "plain").to_wire(),
        );
        envelope.sign(alice.registry.identity());

        let err = deliver(&bob, &envelope).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(ProtocolError::Unexpected(_))));
        assert_eq!(bob.registry.message_count(&alice.address()).unwrap(), 0);
    }

    #[test]
    fn stale_keys_message_is_rejected() {
        let (alice, mut bob) = established_pair();
        bob.registry.send_keys(&alice.address(), KeyMask::ALL);
        let mut keys = bob.take();
        keys.timestamp = 0;
        keys.sign(bob.registry.identity());

        let err = deliver(&alice, &keys).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::StaleHandshake { .. })
        ));
    }

    #[test]
    fn chat_is_logged_once_and_receipted() {
        let (mut alice, mut bob) = established_pair();
        let bob_addr = bob.address();
        let alice_addr = alice.address();

        let local = FriendMessage::new(None, MessageKind::Standard, "hello bob", now_timestamp(), true);
        let id = local.id().clone();
        alice.registry.append_message(&bob_addr, local).unwrap();
        alice
            .registry
            .send_app_message(
                &bob_addr,
                id.0.clone(),
                EnvelopeKind::Data,
                AppMessage::new(AppMessageCode::Chat, "hello bob"),
                true,
            )
            .unwrap();
        let chat = alice.take();
        assert_eq!(chat.encryption, EncryptionType::SymmetricB);

        deliver(&bob, &chat).unwrap();
        deliver(&bob, &chat).unwrap();
        let received = bob.registry.messages(&alice_addr).unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, "hello bob");
        assert_eq!(received[0].id(), &id);
        assert!(!received[0].local_sender());

        let receipt = bob.take();
        deliver(&alice, &receipt).unwrap();
        assert!(alice.registry.messages(&bob_addr).unwrap()[0].confirmed());
    }

    #[test]
    fn sealed_message_without_key_is_rejected() {
        let (alice, bob) = established_pair();
        bob.registry.abandon_handshake(&alice.address()).unwrap();

        let mut envelope = Envelope::new(
            vec![5; 16],
            EnvelopeKind::Data,
            alice.address(),
            bob.address(),
            EncryptionType::SymmetricA,
            vec![0; 40],
        );
        envelope.sign(alice.registry.identity());

        let err = deliver(&bob, &envelope).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol(ProtocolError::MissingSessionKey(SessionSlot::A))
        ));
    }

    #[test]
    fn nickname_update() {
        let (mut alice, bob) = established_pair();
        alice
            .registry
            .send_app_message(
                &bob.address(),
                vec![7; 16],
                EnvelopeKind::Info,
                AppMessage::new(AppMessageCode::Nick, "Alice"),
                true,
            )
            .unwrap();
        deliver(&bob, &alice.take()).unwrap();
        assert_eq!(bob.registry.get(&alice.address()).unwrap().nickname, "Alice");
    }
}
