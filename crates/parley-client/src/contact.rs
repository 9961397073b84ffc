//! Contact record: identity, negotiated session keys and handshake progress.

use std::collections::BTreeMap;

use parley_shared::codec::{WireReader, WireRecord, WireWriter};
use parley_shared::crypto::{generate_session_key, session_key_from_slice, SessionKey};
use parley_shared::error::{CodecError, CryptoError};
use parley_shared::identity::derive_address;
use parley_shared::types::{now_timestamp, Address, KeyMask, SessionSlot};

/// A sub-identity relayed by a bot contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotContact {
    pub nickname: String,
    pub public_key: Vec<u8>,
}

impl BotContact {
    pub fn address(&self) -> Address {
        derive_address(&self.public_key)
    }
}

impl WireRecord for BotContact {
    fn write_to(&self, w: &mut WireWriter) {
        w.write_string(&self.nickname);
        w.write_optional_bytes(Some(&self.public_key));
    }

    fn read_from(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let nickname = r.read_string()?;
        let public_key = r
            .read_optional_bytes()?
            .ok_or(CodecError::Invalid("bot contact without public key"))?;
        Ok(Self {
            nickname,
            public_key,
        })
    }
}

/// Result of one [`Contact::generate_session_keys`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGeneration {
    Progressed(SessionSlot),
    NoOp,
}

/// What happened to one slot during [`Contact::receive_keys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMerge {
    /// The slot was empty and took the offered key.
    Adopted,
    /// The offered key equals the one already held.
    Matched,
    /// The slot already held a different key; the offer was dropped.
    Ignored,
    /// Nothing was offered for this slot.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeysMerge {
    pub a: KeyMerge,
    pub b: KeyMerge,
}

impl KeysMerge {
    /// Slots whose key is now known to both sides.
    pub fn shared(&self) -> usize {
        [self.a, self.b]
            .iter()
            .filter(|m| matches!(m, KeyMerge::Adopted | KeyMerge::Matched))
            .count()
    }

    pub fn adopted_any(&self) -> bool {
        self.a == KeyMerge::Adopted || self.b == KeyMerge::Adopted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub wallet_address: Address,
    pub public_key: Option<Vec<u8>>,
    pub nickname: String,
    session_key_a: Option<SessionKey>,
    session_key_b: Option<SessionKey>,
    pub key_generated_time: i64,
    pub approved: bool,
    handshake_stage: i32,
    pub bot: bool,
    relay_push_acked: bool,
    pub bot_contacts: BTreeMap<Address, BotContact>,
    pub last_received_message_id: Option<Vec<u8>>,
    pub last_received_handshake_timestamp: i64,
}

impl Contact {
    pub fn new(
        wallet_address: Address,
        public_key: Option<Vec<u8>>,
        nickname: impl Into<String>,
        approved: bool,
    ) -> Self {
        Self {
            wallet_address,
            public_key,
            nickname: nickname.into(),
            session_key_a: None,
            session_key_b: None,
            key_generated_time: 0,
            approved,
            handshake_stage: 0,
            bot: false,
            relay_push_acked: false,
            bot_contacts: BTreeMap::new(),
            last_received_message_id: None,
            last_received_handshake_timestamp: 0,
        }
    }

    pub fn session_key(&self, slot: SessionSlot) -> Option<&SessionKey> {
        match slot {
            SessionSlot::A => self.session_key_a.as_ref(),
            SessionSlot::B => self.session_key_b.as_ref(),
        }
    }

    pub fn session_key_count(&self) -> usize {
        usize::from(self.session_key_a.is_some()) + usize::from(self.session_key_b.is_some())
    }

    pub fn has_both_keys(&self) -> bool {
        self.session_key_count() == 2
    }

    /// Slot used to seal outgoing payloads: B when present, otherwise A.
    pub fn preferred_slot(&self) -> Option<SessionSlot> {
        if self.session_key_b.is_some() {
            Some(SessionSlot::B)
        } else if self.session_key_a.is_some() {
            Some(SessionSlot::A)
        } else {
            None
        }
    }

    pub fn handshake_stage(&self) -> i32 {
        self.handshake_stage
    }

    pub fn relay_push_acked(&self) -> bool {
        self.relay_push_acked
    }

    /// Fill the first empty key slot. Exactly one key per call, so a key that
    /// may already be on its way to the peer is never regenerated.
    pub fn generate_session_keys(&mut self) -> Result<KeyGeneration, CryptoError> {
        let slot = match (&self.session_key_a, &self.session_key_b) {
            (None, _) => SessionSlot::A,
            (Some(_), None) => SessionSlot::B,
            (Some(_), Some(_)) => return Ok(KeyGeneration::NoOp),
        };

        let key = generate_session_key()?;
        match slot {
            SessionSlot::A => self.session_key_a = Some(key),
            SessionSlot::B => self.session_key_b = Some(key),
        }
        self.key_generated_time = now_timestamp();
        Ok(KeyGeneration::Progressed(slot))
    }

    /// Two optional length-prefixed keys, A then B, filtered by `mask`.
    pub fn keys_payload(&self, mask: KeyMask) -> Vec<u8> {
        let mut w = WireWriter::new();
        for slot in [SessionSlot::A, SessionSlot::B] {
            let key = self
                .session_key(slot)
                .filter(|_| mask.includes(slot))
                .map(|k| k.as_slice());
            w.write_optional_bytes(key);
        }
        w.finish()
    }

    /// Merge a peer's keys payload. A slot that already holds a key keeps it.
    /// The payload is fully validated before anything is written.
    pub fn receive_keys(&mut self, payload: &[u8]) -> Result<KeysMerge, CodecError> {
        let mut r = WireReader::new(payload);
        let offered_a = read_session_key(&mut r)?;
        let offered_b = read_session_key(&mut r)?;

        Ok(KeysMerge {
            a: merge_slot(&mut self.session_key_a, offered_a),
            b: merge_slot(&mut self.session_key_b, offered_b),
        })
    }

    /// Advance the handshake stage. Lower or equal values are ignored.
    /// A change invalidates any earlier relay acknowledgement.
    pub fn set_handshake_stage(&mut self, stage: i32) -> bool {
        if stage <= self.handshake_stage {
            return false;
        }
        self.handshake_stage = stage;
        self.relay_push_acked = false;
        true
    }

    /// Record that the relay accepted a push for handshake `sequence`.
    /// Only pushes at or beyond the current stage count.
    pub fn acknowledge_relay_push(&mut self, sequence: i32) -> bool {
        if sequence < self.handshake_stage || self.relay_push_acked {
            return false;
        }
        self.relay_push_acked = true;
        true
    }

    /// Drop both key slots. This is the only path that empties a slot.
    pub fn reset_session_keys(&mut self) {
        self.session_key_a = None;
        self.session_key_b = None;
        self.key_generated_time = 0;
    }

    pub fn add_bot_contact(&mut self, contact: BotContact) -> Address {
        let address = contact.address();
        self.bot_contacts.insert(address.clone(), contact);
        address
    }
}

fn read_session_key(r: &mut WireReader<'_>) -> Result<Option<SessionKey>, CodecError> {
    match r.read_optional_bytes()? {
        None => Ok(None),
        Some(bytes) => session_key_from_slice(&bytes)
            .map(Some)
            .map_err(|_| CodecError::Invalid("session key length")),
    }
}

fn merge_slot(slot: &mut Option<SessionKey>, offered: Option<SessionKey>) -> KeyMerge {
    match (slot.as_ref(), offered) {
        (_, None) => KeyMerge::Absent,
        (None, Some(key)) => {
            *slot = Some(key);
            KeyMerge::Adopted
        }
        (Some(held), Some(key)) if *held == key => KeyMerge::Matched,
        (Some(_), Some(_)) => KeyMerge::Ignored,
    }
}

impl WireRecord for Contact {
    fn write_to(&self, w: &mut WireWriter) {
        w.write_bytes(self.wallet_address.as_bytes());
        w.write_optional_bytes(self.public_key.as_deref());
        w.write_string(&self.nickname);
        w.write_optional_bytes(self.session_key_a.as_ref().map(|k| k.as_slice()));
        w.write_optional_bytes(self.session_key_b.as_ref().map(|k| k.as_slice()));
        w.write_i64(self.key_generated_time);
        w.write_bool(self.approved);
        w.write_i32(self.handshake_stage);
        w.write_bool(self.bot);
        w.write_bool(self.relay_push_acked);
        w.write_i32(i32::try_from(self.bot_contacts.len()).unwrap_or(i32::MAX));
        for contact in self.bot_contacts.values() {
            w.write_record(contact);
        }
        w.write_optional_bytes(self.last_received_message_id.as_deref());
        w.write_i64(self.last_received_handshake_timestamp);
    }

    fn read_from(r: &mut WireReader<'_>) -> Result<Self, CodecError> {
        let wallet_address = Address(r.read_bytes()?);
        if wallet_address.as_bytes().is_empty() {
            return Err(CodecError::Invalid("empty wallet address"));
        }
        let public_key = r.read_optional_bytes()?;
        let nickname = r.read_string()?;
        let session_key_a = read_session_key(r)?;
        let session_key_b = read_session_key(r)?;
        let key_generated_time = r.read_i64()?;
        let approved = r.read_bool()?;
        let handshake_stage = r.read_i32()?;
        let bot = r.read_bool()?;
        let relay_push_acked = r.read_bool()?;

        let count = r.read_i32()?;
        let count = usize::try_from(count).map_err(|_| CodecError::NegativeLength(count))?;
        let mut bot_contacts = BTreeMap::new();
        for _ in 0..count {
            let contact: BotContact = r.read_record()?;
            bot_contacts.insert(contact.address(), contact);
        }

        Ok(Self {
            wallet_address,
            public_key,
            nickname,
            session_key_a,
            session_key_b,
            key_generated_time,
            approved,
            handshake_stage,
            bot,
            relay_push_acked,
            bot_contacts,
            last_received_message_id: r.read_optional_bytes()?,
            last_received_handshake_timestamp: r.read_i64()?,
        })
    }
}
