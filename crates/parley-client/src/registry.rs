//! The contact registry: every known contact, its message log and its
//! in-memory key-exchange state.
//!
//! Locking:
//! - `contacts` (RwLock) guards membership only.
//! - each entry has a `session` lock (record + exchange state) and a `log`
//!   lock; they are never held together.
//! - `commit_lock` serializes registry-wide saves. A commit takes it, then
//!   `contacts`, then each `session` in turn, so no session lock may be held
//!   while committing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use parley_net::{Recipient, Transport};
use parley_shared::codec::WireRecord;
use parley_shared::constants::HANDSHAKE_SEQ_KEYS;
use parley_shared::crypto;
use parley_shared::error::ProtocolError;
use parley_shared::identity::{derive_address, Identity};
use parley_shared::protocol::{AppMessage, AppMessageCode, Envelope, EnvelopeKind};
use parley_shared::types::{Address, EncryptionType, KeyMask, MessageId};
use parley_store::{ContactRow, ContactStore};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::contact::{Contact, KeyGeneration, KeysMerge};
use crate::error::{ClientError, Result};
use crate::events::{emit_event, ContactEvent, EVENT_CHANNEL_CAPACITY};
use crate::handshake::{KeyExchangeEvent, KeyExchangeState};
use crate::message::{ConversationSummary, FlagUpdate, FriendMessage, MessageLog};

struct SessionState {
    contact: Contact,
    exchange: KeyExchangeState,
}

struct ContactEntry {
    session: Mutex<SessionState>,
    log: Mutex<MessageLog>,
}

impl ContactEntry {
    fn new(contact: Contact, log: MessageLog) -> Self {
        let exchange = KeyExchangeState::from_contact(&contact);
        Self {
            session: Mutex::new(SessionState { contact, exchange }),
            log: Mutex::new(log),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_fresh(contact: &Contact, timestamp: i64) -> std::result::Result<(), ProtocolError> {
    if timestamp < contact.last_received_handshake_timestamp {
        return Err(ProtocolError::StaleHandshake {
            timestamp,
            last_seen: contact.last_received_handshake_timestamp,
        });
    }
    Ok(())
}

pub struct ContactRegistry {
    identity: Arc<Identity>,
    store: Arc<dyn ContactStore>,
    transport: Arc<dyn Transport>,
    contacts: RwLock<BTreeMap<Address, Arc<ContactEntry>>>,
    commit_lock: Mutex<()>,
    events: broadcast::Sender<ContactEvent>,
}

impl ContactRegistry {
    pub fn new(
        identity: Arc<Identity>,
        store: Arc<dyn ContactStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            identity,
            store,
            transport,
            contacts: RwLock::new(BTreeMap::new()),
            commit_lock: Mutex::new(()),
            events,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContactEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Registry membership and persistence
    // -----------------------------------------------------------------------

    /// Replace the in-memory registry with the stored one. Undecodable
    /// records are skipped.
    pub fn load(&self) -> Result<usize> {
        let rows = self.store.load_contacts()?;
        let mut loaded = BTreeMap::new();

        for row in rows {
            let contact = match Contact::from_wire(&row.record) {
                Ok(contact) => contact,
                Err(e) => {
                    warn!(contact = %row.address, error = %e, "skipping undecodable contact");
                    continue;
                }
            };
            let log = match self.store.read_messages(&contact.wallet_address) {
                Ok(records) => MessageLog::from_records(&records),
                Err(e) => {
                    warn!(contact = %contact.wallet_address, error = %e, "failed to read message log");
                    MessageLog::new()
                }
            };
            loaded.insert(
                contact.wallet_address.clone(),
                Arc::new(ContactEntry::new(contact, log)),
            );
        }

        let count = loaded.len();
        *self.contacts.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        info!(count, "contact registry loaded");
        Ok(count)
    }

    /// Persist every contact record.
    pub fn commit(&self) -> Result<()> {
        let _guard = lock(&self.commit_lock);
        self.save_locked()
    }

    /// Caller holds `commit_lock`.
    fn save_locked(&self) -> Result<()> {
        let rows: Vec<ContactRow> = {
            let contacts = self.contacts.read().unwrap_or_else(PoisonError::into_inner);
            contacts
                .iter()
                .map(|(address, entry)| ContactRow {
                    address: address.clone(),
                    record: lock(&entry.session).contact.to_wire(),
                })
                .collect()
        };
        self.store.save_contacts(&rows)?;
        debug!(count = rows.len(), "contact registry committed");
        Ok(())
    }

    /// Add a contact. Returns false if the address is already known. The
    /// contact is dropped again when the registry cannot be saved.
    pub fn add(&self, contact: Contact) -> Result<bool> {
        let address = contact.wallet_address.clone();
        let _guard = lock(&self.commit_lock);
        {
            let mut contacts = self.contacts.write().unwrap_or_else(PoisonError::into_inner);
            if contacts.contains_key(&address) {
                return Ok(false);
            }
            contacts.insert(
                address.clone(),
                Arc::new(ContactEntry::new(contact, MessageLog::new())),
            );
        }
        if let Err(e) = self.save_locked() {
            self.contacts
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&address);
            return Err(e);
        }
        info!(contact = %address, "contact added");
        emit_event(&self.events, ContactEvent::ContactAdded(address));
        Ok(true)
    }

    /// Remove a contact together with its stored history.
    pub fn remove(&self, address: &Address) -> Result<bool> {
        let removed = self
            .contacts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
        let Some(entry) = removed else {
            return Ok(false);
        };

        self.store.delete_messages(address)?;
        lock(&entry.log).flush();
        self.commit()?;
        info!(contact = %address, "contact removed");
        emit_event(&self.events, ContactEvent::ContactRemoved(address.clone()));
        Ok(true)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.contacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(address)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.contacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.contacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one contact record.
    pub fn get(&self, address: &Address) -> Option<Contact> {
        self.with_session(address, |s| s.contact.clone()).ok()
    }

    fn entry(&self, address: &Address) -> Result<Arc<ContactEntry>> {
        self.contacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or_else(|| ClientError::UnknownContact(address.clone()))
    }

    fn with_session<R>(&self, address: &Address, f: impl FnOnce(&mut SessionState) -> R) -> Result<R> {
        let entry = self.entry(address)?;
        let mut session = lock(&entry.session);
        Ok(f(&mut session))
    }

    /// Mutate a record under `commit_lock`; when `f` reports a change the
    /// registry is saved and a notification sent. A failed save restores
    /// the record.
    fn mutate_record<R>(
        &self,
        address: &Address,
        f: impl FnOnce(&mut Contact) -> Result<(R, bool)>,
    ) -> Result<R> {
        let _guard = lock(&self.commit_lock);
        let entry = self.entry(address)?;
        let (out, previous) = {
            let mut session = lock(&entry.session);
            let before = session.contact.clone();
            let (out, changed) = f(&mut session.contact)?;
            (out, changed.then_some(before))
        };
        let Some(previous) = previous else {
            return Ok(out);
        };

        if let Err(e) = self.save_locked() {
            lock(&entry.session).contact = previous;
            return Err(e);
        }
        emit_event(&self.events, ContactEvent::ContactUpdated(address.clone()));
        Ok(out)
    }

    fn update_contact(&self, address: &Address, f: impl FnOnce(&mut Contact) -> bool) -> Result<bool> {
        self.mutate_record(address, |c| {
            let changed = f(c);
            Ok((changed, changed))
        })
    }

    // -----------------------------------------------------------------------
    // Record setters
    // -----------------------------------------------------------------------

    pub fn set_nickname(&self, address: &Address, nickname: &str) -> Result<bool> {
        self.update_contact(address, |c| {
            if c.nickname == nickname {
                return false;
            }
            c.nickname = nickname.to_string();
            true
        })
    }

    pub fn approve(&self, address: &Address) -> Result<bool> {
        self.update_contact(address, |c| !std::mem::replace(&mut c.approved, true))
    }

    pub fn set_handshake_stage(&self, address: &Address, stage: i32) -> Result<bool> {
        self.update_contact(address, |c| c.set_handshake_stage(stage))
    }

    /// Record a relay acknowledgement for handshake push `sequence`.
    pub fn mark_relay_push_acked(&self, address: &Address, sequence: u8) -> Result<bool> {
        self.update_contact(address, |c| c.acknowledge_relay_push(i32::from(sequence)))
    }

    pub fn set_public_key(&self, address: &Address, public_key: &[u8]) -> Result<bool> {
        self.update_contact(address, |c| {
            if c.public_key.as_deref() == Some(public_key) {
                return false;
            }
            c.public_key = Some(public_key.to_vec());
            true
        })
    }

    /// Remember the last message id seen from a bot contact. Returns false
    /// when `id` repeats the previous one.
    pub fn record_bot_message(&self, address: &Address, id: &[u8]) -> Result<bool> {
        self.update_contact(address, |c| {
            if c.last_received_message_id.as_deref() == Some(id) {
                return false;
            }
            c.last_received_message_id = Some(id.to_vec());
            true
        })
    }

    /// Find the contact owning `public_key`, attaching the key, or create an
    /// unapproved one.
    pub fn resolve_or_create(&self, public_key: &[u8]) -> Result<Address> {
        let address = derive_address(public_key);
        if self.contains(&address) {
            self.set_public_key(&address, public_key)?;
        } else {
            self.add(Contact::new(
                address.clone(),
                Some(public_key.to_vec()),
                "",
                false,
            ))?;
        }
        Ok(address)
    }

    // -----------------------------------------------------------------------
    // Key exchange
    // -----------------------------------------------------------------------

    pub fn exchange_state(&self, address: &Address) -> Option<KeyExchangeState> {
        self.with_session(address, |s| s.exchange).ok()
    }

    /// Feed an event into a contact's state machine. Returns the new state,
    /// or `None` for an unknown contact.
    pub fn apply_exchange(&self, address: &Address, event: KeyExchangeEvent) -> Option<KeyExchangeState> {
        let (before, after) = self
            .with_session(address, |s| {
                let before = s.exchange;
                s.exchange = before.apply(event);
                (before, s.exchange)
            })
            .ok()?;

        if before != after {
            debug!(contact = %address, ?before, ?after, ?event, "key exchange advanced");
            emit_event(
                &self.events,
                ContactEvent::HandshakeProgressed {
                    address: address.clone(),
                    state: after,
                },
            );
        }
        Some(after)
    }

    /// Generate at most one session key. The check-then-fill runs under the
    /// contact's session lock.
    pub fn generate_session_keys(&self, address: &Address) -> Result<KeyGeneration> {
        self.mutate_record(address, |c| {
            let outcome = c.generate_session_keys()?;
            Ok((outcome, outcome != KeyGeneration::NoOp))
        })
    }

    /// Send the selected session keys to the contact. Failures are logged.
    pub fn send_keys(&self, address: &Address, mask: KeyMask) -> bool {
        match self.send_keys_envelope(address, mask) {
            Ok(_) => true,
            Err(e) => {
                warn!(contact = %address, error = %e, "failed to send keys");
                false
            }
        }
    }

    /// Like [`send_keys`](Self::send_keys) but returns the sent envelope.
    pub fn send_keys_envelope(&self, address: &Address, mask: KeyMask) -> Result<Envelope> {
        let payload = self.with_session(address, |s| s.contact.keys_payload(mask))?;
        self.send_app_message(
            address,
            vec![HANDSHAKE_SEQ_KEYS],
            EnvelopeKind::Info,
            AppMessage::new(AppMessageCode::Keys, payload),
            false,
        )
    }

    /// Merge a peer's keys payload, first writer wins per slot.
    pub fn receive_keys(&self, address: &Address, payload: &[u8], timestamp: i64) -> Result<KeysMerge> {
        self.mutate_record(address, |c| {
            check_fresh(c, timestamp)?;
            let merge = c.receive_keys(payload).map_err(ProtocolError::MalformedKeys)?;
            c.last_received_handshake_timestamp = timestamp;
            Ok((merge, true))
        })
    }

    /// Discard both key slots and reset the state machine.
    pub fn abandon_handshake(&self, address: &Address) -> Result<()> {
        self.mutate_record(address, |c| {
            c.reset_session_keys();
            Ok(((), true))
        })?;
        self.apply_exchange(address, KeyExchangeEvent::Abandoned);
        info!(contact = %address, "handshake abandoned");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Wrap, sign and hand an application message to the transport. With
    /// `seal` the payload is encrypted under the contact's preferred session
    /// key when one exists; otherwise it is sealed to the contact's public
    /// key, which must then be known.
    pub fn send_app_message(
        &self,
        address: &Address,
        id: Vec<u8>,
        kind: EnvelopeKind,
        message: AppMessage,
        seal: bool,
    ) -> Result<Envelope> {
        let (slot_key, public_key) = self.with_session(address, |s| {
            let slot_key = s
                .contact
                .preferred_slot()
                .filter(|_| seal)
                .and_then(|slot| s.contact.session_key(slot).map(|k| (slot, *k)));
            (slot_key, s.contact.public_key.clone())
        })?;

        let plain = message.to_wire();
        let (encryption, data) = match slot_key {
            Some((slot, key)) => (
                EncryptionType::from(slot),
                crypto::encrypt(slot, &key, &plain)?,
            ),
            None => {
                let public_key = public_key
                    .as_deref()
                    .ok_or_else(|| ClientError::MissingPublicKey(address.clone()))?;
                (EncryptionType::Asymmetric, crypto::seal(public_key, &plain)?)
            }
        };

        let mut envelope = Envelope::new(
            id,
            kind,
            self.identity.address(),
            address.clone(),
            encryption,
            data,
        );
        envelope.sign(&self.identity);

        let recipient = Recipient {
            address,
            public_key: public_key.as_deref(),
        };
        self.transport.send(recipient, &envelope)?;
        Ok(envelope)
    }

    // -----------------------------------------------------------------------
    // Message log
    // -----------------------------------------------------------------------

    /// Append a message and mirror the log to the store. A message whose id
    /// is already logged is dropped and `false` returned.
    pub fn append_message(&self, address: &Address, message: FriendMessage) -> Result<bool> {
        let entry = self.entry(address)?;
        let id = message.id().clone();
        {
            let mut log = lock(&entry.log);
            if log.contains(&id) {
                debug!(contact = %address, message = %id, "duplicate message ignored");
                return Ok(false);
            }
            log.append(message);
            if let Err(e) = self.store.write_messages(address, &log.to_records()) {
                log.pop();
                return Err(e.into());
            }
        }
        emit_event(
            &self.events,
            ContactEvent::MessageAdded {
                address: address.clone(),
                id,
            },
        );
        Ok(true)
    }

    /// Mark a remote message read. Persists and notifies once per transition.
    pub fn set_message_read(&self, address: &Address, id: &MessageId) -> Result<FlagUpdate> {
        self.update_message(address, id, MessageLog::set_read)
    }

    /// Mark a local message delivered. Persists and notifies once per
    /// transition.
    pub fn set_message_received(&self, address: &Address, id: &MessageId) -> Result<FlagUpdate> {
        self.update_message(address, id, MessageLog::set_received)
    }

    fn update_message(
        &self,
        address: &Address,
        id: &MessageId,
        update: fn(&mut MessageLog, &MessageId) -> FlagUpdate,
    ) -> Result<FlagUpdate> {
        let entry = self.entry(address)?;
        let outcome = {
            let mut log = lock(&entry.log);
            let mut updated = log.clone();
            let outcome = update(&mut updated, id);
            if outcome == FlagUpdate::Changed {
                self.store.write_messages(address, &updated.to_records())?;
                *log = updated;
            }
            outcome
        };

        match outcome {
            FlagUpdate::Changed => emit_event(
                &self.events,
                ContactEvent::MessageUpdated {
                    address: address.clone(),
                    id: id.clone(),
                },
            ),
            FlagUpdate::NotFound => {
                debug!(contact = %address, message = %id, "flag update for unknown message")
            }
            FlagUpdate::Unchanged => {}
        }
        Ok(outcome)
    }

    pub fn mark_last_read(&self, address: &Address) -> Result<Option<MessageId>> {
        let entry = self.entry(address)?;
        let changed = {
            let mut log = lock(&entry.log);
            let mut updated = log.clone();
            let changed = updated.set_last_read();
            if changed.is_some() {
                self.store.write_messages(address, &updated.to_records())?;
                *log = updated;
            }
            changed
        };
        if let Some(id) = &changed {
            emit_event(
                &self.events,
                ContactEvent::MessageUpdated {
                    address: address.clone(),
                    id: id.clone(),
                },
            );
        }
        Ok(changed)
    }

    pub fn messages(&self, address: &Address) -> Result<Vec<FriendMessage>> {
        let entry = self.entry(address)?;
        let log = lock(&entry.log);
        Ok(log.messages().to_vec())
    }

    pub fn message_count(&self, address: &Address) -> Result<usize> {
        Ok(lock(&self.entry(address)?.log).len())
    }

    pub fn unread_count(&self, address: &Address) -> Result<usize> {
        Ok(lock(&self.entry(address)?.log).unread_count())
    }

    pub fn last_unread(&self, address: &Address) -> Result<bool> {
        Ok(lock(&self.entry(address)?.log).last_unread())
    }

    /// Drop the in-memory history without touching the store.
    pub fn flush_history(&self, address: &Address) -> Result<()> {
        lock(&self.entry(address)?.log).flush();
        Ok(())
    }

    /// Delete the stored history, then flush the in-memory one.
    pub fn delete_history(&self, address: &Address) -> Result<bool> {
        let entry = self.entry(address)?;
        let deleted = {
            let mut log = lock(&entry.log);
            let deleted = self.store.delete_messages(address)?;
            log.flush();
            deleted
        };
        emit_event(&self.events, ContactEvent::HistoryDeleted(address.clone()));
        Ok(deleted)
    }

    /// One summary per contact, most recent conversation first.
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let entries: Vec<(Address, Arc<ContactEntry>)> = self
            .contacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(address, entry)| (address.clone(), entry.clone()))
            .collect();

        let mut summaries: Vec<ConversationSummary> = entries
            .into_iter()
            .map(|(address, entry)| {
                let nickname = lock(&entry.session).contact.nickname.clone();
                let log = lock(&entry.log);
                ConversationSummary::new(address, nickname, &log)
            })
            .collect();
        summaries.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp));
        summaries
    }
}
