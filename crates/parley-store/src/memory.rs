//! In-memory [`ContactStore`] used by tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use parley_shared::types::Address;

use crate::error::{Result, StoreError};
use crate::models::ContactRow;
use crate::ContactStore;

#[derive(Default)]
pub struct MemoryStore {
    contacts: Mutex<Vec<ContactRow>>,
    messages: Mutex<HashMap<Address, Vec<Vec<u8>>>>,
    contact_saves: AtomicUsize,
    message_writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registry saves so far.
    pub fn contact_saves(&self) -> usize {
        self.contact_saves.load(Ordering::SeqCst)
    }

    /// Number of message log writes so far, across all contacts.
    pub fn message_writes(&self) -> usize {
        self.message_writes.load(Ordering::SeqCst)
    }

    /// While set, every save and write fails with an I/O error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "store unavailable",
            )));
        }
        Ok(())
    }
}

impl ContactStore for MemoryStore {
    fn save_contacts(&self, rows: &[ContactRow]) -> Result<()> {
        self.check_available()?;
        *self.contacts.lock().unwrap_or_else(PoisonError::into_inner) = rows.to_vec();
        self.contact_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_contacts(&self) -> Result<Vec<ContactRow>> {
        Ok(self
            .contacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn write_messages(&self, address: &Address, records: &[Vec<u8>]) -> Result<()> {
        self.check_available()?;
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone(), records.to_vec());
        self.message_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_messages(&self, address: &Address) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    fn delete_messages(&self, address: &Address) -> Result<bool> {
        Ok(self
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address)
            .is_some())
    }
}
