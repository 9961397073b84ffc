//! # parley-store
//!
//! Durable storage for the contact registry and the per-contact message logs,
//! backed by SQLite.
//!
//! The store never interprets records: contacts and messages arrive already
//! encoded by the session core and are kept as opaque blobs. The
//! [`ContactStore`] trait is the seam the client talks to; [`SqliteStore`]
//! is the production implementation and [`MemoryStore`] backs tests.

pub mod contacts;
pub mod database;
pub mod memory;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

use std::sync::{Mutex, PoisonError};

use parley_shared::types::Address;

pub use database::Database;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use models::*;

/// Persistence collaborator used by the contact registry.
///
/// Every call is synchronous and runs to completion before the caller's
/// state change is considered committed.
pub trait ContactStore: Send + Sync {
    /// Replace the whole stored registry with `rows`, in order.
    fn save_contacts(&self, rows: &[ContactRow]) -> error::Result<()>;

    fn load_contacts(&self) -> error::Result<Vec<ContactRow>>;

    /// Replace the stored message log of `address` with `records`, in order.
    fn write_messages(&self, address: &Address, records: &[Vec<u8>]) -> error::Result<()>;

    fn read_messages(&self, address: &Address) -> error::Result<Vec<Vec<u8>>>;

    /// Delete the stored log. Returns whether anything was removed.
    fn delete_messages(&self, address: &Address) -> error::Result<bool>;
}

/// [`ContactStore`] over a single SQLite connection.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    fn with_db<T>(&self, f: impl FnOnce(&mut Database) -> error::Result<T>) -> error::Result<T> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut db)
    }
}

impl ContactStore for SqliteStore {
    fn save_contacts(&self, rows: &[ContactRow]) -> error::Result<()> {
        self.with_db(|db| db.replace_contacts(rows))
    }

    fn load_contacts(&self) -> error::Result<Vec<ContactRow>> {
        self.with_db(|db| db.get_contacts())
    }

    fn write_messages(&self, address: &Address, records: &[Vec<u8>]) -> error::Result<()> {
        self.with_db(|db| db.replace_message_log(address, records))
    }

    fn read_messages(&self, address: &Address) -> error::Result<Vec<Vec<u8>>> {
        self.with_db(|db| db.get_message_log(address))
    }

    fn delete_messages(&self, address: &Address) -> error::Result<bool> {
        self.with_db(|db| db.delete_message_log(address))
    }
}
