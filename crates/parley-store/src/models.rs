//! Rows handed across the [`ContactStore`](crate::ContactStore) seam.

use parley_shared::types::Address;
use serde::{Deserialize, Serialize};

/// One contact of the registry: its primary key and its encoded record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactRow {
    pub address: Address,
    /// Contact record in wire encoding. Opaque to the store.
    pub record: Vec<u8>,
}
