use chrono::Utc;
use parley_shared::types::Address;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::ContactRow;

impl Database {
    /// Replace the stored registry in a single transaction.
    pub fn replace_contacts(&mut self, rows: &[ContactRow]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn_mut().transaction()?;
        tx.execute("DELETE FROM contacts", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO contacts (address, position, record, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (position, row) in rows.iter().enumerate() {
                stmt.execute(params![row.address.to_hex(), position as i64, row.record, now])?;
            }
        }
        tx.commit()?;

        tracing::debug!(count = rows.len(), "contact registry saved");
        Ok(())
    }

    pub fn get_contacts(&self) -> Result<Vec<ContactRow>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT address, record FROM contacts ORDER BY position ASC")?;

        let rows = stmt.query_map([], |row| {
            let address: String = row.get(0)?;
            let record: Vec<u8> = row.get(1)?;
            Ok((address, record))
        })?;

        let mut contacts = Vec::new();
        for row in rows {
            let (address, record) = row?;
            contacts.push(ContactRow {
                address: Address(hex::decode(address)?),
                record,
            });
        }
        Ok(contacts)
    }
}
