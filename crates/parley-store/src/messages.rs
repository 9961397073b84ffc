use parley_shared::types::Address;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Replace the stored log of one contact in a single transaction.
    pub fn replace_message_log(&mut self, address: &Address, records: &[Vec<u8>]) -> Result<()> {
        let key = address.to_hex();
        let tx = self.conn_mut().transaction()?;
        tx.execute("DELETE FROM messages WHERE address = ?1", params![key])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO messages (address, seq, record) VALUES (?1, ?2, ?3)")?;
            for (seq, record) in records.iter().enumerate() {
                stmt.execute(params![key, seq as i64, record])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_message_log(&self, address: &Address) -> Result<Vec<Vec<u8>>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT record FROM messages WHERE address = ?1 ORDER BY seq ASC")?;

        let rows = stmt.query_map(params![address.to_hex()], |row| row.get::<_, Vec<u8>>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn delete_message_log(&self, address: &Address) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM messages WHERE address = ?1",
            params![address.to_hex()],
        )?;
        Ok(affected > 0)
    }
}
