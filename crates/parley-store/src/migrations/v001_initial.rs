//! v001 -- Initial schema creation.
//!
//! Creates the `contacts` registry table and the `messages` log table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Contacts (the whole registry is rewritten on every commit)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    address    TEXT PRIMARY KEY NOT NULL,   -- hex-encoded wallet address
    position   INTEGER NOT NULL,            -- registry order
    record     BLOB NOT NULL,               -- encoded contact record
    updated_at TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Message logs (one row per message, append order in `seq`)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    address TEXT NOT NULL,                  -- hex-encoded wallet address
    seq     INTEGER NOT NULL,
    record  BLOB NOT NULL,                  -- encoded message record

    PRIMARY KEY (address, seq)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
