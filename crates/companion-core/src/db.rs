use rusqlite::Connection;

use crate::error::Result;

/// Initialise the key-value schema in `conn`.
///
/// A single `kv_store` table backs every persisted record of the engine.
/// Values are opaque JSON strings; the engine always rewrites whole records.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv_store (
            key         TEXT    NOT NULL PRIMARY KEY,
            value       TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
