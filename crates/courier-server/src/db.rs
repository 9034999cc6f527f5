use std::sync::{Arc, Mutex};

use rusqlite::Connection;

/// Server-side schema version. Bump when the schema changes.
const SCHEMA_VERSION: i64 = 1;

/// Open (or create) the server `SQLite` database and run migrations.
pub fn open_db(path: &str) -> Result<Arc<Mutex<Connection>>, String> {
    let conn = Connection::open(path).map_err(|e| format!("failed to open db: {e}"))?;

    conn.execute_batch("PRAGMA journal_mode=WAL;")
        .map_err(|e| format!("failed to set WAL mode: {e}"))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")
        .map_err(|e| format!("failed to enable foreign keys: {e}"))?;

    let current: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if current != SCHEMA_VERSION {
        if current != 0 {
            tracing::info!(
                old = current,
                new = SCHEMA_VERSION,
                "schema version mismatch — recreating"
            );
            drop_all_tables(&conn)?;
        }
        conn.execute_batch(SCHEMA)
            .map_err(|e| format!("failed to run schema: {e}"))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|e| format!("failed to set schema version: {e}"))?;
    }

    Ok(Arc::new(Mutex::new(conn)))
}

/// Drop every user table so the schema can be cleanly re-applied.
fn drop_all_tables(conn: &Connection) -> Result<(), String> {
    conn.execute_batch("PRAGMA foreign_keys=OFF;")
        .map_err(|e| format!("failed to disable fks: {e}"))?;

    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")
        .map_err(|e| format!("failed to list tables: {e}"))?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| format!("failed to query tables: {e}"))?
        .filter_map(Result::ok)
        .collect();
    drop(stmt);

    for table in &tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))
            .map_err(|e| format!("failed to drop table {table}: {e}"))?;
    }

    conn.execute_batch("PRAGMA foreign_keys=ON;")
        .map_err(|e| format!("failed to re-enable fks: {e}"))?;

    Ok(())
}

const SCHEMA: &str = r"
-- Public key bundles, one per (user, device). Never deleted, only
-- deactivated.
CREATE TABLE IF NOT EXISTS device_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    identity_key_public TEXT NOT NULL,
    signed_prekey_public TEXT NOT NULL,
    signed_prekey_signature TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (user_id, device_id)
);

-- One-time prekey pool. used flips to 1 exactly once and never back.
CREATE TABLE IF NOT EXISTS one_time_prekeys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_key_id INTEGER NOT NULL REFERENCES device_keys(id) ON DELETE CASCADE,
    key_id INTEGER NOT NULL,
    public_key TEXT NOT NULL,
    used INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    used_at INTEGER,
    UNIQUE (device_key_id, key_id)
);

CREATE INDEX IF NOT EXISTS idx_one_time_prekeys_pool
    ON one_time_prekeys(device_key_id, used, key_id);

-- Envelopes for recipients with no live connection, drained on reconnect.
CREATE TABLE IF NOT EXISTS pending_envelopes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recipient_id TEXT NOT NULL,
    envelope_json TEXT NOT NULL,
    queued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_envelopes_recipient
    ON pending_envelopes(recipient_id, id);
";
