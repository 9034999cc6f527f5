//! Persistence for envelopes whose recipient has no live connection.
//!
//! The hub never blocks on storage; this store is the fallback the routing
//! layer uses when delivery reports `Offline`, and the source drained into a
//! fresh connection's queue on reconnect.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use courier_protocol::MessageEnvelope;
use rusqlite::{params, Connection};

#[derive(Clone)]
pub struct SqliteMessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMessageStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Queue an envelope for an offline recipient.
    pub fn enqueue(&self, recipient_id: &str, envelope: &MessageEnvelope) -> Result<(), String> {
        let json = serde_json::to_string(envelope)
            .map_err(|e| format!("serialize envelope: {e}"))?;
        let conn = self.conn.lock().map_err(|e| format!("db lock poisoned: {e}"))?;
        conn.execute(
            "INSERT INTO pending_envelopes (recipient_id, envelope_json, queued_at)
             VALUES (?1, ?2, ?3)",
            params![recipient_id, json, timestamp_now_secs()],
        )
        .map_err(|e| format!("enqueue envelope: {e}"))?;
        Ok(())
    }

    /// Remove and return everything queued for a recipient, oldest first.
    pub fn take_for(&self, recipient_id: &str) -> Result<Vec<MessageEnvelope>, String> {
        let conn = self.conn.lock().map_err(|e| format!("db lock poisoned: {e}"))?;

        let mut stmt = conn
            .prepare(
                "SELECT envelope_json FROM pending_envelopes
                 WHERE recipient_id = ?1 ORDER BY id ASC",
            )
            .map_err(|e| format!("select pending: {e}"))?;
        let rows: Vec<String> = stmt
            .query_map(params![recipient_id], |row| row.get(0))
            .map_err(|e| format!("query pending: {e}"))?
            .filter_map(Result::ok)
            .collect();
        drop(stmt);

        conn.execute(
            "DELETE FROM pending_envelopes WHERE recipient_id = ?1",
            params![recipient_id],
        )
        .map_err(|e| format!("clear pending: {e}"))?;

        let mut envelopes = Vec::with_capacity(rows.len());
        for json in rows {
            match serde_json::from_str(&json) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    tracing::warn!(recipient = %recipient_id, error = %e, "dropping malformed pending envelope");
                }
            }
        }
        Ok(envelopes)
    }
}

fn timestamp_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
