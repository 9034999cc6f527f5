//! `SQLite` adapter for the key repository.
//!
//! The one subtlety is the claim path: `mark_key_used` is a single
//! conditional `UPDATE ... WHERE used = 0`, so when concurrent fetches (or
//! independent server processes sharing the database) race on the same key,
//! exactly one update reports a changed row. The allocator owns the retry.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use courier_keys::bundle::{
    validate_one_time_key, BundleId, DeviceKeyBundle, OneTimePreKeyUpload,
};
use courier_keys::{KeyError, KeyRepository};
use rusqlite::{params, Connection, OptionalExtension};

pub struct SqliteKeyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKeyStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, KeyError> {
        self.conn
            .lock()
            .map_err(|e| KeyError::Storage(format!("db lock poisoned: {e}")))
    }
}

impl KeyRepository for SqliteKeyStore {
    fn upsert_bundle(
        &self,
        user_id: &str,
        device_id: &str,
        identity_key_public: &str,
        signed_prekey_public: &str,
        signed_prekey_signature: &str,
    ) -> Result<BundleId, KeyError> {
        let conn = self.lock()?;
        let now = timestamp_now_secs();

        conn.execute(
            "INSERT INTO device_keys
             (user_id, device_id, identity_key_public, signed_prekey_public,
              signed_prekey_signature, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
             ON CONFLICT(user_id, device_id) DO UPDATE SET
                identity_key_public = excluded.identity_key_public,
                signed_prekey_public = excluded.signed_prekey_public,
                signed_prekey_signature = excluded.signed_prekey_signature,
                active = 1,
                updated_at = excluded.updated_at",
            params![
                user_id,
                device_id,
                identity_key_public,
                signed_prekey_public,
                signed_prekey_signature,
                now
            ],
        )
        .map_err(|e| KeyError::Storage(format!("upsert bundle: {e}")))?;

        conn.query_row(
            "SELECT id FROM device_keys WHERE user_id = ?1 AND device_id = ?2",
            params![user_id, device_id],
            |row| row.get(0),
        )
        .map_err(|e| KeyError::Storage(format!("bundle id lookup: {e}")))
    }

    fn add_one_time_keys(
        &self,
        bundle_id: BundleId,
        keys: &[OneTimePreKeyUpload],
    ) -> Result<usize, KeyError> {
        for key in keys {
            validate_one_time_key(key)?;
        }

        let conn = self.lock()?;
        let now = timestamp_now_secs();
        let mut added = 0;
        for key in keys {
            // OR IGNORE: a key id re-sent by a retried publish is skipped.
            let changed = conn
                .execute(
                    "INSERT OR IGNORE INTO one_time_prekeys
                     (device_key_id, key_id, public_key, used, created_at)
                     VALUES (?1, ?2, ?3, 0, ?4)",
                    params![bundle_id, key.key_id, key.public_key, now],
                )
                .map_err(|e| KeyError::Storage(format!("insert prekey: {e}")))?;
            added += changed;
        }
        Ok(added)
    }

    fn get_active_bundle(
        &self,
        user_id: &str,
        device_id: Option<&str>,
    ) -> Result<Option<DeviceKeyBundle>, KeyError> {
        let conn = self.lock()?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<DeviceKeyBundle> {
            Ok(DeviceKeyBundle {
                id: row.get(0)?,
                user_id: row.get(1)?,
                device_id: row.get(2)?,
                identity_key_public: row.get(3)?,
                signed_prekey_public: row.get(4)?,
                signed_prekey_signature: row.get(5)?,
                active: row.get::<_, i64>(6)? != 0,
                created_at: row.get(7)?,
                updated_at: row.get(8)?,
            })
        };

        let result = match device_id {
            Some(device) => conn
                .query_row(
                    "SELECT id, user_id, device_id, identity_key_public,
                            signed_prekey_public, signed_prekey_signature,
                            active, created_at, updated_at
                     FROM device_keys
                     WHERE user_id = ?1 AND device_id = ?2 AND active = 1",
                    params![user_id, device],
                    map_row,
                )
                .optional(),
            None => conn
                .query_row(
                    "SELECT id, user_id, device_id, identity_key_public,
                            signed_prekey_public, signed_prekey_signature,
                            active, created_at, updated_at
                     FROM device_keys
                     WHERE user_id = ?1 AND active = 1
                     ORDER BY id ASC LIMIT 1",
                    params![user_id],
                    map_row,
                )
                .optional(),
        };
        result.map_err(|e| KeyError::Storage(format!("bundle lookup: {e}")))
    }

    fn next_unused_key(&self, bundle_id: BundleId) -> Result<Option<(i64, String)>, KeyError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT key_id, public_key FROM one_time_prekeys
             WHERE device_key_id = ?1 AND used = 0
             ORDER BY key_id ASC LIMIT 1",
            params![bundle_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| KeyError::Storage(format!("pool lookup: {e}")))
    }

    fn mark_key_used(&self, bundle_id: BundleId, key_id: i64) -> Result<bool, KeyError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE one_time_prekeys SET used = 1, used_at = ?1
                 WHERE device_key_id = ?2 AND key_id = ?3 AND used = 0",
                params![timestamp_now_secs(), bundle_id, key_id],
            )
            .map_err(|e| KeyError::Storage(format!("mark used: {e}")))?;
        Ok(changed == 1)
    }
}

fn timestamp_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;

    use super::*;
    use crate::db;

    fn test_store() -> SqliteKeyStore {
        SqliteKeyStore::new(db::open_db(":memory:").unwrap())
    }

    fn upload(key_id: i64) -> OneTimePreKeyUpload {
        OneTimePreKeyUpload {
            key_id,
            public_key: base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(format!("prekey-{key_id}")),
        }
    }

    #[test]
    fn upsert_replaces_fields_and_keeps_one_row() {
        let store = test_store();
        let a = store.upsert_bundle("alice", "d1", "aWs", "c3Br", "c2ln").unwrap();
        let b = store.upsert_bundle("alice", "d1", "aWsy", "c3BrMg", "c2lnMg").unwrap();
        assert_eq!(a, b);

        let bundle = store.get_active_bundle("alice", Some("d1")).unwrap().unwrap();
        assert_eq!(bundle.identity_key_public, "aWsy");
        assert!(bundle.active);
    }

    #[test]
    fn republish_does_not_disturb_unused_pool() {
        let store = test_store();
        let id = store.upsert_bundle("alice", "d1", "aWs", "c3Br", "c2ln").unwrap();
        assert_eq!(store.add_one_time_keys(id, &[upload(1), upload(2)]).unwrap(), 2);

        store.upsert_bundle("alice", "d1", "aWsy", "c3BrMg", "c2lnMg").unwrap();
        // Re-sent batch dedups by key id; the new key is added.
        assert_eq!(
            store.add_one_time_keys(id, &[upload(1), upload(2), upload(3)]).unwrap(),
            1
        );
        assert_eq!(store.next_unused_key(id).unwrap().map(|(k, _)| k), Some(1));
    }

    #[test]
    fn conditional_mark_wins_only_once() {
        let store = test_store();
        let id = store.upsert_bundle("alice", "d1", "aWs", "c3Br", "c2ln").unwrap();
        store.add_one_time_keys(id, &[upload(4)]).unwrap();

        assert!(store.mark_key_used(id, 4).unwrap());
        assert!(!store.mark_key_used(id, 4).unwrap());
        assert_eq!(store.next_unused_key(id).unwrap(), None);
    }

    #[test]
    fn pool_is_read_in_ascending_key_order() {
        let store = test_store();
        let id = store.upsert_bundle("alice", "d1", "aWs", "c3Br", "c2ln").unwrap();
        store.add_one_time_keys(id, &[upload(9), upload(3), upload(6)]).unwrap();

        assert_eq!(store.next_unused_key(id).unwrap().map(|(k, _)| k), Some(3));
        store.mark_key_used(id, 3).unwrap();
        assert_eq!(store.next_unused_key(id).unwrap().map(|(k, _)| k), Some(6));
    }

    #[test]
    fn missing_user_has_no_active_bundle() {
        let store = test_store();
        assert!(store.get_active_bundle("ghost", None).unwrap().is_none());
    }

    #[test]
    fn rejects_invalid_uploads_without_writing() {
        let store = test_store();
        let id = store.upsert_bundle("alice", "d1", "aWs", "c3Br", "c2ln").unwrap();

        let bad = OneTimePreKeyUpload {
            key_id: -1,
            public_key: "a2V5".into(),
        };
        assert!(matches!(
            store.add_one_time_keys(id, &[upload(1), bad]),
            Err(KeyError::Validation(_))
        ));
        assert_eq!(store.next_unused_key(id).unwrap(), None);
    }
}
