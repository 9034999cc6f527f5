//! In-memory implementation of the key repository.
//!
//! Suitable for tests and development. Data is lost on process exit; the
//! server uses its `SQLite` adapter for real deployments.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bundle::{
    validate_one_time_key, BundleId, DeviceKeyBundle, OneTimePreKeyUpload,
};
use crate::error::KeyError;
use crate::store::KeyRepository;

struct StoredKey {
    key_id: i64,
    public_key: String,
    used: bool,
    used_at: Option<u64>,
}

struct StoredBundle {
    bundle: DeviceKeyBundle,
    /// Kept sorted by ascending key id.
    keys: Vec<StoredKey>,
}

/// Key repository backed by a single in-process mutex.
///
/// The lock makes every operation — including the read-and-mark claim —
/// linearizable, mirroring what the conditional update gives the `SQLite`
/// adapter.
pub struct MemoryKeyStore {
    inner: Mutex<Inner>,
}

struct Inner {
    next_id: BundleId,
    bundles: Vec<StoredBundle>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                bundles: Vec::new(),
            }),
        }
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRepository for MemoryKeyStore {
    fn upsert_bundle(
        &self,
        user_id: &str,
        device_id: &str,
        identity_key_public: &str,
        signed_prekey_public: &str,
        signed_prekey_signature: &str,
    ) -> Result<BundleId, KeyError> {
        let mut inner = self.inner.lock().map_err(|e| KeyError::Storage(e.to_string()))?;
        let now = timestamp_now_secs();

        if let Some(stored) = inner
            .bundles
            .iter_mut()
            .find(|s| s.bundle.user_id == user_id && s.bundle.device_id == device_id)
        {
            stored.bundle.identity_key_public = identity_key_public.to_string();
            stored.bundle.signed_prekey_public = signed_prekey_public.to_string();
            stored.bundle.signed_prekey_signature = signed_prekey_signature.to_string();
            stored.bundle.active = true;
            stored.bundle.updated_at = now;
            return Ok(stored.bundle.id);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.bundles.push(StoredBundle {
            bundle: DeviceKeyBundle {
                id,
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
                identity_key_public: identity_key_public.to_string(),
                signed_prekey_public: signed_prekey_public.to_string(),
                signed_prekey_signature: signed_prekey_signature.to_string(),
                active: true,
                created_at: now,
                updated_at: now,
            },
            keys: Vec::new(),
        });
        Ok(id)
    }

    fn add_one_time_keys(
        &self,
        bundle_id: BundleId,
        keys: &[OneTimePreKeyUpload],
    ) -> Result<usize, KeyError> {
        for key in keys {
            validate_one_time_key(key)?;
        }

        let mut inner = self.inner.lock().map_err(|e| KeyError::Storage(e.to_string()))?;
        let stored = inner
            .bundles
            .iter_mut()
            .find(|s| s.bundle.id == bundle_id)
            .ok_or_else(|| KeyError::Storage(format!("unknown bundle {bundle_id}")))?;

        let mut added = 0;
        for key in keys {
            if stored.keys.iter().any(|k| k.key_id == key.key_id) {
                continue; // retried publish — skip, not an error
            }
            stored.keys.push(StoredKey {
                key_id: key.key_id,
                public_key: key.public_key.clone(),
                used: false,
                used_at: None,
            });
            added += 1;
        }
        stored.keys.sort_by_key(|k| k.key_id);
        Ok(added)
    }

    fn get_active_bundle(
        &self,
        user_id: &str,
        device_id: Option<&str>,
    ) -> Result<Option<DeviceKeyBundle>, KeyError> {
        let inner = self.inner.lock().map_err(|e| KeyError::Storage(e.to_string()))?;
        Ok(inner
            .bundles
            .iter()
            .find(|s| {
                s.bundle.active
                    && s.bundle.user_id == user_id
                    && device_id.is_none_or(|d| s.bundle.device_id == d)
            })
            .map(|s| s.bundle.clone()))
    }

    fn next_unused_key(&self, bundle_id: BundleId) -> Result<Option<(i64, String)>, KeyError> {
        let inner = self.inner.lock().map_err(|e| KeyError::Storage(e.to_string()))?;
        Ok(inner
            .bundles
            .iter()
            .find(|s| s.bundle.id == bundle_id)
            .and_then(|s| s.keys.iter().find(|k| !k.used))
            .map(|k| (k.key_id, k.public_key.clone())))
    }

    fn mark_key_used(&self, bundle_id: BundleId, key_id: i64) -> Result<bool, KeyError> {
        let mut inner = self.inner.lock().map_err(|e| KeyError::Storage(e.to_string()))?;
        let Some(key) = inner
            .bundles
            .iter_mut()
            .find(|s| s.bundle.id == bundle_id)
            .and_then(|s| s.keys.iter_mut().find(|k| k.key_id == key_id))
        else {
            return Ok(false);
        };
        if key.used {
            return Ok(false); // lost the race — used is terminal
        }
        key.used = true;
        key.used_at = Some(timestamp_now_secs());
        Ok(true)
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

    fn upload(key_id: i64) -> OneTimePreKeyUpload {
        let material = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(format!("prekey-{key_id}"));
        OneTimePreKeyUpload {
            key_id,
            public_key: material,
        }
    }

    #[test]
    fn upsert_is_idempotent_per_user_device() {
        let store = MemoryKeyStore::new();
        let a = store.upsert_bundle("alice", "d1", "aWs=", "c3Br", "c2ln").unwrap();
        let b = store.upsert_bundle("alice", "d1", "aWsy", "c3BrMg", "c2lnMg").unwrap();
        assert_eq!(a, b);

        let bundle = store.get_active_bundle("alice", None).unwrap().unwrap();
        assert_eq!(bundle.identity_key_public, "aWsy");
        assert!(bundle.active);
    }

    #[test]
    fn distinct_devices_get_distinct_bundles() {
        let store = MemoryKeyStore::new();
        let a = store.upsert_bundle("alice", "d1", "aWs=", "c3Br", "c2ln").unwrap();
        let b = store.upsert_bundle("alice", "d2", "aWs=", "c3Br", "c2ln").unwrap();
        assert_ne!(a, b);

        let pinned = store.get_active_bundle("alice", Some("d2")).unwrap().unwrap();
        assert_eq!(pinned.device_id, "d2");
    }

    #[test]
    fn duplicate_key_ids_are_skipped_not_errors() {
        let store = MemoryKeyStore::new();
        let id = store.upsert_bundle("alice", "d1", "aWs=", "c3Br", "c2ln").unwrap();

        assert_eq!(store.add_one_time_keys(id, &[upload(1), upload(2)]).unwrap(), 2);
        // Retried publish re-sends key 2 plus a new key 3.
        assert_eq!(store.add_one_time_keys(id, &[upload(2), upload(3)]).unwrap(), 1);
    }

    #[test]
    fn republish_preserves_unused_keys() {
        let store = MemoryKeyStore::new();
        let id = store.upsert_bundle("alice", "d1", "aWs=", "c3Br", "c2ln").unwrap();
        store.add_one_time_keys(id, &[upload(1)]).unwrap();

        store.upsert_bundle("alice", "d1", "aWsy", "c3BrMg", "c2lnMg").unwrap();
        assert_eq!(store.next_unused_key(id).unwrap().map(|(k, _)| k), Some(1));
    }

    #[test]
    fn mark_used_is_terminal() {
        let store = MemoryKeyStore::new();
        let id = store.upsert_bundle("alice", "d1", "aWs=", "c3Br", "c2ln").unwrap();
        store.add_one_time_keys(id, &[upload(7)]).unwrap();

        assert!(store.mark_key_used(id, 7).unwrap());
        assert!(!store.mark_key_used(id, 7).unwrap());
        assert_eq!(store.next_unused_key(id).unwrap(), None);
    }

    #[test]
    fn next_unused_selects_lowest_key_id() {
        let store = MemoryKeyStore::new();
        let id = store.upsert_bundle("alice", "d1", "aWs=", "c3Br", "c2ln").unwrap();
        // Inserted out of order — selection is still ascending.
        store.add_one_time_keys(id, &[upload(5), upload(2), upload(9)]).unwrap();

        assert_eq!(store.next_unused_key(id).unwrap().map(|(k, _)| k), Some(2));
        store.mark_key_used(id, 2).unwrap();
        assert_eq!(store.next_unused_key(id).unwrap().map(|(k, _)| k), Some(5));
    }

    #[test]
    fn invalid_uploads_are_validation_errors() {
        let store = MemoryKeyStore::new();
        let id = store.upsert_bundle("alice", "d1", "aWs=", "c3Br", "c2ln").unwrap();

        let bad = OneTimePreKeyUpload {
            key_id: 0,
            public_key: "a2V5".into(),
        };
        assert!(matches!(
            store.add_one_time_keys(id, &[bad]),
            Err(KeyError::Validation(_))
        ));
    }
}
