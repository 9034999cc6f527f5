use crate::bundle::{BundleId, DeviceKeyBundle, OneTimePreKeyUpload};
use crate::error::KeyError;

/// Durable storage of device key bundles and their one-time prekey pools.
///
/// Implemented in-memory for tests ([`crate::MemoryKeyStore`]) and against
/// `SQLite` by the server. Requests may originate from independent server
/// processes, so the at-most-once claim guarantee rests on the store's own
/// conditional update in [`mark_key_used`](KeyRepository::mark_key_used),
/// not on application-level locking.
pub trait KeyRepository: Send + Sync {
    /// Create or replace the bundle for (user, device) and reactivate it.
    ///
    /// Idempotent: a second publish overwrites the identity/signed-prekey
    /// fields but does not disturb unused one-time prekeys from a prior
    /// publish.
    fn upsert_bundle(
        &self,
        user_id: &str,
        device_id: &str,
        identity_key_public: &str,
        signed_prekey_public: &str,
        signed_prekey_signature: &str,
    ) -> Result<BundleId, KeyError>;

    /// Add a batch of one-time prekeys to a bundle's pool.
    ///
    /// Returns the count actually inserted. A key id already present for
    /// this bundle is silently skipped so retried publishes stay idempotent;
    /// empty material or non-positive key ids are a validation error.
    fn add_one_time_keys(
        &self,
        bundle_id: BundleId,
        keys: &[OneTimePreKeyUpload],
    ) -> Result<usize, KeyError>;

    /// Look up the active bundle for a user, optionally pinned to one device.
    fn get_active_bundle(
        &self,
        user_id: &str,
        device_id: Option<&str>,
    ) -> Result<Option<DeviceKeyBundle>, KeyError>;

    /// The unused key with the lowest key id, if any. Read-only.
    fn next_unused_key(&self, bundle_id: BundleId) -> Result<Option<(i64, String)>, KeyError>;

    /// Atomically mark a key used — a single conditional update
    /// (`used = false` precondition). Returns `false` when another claim won
    /// the race. Once used, a key is never returned to the pool.
    fn mark_key_used(&self, bundle_id: BundleId, key_id: i64) -> Result<bool, KeyError>;
}
