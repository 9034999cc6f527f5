use std::sync::Arc;

use crate::allocator::PrekeyAllocator;
use crate::bundle::{
    validate_key_material, validate_one_time_key, BundleId, FetchedBundle, PublishKeys,
};
use crate::error::KeyError;
use crate::store::KeyRepository;

/// Orchestrates the two sides of session bootstrap: a device publishing its
/// public bundle, and a peer fetching that bundle to initiate a session.
///
/// Publishing is write-only against the bundle; fetching is read-mostly but
/// mutates the prekey pool through the allocator. The two paths share no
/// lock — the pool's consistency is the allocator's concern.
pub struct SessionBootstrapService {
    repo: Arc<dyn KeyRepository>,
    allocator: PrekeyAllocator,
}

impl SessionBootstrapService {
    pub fn new(repo: Arc<dyn KeyRepository>) -> Self {
        let allocator = PrekeyAllocator::new(Arc::clone(&repo));
        Self { repo, allocator }
    }

    /// Publish a device's bundle and add its one-time prekeys.
    ///
    /// All bundle fields are required public material; the whole request is
    /// rejected before any write if a field is missing or malformed.
    /// Re-publishing the same device reactivates its bundle and leaves
    /// previously uploaded unused prekeys in place.
    pub fn publish(&self, user_id: &str, request: &PublishKeys) -> Result<BundleId, KeyError> {
        if user_id.is_empty() {
            return Err(KeyError::Validation("user_id required".into()));
        }
        if request.device_id.is_empty() {
            return Err(KeyError::Validation("device_id required".into()));
        }
        validate_key_material("identity_key_public", &request.identity_key_public)?;
        validate_key_material("signed_prekey_public", &request.signed_prekey_public)?;
        validate_key_material("signed_prekey_signature", &request.signed_prekey_signature)?;
        for key in &request.one_time_prekeys {
            validate_one_time_key(key)?;
        }

        let bundle_id = self.repo.upsert_bundle(
            user_id,
            &request.device_id,
            &request.identity_key_public,
            &request.signed_prekey_public,
            &request.signed_prekey_signature,
        )?;

        let added = if request.one_time_prekeys.is_empty() {
            0
        } else {
            self.repo
                .add_one_time_keys(bundle_id, &request.one_time_prekeys)?
        };

        tracing::info!(
            user = %user_id,
            device = %request.device_id,
            prekeys_added = added,
            "device key bundle published"
        );
        Ok(bundle_id)
    }

    /// Assemble a bundle for an initiator who wants to message `target`.
    ///
    /// Claims one one-time prekey when the pool has one; an exhausted pool
    /// degrades to `one_time_prekey: None`. `NotFound` only when the target
    /// has no active bundle at all.
    pub fn fetch_bundle(
        &self,
        target_user_id: &str,
        device_id: Option<&str>,
    ) -> Result<FetchedBundle, KeyError> {
        let Some(bundle) = self.repo.get_active_bundle(target_user_id, device_id)? else {
            return Err(KeyError::NotFound(target_user_id.to_string()));
        };

        let one_time_prekey = self.allocator.claim_one_time_key(bundle.id)?;
        if one_time_prekey.is_none() {
            tracing::debug!(
                user = %target_user_id,
                device = %bundle.device_id,
                "one-time prekey pool exhausted, serving degraded bundle"
            );
        }

        Ok(FetchedBundle {
            user_id: bundle.user_id,
            device_id: bundle.device_id,
            identity_key_public: bundle.identity_key_public,
            signed_prekey_public: bundle.signed_prekey_public,
            signed_prekey_signature: bundle.signed_prekey_signature,
            one_time_prekey,
        })
    }
}
