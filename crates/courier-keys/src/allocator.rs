use std::sync::Arc;

use crate::bundle::{BundleId, ClaimedPreKey};
use crate::error::KeyError;
use crate::store::KeyRepository;

/// How many lost races a single claim will absorb before giving up.
///
/// Each lost race means another claimer consumed the candidate key, so by
/// the time the bound is hit the pool is effectively drained from this
/// caller's point of view.
const MAX_CLAIM_ATTEMPTS: usize = 8;

/// Claims exactly one unused one-time prekey per bundle request.
///
/// The claim is read-and-mark: read the lowest unused key id, then flip its
/// `used` flag with the store's conditional update. Two concurrent claims
/// against the same bundle can read the same candidate, but only one
/// conditional update succeeds; the loser re-reads the next candidate.
/// Conflicts never surface to the caller.
pub struct PrekeyAllocator {
    repo: Arc<dyn KeyRepository>,
}

impl PrekeyAllocator {
    pub fn new(repo: Arc<dyn KeyRepository>) -> Self {
        Self { repo }
    }

    /// Claim one unused key, oldest-issued first.
    ///
    /// `Ok(None)` means the pool is exhausted — a degraded but valid
    /// outcome, never an error.
    pub fn claim_one_time_key(
        &self,
        bundle_id: BundleId,
    ) -> Result<Option<ClaimedPreKey>, KeyError> {
        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let Some((key_id, public_key)) = self.repo.next_unused_key(bundle_id)? else {
                return Ok(None);
            };
            if self.repo.mark_key_used(bundle_id, key_id)? {
                tracing::debug!(bundle = bundle_id, key = key_id, "one-time prekey claimed");
                return Ok(Some(ClaimedPreKey { key_id, public_key }));
            }
            tracing::debug!(
                bundle = bundle_id,
                key = key_id,
                attempt,
                "claim lost race, re-reading pool"
            );
        }
        tracing::warn!(
            bundle = bundle_id,
            attempts = MAX_CLAIM_ATTEMPTS,
            "prekey claim retries exhausted, serving bundle without one-time key"
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use base64::Engine as _;

    use super::*;
    use crate::bundle::OneTimePreKeyUpload;
    use crate::memory_store::MemoryKeyStore;

    fn seeded_store(key_ids: &[i64]) -> (Arc<MemoryKeyStore>, BundleId) {
        let store = Arc::new(MemoryKeyStore::new());
        let bundle_id = store
            .upsert_bundle("alice", "d1", "aWs=", "c3Br", "c2ln")
            .unwrap();
        let uploads: Vec<OneTimePreKeyUpload> = key_ids
            .iter()
            .map(|&key_id| OneTimePreKeyUpload {
                key_id,
                public_key: base64::engine::general_purpose::URL_SAFE_NO_PAD
                    .encode(format!("prekey-{key_id}")),
            })
            .collect();
        store.add_one_time_keys(bundle_id, &uploads).unwrap();
        (store, bundle_id)
    }

    #[test]
    fn claims_ascend_by_key_id() {
        let (store, bundle_id) = seeded_store(&[3, 1, 2]);
        let allocator = PrekeyAllocator::new(store);

        let ids: Vec<i64> = (0..3)
            .map(|_| allocator.claim_one_time_key(bundle_id).unwrap().unwrap().key_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn exhausted_pool_yields_none_not_error() {
        let (store, bundle_id) = seeded_store(&[1]);
        let allocator = PrekeyAllocator::new(store);

        assert!(allocator.claim_one_time_key(bundle_id).unwrap().is_some());
        assert!(allocator.claim_one_time_key(bundle_id).unwrap().is_none());
        // And stays exhausted.
        assert!(allocator.claim_one_time_key(bundle_id).unwrap().is_none());
    }

    #[test]
    fn empty_pool_yields_none() {
        let (store, bundle_id) = seeded_store(&[]);
        let allocator = PrekeyAllocator::new(store);
        assert!(allocator.claim_one_time_key(bundle_id).unwrap().is_none());
    }

    /// The at-most-once property: with k keys and N > k concurrent claims,
    /// each key id is handed to exactly one claimer and exactly N - k
    /// claimers see `None`.
    #[test]
    fn concurrent_claims_never_double_issue() {
        let key_ids: Vec<i64> = (1..=8).collect();
        let (store, bundle_id) = seeded_store(&key_ids);
        let claimers = 16;

        let handles: Vec<_> = (0..claimers)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let allocator = PrekeyAllocator::new(store);
                    allocator.claim_one_time_key(bundle_id).unwrap()
                })
            })
            .collect();

        let results: Vec<Option<ClaimedPreKey>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let claimed: Vec<i64> = results
            .iter()
            .filter_map(|r| r.as_ref().map(|c| c.key_id))
            .collect();
        let unique: HashSet<i64> = claimed.iter().copied().collect();

        assert_eq!(claimed.len(), key_ids.len(), "every key claimed exactly once");
        assert_eq!(unique.len(), key_ids.len(), "no key id issued twice");
        assert_eq!(
            results.iter().filter(|r| r.is_none()).count(),
            claimers - key_ids.len()
        );
    }
}
