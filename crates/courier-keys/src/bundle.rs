use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::KeyError;

/// Row identifier of a stored device key bundle.
pub type BundleId = i64;

/// The public key material a device publishes so peers can start an
/// encrypted session with it.
///
/// Only PUBLIC material lives here; private keys never reach the server.
/// Bundles are never deleted, only deactivated.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceKeyBundle {
    pub id: BundleId,
    pub user_id: String,
    pub device_id: String,
    /// Identity public key (base64).
    pub identity_key_public: String,
    /// Signed prekey public value (base64).
    pub signed_prekey_public: String,
    /// Signature over the signed prekey by the identity key (base64).
    pub signed_prekey_signature: String,
    pub active: bool,
    /// Unix timestamps in seconds.
    pub created_at: u64,
    pub updated_at: u64,
}

/// Publish request body: bundle fields plus an optional batch of one-time
/// prekeys.
///
/// Fields default to empty on deserialization so an omitted field surfaces
/// as a validation rejection rather than a body-parse failure.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishKeys {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub identity_key_public: String,
    #[serde(default)]
    pub signed_prekey_public: String,
    #[serde(default)]
    pub signed_prekey_signature: String,
    #[serde(default)]
    pub one_time_prekeys: Vec<OneTimePreKeyUpload>,
}

/// One uploaded one-time prekey. `key_id` is assigned by the client,
/// monotonically per device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePreKeyUpload {
    pub key_id: i64,
    pub public_key: String,
}

/// A one-time prekey claimed for an initiator, consumed from the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimedPreKey {
    pub key_id: i64,
    pub public_key: String,
}

/// Bundle assembled for a session initiator.
///
/// `one_time_prekey` is `None` when the target's pool is exhausted — a
/// degraded but valid bundle, never an error.
#[derive(Debug, Clone, Serialize)]
pub struct FetchedBundle {
    pub user_id: String,
    pub device_id: String,
    pub identity_key_public: String,
    pub signed_prekey_public: String,
    pub signed_prekey_signature: String,
    pub one_time_prekey: Option<ClaimedPreKey>,
}

/// Check that a key-material field is non-empty and decodes as base64.
///
/// Clients encode key material as base64url without padding (standard
/// alphabet is accepted too). This is a shape check only — the bytes are
/// opaque to the server, and a public value is indistinguishable from a
/// private scalar at this schema; keeping private keys off the wire is the
/// client's contract.
pub fn validate_key_material(field: &str, value: &str) -> Result<(), KeyError> {
    /// Largest DER-wrapped public value or signature a client encoding
    /// produces; anything bigger is not a lone public key.
    const MAX_DECODED_LEN: usize = 512;

    if value.is_empty() {
        return Err(KeyError::Validation(format!("{field} required")));
    }
    let engines = [
        base64::engine::general_purpose::URL_SAFE_NO_PAD,
        base64::engine::general_purpose::STANDARD,
    ];
    let Some(decoded) = engines.iter().find_map(|e| e.decode(value).ok()) else {
        return Err(KeyError::Validation(format!("{field} is not valid base64")));
    };
    if decoded.is_empty() || decoded.len() > MAX_DECODED_LEN {
        return Err(KeyError::Validation(format!(
            "{field} has implausible length {}",
            decoded.len()
        )));
    }
    Ok(())
}

/// Validate one uploaded one-time prekey: positive key id, decodable material.
pub fn validate_one_time_key(key: &OneTimePreKeyUpload) -> Result<(), KeyError> {
    if key.key_id <= 0 {
        return Err(KeyError::Validation(format!(
            "one-time prekey id must be positive, got {}",
            key.key_id
        )));
    }
    validate_key_material("one_time_prekey.public_key", &key.public_key)
}
