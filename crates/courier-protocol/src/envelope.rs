use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Wire format for a single message exchanged over the real-time transport.
///
/// The ciphertext, nonce, algorithm tag, and ephemeral key are opaque to the
/// server — they are produced and consumed by the clients' session layer and
/// carried here as-is. `content` is the legacy plaintext path kept for clients
/// that have not migrated to encrypted payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Chat this message belongs to.
    pub chat_id: String,
    /// Sender identity. Stamped by the server from the authenticated
    /// connection — any client-supplied value is overwritten.
    #[serde(default)]
    pub sender_id: String,
    /// Encrypted payload (base64). Mutually optional with `content`.
    #[serde(default)]
    pub ciphertext: String,
    /// Legacy plaintext body.
    #[serde(default)]
    pub content: String,
    /// Cipher nonce (base64), opaque.
    #[serde(default)]
    pub nonce: String,
    /// Algorithm tag chosen by the sender, e.g. "ECDH-P256+AES-GCM", opaque.
    #[serde(default)]
    pub alg: String,
    /// Sender's ephemeral public key for this message (base64), opaque.
    #[serde(default)]
    pub ephemeral_pub: String,
    /// Unix timestamp in milliseconds. Stamped by the server if zero.
    #[serde(default)]
    pub created_at: u64,
}

impl MessageEnvelope {
    /// Check the invariants the server does enforce: a chat id and a
    /// non-empty body (either ciphertext or legacy plaintext).
    ///
    /// No cryptographic meaning is assigned to the ciphertext fields here.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.chat_id.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("chat_id required".into()));
        }
        if self.ciphertext.is_empty() && self.content.is_empty() {
            return Err(ProtocolError::InvalidEnvelope("empty message".into()));
        }
        if !self.ciphertext.is_empty() && self.nonce.is_empty() {
            return Err(ProtocolError::InvalidEnvelope(
                "ciphertext without nonce".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ciphertext_envelope() -> MessageEnvelope {
        MessageEnvelope {
            chat_id: "chat-1".into(),
            sender_id: "alice".into(),
            ciphertext: "b2s=".into(),
            content: String::new(),
            nonce: "bm9uY2U=".into(),
            alg: "ECDH-P256+AES-GCM".into(),
            ephemeral_pub: "ZXBo".into(),
            created_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn ciphertext_envelope_is_valid() {
        assert!(ciphertext_envelope().validate().is_ok());
    }

    #[test]
    fn legacy_plaintext_is_valid() {
        let env = MessageEnvelope {
            ciphertext: String::new(),
            nonce: String::new(),
            alg: String::new(),
            ephemeral_pub: String::new(),
            content: "hello".into(),
            ..ciphertext_envelope()
        };
        assert!(env.validate().is_ok());
    }

    #[test]
    fn empty_body_rejected() {
        let env = MessageEnvelope {
            ciphertext: String::new(),
            content: String::new(),
            ..ciphertext_envelope()
        };
        assert!(env.validate().is_err());
    }

    #[test]
    fn ciphertext_without_nonce_rejected() {
        let env = MessageEnvelope {
            nonce: String::new(),
            ..ciphertext_envelope()
        };
        assert!(env.validate().is_err());
    }

    #[test]
    fn missing_chat_id_rejected() {
        let env = MessageEnvelope {
            chat_id: String::new(),
            ..ciphertext_envelope()
        };
        assert!(env.validate().is_err());
    }
}
