use serde::{Deserialize, Serialize};

use crate::envelope::MessageEnvelope;
use crate::error::ProtocolError;

/// Inbound frame from a connected client.
///
/// Every message names its recipient explicitly — there is no "send to
/// everyone" message frame. Typing indicators are the one client-originated
/// signal that is fanned out to all connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    /// A message envelope addressed to one recipient identity.
    Message {
        to: String,
        envelope: MessageEnvelope,
    },
    /// Typing indicator for a chat.
    Typing { chat_id: String, typing: bool },
}

impl ClientFrame {
    /// Decode a frame from a transport text message.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Outbound frame pushed to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerFrame {
    /// A message envelope addressed to this client's identity.
    Message { envelope: MessageEnvelope },
    /// An identity came online or went offline.
    Presence { user_id: String, online: bool },
    /// Someone is typing in a chat.
    Typing {
        chat_id: String,
        user_id: String,
        typing: bool,
    },
}

impl ServerFrame {
    /// Encode the frame as a transport text message.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Whether this frame is a presence/typing signal. Only signals may be
    /// broadcast to all connections; message envelopes are always routed to
    /// their one recipient.
    pub fn is_signal(&self) -> bool {
        matches!(
            self,
            ServerFrame::Presence { .. } | ServerFrame::Typing { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_frame_round_trips() {
        let raw = r#"{"type":"Message","data":{"to":"bob","envelope":{
            "chat_id":"c1","ciphertext":"YQ==","nonce":"bg==","alg":"ECDH-P256+AES-GCM",
            "ephemeral_pub":"ZQ==","created_at":123}}}"#;
        let frame = ClientFrame::decode(raw).unwrap();
        match frame {
            ClientFrame::Message { to, envelope } => {
                assert_eq!(to, "bob");
                assert_eq!(envelope.chat_id, "c1");
                assert!(envelope.sender_id.is_empty());
            }
            ClientFrame::Typing { .. } => panic!("wrong variant"),
        }
    }

    #[test]
    fn garbage_frame_is_decode_error() {
        assert!(ClientFrame::decode("not json").is_err());
        assert!(ClientFrame::decode(r#"{"type":"Nope","data":{}}"#).is_err());
    }

    #[test]
    fn only_presence_and_typing_are_signals() {
        let msg = ServerFrame::Message {
            envelope: MessageEnvelope {
                chat_id: "c1".into(),
                sender_id: "alice".into(),
                ciphertext: "YQ==".into(),
                content: String::new(),
                nonce: "bg==".into(),
                alg: String::new(),
                ephemeral_pub: String::new(),
                created_at: 1,
            },
        };
        assert!(!msg.is_signal());

        let presence = ServerFrame::Presence {
            user_id: "alice".into(),
            online: true,
        };
        assert!(presence.is_signal());

        let typing = ServerFrame::Typing {
            chat_id: "c1".into(),
            user_id: "alice".into(),
            typing: true,
        };
        assert!(typing.is_signal());
    }

    #[test]
    fn server_frame_encodes_tagged_json() {
        let frame = ServerFrame::Presence {
            user_id: "alice".into(),
            online: false,
        };
        let encoded = frame.encode().unwrap();
        assert!(encoded.contains(r#""type":"Presence""#));
        assert!(encoded.contains(r#""online":false"#));
    }
}
