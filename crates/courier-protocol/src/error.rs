use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error("frame encode failed: {0}")]
    Encode(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}
