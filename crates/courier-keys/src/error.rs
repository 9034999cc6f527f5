use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no active bundle for {0}")]
    NotFound(String),

    #[error("key storage error: {0}")]
    Storage(String),
}
