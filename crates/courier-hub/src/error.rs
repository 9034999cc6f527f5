use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("connection {0} is not in the connecting state")]
    AlreadyRegistered(u64),

    #[error("only presence/typing signals may be broadcast")]
    NotASignal,
}

/// Why an enqueue onto a connection's outbound queue did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// Bounded queue is at capacity — the consumer is too slow.
    Full,
    /// The connection has been unregistered or its writer is gone.
    Closed,
}
