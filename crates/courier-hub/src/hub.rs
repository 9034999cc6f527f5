use std::sync::Arc;

use courier_protocol::ServerFrame;

use crate::error::{EnqueueError, HubError};
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// Outcome of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Enqueued on this many of the recipient's live connections.
    Delivered(usize),
    /// No live connection accepted the envelope — the caller falls back to
    /// the persisted message store.
    Offline,
}

/// Routes outbound frames to the correct connected recipients.
///
/// Message envelopes are never broadcast: each is enqueued only on the
/// addressed identity's live handles. A connection whose bounded queue is
/// full is force-disconnected so one slow consumer cannot stall delivery to
/// anyone else — the send path never blocks.
pub struct DeliveryHub {
    registry: Arc<ConnectionRegistry>,
}

impl DeliveryHub {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Deliver a frame to every live connection of one recipient.
    pub fn send(&self, recipient_id: &str, frame: &ServerFrame) -> Delivery {
        let handles = self.registry.handles_for(recipient_id);
        let mut delivered = 0;

        for handle in handles {
            match handle.enqueue(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(EnqueueError::Full) => self.force_disconnect(&handle),
                Err(EnqueueError::Closed) => {
                    // Handle is mid-teardown; the frame is dropped here and
                    // the recipient recovers it from persisted storage.
                    tracing::trace!(
                        user = %recipient_id,
                        connection = handle.id(),
                        "dropped frame for closing connection"
                    );
                }
            }
        }

        if delivered == 0 {
            Delivery::Offline
        } else {
            Delivery::Delivered(delivered)
        }
    }

    /// Fan a presence/typing signal out to every live connection.
    ///
    /// Refuses anything that is not explicitly marked as a signal — message
    /// envelopes always go through [`send`](Self::send).
    pub fn broadcast_signal(&self, frame: &ServerFrame) -> Result<usize, HubError> {
        if !frame.is_signal() {
            return Err(HubError::NotASignal);
        }

        let mut delivered = 0;
        for handle in self.registry.all_handles() {
            match handle.enqueue(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(EnqueueError::Full) => self.force_disconnect(&handle),
                Err(EnqueueError::Closed) => {}
            }
        }
        Ok(delivered)
    }

    /// Drop a slow consumer rather than block the sender. Its writer task
    /// wakes via the handle's close signal and tears the transport down.
    fn force_disconnect(&self, handle: &Arc<ConnectionHandle>) {
        tracing::warn!(
            user = %handle.user_id(),
            connection = handle.id(),
            "outbound queue full, force-disconnecting slow consumer"
        );
        let outcome = self.registry.unregister(handle);
        if outcome.went_offline {
            let _ = self.broadcast_signal(&ServerFrame::Presence {
                user_id: handle.user_id().to_string(),
                online: false,
            });
        }
    }
}
