use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use courier_protocol::ServerFrame;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::error::{EnqueueError, HubError};

pub type ConnectionId = u64;

/// Lifecycle of a live connection. `Unregistered` is terminal — a handle is
/// never re-registered; a reconnecting client gets a fresh handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registered,
    Unregistered,
}

const STATE_CONNECTING: u8 = 0;
const STATE_REGISTERED: u8 = 1;
const STATE_UNREGISTERED: u8 = 2;

/// One live transport connection for one identity.
///
/// Ephemeral and in-memory only. Holds the sending half of the connection's
/// bounded outbound queue; the writer task owns the receiving half.
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: String,
    tx: mpsc::Sender<ServerFrame>,
    state: AtomicU8,
    close_signal: Notify,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTING => ConnectionState::Connecting,
            STATE_REGISTERED => ConnectionState::Registered,
            _ => ConnectionState::Unregistered,
        }
    }

    /// Enqueue an outbound frame without blocking.
    ///
    /// Frames offered to a handle that is being torn down are dropped
    /// (`Closed`); a full queue is the caller's signal to force-disconnect.
    pub fn enqueue(&self, frame: ServerFrame) -> Result<(), EnqueueError> {
        if self.state() != ConnectionState::Registered {
            return Err(EnqueueError::Closed);
        }
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Resolve once the connection has been unregistered. Used by the writer
    /// task so a force-disconnect wakes it even when no frame is in flight.
    pub async fn closed(&self) {
        if self.state() == ConnectionState::Unregistered {
            return;
        }
        self.close_signal.notified().await;
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Result of unregistering a handle.
#[derive(Debug, Clone, Copy)]
pub struct UnregisterOutcome {
    /// False when the handle was already unregistered (benign double
    /// disconnect, e.g. a force-disconnect racing transport close).
    pub removed: bool,
    /// True when this was the identity's last live connection.
    pub went_offline: bool,
}

/// Tracks currently-connected clients keyed by identity.
///
/// Explicitly constructed and owned by the process's top-level composition;
/// there is no process-wide singleton. All map mutations go through one
/// write lock, so register/unregister/lookup are linearizable; handle state
/// transitions happen inside that lock.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, HashMap<ConnectionId, Arc<ConnectionHandle>>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    /// `queue_capacity` bounds each connection's outbound queue.
    pub fn new(queue_capacity: usize) -> Self {
        assert!(queue_capacity > 0, "outbound queue capacity must be non-zero");
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    /// Create a handle in the `Connecting` state together with the receiving
    /// half of its outbound queue. The handle is not yet visible to lookups.
    pub fn open(&self, user_id: &str) -> (Arc<ConnectionHandle>, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let handle = Arc::new(ConnectionHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            user_id: user_id.to_string(),
            tx,
            state: AtomicU8::new(STATE_CONNECTING),
            close_signal: Notify::new(),
        });
        (handle, rx)
    }

    /// Move a handle `Connecting -> Registered` and make it visible to
    /// delivery. Returns whether the identity came online (first handle).
    pub fn register(&self, handle: &Arc<ConnectionHandle>) -> Result<bool, HubError> {
        let mut connections = self.connections.write();
        if !handle.transition(STATE_CONNECTING, STATE_REGISTERED) {
            return Err(HubError::AlreadyRegistered(handle.id));
        }
        let handles = connections.entry(handle.user_id.clone()).or_default();
        let came_online = handles.is_empty();
        handles.insert(handle.id, Arc::clone(handle));

        tracing::debug!(
            user = %handle.user_id,
            connection = handle.id,
            came_online,
            "connection registered"
        );
        Ok(came_online)
    }

    /// Move a handle to `Unregistered` (terminal) and drop it from the map.
    ///
    /// Idempotent and race-safe: of two racing unregisters exactly one
    /// observes `removed == true`.
    pub fn unregister(&self, handle: &Arc<ConnectionHandle>) -> UnregisterOutcome {
        let went_offline = {
            let mut connections = self.connections.write();
            let was_registered = handle.transition(STATE_REGISTERED, STATE_UNREGISTERED);
            if !was_registered && !handle.transition(STATE_CONNECTING, STATE_UNREGISTERED) {
                return UnregisterOutcome {
                    removed: false,
                    went_offline: false,
                };
            }
            if !was_registered {
                // Aborted before registration — never entered the map.
                handle.close_signal.notify_one();
                return UnregisterOutcome {
                    removed: true,
                    went_offline: false,
                };
            }

            match connections.get_mut(&handle.user_id) {
                Some(handles) => {
                    handles.remove(&handle.id);
                    if handles.is_empty() {
                        connections.remove(&handle.user_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        handle.close_signal.notify_one();
        tracing::debug!(
            user = %handle.user_id,
            connection = handle.id,
            went_offline,
            "connection unregistered"
        );
        UnregisterOutcome {
            removed: true,
            went_offline,
        }
    }

    /// All live handles for an identity (multi-device presence).
    pub fn handles_for(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .read()
            .get(user_id)
            .map(|handles| handles.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every live handle across all identities. Only the broadcast path
    /// uses this.
    pub fn all_handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .read()
            .values()
            .flat_map(|handles| handles.values().cloned())
            .collect()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.connections.read().contains_key(user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().values().map(HashMap::len).sum()
    }
}
