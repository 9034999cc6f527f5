use std::sync::{Arc, Mutex};

use courier_hub::{ConnectionRegistry, DeliveryHub};
use courier_keys::SessionBootstrapService;
use rusqlite::Connection;

use crate::key_store::SqliteKeyStore;
use crate::message_store::SqliteMessageStore;

/// Outbound queue depth per connection. Overflow force-disconnects the
/// connection rather than stalling delivery to anyone else.
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Central state for the server process, built once at startup and shared
/// by every handler and connection task.
pub struct ServerState {
    /// Publish/fetch orchestration over the key repository.
    pub bootstrap: SessionBootstrapService,
    /// Live connections keyed by identity.
    pub registry: Arc<ConnectionRegistry>,
    /// Per-recipient envelope routing.
    pub hub: DeliveryHub,
    /// Envelopes awaiting offline recipients.
    pub pending: SqliteMessageStore,
}

pub type SharedState = Arc<ServerState>;

impl ServerState {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(OUTBOUND_QUEUE_CAPACITY));
        Self {
            bootstrap: SessionBootstrapService::new(Arc::new(SqliteKeyStore::new(
                Arc::clone(&conn),
            ))),
            hub: DeliveryHub::new(Arc::clone(&registry)),
            registry,
            pending: SqliteMessageStore::new(conn),
        }
    }
}
