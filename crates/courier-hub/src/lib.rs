pub mod error;
pub mod hub;
pub mod registry;

pub use error::HubError;
pub use hub::{Delivery, DeliveryHub};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionState};
