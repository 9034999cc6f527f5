pub mod envelope;
pub mod error;
pub mod frame;

pub use envelope::MessageEnvelope;
pub use error::ProtocolError;
pub use frame::{ClientFrame, ServerFrame};
