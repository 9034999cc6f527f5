pub mod allocator;
pub mod bootstrap;
pub mod bundle;
pub mod error;
pub mod memory_store;
pub mod store;

pub use allocator::PrekeyAllocator;
pub use bootstrap::SessionBootstrapService;
pub use bundle::{ClaimedPreKey, DeviceKeyBundle, FetchedBundle, PublishKeys};
pub use error::KeyError;
pub use memory_store::MemoryKeyStore;
pub use store::KeyRepository;
