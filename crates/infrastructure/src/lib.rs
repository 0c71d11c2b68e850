pub mod backend_factory;
pub mod database;
pub mod in_memory_queue;
pub mod in_memory_store;

pub use backend_factory::{BackendFactory, Backends};
pub use database::*;
pub use in_memory_queue::{InMemoryMessageQueue, InMemoryQueueConfig};
pub use in_memory_store::InMemoryTaskStateStore;
