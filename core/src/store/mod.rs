// Store module: message log and its persistence backends

pub mod backend;
pub mod messages;

pub use backend::{FilePersistence, MemoryPersistence, Persistence, SledPersistence};
pub use messages::MessageStore;
