// Courier Core: message log, history and delivery notification
//
// Direct and group messages are appended to one ordered log, served back as
// history, and pushed to whichever handlers the participants registered.

pub mod directory;
pub mod dispatch;
pub mod message;
pub mod store;

use thiserror::Error;

pub use directory::{
    Account, AccountBook, AccountDirectory, AccountProfile, FriendBook, Group, GroupBook,
    GroupDirectory,
};
pub use dispatch::{DeliveryHandler, DispatchConfig, DispatchMode, Dispatcher};
pub use message::{Message, Receiver, ReceiverKind};
pub use store::{FilePersistence, MemoryPersistence, MessageStore, Persistence, SledPersistence};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CourierError {
    #[error("User {0} does not exist")]
    UnknownUser(String),
    #[error("Group {0} does not exist")]
    InvalidGroup(String),
    #[error("Invalid recipient type: {0}")]
    InvalidRecipientType(String),
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Not authorized: {0}")]
    Unauthorized(String),
    #[error("Internal error: {0}")]
    Internal(String),
}
