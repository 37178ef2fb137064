// Message module: record types for direct and group messages

pub mod types;

pub use types::{current_timestamp, Message, Receiver, ReceiverKind};
