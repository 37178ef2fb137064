// Message types: the records the store appends and serves back as history

use crate::CourierError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Who a message is addressed to.
///
/// Serialized with an inline `type` tag so a stored record reads
/// `{"type":"user","username":"bob"}` or `{"type":"group","id":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Receiver {
    /// Direct message to a single user
    User { username: String },
    /// Message posted to a group
    Group {
        #[serde(rename = "id")]
        group_id: String,
    },
}

impl Receiver {
    pub fn user(username: impl Into<String>) -> Self {
        Receiver::User {
            username: username.into(),
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Receiver::Group {
            group_id: group_id.into(),
        }
    }

    /// Build a receiver from a textual kind (`"user"` / `"group"`) and its target.
    pub fn parse(kind: &str, target: impl Into<String>) -> Result<Self, CourierError> {
        let kind: ReceiverKind = kind.parse()?;
        Ok(match kind {
            ReceiverKind::User => Receiver::user(target),
            ReceiverKind::Group => Receiver::group(target),
        })
    }

    pub fn kind(&self) -> ReceiverKind {
        match self {
            Receiver::User { .. } => ReceiverKind::User,
            Receiver::Group { .. } => ReceiverKind::Group,
        }
    }

    /// The username or group id this receiver points at
    pub fn target(&self) -> &str {
        match self {
            Receiver::User { username } => username,
            Receiver::Group { group_id } => group_id,
        }
    }
}

/// The two recipient types a message may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverKind {
    User,
    Group,
}

impl FromStr for ReceiverKind {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ReceiverKind::User),
            "group" => Ok(ReceiverKind::Group),
            other => Err(CourierError::InvalidRecipientType(other.to_string())),
        }
    }
}

impl fmt::Display for ReceiverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReceiverKind::User => f.write_str("user"),
            ReceiverKind::Group => f.write_str("group"),
        }
    }
}

/// A stored message. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Position in the store's log; equals the log length at creation
    pub id: u64,
    /// Username of the author
    pub sender: String,
    pub receiver: Receiver,
    /// Seconds since the unix epoch, sub-second precision
    pub timestamp: f64,
    pub text: String,
}

impl Message {
    /// Create a message stamped with the current wall-clock time
    pub fn new(id: u64, sender: String, receiver: Receiver, text: String) -> Self {
        Self {
            id,
            sender,
            receiver,
            timestamp: current_timestamp(),
            text,
        }
    }

    /// True if this is a direct message exchanged between `a` and `b`, in either direction
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        match &self.receiver {
            Receiver::User { username } => {
                (self.sender == a && username == b) || (self.sender == b && username == a)
            }
            Receiver::Group { .. } => false,
        }
    }

    /// True if this message was posted to `group_id`
    pub fn is_in_group(&self, group_id: &str) -> bool {
        matches!(&self.receiver, Receiver::Group { group_id: id } if id == group_id)
    }
}

pub fn current_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_direct_message() {
        let msg = Message::new(0, "alice".into(), Receiver::user("bob"), "hi".into());

        assert_eq!(msg.id, 0);
        assert_eq!(msg.receiver.kind(), ReceiverKind::User);
        assert_eq!(msg.receiver.target(), "bob");
        assert!(msg.timestamp > 0.0);
    }

    #[test]
    fn test_is_between_is_symmetric() {
        let msg = Message::new(0, "alice".into(), Receiver::user("bob"), "hi".into());

        assert!(msg.is_between("alice", "bob"));
        assert!(msg.is_between("bob", "alice"));
        assert!(!msg.is_between("alice", "carol"));
        assert!(!msg.is_in_group("bob"));
    }

    #[test]
    fn test_group_message_is_never_direct() {
        let msg = Message::new(3, "alice".into(), Receiver::group("g1"), "yo".into());

        assert!(msg.is_in_group("g1"));
        assert!(!msg.is_in_group("g2"));
        // a group id that happens to equal a username must not leak into DM history
        assert!(!msg.is_between("alice", "g1"));
    }

    #[test]
    fn test_parse_receiver_kind() {
        assert_eq!("user".parse::<ReceiverKind>().unwrap(), ReceiverKind::User);
        assert_eq!("group".parse::<ReceiverKind>().unwrap(), ReceiverKind::Group);

        let err = Receiver::parse("carrier-pigeon", "bob").unwrap_err();
        assert_eq!(
            err,
            CourierError::InvalidRecipientType("carrier-pigeon".to_string())
        );
    }

    #[test]
    fn test_receiver_wire_shape() {
        let user = serde_json::to_value(Receiver::user("bob")).unwrap();
        assert_eq!(user, serde_json::json!({"type": "user", "username": "bob"}));

        let group = serde_json::to_value(Receiver::group("g1")).unwrap();
        assert_eq!(group, serde_json::json!({"type": "group", "id": "g1"}));
    }
}
