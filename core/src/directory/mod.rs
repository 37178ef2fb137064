// Directory module: who exists and who belongs to which group
//
// The message store only talks to these traits. AccountBook and GroupBook are
// the bundled implementations used by the CLI and server; FriendBook sits
// alongside them for the server's friend lists.

pub mod accounts;
pub mod friends;
pub mod groups;

pub use accounts::{Account, AccountBook, AccountProfile};
pub use friends::FriendBook;
pub use groups::{Group, GroupBook};

use crate::CourierError;

/// Answers whether a username refers to a real account
#[cfg_attr(test, mockall::automock)]
pub trait AccountDirectory: Send + Sync {
    /// Fails with `UnknownUser` if the account does not exist
    fn validate_user(&self, username: &str) -> Result<(), CourierError>;
}

/// Answers whether a group exists and who is in it
#[cfg_attr(test, mockall::automock)]
pub trait GroupDirectory: Send + Sync {
    /// Fails with `InvalidGroup` if the group does not exist
    fn validate_group(&self, group_id: &str) -> Result<(), CourierError>;
    /// Members of the group in roster order
    fn members(&self, group_id: &str) -> Result<Vec<String>, CourierError>;
}
