// Friend lists
//
// Each user keeps an ordered, duplicate-free list of other users. Lists are
// one-directional: adding bob as alice's friend does not change bob's list.

use crate::directory::AccountDirectory;
use crate::store::backend::{read_json, write_json_atomic};
use crate::CourierError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

pub struct FriendBook {
    friends: RwLock<BTreeMap<String, Vec<String>>>,
    accounts: Arc<dyn AccountDirectory>,
    path: Option<PathBuf>,
}

impl FriendBook {
    pub fn in_memory(accounts: Arc<dyn AccountDirectory>) -> Self {
        Self {
            friends: RwLock::new(BTreeMap::new()),
            accounts,
            path: None,
        }
    }

    pub fn open(
        path: impl Into<PathBuf>,
        accounts: Arc<dyn AccountDirectory>,
    ) -> Result<Self, CourierError> {
        let path = path.into();
        let friends = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            friends: RwLock::new(friends),
            accounts,
            path: Some(path),
        })
    }

    /// Friends of `username` in the order they were added
    pub fn friends_of(&self, username: &str) -> Result<Vec<String>, CourierError> {
        self.accounts.validate_user(username)?;
        Ok(self
            .friends
            .read()
            .get(username)
            .cloned()
            .unwrap_or_default())
    }

    /// Add `friend` to `username`'s list. Adding an existing friend is a no-op.
    pub fn add_friend(&self, username: &str, friend: &str) -> Result<(), CourierError> {
        self.accounts.validate_user(username)?;
        self.accounts.validate_user(friend)?;

        self.mutate(|friends| {
            let list = friends.entry(username.to_string()).or_default();
            if !list.iter().any(|f| f == friend) {
                list.push(friend.to_string());
            }
            Ok(())
        })
    }

    pub fn remove_friend(&self, username: &str, friend: &str) -> Result<(), CourierError> {
        self.accounts.validate_user(username)?;

        self.mutate(|friends| {
            let list = friends.entry(username.to_string()).or_default();
            let before = list.len();
            list.retain(|f| f != friend);
            if list.len() == before {
                return Err(CourierError::InvalidInput(format!(
                    "{} is not a friend of {}",
                    friend, username
                )));
            }
            if list.is_empty() {
                friends.remove(username);
            }
            Ok(())
        })
    }

    fn mutate<F>(&self, change: F) -> Result<(), CourierError>
    where
        F: FnOnce(&mut BTreeMap<String, Vec<String>>) -> Result<(), CourierError>,
    {
        let mut friends = self.friends.write();
        let mut updated = friends.clone();
        change(&mut updated)?;

        if let Some(path) = &self.path {
            write_json_atomic(path, &updated)?;
        }
        *friends = updated;
        Ok(())
    }
}
