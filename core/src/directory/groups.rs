// Group storage
//
// Groups are identified by a random UUID and keep their members in the order
// they joined; that order is the delivery roster.

use crate::directory::{AccountDirectory, GroupDirectory};
use crate::store::backend::{read_json, write_json_atomic};
use crate::CourierError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub members: Vec<String>,
}

impl Group {
    /// Groups have no name of their own; they are shown as their member list
    pub fn display_name(&self) -> String {
        self.members.join(", ")
    }
}

pub struct GroupBook {
    groups: RwLock<BTreeMap<String, Group>>,
    accounts: Arc<dyn AccountDirectory>,
    path: Option<PathBuf>,
}

impl GroupBook {
    pub fn in_memory(accounts: Arc<dyn AccountDirectory>) -> Self {
        Self {
            groups: RwLock::new(BTreeMap::new()),
            accounts,
            path: None,
        }
    }

    pub fn open(
        path: impl Into<PathBuf>,
        accounts: Arc<dyn AccountDirectory>,
    ) -> Result<Self, CourierError> {
        let path = path.into();
        let groups = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            groups: RwLock::new(groups),
            accounts,
            path: Some(path),
        })
    }

    pub fn group_exists(&self, group_id: &str) -> bool {
        self.groups.read().contains_key(group_id)
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.groups.read().keys().cloned().collect()
    }

    pub fn get_group(&self, group_id: &str) -> Result<Group, CourierError> {
        self.groups
            .read()
            .get(group_id)
            .cloned()
            .ok_or_else(|| CourierError::InvalidGroup(group_id.to_string()))
    }

    /// Ids of every group `username` belongs to
    pub fn groups_with_user(&self, username: &str) -> Result<Vec<String>, CourierError> {
        self.accounts.validate_user(username)?;

        Ok(self
            .groups
            .read()
            .values()
            .filter(|group| group.members.iter().any(|m| m == username))
            .map(|group| group.id.clone())
            .collect())
    }

    /// Create an empty group and return its id
    pub fn create_group(&self) -> Result<String, CourierError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.mutate(|groups| {
            groups.insert(
                id.clone(),
                Group {
                    id: id.clone(),
                    members: Vec::new(),
                },
            );
            Ok(())
        })?;
        tracing::info!("Created group {}", id);
        Ok(id)
    }

    pub fn delete_group(&self, group_id: &str) -> Result<(), CourierError> {
        self.mutate(|groups| {
            groups
                .remove(group_id)
                .map(|_| ())
                .ok_or_else(|| CourierError::InvalidGroup(group_id.to_string()))
        })
    }

    /// Append `username` to the roster. Adding an existing member is a no-op.
    pub fn add_member(&self, group_id: &str, username: &str) -> Result<(), CourierError> {
        self.accounts.validate_user(username)?;

        self.mutate(|groups| {
            let group = groups
                .get_mut(group_id)
                .ok_or_else(|| CourierError::InvalidGroup(group_id.to_string()))?;
            if !group.members.iter().any(|m| m == username) {
                group.members.push(username.to_string());
            }
            Ok(())
        })
    }

    pub fn remove_member(&self, group_id: &str, username: &str) -> Result<(), CourierError> {
        self.mutate(|groups| {
            let group = groups
                .get_mut(group_id)
                .ok_or_else(|| CourierError::InvalidGroup(group_id.to_string()))?;
            let before = group.members.len();
            group.members.retain(|m| m != username);
            if group.members.len() == before {
                return Err(CourierError::InvalidInput(format!(
                    "{} is not a member of group {}",
                    username, group_id
                )));
            }
            Ok(())
        })
    }

    /// Apply `change` to a copy of the groups and commit it only if it persists
    fn mutate<F>(&self, change: F) -> Result<(), CourierError>
    where
        F: FnOnce(&mut BTreeMap<String, Group>) -> Result<(), CourierError>,
    {
        let mut groups = self.groups.write();
        let mut updated = groups.clone();
        change(&mut updated)?;

        if let Some(path) = &self.path {
            write_json_atomic(path, &updated)?;
        }
        *groups = updated;
        Ok(())
    }
}

impl GroupDirectory for GroupBook {
    fn validate_group(&self, group_id: &str) -> Result<(), CourierError> {
        if self.group_exists(group_id) {
            Ok(())
        } else {
            Err(CourierError::InvalidGroup(group_id.to_string()))
        }
    }

    fn members(&self, group_id: &str) -> Result<Vec<String>, CourierError> {
        Ok(self.get_group(group_id)?.members)
    }
}
