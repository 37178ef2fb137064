// Account storage
//
// Kept in memory and, when opened with a path, rewritten as a JSON document
// after every change.

use crate::directory::AccountDirectory;
use crate::store::backend::{read_json, write_json_atomic};
use crate::CourierError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

const MIN_PASSWORD_LEN: usize = 6;

/// Optional personal details attached to an account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountProfile {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    /// Hex-encoded SHA-256 of the password
    pub password_hash: String,
    #[serde(flatten)]
    pub profile: AccountProfile,
}

pub struct AccountBook {
    accounts: RwLock<BTreeMap<String, Account>>,
    path: Option<PathBuf>,
}

impl AccountBook {
    /// Create an account book that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            accounts: RwLock::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Open (or start) an account book persisted at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CourierError> {
        let path = path.into();
        let accounts = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            accounts: RwLock::new(accounts),
            path: Some(path),
        })
    }

    pub fn user_exists(&self, username: &str) -> bool {
        self.accounts.read().contains_key(username)
    }

    /// All usernames in sorted order
    pub fn usernames(&self) -> Vec<String> {
        self.accounts.read().keys().cloned().collect()
    }

    pub fn get_user(&self, username: &str) -> Result<Account, CourierError> {
        self.accounts
            .read()
            .get(username)
            .cloned()
            .ok_or_else(|| CourierError::UnknownUser(username.to_string()))
    }

    pub fn create_user(
        &self,
        username: &str,
        password: &str,
        profile: AccountProfile,
    ) -> Result<(), CourierError> {
        if username.trim().is_empty() {
            return Err(CourierError::InvalidInput("Username must not be empty".into()));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(CourierError::InvalidInput(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        let mut accounts = self.accounts.write();
        if accounts.contains_key(username) {
            return Err(CourierError::InvalidInput(format!(
                "A user named {} already exists",
                username
            )));
        }

        accounts.insert(
            username.to_string(),
            Account {
                username: username.to_string(),
                password_hash: hash_password(password),
                profile,
            },
        );

        if let Err(e) = self.save(&accounts) {
            accounts.remove(username);
            return Err(e);
        }
        tracing::info!("Created account {}", username);
        Ok(())
    }

    pub fn delete_user(&self, username: &str) -> Result<(), CourierError> {
        let mut accounts = self.accounts.write();
        let removed = accounts
            .remove(username)
            .ok_or_else(|| CourierError::UnknownUser(username.to_string()))?;

        if let Err(e) = self.save(&accounts) {
            accounts.insert(username.to_string(), removed);
            return Err(e);
        }
        Ok(())
    }

    /// False for unknown users as well as wrong passwords
    pub fn verify_password(&self, username: &str, password: &str) -> bool {
        self.accounts
            .read()
            .get(username)
            .map(|account| account.password_hash == hash_password(password))
            .unwrap_or(false)
    }

    fn save(&self, accounts: &BTreeMap<String, Account>) -> Result<(), CourierError> {
        match &self.path {
            Some(path) => write_json_atomic(path, accounts),
            None => Ok(()),
        }
    }
}

impl AccountDirectory for AccountBook {
    fn validate_user(&self, username: &str) -> Result<(), CourierError> {
        if self.user_exists(username) {
            Ok(())
        } else {
            Err(CourierError::UnknownUser(username.to_string()))
        }
    }
}

fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_validate() {
        let book = AccountBook::in_memory();
        book.create_user("alice", "secret1", AccountProfile::default())
            .unwrap();

        assert!(book.validate_user("alice").is_ok());
        assert_eq!(
            book.validate_user("bob"),
            Err(CourierError::UnknownUser("bob".to_string()))
        );
        assert_eq!(book.usernames(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_rejects_duplicates_and_short_passwords() {
        let book = AccountBook::in_memory();
        book.create_user("alice", "secret1", AccountProfile::default())
            .unwrap();

        assert!(matches!(
            book.create_user("alice", "another1", AccountProfile::default()),
            Err(CourierError::InvalidInput(_))
        ));
        assert!(matches!(
            book.create_user("bob", "short", AccountProfile::default()),
            Err(CourierError::InvalidInput(_))
        ));
        assert!(!book.user_exists("bob"));
    }

    #[test]
    fn test_verify_password() {
        let book = AccountBook::in_memory();
        book.create_user("alice", "secret1", AccountProfile::default())
            .unwrap();

        assert!(book.verify_password("alice", "secret1"));
        assert!(!book.verify_password("alice", "secret2"));
        assert!(!book.verify_password("nobody", "secret1"));

        // only the hash is kept
        let account = book.get_user("alice").unwrap();
        assert_ne!(account.password_hash, "secret1");
        assert_eq!(account.password_hash.len(), 64);
    }

    #[test]
    fn test_delete_user() {
        let book = AccountBook::in_memory();
        book.create_user("alice", "secret1", AccountProfile::default())
            .unwrap();

        book.delete_user("alice").unwrap();
        assert!(!book.user_exists("alice"));
        assert!(matches!(
            book.delete_user("alice"),
            Err(CourierError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_accounts_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");

        {
            let book = AccountBook::open(&path).unwrap();
            let profile = AccountProfile {
                email: "alice@example.com".into(),
                ..AccountProfile::default()
            };
            book.create_user("alice", "secret1", profile).unwrap();
        }

        let reopened = AccountBook::open(&path).unwrap();
        assert!(reopened.verify_password("alice", "secret1"));
        assert_eq!(
            reopened.get_user("alice").unwrap().profile.email,
            "alice@example.com"
        );
    }
}
