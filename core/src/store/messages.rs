// Message store: the append-only log, history queries and delivery
//
// Id assignment, append and persistence happen under one write lock so ids
// stay dense under concurrent senders. Handlers are notified after the lock
// is released.

use crate::directory::{AccountDirectory, GroupDirectory};
use crate::dispatch::{DeliveryHandler, DispatchConfig, Dispatcher};
use crate::message::{Message, Receiver};
use crate::store::backend::Persistence;
use crate::CourierError;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct MessageStore {
    /// Insertion order is id order
    messages: Arc<RwLock<Vec<Message>>>,
    accounts: Arc<dyn AccountDirectory>,
    groups: Arc<dyn GroupDirectory>,
    persistence: Arc<dyn Persistence>,
    dispatcher: Dispatcher,
}

impl MessageStore {
    /// Load the persisted log (or start empty) and wire up the collaborators
    pub fn initialize(
        accounts: Arc<dyn AccountDirectory>,
        groups: Arc<dyn GroupDirectory>,
        persistence: Arc<dyn Persistence>,
        dispatch: DispatchConfig,
    ) -> Result<Self, CourierError> {
        let messages = match persistence.load()? {
            Some(messages) => {
                info!("Loaded {} stored messages", messages.len());
                messages
            }
            None => {
                info!("No stored messages found, starting empty");
                Vec::new()
            }
        };

        // new ids are the log length, so a gapped log would hand out duplicates
        if let Some(pos) = messages
            .iter()
            .enumerate()
            .position(|(i, m)| m.id != i as u64)
        {
            return Err(CourierError::PersistenceFailure(format!(
                "stored message ids are not dense: position {} holds id {}",
                pos, messages[pos].id
            )));
        }

        Ok(Self {
            messages: Arc::new(RwLock::new(messages)),
            accounts,
            groups,
            persistence,
            dispatcher: Dispatcher::new(&dispatch)?,
        })
    }

    /// Direct messages exchanged between `user_a` and `user_b`, oldest first
    pub fn get_all_with_users(&self, user_a: &str, user_b: &str) -> Vec<Message> {
        self.messages
            .read()
            .iter()
            .filter(|m| m.is_between(user_a, user_b))
            .cloned()
            .collect()
    }

    /// Messages posted to `group_id`, oldest first
    pub fn get_all_in_group(&self, group_id: &str) -> Result<Vec<Message>, CourierError> {
        self.groups.validate_group(group_id)?;

        Ok(self
            .messages
            .read()
            .iter()
            .filter(|m| m.is_in_group(group_id))
            .cloned()
            .collect())
    }

    /// Send using a textual receiver kind (`"user"` or `"group"`)
    pub fn send_with_kind(
        &self,
        sender: &str,
        kind: &str,
        text: &str,
        target: &str,
    ) -> Result<Message, CourierError> {
        let receiver = Receiver::parse(kind, target)?;
        self.send(sender, receiver, text)
    }

    /// Validate, append, persist and notify.
    ///
    /// On error nothing is appended. Handler failures never surface here.
    pub fn send(
        &self,
        sender: &str,
        receiver: Receiver,
        text: &str,
    ) -> Result<Message, CourierError> {
        match &receiver {
            Receiver::User { username } => self.accounts.validate_user(username)?,
            Receiver::Group { group_id } => self.groups.validate_group(group_id)?,
        }

        let message = {
            let mut messages = self.messages.write();
            let message = Message::new(
                messages.len() as u64,
                sender.to_string(),
                receiver,
                text.to_string(),
            );
            messages.push(message.clone());

            if let Err(e) = self.persistence.save(&messages) {
                messages.pop();
                warn!("Failed to persist message {}: {}", message.id, e);
                return Err(e);
            }
            message
        };

        debug!(
            "Stored message {} from {} to {} {}",
            message.id,
            message.sender,
            message.receiver.kind(),
            message.receiver.target()
        );

        self.notify(&message);
        Ok(message)
    }

    fn notify(&self, message: &Message) {
        let recipients = match &message.receiver {
            // the sender gets an echo of their own direct message, first
            Receiver::User { username } => vec![message.sender.clone(), username.clone()],
            Receiver::Group { group_id } => match self.groups.members(group_id) {
                Ok(members) => members,
                Err(e) => {
                    warn!(
                        "Could not resolve roster of group {} for message {}: {}",
                        group_id, message.id, e
                    );
                    return;
                }
            },
        };

        self.dispatcher.dispatch(message, &recipients);
    }

    /// Set or replace the delivery handler for `username`
    pub fn register_callback(&self, username: &str, handler: Arc<dyn DeliveryHandler>) {
        self.dispatcher.register(username, handler);
    }

    /// Remove the handler for `username`; returns false if there was none
    pub fn unregister_callback(&self, username: &str) -> bool {
        self.dispatcher.unregister(username)
    }

    /// Remove the handler for `username` only if it is still `handler`
    pub fn release_callback(&self, username: &str, handler: &Arc<dyn DeliveryHandler>) -> bool {
        self.dispatcher.release(username, handler)
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    /// Copy of the whole log
    pub fn messages(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    /// Finish queued deliveries and flush the persistence backend
    pub fn shutdown(&self) -> Result<(), CourierError> {
        self.dispatcher.drain();
        self.persistence.flush()?;
        info!("Message store shut down with {} messages", self.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MockAccountDirectory, MockGroupDirectory};
    use crate::store::backend::MemoryPersistence;
    use parking_lot::Mutex;

    fn permissive_accounts() -> MockAccountDirectory {
        let mut accounts = MockAccountDirectory::new();
        accounts.expect_validate_user().returning(|_| Ok(()));
        accounts
    }

    fn store_with(
        accounts: MockAccountDirectory,
        groups: MockGroupDirectory,
    ) -> MessageStore {
        MessageStore::initialize(
            Arc::new(accounts),
            Arc::new(groups),
            Arc::new(MemoryPersistence::new()),
            DispatchConfig::inline(),
        )
        .unwrap()
    }

    #[test]
    fn test_first_message_example() {
        let store = store_with(permissive_accounts(), MockGroupDirectory::new());

        let sent = store.send_with_kind("alice", "user", "hi", "bob").unwrap();
        assert_eq!(sent.id, 0);
        assert_eq!(sent.sender, "alice");
        assert_eq!(sent.receiver, Receiver::user("bob"));
        assert_eq!(sent.text, "hi");

        assert_eq!(store.get_all_with_users("alice", "bob"), vec![sent.clone()]);
        assert_eq!(store.get_all_with_users("bob", "alice"), vec![sent]);
    }

    #[test]
    fn test_unknown_user_is_rejected_without_append() {
        let mut accounts = MockAccountDirectory::new();
        accounts
            .expect_validate_user()
            .withf(|name| name == "ghost")
            .times(1)
            .returning(|name| Err(CourierError::UnknownUser(name.to_string())));
        let store = store_with(accounts, MockGroupDirectory::new());

        let err = store.send("alice", Receiver::user("ghost"), "boo").unwrap_err();
        assert_eq!(err, CourierError::UnknownUser("ghost".to_string()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalid_recipient_type_leaves_store_unchanged() {
        let store = store_with(permissive_accounts(), MockGroupDirectory::new());
        store.send_with_kind("alice", "user", "hi", "bob").unwrap();

        let err = store
            .send_with_kind("alice", "carrier-pigeon", "coo", "bob")
            .unwrap_err();
        assert!(matches!(err, CourierError::InvalidRecipientType(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_group_queries_validate_group() {
        let mut groups = MockGroupDirectory::new();
        groups.expect_validate_group().returning(|id| {
            if id == "g1" {
                Ok(())
            } else {
                Err(CourierError::InvalidGroup(id.to_string()))
            }
        });
        groups
            .expect_members()
            .returning(|_| Ok(vec!["alice".to_string(), "bob".to_string()]));
        let store = store_with(permissive_accounts(), groups);

        let posted = store.send("alice", Receiver::group("g1"), "hello").unwrap();
        store.send("alice", Receiver::user("bob"), "psst").unwrap();

        assert_eq!(store.get_all_in_group("g1").unwrap(), vec![posted]);
        assert_eq!(
            store.get_all_in_group("g2"),
            Err(CourierError::InvalidGroup("g2".to_string()))
        );
        assert!(matches!(
            store.send("alice", Receiver::group("g2"), "x"),
            Err(CourierError::InvalidGroup(_))
        ));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_group_dispatch_follows_roster_including_sender() {
        let mut groups = MockGroupDirectory::new();
        groups.expect_validate_group().returning(|_| Ok(()));
        groups
            .expect_members()
            .times(1)
            .returning(|_| Ok(vec!["carol".into(), "alice".into(), "bob".into()]));
        let store = store_with(permissive_accounts(), groups);

        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["alice", "bob", "carol"] {
            let log = Arc::clone(&log);
            let label = name.to_string();
            store.register_callback(
                name,
                Arc::new(move |_: &Message| -> anyhow::Result<()> {
                    log.lock().push(label.clone());
                    Ok(())
                }),
            );
        }

        store.send("alice", Receiver::group("g1"), "hi all").unwrap();
        assert_eq!(*log.lock(), vec!["carol", "alice", "bob"]);
    }

    #[test]
    fn test_handler_may_query_store_during_inline_dispatch() {
        let store = store_with(permissive_accounts(), MockGroupDirectory::new());
        let seen = Arc::new(Mutex::new(0usize));

        let reader = store.clone();
        let counter = Arc::clone(&seen);
        store.register_callback(
            "bob",
            Arc::new(move |m: &Message| -> anyhow::Result<()> {
                *counter.lock() = reader.get_all_with_users(&m.sender, "bob").len();
                Ok(())
            }),
        );

        store.send("alice", Receiver::user("bob"), "one").unwrap();
        store.send("alice", Receiver::user("bob"), "two").unwrap();
        assert_eq!(*seen.lock(), 2);
    }
}
