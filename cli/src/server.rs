// Line-delimited JSON server for Courier clients
//
// Each connection gets a writer task fed by an unbounded channel. Responses and
// pushed messages share that channel, so lines never interleave.

use anyhow::{Context, Result};
use courier_core::{
    AccountBook, AccountProfile, CourierError, DeliveryHandler, FriendBook, GroupBook, Message,
    MessageStore, Receiver,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
enum Call {
    CreateUser {
        username: String,
        password: String,
        #[serde(flatten)]
        profile: AccountProfile,
    },
    Login {
        username: String,
        password: String,
    },
    Logout {},
    GetUsers {},
    GetUser {
        username: String,
    },
    GetFriends {},
    AddFriend {
        username: String,
    },
    RemoveFriend {
        username: String,
    },
    SendMessage {
        receiver: Receiver,
        text: String,
    },
    GetMessagesWith {
        username: String,
    },
    GetGroupMessages {
        group: String,
    },
    GetGroups {},
    CreateGroup {},
    AddGroupUser {
        group: String,
        username: String,
    },
    RemoveGroupUser {
        group: String,
        username: String,
    },
}

impl Call {
    fn needs_login(&self) -> bool {
        !matches!(
            self,
            Call::CreateUser { .. }
                | Call::Login { .. }
                | Call::GetUsers {}
                | Call::GetUser { .. }
        )
    }
}

fn success(id: Value, result: Value) -> Value {
    json!({ "id": id, "result": result })
}

fn failure(id: Value, message: impl Into<String>) -> Value {
    json!({ "id": id, "error": { "message": message.into() } })
}

fn to_result<T: Serialize>(value: T) -> Result<Value, CourierError> {
    serde_json::to_value(value).map_err(|e| CourierError::Internal(e.to_string()))
}

// ============================================================================
// SESSIONS
// ============================================================================

/// Pushes delivered messages onto a connection's outgoing queue
pub struct ConnectionHandler {
    outbox: mpsc::UnboundedSender<String>,
}

impl DeliveryHandler for ConnectionHandler {
    fn deliver(&self, message: &Message) -> anyhow::Result<()> {
        let push = json!({
            "method": "receive_message",
            "params": serde_json::to_value(message)?,
        });
        self.outbox
            .send(push.to_string())
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }
}

/// Per-connection state
pub struct Session {
    outbox: mpsc::UnboundedSender<String>,
    login: Option<(String, Arc<dyn DeliveryHandler>)>,
}

impl Session {
    pub fn new(outbox: mpsc::UnboundedSender<String>) -> Self {
        Self {
            outbox,
            login: None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.login.as_ref().map(|(name, _)| name.as_str())
    }
}

// ============================================================================
// REQUEST HANDLING
// ============================================================================

#[derive(Clone)]
pub struct Server {
    accounts: Arc<AccountBook>,
    groups: Arc<GroupBook>,
    friends: Arc<FriendBook>,
    store: MessageStore,
}

impl Server {
    pub fn new(
        accounts: Arc<AccountBook>,
        groups: Arc<GroupBook>,
        friends: Arc<FriendBook>,
        store: MessageStore,
    ) -> Self {
        Self {
            accounts,
            groups,
            friends,
            store,
        }
    }

    /// Handle one request line and return the response line
    pub fn handle_line(&self, session: &mut Session, line: &str) -> String {
        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(session, request),
            Err(e) => failure(Value::Null, format!("Malformed request: {}", e)),
        };
        response.to_string()
    }

    pub fn handle(&self, session: &mut Session, request: Request) -> Value {
        let params = if request.params.is_null() {
            json!({})
        } else {
            request.params
        };
        let call = json!({ "method": request.method, "params": params });

        let call: Call = match serde_json::from_value(call) {
            Ok(call) => call,
            Err(e) => {
                return failure(
                    request.id,
                    format!("Bad call to {}: {}", request.method, e),
                )
            }
        };

        match self.call(session, call) {
            Ok(result) => success(request.id, result),
            Err(e) => {
                tracing::debug!("{} failed: {}", request.method, e);
                failure(request.id, e.to_string())
            }
        }
    }

    fn call(&self, session: &mut Session, call: Call) -> Result<Value, CourierError> {
        let user = match session.username() {
            Some(name) => name.to_string(),
            None if call.needs_login() => {
                return Err(CourierError::Unauthorized("login required".to_string()))
            }
            None => String::new(),
        };

        match call {
            Call::CreateUser {
                username,
                password,
                profile,
            } => {
                self.accounts.create_user(&username, &password, profile)?;
                tracing::info!("Created user {}", username);
                Ok(json!(true))
            }
            Call::Login { username, password } => {
                if !self.accounts.verify_password(&username, &password) {
                    return Err(CourierError::Unauthorized(
                        "invalid username or password".to_string(),
                    ));
                }
                self.end_session(session);

                let handler: Arc<dyn DeliveryHandler> = Arc::new(ConnectionHandler {
                    outbox: session.outbox.clone(),
                });
                self.store.register_callback(&username, handler.clone());
                tracing::info!("{} logged in", username);
                session.login = Some((username, handler));
                Ok(json!(true))
            }
            Call::Logout {} => {
                self.end_session(session);
                Ok(json!(true))
            }
            Call::GetUsers {} => to_result(self.accounts.usernames()),
            Call::GetUser { username } => {
                let account = self.accounts.get_user(&username)?;
                Ok(json!({
                    "username": account.username,
                    "email": account.profile.email,
                }))
            }
            Call::GetFriends {} => to_result(self.friends.friends_of(&user)?),
            Call::AddFriend { username } => {
                self.friends.add_friend(&user, &username)?;
                Ok(json!(true))
            }
            Call::RemoveFriend { username } => {
                self.friends.remove_friend(&user, &username)?;
                Ok(json!(true))
            }
            Call::SendMessage { receiver, text } => {
                let message = self.store.send(&user, receiver, &text)?;
                Ok(json!(message.id))
            }
            Call::GetMessagesWith { username } => {
                if !self.accounts.user_exists(&username) {
                    return Err(CourierError::UnknownUser(username));
                }
                to_result(self.store.get_all_with_users(&user, &username))
            }
            Call::GetGroupMessages { group } => to_result(self.store.get_all_in_group(&group)?),
            Call::GetGroups {} => {
                let groups = self
                    .groups
                    .groups_with_user(&user)?
                    .iter()
                    .map(|id| self.groups.get_group(id))
                    .collect::<Result<Vec<_>, _>>()?;
                to_result(groups)
            }
            Call::CreateGroup {} => {
                let id = self.groups.create_group()?;
                self.groups.add_member(&id, &user)?;
                Ok(json!(id))
            }
            Call::AddGroupUser { group, username } => {
                self.groups.add_member(&group, &username)?;
                Ok(json!(true))
            }
            Call::RemoveGroupUser { group, username } => {
                self.groups.remove_member(&group, &username)?;
                Ok(json!(true))
            }
        }
    }

    /// Drop the session's login, releasing its handler if still registered
    pub fn end_session(&self, session: &mut Session) {
        if let Some((username, handler)) = session.login.take() {
            if self.store.release_callback(&username, &handler) {
                tracing::info!("{} logged out", username);
            }
        }
    }
}

// ============================================================================
// NETWORK LOOP
// ============================================================================

/// Bind and serve until Ctrl-C
pub async fn run(server: Server, address: &str, port: u16) -> Result<()> {
    let listener = TcpListener::bind((address, port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", address, port))?;

    serve(server, listener, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    })
    .await
}

/// Accept connections on `listener` until `shutdown` resolves, then drain
/// pending deliveries and flush the store
pub async fn serve(
    server: Server,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Listening on {}", addr);
    }
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::info!("Received connection from {}", peer);
                    tokio::spawn(handle_connection(server.clone(), stream, peer));
                }
                Err(e) => tracing::warn!("Accept failed: {}", e),
            },
            _ = &mut shutdown => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    let store = server.store.clone();
    tokio::task::spawn_blocking(move || store.shutdown())
        .await
        .context("Shutdown task panicked")?
        .context("Failed to flush message store")?;
    Ok(())
}

async fn handle_connection(server: Server, stream: TcpStream, peer: SocketAddr) {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(tx);
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                // store and directory calls block on locks and disk
                let worker = server.clone();
                let handled = tokio::task::spawn_blocking(move || {
                    let response = worker.handle_line(&mut session, &line);
                    (session, response)
                })
                .await;

                let response = match handled {
                    Ok((returned, response)) => {
                        session = returned;
                        response
                    }
                    Err(e) => {
                        tracing::error!("Request from {} aborted: {}", peer, e);
                        writer_task.abort();
                        return;
                    }
                };
                if session.outbox.send(response).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Read from {} failed: {}", peer, e);
                break;
            }
        }
    }

    server.end_session(&mut session);
    drop(session);
    writer_task.abort();
    tracing::info!("Client {} disconnected", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{DispatchConfig, MemoryPersistence};
    use std::time::{Duration, Instant};
    use tokio::sync::oneshot;

    fn server() -> Server {
        let accounts = Arc::new(AccountBook::in_memory());
        for name in ["alice", "bob"] {
            accounts
                .create_user(name, "password", AccountProfile::default())
                .unwrap();
        }
        let groups = Arc::new(GroupBook::in_memory(accounts.clone()));
        let friends = Arc::new(FriendBook::in_memory(accounts.clone()));
        let store = MessageStore::initialize(
            accounts.clone(),
            groups.clone(),
            Arc::new(MemoryPersistence::new()),
            DispatchConfig::inline(),
        )
        .unwrap();
        Server::new(accounts, groups, friends, store)
    }

    fn session() -> (Session, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(tx), rx)
    }

    fn call(server: &Server, session: &mut Session, request: Value) -> Value {
        let line = server.handle_line(session, &request.to_string());
        serde_json::from_str(&line).unwrap()
    }

    fn login(server: &Server, session: &mut Session, username: &str) {
        let response = call(
            server,
            session,
            json!({"id": 0, "method": "login", "params": {"username": username, "password": "password"}}),
        );
        assert_eq!(response["result"], json!(true));
    }

    #[test]
    fn test_methods_require_login() {
        let server = server();
        let (mut session, _rx) = session();

        let response = call(&server, &mut session, json!({"id": 1, "method": "get_groups"}));
        assert_eq!(response["id"], json!(1));
        assert_eq!(response["error"]["message"], json!("Not authorized: login required"));

        let response = call(&server, &mut session, json!({"id": 2, "method": "get_users"}));
        assert_eq!(response["result"], json!(["alice", "bob"]));
    }

    #[test]
    fn test_bad_password_and_malformed_requests() {
        let server = server();
        let (mut session, _rx) = session();

        let response = call(
            &server,
            &mut session,
            json!({"id": 1, "method": "login", "params": {"username": "alice", "password": "nope"}}),
        );
        assert_eq!(
            response["error"]["message"],
            json!("Not authorized: invalid username or password")
        );
        assert!(session.username().is_none());

        let line = server.handle_line(&mut session, "not json");
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["id"], Value::Null);
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Malformed request"));

        let response = call(&server, &mut session, json!({"id": 3, "method": "teleport"}));
        assert!(response["error"].is_object());
    }

    #[test]
    fn test_create_user_with_profile() {
        let server = server();
        let (mut session, _rx) = session();

        let response = call(
            &server,
            &mut session,
            json!({"id": 1, "method": "create_user", "params": {
                "username": "carol", "password": "secret1", "email": "carol@example.com"
            }}),
        );
        assert_eq!(response["result"], json!(true));
        assert_eq!(
            server.accounts.get_user("carol").unwrap().profile.email,
            "carol@example.com"
        );
    }

    #[test]
    fn test_send_pushes_to_both_sessions() {
        let server = server();
        let (mut alice, mut alice_rx) = session();
        let (mut bob, mut bob_rx) = session();
        login(&server, &mut alice, "alice");
        login(&server, &mut bob, "bob");

        let response = call(
            &server,
            &mut alice,
            json!({"id": 5, "method": "send_message", "params": {
                "receiver": {"type": "user", "username": "bob"}, "text": "hi"
            }}),
        );
        assert_eq!(response["result"], json!(0));

        for rx in [&mut alice_rx, &mut bob_rx] {
            let push: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(push["method"], json!("receive_message"));
            assert_eq!(push["params"]["text"], json!("hi"));
            assert_eq!(push["params"]["sender"], json!("alice"));
        }

        let response = call(
            &server,
            &mut bob,
            json!({"id": 6, "method": "get_messages_with", "params": {"username": "alice"}}),
        );
        assert_eq!(response["result"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_group_lifecycle() {
        let server = server();
        let (mut alice, _alice_rx) = session();
        login(&server, &mut alice, "alice");

        let response = call(&server, &mut alice, json!({"id": 1, "method": "create_group"}));
        let group = response["result"].as_str().unwrap().to_string();

        call(
            &server,
            &mut alice,
            json!({"id": 2, "method": "add_group_user", "params": {"group": group, "username": "bob"}}),
        );
        call(
            &server,
            &mut alice,
            json!({"id": 3, "method": "send_message", "params": {
                "receiver": {"type": "group", "id": group}, "text": "welcome"
            }}),
        );

        let response = call(&server, &mut alice, json!({"id": 4, "method": "get_groups"}));
        assert_eq!(response["result"][0]["members"], json!(["alice", "bob"]));

        let response = call(
            &server,
            &mut alice,
            json!({"id": 5, "method": "get_group_messages", "params": {"group": group}}),
        );
        assert_eq!(response["result"][0]["text"], json!("welcome"));

        let response = call(
            &server,
            &mut alice,
            json!({"id": 6, "method": "remove_group_user", "params": {"group": group, "username": "mallory"}}),
        );
        assert!(response["error"].is_object());
    }

    #[test]
    fn test_get_user_and_friends() {
        let server = server();
        let (mut alice, _alice_rx) = session();

        let response = call(
            &server,
            &mut alice,
            json!({"id": 1, "method": "get_user", "params": {"username": "bob"}}),
        );
        assert_eq!(response["result"], json!({"username": "bob", "email": ""}));

        let response = call(&server, &mut alice, json!({"id": 2, "method": "get_friends"}));
        assert_eq!(response["error"]["message"], json!("Not authorized: login required"));

        login(&server, &mut alice, "alice");
        let response = call(
            &server,
            &mut alice,
            json!({"id": 3, "method": "add_friend", "params": {"username": "bob"}}),
        );
        assert_eq!(response["result"], json!(true));

        let response = call(
            &server,
            &mut alice,
            json!({"id": 4, "method": "add_friend", "params": {"username": "mallory"}}),
        );
        assert!(response["error"].is_object());

        let response = call(&server, &mut alice, json!({"id": 5, "method": "get_friends"}));
        assert_eq!(response["result"], json!(["bob"]));
        assert!(server.friends.friends_of("bob").unwrap().is_empty());

        let response = call(
            &server,
            &mut alice,
            json!({"id": 6, "method": "remove_friend", "params": {"username": "bob"}}),
        );
        assert_eq!(response["result"], json!(true));
        let response = call(&server, &mut alice, json!({"id": 7, "method": "get_friends"}));
        assert_eq!(response["result"], json!([]));
    }

    #[test]
    fn test_stale_session_does_not_release_newer_login() {
        let server = server();
        let (mut first, _first_rx) = session();
        let (mut second, mut second_rx) = session();
        login(&server, &mut first, "bob");
        login(&server, &mut second, "bob");

        // the first connection closing must not unhook the second
        server.end_session(&mut first);
        server
            .store
            .send("alice", Receiver::user("bob"), "still there?")
            .unwrap();
        assert!(second_rx.try_recv().is_ok());

        server.end_session(&mut second);
        assert!(!server.store.unregister_callback("bob"));
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let server = server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn(serve(server, listener, async {
            let _ = stop_rx.await;
        }));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let requests = [
            json!({"id": 1, "method": "login", "params": {"username": "bob", "password": "password"}}),
            json!({"id": 2, "method": "send_message", "params": {
                "receiver": {"type": "user", "username": "bob"}, "text": "memo"
            }}),
        ];
        for request in requests {
            writer
                .write_all(format!("{}\n", request).as_bytes())
                .await
                .unwrap();
        }

        let mut received = Vec::new();
        while received.len() < 4 {
            let line = lines.next_line().await.unwrap().unwrap();
            received.push(serde_json::from_str::<Value>(&line).unwrap());
        }

        assert_eq!(received[0]["id"], json!(1));
        // a self-message is pushed twice, ahead of the send response
        assert_eq!(received[1]["method"], json!("receive_message"));
        assert_eq!(received[2]["method"], json!("receive_message"));
        assert_eq!(received[3]["result"], json!(0));

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_slow_request_does_not_stall_other_connections() {
        let server = server();
        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        server.store.register_callback(
            "bob",
            Arc::new(move |_: &Message| -> anyhow::Result<()> {
                let _ = entered_tx.send(());
                let _ = release_rx
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5));
                Ok(())
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn(serve(server, listener, async {
            let _ = stop_rx.await;
        }));

        let (reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut slow_lines = BufReader::new(reader).lines();
        for request in [
            json!({"id": 1, "method": "login", "params": {"username": "alice", "password": "password"}}),
            json!({"id": 2, "method": "send_message", "params": {
                "receiver": {"type": "user", "username": "bob"}, "text": "hold on"
            }}),
        ] {
            writer
                .write_all(format!("{}\n", request).as_bytes())
                .await
                .unwrap();
        }
        entered_rx.recv().await.unwrap();

        // the send is parked in bob's handler; another client still gets answers
        let started = Instant::now();
        let (reader, mut other) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut other_lines = BufReader::new(reader).lines();
        other
            .write_all(b"{\"id\": 9, \"method\": \"get_users\"}\n")
            .await
            .unwrap();
        let line = other_lines.next_line().await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(
            serde_json::from_str::<Value>(&line).unwrap()["result"],
            json!(["alice", "bob"])
        );

        release_tx.send(()).unwrap();
        let mut last = Value::Null;
        while last["id"] != json!(2) {
            let line = slow_lines.next_line().await.unwrap().unwrap();
            last = serde_json::from_str(&line).unwrap();
        }
        assert_eq!(last["result"], json!(0));

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }
}
