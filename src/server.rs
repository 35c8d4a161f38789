//! ChatServer Actor implementation
//!
//! The central actor that owns the online-user registry and executes every
//! command. Sessions reach it only through a cloneable `ServerHandle`.
//! Outbound messages are never written to mailboxes here; the actor
//! snapshots recipients and queues a `Delivery` for the broadcast pump.

use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::message::{ClientCommand, ServerMessage, JOINED, LEFT};
use crate::pump::{BroadcastPump, Delivery};
use crate::registry::Registry;
use crate::types::{ClientId, LeaveReason};
use crate::user::{Mailbox, User};

/// Channel buffer size for server commands and pump deliveries
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Commands sent from sessions to the ChatServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// New connection accepted
    Join {
        client_id: ClientId,
        addr: SocketAddr,
        mailbox: Mailbox,
    },
    /// Session ended
    Leave {
        client_id: ClientId,
        reason: LeaveReason,
    },
    /// `list`
    List { client_id: ClientId },
    /// `rename <name>`
    Rename { client_id: ClientId, name: String },
    /// `msg <target> <content>`
    Whisper {
        client_id: ClientId,
        target: String,
        content: String,
    },
    /// Public chat line
    Say { client_id: ClientId, text: String },
    /// Line that failed to parse
    Reject { client_id: ClientId, error: AppError },
    /// Names of every online user
    OnlineUsers { reply: oneshot::Sender<Vec<String>> },
    /// Resolve a display name
    Lookup {
        name: String,
        reply: oneshot::Sender<Option<ClientId>>,
    },
}

/// The main ChatServer actor
///
/// Sole owner of the registry, so commands run one at a time and a rename
/// can never be observed half done.
pub struct ChatServer {
    /// Online users: name -> User
    registry: Registry,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
    /// Outbound queue to the broadcast pump
    deliveries: mpsc::Sender<Delivery>,
}

impl ChatServer {
    /// Create a new ChatServer with the given command receiver
    pub fn new(receiver: mpsc::Receiver<ServerCommand>, deliveries: mpsc::Sender<Delivery>) -> Self {
        Self {
            registry: Registry::new(),
            receiver,
            deliveries,
        }
    }

    /// Run the ChatServer event loop
    ///
    /// Continuously receives and processes commands until all handles are dropped.
    pub async fn run(mut self) {
        info!("ChatServer started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        info!("ChatServer shutting down");
    }

    /// Process a single command
    async fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Join {
                client_id,
                addr,
                mailbox,
            } => {
                self.handle_join(client_id, addr, mailbox).await;
            }
            ServerCommand::Leave { client_id, reason } => {
                self.handle_leave(client_id, reason).await;
            }
            ServerCommand::List { client_id } => {
                self.handle_list(client_id).await;
            }
            ServerCommand::Rename { client_id, name } => {
                self.handle_rename(client_id, name).await;
            }
            ServerCommand::Whisper {
                client_id,
                target,
                content,
            } => {
                self.handle_whisper(client_id, target, content).await;
            }
            ServerCommand::Say { client_id, text } => {
                self.handle_say(client_id, text).await;
            }
            ServerCommand::Reject { client_id, error } => {
                debug!("Rejected line from {}: {}", client_id, error);
                self.reply(client_id, error.into()).await;
            }
            ServerCommand::OnlineUsers { reply } => {
                let names = self
                    .registry
                    .snapshot()
                    .into_iter()
                    .map(|u| u.name.clone())
                    .collect();
                let _ = reply.send(names);
            }
            ServerCommand::Lookup { name, reply } => {
                let _ = reply.send(self.registry.lookup(&name).map(|u| u.id));
            }
        }
    }

    /// Handle new connection: register under the address and announce
    async fn handle_join(&mut self, client_id: ClientId, addr: SocketAddr, mailbox: Mailbox) {
        let mut user = User::new(client_id, addr, mailbox);

        // Someone renamed themselves to this address string
        if self.registry.contains(&user.name) {
            let name = format!("{}#{}", user.name, client_id.short());
            user.set_name(name);
        }

        info!("Client {} joined as '{}'", client_id, user.name);

        let notice = user.public(JOINED);
        self.registry.register(user);
        self.broadcast(notice).await;

        debug!("Total online: {}", self.registry.len());
    }

    /// Handle session teardown
    ///
    /// Unregistering drops the registry's mailbox sender, which lets the
    /// session's delivery task finish once the pump is done with it.
    async fn handle_leave(&mut self, client_id: ClientId, reason: LeaveReason) {
        if reason == LeaveReason::TimedOut {
            self.reply(client_id, ServerMessage::TimedOut).await;
        }

        let Some(user) = self.registry.unregister_client(client_id) else {
            return;
        };

        info!("Client {} ('{}') left: {}", client_id, user.name, reason);

        if reason.announces() {
            self.broadcast(user.public(LEFT)).await;
        }

        debug!("Total online: {}", self.registry.len());
    }

    /// Handle `list`
    async fn handle_list(&mut self, client_id: ClientId) {
        let Some(user) = self.registry.get(client_id) else {
            return;
        };

        let entries = self
            .registry
            .snapshot()
            .into_iter()
            .map(User::presence)
            .collect();
        let delivery = Delivery::batch(user.mailbox.clone(), entries);

        self.deliver(delivery).await;
    }

    /// Handle `rename`
    async fn handle_rename(&mut self, client_id: ClientId, name: String) {
        let reply = match self.registry.rename(client_id, &name) {
            Ok(old_name) => {
                info!("Client {} renamed '{}' -> '{}'", client_id, old_name, name);
                ServerMessage::Renamed { name }
            }
            Err(AppError::NotOnline) => return,
            Err(e) => {
                debug!("Rename by {} refused: {}", client_id, e);
                e.into()
            }
        };

        self.reply(client_id, reply).await;
    }

    /// Handle `msg`
    async fn handle_whisper(&mut self, client_id: ClientId, target: String, content: String) {
        let Some(sender) = self.registry.get(client_id) else {
            return;
        };

        let Some(recipient) = self.registry.lookup(&target) else {
            let reply = AppError::UserNotFound(target).into();
            self.reply(client_id, reply).await;
            return;
        };

        debug!("Private message {} -> {}", sender.name, recipient.name);

        let confirm = Delivery::direct(
            sender.mailbox.clone(),
            ServerMessage::WhisperSent {
                to: recipient.name.clone(),
                content: content.clone(),
            },
        );
        let forward = Delivery::direct(
            recipient.mailbox.clone(),
            ServerMessage::WhisperReceived {
                from: sender.name.clone(),
                content,
            },
        );

        self.deliver(confirm).await;
        self.deliver(forward).await;
    }

    /// Handle a public line
    async fn handle_say(&mut self, client_id: ClientId, text: String) {
        let Some(user) = self.registry.get(client_id) else {
            return;
        };

        let msg = user.public(text);
        self.broadcast(msg).await;
    }

    /// Helper: queue a message for every online user
    async fn broadcast(&self, msg: ServerMessage) {
        let recipients = self.registry.recipients();
        if recipients.is_empty() {
            return;
        }
        self.deliver(Delivery::broadcast(recipients, msg)).await;
    }

    /// Helper: queue a message for one online user
    async fn reply(&self, client_id: ClientId, msg: ServerMessage) {
        let Some(user) = self.registry.get(client_id) else {
            return;
        };
        self.deliver(Delivery::direct(user.mailbox.clone(), msg)).await;
    }

    /// Helper: hand a delivery to the pump
    async fn deliver(&self, delivery: Delivery) {
        if self.deliveries.send(delivery).await.is_err() {
            warn!("Broadcast pump closed, dropping delivery");
        }
    }
}

/// Cloneable handle to the ChatServer actor
///
/// This is the only capability a session holds: it can register itself,
/// run commands and leave, but never touches the registry directly.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    sender: mpsc::Sender<ServerCommand>,
}

impl ServerHandle {
    pub fn new(sender: mpsc::Sender<ServerCommand>) -> Self {
        Self { sender }
    }

    /// Start the ChatServer actor and its broadcast pump
    pub fn spawn(config: &Config) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (delivery_tx, delivery_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);

        tokio::spawn(BroadcastPump::new(delivery_rx, config.delivery_timeout).run());
        tokio::spawn(ChatServer::new(cmd_rx, delivery_tx).run());

        Self::new(cmd_tx)
    }

    async fn send(&self, cmd: ServerCommand) -> Result<(), AppError> {
        self.sender.send(cmd).await.map_err(|_| AppError::ChannelSend)
    }

    pub async fn join(
        &self,
        client_id: ClientId,
        addr: SocketAddr,
        mailbox: Mailbox,
    ) -> Result<(), AppError> {
        self.send(ServerCommand::Join {
            client_id,
            addr,
            mailbox,
        })
        .await
    }

    pub async fn leave(&self, client_id: ClientId, reason: LeaveReason) -> Result<(), AppError> {
        self.send(ServerCommand::Leave { client_id, reason }).await
    }

    /// Parse one inbound line and run it on behalf of `client_id`
    pub async fn dispatch(&self, client_id: ClientId, line: &str) -> Result<(), AppError> {
        let cmd = match ClientCommand::parse(line) {
            Ok(command) => client_command_to_server(client_id, command),
            Err(error) => ServerCommand::Reject { client_id, error },
        };
        self.send(cmd).await
    }

    /// Names of every online user, in unspecified order
    ///
    /// Snapshot query for callers outside the actor, such as operator
    /// tooling and tests. Sessions never need it; they use `list`.
    pub async fn online_users(&self) -> Result<Vec<String>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::OnlineUsers { reply }).await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    /// Session currently registered under `name`
    ///
    /// Resolves a display name without going through a session. Answered
    /// in command order, so it observes every command sent before it.
    pub async fn lookup(&self, name: &str) -> Result<Option<ClientId>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::Lookup {
            name: name.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }
}

/// Convert a ClientCommand to a ServerCommand
fn client_command_to_server(client_id: ClientId, cmd: ClientCommand) -> ServerCommand {
    match cmd {
        ClientCommand::List => ServerCommand::List { client_id },
        ClientCommand::Rename { name } => ServerCommand::Rename { client_id, name },
        ClientCommand::Whisper { target, content } => ServerCommand::Whisper {
            client_id,
            target,
            content,
        },
        ClientCommand::Say { text } => ServerCommand::Say { client_id, text },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    struct TestUser {
        id: ClientId,
        addr: SocketAddr,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl TestUser {
        async fn recv(&mut self) -> ServerMessage {
            timeout(Duration::from_secs(1), self.rx.recv())
                .await
                .expect("timed out waiting for message")
                .expect("mailbox closed")
        }

        async fn assert_silent(&mut self) {
            let res = timeout(Duration::from_millis(50), self.rx.recv()).await;
            assert!(res.is_err(), "unexpected message: {:?}", res);
        }
    }

    fn spawn_server() -> ServerHandle {
        ServerHandle::spawn(&Config::default())
    }

    /// Join a user and consume its own join notice
    async fn join(server: &ServerHandle, port: u16) -> TestUser {
        let id = ClientId::new();
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let (mailbox, rx) = Mailbox::channel(id, 16);
        server.join(id, addr, mailbox).await.unwrap();

        let mut user = TestUser { id, addr, rx };
        assert_eq!(
            user.recv().await,
            ServerMessage::Public {
                addr,
                name: addr.to_string(),
                text: JOINED.to_string(),
            }
        );
        user
    }

    #[tokio::test]
    async fn test_join_is_announced_to_everyone() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;
        let bob = join(&server, 1001).await;

        let notice = alice.recv().await;
        assert_eq!(notice.to_string(), format!("[{}]{}: {}", bob.addr, bob.addr, JOINED));
    }

    #[tokio::test]
    async fn test_list_enumerates_online_users() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;
        let mut bob = join(&server, 1001).await;
        alice.recv().await; // bob joined

        server.dispatch(bob.id, "list").await.unwrap();

        let mut entries = vec![bob.recv().await.to_string(), bob.recv().await.to_string()];
        entries.sort();
        assert_eq!(
            entries,
            vec![
                "[127.0.0.1:1000]127.0.0.1:1000: 在线...".to_string(),
                "[127.0.0.1:1001]127.0.0.1:1001: 在线...".to_string(),
            ]
        );
        bob.assert_silent().await;
        alice.assert_silent().await;
    }

    #[tokio::test]
    async fn test_say_reaches_everyone_once() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;
        let mut bob = join(&server, 1001).await;
        alice.recv().await;

        server.dispatch(alice.id, "hello").await.unwrap();

        let expected = format!("[{}]{}: hello", alice.addr, alice.addr);
        assert_eq!(alice.recv().await.to_string(), expected);
        assert_eq!(bob.recv().await.to_string(), expected);
        alice.assert_silent().await;
        bob.assert_silent().await;
    }

    #[tokio::test]
    async fn test_rename_then_resolve() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;

        server.dispatch(alice.id, "rename alice").await.unwrap();

        assert_eq!(
            alice.recv().await,
            ServerMessage::Renamed {
                name: "alice".to_string()
            }
        );
        assert_eq!(server.lookup("alice").await.unwrap(), Some(alice.id));
        assert_eq!(server.lookup("127.0.0.1:1000").await.unwrap(), None);
        assert_eq!(server.online_users().await.unwrap(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_rename_to_taken_name() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;
        let mut bob = join(&server, 1001).await;
        alice.recv().await;

        server.dispatch(bob.id, "rename 127.0.0.1:1000").await.unwrap();

        assert_eq!(bob.recv().await.to_string(), "当前用户名已被使用");
        assert_eq!(server.lookup("127.0.0.1:1000").await.unwrap(), Some(alice.id));
        assert_eq!(server.lookup("127.0.0.1:1001").await.unwrap(), Some(bob.id));
    }

    #[tokio::test]
    async fn test_concurrent_renames_exactly_one_wins() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;
        let mut bob = join(&server, 1001).await;
        alice.recv().await;

        let (a, b) = tokio::join!(
            server.dispatch(alice.id, "rename carol"),
            server.dispatch(bob.id, "rename carol"),
        );
        a.unwrap();
        b.unwrap();

        let replies = [alice.recv().await, bob.recv().await];
        let won = replies
            .iter()
            .filter(|r| matches!(r, ServerMessage::Renamed { .. }))
            .count();
        let lost = replies
            .iter()
            .filter(|r| r.to_string() == "当前用户名已被使用")
            .count();
        assert_eq!((won, lost), (1, 1));

        let owner = server.lookup("carol").await.unwrap();
        assert!(owner == Some(alice.id) || owner == Some(bob.id));
    }

    #[tokio::test]
    async fn test_whisper_delivers_to_target_and_confirms() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;
        let mut bob = join(&server, 1001).await;
        alice.recv().await;
        server.dispatch(alice.id, "rename A").await.unwrap();
        alice.recv().await;
        server.dispatch(bob.id, "rename S").await.unwrap();
        bob.recv().await;

        server.dispatch(bob.id, "msg A hello").await.unwrap();

        assert_eq!(bob.recv().await.to_string(), "你对A说：hello");
        assert_eq!(alice.recv().await.to_string(), "S对你说：hello");
    }

    #[tokio::test]
    async fn test_whisper_to_unknown_user() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;
        let mut bob = join(&server, 1001).await;
        alice.recv().await;

        server.dispatch(bob.id, "msg ghost hi").await.unwrap();

        assert_eq!(bob.recv().await.to_string(), "该用户名不存在");
        bob.assert_silent().await;
        alice.assert_silent().await;
    }

    #[tokio::test]
    async fn test_malformed_command_is_rejected_to_sender_only() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;
        let mut bob = join(&server, 1001).await;
        alice.recv().await;

        server.dispatch(bob.id, "msg alice").await.unwrap();
        server.dispatch(bob.id, "rename ").await.unwrap();

        assert_eq!(
            bob.recv().await.to_string(),
            "消息格式不正确，请使用 \"msg 张三 你好啊\" 格式"
        );
        assert_eq!(bob.recv().await.to_string(), "用户名不能为空");
        alice.assert_silent().await;
    }

    #[tokio::test]
    async fn test_leave_announces_and_closes_mailbox() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;
        let mut bob = join(&server, 1001).await;
        alice.recv().await;

        server.leave(bob.id, LeaveReason::Disconnected).await.unwrap();

        assert_eq!(
            alice.recv().await.to_string(),
            format!("[{}]{}: {}", bob.addr, bob.addr, LEFT)
        );
        // Registry dropped the last sender
        assert_eq!(timeout(Duration::from_secs(1), bob.rx.recv()).await.unwrap(), None);
        assert_eq!(server.online_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_leave_notifies_user_first() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;
        let mut bob = join(&server, 1001).await;
        alice.recv().await;

        server.leave(bob.id, LeaveReason::TimedOut).await.unwrap();

        assert_eq!(bob.recv().await, ServerMessage::TimedOut);
        assert_eq!(timeout(Duration::from_secs(1), bob.rx.recv()).await.unwrap(), None);
        assert_eq!(alice.recv().await.to_string(), format!("[{}]{}: {}", bob.addr, bob.addr, LEFT));
    }

    #[tokio::test]
    async fn test_errored_leave_is_silent() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;
        let bob = join(&server, 1001).await;
        alice.recv().await;

        server.leave(bob.id, LeaveReason::Errored).await.unwrap();

        assert_eq!(server.lookup("127.0.0.1:1001").await.unwrap(), None);
        alice.assert_silent().await;
    }

    #[tokio::test]
    async fn test_join_with_taken_address_name_gets_suffix() {
        let server = spawn_server();
        let mut alice = join(&server, 1000).await;
        server.dispatch(alice.id, "rename 127.0.0.1:1001").await.unwrap();
        alice.recv().await;

        let id = ClientId::new();
        let addr: SocketAddr = "127.0.0.1:1001".parse().unwrap();
        let (mailbox, _rx) = Mailbox::channel(id, 16);
        server.join(id, addr, mailbox).await.unwrap();

        let expected = format!("127.0.0.1:1001#{}", id.short());
        assert_eq!(server.lookup(&expected).await.unwrap(), Some(id));
        assert_eq!(server.lookup("127.0.0.1:1001").await.unwrap(), Some(alice.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_user_does_not_block_actor() {
        let config = Config {
            delivery_timeout: Duration::from_millis(100),
            ..Config::default()
        };
        let server = ServerHandle::spawn(&config);

        // Capacity 1 and never drained: its own join notice fills it
        let stalled_id = ClientId::new();
        let (stalled_mailbox, _stalled_rx) = Mailbox::channel(stalled_id, 1);
        server
            .join(stalled_id, "127.0.0.1:2000".parse().unwrap(), stalled_mailbox)
            .await
            .unwrap();

        let id = ClientId::new();
        let addr: SocketAddr = "127.0.0.1:2001".parse().unwrap();
        let (mailbox, mut rx) = Mailbox::channel(id, 16);
        server.join(id, addr, mailbox).await.unwrap();

        let reader = tokio::spawn(async move {
            for _ in 0..501 {
                rx.recv().await.unwrap();
            }
        });

        let start = tokio::time::Instant::now();
        for i in 0..500 {
            server.dispatch(id, &format!("line {}", i)).await.unwrap();
        }
        assert_eq!(server.lookup("127.0.0.1:2001").await.unwrap(), Some(id));
        reader.await.unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed < Duration::from_millis(300), "took {:?}", elapsed);
    }
}
