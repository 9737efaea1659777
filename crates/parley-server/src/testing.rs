//! In-process test harness: a real [`AppState`] over in-memory SQLite and
//! presence, plus simulated clients that record what they are pushed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use parley_shared::protocol::{AckReply, ServerEvent, ServerFrame};
use parley_shared::{MessageId, MessageStatus, UserId};
use parley_store::{Database, Message, NewMessage};

use crate::config::ServerConfig;
use crate::delivery::{Backoff, RetryPolicy};
use crate::hub::ConnectionHandle;
use crate::presence::{MemoryPresence, PresenceStore};
use crate::session::Session;
use crate::state::AppState;

const WAIT_STEP: Duration = Duration::from_millis(5);
const WAIT_LIMIT: Duration = Duration::from_secs(2);

/// How a simulated client answers pushes that expect an acknowledgment.
#[derive(Debug, Clone, Copy)]
pub enum ClientMode {
    AutoAck,
    /// Never acknowledges.
    Silent,
    /// Rejects the first `n` pushes, then acknowledges.
    RejectFirst(usize),
    /// Acknowledges every push after the given delay.
    Delayed(Duration),
}

pub struct Harness {
    pub state: AppState,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tune: impl FnOnce(&mut ServerConfig)) -> Harness {
    let mut config = ServerConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            ack_timeout: Duration::from_millis(50),
            backoff: Backoff::None,
        },
        ..ServerConfig::default()
    };
    tune(&mut config);

    let db = Database::open_in_memory().unwrap();
    let presence: Arc<dyn PresenceStore> = Arc::new(MemoryPresence::new());
    Harness {
        state: AppState::new(db, presence, config),
    }
}

impl Harness {
    pub async fn seed_user(&self, name: &str) -> UserId {
        let user = UserId::parse(name).unwrap();
        self.state.db.lock().await.ensure_user(&user).unwrap();
        user
    }

    /// Store a `"hello"` message without pushing it anywhere.
    pub async fn seed_message(&self, from: &str, to: &str, uuid: &str) -> Message {
        let sender = self.seed_user(from).await;
        let receiver = self.seed_user(to).await;
        let db = self.state.db.lock().await;
        let (conversation, _) = db.find_or_create_conversation(&sender, &receiver).unwrap();
        let (message, _) = db
            .insert_message(&NewMessage {
                conversation_id: conversation.id,
                sender,
                receiver,
                text: "hello".into(),
                uuid: uuid.into(),
            })
            .unwrap();
        message
    }

    pub async fn message(&self, id: MessageId) -> Message {
        self.state.db.lock().await.get_message(id).unwrap()
    }

    /// Poll the store until `check` holds for the message.
    pub async fn wait_until(&self, check: impl Fn(&Message) -> bool, id: MessageId) -> bool {
        let check = &check;
        poll(|| async move { check(&self.message(id).await) }).await
    }

    pub async fn wait_until_received(&self, id: MessageId) -> bool {
        self.wait_until(|m| m.received_at.is_some(), id).await
    }

    pub async fn wait_until_status(&self, id: MessageId, status: MessageStatus) -> bool {
        self.wait_until(|m| m.status >= status, id).await
    }

    /// A bare live connection: registered and online, already synced, but
    /// without a session running the connect sequence.
    pub async fn attach(&self, name: &str, mode: ClientMode) -> TestClient {
        let user = self.seed_user(name).await;
        let client = TestClient::spawn(user.clone(), mode);
        self.state.hub.register(client.handle.clone()).await;
        self.state
            .presence
            .set_online(&user, client.handle.id())
            .await
            .unwrap();
        client.handle.mark_synced();
        client
    }

    /// A full connection through the lifecycle manager.
    pub async fn connect(&self, name: &str, mode: ClientMode) -> (Session, TestClient) {
        let user = UserId::parse(name).unwrap();
        let client = TestClient::spawn(user, mode);
        let session = Session::connect(self.state.clone(), client.handle.clone())
            .await
            .unwrap();
        (session, client)
    }
}

/// Simulated client on the far side of a [`ConnectionHandle`].
pub struct TestClient {
    pub handle: Arc<ConnectionHandle>,
    events: Arc<Mutex<Vec<ServerEvent>>>,
    replies: Arc<Mutex<Vec<(u64, AckReply)>>>,
}

impl TestClient {
    fn spawn(user: UserId, mode: ClientMode) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ConnectionHandle::new(user, tx));
        let events = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::new(Mutex::new(Vec::new()));

        {
            let handle = handle.clone();
            let events = events.clone();
            let replies = replies.clone();
            tokio::spawn(async move {
                let mut rejections_left = match mode {
                    ClientMode::RejectFirst(n) => n,
                    _ => 0,
                };
                while let Some(frame) = rx.recv().await {
                    match frame {
                        ServerFrame::Event { ack, event } => {
                            events.lock().await.push(event);
                            let Some(id) = ack else { continue };
                            let reply = match mode {
                                ClientMode::Silent => continue,
                                ClientMode::Delayed(delay) => {
                                    let handle = handle.clone();
                                    tokio::spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        handle.resolve_ack(id, AckReply::success()).await;
                                    });
                                    continue;
                                }
                                _ if rejections_left > 0 => {
                                    rejections_left -= 1;
                                    AckReply::failure("not now")
                                }
                                _ => AckReply::success(),
                            };
                            handle.resolve_ack(id, reply).await;
                        }
                        ServerFrame::Ack { id, reply } => replies.lock().await.push((id, reply)),
                    }
                }
            });
        }

        Self {
            handle,
            events,
            replies,
        }
    }

    pub async fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().await.clone()
    }

    pub async fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    pub async fn saw(&self, name: &str) -> bool {
        self.count(name).await > 0
    }

    pub async fn wait_for(&self, name: &str) -> bool {
        self.wait_for_count(name, 1).await
    }

    pub async fn wait_for_count(&self, name: &str, n: usize) -> bool {
        poll(|| async move { self.count(name).await >= n }).await
    }

    pub async fn wait_for_status(&self, id: MessageId, status: MessageStatus) -> bool {
        poll(|| async move {
            self.events.lock().await.iter().any(|e| {
                matches!(e, ServerEvent::StatusMessage(change) if change.id == id && change.status == status)
            })
        })
        .await
    }

    pub async fn replies(&self) -> Vec<(u64, AckReply)> {
        self.replies.lock().await.clone()
    }

    /// The acknowledgment for request `id`, waiting briefly for it.
    pub async fn reply(&self, id: u64) -> Option<AckReply> {
        let arrived = poll(|| async move { self.replies.lock().await.iter().any(|(i, _)| *i == id) }).await;
        if !arrived {
            return None;
        }
        self.replies
            .lock()
            .await
            .iter()
            .find(|(i, _)| *i == id)
            .map(|(_, reply)| reply.clone())
    }
}

async fn poll<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
}
