//! Push + acknowledge + retry.
//!
//! Durable state is the source of truth and live pushes only speed things
//! up: a push is applied to the store only after the target connection
//! acknowledged it, and an abandoned push leaves the message exactly as it
//! was, to be offered again by the next resynchronization.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use parley_shared::protocol::{ServerEvent, StatusChange};
use parley_shared::{MessageStatus, UserId};
use parley_store::{Database, Message, StoreError};

use crate::hub::{ConnectionHandle, Hub};
use crate::presence::PresenceStore;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    Fixed(Duration),
    /// Doubling delay capped at `max`, with up to 50% jitter.
    Exponential { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// How long each attempt waits for the acknowledgment.
    pub ack_timeout: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        match self.backoff {
            Backoff::None => None,
            Backoff::Fixed(delay) => Some(delay),
            Backoff::Exponential { initial, max } => {
                let factor = 1u32 << attempt.saturating_sub(1).min(16);
                let base = initial.saturating_mul(factor).min(max);
                let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
                Some((base + Duration::from_millis(jitter_ms)).min(max))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pushes
// ---------------------------------------------------------------------------

/// One state change to push, and the durable transition its
/// acknowledgment unlocks.
#[derive(Debug, Clone)]
pub enum Push {
    /// New message to the receiver; sets `received_at`.
    Deliver(Message),
    /// Receipt to the sender; advances `status`.
    Status { message: Message, status: MessageStatus },
    /// Post-receipt edit to the receiver; clears `edited_after_received`.
    Edit(Message),
    /// Post-receipt removal to the receiver; clears `deleted_after_received`.
    Remove(Message),
}

impl Push {
    /// What `user`'s connection still has to be told about `message`, if
    /// anything.
    pub fn for_pending(message: Message, user: &UserId) -> Option<Push> {
        if &message.receiver == user {
            if message.deleted_after_received {
                Some(Push::Remove(message))
            } else if message.edited_after_received {
                Some(Push::Edit(message))
            } else if !message.is_received() && !message.is_deleted() {
                Some(Push::Deliver(message))
            } else {
                None
            }
        } else if &message.sender == user {
            if message.read_at.is_some() && message.status < MessageStatus::Read {
                Some(Push::Status {
                    message,
                    status: MessageStatus::Read,
                })
            } else if message.is_received() && message.status < MessageStatus::Delivered {
                Some(Push::Status {
                    message,
                    status: MessageStatus::Delivered,
                })
            } else {
                None
            }
        } else {
            None
        }
    }

    pub fn message(&self) -> &Message {
        match self {
            Push::Deliver(m) | Push::Edit(m) | Push::Remove(m) => m,
            Push::Status { message, .. } => message,
        }
    }

    /// The user whose connection receives the push.
    pub fn target(&self) -> &UserId {
        match self {
            Push::Status { message, .. } => &message.sender,
            other => &other.message().receiver,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Push::Deliver(_) => "deliver",
            Push::Status { .. } => "status-change",
            Push::Edit(_) => "edit-propagate",
            Push::Remove(_) => "remove-propagate",
        }
    }

    pub fn event(&self) -> ServerEvent {
        match self {
            Push::Deliver(m) => ServerEvent::ReceiveMessage(m.view()),
            Push::Status { message, status } => ServerEvent::StatusMessage(StatusChange {
                id: message.id,
                conversation_id: message.conversation_id,
                status: *status,
            }),
            Push::Edit(m) => ServerEvent::EditMessage(m.view()),
            Push::Remove(m) => ServerEvent::RemoveMessage(m.view()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Acknowledged and written to the store.
    Applied,
    /// Target has no live connection in this process.
    Offline,
    /// Attempts exhausted (or the store write failed); nothing changed.
    Abandoned,
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Delivery {
    db: Arc<Mutex<Database>>,
    presence: Arc<dyn PresenceStore>,
    hub: Arc<Hub>,
    policy: RetryPolicy,
}

impl Delivery {
    pub fn new(
        db: Arc<Mutex<Database>>,
        presence: Arc<dyn PresenceStore>,
        hub: Arc<Hub>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            db,
            presence,
            hub,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Live handle of `user` in this process, via the presence registry.
    pub async fn resolve(&self, user: &UserId) -> Option<Arc<ConnectionHandle>> {
        let handle_id = match self.presence.lookup(user).await {
            Ok(Some(id)) => id,
            Ok(None) => return None,
            Err(e) => {
                warn!(user = %user, error = %e, "presence lookup failed");
                return None;
            }
        };
        let handle = self.hub.get(handle_id).await;
        if handle.is_none() {
            debug!(user = %user, handle = %handle_id, "presence entry has no live connection here");
        }
        handle.filter(|h| !h.is_closed())
    }

    /// Push to the target's live connection, if any. Waits for that
    /// connection to finish its resynchronization first.
    pub async fn push(&self, push: Push) -> Outcome {
        let Some(handle) = self.resolve(push.target()).await else {
            debug!(
                user = %push.target(),
                kind = push.kind(),
                message = %push.message().id,
                "target offline, leaving push to resync"
            );
            return Outcome::Offline;
        };
        handle.wait_synced().await;
        self.push_to(&handle, push).await
    }

    /// Deliver a new message, then tell the sender it was delivered.
    pub async fn deliver(&self, message: Message) -> Outcome {
        let outcome = self.push(Push::Deliver(message.clone())).await;
        if outcome == Outcome::Applied {
            self.push(Push::Status {
                message,
                status: MessageStatus::Delivered,
            })
            .await;
        }
        outcome
    }

    /// Run the attempt loop against one connection.
    pub async fn push_to(&self, handle: &ConnectionHandle, push: Push) -> Outcome {
        let event = push.event();
        let message_id = push.message().id;

        for attempt in 1..=self.policy.max_attempts {
            match handle
                .emit_with_ack(event.clone(), self.policy.ack_timeout)
                .await
            {
                Some(reply) if reply.is_success() => {
                    return match self.apply(&push).await {
                        Ok(()) => {
                            debug!(message = %message_id, kind = push.kind(), attempt, "push acknowledged");
                            Outcome::Applied
                        }
                        Err(e) => {
                            error!(message = %message_id, kind = push.kind(), error = %e, "failed to record acknowledgment");
                            Outcome::Abandoned
                        }
                    };
                }
                Some(reply) => {
                    debug!(message = %message_id, kind = push.kind(), attempt, error = ?reply.error, "push rejected by client");
                }
                None => {
                    debug!(message = %message_id, kind = push.kind(), attempt, "push not acknowledged in time");
                }
            }

            if handle.is_closed() {
                break;
            }
            if attempt < self.policy.max_attempts {
                if let Some(delay) = self.policy.delay_after(attempt) {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        warn!(
            user = %handle.user(),
            message = %message_id,
            kind = push.kind(),
            "giving up on push, leaving it to the next resync"
        );
        Outcome::Abandoned
    }

    /// Push everything the connection missed, strictly one message at a
    /// time. The first abandoned push halts the batch. Returns how many
    /// pushes were applied.
    pub async fn resync(&self, handle: &ConnectionHandle, pending: Vec<Message>) -> usize {
        let total = pending.len();
        let mut applied = 0;

        for message in pending {
            let Some(push) = Push::for_pending(message, handle.user()) else {
                continue;
            };

            match self.push_to(handle, push.clone()).await {
                Outcome::Applied => {
                    applied += 1;
                    if let Push::Deliver(message) = push {
                        let this = self.clone();
                        tokio::spawn(async move {
                            this.push(Push::Status {
                                message,
                                status: MessageStatus::Delivered,
                            })
                            .await;
                        });
                    }
                }
                _ => {
                    warn!(user = %handle.user(), applied, total, "halting resync");
                    break;
                }
            }
        }

        info!(user = %handle.user(), applied, total, "resync finished");
        applied
    }

    async fn apply(&self, push: &Push) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        let id = push.message().id;
        match push {
            Push::Deliver(_) => {
                db.mark_received(id)?;
            }
            Push::Status { status, .. } => {
                db.advance_status(id, *status)?;
            }
            Push::Edit(_) => db.clear_edited_flag(id)?,
            Push::Remove(_) => {
                db.clear_deleted_flag(id)?;
                db.clear_edited_flag(id)?;
            }
        }
        Ok(())
    }
}
