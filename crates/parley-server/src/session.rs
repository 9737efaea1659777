//! Connection lifecycle: what happens between a socket being accepted and
//! closed, for one authenticated user.
//!
//! A [`Session`] owns the connection's conversation cache. Requests are
//! dispatched to it one at a time from the socket task, so the cache is
//! never shared with other connections.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use parley_shared::protocol::{AckReply, ClientRequest, ConversationView, PeerView, ServerEvent};
use parley_shared::{ConversationId, PresenceStatus, UserId};
use parley_store::{Conversation, Database, StoreError};

use crate::error::HandlerError;
use crate::hub::ConnectionHandle;
use crate::state::AppState;

pub struct Session {
    pub(crate) state: AppState,
    pub(crate) handle: Arc<ConnectionHandle>,
    pub(crate) conversations: HashMap<ConversationId, Conversation>,
}

impl Session {
    /// Bring a freshly authenticated connection online.
    ///
    /// Registers presence, subscribes to every visible unblocked
    /// conversation, sends the conversation list, replays whatever the user
    /// missed and finally announces the user as online. Live pushes to this
    /// connection are held back until the replay has finished.
    pub async fn connect(state: AppState, handle: Arc<ConnectionHandle>) -> Result<Self, HandlerError> {
        let mut session = Session {
            state,
            handle,
            conversations: HashMap::new(),
        };

        match session.bring_online().await {
            Ok(()) => Ok(session),
            Err(e) => {
                session.handle.mark_synced();
                session.teardown().await;
                Err(e)
            }
        }
    }

    async fn bring_online(&mut self) -> Result<(), HandlerError> {
        let user = self.user().clone();

        self.state.hub.register(self.handle.clone()).await;
        self.state.presence.set_online(&user, self.handle.id()).await?;
        info!(user = %user, handle = %self.handle.id(), "user online");

        let conversations = {
            let db = self.state.db.lock().await;
            db.ensure_user(&user)?;
            db.conversations_for(&user)?
        };

        let peers: Vec<UserId> = conversations.iter().map(|c| c.other(&user).clone()).collect();
        let statuses = self.state.presence.lookup_statuses(&peers).await?;

        for conversation in &conversations {
            if !conversation.has_block() {
                self.handle.join(conversation.other(&user)).await;
            }
        }

        let views = {
            let db = self.state.db.lock().await;
            conversations
                .iter()
                .map(|c| {
                    let status = statuses
                        .get(c.other(&user))
                        .copied()
                        .unwrap_or(PresenceStatus::Offline);
                    conversation_view(&db, c, &user, status)
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        self.conversations = conversations.into_iter().map(|c| (c.id, c)).collect();
        self.handle.emit(ServerEvent::Conversations(views));

        let pending = self.state.db.lock().await.pending_messages_for(&user)?;
        debug!(user = %user, pending = pending.len(), "resynchronizing");
        self.state.delivery.resync(&self.handle, pending).await;
        self.handle.mark_synced();

        self.broadcast_status(PresenceStatus::Online).await;
        Ok(())
    }

    /// Take the connection offline. Acknowledgments still in flight are
    /// dropped; their messages stay pending for the next resync.
    ///
    /// Partners are only told the user went offline when this connection
    /// still owned the presence entry; a newer connection keeps them online.
    pub async fn disconnect(self) {
        if self.teardown().await {
            self.broadcast_status(PresenceStatus::Offline).await;
            info!(user = %self.user(), handle = %self.handle.id(), "user offline");
        } else {
            debug!(user = %self.user(), handle = %self.handle.id(), "superseded connection closed");
        }
    }

    /// Returns whether the presence entry was cleared.
    async fn teardown(&self) -> bool {
        self.handle.close().await;
        let cleared = match self
            .state
            .presence
            .set_offline(self.user(), self.handle.id())
            .await
        {
            Ok(cleared) => cleared,
            Err(e) => {
                warn!(user = %self.user(), error = %e, "failed to clear presence");
                true
            }
        };
        self.state.hub.unregister(self.handle.id()).await;
        cleared
    }

    pub fn user(&self) -> &UserId {
        self.handle.user()
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    /// Extend this user's presence lease.
    pub async fn refresh_presence(&self) {
        if let Err(e) = self.state.presence.refresh(self.user()).await {
            warn!(user = %self.user(), error = %e, "failed to refresh presence lease");
        }
    }

    /// Tell every subscribed partner that this user came online or went
    /// offline. Fire-and-forget.
    async fn broadcast_status(&self, status: PresenceStatus) {
        let event = ServerEvent::StatusUpdate(PeerView {
            user_id: self.user().clone(),
            status,
        });
        for peer in self.handle.subscriptions().await {
            let Some(peer_handle) = self.state.delivery.resolve(&peer).await else {
                continue;
            };
            if peer_handle.is_subscribed(self.user()).await {
                peer_handle.emit(event.clone());
            }
        }
    }

    /// Handle one client request and acknowledge it. A request without an
    /// acknowledgment id is a caller error and has no effect.
    pub async fn dispatch(&mut self, ack: Option<u64>, request: serde_json::Value) {
        let Some(ack) = ack else {
            warn!(user = %self.user(), "request without acknowledgment id, ignoring");
            return;
        };

        let request = match ClientRequest::from_value(request) {
            Ok(request) => request,
            Err(e) => {
                debug!(user = %self.user(), error = %e, "malformed request");
                self.handle.reply(ack, HandlerError::from(e).into_reply());
                return;
            }
        };

        let name = request.name();
        let result = AssertUnwindSafe(self.handle_request(request))
            .catch_unwind()
            .await;

        let reply = match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                debug!(user = %self.user(), event = name, error = %e, "request failed");
                e.into_reply()
            }
            Err(_) => {
                error!(user = %self.user(), event = name, "handler panicked");
                AckReply::failure("internal error")
            }
        };
        self.handle.reply(ack, reply);
    }

    /// Conversation from the cache, loading it on a miss.
    pub(crate) async fn cached_conversation(
        &mut self,
        id: ConversationId,
    ) -> Result<Conversation, HandlerError> {
        if let Some(conversation) = self.conversations.get(&id) {
            return Ok(conversation.clone());
        }
        let conversation = self
            .state
            .db
            .lock()
            .await
            .get_conversation(id)
            .map_err(|e| not_found(e, "conversation not found"))?;
        self.conversations.insert(id, conversation.clone());
        Ok(conversation)
    }

    /// View of `conversation` for this session's user.
    pub(crate) async fn view_for_self(
        &self,
        conversation: &Conversation,
    ) -> Result<ConversationView, HandlerError> {
        let peer = conversation.other(self.user());
        let status = self.state.presence.lookup_status(peer).await?;
        let db = self.state.db.lock().await;
        Ok(conversation_view(&db, conversation, self.user(), status)?)
    }
}

/// Project a conversation for `viewer`, with the counterpart's live status
/// and the latest message resolved.
pub(crate) fn conversation_view(
    db: &Database,
    conversation: &Conversation,
    viewer: &UserId,
    peer_status: PresenceStatus,
) -> Result<ConversationView, StoreError> {
    let latest_message = conversation
        .latest_message
        .map(|id| db.get_message(id))
        .transpose()?
        .map(|m| m.view());

    Ok(ConversationView {
        id: conversation.id,
        participants: conversation.participants.to_vec(),
        peer: conversation.other(viewer).clone(),
        peer_status,
        latest_message,
        blocked_by: conversation.blocked_by.clone(),
        created_at: conversation.created_at,
        updated_at: conversation.updated_at,
    })
}

/// Map a store miss to a not-found error with a caller-facing reason.
pub(crate) fn not_found(err: StoreError, what: &'static str) -> HandlerError {
    match err {
        StoreError::NotFound => HandlerError::NotFound(what),
        other => other.into(),
    }
}
