//! Client-invocable mutations.
//!
//! Every handler validates, performs its durable write, and returns the
//! acknowledgment for the caller. Counterpart notifications run on their
//! own task afterwards so a slow counterpart never delays the caller.

use tracing::{debug, error, info};

use parley_shared::protocol::{
    validate_client_uuid, validate_text, AckReply, ClientRequest, ConversationNotice,
    ConversationRef, EditMessage, MessageRef, PeerRef, PeerView, SendMessage, ServerEvent,
};
use parley_shared::{ConversationId, MessageId, MessageStatus, PresenceStatus, UserId};
use parley_store::{Conversation, Message, NewMessage};

use crate::delivery::Push;
use crate::error::HandlerError;
use crate::session::{conversation_view, not_found, Session};

impl Session {
    pub(crate) async fn handle_request(
        &mut self,
        request: ClientRequest,
    ) -> Result<AckReply, HandlerError> {
        match request {
            ClientRequest::SendMessage(req) => self.send_message(req).await,
            ClientRequest::EditMessage(req) => self.edit_message(req).await,
            ClientRequest::RemoveMessage(req) => self.remove_message(req).await,
            ClientRequest::ReadMessage(req) => self.read_message(req).await,
            ClientRequest::BlockConversation(req) => self.block_conversation(req).await,
            ClientRequest::UnblockConversation(req) => self.unblock_conversation(req).await,
            ClientRequest::RemoveConversation(req) => self.remove_conversation(req).await,
            ClientRequest::JoinConversation(req) => self.join_conversation(req).await,
        }
    }

    fn ensure_not_blocked(&self, conversation: &Conversation) -> Result<(), HandlerError> {
        if self
            .state
            .config
            .block_policy
            .is_blocked(conversation.blocked_by.len())
        {
            return Err(HandlerError::Blocked);
        }
        Ok(())
    }

    fn spawn_push(&self, push: Push) {
        let delivery = self.state.delivery.clone();
        tokio::spawn(async move {
            delivery.push(push).await;
        });
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    async fn send_message(&mut self, req: SendMessage) -> Result<AckReply, HandlerError> {
        let receiver = UserId::parse(&req.to)?;
        let text = validate_text(&req.text)?;
        let uuid = validate_client_uuid(&req.uuid)?;
        let sender = self.user().clone();

        if receiver == sender {
            return Err(HandlerError::Validation(
                "cannot send a message to yourself".into(),
            ));
        }

        let (message, conversation, announce) = {
            let db = self.state.db.lock().await;
            if !db.user_exists(&receiver)? {
                return Err(HandlerError::NotFound("receiver not found"));
            }
            if let Some(existing) = db.find_by_idempotency_key(&sender, &receiver, &uuid)? {
                debug!(user = %sender, message = %existing.id, "duplicate send");
                return Ok(AckReply::success().with_message(existing.view()));
            }

            let (conversation, created) = db.find_or_create_conversation(&sender, &receiver)?;
            self.ensure_not_blocked(&conversation)?;
            let announce = created || conversation.is_hidden_by(&receiver);

            let (message, inserted) = db.insert_message(&NewMessage {
                conversation_id: conversation.id,
                sender: sender.clone(),
                receiver: receiver.clone(),
                text,
                uuid,
            })?;
            if !inserted {
                return Ok(AckReply::success().with_message(message.view()));
            }
            (message, db.get_conversation(conversation.id)?, announce)
        };

        info!(user = %sender, message = %message.id, conversation = %conversation.id, "message stored");
        self.conversations.insert(conversation.id, conversation.clone());

        if !conversation.has_block() {
            self.handle.join(&receiver).await;
            self.spawn_new_message(message.clone(), conversation, announce);
        }

        Ok(AckReply::success().with_message(message.view()))
    }

    /// Announce the conversation to the receiver when it is new to them,
    /// then deliver the message.
    fn spawn_new_message(&self, message: Message, conversation: Conversation, announce: bool) {
        let state = self.state.clone();
        tokio::spawn(async move {
            if announce {
                if let Some(peer) = state.delivery.resolve(&message.receiver).await {
                    peer.wait_synced().await;
                    let view = {
                        let db = state.db.lock().await;
                        conversation_view(&db, &conversation, &message.receiver, PresenceStatus::Online)
                    };
                    match view {
                        Ok(view) => {
                            peer.join(&message.sender).await;
                            peer.emit(ServerEvent::NewConversation(view));
                        }
                        Err(e) => {
                            error!(conversation = %conversation.id, error = %e, "failed to build conversation view");
                        }
                    }
                }
            }
            state.delivery.deliver(message).await;
        });
    }

    async fn edit_message(&mut self, req: EditMessage) -> Result<AckReply, HandlerError> {
        let id = MessageId::parse(&req.id)?;
        let text = validate_text(&req.text)?;
        let me = self.user().clone();

        let (message, conversation) = {
            let db = self.state.db.lock().await;
            let message = db.get_message(id).map_err(|e| not_found(e, "message not found"))?;
            if message.sender != me {
                return Err(HandlerError::Forbidden("only the sender can edit this message"));
            }
            if message.is_deleted() {
                return Err(HandlerError::NotFound("message has been removed"));
            }
            let conversation = db.get_conversation(message.conversation_id)?;
            self.ensure_not_blocked(&conversation)?;
            let message = db
                .edit_message(id, &text)
                .map_err(|e| not_found(e, "message has been removed"))?;
            (message, conversation)
        };

        debug!(user = %me, message = %id, "message edited");
        if message.edited_after_received && !conversation.has_block() {
            self.spawn_push(Push::Edit(message.clone()));
        }
        Ok(AckReply::success().with_message(message.view()))
    }

    async fn remove_message(&mut self, req: MessageRef) -> Result<AckReply, HandlerError> {
        let id = MessageId::parse(&req.id)?;
        let me = self.user().clone();

        let (message, conversation) = {
            let db = self.state.db.lock().await;
            let message = db.get_message(id).map_err(|e| not_found(e, "message not found"))?;
            if message.sender != me {
                return Err(HandlerError::Forbidden("only the sender can remove this message"));
            }
            if message.is_deleted() {
                return Err(HandlerError::NotFound("message already removed"));
            }
            let conversation = db.get_conversation(message.conversation_id)?;
            self.ensure_not_blocked(&conversation)?;
            let message = db
                .remove_message(id)
                .map_err(|e| not_found(e, "message already removed"))?;
            (message, conversation)
        };

        debug!(user = %me, message = %id, "message removed");
        if message.deleted_after_received && !conversation.has_block() {
            self.spawn_push(Push::Remove(message.clone()));
        }
        Ok(AckReply::success().with_message(message.view()))
    }

    async fn read_message(&mut self, req: MessageRef) -> Result<AckReply, HandlerError> {
        let id = MessageId::parse(&req.id)?;
        let me = self.user().clone();

        let (message, conversation) = {
            let db = self.state.db.lock().await;
            let message = db.get_message(id).map_err(|e| not_found(e, "message not found"))?;
            if message.receiver != me {
                return Err(HandlerError::Forbidden("only the receiver can read this message"));
            }
            if message.is_deleted() {
                return Err(HandlerError::NotFound("message has been removed"));
            }
            if !message.is_received() {
                return Err(HandlerError::Validation("message has not been delivered yet".into()));
            }
            let conversation = db.get_conversation(message.conversation_id)?;
            self.ensure_not_blocked(&conversation)?;
            (db.mark_read(id)?, conversation)
        };

        if message.status < MessageStatus::Read && !conversation.has_block() {
            self.spawn_push(Push::Status {
                message: message.clone(),
                status: MessageStatus::Read,
            });
        }
        Ok(AckReply::success().with_message(message.view()))
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    async fn participant_conversation(
        &mut self,
        raw_id: &str,
    ) -> Result<Conversation, HandlerError> {
        let id = ConversationId::parse(raw_id)?;
        let conversation = self.cached_conversation(id).await?;
        if !conversation.is_participant(self.user()) {
            return Err(HandlerError::Forbidden("not a participant of this conversation"));
        }
        Ok(conversation)
    }

    async fn block_conversation(&mut self, req: ConversationRef) -> Result<AckReply, HandlerError> {
        let conversation = self.participant_conversation(&req.id).await?;
        let me = self.user().clone();
        if conversation.is_blocked_by(&me) {
            return Err(HandlerError::Validation("conversation already blocked".into()));
        }

        let (updated, _) = self
            .state
            .db
            .lock()
            .await
            .block_conversation(conversation.id, &me)?;
        self.conversations.insert(updated.id, updated.clone());
        info!(user = %me, conversation = %updated.id, "conversation blocked");

        let peer = updated.other(&me).clone();
        self.handle.leave(&peer).await;
        if let Some(peer_handle) = self.state.delivery.resolve(&peer).await {
            peer_handle.leave(&me).await;
            peer_handle.emit(ServerEvent::BlockConversation(ConversationNotice {
                conversation_id: updated.id,
                by: me.clone(),
            }));
        }

        let view = self.view_for_self(&updated).await?;
        Ok(AckReply::success().with_conversation(Some(view)))
    }

    async fn unblock_conversation(&mut self, req: ConversationRef) -> Result<AckReply, HandlerError> {
        let conversation = self.participant_conversation(&req.id).await?;
        let me = self.user().clone();
        if !conversation.is_blocked_by(&me) {
            return Err(HandlerError::Validation("conversation is not blocked by you".into()));
        }

        let (updated, _) = self
            .state
            .db
            .lock()
            .await
            .unblock_conversation(conversation.id, &me)?;
        self.conversations.insert(updated.id, updated.clone());
        info!(user = %me, conversation = %updated.id, "conversation unblocked");

        let peer = updated.other(&me).clone();
        let peer_handle = self.state.delivery.resolve(&peer).await;
        if !updated.has_block() {
            self.handle.join(&peer).await;
            if let Some(peer_handle) = &peer_handle {
                peer_handle.join(&me).await;
            }
        }
        if let Some(peer_handle) = peer_handle {
            peer_handle.emit(ServerEvent::UnblockConversation(ConversationNotice {
                conversation_id: updated.id,
                by: me.clone(),
            }));
        }

        let view = self.view_for_self(&updated).await?;
        Ok(AckReply::success().with_conversation(Some(view)))
    }

    async fn remove_conversation(&mut self, req: ConversationRef) -> Result<AckReply, HandlerError> {
        let conversation = self.participant_conversation(&req.id).await?;
        let me = self.user().clone();

        let already_removed = {
            let db = self.state.db.lock().await;
            let already = db.hide_conversation(conversation.id, &me)?;
            let updated = db.get_conversation(conversation.id)?;
            self.conversations.insert(updated.id, updated);
            already
        };
        debug!(user = %me, conversation = %conversation.id, already_removed, "conversation hidden");

        Ok(AckReply {
            already_removed: Some(already_removed),
            ..AckReply::success()
        })
    }

    /// Read-only peek at the conversation with a counterpart.
    async fn join_conversation(&mut self, req: PeerRef) -> Result<AckReply, HandlerError> {
        let peer = UserId::parse(&req.id)?;
        let status = self.state.presence.lookup_status(&peer).await?;

        let view = {
            let db = self.state.db.lock().await;
            db.find_conversation(self.user(), &peer)?
                .map(|c| conversation_view(&db, &c, self.user(), status))
                .transpose()?
        };

        Ok(AckReply::success()
            .with_conversation(view)
            .with_peer(PeerView {
                user_id: peer,
                status,
            }))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::BlockPolicy;
    use crate::session::Session;
    use crate::testing::{harness, harness_with, ClientMode, Harness, TestClient};
    use parley_shared::protocol::{AckReply, ServerEvent};
    use parley_shared::{MessageId, MessageStatus, PresenceStatus, UserId};
    use parley_store::Message;
    use serde_json::json;

    fn send(to: &str, text: &str, uuid: &str) -> serde_json::Value {
        json!({"event": "send-message", "data": {"to": to, "text": text, "uuid": uuid}})
    }

    fn by_id(event: &str, id: impl ToString) -> serde_json::Value {
        json!({"event": event, "data": {"id": id.to_string()}})
    }

    fn edit(id: MessageId, text: &str) -> serde_json::Value {
        json!({"event": "edit-message", "data": {"id": id.to_string(), "text": text}})
    }

    /// Both users online, each with one delivered message from the other.
    struct Pair {
        h: Harness,
        alice: (Session, TestClient),
        bob: (Session, TestClient),
        from_alice: Message,
        from_bob: Message,
    }

    async fn connected_pair(policy: BlockPolicy) -> Pair {
        let h = harness_with(|config| config.block_policy = policy);
        let from_alice = h.seed_message("alice", "bob", "a1").await;
        let from_bob = h.seed_message("bob", "alice", "b1").await;
        let alice = h.connect("alice", ClientMode::AutoAck).await;
        let bob = h.connect("bob", ClientMode::AutoAck).await;
        assert!(h.wait_until_received(from_alice.id).await);
        assert!(h.wait_until_received(from_bob.id).await);
        Pair {
            h,
            alice,
            bob,
            from_alice,
            from_bob,
        }
    }

    /// Send, edit, remove and read from one side, acknowledged as
    /// `first_ack..first_ack + 4`.
    async fn try_every_mutation(
        (session, client): &mut (Session, TestClient),
        peer: &str,
        own: &Message,
        incoming: &Message,
        first_ack: u64,
    ) -> Vec<AckReply> {
        let uuid = format!("retry-{first_ack}");
        session.dispatch(Some(first_ack), send(peer, "anyone there?", &uuid)).await;
        session.dispatch(Some(first_ack + 1), edit(own.id, "changed")).await;
        session.dispatch(Some(first_ack + 2), by_id("remove-message", own.id)).await;
        session.dispatch(Some(first_ack + 3), by_id("read-message", incoming.id)).await;

        let mut replies = Vec::new();
        for id in first_ack..first_ack + 4 {
            replies.push(client.reply(id).await.expect("acknowledged"));
        }
        replies
    }

    async fn assert_both_sides_blocked(pair: &mut Pair, first_ack: u64) {
        let alice_replies = try_every_mutation(
            &mut pair.alice,
            "bob",
            &pair.from_alice,
            &pair.from_bob,
            first_ack,
        )
        .await;
        let bob_replies = try_every_mutation(
            &mut pair.bob,
            "alice",
            &pair.from_bob,
            &pair.from_alice,
            first_ack,
        )
        .await;

        for (i, reply) in alice_replies.iter().chain(&bob_replies).enumerate() {
            assert_eq!(
                reply.error.as_deref(),
                Some("conversation is blocked"),
                "mutation #{i}"
            );
        }

        for message in [&pair.from_alice, &pair.from_bob] {
            let stored = pair.h.message(message.id).await;
            assert_eq!(stored.text, "hello");
            assert!(stored.deleted_at.is_none());
            assert!(stored.read_at.is_none());
        }
        let db = pair.h.state.db.lock().await;
        let alice = UserId::parse("alice").unwrap();
        let bob = UserId::parse("bob").unwrap();
        let uuid = format!("retry-{first_ack}");
        assert!(db.find_by_idempotency_key(&alice, &bob, &uuid).unwrap().is_none());
        assert!(db.find_by_idempotency_key(&bob, &alice, &uuid).unwrap().is_none());
    }

    async fn block_from_both_sides(pair: &mut Pair) {
        let conversation = pair.from_alice.conversation_id;
        pair.alice.0.dispatch(Some(100), by_id("block-conversation", conversation)).await;
        pair.bob.0.dispatch(Some(100), by_id("block-conversation", conversation)).await;
        assert!(pair.alice.1.reply(100).await.unwrap().is_success());
        assert!(pair.bob.1.reply(100).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_mutual_block_rejects_every_mutation_until_fully_unblocked() {
        let mut pair = connected_pair(BlockPolicy::AnyParticipant).await;
        block_from_both_sides(&mut pair).await;
        assert_both_sides_blocked(&mut pair, 1).await;

        let conversation = pair.from_alice.conversation_id;
        pair.alice.0.dispatch(Some(101), by_id("unblock-conversation", conversation)).await;
        assert!(pair.alice.1.reply(101).await.unwrap().is_success());
        assert_both_sides_blocked(&mut pair, 11).await;
    }

    #[tokio::test]
    async fn test_mutual_block_rejects_every_mutation_under_both_policy() {
        let mut pair = connected_pair(BlockPolicy::BothParticipants).await;
        block_from_both_sides(&mut pair).await;
        assert_both_sides_blocked(&mut pair, 1).await;

        // With one block lifted the conversation is below the two-block
        // threshold again, for both sides alike.
        let conversation = pair.from_alice.conversation_id;
        pair.alice.0.dispatch(Some(101), by_id("unblock-conversation", conversation)).await;
        pair.alice.0.dispatch(Some(102), edit(pair.from_alice.id, "alice edit")).await;
        pair.bob.0.dispatch(Some(102), edit(pair.from_bob.id, "bob edit")).await;
        assert!(pair.alice.1.reply(102).await.unwrap().is_success());
        assert!(pair.bob.1.reply(102).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_send_delivers_and_reports_delivered() {
        let h = harness();
        let (mut alice_session, alice) = h.connect("alice", ClientMode::AutoAck).await;
        let (_bob_session, bob) = h.connect("bob", ClientMode::AutoAck).await;

        alice_session.dispatch(Some(1), send("bob", "hello", "u1")).await;
        let reply = alice.reply(1).await.expect("acknowledged");
        assert!(reply.is_success());
        let message = reply.message.expect("message in ack");

        assert!(bob.wait_for("new-conversation").await);
        assert!(bob.wait_for("receive-message").await);
        assert!(alice.wait_for("status-message").await);

        assert!(h.wait_until_status(message.id, MessageStatus::Delivered).await);
        assert!(h.message(message.id).await.received_at.is_some());
    }

    #[tokio::test]
    async fn test_send_is_idempotent() {
        let h = harness();
        h.seed_user("bob").await;
        let (mut session, alice) = h.connect("alice", ClientMode::AutoAck).await;

        session.dispatch(Some(1), send("bob", "hello", "u1")).await;
        session.dispatch(Some(2), send("bob", "hello again", "u1")).await;

        let first = alice.reply(1).await.unwrap().message.unwrap();
        let second = alice.reply(2).await.unwrap().message.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_send_validation_failures() {
        let h = harness();
        let (mut session, alice) = h.connect("alice", ClientMode::AutoAck).await;

        session.dispatch(Some(1), send("alice", "hi", "u1")).await;
        session.dispatch(Some(2), send("nobody", "hi", "u2")).await;
        session.dispatch(Some(3), send("bob", "   ", "u3")).await;

        for id in 1..=3 {
            assert!(!alice.reply(id).await.unwrap().is_success(), "request {id}");
        }
        assert_eq!(
            alice.reply(2).await.unwrap().error.as_deref(),
            Some("receiver not found")
        );
    }

    #[tokio::test]
    async fn test_edit_in_blocked_conversation_fails() {
        let h = harness();
        let message = h.seed_message("bob", "alice", "u1").await;
        let (mut alice_session, alice) = h.connect("alice", ClientMode::AutoAck).await;
        let (mut bob_session, bob) = h.connect("bob", ClientMode::AutoAck).await;

        alice_session
            .dispatch(Some(1), by_id("block-conversation", message.conversation_id))
            .await;
        assert!(alice.reply(1).await.unwrap().is_success());

        bob_session
            .dispatch(
                Some(2),
                json!({"event": "edit-message", "data": {"id": message.id.to_string(), "text": "changed"}}),
            )
            .await;
        let reply = bob.reply(2).await.unwrap();
        assert!(!reply.is_success());
        assert_eq!(reply.error.as_deref(), Some("conversation is blocked"));
        assert_eq!(h.message(message.id).await.text, "hello");
    }

    #[tokio::test]
    async fn test_unilateral_block_allows_edit_under_both_policy() {
        let h = harness_with(|config| config.block_policy = BlockPolicy::BothParticipants);
        let message = h.seed_message("bob", "alice", "u1").await;
        let (mut alice_session, _alice) = h.connect("alice", ClientMode::AutoAck).await;
        let (mut bob_session, bob) = h.connect("bob", ClientMode::AutoAck).await;

        alice_session
            .dispatch(Some(1), by_id("block-conversation", message.conversation_id))
            .await;
        bob_session
            .dispatch(
                Some(2),
                json!({"event": "edit-message", "data": {"id": message.id.to_string(), "text": "changed"}}),
            )
            .await;

        assert!(bob.reply(2).await.unwrap().is_success());
        assert_eq!(h.message(message.id).await.text, "changed");
    }

    #[tokio::test]
    async fn test_mutual_block_requires_both_unblocks() {
        let h = harness();
        let message = h.seed_message("alice", "bob", "u1").await;
        let (mut alice_session, alice) = h.connect("alice", ClientMode::AutoAck).await;
        let (mut bob_session, bob) = h.connect("bob", ClientMode::AutoAck).await;
        let alice_id = UserId::parse("alice").unwrap();
        let bob_id = UserId::parse("bob").unwrap();
        let conversation = message.conversation_id;

        alice_session.dispatch(Some(1), by_id("block-conversation", conversation)).await;
        bob_session.dispatch(Some(1), by_id("block-conversation", conversation)).await;
        assert!(bob.wait_for("block-conversation").await);
        assert!(!alice_session.handle().is_subscribed(&bob_id).await);

        alice_session.dispatch(Some(2), by_id("unblock-conversation", conversation)).await;
        assert!(alice.reply(2).await.unwrap().is_success());
        assert!(!alice_session.handle().is_subscribed(&bob_id).await);
        assert!(!bob_session.handle().is_subscribed(&alice_id).await);

        bob_session.dispatch(Some(2), by_id("unblock-conversation", conversation)).await;
        let reply = bob.reply(2).await.unwrap();
        assert!(reply.conversation.unwrap().blocked_by.is_empty());
        assert!(alice_session.handle().is_subscribed(&bob_id).await);
        assert!(bob_session.handle().is_subscribed(&alice_id).await);
    }

    #[tokio::test]
    async fn test_block_twice_and_unblock_unblocked_fail() {
        let h = harness();
        let message = h.seed_message("alice", "bob", "u1").await;
        let (mut session, alice) = h.connect("alice", ClientMode::AutoAck).await;

        session.dispatch(Some(1), by_id("unblock-conversation", message.conversation_id)).await;
        session.dispatch(Some(2), by_id("block-conversation", message.conversation_id)).await;
        session.dispatch(Some(3), by_id("block-conversation", message.conversation_id)).await;

        assert!(!alice.reply(1).await.unwrap().is_success());
        assert!(alice.reply(2).await.unwrap().is_success());
        assert!(!alice.reply(3).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_read_flow_notifies_sender() {
        let h = harness();
        let message = h.seed_message("alice", "bob", "u1").await;
        let (_alice_session, alice) = h.connect("alice", ClientMode::AutoAck).await;
        let (mut bob_session, bob) = h.connect("bob", ClientMode::AutoAck).await;
        assert!(h.wait_until_received(message.id).await);

        bob_session.dispatch(Some(1), by_id("read-message", message.id)).await;
        assert!(bob.reply(1).await.unwrap().is_success());

        assert!(alice.wait_for_status(message.id, MessageStatus::Read).await);
        let stored = h.message(message.id).await;
        assert!(stored.read_at.is_some());
        assert!(h.wait_until_status(message.id, MessageStatus::Read).await);
    }

    #[tokio::test]
    async fn test_only_receiver_can_read_and_only_sender_can_edit() {
        let h = harness();
        let message = h.seed_message("alice", "bob", "u1").await;
        let (mut session, alice) = h.connect("alice", ClientMode::AutoAck).await;

        session.dispatch(Some(1), by_id("read-message", message.id)).await;
        assert!(!alice.reply(1).await.unwrap().is_success());

        let (mut bob_session, bob) = h.connect("bob", ClientMode::AutoAck).await;
        bob_session
            .dispatch(
                Some(2),
                json!({"event": "edit-message", "data": {"id": message.id.to_string(), "text": "x"}}),
            )
            .await;
        assert!(!bob.reply(2).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_edit_after_receipt_propagates() {
        let h = harness();
        let message = h.seed_message("alice", "bob", "u1").await;
        let (mut alice_session, alice) = h.connect("alice", ClientMode::AutoAck).await;
        let (_bob_session, bob) = h.connect("bob", ClientMode::AutoAck).await;
        assert!(h.wait_until_received(message.id).await);

        alice_session
            .dispatch(
                Some(1),
                json!({"event": "edit-message", "data": {"id": message.id.to_string(), "text": "fixed"}}),
            )
            .await;
        assert!(alice.reply(1).await.unwrap().is_success());
        assert!(bob.wait_for("edit-message").await);

        assert!(h.wait_until(|m| !m.edited_after_received, message.id).await);
        assert_eq!(h.message(message.id).await.text, "fixed");
    }

    #[tokio::test]
    async fn test_remove_after_receipt_propagates_once() {
        let h = harness();
        let message = h.seed_message("alice", "bob", "u1").await;
        let (mut alice_session, alice) = h.connect("alice", ClientMode::AutoAck).await;
        let (_bob_session, bob) = h.connect("bob", ClientMode::AutoAck).await;
        assert!(h.wait_until_received(message.id).await);

        alice_session.dispatch(Some(1), by_id("remove-message", message.id)).await;
        assert!(alice.reply(1).await.unwrap().is_success());
        assert!(bob.wait_for("remove-message").await);
        assert!(h.wait_until(|m| !m.deleted_after_received, message.id).await);

        alice_session.dispatch(Some(2), by_id("remove-message", message.id)).await;
        assert_eq!(
            alice.reply(2).await.unwrap().error.as_deref(),
            Some("message already removed")
        );
    }

    #[tokio::test]
    async fn test_remove_conversation_is_idempotent() {
        let h = harness();
        let message = h.seed_message("alice", "bob", "u1").await;
        let (mut session, alice) = h.connect("alice", ClientMode::AutoAck).await;

        session.dispatch(Some(1), by_id("remove-conversation", message.conversation_id)).await;
        session.dispatch(Some(2), by_id("remove-conversation", message.conversation_id)).await;

        assert_eq!(alice.reply(1).await.unwrap().already_removed, Some(false));
        assert_eq!(alice.reply(2).await.unwrap().already_removed, Some(true));
    }

    #[tokio::test]
    async fn test_send_reannounces_hidden_conversation() {
        let h = harness();
        let message = h.seed_message("alice", "bob", "u1").await;
        let (mut bob_session, bob) = h.connect("bob", ClientMode::AutoAck).await;
        bob_session.dispatch(Some(1), by_id("remove-conversation", message.conversation_id)).await;

        let (mut alice_session, _alice) = h.connect("alice", ClientMode::AutoAck).await;
        alice_session.dispatch(Some(1), send("bob", "still there?", "u2")).await;

        assert!(bob.wait_for("new-conversation").await);
    }

    #[tokio::test]
    async fn test_join_conversation_peeks_with_status() {
        let h = harness();
        h.seed_message("alice", "bob", "u1").await;
        let (_bob_session, _bob) = h.connect("bob", ClientMode::AutoAck).await;
        let (mut session, alice) = h.connect("alice", ClientMode::AutoAck).await;

        session
            .dispatch(Some(1), json!({"event": "join-conversation", "data": {"id": "bob"}}))
            .await;
        session
            .dispatch(Some(2), json!({"event": "join-conversation", "data": {"id": "carol"}}))
            .await;

        let with_bob = alice.reply(1).await.unwrap();
        assert_eq!(with_bob.peer.unwrap().status, PresenceStatus::Online);
        assert!(with_bob.conversation.is_some());

        let with_carol = alice.reply(2).await.unwrap();
        assert!(with_carol.is_success());
        assert!(with_carol.conversation.is_none());
        assert_eq!(with_carol.peer.unwrap().status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn test_blocked_counterpart_gets_notice_not_messages() {
        let h = harness();
        let message = h.seed_message("alice", "bob", "u1").await;
        let (mut alice_session, _alice) = h.connect("alice", ClientMode::AutoAck).await;
        let (_bob_session, bob) = h.connect("bob", ClientMode::AutoAck).await;

        alice_session
            .dispatch(Some(1), by_id("block-conversation", message.conversation_id))
            .await;
        assert!(bob.wait_for("block-conversation").await);
        let notices: Vec<_> = bob
            .events()
            .await
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::BlockConversation(n) if n.by.as_str() == "alice"))
            .collect();
        assert_eq!(notices.len(), 1);
    }
}
