//! Optimistic message delivery engine
//!
//! Sends are echoed into the room sequence immediately with a correlation
//! id (tempId) and a `sending` status, then reconciled against whichever
//! server signal arrives: the lightweight ack, the authoritative push, or
//! the ack timeout. Reconciliation is first-event-wins and idempotent, so
//! acks and pushes may arrive in either order, duplicated, or not at all,
//! and the room sequence stays consistent.

use crate::conversations::ConversationIndex;
use crate::types::{
    AckReceipt, ChatEvent, ChatMessage, Conversation, CoreConfig, HistoryPage, LocalIdentity,
    MessagePush, MessageStatus, OutboundChat, RoomId, TempId, MESSAGE_TYPE_TEXT,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Messaging errors
#[derive(Error, Debug)]
pub enum ChatError {
    /// The chat channel failed to carry the frame
    #[error("Chat transport error: {0}")]
    Transport(String),

    /// The history backend failed a backfill query
    #[error("History fetch failed: {0}")]
    History(String),

    /// Retry target does not exist or is not in error state
    #[error("No failed message with this id")]
    NothingToRetry,
}

/// Outbound chat channel.
///
/// Delivery targets are addressed by the room id inside the frame; the
/// transport owns routing.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Send one chat frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame could not be handed to the channel
    async fn send_chat(&self, chat: OutboundChat) -> Result<(), ChatError>;
}

/// Read side of message history, cursor-paginated, newest page first
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Fetch one page of history older than `cursor` (or the newest page
    /// when `cursor` is `None`)
    ///
    /// # Errors
    ///
    /// Returns error if the backend query fails
    async fn fetch(
        &self,
        room_id: RoomId,
        cursor: Option<String>,
        page_size: u32,
    ) -> Result<HistoryPage, ChatError>;
}

/// A send awaiting its ack
struct PendingSend {
    room_id: RoomId,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct RoomPagination {
    cursor: Option<String>,
    exhausted: bool,
    loading: bool,
}

struct ChatInner {
    rooms: HashMap<RoomId, Vec<ChatMessage>>,
    pending: HashMap<TempId, PendingSend>,
    pagination: HashMap<RoomId, RoomPagination>,
    conversations: ConversationIndex,
}

/// Per-room message sequences with optimistic sends, reconciliation and
/// cursor-paginated backfill.
pub struct MessageDeliveryEngine {
    identity: LocalIdentity,
    config: CoreConfig,
    transport: Arc<dyn MessageTransport>,
    history: Arc<dyn HistoryStore>,
    inner: Arc<Mutex<ChatInner>>,
    events: broadcast::Sender<ChatEvent>,
}

impl MessageDeliveryEngine {
    /// Create an engine for the given identity and collaborators
    #[must_use]
    pub fn new(
        identity: LocalIdentity,
        transport: Arc<dyn MessageTransport>,
        history: Arc<dyn HistoryStore>,
        config: CoreConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            identity,
            config,
            transport,
            history,
            inner: Arc::new(Mutex::new(ChatInner {
                rooms: HashMap::new(),
                pending: HashMap::new(),
                pagination: HashMap::new(),
                conversations: ConversationIndex::new(),
            })),
            events,
        }
    }

    /// Subscribe to chat events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Send a text message.
    ///
    /// The message appears in the room sequence immediately in `sending`
    /// status. A transport failure flips it to `error` straight away;
    /// otherwise the ack timer decides if no server signal arrives.
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the frame (the echo stays in
    /// the sequence, in `error` status, ready for retry)
    #[tracing::instrument(skip(self, content), fields(room = %room_id))]
    pub async fn send_message(
        &self,
        room_id: RoomId,
        content: &str,
    ) -> Result<TempId, ChatError> {
        let temp_id = TempId::generate();
        let now = Utc::now();
        let message = ChatMessage {
            id: temp_id.0.clone(),
            temp_id: Some(temp_id.clone()),
            room_id,
            sender: self.identity.to_user_brief(),
            content: content.to_string(),
            sent_at: now,
            status: MessageStatus::Sending,
            message_type: MESSAGE_TYPE_TEXT,
        };

        {
            let mut inner = self.inner.lock().await;
            inner.rooms.entry(room_id).or_default().push(message);
            inner.conversations.touch_outbound(room_id, content, now);
            let timer = self.spawn_ack_timer(temp_id.clone());
            inner
                .pending
                .insert(temp_id.clone(), PendingSend { room_id, timer });
            let _ = self.events.send(ChatEvent::MessageAppended {
                room_id,
                id: temp_id.0.clone(),
            });
            let _ = self.events.send(ChatEvent::ConversationsChanged);
        }

        if let Err(e) = self
            .transport
            .send_chat(OutboundChat {
                room_id,
                content: content.to_string(),
                temp_id: temp_id.clone(),
                message_type: MESSAGE_TYPE_TEXT,
            })
            .await
        {
            tracing::warn!(error = %e, "Chat send failed");
            let mut inner = self.inner.lock().await;
            if let Some(pending) = inner.pending.remove(&temp_id) {
                pending.timer.abort();
                Self::fail_send(&mut inner, &self.events, pending.room_id, &temp_id);
            }
            return Err(e);
        }
        Ok(temp_id)
    }

    /// Apply a server ack: `sending → sent`, ack timer cancelled.
    ///
    /// An ack whose send was already finalized (push arrived first, or the
    /// timer fired) is a no-op.
    #[tracing::instrument(skip(self, ack), fields(temp_id = %ack.temp_id))]
    pub async fn handle_ack(&self, ack: AckReceipt) {
        let mut inner = self.inner.lock().await;
        let Some(pending) = inner.pending.remove(&ack.temp_id) else {
            tracing::debug!("Ack for unknown or finalized send, ignoring");
            return;
        };
        pending.timer.abort();
        let Some(message) = Self::message_by_temp_id(&mut inner, pending.room_id, &ack.temp_id)
        else {
            return;
        };
        if message.status != MessageStatus::Sending {
            return;
        }
        // Queueing confirmation only; the message stays keyed by tempId
        // until the authoritative push re-identifies it.
        message.status = MessageStatus::Sent;
    }

    /// Apply an authoritative server push.
    ///
    /// Reconciles one of our own in-flight sends in place when the tempId
    /// matches and the record is still in `sending` or `sent` state;
    /// otherwise deduplicates by permanent id and appends. A send already
    /// marked failed is never resurrected: its delivered copy is appended
    /// as a new record. Safe to call with duplicates.
    #[tracing::instrument(skip(self, push), fields(room = %push.room_id, id = %push.message.id))]
    pub async fn receive_message(&self, push: MessagePush) {
        let mut inner = self.inner.lock().await;
        let room_id = push.room_id;

        if let Some(temp_id) = &push.temp_id {
            if let Some(pending) = inner.pending.remove(temp_id) {
                pending.timer.abort();
            }
            if let Some(message) = Self::message_by_temp_id(&mut inner, room_id, temp_id) {
                if message.status == MessageStatus::Error {
                    // The send was already written off; the failed record
                    // stays failed and the delivered copy lands below under
                    // its permanent id.
                    tracing::debug!("Push for a failed send, not resurrecting the record");
                } else {
                    message.id = push.message.id.clone();
                    message.temp_id = None;
                    message.status = MessageStatus::Sent;
                    message.sent_at = push.message.send_time;
                    message.content = push.message.content.clone();
                    let _ = self.events.send(ChatEvent::MessageFinalized {
                        room_id,
                        id: push.message.id.clone(),
                    });
                    inner.conversations.touch_outbound(
                        room_id,
                        &push.message.content,
                        push.message.send_time,
                    );
                    let _ = self.events.send(ChatEvent::ConversationsChanged);
                    return;
                }
            }
        }

        let already_known = inner
            .rooms
            .get(&room_id)
            .is_some_and(|msgs| msgs.iter().any(|m| m.id == push.message.id));
        if already_known {
            tracing::debug!("Duplicate push, ignoring");
            return;
        }

        let own = push.from_user.id == self.identity.id;
        let message = ChatMessage {
            id: push.message.id.clone(),
            temp_id: None,
            room_id,
            sender: push.from_user.clone(),
            content: push.message.content.clone(),
            sent_at: push.message.send_time,
            status: MessageStatus::Sent,
            message_type: push.message.message_type,
        };
        inner.rooms.entry(room_id).or_default().push(message);
        if own {
            inner.conversations.touch_outbound(
                room_id,
                &push.message.content,
                push.message.send_time,
            );
        } else {
            inner.conversations.record_inbound(
                room_id,
                &push.message.content,
                push.message.send_time,
            );
        }
        let _ = self.events.send(ChatEvent::MessageAppended {
            room_id,
            id: push.message.id,
        });
        let _ = self.events.send(ChatEvent::ConversationsChanged);
    }

    /// Backfill one page of older history for the room.
    ///
    /// Returns the number of records prepended. A room whose history is
    /// exhausted (or already loading) returns zero without a query. A
    /// failed query marks the room exhausted so the UI does not spin on a
    /// broken backend.
    ///
    /// # Errors
    ///
    /// Returns error if the history backend fails
    #[tracing::instrument(skip(self), fields(room = %room_id))]
    pub async fn load_more(&self, room_id: RoomId) -> Result<usize, ChatError> {
        let cursor = {
            let mut inner = self.inner.lock().await;
            let pagination = inner.pagination.entry(room_id).or_default();
            if pagination.exhausted || pagination.loading {
                return Ok(0);
            }
            pagination.loading = true;
            pagination.cursor.clone()
        };

        let result = self
            .history
            .fetch(room_id, cursor, self.config.history_page_size)
            .await;

        let mut inner = self.inner.lock().await;
        let pagination = inner.pagination.entry(room_id).or_default();
        pagination.loading = false;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(error = %e, "History fetch failed, stopping backfill");
                pagination.exhausted = true;
                return Err(e);
            }
        };
        pagination.cursor = page.next_cursor.clone();
        pagination.exhausted = !page.has_more;

        let room = inner.rooms.entry(room_id).or_default();
        let fresh: Vec<ChatMessage> = page
            .records
            .iter()
            .filter(|r| !room.iter().any(|m| m.id == r.message.id))
            .map(|r| ChatMessage {
                id: r.message.id.clone(),
                temp_id: None,
                room_id,
                sender: r.from_user.clone(),
                content: r.message.content.clone(),
                sent_at: r.message.send_time,
                status: MessageStatus::Sent,
                message_type: r.message.message_type,
            })
            .collect();
        let count = fresh.len();
        // Pages are older than everything loaded so far
        room.splice(0..0, fresh);
        if count > 0 {
            let _ = self
                .events
                .send(ChatEvent::HistoryPrepended { room_id, count });
        }
        Ok(count)
    }

    /// Re-send a failed message as a fresh send.
    ///
    /// The retry gets its own tempId and its own echo at the end of the
    /// sequence; the old error record is left untouched, so a very late ack
    /// for the original attempt cannot resurrect it.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NothingToRetry`] if no failed message matches,
    /// or a transport error if the re-send fails too
    #[tracing::instrument(skip(self), fields(room = %room_id, temp_id = %temp_id))]
    pub async fn retry_message(
        &self,
        room_id: RoomId,
        temp_id: &TempId,
    ) -> Result<TempId, ChatError> {
        let content = {
            let mut inner = self.inner.lock().await;
            let Some(message) = Self::message_by_temp_id(&mut inner, room_id, temp_id) else {
                return Err(ChatError::NothingToRetry);
            };
            if message.status != MessageStatus::Error {
                return Err(ChatError::NothingToRetry);
            }
            message.content.clone()
        };
        self.send_message(room_id, &content).await
    }

    /// Make a room active (or none). Entering a room clears its unread count
    /// and, when nothing is cached for it yet, backfills the first page.
    pub async fn set_active_room(&self, room_id: Option<RoomId>) {
        let needs_backfill = {
            let mut inner = self.inner.lock().await;
            inner.conversations.set_active(room_id);
            let _ = self.events.send(ChatEvent::ConversationsChanged);
            room_id.is_some_and(|id| inner.rooms.get(&id).map_or(true, |m| m.is_empty()))
        };
        if needs_backfill {
            if let Some(room_id) = room_id {
                if let Err(e) = self.load_more(room_id).await {
                    tracing::warn!(room = %room_id, error = %e, "Initial backfill failed");
                }
            }
        }
    }

    /// Drop a room's messages, pagination state and conversation entry
    pub async fn reset_room(&self, room_id: RoomId) {
        let mut inner = self.inner.lock().await;
        inner.rooms.remove(&room_id);
        inner.pagination.remove(&room_id);
        inner.conversations.remove(room_id);
        let _ = self.events.send(ChatEvent::ConversationsChanged);
    }

    /// Snapshot of a room's message sequence, oldest first
    pub async fn messages(&self, room_id: RoomId) -> Vec<ChatMessage> {
        let inner = self.inner.lock().await;
        inner.rooms.get(&room_id).cloned().unwrap_or_default()
    }

    /// Conversation list, newest activity first
    pub async fn conversations(&self) -> Vec<Conversation> {
        let inner = self.inner.lock().await;
        inner.conversations.ordered()
    }

    /// Sum of unread counters across all rooms
    pub async fn total_unread(&self) -> u32 {
        let inner = self.inner.lock().await;
        inner.conversations.total_unread()
    }

    /// Whether older history may still exist for the room
    pub async fn has_more_history(&self, room_id: RoomId) -> bool {
        let inner = self.inner.lock().await;
        inner
            .pagination
            .get(&room_id)
            .map_or(true, |p| !p.exhausted)
    }

    fn message_by_temp_id<'a>(
        inner: &'a mut ChatInner,
        room_id: RoomId,
        temp_id: &TempId,
    ) -> Option<&'a mut ChatMessage> {
        inner
            .rooms
            .get_mut(&room_id)?
            .iter_mut()
            .find(|m| m.temp_id.as_ref() == Some(temp_id))
    }

    fn fail_send(
        inner: &mut ChatInner,
        events: &broadcast::Sender<ChatEvent>,
        room_id: RoomId,
        temp_id: &TempId,
    ) {
        if let Some(message) = Self::message_by_temp_id(inner, room_id, temp_id) {
            if message.status == MessageStatus::Sending {
                message.status = MessageStatus::Error;
                let _ = events.send(ChatEvent::MessageFailed {
                    room_id,
                    temp_id: temp_id.clone(),
                });
            }
        }
    }

    /// Flip the send to error if no ack or push claimed it in time
    fn spawn_ack_timer(&self, temp_id: TempId) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let timeout = self.config.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut inner = inner.lock().await;
            if let Some(pending) = inner.pending.remove(&temp_id) {
                tracing::warn!(temp_id = %temp_id, "Ack timeout, marking message failed");
                Self::fail_send(&mut inner, &events, pending.room_id, &temp_id);
            }
        })
    }
}
