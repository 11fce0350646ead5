//! Top-level service facade
//!
//! Wires the call controller and the message delivery engine behind one
//! handle and routes raw inbound frames to the right engine. This is the
//! surface an embedding app talks to.

use crate::call::{CallError, CallSessionController};
use crate::media::MediaConnector;
use crate::messaging::{ChatError, HistoryStore, MessageDeliveryEngine, MessageTransport};
use crate::signaling::{decode_envelope, SignalingTransport};
use crate::types::{
    AckReceipt, CallEvent, CallMode, CallSnapshot, CallState, CallType, ChatEvent, ChatMessage,
    Conversation, CoreConfig, LocalIdentity, MessagePush, RoomId, TempId, UserBrief,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Service construction errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A required collaborator was not provided to the builder
    #[error("Builder is missing: {0}")]
    MissingComponent(&'static str),
}

/// Builder for [`MeshtalkService`].
///
/// Identity and all four collaborators are required; the config defaults to
/// production timings.
#[derive(Default)]
pub struct MeshtalkServiceBuilder {
    identity: Option<LocalIdentity>,
    signaling: Option<Arc<dyn SignalingTransport>>,
    media: Option<Arc<dyn MediaConnector>>,
    chat: Option<Arc<dyn MessageTransport>>,
    history: Option<Arc<dyn HistoryStore>>,
    config: Option<CoreConfig>,
}

impl MeshtalkServiceBuilder {
    /// Start an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local identity
    #[must_use]
    pub fn identity(mut self, identity: LocalIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the signaling transport
    #[must_use]
    pub fn signaling(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.signaling = Some(transport);
        self
    }

    /// Set the media connector
    #[must_use]
    pub fn media(mut self, connector: Arc<dyn MediaConnector>) -> Self {
        self.media = Some(connector);
        self
    }

    /// Set the chat transport
    #[must_use]
    pub fn chat(mut self, transport: Arc<dyn MessageTransport>) -> Self {
        self.chat = Some(transport);
        self
    }

    /// Set the history store
    #[must_use]
    pub fn history(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    /// Override timers and page sizes
    #[must_use]
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::MissingComponent`] if a required collaborator
    /// was not set
    pub fn build(self) -> Result<MeshtalkService, ServiceError> {
        let identity = self
            .identity
            .ok_or(ServiceError::MissingComponent("identity"))?;
        let signaling = self
            .signaling
            .ok_or(ServiceError::MissingComponent("signaling transport"))?;
        let media = self
            .media
            .ok_or(ServiceError::MissingComponent("media connector"))?;
        let chat = self
            .chat
            .ok_or(ServiceError::MissingComponent("chat transport"))?;
        let history = self
            .history
            .ok_or(ServiceError::MissingComponent("history store"))?;
        let config = self.config.unwrap_or_default();

        let calls = CallSessionController::new(
            identity.clone(),
            signaling,
            media,
            config.clone(),
        );
        let messages = MessageDeliveryEngine::new(identity.clone(), chat, history, config);
        Ok(MeshtalkService {
            identity,
            calls: Arc::new(calls),
            messages: Arc::new(messages),
        })
    }
}

/// Combined calling and messaging engine behind a single handle.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct MeshtalkService {
    identity: LocalIdentity,
    calls: Arc<CallSessionController>,
    messages: Arc<MessageDeliveryEngine>,
}

impl MeshtalkService {
    /// Start a builder
    #[must_use]
    pub fn builder() -> MeshtalkServiceBuilder {
        MeshtalkServiceBuilder::new()
    }

    /// The identity this service was built with
    #[must_use]
    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Feed one raw signaling frame from the wire.
    ///
    /// Malformed frames are logged and dropped; they never tear down the
    /// session.
    ///
    /// # Errors
    ///
    /// Returns error only for link-level failures while applying a valid
    /// envelope
    pub async fn handle_signal(&self, raw: &str) -> Result<(), CallError> {
        let envelope = match decode_envelope(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed signaling frame");
                return Ok(());
            }
        };
        self.calls.handle_envelope(envelope).await
    }

    /// Feed a server chat ack
    pub async fn handle_chat_ack(&self, ack: AckReceipt) {
        self.messages.handle_ack(ack).await;
    }

    /// Feed an authoritative chat push
    pub async fn handle_chat_push(&self, push: MessagePush) {
        self.messages.receive_message(push).await;
    }

    // --- calls ---

    /// Start an outgoing call
    ///
    /// # Errors
    ///
    /// See [`CallSessionController::start_call`]
    pub async fn start_call(
        &self,
        target: UserBrief,
        call_type: CallType,
        mode: CallMode,
    ) -> Result<(), CallError> {
        self.calls.start_call(target, call_type, mode).await
    }

    /// Accept the ringing incoming call
    ///
    /// # Errors
    ///
    /// See [`CallSessionController::accept_call`]
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.calls.accept_call().await
    }

    /// Decline the ringing incoming call
    ///
    /// # Errors
    ///
    /// See [`CallSessionController::reject_call`]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.calls.reject_call().await
    }

    /// Leave the active call
    ///
    /// # Errors
    ///
    /// See [`CallSessionController::hangup`]
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.calls.hangup().await
    }

    /// Pull users into the current group call
    ///
    /// # Errors
    ///
    /// See [`CallSessionController::invite_users`]
    pub async fn invite_users(&self, users: Vec<UserBrief>) -> Result<(), CallError> {
        self.calls.invite_users(users).await
    }

    /// Toggle the local microphone
    pub async fn toggle_mute(&self) {
        self.calls.toggle_mute().await;
    }

    /// Toggle the local camera
    pub async fn toggle_camera(&self) {
        self.calls.toggle_camera().await;
    }

    /// Switch the capture camera on every open link
    ///
    /// # Errors
    ///
    /// See [`CallSessionController::switch_camera`]
    pub async fn switch_camera(&self) -> Result<(), CallError> {
        self.calls.switch_camera().await
    }

    /// Current call lifecycle state
    pub async fn call_state(&self) -> CallState {
        self.calls.state().await
    }

    /// Observable view of the call session
    pub async fn call_snapshot(&self) -> CallSnapshot {
        self.calls.snapshot().await
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_call_events(&self) -> broadcast::Receiver<CallEvent> {
        self.calls.subscribe()
    }

    // --- messaging ---

    /// Send a text message
    ///
    /// # Errors
    ///
    /// See [`MessageDeliveryEngine::send_message`]
    pub async fn send_message(&self, room_id: RoomId, content: &str) -> Result<TempId, ChatError> {
        self.messages.send_message(room_id, content).await
    }

    /// Re-send a failed message
    ///
    /// # Errors
    ///
    /// See [`MessageDeliveryEngine::retry_message`]
    pub async fn retry_message(
        &self,
        room_id: RoomId,
        temp_id: &TempId,
    ) -> Result<TempId, ChatError> {
        self.messages.retry_message(room_id, temp_id).await
    }

    /// Backfill one page of older history
    ///
    /// # Errors
    ///
    /// See [`MessageDeliveryEngine::load_more`]
    pub async fn load_more(&self, room_id: RoomId) -> Result<usize, ChatError> {
        self.messages.load_more(room_id).await
    }

    /// Make a room active (or none)
    pub async fn set_active_room(&self, room_id: Option<RoomId>) {
        self.messages.set_active_room(room_id).await;
    }

    /// Drop a room's local state
    pub async fn reset_room(&self, room_id: RoomId) {
        self.messages.reset_room(room_id).await;
    }

    /// Snapshot of a room's message sequence
    pub async fn messages(&self, room_id: RoomId) -> Vec<ChatMessage> {
        self.messages.messages(room_id).await
    }

    /// Conversation list, newest activity first
    pub async fn conversations(&self) -> Vec<Conversation> {
        self.messages.conversations().await
    }

    /// Sum of unread counters
    pub async fn total_unread(&self) -> u32 {
        self.messages.total_unread().await
    }

    /// Subscribe to chat events
    #[must_use]
    pub fn subscribe_chat_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.messages.subscribe()
    }
}
