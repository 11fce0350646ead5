//! Call session lifecycle
//!
//! One controller owns at most one call session at a time and drives it
//! through `idle → calling/incoming → connected → ended → idle`. All inbound
//! envelopes and UI commands funnel through the single state lock, so
//! handlers never interleave and the link registry needs no further
//! synchronization.

use crate::links::{LinkError, PeerLinkManager};
use crate::media::MediaConnector;
use crate::signaling::{SignalBody, SignalingEnvelope, SignalingTransport};
use crate::types::{
    CallEvent, CallMode, CallSnapshot, CallState, CallType, ConnStatus, CoreConfig, LocalIdentity,
    ParticipantState, PeerId, PeerInfo, UserBrief,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

/// Call control errors
#[derive(Error, Debug)]
pub enum CallError {
    /// The signaling channel is down; a reconnect was requested
    #[error("Transport not ready, reconnect requested")]
    TransportUnavailable,

    /// Capture devices were refused; the call attempt is abandoned
    #[error("Media access denied: {0}")]
    MediaAccessDenied(String),

    /// Nothing to act on (e.g. accept with no pending offer); benign
    #[error("No pending negotiation")]
    NoPendingNegotiation,

    /// A non-idle session already exists
    #[error("A call is already active")]
    AlreadyInCall,

    /// No active session
    #[error("No active call")]
    NotInCall,

    /// Link-level failure
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// The single active call session
pub(crate) struct Session {
    pub(crate) state: CallState,
    pub(crate) mode: CallMode,
    pub(crate) call_type: CallType,
    pub(crate) remote: Option<PeerInfo>,
    pub(crate) group_id: Option<String>,
    pub(crate) participants: Vec<ParticipantState>,
    /// Offers received while ringing, in arrival order. In group mode the
    /// first entry's sender is the inviter.
    pub(crate) pending_offers: Vec<(PeerId, String)>,
    /// Invitees to announce to the rest of the mesh once they answer
    pub(crate) announce_on_answer: Vec<PeerId>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) muted: bool,
    pub(crate) camera_on: bool,
}

impl Session {
    pub(crate) fn participant_mut(&mut self, id: &PeerId) -> Option<&mut ParticipantState> {
        self.participants.iter_mut().find(|p| p.info.id == *id)
    }

    pub(crate) fn remove_participant(&mut self, id: &PeerId) {
        self.participants.retain(|p| p.info.id != *id);
    }
}

pub(crate) struct CallInner {
    pub(crate) session: Option<Session>,
    pub(crate) links: PeerLinkManager,
    /// Bumped on session create/destroy; stale timers check it before acting
    pub(crate) epoch: u64,
}

/// Top-level call lifecycle state machine.
///
/// Owns the session, the per-peer link registry and every call-side timer.
/// One instance serves both p2p and group calls; the topology is a mode
/// value on the session, not a separate engine.
pub struct CallSessionController {
    pub(crate) identity: LocalIdentity,
    pub(crate) config: CoreConfig,
    pub(crate) transport: Arc<dyn SignalingTransport>,
    pub(crate) connector: Arc<dyn MediaConnector>,
    pub(crate) inner: Arc<Mutex<CallInner>>,
    pub(crate) events: broadcast::Sender<CallEvent>,
}

impl CallSessionController {
    /// Create a controller for the given identity and collaborators
    #[must_use]
    pub fn new(
        identity: LocalIdentity,
        transport: Arc<dyn SignalingTransport>,
        connector: Arc<dyn MediaConnector>,
        config: CoreConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(100);
        let links = PeerLinkManager::new(
            identity.id.clone(),
            Arc::clone(&transport),
            Arc::clone(&connector),
        );
        Self {
            identity,
            config,
            transport,
            connector,
            inner: Arc::new(Mutex::new(CallInner {
                session: None,
                links,
                epoch: 0,
            })),
            events,
        }
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Current lifecycle state
    pub async fn state(&self) -> CallState {
        let inner = self.inner.lock().await;
        inner
            .session
            .as_ref()
            .map_or(CallState::Idle, |s| s.state)
    }

    /// Observable view of the session
    pub async fn snapshot(&self) -> CallSnapshot {
        let inner = self.inner.lock().await;
        match &inner.session {
            Some(s) => CallSnapshot {
                state: s.state,
                mode: s.mode,
                call_type: s.call_type,
                remote: s.remote.clone(),
                participants: s.participants.clone(),
                started_at: s.started_at,
                muted: s.muted,
                camera_on: s.camera_on,
            },
            None => CallSnapshot {
                state: CallState::Idle,
                mode: CallMode::P2p,
                call_type: CallType::Audio,
                remote: None,
                participants: Vec::new(),
                started_at: None,
                muted: false,
                camera_on: false,
            },
        }
    }

    /// Start an outgoing call.
    ///
    /// Rejected (no state change, nothing sent) unless the session is idle
    /// and the transport is ready; an unready transport additionally
    /// triggers a reconnect request. Acquiring local media is a suspension
    /// point: a second `start_call` racing it sees the non-idle session and
    /// is rejected rather than queued.
    ///
    /// # Errors
    ///
    /// Returns error if a session exists, the transport is down, media is
    /// denied, or the initial offer fails
    #[tracing::instrument(skip(self, target), fields(target = %target.id, ?call_type, ?mode))]
    pub async fn start_call(
        &self,
        target: UserBrief,
        call_type: CallType,
        mode: CallMode,
    ) -> Result<(), CallError> {
        if !self.transport.is_ready() {
            tracing::warn!("Transport not ready, requesting reconnect");
            self.transport.request_reconnect().await;
            return Err(CallError::TransportUnavailable);
        }

        let epoch = {
            let mut inner = self.inner.lock().await;
            if inner.session.is_some() {
                tracing::warn!("Call already in progress, ignoring start_call");
                return Err(CallError::AlreadyInCall);
            }
            let group_id = (mode == CallMode::Group).then(|| target.id.0.clone());
            inner.session = Some(Session {
                state: CallState::Calling,
                mode,
                call_type,
                remote: Some(PeerInfo {
                    id: target.id.clone(),
                    name: target.name,
                    avatar: target.avatar,
                    call_type,
                    call_mode: mode,
                    group_id: group_id.clone(),
                }),
                group_id,
                participants: Vec::new(),
                pending_offers: Vec::new(),
                announce_on_answer: Vec::new(),
                started_at: None,
                muted: false,
                camera_on: call_type.has_video(),
            });
            inner.epoch += 1;
            self.emit_state(CallState::Calling);
            inner.epoch
        };

        // Suspension point: device prompt happens off the state lock.
        if let Err(e) = self.connector.acquire_local_media(call_type).await {
            tracing::warn!(error = %e, "Local media unavailable, abandoning call");
            let mut inner = self.inner.lock().await;
            if inner.epoch == epoch {
                self.reset_locked(&mut inner);
            }
            return Err(CallError::MediaAccessDenied(e.to_string()));
        }

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            // Superseded while the prompt was open
            return Ok(());
        }

        match mode {
            CallMode::P2p => {
                let info = self.session_sender_info_locked(&inner);
                if let Err(e) = inner.links.send_offer(&target.id, &info).await {
                    tracing::error!(error = %e, "Failed to send initial offer");
                    self.reset_locked(&mut inner);
                    return Err(e.into());
                }
                self.spawn_ring_timer(epoch);
            }
            CallMode::Group => {
                // The initiator of a group call is always present
                if let Some(s) = inner.session.as_mut() {
                    s.state = CallState::Connected;
                    s.started_at = Some(Utc::now());
                }
                self.emit_state(CallState::Connected);
            }
        }
        Ok(())
    }

    /// Accept the ringing incoming call.
    ///
    /// Requires a pending offer; in group mode the first queued offer's
    /// sender is treated as the inviter.
    ///
    /// # Errors
    ///
    /// Returns error if nothing is pending, media is denied, or answering
    /// the offer fails; in the latter two cases the session resets to idle
    #[tracing::instrument(skip(self))]
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (inviter, sdp, call_type, epoch) = {
            let mut inner = self.inner.lock().await;
            let session = inner.session.as_mut().ok_or(CallError::NotInCall)?;
            if session.state != CallState::Incoming {
                tracing::warn!(state = ?session.state, "accept_call outside incoming state");
                return Err(CallError::NoPendingNegotiation);
            }
            if session.pending_offers.is_empty() {
                tracing::warn!("No pending offer to accept");
                return Err(CallError::NoPendingNegotiation);
            }
            let (inviter, sdp) = session.pending_offers.remove(0);
            (inviter, sdp, session.call_type, inner.epoch)
        };

        if let Err(e) = self.connector.acquire_local_media(call_type).await {
            tracing::warn!(error = %e, "Local media unavailable, abandoning accept");
            let mut inner = self.inner.lock().await;
            if inner.epoch == epoch {
                self.reset_locked(&mut inner);
            }
            return Err(CallError::MediaAccessDenied(e.to_string()));
        }

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return Ok(());
        }
        let info = self.session_sender_info_locked(&inner);
        if let Err(e) = inner.links.apply_remote_offer(&inviter, &sdp, &info).await {
            // The pending offer is gone and nothing is left to accept, so
            // the session cannot stay in incoming.
            tracing::warn!(peer = %inviter, error = %e, "Accept negotiation failed, tearing down");
            self.reset_locked(&mut inner);
            inner.links.close_all().await;
            return Err(e.into());
        }

        if let Some(s) = inner.session.as_mut() {
            s.state = CallState::Connected;
            s.started_at = Some(Utc::now());
            if let Some(p) = s.participant_mut(&inviter) {
                p.status = ConnStatus::Connected;
            }
        }
        self.emit_state(CallState::Connected);
        tracing::info!(peer = %inviter, "Call accepted");
        Ok(())
    }

    /// Decline the ringing incoming call.
    ///
    /// The session returns to idle immediately; the reject envelope and
    /// resource release happen afterwards so the UI never waits on I/O.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotInCall`] if no session exists and
    /// [`CallError::NoPendingNegotiation`] if the session is not ringing
    /// (leaving an answered call is [`Self::hangup`]'s job)
    #[tracing::instrument(skip(self))]
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let (target, info) = {
            let mut inner = self.inner.lock().await;
            let session = inner.session.as_ref().ok_or(CallError::NotInCall)?;
            if session.state != CallState::Incoming {
                tracing::warn!(state = ?session.state, "reject_call outside incoming state");
                return Err(CallError::NoPendingNegotiation);
            }
            let target = session
                .pending_offers
                .first()
                .map(|(peer, _)| peer.clone())
                .or_else(|| session.remote.as_ref().map(|r| r.id.clone()));
            let info = self.session_sender_info_locked(&inner);
            self.reset_locked(&mut inner);
            inner.links.close_all().await;
            (target, info)
        };

        if let Some(target) = target {
            if let Err(e) = self
                .transport
                .send(&target, crate::links::envelope(&info, SignalBody::Reject))
                .await
            {
                tracing::warn!(error = %e, "Failed to send reject");
            }
        }
        Ok(())
    }

    /// Leave the call.
    ///
    /// The session shows `ended` immediately (then auto-resets after the
    /// grace window); every peer linked at call time is notified exactly
    /// once afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::NotInCall`] if no session exists
    #[tracing::instrument(skip(self))]
    pub async fn hangup(&self) -> Result<(), CallError> {
        let (peers, info) = {
            let mut inner = self.inner.lock().await;
            if inner.session.is_none() {
                return Err(CallError::NotInCall);
            }
            let info = self.session_sender_info_locked(&inner);
            let peers = inner.links.peers();
            self.end_call_locked(&mut inner).await;
            (peers, info)
        };

        for peer in peers {
            if let Err(e) = self
                .transport
                .send(&peer, crate::links::envelope(&info, SignalBody::Hangup))
                .await
            {
                tracing::warn!(peer = %peer, error = %e, "Failed to send hangup");
            }
        }
        Ok(())
    }

    /// Toggle the local microphone
    pub async fn toggle_mute(&self) {
        let muted = {
            let mut inner = self.inner.lock().await;
            match inner.session.as_mut() {
                Some(s) => {
                    s.muted = !s.muted;
                    s.muted
                }
                None => return,
            }
        };
        self.connector.set_audio_enabled(!muted).await;
    }

    /// Toggle the local camera
    pub async fn toggle_camera(&self) {
        let camera_on = {
            let mut inner = self.inner.lock().await;
            match inner.session.as_mut() {
                Some(s) => {
                    s.camera_on = !s.camera_on;
                    s.camera_on
                }
                None => return,
            }
        };
        self.connector.set_video_enabled(camera_on).await;
    }

    /// Swap the capture camera on every open link (no renegotiation)
    ///
    /// # Errors
    ///
    /// Returns error if the replacement capture cannot be opened
    pub async fn switch_camera(&self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.session.is_none() {
            return Err(CallError::NotInCall);
        }
        inner.links.switch_camera().await.map_err(LinkError::Media)?;
        Ok(())
    }

    /// Apply one inbound signaling envelope.
    ///
    /// Envelopes must be fed in transport-delivery order; the controller
    /// never reorders them internally.
    ///
    /// # Errors
    ///
    /// Returns error on link-level failures; unexpected-but-benign
    /// envelopes are logged and ignored
    #[tracing::instrument(skip(self, envelope), fields(kind = envelope.body.kind(), sender = %envelope.sender_id))]
    pub async fn handle_envelope(&self, envelope: SignalingEnvelope) -> Result<(), CallError> {
        match &envelope.body {
            SignalBody::Offer { sdp } => self.handle_offer(&envelope, sdp.clone()).await,
            SignalBody::Answer { sdp } => self.handle_answer(&envelope.sender_id, sdp).await,
            SignalBody::Candidate(candidate) => {
                self.handle_candidate(&envelope.sender_id, candidate.clone()).await
            }
            SignalBody::Hangup => self.handle_remote_hangup(&envelope.sender_id).await,
            SignalBody::Busy | SignalBody::Reject => {
                self.handle_busy_or_reject(&envelope.sender_id).await
            }
            SignalBody::NewMember { member } => self.handle_new_member(member.clone()).await,
        }
    }

    async fn handle_offer(&self, envelope: &SignalingEnvelope, sdp: String) -> Result<(), CallError> {
        let busy_reply = {
            let mut inner = self.inner.lock().await;
            match inner.session.as_ref().map(|s| (s.state, s.mode)) {
                Some((CallState::Connected, CallMode::Group)) => {
                    // A peer is joining our established group call
                    return self.admit_group_join(&mut inner, envelope, &sdp).await;
                }
                Some(_) => {
                    tracing::info!(peer = %envelope.sender_id, "Busy, declining offer");
                    Some(self.session_sender_info_locked(&inner))
                }
                None => {
                    self.begin_incoming_locked(&mut inner, envelope, sdp);
                    None
                }
            }
        };

        if let Some(info) = busy_reply {
            if let Err(e) = self
                .transport
                .send(
                    &envelope.sender_id,
                    crate::links::envelope(&info, SignalBody::Busy),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to send busy");
            }
        }
        Ok(())
    }

    fn begin_incoming_locked(
        &self,
        inner: &mut CallInner,
        envelope: &SignalingEnvelope,
        sdp: String,
    ) {
        let from = envelope.sender_info.clone();
        let mode = from.call_mode;
        let mut participants = Vec::new();
        if mode == CallMode::Group {
            // The inviter is already present in the call we were invited to
            participants.push(ParticipantState {
                info: from.clone(),
                status: ConnStatus::Connected,
            });
        }
        inner.session = Some(Session {
            state: CallState::Incoming,
            mode,
            call_type: from.call_type,
            group_id: from.group_id.clone(),
            remote: Some(from.clone()),
            participants,
            pending_offers: vec![(envelope.sender_id.clone(), sdp)],
            announce_on_answer: Vec::new(),
            started_at: None,
            muted: false,
            camera_on: from.call_type.has_video(),
        });
        inner.epoch += 1;
        tracing::info!(peer = %envelope.sender_id, ?mode, "Incoming call");
        let _ = self.events.send(CallEvent::IncomingCall { from });
        self.emit_state(CallState::Incoming);
    }

    async fn handle_answer(&self, sender: &PeerId, sdp: &str) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.session.is_none() {
            tracing::debug!(peer = %sender, "Answer with no session, ignoring");
            return Ok(());
        }
        match inner.links.apply_remote_answer(sender, sdp).await {
            Ok(()) => {}
            Err(LinkError::NoPendingNegotiation(_)) => {
                tracing::debug!(peer = %sender, "Answer without outstanding offer, ignoring");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(s) = inner.session.as_mut() {
            let is_primary = s.remote.as_ref().is_some_and(|r| r.id == *sender);
            if s.state == CallState::Calling && is_primary {
                s.state = CallState::Connected;
                s.started_at = Some(Utc::now());
                self.emit_state(CallState::Connected);
            }
            if let Some(p) = s.participant_mut(sender) {
                p.status = ConnStatus::Connected;
                let _ = self.events.send(CallEvent::ParticipantUpdated {
                    id: sender.clone(),
                    status: ConnStatus::Connected,
                });
            }
        }

        // An invitee we brought in is announced to the mesh once they answer
        let announce = inner.session.as_mut().and_then(|s| {
            let pos = s.announce_on_answer.iter().position(|p| p == sender)?;
            s.announce_on_answer.remove(pos);
            s.participant_mut(sender).map(|p| p.info.clone())
        });
        if let Some(member) = announce {
            self.broadcast_new_member(&mut inner, &member).await;
        }
        Ok(())
    }

    async fn handle_candidate(
        &self,
        sender: &PeerId,
        candidate: crate::types::IceCandidate,
    ) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        if inner.session.is_none() {
            tracing::debug!(peer = %sender, "Candidate with no session, dropping");
            return Ok(());
        }
        if let Err(e) = inner.links.add_remote_candidate(sender, candidate).await {
            // A bad candidate never tears down the call
            tracing::warn!(peer = %sender, error = %e, "Candidate rejected");
        }
        Ok(())
    }

    async fn handle_remote_hangup(&self, sender: &PeerId) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.session.as_ref() else {
            return Ok(());
        };
        match session.mode {
            CallMode::P2p => {
                tracing::info!(peer = %sender, "Remote hung up");
                self.end_call_locked(&mut inner).await;
            }
            CallMode::Group => {
                inner.links.close_link(sender).await;
                if let Some(s) = inner.session.as_mut() {
                    s.remove_participant(sender);
                }
                let _ = self.events.send(CallEvent::ParticipantLeft { id: sender.clone() });
                tracing::info!(peer = %sender, "Participant left group call");
                if inner.links.is_empty() {
                    self.end_call_locked(&mut inner).await;
                }
            }
        }
        Ok(())
    }

    async fn handle_busy_or_reject(&self, sender: &PeerId) -> Result<(), CallError> {
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.session.as_ref() else {
            return Ok(());
        };
        let _ = self.events.send(CallEvent::PeerBusyOrRejected { id: sender.clone() });
        match session.mode {
            CallMode::P2p => {
                // Straight back to idle: there is nothing worth displaying
                tracing::info!(peer = %sender, "Peer busy or rejected, resetting");
                self.reset_locked(&mut inner);
                inner.links.close_all().await;
            }
            CallMode::Group => {
                inner.links.close_link(sender).await;
                if let Some(s) = inner.session.as_mut() {
                    s.remove_participant(sender);
                }
                let _ = self.events.send(CallEvent::ParticipantLeft { id: sender.clone() });
            }
        }
        Ok(())
    }

    /// Transition to ended, close every link, release media and arm the
    /// grace timer back to idle.
    pub(crate) async fn end_call_locked(&self, inner: &mut CallInner) {
        if let Some(s) = inner.session.as_mut() {
            s.state = CallState::Ended;
            s.started_at = None;
        }
        self.emit_state(CallState::Ended);
        inner.links.close_all().await;
        self.spawn_grace_timer(inner.epoch);
    }

    /// Drop the session and return to idle
    pub(crate) fn reset_locked(&self, inner: &mut CallInner) {
        inner.session = None;
        inner.epoch += 1;
        self.emit_state(CallState::Idle);
    }

    /// Envelope sender info for the current session's parameters
    pub(crate) fn session_sender_info_locked(&self, inner: &CallInner) -> PeerInfo {
        match inner.session.as_ref() {
            Some(s) => self
                .identity
                .to_peer_info(s.call_type, s.mode, s.group_id.clone()),
            None => self
                .identity
                .to_peer_info(CallType::Audio, CallMode::P2p, None),
        }
    }

    pub(crate) fn emit_state(&self, state: CallState) {
        let _ = self.events.send(CallEvent::StateChanged { state });
    }

    /// Auto-cancel an outgoing call that nobody answered.
    fn spawn_ring_timer(&self, epoch: u64) {
        let inner = Arc::clone(&self.inner);
        let controller = self.clone_for_timer();
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut inner = inner.lock().await;
            let still_ringing = inner.epoch == epoch
                && inner
                    .session
                    .as_ref()
                    .is_some_and(|s| s.state == CallState::Calling);
            if still_ringing {
                tracing::info!("Ring timeout, cancelling call");
                let _ = controller.events.send(CallEvent::RingTimeout);
                controller.end_call_locked(&mut inner).await;
            }
        });
    }

    /// After the ended display window, return to idle unless a new call
    /// superseded the session.
    fn spawn_grace_timer(&self, epoch: u64) {
        let inner = Arc::clone(&self.inner);
        let controller = self.clone_for_timer();
        let grace = self.config.ended_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut inner = inner.lock().await;
            let still_ended = inner.epoch == epoch
                && inner
                    .session
                    .as_ref()
                    .is_some_and(|s| s.state == CallState::Ended);
            if still_ended {
                controller.reset_locked(&mut inner);
            }
        });
    }

    /// Cheap handle for timer tasks: shares state, events and collaborators
    fn clone_for_timer(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            connector: Arc::clone(&self.connector),
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
        }
    }
}
