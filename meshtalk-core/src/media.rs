//! Media stack abstraction layer
//!
//! Abstracts the platform media engine (capture devices plus per-peer
//! negotiation sessions) behind traits so the signaling core never touches a
//! concrete stack. Implementations wrap whatever the embedding runtime
//! provides; tests use scripted mocks.

use crate::types::{CallType, IceCandidate, PeerId};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Media stack errors
#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// The user denied (or the platform blocked) capture device access
    #[error("Media access denied: {0}")]
    AccessDenied(String),

    /// Session description handling failed
    #[error("SDP error: {0}")]
    Sdp(String),

    /// Operation on a session that was already closed
    #[error("Media session closed")]
    Closed,
}

/// One peer's negotiation session.
///
/// Lifetime mirrors a PeerLink: opened lazily on first negotiation need,
/// closed on hangup or session teardown. Local capture tracks are attached
/// at open time by the [`MediaConnector`].
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Create a session description offer and set it as the local description
    ///
    /// # Errors
    ///
    /// Returns error if the underlying stack cannot produce an offer
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Create an answer for the previously applied remote offer and set it
    /// as the local description
    ///
    /// # Errors
    ///
    /// Returns error if no remote offer was applied first
    async fn create_answer(&self) -> Result<String, MediaError>;

    /// Apply the remote session description (offer or answer)
    ///
    /// # Errors
    ///
    /// Returns error if the description is rejected by the stack
    async fn set_remote_description(&self, sdp: &str) -> Result<(), MediaError>;

    /// Apply one remote ICE candidate.
    ///
    /// Callers must only invoke this after the remote description was set;
    /// ordering is enforced above this seam.
    ///
    /// # Errors
    ///
    /// Returns error if the candidate is rejected by the stack
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    /// Swap the outgoing video track for the connector's current camera
    /// track without renegotiating the session description.
    ///
    /// Known gap: across certain network-path changes the replacement can
    /// fail silently because no ICE restart is performed.
    ///
    /// # Errors
    ///
    /// Returns error if the sender refuses the replacement track
    async fn replace_video_track(&self) -> Result<(), MediaError>;

    /// Close the session and release its remote stream
    async fn close(&self);
}

/// Factory and owner of local capture media.
///
/// The connector owns the shared local stream (one microphone/camera set
/// reused across every open session) and hands out per-peer sessions with
/// those tracks attached.
#[async_trait]
pub trait MediaConnector: Send + Sync {
    /// Acquire local capture devices for the given call type.
    ///
    /// This is a suspension point: the platform may prompt the user. Safe to
    /// call repeatedly; an already-acquired stream is reused.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::AccessDenied`] if the user or platform refuses
    async fn acquire_local_media(&self, call_type: CallType) -> Result<(), MediaError>;

    /// Stop and release local capture devices
    async fn release_local_media(&self);

    /// Open a negotiation session to one peer with current local tracks
    /// attached. The returned receiver yields ICE candidates as the stack
    /// discovers them; the caller forwards them to the signaling transport.
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be created
    async fn open_session(
        &self,
        peer: &PeerId,
    ) -> Result<(Box<dyn MediaSession>, mpsc::Receiver<IceCandidate>), MediaError>;

    /// Enable or disable the outgoing audio track (mute control)
    async fn set_audio_enabled(&self, enabled: bool);

    /// Enable or disable the outgoing video track
    async fn set_video_enabled(&self, enabled: bool);

    /// Switch the capture camera (front/back). The new track becomes the
    /// connector's current video track; callers push it into open sessions
    /// via [`MediaSession::replace_video_track`].
    ///
    /// # Errors
    ///
    /// Returns error if the replacement capture cannot be opened
    async fn switch_camera(&self) -> Result<(), MediaError>;
}
