//! Core data model shared by the call and messaging engines

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a peer (user) on the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Create a peer id from anything string-like
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique identifier for a chat room (private or group)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub i64);

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated correlation id for an optimistically sent message.
///
/// A tempId is the sole identity of a locally authored message until the
/// server acknowledges or pushes the authoritative record back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(pub String);

impl TempId {
    /// Allocate a fresh tempId
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("temp_{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for TempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Call session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    /// No active call
    Idle,
    /// Outgoing call, waiting for an answer
    Calling,
    /// Incoming call, waiting for the user to accept or reject
    Incoming,
    /// Call is active
    Connected,
    /// Call finished; shown briefly before returning to idle
    Ended,
}

/// Call topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    /// One-to-one call
    P2p,
    /// Full-mesh group call
    Group,
}

/// Media composition of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio only
    Audio,
    /// Audio and video
    Video,
}

impl CallType {
    /// Check if video is part of this call type
    #[must_use]
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Connection status of a single participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnStatus {
    /// Negotiation in progress
    Connecting,
    /// Media flowing
    Connected,
    /// Connected without video
    AudioOnly,
}

/// Sender information carried inside every signaling envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    /// Peer id
    pub id: PeerId,
    /// Display name
    pub name: String,
    /// Avatar URL
    pub avatar: String,
    /// Call media composition the sender is in
    pub call_type: CallType,
    /// Call topology the sender is in
    pub call_mode: CallMode,
    /// Group the call belongs to, for group invites
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// Minimal user info attached to chat pushes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBrief {
    /// User id
    pub id: PeerId,
    /// Display name
    pub name: String,
    /// Avatar URL
    pub avatar: String,
}

/// The local user's identity, fixed at engine construction.
///
/// Injected once instead of being re-read from persisted storage at every
/// signal send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// Our peer id
    pub id: PeerId,
    /// Our display name
    pub name: String,
    /// Our avatar URL
    pub avatar: String,
}

impl LocalIdentity {
    /// Build the envelope sender info for the given call parameters
    #[must_use]
    pub fn to_peer_info(
        &self,
        call_type: CallType,
        call_mode: CallMode,
        group_id: Option<String>,
    ) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            call_type,
            call_mode,
            group_id,
        }
    }

    /// Our identity as chat sender info
    #[must_use]
    pub fn to_user_brief(&self) -> UserBrief {
        UserBrief {
            id: self.id.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

/// One remote participant in the active call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantState {
    /// Who the participant is
    pub info: PeerInfo,
    /// Their connection status
    pub status: ConnStatus,
}

/// ICE candidate proposed by the media stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP media id
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u32>,
}

/// Observable view of the active call session
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    /// Lifecycle state
    pub state: CallState,
    /// Topology
    pub mode: CallMode,
    /// Media composition
    pub call_type: CallType,
    /// The primary remote party (callee in p2p, inviter or group in group mode)
    pub remote: Option<PeerInfo>,
    /// Remote participants, in join order
    pub participants: Vec<ParticipantState>,
    /// When the session reached connected
    pub started_at: Option<DateTime<Utc>>,
    /// Local microphone muted
    pub muted: bool,
    /// Local camera enabled
    pub camera_on: bool,
}

/// Delivery status of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Optimistically echoed, waiting for the server
    Sending,
    /// Server acknowledged queueing (not yet persisted)
    Sent,
    /// Never acknowledged; terminal until the user retries
    Error,
}

/// Plain-text message content type on the wire
pub const MESSAGE_TYPE_TEXT: i32 = 1;

/// One entry of a room's ordered message sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Permanent id once reconciled; the tempId string until then
    pub id: String,
    /// Correlation id while the message is local-only
    pub temp_id: Option<TempId>,
    /// Room the message belongs to
    pub room_id: RoomId,
    /// Author
    pub sender: UserBrief,
    /// Message body
    pub content: String,
    /// Send time (server-authoritative once reconciled)
    pub sent_at: DateTime<Utc>,
    /// Delivery status
    pub status: MessageStatus,
    /// Content type discriminator
    pub message_type: i32,
}

/// One room in the ordered conversation list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Room id
    pub room_id: RoomId,
    /// Preview of the latest message
    pub last_message: String,
    /// Time of the latest activity; the list is ordered by this, newest first
    pub last_time: DateTime<Utc>,
    /// Messages received while the room was not active
    pub unread_count: u32,
}

/// Server acknowledgment that a sent message was received and queued.
///
/// Distinct from durable persistence: the authoritative record arrives later
/// as a [`MessagePush`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckReceipt {
    /// Correlation id from the original send
    pub temp_id: TempId,
    /// Server-side message id, if already allocated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_msg_id: Option<String>,
    /// Server receive time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ts: Option<DateTime<Utc>>,
}

/// Authoritative message body inside a push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBody {
    /// Permanent message id
    pub id: String,
    /// Authoritative send time
    pub send_time: DateTime<Utc>,
    /// Message body
    pub content: String,
    /// Content type discriminator
    #[serde(default = "default_message_type")]
    pub message_type: i32,
}

fn default_message_type() -> i32 {
    MESSAGE_TYPE_TEXT
}

/// Server-authoritative message push.
///
/// Carries the original tempId when the push finalizes one of our own sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePush {
    /// Target room
    pub room_id: RoomId,
    /// Author
    pub from_user: UserBrief,
    /// The message itself
    pub message: PushBody,
    /// Correlation id if this push reconciles a local send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
}

/// Outbound chat frame handed to the message transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundChat {
    /// Target room
    pub room_id: RoomId,
    /// Message body
    pub content: String,
    /// Correlation id for the eventual ack/push
    pub temp_id: TempId,
    /// Content type discriminator
    pub message_type: i32,
}

/// One page of history returned by the backfill query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    /// Records, oldest first within the page
    pub records: Vec<MessagePush>,
    /// Opaque cursor for the next (older) page
    pub next_cursor: Option<String>,
    /// Whether older pages exist beyond this one
    pub has_more: bool,
}

/// Engine configuration.
///
/// Every timer the core arms is sourced from here so tests can shrink them.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// How long an unanswered outgoing call rings before auto-cancel
    pub ring_timeout: Duration,
    /// How long the ended screen is shown before resetting to idle
    pub ended_grace: Duration,
    /// How long a sent message may wait for its ack
    pub ack_timeout: Duration,
    /// Page size for history backfill
    pub history_page_size: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(60),
            ended_grace: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(3),
            history_page_size: 30,
        }
    }
}

/// Call-side notifications for the UI
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Session state changed
    StateChanged {
        /// New state
        state: CallState,
    },
    /// An incoming call is ringing
    IncomingCall {
        /// Who is calling
        from: PeerInfo,
    },
    /// A participant was added to the roster
    ParticipantJoined {
        /// The participant
        info: PeerInfo,
        /// Initial status
        status: ConnStatus,
    },
    /// A participant's connection status changed
    ParticipantUpdated {
        /// Which participant
        id: PeerId,
        /// New status
        status: ConnStatus,
    },
    /// A participant left or was trimmed
    ParticipantLeft {
        /// Which participant
        id: PeerId,
    },
    /// The remote side was busy or rejected the call
    PeerBusyOrRejected {
        /// Which peer
        id: PeerId,
    },
    /// The outgoing call rang out without an answer
    RingTimeout,
}

/// Messaging-side notifications for the UI
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A message was appended to the end of a room sequence
    MessageAppended {
        /// Room
        room_id: RoomId,
        /// Message id (tempId string for local echoes)
        id: String,
    },
    /// A local message was reconciled with its authoritative record
    MessageFinalized {
        /// Room
        room_id: RoomId,
        /// Permanent id
        id: String,
    },
    /// A local message transitioned to error
    MessageFailed {
        /// Room
        room_id: RoomId,
        /// Correlation id of the failed send
        temp_id: TempId,
    },
    /// Older history was prepended to a room sequence
    HistoryPrepended {
        /// Room
        room_id: RoomId,
        /// Number of records prepended
        count: usize,
    },
    /// The conversation list changed (ordering, previews or unread counts)
    ConversationsChanged,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn temp_ids_are_unique() {
        let a = TempId::generate();
        let b = TempId::generate();
        assert_ne!(a, b);
        assert!(a.0.starts_with("temp_"));
    }

    #[test]
    fn peer_info_wire_shape() {
        let info = PeerInfo {
            id: PeerId::from("u1"),
            name: "Alice".into(),
            avatar: "a.png".into(),
            call_type: CallType::Video,
            call_mode: CallMode::Group,
            group_id: Some("g9".into()),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["callType"], "video");
        assert_eq!(json["callMode"], "group");
        assert_eq!(json["groupId"], "g9");

        let p2p = PeerInfo {
            group_id: None,
            call_mode: CallMode::P2p,
            ..info
        };
        let json = serde_json::to_value(&p2p).unwrap();
        assert!(json.get("groupId").is_none());
    }

    #[test]
    fn conn_status_uses_kebab_case() {
        let s = serde_json::to_string(&ConnStatus::AudioOnly).unwrap();
        assert_eq!(s, "\"audio-only\"");
    }

    #[test]
    fn ack_receipt_tolerates_missing_optionals() {
        let ack: AckReceipt = serde_json::from_str(r#"{"tempId":"temp_x"}"#).unwrap();
        assert_eq!(ack.temp_id.0, "temp_x");
        assert_eq!(ack.server_msg_id, None);
        assert_eq!(ack.server_ts, None);
    }

    #[test]
    fn default_config_matches_protocol_constants() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.ring_timeout, Duration::from_secs(60));
        assert_eq!(cfg.ended_grace, Duration::from_secs(2));
        assert_eq!(cfg.ack_timeout, Duration::from_secs(3));
        assert_eq!(cfg.history_page_size, 30);
    }
}
