//! Signaling wire protocol and transport seam
//!
//! Envelopes ride an already-established duplex channel shared with chat
//! traffic. Delivery is fire-and-forget and ordered only per logical peer;
//! reconnection and heartbeats live below this seam.

use crate::types::{IceCandidate, PeerId, PeerInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalError {
    /// Envelope failed to parse; dropped, never propagated as a crash
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// Underlying channel failed to send
    #[error("Transport error: {0}")]
    Transport(String),

    /// Underlying channel is not established
    #[error("Transport not ready")]
    NotReady,
}

/// Kind-discriminated payload of a signaling envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum SignalBody {
    /// Session description offer
    Offer {
        /// SDP offer string
        sdp: String,
    },
    /// Session description answer
    Answer {
        /// SDP answer string
        sdp: String,
    },
    /// ICE candidate discovered by the sender's media stack
    Candidate(IceCandidate),
    /// Sender left the call
    Hangup,
    /// Sender is already in another call
    Busy,
    /// Sender declined the call
    Reject,
    /// A new participant joined the sender's group call; recipients should
    /// offer to the member directly to complete the mesh
    NewMember {
        /// The participant that joined
        member: PeerInfo,
    },
}

impl SignalBody {
    /// Short kind name, for log fields
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate(_) => "candidate",
            Self::Hangup => "hangup",
            Self::Busy => "busy",
            Self::Reject => "reject",
            Self::NewMember { .. } => "new_member",
        }
    }
}

/// One signaling envelope as carried on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingEnvelope {
    /// Who sent it
    pub sender_id: PeerId,
    /// Sender details, including their call context
    pub sender_info: PeerInfo,
    /// What it carries
    #[serde(flatten)]
    pub body: SignalBody,
}

/// Decode a raw envelope frame.
///
/// # Errors
///
/// Returns [`SignalError::Malformed`] when the frame is not a valid envelope.
pub fn decode_envelope(raw: &str) -> Result<SignalingEnvelope, SignalError> {
    serde_json::from_str(raw).map_err(|e| SignalError::Malformed(e.to_string()))
}

/// Signaling transport trait
///
/// Implement this over the shared duplex channel. Sends are fire-and-forget:
/// there is no delivery acknowledgment at this layer, and ordering is
/// guaranteed only per logical peer connection.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send an envelope to one peer
    ///
    /// # Errors
    ///
    /// Returns error if the channel rejects the frame
    async fn send(&self, to: &PeerId, envelope: SignalingEnvelope) -> Result<(), SignalError>;

    /// Whether the underlying channel is currently established
    fn is_ready(&self) -> bool;

    /// Ask the channel layer to start reconnecting.
    ///
    /// Called when a send attempt was aborted because the channel was down.
    async fn request_reconnect(&self);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CallMode, CallType};
    use pretty_assertions::assert_eq;

    fn alice() -> PeerInfo {
        PeerInfo {
            id: PeerId::from("alice"),
            name: "Alice".into(),
            avatar: "a.png".into(),
            call_type: CallType::Audio,
            call_mode: CallMode::P2p,
            group_id: None,
        }
    }

    #[test]
    fn offer_envelope_round_trips() {
        let env = SignalingEnvelope {
            sender_id: PeerId::from("alice"),
            sender_info: alice(),
            body: SignalBody::Offer {
                sdp: "v=0\r\n".into(),
            },
        };

        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"kind\":\"offer\""));
        assert!(json.contains("\"senderId\":\"alice\""));

        let back = decode_envelope(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn unit_kinds_carry_no_payload() {
        let env = SignalingEnvelope {
            sender_id: PeerId::from("alice"),
            sender_info: alice(),
            body: SignalBody::Hangup,
        };

        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["kind"], "hangup");
        assert!(json.get("payload").is_none());
    }

    #[test]
    fn candidate_envelope_keeps_sdp_fields() {
        let env = SignalingEnvelope {
            sender_id: PeerId::from("alice"),
            sender_info: alice(),
            body: SignalBody::Candidate(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }),
        };

        let json = serde_json::to_string(&env).unwrap();
        let back = decode_envelope(&json).unwrap();
        assert_eq!(back, env);
        assert!(json.contains("sdpMLineIndex"));
    }

    #[test]
    fn malformed_frames_are_rejected_not_panicked() {
        assert!(matches!(
            decode_envelope("not json"),
            Err(SignalError::Malformed(_))
        ));
        assert!(matches!(
            decode_envelope(r#"{"kind":"offer"}"#),
            Err(SignalError::Malformed(_))
        ));
    }

    #[test]
    fn kind_names_match_wire_tags() {
        assert_eq!(SignalBody::Hangup.kind(), "hangup");
        assert_eq!(
            SignalBody::NewMember { member: alice() }.kind(),
            "new_member"
        );
    }
}
