//! Meshtalk - call signaling and reliable message delivery engine
//!
//! This library provides the client-side core of a combined calling and
//! chat application: a call lifecycle state machine over an external
//! signaling channel, full-mesh group calls, and an optimistic message
//! delivery engine with ack/push reconciliation. It features:
//!
//! - **One call state machine**: p2p and group calls share a single engine;
//!   the topology is a mode, not a separate code path
//! - **Candidate ordering**: ICE candidates are queued per peer and applied
//!   only after the remote description, exactly once, in arrival order
//! - **Optimistic messaging**: sends echo immediately and reconcile with
//!   the server ack, the authoritative push, or the ack timeout, in any
//!   order and idempotently
//! - **Pluggable edges**: signaling, media, chat transport and history are
//!   traits; the engine never touches a socket or a device directly
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshtalk_core::{CallMode, CallType, LocalIdentity, MeshtalkService, PeerId, UserBrief};
//! # use meshtalk_core::{MediaConnector, SignalingTransport, MessageTransport, HistoryStore};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     signaling: Arc<dyn SignalingTransport>,
//! #     media: Arc<dyn MediaConnector>,
//! #     chat: Arc<dyn MessageTransport>,
//! #     history: Arc<dyn HistoryStore>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let service = MeshtalkService::builder()
//!     .identity(LocalIdentity {
//!         id: PeerId::new("alice"),
//!         name: "Alice".into(),
//!         avatar: "alice.png".into(),
//!     })
//!     .signaling(signaling)
//!     .media(media)
//!     .chat(chat)
//!     .history(history)
//!     .build()?;
//!
//! // Ring bob with video
//! service
//!     .start_call(
//!         UserBrief {
//!             id: PeerId::new("bob"),
//!             name: "Bob".into(),
//!             avatar: "bob.png".into(),
//!         },
//!         CallType::Video,
//!         CallMode::P2p,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Core data model shared by both engines
pub mod types;

/// Signaling envelopes, wire codec and transport trait
pub mod signaling;

/// Media stack abstraction layer
pub mod media;

/// Per-peer links and candidate queueing
pub mod links;

/// Call session lifecycle state machine
pub mod call;

/// Full-mesh maintenance for group calls
pub mod mesh;

/// Optimistic message delivery engine
pub mod messaging;

/// Conversation index with unread tracking
pub mod conversations;

/// Top-level service facade
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

pub use call::{CallError, CallSessionController};
pub use conversations::ConversationIndex;
pub use links::{LinkError, LinkNegotiation, OfferDisposition, PeerLinkManager};
pub use media::{MediaConnector, MediaError, MediaSession};
pub use messaging::{ChatError, HistoryStore, MessageDeliveryEngine, MessageTransport};
pub use service::{MeshtalkService, MeshtalkServiceBuilder, ServiceError};
pub use signaling::{
    decode_envelope, SignalBody, SignalError, SignalingEnvelope, SignalingTransport,
};
pub use types::{
    AckReceipt, CallEvent, CallMode, CallSnapshot, CallState, CallType, ChatEvent, ChatMessage,
    ConnStatus, Conversation, CoreConfig, HistoryPage, IceCandidate, LocalIdentity, MessagePush,
    MessageStatus, OutboundChat, ParticipantState, PeerId, PeerInfo, PushBody, RoomId, TempId,
    UserBrief, MESSAGE_TYPE_TEXT,
};
