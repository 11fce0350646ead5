//! Per-peer negotiation state machines
//!
//! A PeerLink exists for peer P exactly while negotiation or connection to P
//! is in progress or established. Links are keyed by peer id, created at
//! most once per peer per session, and owned exclusively by the manager.
//! The owning controller serializes every call into the manager, so queue
//! draining and new-candidate handling are mutually exclusive in time.

use crate::media::{MediaConnector, MediaError, MediaSession};
use crate::signaling::{SignalBody, SignalError, SignalingEnvelope, SignalingTransport};
use crate::types::{IceCandidate, PeerId, PeerInfo};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Link management errors
#[derive(Error, Debug)]
pub enum LinkError {
    /// Remote description arrived for a peer we never offered to
    #[error("No pending negotiation with peer {0}")]
    NoPendingNegotiation(PeerId),

    /// Media stack failure
    #[error(transparent)]
    Media(#[from] MediaError),

    /// Signaling failure
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// Negotiation state of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkNegotiation {
    /// We sent an offer and await the answer
    OfferSent,
    /// We received an offer and are producing the answer
    OfferReceived,
    /// Descriptions exchanged; media connecting or flowing
    Connected,
}

/// What became of an incoming offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDisposition {
    /// Offer applied and answered
    Answered,
    /// Glare: our own outstanding offer takes precedence, theirs dropped
    IgnoredGlare,
}

/// One per-peer link: media session plus negotiation bookkeeping
struct PeerLink {
    session: Box<dyn MediaSession>,
    negotiation: LinkNegotiation,
    remote_set: bool,
    forwarder: JoinHandle<()>,
}

/// Owner of every PeerLink in the active session.
///
/// Candidates arriving before a peer's remote description is set are queued
/// per peer (even before the link itself exists, which happens on the callee
/// side between ring and accept) and flushed FIFO exactly once, immediately
/// after the remote description is applied.
pub struct PeerLinkManager {
    local_id: PeerId,
    transport: Arc<dyn SignalingTransport>,
    connector: Arc<dyn MediaConnector>,
    links: HashMap<PeerId, PeerLink>,
    queues: HashMap<PeerId, Vec<IceCandidate>>,
}

impl PeerLinkManager {
    /// Create an empty manager
    pub fn new(
        local_id: PeerId,
        transport: Arc<dyn SignalingTransport>,
        connector: Arc<dyn MediaConnector>,
    ) -> Self {
        Self {
            local_id,
            transport,
            connector,
            links: HashMap::new(),
            queues: HashMap::new(),
        }
    }

    /// Number of live links
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether no links remain
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Whether a link to this peer exists
    #[must_use]
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.links.contains_key(peer)
    }

    /// All linked peers
    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        self.links.keys().cloned().collect()
    }

    /// Peers whose link reached the connected state
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.links
            .iter()
            .filter(|(_, link)| link.negotiation == LinkNegotiation::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Negotiation state of one link, if it exists
    #[must_use]
    pub fn negotiation(&self, peer: &PeerId) -> Option<LinkNegotiation> {
        self.links.get(peer).map(|l| l.negotiation)
    }

    /// Offer to a peer, creating the link.
    ///
    /// Idempotent on link existence: if a link to this peer already exists
    /// the call is a no-op and returns `false` (duplicate-join suppression).
    ///
    /// # Errors
    ///
    /// Returns error if the session or the offer cannot be created
    pub async fn send_offer(
        &mut self,
        peer: &PeerId,
        sender_info: &PeerInfo,
    ) -> Result<bool, LinkError> {
        if self.links.contains_key(peer) {
            tracing::debug!(peer = %peer, "Link already exists, not re-offering");
            return Ok(false);
        }

        let mut link = self.create_link(peer, sender_info).await?;
        let sdp = link.session.create_offer().await?;
        link.negotiation = LinkNegotiation::OfferSent;
        self.links.insert(peer.clone(), link);

        self.transport
            .send(peer, envelope(sender_info, SignalBody::Offer { sdp }))
            .await?;
        tracing::debug!(peer = %peer, "Offer sent");
        Ok(true)
    }

    /// Apply a remote offer, drain queued candidates and answer it.
    ///
    /// Glare (both sides offered simultaneously) is resolved by a stable
    /// identity tie-break: the side with the lower peer id keeps the offerer
    /// role and drops the incoming offer; the other side discards its own
    /// outstanding offer and answers.
    ///
    /// # Errors
    ///
    /// Returns error if description handling or the answer send fails
    pub async fn apply_remote_offer(
        &mut self,
        peer: &PeerId,
        sdp: &str,
        sender_info: &PeerInfo,
    ) -> Result<OfferDisposition, LinkError> {
        if self.negotiation(peer) == Some(LinkNegotiation::OfferSent) {
            if self.local_id < *peer {
                tracing::warn!(peer = %peer, "Offer glare, keeping offerer role");
                return Ok(OfferDisposition::IgnoredGlare);
            }
            // We yield the offerer role: discard our attempt (keeping their
            // queued candidates) and renegotiate from their offer.
            tracing::warn!(peer = %peer, "Offer glare, yielding offerer role");
            if let Some(link) = self.links.remove(peer) {
                link.forwarder.abort();
                link.session.close().await;
            }
        }

        if !self.links.contains_key(peer) {
            let link = self.create_link(peer, sender_info).await?;
            self.links.insert(peer.clone(), link);
        }
        let link = self
            .links
            .get_mut(peer)
            .ok_or_else(|| LinkError::NoPendingNegotiation(peer.clone()))?;

        link.session.set_remote_description(sdp).await?;
        link.remote_set = true;

        Self::drain_queue(&mut self.queues, peer, link).await?;

        let answer = link.session.create_answer().await?;
        link.negotiation = LinkNegotiation::Connected;

        self.transport
            .send(peer, envelope(sender_info, SignalBody::Answer { sdp: answer }))
            .await?;
        tracing::debug!(peer = %peer, "Remote offer applied and answered");
        Ok(OfferDisposition::Answered)
    }

    /// Apply a remote answer to our outstanding offer and drain queued
    /// candidates.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NoPendingNegotiation`] if we never offered to
    /// this peer
    pub async fn apply_remote_answer(&mut self, peer: &PeerId, sdp: &str) -> Result<(), LinkError> {
        let link = self
            .links
            .get_mut(peer)
            .filter(|l| l.negotiation == LinkNegotiation::OfferSent)
            .ok_or_else(|| LinkError::NoPendingNegotiation(peer.clone()))?;

        link.session.set_remote_description(sdp).await?;
        link.remote_set = true;

        Self::drain_queue(&mut self.queues, peer, link).await?;

        link.negotiation = LinkNegotiation::Connected;
        tracing::debug!(peer = %peer, "Remote answer applied, link connected");
        Ok(())
    }

    /// Handle one remote candidate: apply directly once the peer's remote
    /// description is set, otherwise queue it in arrival order.
    ///
    /// # Errors
    ///
    /// Returns error if the media stack rejects a directly applied candidate
    pub async fn add_remote_candidate(
        &mut self,
        peer: &PeerId,
        candidate: IceCandidate,
    ) -> Result<(), LinkError> {
        match self.links.get(peer) {
            Some(link) if link.remote_set => {
                link.session.add_ice_candidate(&candidate).await?;
                tracing::trace!(peer = %peer, "Candidate applied directly");
            }
            _ => {
                self.queues.entry(peer.clone()).or_default().push(candidate);
                tracing::trace!(peer = %peer, "Candidate queued");
            }
        }
        Ok(())
    }

    /// Replace the outgoing video track on every open link.
    ///
    /// No renegotiation is performed; across some network-path changes the
    /// replacement can fail silently (known gap, inherited from the wire
    /// protocol's lack of an ICE-restart path).
    ///
    /// # Errors
    ///
    /// Returns error if the new capture cannot be opened; per-link
    /// replacement failures are logged and skipped
    pub async fn switch_camera(&mut self) -> Result<(), MediaError> {
        self.connector.switch_camera().await?;
        for (peer, link) in &self.links {
            if let Err(e) = link.session.replace_video_track().await {
                tracing::warn!(peer = %peer, error = %e, "Video track replacement failed");
            }
        }
        Ok(())
    }

    /// Close one link and drop its queued candidates.
    ///
    /// Returns whether a link existed. The caller decides whether zero
    /// remaining links means session teardown.
    pub async fn close_link(&mut self, peer: &PeerId) -> bool {
        self.queues.remove(peer);
        if let Some(link) = self.links.remove(peer) {
            link.forwarder.abort();
            link.session.close().await;
            tracing::debug!(peer = %peer, "Link closed");
            true
        } else {
            false
        }
    }

    /// Close every link and release the shared local media
    pub async fn close_all(&mut self) {
        let peers = self.peers();
        for peer in peers {
            self.close_link(&peer).await;
        }
        self.queues.clear();
        self.connector.release_local_media().await;
    }

    async fn create_link(
        &self,
        peer: &PeerId,
        sender_info: &PeerInfo,
    ) -> Result<PeerLink, LinkError> {
        let (session, mut candidates) = self.connector.open_session(peer).await?;
        tracing::debug!(peer = %peer, "Opened media session");

        // Locally discovered candidates are relayed off the state lock;
        // outbound sends never re-enter the manager.
        let transport = Arc::clone(&self.transport);
        let to = peer.clone();
        let info = sender_info.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                let env = envelope(&info, SignalBody::Candidate(candidate));
                if let Err(e) = transport.send(&to, env).await {
                    tracing::warn!(peer = %to, error = %e, "Failed to forward candidate");
                }
            }
        });

        Ok(PeerLink {
            session,
            negotiation: LinkNegotiation::OfferReceived,
            remote_set: false,
            forwarder,
        })
    }

    /// Flush queued candidates FIFO. Runs to completion under the owning
    /// lock, so no later candidate can interleave.
    async fn drain_queue(
        queues: &mut HashMap<PeerId, Vec<IceCandidate>>,
        peer: &PeerId,
        link: &mut PeerLink,
    ) -> Result<(), LinkError> {
        if let Some(queue) = queues.remove(peer) {
            let count = queue.len();
            for candidate in queue {
                link.session.add_ice_candidate(&candidate).await?;
            }
            if count > 0 {
                tracing::debug!(peer = %peer, count, "Drained candidate queue");
            }
        }
        Ok(())
    }
}

pub(crate) fn envelope(sender_info: &PeerInfo, body: SignalBody) -> SignalingEnvelope {
    SignalingEnvelope {
        sender_id: sender_info.id.clone(),
        sender_info: sender_info.clone(),
        body,
    }
}
