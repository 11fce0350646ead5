//! Shared mocks for module tests

#![allow(clippy::unwrap_used)]

use crate::media::{MediaConnector, MediaError, MediaSession};
use crate::messaging::{ChatError, HistoryStore, MessageTransport};
use crate::signaling::{SignalError, SignalingEnvelope, SignalingTransport};
use crate::types::{CallType, HistoryPage, IceCandidate, OutboundChat, PeerId, RoomId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Signaling transport that records every envelope it is asked to send.
pub struct RecordingSignalTransport {
    pub sent: Mutex<Vec<(PeerId, SignalingEnvelope)>>,
    pub ready: AtomicBool,
    pub reconnect_requests: AtomicUsize,
}

impl RecordingSignalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            ready: AtomicBool::new(true),
            reconnect_requests: AtomicUsize::new(0),
        })
    }

    pub fn kinds_to(&self, peer: &PeerId) -> Vec<&'static str> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == peer)
            .map(|(_, env)| env.body.kind())
            .collect()
    }

    pub fn all_kinds(&self) -> Vec<&'static str> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, env)| env.body.kind())
            .collect()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.all_kinds().iter().filter(|k| **k == kind).count()
    }
}

#[async_trait]
impl SignalingTransport for RecordingSignalTransport {
    async fn send(&self, to: &PeerId, envelope: SignalingEnvelope) -> Result<(), SignalError> {
        self.sent.lock().unwrap().push((to.clone(), envelope));
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn request_reconnect(&self) {
        self.reconnect_requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Route `tracing` output through the test harness so it lands with the
/// owning test when run with `--nocapture`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Inspection state shared between a mock session and the test.
#[derive(Default)]
pub struct SessionProbe {
    pub remote_sdp: Mutex<Option<String>>,
    pub applied_candidates: Mutex<Vec<IceCandidate>>,
    pub offers_created: AtomicUsize,
    pub answers_created: AtomicUsize,
    pub video_replacements: AtomicUsize,
    pub closed: AtomicBool,
    pub fail_answer: AtomicBool,
}

struct MockSession {
    peer: PeerId,
    probe: Arc<SessionProbe>,
}

#[async_trait]
impl MediaSession for MockSession {
    async fn create_offer(&self) -> Result<String, MediaError> {
        self.probe.offers_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("offer-sdp-for-{}", self.peer))
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        if self.probe.remote_sdp.lock().unwrap().is_none() {
            return Err(MediaError::Sdp("answer before remote description".into()));
        }
        if self.probe.fail_answer.load(Ordering::SeqCst) {
            return Err(MediaError::Sdp("scripted answer failure".into()));
        }
        self.probe.answers_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("answer-sdp-for-{}", self.peer))
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), MediaError> {
        *self.probe.remote_sdp.lock().unwrap() = Some(sdp.to_string());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        // Enforces the ordering contract: candidates only after the remote
        // description is set.
        if self.probe.remote_sdp.lock().unwrap().is_none() {
            return Err(MediaError::Sdp("candidate before remote description".into()));
        }
        self.probe
            .applied_candidates
            .lock()
            .unwrap()
            .push(candidate.clone());
        Ok(())
    }

    async fn replace_video_track(&self) -> Result<(), MediaError> {
        self.probe.video_replacements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.probe.closed.store(true, Ordering::SeqCst);
    }
}

/// Media connector with scripted behavior and full inspection.
pub struct ScriptedMedia {
    pub deny_media: AtomicBool,
    pub fail_answers: AtomicBool,
    pub acquisitions: AtomicUsize,
    pub releases: AtomicUsize,
    pub camera_switches: AtomicUsize,
    pub audio_enabled: Mutex<Option<bool>>,
    pub video_enabled: Mutex<Option<bool>>,
    probes: Mutex<HashMap<PeerId, Arc<SessionProbe>>>,
    candidate_txs: Mutex<HashMap<PeerId, mpsc::Sender<IceCandidate>>>,
}

impl ScriptedMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deny_media: AtomicBool::new(false),
            fail_answers: AtomicBool::new(false),
            acquisitions: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            camera_switches: AtomicUsize::new(0),
            audio_enabled: Mutex::new(None),
            video_enabled: Mutex::new(None),
            probes: Mutex::new(HashMap::new()),
            candidate_txs: Mutex::new(HashMap::new()),
        })
    }

    /// Inspection handle for the session opened toward `peer`.
    pub fn probe(&self, peer: &PeerId) -> Arc<SessionProbe> {
        self.probes.lock().unwrap().get(peer).unwrap().clone()
    }

    pub fn has_session(&self, peer: &PeerId) -> bool {
        self.probes.lock().unwrap().contains_key(peer)
    }

    /// Feed a locally discovered candidate into the session's channel.
    pub async fn inject_local_candidate(&self, peer: &PeerId, candidate: IceCandidate) {
        let tx = self.candidate_txs.lock().unwrap().get(peer).unwrap().clone();
        tx.send(candidate).await.unwrap();
    }
}

#[async_trait]
impl MediaConnector for ScriptedMedia {
    async fn acquire_local_media(&self, _call_type: CallType) -> Result<(), MediaError> {
        if self.deny_media.load(Ordering::SeqCst) {
            return Err(MediaError::AccessDenied("user dismissed prompt".into()));
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release_local_media(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    async fn open_session(
        &self,
        peer: &PeerId,
    ) -> Result<(Box<dyn MediaSession>, mpsc::Receiver<IceCandidate>), MediaError> {
        let probe = Arc::new(SessionProbe::default());
        probe
            .fail_answer
            .store(self.fail_answers.load(Ordering::SeqCst), Ordering::SeqCst);
        self.probes.lock().unwrap().insert(peer.clone(), probe.clone());
        let (tx, rx) = mpsc::channel(16);
        self.candidate_txs.lock().unwrap().insert(peer.clone(), tx);
        Ok((
            Box::new(MockSession {
                peer: peer.clone(),
                probe,
            }),
            rx,
        ))
    }

    async fn set_audio_enabled(&self, enabled: bool) {
        *self.audio_enabled.lock().unwrap() = Some(enabled);
    }

    async fn set_video_enabled(&self, enabled: bool) {
        *self.video_enabled.lock().unwrap() = Some(enabled);
    }

    async fn switch_camera(&self) -> Result<(), MediaError> {
        self.camera_switches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Chat transport that records outbound frames and can be told to fail.
pub struct RecordingChatTransport {
    pub sent: Mutex<Vec<OutboundChat>>,
    pub fail_sends: AtomicBool,
}

impl RecordingChatTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MessageTransport for RecordingChatTransport {
    async fn send_chat(&self, chat: OutboundChat) -> Result<(), ChatError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChatError::Transport("socket closed".into()));
        }
        self.sent.lock().unwrap().push(chat);
        Ok(())
    }
}

/// History store serving pre-scripted pages in order.
pub struct ScriptedHistory {
    pages: Mutex<VecDeque<Result<HistoryPage, String>>>,
    pub requests: Mutex<Vec<(RoomId, Option<String>, u32)>>,
}

impl ScriptedHistory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push_page(&self, page: HistoryPage) {
        self.pages.lock().unwrap().push_back(Ok(page));
    }

    pub fn push_error(&self, message: &str) {
        self.pages.lock().unwrap().push_back(Err(message.to_string()));
    }
}

#[async_trait]
impl HistoryStore for ScriptedHistory {
    async fn fetch(
        &self,
        room_id: RoomId,
        cursor: Option<String>,
        page_size: u32,
    ) -> Result<HistoryPage, ChatError> {
        self.requests
            .lock()
            .unwrap()
            .push((room_id, cursor, page_size));
        match self.pages.lock().unwrap().pop_front() {
            Some(Ok(page)) => Ok(page),
            Some(Err(msg)) => Err(ChatError::History(msg)),
            None => Ok(HistoryPage {
                records: Vec::new(),
                next_cursor: None,
                has_more: false,
            }),
        }
    }
}
