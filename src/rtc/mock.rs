//! In-memory peer transports for tests.
//!
//! `MockConnector` stands in for the WebRTC stack so session and registry
//! behavior can be exercised without OS networking: tests script the remote
//! side through [`MockPeerCtl`] (connect, open channels, inject frames, flip
//! phases) and observe everything the local side did.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

use crate::dispatch::{Event, EventQueue, SessionEvent};
use crate::session::{ChannelPump, ChannelSender, SessionRole};
use crate::signal::{Candidate, PeerId};

use super::{PeerConnector, PeerTransport, RtcError, RtcSettings, SdpKind, TransportPhase};

const WAIT_POLL: Duration = Duration::from_millis(5);

pub struct MockConnector {
    settings: RtcSettings,
    fail_next: AtomicBool,
    fail_remote_sdp: AtomicBool,
    peers: Mutex<HashMap<PeerId, Arc<MockPeerCtl>>>,
}

impl MockConnector {
    pub fn new(settings: RtcSettings) -> Arc<Self> {
        Arc::new(MockConnector {
            settings,
            fail_next: AtomicBool::new(false),
            fail_remote_sdp: AtomicBool::new(false),
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// The next `connect` call fails, exercising the create-failure path.
    pub fn fail_next_connect(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// The next transport rejects its first remote description, as a
    /// malformed SDP would be.
    pub fn fail_next_remote_sdp(&self) {
        self.fail_remote_sdp.store(true, Ordering::SeqCst);
    }

    pub fn peer(&self, peer: &PeerId) -> Option<Arc<MockPeerCtl>> {
        self.peers.lock().get(peer).cloned()
    }

    /// Polls until the runtime has created a transport for `peer`.
    pub async fn wait_for_peer(&self, peer: &PeerId, timeout: Duration) -> Arc<MockPeerCtl> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ctl) = self.peer(peer) {
                return ctl;
            }
            if Instant::now() >= deadline {
                panic!("no transport created for {peer}");
            }
            sleep(WAIT_POLL).await;
        }
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        peer: &PeerId,
        role: SessionRole,
        events: EventQueue,
    ) -> Result<Arc<dyn PeerTransport>, RtcError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RtcError::Setup("injected connect failure".into()));
        }
        let ctl = Arc::new(MockPeerCtl {
            peer: peer.clone(),
            role,
            settings: self.settings.clone(),
            events,
            // `connect` runs on the core's runtime; control methods called
            // from test threads spawn onto it through this handle.
            handle: tokio::runtime::Handle::current(),
            offers: Mutex::new(0),
            answers: Mutex::new(0),
            remote_descriptions: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(HashMap::new())),
            held_pumps: Mutex::new(Vec::new()),
            fail_remote_sdp: AtomicBool::new(self.fail_remote_sdp.swap(false, Ordering::SeqCst)),
            hold_writes: AtomicBool::new(false),
            ignore_close: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().insert(peer.clone(), ctl.clone());
        Ok(Arc::new(MockPeer { ctl }))
    }
}

/// Test-side handle for one mock transport.
pub struct MockPeerCtl {
    peer: PeerId,
    role: SessionRole,
    settings: RtcSettings,
    events: EventQueue,
    handle: tokio::runtime::Handle,
    offers: Mutex<u32>,
    answers: Mutex<u32>,
    remote_descriptions: Mutex<Vec<(SdpKind, String)>>,
    remote_candidates: Mutex<Vec<Candidate>>,
    sent: Arc<Mutex<HashMap<String, Vec<Bytes>>>>,
    held_pumps: Mutex<Vec<ChannelPump>>,
    fail_remote_sdp: AtomicBool,
    hold_writes: AtomicBool,
    ignore_close: AtomicBool,
    closed: AtomicBool,
}

impl MockPeerCtl {
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Next `set_remote_description` is rejected, as a malformed SDP would be.
    pub fn fail_remote_sdp(&self) {
        self.fail_remote_sdp.store(true, Ordering::SeqCst);
    }

    /// Stop draining outbound channel queues so backpressure builds up.
    pub fn hold_writes(&self) {
        self.hold_writes.store(true, Ordering::SeqCst);
    }

    /// `close` stops reporting a terminal phase, like a transport whose
    /// shutdown hangs; exercises the shutdown deadline.
    pub fn ignore_close(&self) {
        self.ignore_close.store(true, Ordering::SeqCst);
    }

    pub fn set_phase(&self, phase: TransportPhase) {
        self.events.post(Event::Session {
            peer: self.peer.clone(),
            event: SessionEvent::PhaseChanged { phase },
        });
    }

    /// Reports the transport connected and opens every configured channel,
    /// the way a completed ICE + SCTP handshake would.
    pub fn establish(&self) {
        self.set_phase(TransportPhase::Connected);
        self.open_channels();
    }

    pub fn open_channels(&self) {
        for label in self.settings.labels.all() {
            self.open_channel(label);
        }
    }

    pub fn open_channel(&self, label: &str) {
        let (sender, mut pump) = ChannelSender::pair(self.settings.channel_buffer_bytes);
        if self.hold_writes.load(Ordering::SeqCst) {
            self.held_pumps.lock().push(pump);
        } else {
            let sent = self.sent.clone();
            let label_owned = label.to_string();
            self.handle.spawn(async move {
                while let Some(frame) = pump.recv().await {
                    sent.lock()
                        .entry(label_owned.clone())
                        .or_default()
                        .push(frame.payload().clone());
                }
            });
        }
        self.events.post(Event::Session {
            peer: self.peer.clone(),
            event: SessionEvent::ChannelOpen {
                label: label.to_string(),
                sender,
            },
        });
    }

    pub fn close_channel(&self, label: &str) {
        self.events.post(Event::Session {
            peer: self.peer.clone(),
            event: SessionEvent::ChannelClosed {
                label: label.to_string(),
            },
        });
    }

    /// Emits a locally gathered candidate, as ICE gathering would.
    pub fn emit_local_candidate(&self, candidate: Candidate) {
        self.events.post(Event::Session {
            peer: self.peer.clone(),
            event: SessionEvent::LocalCandidate { candidate },
        });
    }

    /// Delivers an inbound frame as if the remote peer had sent it.
    pub fn inject_frame(&self, label: &str, payload: Bytes) {
        self.events.post(Event::Session {
            peer: self.peer.clone(),
            event: SessionEvent::Frame {
                label: label.to_string(),
                payload,
            },
        });
    }

    pub fn inject_error(&self, message: &str) {
        self.events.post(Event::Session {
            peer: self.peer.clone(),
            event: SessionEvent::TransportError {
                message: message.to_string(),
            },
        });
    }

    pub fn trigger_renegotiation(&self) {
        self.events.post(Event::Session {
            peer: self.peer.clone(),
            event: SessionEvent::RenegotiationNeeded,
        });
    }

    /// Frames written by the local side on `label`, oldest first.
    pub fn sent(&self, label: &str) -> Vec<Bytes> {
        self.sent.lock().get(label).cloned().unwrap_or_default()
    }

    pub async fn wait_sent(&self, label: &str, count: usize, timeout: Duration) -> Vec<Bytes> {
        let deadline = Instant::now() + timeout;
        loop {
            let frames = self.sent(label);
            if frames.len() >= count {
                return frames;
            }
            if Instant::now() >= deadline {
                panic!(
                    "expected {count} frames on {label}, saw {} within {timeout:?}",
                    frames.len()
                );
            }
            sleep(WAIT_POLL).await;
        }
    }

    pub fn offer_count(&self) -> u32 {
        *self.offers.lock()
    }

    pub fn answer_count(&self) -> u32 {
        *self.answers.lock()
    }

    pub fn remote_descriptions(&self) -> Vec<(SdpKind, String)> {
        self.remote_descriptions.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<Candidate> {
        self.remote_candidates.lock().clone()
    }

    pub async fn wait_remote_candidates(&self, count: usize, timeout: Duration) -> Vec<Candidate> {
        let deadline = Instant::now() + timeout;
        loop {
            let candidates = self.remote_candidates();
            if candidates.len() >= count {
                return candidates;
            }
            if Instant::now() >= deadline {
                panic!(
                    "expected {count} remote candidates, saw {} within {timeout:?}",
                    candidates.len()
                );
            }
            sleep(WAIT_POLL).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockPeer {
    ctl: Arc<MockPeerCtl>,
}

#[async_trait]
impl PeerTransport for MockPeer {
    async fn create_offer(&self) -> Result<String, RtcError> {
        let mut offers = self.ctl.offers.lock();
        *offers += 1;
        Ok(format!("offer-sdp:{}:{}", self.ctl.peer, *offers))
    }

    async fn create_answer(&self) -> Result<String, RtcError> {
        let mut answers = self.ctl.answers.lock();
        *answers += 1;
        Ok(format!("answer-sdp:{}:{}", self.ctl.peer, *answers))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), RtcError> {
        if self.ctl.fail_remote_sdp.swap(false, Ordering::SeqCst) {
            return Err(RtcError::Sdp("unparsable session description".into()));
        }
        self.ctl
            .remote_descriptions
            .lock()
            .push((kind, sdp.to_string()));
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), RtcError> {
        self.ctl.remote_candidates.lock().push(candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        if !self.ctl.closed.swap(true, Ordering::SeqCst)
            && !self.ctl.ignore_close.load(Ordering::SeqCst)
        {
            self.ctl.set_phase(TransportPhase::Closed);
        }
    }
}
