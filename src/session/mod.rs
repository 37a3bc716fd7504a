//! Per-peer session state.
//!
//! A `Session` is owned exclusively by the dispatcher worker; nothing here is
//! locked. The only pieces shared with application threads are the
//! [`ChannelSender`] handles published through the [`ShareMap`], which carry
//! their own bounded byte accounting so `send` stays non-blocking.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::rtc::{PeerTransport, TransportPhase};
use crate::signal::{Candidate, PeerId};

/// Which side of the handshake this session plays, fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    Offerer,
    Answerer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    New,
    LocalOffered,
    RemoteOffered,
    LocalAnswered,
    RemoteAnswered,
    Stable,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closed,
}

/// Non-fatal outcome of `send`; `Ok(())` means the frame was accepted into
/// the channel queue.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("channel is not open")]
    ChannelNotReady,
    #[error("channel send buffer is full")]
    Backpressure,
    #[error("peer is gone")]
    PeerGone,
}

/// Outbound frame handed to a transport pump. The buffered-byte accounting
/// is released when the frame is dropped, i.e. after the transport write.
pub struct OutboundFrame {
    payload: Bytes,
    buffered: Arc<AtomicUsize>,
}

impl OutboundFrame {
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl Drop for OutboundFrame {
    fn drop(&mut self) {
        self.buffered.fetch_sub(self.payload.len(), Ordering::AcqRel);
    }
}

/// Multi-producer handle for one open data channel.
#[derive(Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    buffered: Arc<AtomicUsize>,
    capacity: usize,
}

impl ChannelSender {
    /// Builds the sender and its pump end with a buffered-bytes cap.
    pub fn pair(capacity: usize) -> (ChannelSender, ChannelPump) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        (
            ChannelSender {
                tx,
                buffered: buffered.clone(),
                capacity,
            },
            ChannelPump { rx },
        )
    }

    pub fn send(&self, payload: Bytes) -> Result<(), SendError> {
        let len = payload.len();
        let before = self.buffered.fetch_add(len, Ordering::AcqRel);
        if before + len > self.capacity {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return Err(SendError::Backpressure);
        }
        let frame = OutboundFrame {
            payload,
            buffered: self.buffered.clone(),
        };
        self.tx.send(frame).map_err(|_| SendError::PeerGone)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }
}

/// Consumer end driven by the transport's writer task.
pub struct ChannelPump {
    rx: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl ChannelPump {
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.rx.try_recv().ok()
    }
}

/// Read snapshot of one peer as seen by application threads.
#[derive(Clone, Default)]
pub struct PeerShare {
    pub connected: bool,
    pub channels: HashMap<String, ChannelSender>,
}

/// Shared index of live peers. Written only by the dispatcher worker; read
/// by `send`/`broadcast` on application threads.
pub type ShareMap = Arc<RwLock<HashMap<PeerId, PeerShare>>>;

pub fn new_share_map() -> ShareMap {
    Arc::new(RwLock::new(HashMap::new()))
}

pub fn send_via(
    share: &ShareMap,
    peer: &PeerId,
    label: &str,
    payload: Bytes,
) -> Result<(), SendError> {
    let guard = share.read();
    let entry = guard.get(peer).ok_or(SendError::PeerGone)?;
    let sender = entry.channels.get(label).ok_or(SendError::ChannelNotReady)?;
    sender.send(payload)
}

/// Fans a frame out to every currently connected peer; per-peer failures are
/// collected, not propagated.
pub fn broadcast_via(
    share: &ShareMap,
    label: &str,
    payload: &Bytes,
) -> Vec<(PeerId, Result<(), SendError>)> {
    let snapshot: Vec<(PeerId, Option<ChannelSender>)> = {
        let guard = share.read();
        guard
            .iter()
            .filter(|(_, entry)| entry.connected)
            .map(|(peer, entry)| (peer.clone(), entry.channels.get(label).cloned()))
            .collect()
    };
    snapshot
        .into_iter()
        .map(|(peer, sender)| {
            let result = match sender {
                Some(sender) => sender.send(payload.clone()),
                None => Err(SendError::ChannelNotReady),
            };
            (peer, result)
        })
        .collect()
}

/// Worker-owned state for one remote peer.
pub struct Session {
    pub peer: PeerId,
    pub role: SessionRole,
    pub handshake: HandshakeState,
    pub phase: TransportPhase,
    pub transport: Option<Arc<dyn PeerTransport>>,
    pub channels: HashMap<String, ChannelState>,
    pub senders: HashMap<String, ChannelSender>,
    /// Remote candidates that arrived before the remote description.
    pub pending_remote_candidates: VecDeque<Candidate>,
    /// Offer buffered while the transport is still being created.
    pub pending_remote_offer: Option<String>,
    pub remote_applied: bool,
    pub last_rx: Instant,
    pub attempts: u32,
    pub peer_up: bool,
    pub closing: bool,
    pub close_reason: Option<String>,
    pub heartbeat_nonce: u64,
    /// Bumps on every disconnect so a stale grace timer cannot close a
    /// session that recovered in the meantime.
    pub disconnect_epoch: u64,
}

impl Session {
    pub fn new(peer: PeerId, role: SessionRole, now: Instant) -> Self {
        Session {
            peer,
            role,
            handshake: HandshakeState::New,
            phase: TransportPhase::New,
            transport: None,
            channels: HashMap::new(),
            senders: HashMap::new(),
            pending_remote_candidates: VecDeque::new(),
            pending_remote_offer: None,
            remote_applied: false,
            last_rx: now,
            attempts: 0,
            peer_up: false,
            closing: false,
            close_reason: None,
            heartbeat_nonce: 0,
            disconnect_epoch: 0,
        }
    }

    pub fn note_frame(&mut self, now: Instant) {
        self.last_rx = now;
    }

    pub fn next_nonce(&mut self) -> u64 {
        self.heartbeat_nonce += 1;
        self.heartbeat_nonce
    }

    pub fn mark_channels_opening<'a>(&mut self, labels: impl IntoIterator<Item = &'a str>) {
        for label in labels {
            self.channels.insert(label.to_string(), ChannelState::Opening);
        }
    }

    pub fn open_channel(&mut self, label: &str, sender: ChannelSender) {
        self.channels.insert(label.to_string(), ChannelState::Open);
        self.senders.insert(label.to_string(), sender);
    }

    pub fn close_channel(&mut self, label: &str) {
        self.channels.insert(label.to_string(), ChannelState::Closed);
        self.senders.remove(label);
    }

    pub fn buffer_candidate(&mut self, candidate: Candidate) {
        self.pending_remote_candidates.push_back(candidate);
    }

    /// Drains buffered remote candidates in arrival order; they are applied
    /// exactly once, right after the remote description lands.
    pub fn take_pending_candidates(&mut self) -> Vec<Candidate> {
        self.pending_remote_candidates.drain(..).collect()
    }

    /// Renegotiation: back to square one without tearing the transport down.
    pub fn restart_handshake(&mut self) {
        self.handshake = HandshakeState::New;
        self.remote_applied = false;
        self.attempts += 1;
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_rx)
    }

    pub fn liveness_expired(&self, now: Instant, interval: Duration, multiplier: u32) -> bool {
        self.silent_for(now) > interval * multiplier
    }

    pub fn is_closed(&self) -> bool {
        self.closing || self.handshake == HandshakeState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sender_enforces_backpressure() {
        let (sender, mut pump) = ChannelSender::pair(8);
        sender.send(Bytes::from_static(b"12345")).unwrap();
        assert_eq!(
            sender.send(Bytes::from_static(b"6789a")),
            Err(SendError::Backpressure)
        );

        // Accounting is released only once the pump finishes with the frame.
        let frame = pump.try_recv().expect("queued frame");
        assert_eq!(sender.buffered_bytes(), 5);
        drop(frame);
        assert_eq!(sender.buffered_bytes(), 0);
        sender.send(Bytes::from_static(b"6789a")).unwrap();
    }

    #[test]
    fn channel_sender_reports_gone_peer() {
        let (sender, pump) = ChannelSender::pair(64);
        drop(pump);
        assert_eq!(
            sender.send(Bytes::from_static(b"x")),
            Err(SendError::PeerGone)
        );
    }

    #[test]
    fn send_via_distinguishes_gone_and_not_ready() {
        let share = new_share_map();
        let peer = PeerId::from("v1");
        assert_eq!(
            send_via(&share, &peer, "control", Bytes::from_static(b"x")),
            Err(SendError::PeerGone)
        );

        share.write().insert(peer.clone(), PeerShare::default());
        assert_eq!(
            send_via(&share, &peer, "control", Bytes::from_static(b"x")),
            Err(SendError::ChannelNotReady)
        );
    }

    #[test]
    fn broadcast_skips_disconnected_peers() {
        let share = new_share_map();
        let (sender, _pump) = ChannelSender::pair(64);
        share.write().insert(
            PeerId::from("c1"),
            PeerShare {
                connected: true,
                channels: HashMap::from([("telemetry".to_string(), sender)]),
            },
        );
        share.write().insert(
            PeerId::from("c2"),
            PeerShare {
                connected: false,
                channels: HashMap::new(),
            },
        );

        let results = broadcast_via(&share, "telemetry", &Bytes::from_static(b"t"));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, PeerId::from("c1"));
        assert!(results[0].1.is_ok());
    }

    #[test]
    fn candidates_flush_in_arrival_order() {
        let mut session = Session::new(PeerId::from("v1"), SessionRole::Offerer, Instant::now());
        for index in 0..3 {
            session.buffer_candidate(Candidate {
                mid: "0".into(),
                mline_index: index,
                sdp: format!("candidate:{index}"),
            });
        }
        let drained = session.take_pending_candidates();
        let indexes: Vec<i32> = drained.iter().map(|c| c.mline_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert!(session.take_pending_candidates().is_empty());
    }

    #[test]
    fn liveness_expiry_uses_interval_times_multiplier() {
        let start = Instant::now();
        let session = Session::new(PeerId::from("v1"), SessionRole::Offerer, start);
        let interval = Duration::from_millis(100);
        assert!(!session.liveness_expired(start + Duration::from_millis(250), interval, 3));
        assert!(session.liveness_expired(start + Duration::from_millis(301), interval, 3));
    }

    #[test]
    fn restart_counts_attempts() {
        let mut session = Session::new(PeerId::from("v1"), SessionRole::Offerer, Instant::now());
        session.handshake = HandshakeState::Stable;
        session.remote_applied = true;
        session.restart_handshake();
        assert_eq!(session.handshake, HandshakeState::New);
        assert!(!session.remote_applied);
        assert_eq!(session.attempts, 1);
    }
}
