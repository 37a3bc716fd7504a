//! The session registry: the dispatcher worker's state and event handling.
//!
//! Owns every [`Session`] and is the only code that mutates one. All inputs
//! arrive as events on the dispatcher queue: decoded envelopes from the
//! link, transport callbacks keyed by peer id, liveness ticks, and
//! application commands. Handshake operations against a transport are async,
//! so the worker spawns them and consumes their completions as further
//! events; handling an event never blocks the queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::time::sleep;

use crate::config::{ChannelLabels, CoreConfig, HeartbeatConfig};
use crate::dispatch::{
    Command, CoreEvent, Event, EventQueue, FatalKind, HandlerTable, LinkEvent, SessionEvent,
};
use crate::link::Link;
use crate::rtc::{PeerConnector, PeerTransport, SdpKind, TransportPhase};
use crate::session::{ChannelSender, HandshakeState, PeerShare, Session, SessionRole, ShareMap};
use crate::signal::{Candidate, Envelope, EnvelopeKind, PeerId};
use crate::telemetry::logging::frame_preview;

/// How long a transport may sit in `Disconnected` before the session closes.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

const HEARTBEAT_PING: &[u8] = b"ping";
const HEARTBEAT_PONG: &[u8] = b"pong";

#[derive(Clone, Debug)]
pub struct RegistrySettings {
    pub local_id: PeerId,
    pub labels: ChannelLabels,
    pub heartbeat: HeartbeatConfig,
    pub shutdown_deadline: Duration,
}

impl RegistrySettings {
    pub fn from_core(config: &CoreConfig) -> Self {
        RegistrySettings {
            local_id: config.local_id.clone(),
            labels: config.channels.clone(),
            heartbeat: config.heartbeat.clone(),
            shutdown_deadline: config.shutdown_deadline,
        }
    }
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Stopping {
    done: Vec<std::sync::mpsc::Sender<()>>,
    link_close_requested: bool,
}

pub struct Registry {
    settings: RegistrySettings,
    connector: Arc<dyn PeerConnector>,
    link: Arc<dyn Link>,
    events: EventQueue,
    handlers: HandlerTable,
    share: ShareMap,
    sessions: HashMap<PeerId, Session>,
    stopping: Option<Stopping>,
    failed: bool,
}

impl Registry {
    pub fn new(
        settings: RegistrySettings,
        connector: Arc<dyn PeerConnector>,
        link: Arc<dyn Link>,
        events: EventQueue,
        handlers: HandlerTable,
        share: ShareMap,
    ) -> Self {
        Registry {
            settings,
            connector,
            link,
            events,
            handlers,
            share,
            sessions: HashMap::new(),
            stopping: None,
            failed: false,
        }
    }

    /// The worker loop. Exits once the stop sequence (or a fatal error) has
    /// run its course.
    pub async fn run(mut self, mut rx: crate::dispatch::EventRx) {
        tracing::debug!(target: "registry", local_id = %self.settings.local_id, "worker running");
        while let Some(event) = rx.next().await {
            if self.handle(event) == Flow::Stop {
                break;
            }
        }
        tracing::debug!(target: "registry", local_id = %self.settings.local_id, "worker stopped");
    }

    fn handle(&mut self, event: Event) -> Flow {
        match event {
            Event::Link(event) => self.on_link(event),
            Event::Session { peer, event } => {
                self.on_session(peer, event);
                Flow::Continue
            }
            Event::Tick => {
                self.on_tick();
                Flow::Continue
            }
            Event::Command(command) => self.on_command(command),
            Event::ShutdownDeadline => self.on_shutdown_deadline(),
            Event::Fatal(kind) => self.on_fatal(kind),
        }
    }

    fn deliver(&self, event: CoreEvent) {
        self.handlers.deliver(event);
    }

    // --- link events ---

    fn on_link(&mut self, event: LinkEvent) -> Flow {
        match event {
            LinkEvent::Opened => {
                // Announce presence in the realm; the service fans it out.
                self.link.send(Envelope::join(self.settings.local_id.clone()));
                self.deliver(CoreEvent::LinkUp);
                Flow::Continue
            }
            LinkEvent::Closed { reason } => {
                if let Some(stopping) = &mut self.stopping {
                    if stopping.link_close_requested {
                        return self.finish_stop();
                    }
                    // A stray drop while sessions are still draining; the
                    // explicit close comes once they are gone.
                    return Flow::Continue;
                }
                self.deliver(CoreEvent::LinkDown { reason });
                Flow::Continue
            }
            LinkEvent::Error { message } => {
                self.deliver(CoreEvent::LinkError { message });
                Flow::Continue
            }
            LinkEvent::Envelope(envelope) => {
                self.route(envelope);
                Flow::Continue
            }
        }
    }

    /// Envelope routing by sender id, mirroring the signaling contract:
    /// offers may create sessions, answers and candidates may not.
    fn route(&mut self, envelope: Envelope) {
        if let Some(to) = &envelope.to {
            if *to != self.settings.local_id {
                tracing::trace!(
                    target: "registry",
                    to = %to,
                    "dropping envelope addressed elsewhere"
                );
                return;
            }
        }
        let peer = envelope.from.clone();
        if peer == self.settings.local_id {
            return;
        }

        match envelope.kind {
            EnvelopeKind::Offer => {
                if let Some(sdp) = envelope.sdp {
                    self.on_remote_offer(peer, sdp);
                }
            }
            EnvelopeKind::Answer => {
                if let Some(sdp) = envelope.sdp {
                    self.on_remote_answer(peer, sdp);
                }
            }
            EnvelopeKind::Candidate => {
                if let Some(candidate) = envelope.candidate {
                    self.on_remote_candidate(peer, candidate);
                }
            }
            EnvelopeKind::Leave => {
                let reason = envelope.reason.unwrap_or_else(|| "peer_left".into());
                self.close_session(&peer, &reason);
            }
            EnvelopeKind::Heartbeat => {
                if let Some(session) = self.sessions.get_mut(&peer) {
                    session.note_frame(Instant::now());
                }
            }
            EnvelopeKind::Join => {
                tracing::debug!(target: "registry", peer = %peer, "peer joined the realm");
            }
            EnvelopeKind::Error => {
                let message = envelope.reason.unwrap_or_else(|| "signaling error".into());
                self.deliver(CoreEvent::PeerError { peer, message });
            }
            EnvelopeKind::Unknown(kind) => {
                tracing::warn!(
                    target: "registry",
                    peer = %peer,
                    kind = %kind,
                    "dropping signal of unknown kind"
                );
            }
        }
    }

    fn on_remote_offer(&mut self, peer: PeerId, sdp: String) {
        if self.stopping.is_some() || self.failed {
            return;
        }
        match self.sessions.get_mut(&peer) {
            None => {
                tracing::info!(target: "registry", peer = %peer, "remote offer; creating answerer session");
                let mut session = Session::new(peer.clone(), SessionRole::Answerer, Instant::now());
                session.pending_remote_offer = Some(sdp);
                self.install_session(session);
                self.spawn_create(peer, SessionRole::Answerer);
            }
            Some(session) => {
                if session.closing {
                    return;
                }
                match session.transport.clone() {
                    Some(transport) => {
                        self.spawn_set_remote(peer, transport, SdpKind::Offer, sdp);
                    }
                    None => {
                        // Transport creation still in flight; newest offer wins.
                        session.pending_remote_offer = Some(sdp);
                    }
                }
            }
        }
    }

    fn on_remote_answer(&mut self, peer: PeerId, sdp: String) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            tracing::warn!(target: "registry", peer = %peer, "answer from unknown peer");
            self.deliver(CoreEvent::PeerError {
                peer,
                message: "answer from unknown peer".into(),
            });
            return;
        };
        if session.closing {
            return;
        }
        if session.handshake != HandshakeState::LocalOffered {
            tracing::warn!(
                target: "registry",
                peer = %peer,
                state = ?session.handshake,
                "unexpected answer; dropping"
            );
            return;
        }
        match session.transport.clone() {
            Some(transport) => self.spawn_set_remote(peer, transport, SdpKind::Answer, sdp),
            None => {
                tracing::warn!(target: "registry", peer = %peer, "answer before transport; dropping");
            }
        }
    }

    fn on_remote_candidate(&mut self, peer: PeerId, candidate: Candidate) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            tracing::warn!(target: "registry", peer = %peer, "candidate from unknown peer");
            self.deliver(CoreEvent::PeerError {
                peer,
                message: "candidate from unknown peer".into(),
            });
            return;
        };
        if session.closing {
            return;
        }
        if !candidate.is_well_formed() {
            tracing::warn!(target: "registry", peer = %peer, "dropping malformed candidate");
            self.deliver(CoreEvent::PeerError {
                peer,
                message: "malformed candidate".into(),
            });
            return;
        }
        if session.remote_applied {
            if let Some(transport) = session.transport.clone() {
                self.spawn_add_candidates(peer, transport, vec![candidate]);
            }
        } else {
            // Held until the remote description lands, then applied in
            // arrival order.
            session.buffer_candidate(candidate);
        }
    }

    // --- session events ---

    fn on_session(&mut self, peer: PeerId, event: SessionEvent) {
        if !self.sessions.contains_key(&peer) {
            // A dropped peer id is a no-op, except that a transport built
            // for a session that died in the meantime must not leak.
            match event {
                SessionEvent::TransportReady { transport } => {
                    tokio::spawn(async move { transport.close().await });
                }
                other => {
                    tracing::trace!(
                        target: "registry",
                        peer = %peer,
                        event = other.name(),
                        "event for unknown peer"
                    );
                }
            }
            return;
        }
        match event {
            SessionEvent::TransportReady { transport } => self.on_transport_ready(peer, transport),
            SessionEvent::TransportCreateFailed { error } => {
                tracing::warn!(target: "registry", peer = %peer, error = %error, "transport creation failed");
                self.close_session(&peer, "transport_create_failed");
            }
            SessionEvent::LocalOffer { sdp } => self.on_local_description(peer, SdpKind::Offer, sdp),
            SessionEvent::LocalAnswer { sdp } => {
                self.on_local_description(peer, SdpKind::Answer, sdp)
            }
            SessionEvent::RemoteApplied { kind } => self.on_remote_applied(peer, kind),
            SessionEvent::RemoteRejected { kind, error } => {
                tracing::warn!(
                    target: "registry",
                    peer = %peer,
                    ?kind,
                    error = %error,
                    "remote description rejected"
                );
                // The session keeps its prior state; the peer may retry.
                self.deliver(CoreEvent::PeerError {
                    peer,
                    message: "bad_sdp".into(),
                });
            }
            SessionEvent::HandshakeFailed { stage, error } => {
                tracing::warn!(target: "registry", peer = %peer, stage, error = %error, "handshake failed");
                self.close_session(&peer, "handshake_failed");
            }
            SessionEvent::LocalCandidate { candidate } => self.on_local_candidate(peer, candidate),
            SessionEvent::PhaseChanged { phase } => self.on_phase_changed(peer, phase),
            SessionEvent::ChannelOpen { label, sender } => self.on_channel_open(peer, label, sender),
            SessionEvent::ChannelClosed { label } => self.on_channel_closed(peer, label),
            SessionEvent::Frame { label, payload } => self.on_frame(peer, label, payload),
            SessionEvent::GraceExpired { epoch } => self.on_grace_expired(peer, epoch),
            SessionEvent::RenegotiationNeeded => self.on_renegotiation(peer),
            SessionEvent::TransportError { message } => {
                self.deliver(CoreEvent::PeerError { peer, message });
            }
        }
    }

    fn on_transport_ready(&mut self, peer: PeerId, transport: Arc<dyn PeerTransport>) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        if session.closing {
            tokio::spawn(async move { transport.close().await });
            return;
        }
        session.transport = Some(transport.clone());
        match session.role {
            SessionRole::Offerer => {
                let labels: Vec<String> =
                    self.settings.labels.all().iter().map(|l| l.to_string()).collect();
                session.mark_channels_opening(labels.iter().map(|l| l.as_str()));
                self.spawn_create_offer(peer, transport);
            }
            SessionRole::Answerer => {
                if let Some(sdp) = session.pending_remote_offer.take() {
                    self.spawn_set_remote(peer, transport, SdpKind::Offer, sdp);
                }
            }
        }
    }

    fn on_local_description(&mut self, peer: PeerId, kind: SdpKind, sdp: String) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        if session.closing {
            return;
        }
        match kind {
            SdpKind::Offer => {
                session.handshake = HandshakeState::LocalOffered;
                self.link.send(Envelope::offer(
                    self.settings.local_id.clone(),
                    peer.clone(),
                    sdp,
                ));
            }
            SdpKind::Answer => {
                // A renegotiation answers over an already-confirmed
                // transport; only a first handshake waits for it.
                session.handshake = if session.phase == TransportPhase::Connected {
                    HandshakeState::Stable
                } else {
                    HandshakeState::LocalAnswered
                };
                self.link.send(Envelope::answer(
                    self.settings.local_id.clone(),
                    peer.clone(),
                    sdp,
                ));
            }
        }
        tracing::debug!(target: "registry", peer = %peer, ?kind, "local description sent");
    }

    fn on_remote_applied(&mut self, peer: PeerId, kind: SdpKind) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        if session.closing {
            return;
        }
        session.remote_applied = true;
        let buffered = session.take_pending_candidates();
        let transport = session.transport.clone();
        match kind {
            SdpKind::Offer => {
                session.handshake = HandshakeState::RemoteOffered;
            }
            SdpKind::Answer => {
                session.handshake = HandshakeState::Stable;
            }
        }
        if let Some(transport) = transport.clone() {
            if !buffered.is_empty() {
                tracing::debug!(
                    target: "registry",
                    peer = %peer,
                    count = buffered.len(),
                    "flushing buffered remote candidates"
                );
                self.spawn_add_candidates(peer.clone(), transport, buffered);
            }
        }
        if kind == SdpKind::Offer {
            if let Some(transport) = transport {
                self.spawn_create_answer(peer, transport);
            }
        }
    }

    fn on_local_candidate(&mut self, peer: PeerId, candidate: Candidate) {
        let Some(session) = self.sessions.get(&peer) else {
            return;
        };
        // Candidates stop at closure; none may escape a closed session.
        if session.is_closed() {
            return;
        }
        self.link.send(Envelope::candidate(
            self.settings.local_id.clone(),
            peer,
            candidate,
        ));
    }

    fn on_phase_changed(&mut self, peer: PeerId, phase: TransportPhase) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        let previous = session.phase;
        session.phase = phase;
        if previous != phase {
            tracing::debug!(target: "registry", peer = %peer, ?previous, ?phase, "transport phase");
        }
        match phase {
            TransportPhase::Connected => {
                if session.handshake == HandshakeState::LocalAnswered {
                    session.handshake = HandshakeState::Stable;
                }
                session.note_frame(Instant::now());
                if let Some(entry) = self.share.write().get_mut(&peer) {
                    entry.connected = true;
                }
                self.mark_peer_up(&peer);
            }
            TransportPhase::Disconnected => {
                if let Some(entry) = self.share.write().get_mut(&peer) {
                    entry.connected = false;
                }
                session.disconnect_epoch += 1;
                let epoch = session.disconnect_epoch;
                let events = self.events.clone();
                let grace_peer = peer.clone();
                tokio::spawn(async move {
                    sleep(DISCONNECT_GRACE).await;
                    events.post(Event::Session {
                        peer: grace_peer,
                        event: SessionEvent::GraceExpired { epoch },
                    });
                });
            }
            TransportPhase::Failed => {
                self.close_session(&peer, "transport_failed");
            }
            TransportPhase::Closed => {
                if !session.closing {
                    session.closing = true;
                    session.close_reason = Some("transport_closed".into());
                    session.handshake = HandshakeState::Closed;
                    self.share.write().remove(&peer);
                }
                self.finalize_session(&peer);
            }
            TransportPhase::New | TransportPhase::Connecting => {}
        }
    }

    fn on_grace_expired(&mut self, peer: PeerId, epoch: u64) {
        let Some(session) = self.sessions.get(&peer) else {
            return;
        };
        if session.phase == TransportPhase::Disconnected && session.disconnect_epoch == epoch {
            self.close_session(&peer, "transport_disconnected");
        }
    }

    fn on_channel_open(&mut self, peer: PeerId, label: String, sender: ChannelSender) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        if session.closing {
            return;
        }
        tracing::debug!(target: "registry", peer = %peer, label = %label, "channel open");
        session.open_channel(&label, sender.clone());
        if let Some(entry) = self.share.write().get_mut(&peer) {
            entry.channels.insert(label, sender);
        }
    }

    fn on_channel_closed(&mut self, peer: PeerId, label: String) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        tracing::debug!(target: "registry", peer = %peer, label = %label, "channel closed");
        session.close_channel(&label);
        if let Some(entry) = self.share.write().get_mut(&peer) {
            entry.channels.remove(&label);
        }
    }

    fn on_frame(&mut self, peer: PeerId, label: String, payload: Bytes) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        if session.closing {
            return;
        }
        session.note_frame(Instant::now());

        if label == self.settings.labels.heartbeat {
            if payload.as_ref() == HEARTBEAT_PING {
                if let Some(sender) = session.senders.get(&self.settings.labels.heartbeat) {
                    let _ = sender.send(Bytes::from_static(HEARTBEAT_PONG));
                }
            }
            return;
        }

        // Data can only flow over a connected transport, so a frame that
        // races ahead of the state-change event still implies the peer is
        // up; the up event must precede the message either way.
        self.mark_peer_up(&peer);
        let Some(session) = self.sessions.get(&peer) else {
            return;
        };
        if session.peer_up {
            tracing::trace!(
                target: "registry",
                peer = %peer,
                label = %label,
                payload = %frame_preview(&payload),
                "inbound frame"
            );
            self.deliver(CoreEvent::Message {
                peer,
                label,
                payload,
            });
        }
    }

    fn on_renegotiation(&mut self, peer: PeerId) {
        let Some(session) = self.sessions.get_mut(&peer) else {
            return;
        };
        if session.closing {
            return;
        }
        // The initial negotiation also announces itself; only an
        // established session needs a restart.
        if session.handshake == HandshakeState::New {
            return;
        }
        tracing::info!(target: "registry", peer = %peer, "renegotiation requested");
        session.restart_handshake();
        if session.role == SessionRole::Offerer {
            if let Some(transport) = session.transport.clone() {
                self.spawn_create_offer(peer, transport);
            }
        }
    }

    fn mark_peer_up(&mut self, peer: &PeerId) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if session.peer_up || session.closing {
            return;
        }
        session.peer_up = true;
        tracing::info!(target: "registry", peer = %peer, "peer up");
        self.deliver(CoreEvent::PeerUp { peer: peer.clone() });
    }

    // --- liveness ---

    fn on_tick(&mut self) {
        if self.stopping.is_some() || self.failed {
            return;
        }
        let now = Instant::now();
        let interval = self.settings.heartbeat.interval;
        let multiplier = self.settings.heartbeat.loss_multiplier;
        let heartbeat_label = self.settings.labels.heartbeat.clone();

        let mut lost: Vec<PeerId> = Vec::new();
        for (peer, session) in self.sessions.iter_mut() {
            if session.closing || session.phase != TransportPhase::Connected {
                continue;
            }
            let nonce = session.next_nonce();
            match session.senders.get(&heartbeat_label) {
                Some(sender) => {
                    let _ = sender.send(Bytes::from_static(HEARTBEAT_PING));
                }
                None => {
                    // Data path not open yet; heartbeat over signaling.
                    self.link.send(Envelope::heartbeat(
                        self.settings.local_id.clone(),
                        peer.clone(),
                        nonce,
                    ));
                }
            }
            if session.liveness_expired(now, interval, multiplier) {
                lost.push(peer.clone());
            }
        }
        for peer in lost {
            tracing::warn!(target: "registry", peer = %peer, "liveness lost");
            self.deliver(CoreEvent::LivenessLost { peer: peer.clone() });
            self.close_session(&peer, "heartbeat_lost");
        }
    }

    // --- commands ---

    fn on_command(&mut self, command: Command) -> Flow {
        match command {
            Command::ConnectTo { peer } => {
                if self.stopping.is_some() || self.failed {
                    self.deliver(CoreEvent::PeerError {
                        peer,
                        message: "shutting_down".into(),
                    });
                    return Flow::Continue;
                }
                if self.sessions.contains_key(&peer) {
                    tracing::debug!(target: "registry", peer = %peer, "session already present");
                    return Flow::Continue;
                }
                tracing::info!(target: "registry", peer = %peer, "connecting as offerer");
                let session = Session::new(peer.clone(), SessionRole::Offerer, Instant::now());
                self.install_session(session);
                self.spawn_create(peer, SessionRole::Offerer);
                Flow::Continue
            }
            Command::Disconnect { peer, reason } => {
                if self.sessions.contains_key(&peer) {
                    // Tell the other side; it tears down without waiting for
                    // transport timeouts.
                    self.link.send(Envelope::leave(
                        self.settings.local_id.clone(),
                        peer.clone(),
                        reason.clone(),
                    ));
                }
                self.close_session(&peer, &reason);
                Flow::Continue
            }
            Command::Stop { done } => self.begin_stop(done),
        }
    }

    fn begin_stop(&mut self, done: std::sync::mpsc::Sender<()>) -> Flow {
        if let Some(stopping) = &mut self.stopping {
            stopping.done.push(done);
            return Flow::Continue;
        }
        tracing::info!(target: "registry", sessions = self.sessions.len(), "stopping");
        self.stopping = Some(Stopping {
            done: vec![done],
            link_close_requested: false,
        });

        let deadline = self.settings.shutdown_deadline;
        let events = self.events.clone();
        tokio::spawn(async move {
            sleep(deadline).await;
            events.post(Event::ShutdownDeadline);
        });

        let peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for peer in peers {
            self.link.send(Envelope::leave(
                self.settings.local_id.clone(),
                peer.clone(),
                "shutdown",
            ));
            self.close_session(&peer, "shutdown");
        }
        self.maybe_close_link();
        Flow::Continue
    }

    fn on_shutdown_deadline(&mut self) -> Flow {
        if self.stopping.is_none() {
            return Flow::Continue;
        }
        let remaining: Vec<PeerId> = self.sessions.keys().cloned().collect();
        if !remaining.is_empty() {
            tracing::warn!(
                target: "registry",
                remaining = remaining.len(),
                "shutdown deadline passed; force-dropping sessions"
            );
        }
        for peer in remaining {
            if let Some(session) = self.sessions.remove(&peer) {
                self.share.write().remove(&peer);
                if let Some(transport) = session.transport {
                    tokio::spawn(async move { transport.close().await });
                }
                if session.peer_up {
                    self.deliver(CoreEvent::PeerDown {
                        peer,
                        reason: "shutdown_timeout".into(),
                    });
                } else {
                    self.deliver(CoreEvent::PeerError {
                        peer,
                        message: "shutdown_timeout".into(),
                    });
                }
            }
        }
        self.maybe_close_link();
        self.finish_stop()
    }

    fn on_fatal(&mut self, kind: FatalKind) -> Flow {
        tracing::error!(target: "registry", ?kind, "fatal; failing core");
        self.failed = true;
        let peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for peer in peers {
            if let Some(session) = self.sessions.remove(&peer) {
                self.share.write().remove(&peer);
                if let Some(transport) = session.transport {
                    tokio::spawn(async move { transport.close().await });
                }
                if session.peer_up {
                    self.deliver(CoreEvent::PeerDown {
                        peer,
                        reason: "dispatcher_saturated".into(),
                    });
                }
            }
        }
        self.link.close("failed");
        self.deliver(CoreEvent::LinkDown {
            reason: "dispatcher_saturated".into(),
        });
        self.finish_stop()
    }

    // --- session lifecycle plumbing ---

    fn install_session(&mut self, session: Session) {
        self.share
            .write()
            .insert(session.peer.clone(), PeerShare::default());
        self.sessions.insert(session.peer.clone(), session);
    }

    /// Begins closure. Exactly one terminal event per session is delivered,
    /// at finalization; repeated closes are no-ops.
    fn close_session(&mut self, peer: &PeerId, reason: &str) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if session.closing {
            return;
        }
        tracing::info!(target: "registry", peer = %peer, reason = %reason, "closing session");
        session.closing = true;
        session.close_reason = Some(reason.to_string());
        session.handshake = HandshakeState::Closed;
        self.share.write().remove(peer);
        match session.transport.clone() {
            Some(transport) => {
                // Terminal phase event finalizes the session.
                tokio::spawn(async move { transport.close().await });
            }
            None => self.finalize_session(peer),
        }
    }

    fn finalize_session(&mut self, peer: &PeerId) {
        let Some(session) = self.sessions.remove(peer) else {
            return;
        };
        self.share.write().remove(peer);
        let reason = session
            .close_reason
            .clone()
            .unwrap_or_else(|| "closed".into());
        tracing::info!(target: "registry", peer = %peer, reason = %reason, "session finalized");
        if session.peer_up {
            self.deliver(CoreEvent::PeerDown {
                peer: peer.clone(),
                reason,
            });
        } else {
            self.deliver(CoreEvent::PeerError {
                peer: peer.clone(),
                message: reason,
            });
        }
        self.maybe_close_link();
    }

    fn maybe_close_link(&mut self) {
        if let Some(stopping) = &mut self.stopping {
            if self.sessions.is_empty() && !stopping.link_close_requested {
                stopping.link_close_requested = true;
                self.link.close("shutdown");
            }
        }
    }

    fn finish_stop(&mut self) -> Flow {
        if let Some(stopping) = self.stopping.take() {
            for done in stopping.done {
                let _ = done.send(());
            }
        }
        Flow::Stop
    }

    // --- spawned transport operations ---

    fn spawn_create(&self, peer: PeerId, role: SessionRole) {
        let connector = self.connector.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            match connector.connect(&peer, role, events.clone()).await {
                Ok(transport) => {
                    events.post(Event::Session {
                        peer,
                        event: SessionEvent::TransportReady { transport },
                    });
                }
                Err(err) => {
                    events.post(Event::Session {
                        peer,
                        event: SessionEvent::TransportCreateFailed {
                            error: err.to_string(),
                        },
                    });
                }
            }
        });
    }

    fn spawn_create_offer(&self, peer: PeerId, transport: Arc<dyn PeerTransport>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            match transport.create_offer().await {
                Ok(sdp) => {
                    events.post(Event::Session {
                        peer,
                        event: SessionEvent::LocalOffer { sdp },
                    });
                }
                Err(err) => {
                    events.post(Event::Session {
                        peer,
                        event: SessionEvent::HandshakeFailed {
                            stage: "create_offer",
                            error: err.to_string(),
                        },
                    });
                }
            }
        });
    }

    fn spawn_create_answer(&self, peer: PeerId, transport: Arc<dyn PeerTransport>) {
        let events = self.events.clone();
        tokio::spawn(async move {
            match transport.create_answer().await {
                Ok(sdp) => {
                    events.post(Event::Session {
                        peer,
                        event: SessionEvent::LocalAnswer { sdp },
                    });
                }
                Err(err) => {
                    events.post(Event::Session {
                        peer,
                        event: SessionEvent::HandshakeFailed {
                            stage: "create_answer",
                            error: err.to_string(),
                        },
                    });
                }
            }
        });
    }

    fn spawn_set_remote(
        &self,
        peer: PeerId,
        transport: Arc<dyn PeerTransport>,
        kind: SdpKind,
        sdp: String,
    ) {
        let events = self.events.clone();
        tokio::spawn(async move {
            match transport.set_remote_description(kind, &sdp).await {
                Ok(()) => {
                    events.post(Event::Session {
                        peer,
                        event: SessionEvent::RemoteApplied { kind },
                    });
                }
                Err(err) => {
                    events.post(Event::Session {
                        peer,
                        event: SessionEvent::RemoteRejected {
                            kind,
                            error: err.to_string(),
                        },
                    });
                }
            }
        });
    }

    /// Applies candidates strictly in order; a rejected candidate is logged
    /// and skipped, it does not close the session.
    fn spawn_add_candidates(
        &self,
        peer: PeerId,
        transport: Arc<dyn PeerTransport>,
        candidates: Vec<Candidate>,
    ) {
        let events = self.events.clone();
        tokio::spawn(async move {
            for candidate in candidates {
                if let Err(err) = transport.add_remote_candidate(&candidate).await {
                    tracing::warn!(target: "registry", peer = %peer, error = %err, "candidate rejected");
                    events.post(Event::Session {
                        peer: peer.clone(),
                        event: SessionEvent::TransportError {
                            message: format!("candidate rejected: {err}"),
                        },
                    });
                }
            }
        });
    }
}
