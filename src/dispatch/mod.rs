//! The dispatcher: one logical worker, many producers.
//!
//! Every state transition in the runtime happens on the worker draining this
//! queue. Producers (signaling link, transport adapters, liveness ticker,
//! application threads) only enqueue. The queue is depth-bounded: crossing
//! the high-water mark means the worker is stuck, which is fatal for the
//! core rather than a condition to paper over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::config::Executor;
use crate::rtc::{PeerTransport, SdpKind, TransportPhase};
use crate::session::ChannelSender;
use crate::signal::{Candidate, Envelope, PeerId};

/// Default high-water mark for the event queue.
pub const DEFAULT_QUEUE_LIMIT: usize = 4096;

pub enum Event {
    Link(LinkEvent),
    Session { peer: PeerId, event: SessionEvent },
    Tick,
    Command(Command),
    ShutdownDeadline,
    Fatal(FatalKind),
}

pub enum LinkEvent {
    Opened,
    Closed { reason: String },
    Error { message: String },
    Envelope(Envelope),
}

pub enum SessionEvent {
    TransportReady { transport: Arc<dyn PeerTransport> },
    TransportCreateFailed { error: String },
    LocalOffer { sdp: String },
    LocalAnswer { sdp: String },
    RemoteApplied { kind: SdpKind },
    RemoteRejected { kind: SdpKind, error: String },
    HandshakeFailed { stage: &'static str, error: String },
    LocalCandidate { candidate: Candidate },
    PhaseChanged { phase: TransportPhase },
    ChannelOpen { label: String, sender: ChannelSender },
    ChannelClosed { label: String },
    Frame { label: String, payload: Bytes },
    GraceExpired { epoch: u64 },
    RenegotiationNeeded,
    TransportError { message: String },
}

pub enum Command {
    ConnectTo { peer: PeerId },
    Disconnect { peer: PeerId, reason: String },
    Stop { done: std::sync::mpsc::Sender<()> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalKind {
    DispatcherSaturated,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Link(event) => event.name(),
            Event::Session { event, .. } => event.name(),
            Event::Tick => "tick",
            Event::Command(command) => command.name(),
            Event::ShutdownDeadline => "shutdown_deadline",
            Event::Fatal(_) => "fatal",
        }
    }
}

impl LinkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LinkEvent::Opened => "link_opened",
            LinkEvent::Closed { .. } => "link_closed",
            LinkEvent::Error { .. } => "link_error",
            LinkEvent::Envelope(_) => "link_envelope",
        }
    }
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::TransportReady { .. } => "transport_ready",
            SessionEvent::TransportCreateFailed { .. } => "transport_create_failed",
            SessionEvent::LocalOffer { .. } => "local_offer",
            SessionEvent::LocalAnswer { .. } => "local_answer",
            SessionEvent::RemoteApplied { .. } => "remote_applied",
            SessionEvent::RemoteRejected { .. } => "remote_rejected",
            SessionEvent::HandshakeFailed { .. } => "handshake_failed",
            SessionEvent::LocalCandidate { .. } => "local_candidate",
            SessionEvent::PhaseChanged { .. } => "phase_changed",
            SessionEvent::ChannelOpen { .. } => "channel_open",
            SessionEvent::ChannelClosed { .. } => "channel_closed",
            SessionEvent::Frame { .. } => "frame",
            SessionEvent::GraceExpired { .. } => "grace_expired",
            SessionEvent::RenegotiationNeeded => "renegotiation_needed",
            SessionEvent::TransportError { .. } => "transport_error",
        }
    }
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ConnectTo { .. } => "connect_to",
            Command::Disconnect { .. } => "disconnect",
            Command::Stop { .. } => "stop",
        }
    }
}

/// Multi-producer handle onto the dispatcher queue.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<Event>,
    depth: Arc<AtomicUsize>,
    limit: usize,
    saturated: Arc<AtomicBool>,
}

/// Worker end of the queue.
pub struct EventRx {
    rx: mpsc::UnboundedReceiver<Event>,
    depth: Arc<AtomicUsize>,
}

impl EventQueue {
    pub fn new(limit: usize) -> (EventQueue, EventRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (
            EventQueue {
                tx,
                depth: depth.clone(),
                limit,
                saturated: Arc::new(AtomicBool::new(false)),
            },
            EventRx { rx, depth },
        )
    }

    /// Enqueues an event. Returns false if the queue is saturated or the
    /// worker is gone; saturation itself enqueues one fatal marker.
    pub fn post(&self, event: Event) -> bool {
        if self.saturated.load(Ordering::Acquire) {
            return false;
        }
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if depth > self.limit {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            if !self.saturated.swap(true, Ordering::AcqRel) {
                tracing::error!(
                    target: "dispatch",
                    depth,
                    limit = self.limit,
                    dropped = event.name(),
                    "event queue past high-water mark; worker appears stuck"
                );
                self.depth.fetch_add(1, Ordering::AcqRel);
                let _ = self.tx.send(Event::Fatal(FatalKind::DispatcherSaturated));
            }
            return false;
        }
        match self.tx.send(event) {
            Ok(()) => true,
            Err(_) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated.load(Ordering::Acquire)
    }
}

impl EventRx {
    pub async fn next(&mut self) -> Option<Event> {
        let event = self.rx.recv().await;
        if event.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        event
    }
}

/// Event kinds the application can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    LinkUp,
    LinkDown,
    LinkError,
    PeerUp,
    PeerDown,
    Message,
    PeerError,
    LivenessLost,
}

/// Event payloads delivered to application handlers.
#[derive(Clone, Debug)]
pub enum CoreEvent {
    LinkUp,
    LinkDown { reason: String },
    LinkError { message: String },
    PeerUp { peer: PeerId },
    PeerDown { peer: PeerId, reason: String },
    Message { peer: PeerId, label: String, payload: Bytes },
    PeerError { peer: PeerId, message: String },
    LivenessLost { peer: PeerId },
}

impl CoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CoreEvent::LinkUp => EventKind::LinkUp,
            CoreEvent::LinkDown { .. } => EventKind::LinkDown,
            CoreEvent::LinkError { .. } => EventKind::LinkError,
            CoreEvent::PeerUp { .. } => EventKind::PeerUp,
            CoreEvent::PeerDown { .. } => EventKind::PeerDown,
            CoreEvent::Message { .. } => EventKind::Message,
            CoreEvent::PeerError { .. } => EventKind::PeerError,
            CoreEvent::LivenessLost { .. } => EventKind::LivenessLost,
        }
    }
}

pub type Handler = Arc<dyn Fn(&CoreEvent) + Send + Sync>;

/// Subscriber list, fixed before start. Delivery happens on the worker
/// unless an executor reroutes it; either way handlers must stay bounded in
/// work, because the queue keeps filling behind them.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: Arc<RwLock<HashMap<EventKind, Vec<Handler>>>>,
    executor: Option<Executor>,
}

impl HandlerTable {
    pub fn new(executor: Option<Executor>) -> Self {
        HandlerTable {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            executor,
        }
    }

    pub fn on(&self, kind: EventKind, handler: Handler) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    pub fn deliver(&self, event: CoreEvent) {
        let handlers: Vec<Handler> = {
            let guard = self.handlers.read();
            match guard.get(&event.kind()) {
                Some(handlers) => handlers.clone(),
                None => return,
            }
        };
        match &self.executor {
            Some(executor) => executor(Box::new(move || {
                for handler in &handlers {
                    handler(&event);
                }
            })),
            None => {
                for handler in &handlers {
                    handler(&event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn queue_counts_depth_across_post_and_drain() {
        let (queue, mut rx) = EventQueue::new(16);
        assert!(queue.post(Event::Tick));
        assert!(queue.post(Event::Tick));
        assert_eq!(queue.depth(), 2);
        assert!(matches!(rx.next().await, Some(Event::Tick)));
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn saturation_posts_exactly_one_fatal_marker() {
        let (queue, mut rx) = EventQueue::new(2);
        assert!(queue.post(Event::Tick));
        assert!(queue.post(Event::Tick));
        assert!(!queue.post(Event::Tick));
        assert!(!queue.post(Event::Tick));
        assert!(queue.is_saturated());

        let mut fatals = 0;
        let mut ticks = 0;
        for _ in 0..3 {
            match rx.next().await {
                Some(Event::Fatal(FatalKind::DispatcherSaturated)) => fatals += 1,
                Some(Event::Tick) => ticks += 1,
                other => panic!("unexpected event {:?}", other.map(|e| e.name())),
            }
        }
        assert_eq!((ticks, fatals), (2, 1));
    }

    #[test]
    fn handler_table_routes_by_kind() {
        let table = HandlerTable::new(None);
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_up = seen.clone();
        table.on(
            EventKind::PeerUp,
            Arc::new(move |event| {
                if let CoreEvent::PeerUp { peer } = event {
                    seen_up.lock().unwrap().push(peer.to_string());
                }
            }),
        );

        table.deliver(CoreEvent::PeerUp {
            peer: PeerId::from("v1"),
        });
        table.deliver(CoreEvent::PeerDown {
            peer: PeerId::from("v1"),
            reason: "bye".into(),
        });
        assert_eq!(seen.lock().unwrap().as_slice(), ["v1"]);
    }

    #[test]
    fn executor_reroutes_delivery() {
        let ran_on_executor = Arc::new(Mutex::new(false));
        let flag = ran_on_executor.clone();
        let executor: Executor = Arc::new(move |job| {
            *flag.lock().unwrap() = true;
            job();
        });

        let table = HandlerTable::new(Some(executor));
        let seen = Arc::new(Mutex::new(0));
        let seen_inner = seen.clone();
        table.on(
            EventKind::LinkUp,
            Arc::new(move |_| {
                *seen_inner.lock().unwrap() += 1;
            }),
        );
        table.deliver(CoreEvent::LinkUp);
        assert!(*ran_on_executor.lock().unwrap());
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
