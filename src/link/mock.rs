//! Captured signaling link for tests.
//!
//! Records every envelope the runtime sends and lets the test play the
//! signaling service: deliver inbound envelopes, open and drop the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

use crate::dispatch::{Event, EventQueue, LinkEvent};
use crate::signal::{Envelope, EnvelopeKind};

use super::Link;

const WAIT_POLL: Duration = Duration::from_millis(5);

pub struct CapturedLink {
    events: EventQueue,
    sent: Mutex<Vec<Envelope>>,
    closed: AtomicBool,
}

impl CapturedLink {
    pub fn new(events: EventQueue) -> Arc<Self> {
        Arc::new(CapturedLink {
            events,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Announce the stream as open, as the websocket task would on connect.
    pub fn open(&self) {
        self.events.post(Event::Link(LinkEvent::Opened));
    }

    /// Simulate an unexpected stream drop (reconnect would follow).
    pub fn drop_stream(&self, reason: &str) {
        self.events.post(Event::Link(LinkEvent::Closed {
            reason: reason.to_string(),
        }));
    }

    /// Deliver an envelope as if it arrived from the signaling service.
    pub fn deliver(&self, envelope: Envelope) {
        self.events.post(Event::Link(LinkEvent::Envelope(envelope)));
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Polls until at least `count` envelopes went out.
    pub async fn wait_sent(&self, count: usize, timeout: Duration) -> Vec<Envelope> {
        let deadline = Instant::now() + timeout;
        loop {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            if Instant::now() >= deadline {
                panic!(
                    "expected {count} outbound envelopes, saw {} within {timeout:?}",
                    sent.len()
                );
            }
            sleep(WAIT_POLL).await;
        }
    }

    /// Polls until an envelope of `kind` went out and returns the first one.
    pub async fn wait_for_kind(&self, kind: EnvelopeKind, timeout: Duration) -> Envelope {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(envelope) = self.sent().into_iter().find(|e| e.kind == kind) {
                return envelope;
            }
            if Instant::now() >= deadline {
                panic!("no {kind} envelope sent within {timeout:?}");
            }
            sleep(WAIT_POLL).await;
        }
    }
}

impl Link for CapturedLink {
    fn send(&self, envelope: Envelope) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.sent.lock().push(envelope);
    }

    fn close(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.post(Event::Link(LinkEvent::Closed {
                reason: reason.to_string(),
            }));
        }
    }
}
