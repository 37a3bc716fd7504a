//! Bounded outbound envelope queue.
//!
//! `send` on the link never blocks: envelopes queue here whether or not the
//! websocket is currently open, and the link task drains the queue when it
//! can. Overflow drops the oldest entry so fresh signaling wins.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::signal::Envelope;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    DroppedOldest,
}

pub struct Backlog {
    queue: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    notify: Notify,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        Backlog {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
        }
    }

    pub fn push(&self, envelope: Envelope) -> PushOutcome {
        let outcome = {
            let mut queue = self.queue.lock();
            let outcome = if queue.len() >= self.capacity {
                queue.pop_front();
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            queue.push_back(envelope);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    pub fn pop(&self) -> Option<Envelope> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Resolves when a push may have occurred; callers re-check with `pop`.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}
