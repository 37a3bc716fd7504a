//! Liveness ticker.
//!
//! Posts a `Tick` to the dispatcher on a fixed period; the per-peer
//! heartbeat emission and silence check run inside the worker, which owns
//! the session clocks. A zero period disables monitoring entirely.

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};

use crate::dispatch::{Event, EventQueue};

pub fn spawn(
    handle: &tokio::runtime::Handle,
    events: EventQueue,
    period: Duration,
) -> Option<tokio::task::JoinHandle<()>> {
    if period.is_zero() {
        tracing::debug!(target: "liveness", "heartbeat disabled");
        return None;
    }
    Some(handle.spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // An interval's first tick completes immediately; the first real
        // tick should land one period in.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !events.post(Event::Tick) {
                break;
            }
        }
    }))
}
