//! Reconnect delay schedule: exponential with a cap and fractional jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let next = config.initial;
        Backoff { config, next }
    }

    /// Call after a successful connect so the next failure starts over.
    pub fn reset(&mut self) {
        self.next = self.config.initial;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (base * 2).min(self.config.max);
        jittered(base, self.config.jitter, &mut rand::thread_rng())
    }
}

fn jittered(base: Duration, jitter: f64, rng: &mut impl Rng) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let spread = base.as_secs_f64() * jitter;
    let offset = rng.gen_range(-spread..=spread);
    Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            jitter,
        }
    }

    #[test]
    fn doubles_and_caps_without_jitter() {
        let mut backoff = Backoff::new(config(0.0));
        let mut delays = Vec::new();
        for _ in 0..10 {
            delays.push(backoff.next_delay());
        }
        assert_eq!(delays[0], Duration::from_millis(250));
        assert_eq!(delays[1], Duration::from_millis(500));
        assert_eq!(delays[2], Duration::from_millis(1000));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = Backoff::new(config(0.0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(config(0.2));
        for expected_ms in [250.0_f64, 500.0, 1000.0] {
            let delay = backoff.next_delay().as_secs_f64() * 1000.0;
            assert!(
                delay >= expected_ms * 0.8 - 1.0 && delay <= expected_ms * 1.2 + 1.0,
                "delay {delay}ms out of range around {expected_ms}ms"
            );
        }
    }
}
