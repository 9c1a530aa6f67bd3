//! Bounded exponential backoff with jitter for watch/list retries.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(cfg: &BackoffConfig) -> Self {
        let initial = cfg.initial.max(Duration::from_millis(1));
        let max = cfg.max.max(initial);
        Self { initial, max, current: initial, attempts: 0 }
    }

    /// Next delay: the current step plus up to 50% jitter, never above `max`.
    pub fn next_delay(&mut self) -> Duration {
        let base_ms = self.current.as_millis() as u64;
        let jitter = rand::rng().random_range(0..base_ms / 2 + 1);
        let delay = Duration::from_millis(base_ms + jitter).min(self.max);
        self.current = (self.current * 2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 { self.attempts }
}
