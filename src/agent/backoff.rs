//! Exponential backoff for session establishment

use rand::Rng;
use std::time::Duration;

use crate::config::AgentConfig;

const MULTIPLIER: f64 = 2.0;
const JITTER: f64 = 0.25;

/// Exponential backoff with jitter between attempts
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    multiplier: f64,
    /// Fraction of the delay added at random (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.backoff_initial, config.backoff_max, MULTIPLIER, JITTER)
    }

    /// Get the next delay and advance
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = next.min(self.max);

        if self.jitter == 0.0 {
            return delay;
        }
        let extra = delay.as_secs_f64() * self.jitter * rand::thread_rng().gen::<f64>();
        delay + Duration::from_secs_f64(extra)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
