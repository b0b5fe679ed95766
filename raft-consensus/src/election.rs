//! Randomized election timeout.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Tracks when this node should next start an election.
///
/// Every reset draws a fresh duration uniformly from the configured window so
/// that servers rarely time out together. The randomness source is seedable
/// to make election outcomes reproducible in tests.
#[derive(Debug)]
pub struct ElectionTimer {
    min: Duration,
    max: Duration,
    rng: StdRng,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(min: Duration, max: Duration, seed: Option<u64>, now: Instant) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut timer = Self {
            min,
            max,
            rng,
            deadline: now,
        };
        timer.reset(now);
        timer
    }

    /// Restarts the timer with a newly drawn timeout.
    pub fn reset(&mut self, now: Instant) {
        let timeout = self.draw();
        self.deadline = now + timeout;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    fn draw(&mut self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(self.rng.gen_range(min..=max.max(min)))
    }
}
