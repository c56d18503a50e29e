//! Randomized one-shot election timeout.
//!
//! The timer is a single deadline: re-arming overwrites it, so there is
//! never more than one pending wake-up per node.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::utils::random_duration;

#[derive(Debug)]
pub struct ElectionTimer<R = StdRng> {
    min_ms: u64,
    max_ms: u64,
    rng: R,
    deadline: Instant,
}

impl ElectionTimer<StdRng> {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        ElectionTimer::with_rng(min_ms, max_ms, StdRng::from_entropy())
    }
}

impl<R: Rng> ElectionTimer<R> {
    /// Armed on creation.
    pub fn with_rng(min_ms: u64, max_ms: u64, rng: R) -> Self {
        let mut timer = ElectionTimer {
            min_ms,
            max_ms,
            rng,
            deadline: Instant::now(),
        };
        timer.reset();
        timer
    }

    /// Re-arms with a fresh draw from `[min, max]`. Returns the drawn wait.
    pub fn reset(&mut self) -> Duration {
        let wait = random_duration(&mut self.rng, self.min_ms, self.max_ms);
        self.deadline = Instant::now() + wait;
        wait
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::ElectionTimer;
    use rand::rngs::StdRng;
    use rand_core::SeedableRng;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_reset_draws_within_bounds() {
        let mut timer = ElectionTimer::with_rng(20, 40, StdRng::seed_from_u64(3));
        for _ in 0..100 {
            let wait = timer.reset();
            assert!(wait >= Duration::from_millis(20) && wait <= Duration::from_millis(40));
            assert!(timer.remaining() <= wait);
        }
    }

    #[test]
    fn test_fires_and_rearms() {
        let mut timer = ElectionTimer::with_rng(5, 10, StdRng::seed_from_u64(7));
        assert!(!timer.expired());

        thread::sleep(Duration::from_millis(15));
        assert!(timer.expired());
        assert_eq!(Duration::from_millis(0), timer.remaining());

        timer.reset();
        assert!(!timer.expired());
    }
}
