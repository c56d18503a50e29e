use std::time::Duration;

use rand::Rng;

/// Votes (or acks) needed out of `cluster_size` members, the counting node included.
pub fn majority(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// Uniform draw from `[min_ms, max_ms]` milliseconds.
pub fn random_duration<R: Rng>(rng: &mut R, min_ms: u64, max_ms: u64) -> Duration {
    if min_ms >= max_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rng.gen_range(min_ms..=max_ms))
}
