//! Utility functions for the canary workload
//!
//! This module contains the delay helper used by both loops, the inclusive
//! random draw behind batch sizes and processing delays, and wall-clock
//! helpers for message timestamps.

use rand::{thread_rng, Rng};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Suspends the calling task for at least `ms` milliseconds
///
/// Other tasks keep running while this one waits. Dropping the returned
/// future before it completes cancels the wait.
pub async fn delay(ms: u64) {
    if ms == 0 {
        // Still a suspension point so a zero interval cannot starve the runtime
        tokio::task::yield_now().await;
        return;
    }
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Draws a value uniformly from `[min, max]` (both ends inclusive)
///
/// Callers validate `min <= max` up front; a reversed range collapses to `min`.
pub fn random_between(min: u64, max: u64) -> u64 {
    if max <= min {
        return min;
    }
    thread_rng().gen_range(min..=max)
}

/// Draws a value uniformly from `[0, 1)`
pub fn random_unit() -> f64 {
    thread_rng().gen::<f64>()
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn test_random_between_stays_in_range() {
        for _ in 0..1000 {
            let value = random_between(3, 7);
            assert!((3..=7).contains(&value));
        }
    }

    #[test]
    fn test_random_between_hits_both_ends() {
        let mut seen_min = false;
        let mut seen_max = false;
        for _ in 0..1000 {
            match random_between(0, 1) {
                0 => seen_min = true,
                1 => seen_max = true,
                other => panic!("Out of range: {}", other),
            }
        }
        assert!(seen_min && seen_max);
    }

    #[test]
    fn test_random_between_degenerate_range() {
        assert_eq!(random_between(5, 5), 5);
        assert_eq!(random_between(9, 2), 9);
    }

    #[test]
    fn test_random_unit_bounds() {
        for _ in 0..1000 {
            let value = random_unit();
            assert!((0.0..1.0).contains(&value));
        }
    }

    #[test]
    fn test_epoch_millis_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(epoch_millis() > 1_577_836_800_000);
    }

    #[tokio::test]
    async fn test_delay_waits_at_least_duration() {
        let start = Instant::now();
        delay(20).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_delay_does_not_block_other_tasks() {
        let start = Instant::now();
        tokio::join!(delay(100), delay(100));
        // Both delays overlap rather than add up
        assert!(start.elapsed() < Duration::from_millis(190));
    }
}
