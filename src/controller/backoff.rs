//! # Fibonacci Backoff
//!
//! Fibonacci-based delays between retries of transient cluster reads.
//! The sequence grows more slowly than exponential backoff, so a handful of
//! retries stays well inside the per-item time budget.
//!
//! Values are tracked in milliseconds. With a 250ms start and 5s cap:
//! 250ms, 250ms, 500ms, 750ms, 1.25s, 2s, 3.25s, 5s (max).
//!
//! ## Usage
//!
//! ```rust
//! use sealed_secret_reencryptor::controller::backoff::FibonacciBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = FibonacciBackoff::new(Duration::from_millis(250), Duration::from_secs(5));
//! assert_eq!(backoff.next_backoff(), Duration::from_millis(250));
//! assert_eq!(backoff.next_backoff(), Duration::from_millis(250));
//! assert_eq!(backoff.next_backoff(), Duration::from_millis(500));
//! ```

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at the maximum.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Starting value in milliseconds (for reset)
    min_ms: u64,
    /// Previous backoff value in milliseconds
    prev_ms: u64,
    /// Current backoff value in milliseconds
    current_ms: u64,
    /// Maximum backoff value in milliseconds
    max_ms: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff between `min` and `max`
    ///
    /// A `min` larger than `max` is clamped to `max`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let max_ms = duration_ms(max);
        let min_ms = duration_ms(min).min(max_ms);
        Self {
            min_ms,
            prev_ms: 0,
            current_ms: min_ms,
            max_ms,
        }
    }

    /// Get the next backoff in milliseconds and advance the sequence
    pub fn next_backoff_ms(&mut self) -> u64 {
        let result = self.current_ms;
        let next = self.prev_ms.saturating_add(self.current_ms);
        self.prev_ms = self.current_ms;
        self.current_ms = next.min(self.max_ms);
        result
    }

    /// Get the next backoff as a `Duration` and advance the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_millis(self.next_backoff_ms())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_ms = 0;
        self.current_ms = self.min_ms;
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> FibonacciBackoff {
        FibonacciBackoff::new(Duration::from_millis(250), Duration::from_secs(5))
    }

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = backoff();
        let sequence: Vec<u64> = (0..8).map(|_| backoff.next_backoff_ms()).collect();
        assert_eq!(sequence, vec![250, 250, 500, 750, 1250, 2000, 3250, 5000]);
    }

    #[test]
    fn test_fibonacci_backoff_max_cap() {
        let mut backoff = backoff();
        for _ in 0..8 {
            backoff.next_backoff_ms();
        }
        // 3250 + 5000 would exceed the cap
        assert_eq!(backoff.next_backoff_ms(), 5000);
        assert_eq!(backoff.next_backoff_ms(), 5000);
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = backoff();
        backoff.next_backoff_ms();
        backoff.next_backoff_ms();
        backoff.next_backoff_ms();

        backoff.reset();

        assert_eq!(backoff.next_backoff(), Duration::from_millis(250));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(250));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(500));
    }

    #[test]
    fn test_fibonacci_backoff_independent_state() {
        let mut first = backoff();
        let mut second = first.clone();

        first.next_backoff_ms();
        first.next_backoff_ms();
        assert_eq!(first.next_backoff_ms(), 500);

        // The clone continues from where it was taken
        assert_eq!(second.next_backoff_ms(), 250);
    }

    #[test]
    fn test_min_clamped_to_max() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
    }
}
