//! Reconnect backoff policy.

use std::time::Duration;

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Connection attempts allowed per outage, the first included.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
        }
    }
}

impl ReconnectConfig {
    /// `min(initial * 2^attempt, max)`, no jitter. `attempt` is 0 on the first retry.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Delay under the default policy (1s base, 30s cap).
pub fn compute_delay(attempt: u32) -> Duration {
    ReconnectConfig::default().delay_for_attempt(attempt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_sequence() {
        let delays: Vec<u128> = (0..7).map(|n| compute_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_monotonic_and_capped() {
        for n in 0..200 {
            assert!(compute_delay(n) <= compute_delay(n + 1));
            assert!(compute_delay(n) <= Duration::from_millis(30000));
        }
        assert_eq!(compute_delay(u32::MAX), Duration::from_millis(30000));
    }

    #[test]
    fn test_custom_policy() {
        let config = ReconnectConfig {
            max_attempts: 3,
            initial_delay_ms: 250,
            max_delay_ms: 1000,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(1000));
    }
}
