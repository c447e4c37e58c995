//! Connection state machine and retry policy.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──open()──> Connecting ──success──> Connected
//!      ▲                       │                       │
//!      │                 retries exhausted        I/O error / desync
//!      │                       ▼                       │
//!      │                    Failed <──bound exceeded── Disconnected ──> Connecting ...
//!      │
//!   Closing <──stop() from any state
//! ```
//!
//! `Failed` is terminal: the handler thread has exited and the source only drains what is
//! already buffered.

use crate::error::{AppResult, IngestError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Lifecycle state of a connection handler.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// Not connected; a reconnect may be pending.
    Disconnected,

    /// A connection attempt is in progress.
    Connecting {
        /// Attempt number (1-based) within the current connect or reconnect cycle.
        attempt: u32,
    },

    /// Frames are being read.
    Connected {
        /// Time the connection was established.
        connected_at: Instant,
    },

    /// `stop()` was called; the handler is shutting down.
    Closing,

    /// Retries exhausted or the consumer stalled. Terminal.
    Failed {
        /// Human-readable failure reason.
        reason: String,
    },
}

impl ConnectionState {
    /// Returns true if connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Returns true if the handler can no longer produce events.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Closing)
    }

    /// Failure reason, if failed.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Self::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Short status label for logs and status reports.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Closing => "closing",
            Self::Failed { .. } => "failed",
        }
    }
}

impl PartialEq for ConnectionState {
    fn eq(&self, other: &Self) -> bool {
        // Compare variants without comparing Instant fields
        match (self, other) {
            (Self::Disconnected, Self::Disconnected) => true,
            (Self::Connecting { attempt: a1 }, Self::Connecting { attempt: a2 }) => a1 == a2,
            (Self::Connected { .. }, Self::Connected { .. }) => true,
            (Self::Closing, Self::Closing) => true,
            (Self::Failed { reason: r1 }, Self::Failed { reason: r2 }) => r1 == r2,
            _ => false,
        }
    }
}

/// Bounded retry with exponential backoff.
///
/// Used twice per source: once for the initial connect (`[connect]`) and once for re-establishing
/// a dropped connection (`[reconnect]`). A multiplier of `1.0` gives a fixed delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether retries happen at all. A disabled reconnect policy fails on the first drop.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Maximum number of attempts (0 = unlimited).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first attempt of a reconnect cycle, and between connect attempts.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    /// Upper bound for a backed-off delay.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    /// Add up to 25% random extra delay.
    #[serde(default)]
    pub jitter: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Default policy for the initial connect: three attempts one second apart.
    pub fn connect_default() -> Self {
        Self::default()
    }

    /// Fixed-delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let delay_ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            ..Default::default()
        }
    }

    /// Policy that never retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Delay before attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay_ms as f64 / 1000.0;
        let base_delay = initial
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let capped_delay = base_delay.min(self.max_delay_ms.max(self.initial_delay_ms) as f64 / 1000.0);

        let final_delay = if self.jitter {
            capped_delay * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }

    /// Check if another attempt should follow attempt `attempt` (1-based).
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.enabled && (self.max_attempts == 0 || attempt < self.max_attempts)
    }

    pub(crate) fn validate(&self, section: &str) -> AppResult<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(IngestError::Configuration(format!(
                "[{section}] backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(IngestError::Configuration(format!(
                "[{section}] max_delay_ms ({}) must be >= initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_transitions() {
        let state = ConnectionState::Disconnected;
        assert!(!state.is_connected());
        assert_eq!(state.label(), "disconnected");

        let state = ConnectionState::Connecting { attempt: 1 };
        assert!(!state.is_connected());
        assert_eq!(state.label(), "connecting");

        let state = ConnectionState::Connected {
            connected_at: Instant::now(),
        };
        assert!(state.is_connected());
        assert!(!state.is_terminal());

        let state = ConnectionState::Failed {
            reason: "refused".into(),
        };
        assert!(state.is_terminal());
        assert_eq!(state.failure_reason(), Some("refused"));
    }

    #[test]
    fn test_state_equality_ignores_instants() {
        let a = ConnectionState::Connected {
            connected_at: Instant::now(),
        };
        std::thread::sleep(Duration::from_millis(1));
        let b = ConnectionState::Connected {
            connected_at: Instant::now(),
        };
        assert_eq!(a, b);
        assert_ne!(
            ConnectionState::Connecting { attempt: 1 },
            ConnectionState::Connecting { attempt: 2 }
        );
    }

    #[test]
    fn test_default_policy_is_fixed_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_delay_calculation() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(30)); // Capped
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30)); // Still capped
    }

    #[test]
    fn test_jitter_only_lengthens_delay() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::fixed(3, Duration::from_millis(100))
        };
        for attempt in 1..20 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));

        let unlimited = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(unlimited.should_retry(1000));

        assert!(!RetryPolicy::disabled().should_retry(0));
    }

    #[test]
    fn test_validate_rejects_shrinking_backoff() {
        let policy = RetryPolicy {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(policy.validate("reconnect").is_err());
        assert!(RetryPolicy::default().validate("reconnect").is_ok());
    }
}
