//! Retry scheduling for failed groups.
//!
//! Backoff is linear in the attempt count already recorded on the row:
//! `base_delay * max(attempts, 1)`. Whether a failure is retried at all is
//! decided by the error's status, never by how many attempts were made.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry settings applied to every failed row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay unit multiplied by the attempt count.
    pub base_delay: Duration,

    /// Configured attempt ceiling.
    ///
    /// Carried through configuration but not consulted when deciding between
    /// retry and dead-letter.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_secs(60), max_retries: crate::DEFAULT_MAX_RETRIES }
    }
}

/// What to do with a row after a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep the row and make it claimable again after `delay`.
    Retry {
        /// Time until the row becomes claimable
        delay: Duration,
    },
    /// Move the row to the dead-letter table.
    DeadLetter {
        /// Text recorded on the dead-letter entry
        reason: String,
    },
}

impl RetryPolicy {
    /// Delay before a row with `prior_attempts` failures may be retried.
    pub fn delay_for(&self, prior_attempts: i32) -> Duration {
        let multiplier = u32::try_from(prior_attempts.max(1)).unwrap_or(1);
        self.base_delay.saturating_mul(multiplier)
    }

    /// Decides the fate of one row of a failed group.
    pub fn decide(&self, error: &DeliveryError, prior_attempts: i32) -> RetryDecision {
        if error.is_retryable() {
            RetryDecision::Retry { delay: self.delay_for(prior_attempts) }
        } else {
            RetryDecision::DeadLetter { reason: error.error_text() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failures_wait_one_base_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
    }

    #[test]
    fn delay_grows_linearly_with_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for(5), Duration::from_secs(300));
    }

    #[test]
    fn negative_attempts_are_clamped() {
        let policy = RetryPolicy { base_delay: Duration::from_secs(10), max_retries: 3 };
        assert_eq!(policy.delay_for(-4), Duration::from_secs(10));
    }

    #[test]
    fn retryable_errors_schedule_retry() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&DeliveryError::from_status(503, "down"), 3);
        assert_eq!(decision, RetryDecision::Retry { delay: Duration::from_secs(180) });
    }

    #[test]
    fn terminal_errors_dead_letter_with_body() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&DeliveryError::from_status(422, "bad gender"), 0);
        assert_eq!(decision, RetryDecision::DeadLetter { reason: "bad gender".to_string() });
    }

    #[test]
    fn attempt_count_never_forces_dead_letter() {
        let policy = RetryPolicy { base_delay: Duration::from_secs(60), max_retries: 5 };
        let decision = policy.decide(&DeliveryError::timeout(15_000), 50);
        assert!(matches!(decision, RetryDecision::Retry { .. }));
    }
}
