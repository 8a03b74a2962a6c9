//! Exponential backoff for failed deliveries.
//!
//! The delay before attempt `k` (k ≥ 2) is `base_delay × 2^(k-2)`: attempt 2
//! waits the base delay, attempt 3 twice that, and so on. There is no jitter,
//! so due times are reproducible from the audit record alone.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::Endpoint;
use serde::{Deserialize, Serialize};

/// Exponent cap keeping the multiplication in range.
const MAX_EXPONENT: u32 = 30;

/// Per-endpoint retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempt budget: failed attempt `n` is retried only while
    /// `n < max_retries`.
    pub max_retries: u32,

    /// Delay before attempt 2.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_secs(60) }
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run attempt `next_attempt_number` at `next_attempt_at`.
    Retry {
        /// Number of the follow-up attempt
        next_attempt_number: u32,
        /// When the follow-up attempt is due
        next_attempt_at: DateTime<Utc>,
    },
    /// No further attempts.
    GiveUp {
        /// Why no retry was scheduled
        reason: String,
    },
}

impl RetryDecision {
    /// Due time of the follow-up attempt, if any.
    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Retry { next_attempt_at, .. } => Some(*next_attempt_at),
            Self::GiveUp { .. } => None,
        }
    }
}

impl RetryPolicy {
    /// Policy configured on `endpoint`.
    pub fn for_endpoint(endpoint: &Endpoint) -> Self {
        Self { max_retries: endpoint.attempt_budget(), base_delay: endpoint.retry_delay() }
    }

    /// Delay before `attempt_number`. Attempt 1 has no delay.
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        if attempt_number < 2 {
            return Duration::ZERO;
        }
        let exponent = (attempt_number - 2).min(MAX_EXPONENT);
        self.base_delay.saturating_mul(2_u32.pow(exponent))
    }

    /// Decides whether failed attempt `attempt_number` gets a follow-up.
    pub fn decide(&self, attempt_number: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if attempt_number >= self.max_retries {
            return RetryDecision::GiveUp {
                reason: format!("retry budget of {} attempts exhausted", self.max_retries),
            };
        }

        let next_attempt_number = attempt_number + 1;
        let Ok(delay) = chrono::Duration::from_std(self.delay_for(next_attempt_number)) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };
        let Some(next_attempt_at) = failed_at.checked_add_signed(delay) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { next_attempt_number, next_attempt_at }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn policy(max_retries: u32, base_secs: u64) -> RetryPolicy {
        RetryPolicy { max_retries, base_delay: Duration::from_secs(base_secs) }
    }

    #[test]
    fn delays_double_from_the_base() {
        let policy = policy(5, 60);
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(120));
        assert_eq!(policy.delay_for(4), Duration::from_secs(240));
    }

    #[test]
    fn three_attempt_budget_schedules_two_retries() {
        let policy = policy(3, 60);
        let t0 = Utc::now();

        assert_eq!(
            policy.decide(1, t0),
            RetryDecision::Retry {
                next_attempt_number: 2,
                next_attempt_at: t0 + chrono::Duration::seconds(60)
            }
        );
        assert_eq!(
            policy.decide(2, t0),
            RetryDecision::Retry {
                next_attempt_number: 3,
                next_attempt_at: t0 + chrono::Duration::seconds(120)
            }
        );
        assert!(matches!(policy.decide(3, t0), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn zero_budget_never_retries() {
        assert!(matches!(policy(0, 60).decide(1, Utc::now()), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        let policy = policy(u32::MAX, 3600);
        let decision = policy.decide(1_000, Utc::now());
        assert!(matches!(decision, RetryDecision::GiveUp { .. } | RetryDecision::Retry { .. }));
    }

    proptest! {
        #[test]
        fn backoff_is_strictly_increasing(base in 1u64..86_400, k in 2u32..20) {
            let policy = policy(u32::MAX, base);
            prop_assert_eq!(policy.delay_for(k), Duration::from_secs(base) * 2u32.pow(k - 2));
            prop_assert!(policy.delay_for(k + 1) > policy.delay_for(k));
        }
    }
}
