//! Exponential backoff at two levels.
//!
//! [`BackoffPolicy`] drives [`with_retry`], the bounded retry loop inside a
//! single outbound call. [`RetryPolicy`] schedules queue-level attempts:
//! each failed job attempt is rescheduled with its own, slower backoff until
//! the attempt budget runs out and the job is dead-lettered. The two layers
//! compose: every queue attempt may itself make several network attempts.

use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::Clock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Backoff inside one outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Growth per attempt.
    pub factor: f64,
    /// Relative jitter, `0.5` meaning ±50%.
    pub jitter: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(250),
            factor: 2.2,
            jitter: 0.5,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `failed_attempt + 1`.
    ///
    /// `failed_attempt` is 1-based; a destination-supplied `Retry-After`
    /// raises the delay but never past `max_delay`.
    pub fn delay_after(&self, failed_attempt: u32, error: &DeliveryError) -> Duration {
        let exponent = i32::try_from(failed_attempt.saturating_sub(1).min(30)).unwrap_or(30);
        let nominal = self.base_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        let capped = Duration::from_secs_f64(nominal.min(self.max_delay.as_secs_f64()));
        let jittered = apply_jitter(capped, self.jitter);

        let floor = error.retry_after_seconds().map_or(Duration::ZERO, Duration::from_secs);
        jittered.max(floor).min(self.max_delay)
    }
}

/// Runs `operation` until it succeeds, fails non-transiently, or uses
/// `policy.attempts` attempts.
///
/// `operation` receives the 1-based attempt number. The last error is
/// returned unchanged.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn with_retry<T, F, Fut, P>(
    policy: &BackoffPolicy,
    clock: &dyn Clock,
    is_transient: P,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&DeliveryError) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < attempts && is_transient(&error) => {
                let delay = policy.delay_after(attempt, &error);
                tracing::debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "transient failure, backing off"
                );
                clock.sleep(delay).await;
            },
            Err(error) => return Err(error),
        }
    }
}

/// Queue-level scheduling of failed jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits roughly `base_delay * 2^n`.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Relative jitter applied before capping.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(400),
            max_delay: Duration::from_secs(300),
            jitter: 0.25,
        }
    }
}

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt.
    Retry {
        /// When the job becomes due again
        next_attempt_at: DateTime<Utc>,
    },
    /// Dead-letter the job.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl RetryPolicy {
    /// Backoff after `attempts` failed attempts.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempts.min(20));
        let nominal = self.base_delay.saturating_mul(multiplier);
        apply_jitter(nominal, self.jitter).min(self.max_delay)
    }

    /// Decides the fate of a job that has now failed `attempts` times.
    pub fn decide(&self, attempts: u32, failed_at: DateTime<Utc>) -> RetryDecision {
        if attempts >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.max_attempts),
            };
        }

        let delay = self.delay_for(attempts);
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| failed_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        RetryDecision::Retry { next_attempt_at }
    }
}

/// Randomizes `duration` by up to ±`jitter_factor` of itself.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use courier_core::TestClock;

    use super::*;
    use crate::error::is_transient;

    fn no_jitter() -> BackoffPolicy {
        BackoffPolicy { jitter: 0.0, ..BackoffPolicy::default() }
    }

    #[test]
    fn call_backoff_grows_by_factor() {
        let policy = no_jitter();
        let err = DeliveryError::network("reset");
        assert_eq!(policy.delay_after(1, &err), Duration::from_millis(250));
        assert_eq!(policy.delay_after(2, &err), Duration::from_millis(550));
        let third = policy.delay_after(3, &err).as_secs_f64();
        assert!((third - 1.21).abs() < 1e-9);
    }

    #[test]
    fn call_backoff_jitter_stays_within_half() {
        let policy = BackoffPolicy::default();
        let err = DeliveryError::network("reset");
        for _ in 0..200 {
            let d = policy.delay_after(2, &err).as_secs_f64();
            assert!((0.275..=0.825).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn retry_after_raises_the_delay() {
        let policy = no_jitter();
        let err = DeliveryError::from_status(429, "", Some(3));
        assert_eq!(policy.delay_after(1, &err), Duration::from_secs(3));

        let huge = DeliveryError::from_status(429, "", Some(3_600));
        assert_eq!(policy.delay_after(1, &huge), policy.max_delay);
    }

    #[tokio::test]
    async fn always_transient_failure_is_attempted_exactly_five_times() {
        let clock = TestClock::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&BackoffPolicy::default(), &clock, is_transient, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DeliveryError::timeout(100)) }
        })
        .await;

        assert_eq!(result.unwrap_err(), DeliveryError::timeout(100));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(clock.elapsed() > Duration::ZERO);
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let clock = TestClock::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&BackoffPolicy::default(), &clock, is_transient, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DeliveryError::from_status(400, "bad", None)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let clock = TestClock::new();

        let result = with_retry(&no_jitter(), &clock, is_transient, |attempt| async move {
            if attempt < 3 {
                Err(DeliveryError::from_status(503, "", None))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(clock.elapsed(), Duration::from_millis(800));
    }

    #[test]
    fn queue_backoff_doubles_and_caps() {
        let policy = RetryPolicy { jitter: 0.0, ..RetryPolicy::default() };
        assert_eq!(policy.delay_for(1), Duration::from_millis(800));
        assert_eq!(policy.delay_for(3), Duration::from_millis(3_200));
        assert_eq!(policy.delay_for(12), Duration::from_secs(300));
    }

    #[test]
    fn queue_gives_up_at_max_attempts() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        match policy.decide(7, now) {
            RetryDecision::Retry { next_attempt_at } => assert!(next_attempt_at > now),
            RetryDecision::GiveUp { reason } => panic!("gave up early: {reason}"),
        }
        assert!(matches!(policy.decide(8, now), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn jittered_queue_delay_never_exceeds_cap() {
        let policy = RetryPolicy::default();
        for attempts in 0..20 {
            assert!(policy.delay_for(attempts) <= policy.max_delay);
        }
    }
}
