//! Token-bucket rate limiting per destination.
//!
//! Buckets refill lazily: every access credits `refill_rate` tokens for each
//! whole `refill_period` elapsed since the last credit, capped at `capacity`.
//! There is no background timer. A bucket is created full the first time a
//! destination is seen, from that destination's profile or the generic one.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use courier_core::{Clock, Metric, MetricsRegistry};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Longest single sleep while waiting for tokens.
pub const ACQUIRE_POLL_STEP: Duration = Duration::from_millis(100);

/// Shape of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum tokens held.
    pub capacity: u32,
    /// Tokens credited per elapsed period.
    pub refill_rate: u32,
    /// Length of one refill period.
    pub refill_period: Duration,
}

impl BucketConfig {
    /// `capacity` burst refilled by `refill_rate` tokens every second.
    pub const fn per_second(capacity: u32, refill_rate: u32) -> Self {
        Self { capacity, refill_rate, refill_period: Duration::from_secs(1) }
    }

    /// Rejects buckets that could never grant or refill.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for zero capacity, rate or
    /// period.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(DeliveryError::configuration("bucket capacity must be positive"));
        }
        if self.refill_rate == 0 {
            return Err(DeliveryError::configuration("bucket refill_rate must be positive"));
        }
        if self.refill_period.is_zero() {
            return Err(DeliveryError::configuration("bucket refill_period must be positive"));
        }
        Ok(())
    }
}

/// Generic profile for destinations without their own.
pub const GENERIC_PROFILE: BucketConfig = BucketConfig::per_second(10, 5);

/// Profiles for the destinations courier ships with.
///
/// Chat webhooks tolerate roughly one post per second; CRMs accept bursts;
/// voice APIs sit in between.
pub fn builtin_profiles() -> HashMap<String, BucketConfig> {
    HashMap::from([
        ("slack".to_string(), BucketConfig::per_second(1, 1)),
        ("crm".to_string(), BucketConfig::per_second(20, 10)),
        ("voice".to_string(), BucketConfig::per_second(5, 1)),
    ])
}

/// A single lazily refilled bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    config: BucketConfig,
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub const fn new(config: BucketConfig, now: Instant) -> Self {
        Self { config, tokens: config.capacity, last_refill: now }
    }

    /// Bucket shape.
    pub const fn config(&self) -> BucketConfig {
        self.config
    }

    /// Credits whole elapsed periods.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let period = self.config.refill_period.as_nanos().max(1);
        let periods = elapsed.as_nanos() / period;
        if periods == 0 {
            return;
        }

        let credited = periods.saturating_mul(u128::from(self.config.refill_rate));
        let room = u128::from(self.config.capacity - self.tokens.min(self.config.capacity));
        if credited >= room {
            self.tokens = self.config.capacity;
            self.last_refill = now;
        } else {
            // credited < capacity, so periods fits in u32
            self.tokens += u32::try_from(credited).unwrap_or(0);
            let whole = u32::try_from(periods).unwrap_or(u32::MAX);
            self.last_refill += self.config.refill_period.saturating_mul(whole);
        }
    }

    /// Refills, then takes `tokens` if enough are present.
    pub fn try_take(&mut self, tokens: u32, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Refills, then reports the tokens on hand.
    pub fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens
    }
}

/// Observable view of one destination's limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    /// Destination name.
    pub destination: String,
    /// Profile in effect.
    pub config: BucketConfig,
    /// Tokens on hand after refilling.
    pub available: u32,
}

/// Registry of per-destination buckets.
#[derive(Debug)]
pub struct RateLimiter {
    generic: BucketConfig,
    profiles: DashMap<String, BucketConfig>,
    buckets: DashMap<String, TokenBucket>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
}

impl RateLimiter {
    /// Creates a limiter with `generic` as the fallback profile.
    pub fn new(generic: BucketConfig, clock: Arc<dyn Clock>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { generic, profiles: DashMap::new(), buckets: DashMap::new(), clock, metrics }
    }

    /// Adds per-destination profiles.
    #[must_use]
    pub fn with_profiles(self, profiles: impl IntoIterator<Item = (String, BucketConfig)>) -> Self {
        for (destination, config) in profiles {
            self.profiles.insert(destination, config);
        }
        self
    }

    /// Profile applied to `destination`.
    pub fn config_for(&self, destination: &str) -> BucketConfig {
        self.profiles.get(destination).map_or(self.generic, |p| *p)
    }

    /// Runs `f` on `destination`'s bucket under its entry lock.
    ///
    /// A missing bucket is built from the profile read while that lock is
    /// held, so a concurrent [`configure`](Self::configure) either sees the
    /// bucket and discards it or is seen by the build.
    fn with_bucket<T>(
        &self,
        destination: &str,
        f: impl FnOnce(&mut TokenBucket, Instant) -> T,
    ) -> T {
        let now = self.clock.now();
        let mut bucket = self
            .buckets
            .entry(destination.to_string())
            .or_insert_with(|| TokenBucket::new(self.config_for(destination), now));
        f(&mut bucket, now)
    }

    fn take(&self, destination: &str, tokens: u32) -> bool {
        self.with_bucket(destination, |bucket, now| bucket.try_take(tokens, now))
    }

    /// Takes `tokens` without waiting.
    pub fn try_acquire(&self, destination: &str, tokens: u32) -> bool {
        let granted = self.take(destination, tokens);
        if !granted {
            self.metrics.inc(Metric::RateLimitRejected);
            tracing::debug!(destination, tokens, "rate limit rejected");
        }
        granted
    }

    /// Waits up to `timeout` for `tokens`, polling in short steps.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::RateLimitTimeout` once the deadline passes, or
    /// `DeliveryError::Configuration` when `tokens` exceeds the capacity.
    pub async fn acquire(&self, destination: &str, tokens: u32, timeout: Duration) -> Result<()> {
        let capacity = self.config_for(destination).capacity;
        if tokens > capacity {
            return Err(DeliveryError::configuration(format!(
                "requested {tokens} tokens but {destination} holds at most {capacity}"
            )));
        }

        let started = self.clock.now();
        loop {
            if self.take(destination, tokens) {
                return Ok(());
            }

            let waited = self.clock.now().saturating_duration_since(started);
            if waited >= timeout {
                self.metrics.inc(Metric::RateLimitTimeout);
                let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
                tracing::debug!(destination, waited_ms, "rate limit wait timed out");
                return Err(DeliveryError::rate_limit_timeout(destination, waited_ms));
            }

            self.clock.sleep(ACQUIRE_POLL_STEP.min(timeout - waited)).await;
        }
    }

    /// Tokens currently available to `destination`.
    pub fn available(&self, destination: &str) -> u32 {
        self.with_bucket(destination, |bucket, now| bucket.available(now))
    }

    /// Replaces `destination`'s profile and discards its bucket.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if `config` is invalid.
    pub fn configure(&self, destination: &str, config: BucketConfig) -> Result<()> {
        config.validate()?;
        self.profiles.insert(destination.to_string(), config);
        self.buckets.remove(destination);
        tracing::info!(
            destination,
            capacity = config.capacity,
            refill_rate = config.refill_rate,
            refill_period_ms = u64::try_from(config.refill_period.as_millis()).unwrap_or(u64::MAX),
            "rate limit reconfigured"
        );
        Ok(())
    }

    /// Every destination with a bucket or profile, ordered by name.
    pub fn snapshots(&self) -> Vec<BucketSnapshot> {
        let mut names: Vec<String> = self.profiles.iter().map(|p| p.key().clone()).collect();
        names.extend(self.buckets.iter().map(|b| b.key().clone()));
        names.sort();
        names.dedup();

        names
            .into_iter()
            .map(|destination| {
                let config = self.config_for(&destination);
                let available = self.available(&destination);
                BucketSnapshot { destination, config, available }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;

    use super::*;

    fn limiter(clock: &TestClock) -> (RateLimiter, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let limiter = RateLimiter::new(
            BucketConfig::per_second(3, 1),
            Arc::new(clock.clone()),
            metrics.clone(),
        );
        (limiter, metrics)
    }

    #[test]
    fn bucket_refills_whole_periods_only() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(BucketConfig::per_second(5, 2), start);
        assert!(bucket.try_take(5, start));
        assert_eq!(bucket.available(start + Duration::from_millis(999)), 0);
        assert_eq!(bucket.available(start + Duration::from_millis(1_000)), 2);
        assert_eq!(bucket.available(start + Duration::from_millis(2_500)), 4);
        assert_eq!(bucket.available(start + Duration::from_secs(60)), 5);
    }

    #[test]
    fn partial_periods_carry_over() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(BucketConfig::per_second(10, 1), start);
        assert!(bucket.try_take(10, start));

        assert_eq!(bucket.available(start + Duration::from_millis(1_500)), 1);
        assert_eq!(bucket.available(start + Duration::from_millis(2_000)), 2);
    }

    #[test]
    fn try_acquire_rejects_without_waiting() {
        let clock = TestClock::new();
        let (limiter, metrics) = limiter(&clock);

        assert!(limiter.try_acquire("slack", 2));
        assert!(limiter.try_acquire("slack", 1));
        assert!(!limiter.try_acquire("slack", 1));
        assert_eq!(metrics.get(Metric::RateLimitRejected), 1);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let clock = TestClock::new();
        let (limiter, metrics) = limiter(&clock);
        assert!(limiter.try_acquire("slack", 3));

        limiter.acquire("slack", 1, Duration::from_secs(5)).await.unwrap();

        assert_eq!(clock.elapsed(), Duration::from_secs(1));
        assert_eq!(metrics.get(Metric::RateLimitTimeout), 0);
    }

    #[tokio::test]
    async fn acquire_times_out() {
        let clock = TestClock::new();
        let (limiter, metrics) = limiter(&clock);
        assert!(limiter.try_acquire("slack", 3));

        let err = limiter.acquire("slack", 1, Duration::from_millis(250)).await.unwrap_err();

        assert_eq!(err.code(), "RATE_LIMIT_TIMEOUT");
        assert!(err.is_admission_denied());
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
        assert_eq!(metrics.get(Metric::RateLimitTimeout), 1);
        assert_eq!(metrics.get(Metric::RateLimitRejected), 0);
    }

    #[tokio::test]
    async fn acquire_refuses_more_than_capacity() {
        let clock = TestClock::new();
        let (limiter, _) = limiter(&clock);
        let err = limiter.acquire("slack", 4, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
    }

    #[test]
    fn profiles_override_generic() {
        let clock = TestClock::new();
        let (limiter, _) = limiter(&clock);
        let limiter = limiter.with_profiles(builtin_profiles());

        assert_eq!(limiter.config_for("slack"), BucketConfig::per_second(1, 1));
        assert_eq!(limiter.config_for("unknown"), BucketConfig::per_second(3, 1));
        assert_eq!(limiter.available("crm"), 20);
    }

    #[test]
    fn configure_discards_existing_bucket() {
        let clock = TestClock::new();
        let (limiter, _) = limiter(&clock);
        assert!(limiter.try_acquire("crm", 3));
        assert_eq!(limiter.available("crm"), 0);

        limiter.configure("crm", BucketConfig::per_second(8, 4)).unwrap();

        assert_eq!(limiter.available("crm"), 8);
        assert!(limiter.configure("crm", BucketConfig::per_second(0, 1)).is_err());
    }

    #[test]
    fn snapshots_cover_profiles_and_buckets() {
        let clock = TestClock::new();
        let (limiter, _) = limiter(&clock);
        let limiter = limiter.with_profiles([("voice".to_string(), BucketConfig::per_second(2, 1))]);
        limiter.try_acquire("adhoc", 1);

        let snapshots = limiter.snapshots();
        let names: Vec<_> = snapshots.iter().map(|s| s.destination.as_str()).collect();
        assert_eq!(names, ["adhoc", "voice"]);
        assert_eq!(snapshots[0].available, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_try_acquire_grants_exactly_capacity() {
        let clock = TestClock::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let limiter = Arc::new(RateLimiter::new(
            BucketConfig::per_second(10, 1),
            Arc::new(clock.clone()),
            metrics.clone(),
        ));

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.try_acquire("crm", 1) })
            })
            .collect();
        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 10);
        assert_eq!(metrics.get(Metric::RateLimitRejected), 90);
        assert_eq!(limiter.available("crm"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn configure_racing_acquires_leaves_new_profile_in_effect() {
        let clock = TestClock::new();
        let (limiter, _) = limiter(&clock);
        let limiter = Arc::new(limiter);
        let updated = BucketConfig::per_second(50, 5);

        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    if i == 32 {
                        limiter.configure("slack", updated).unwrap();
                    } else {
                        limiter.try_acquire("slack", 1);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(limiter.config_for("slack"), updated);
        assert_eq!(limiter.with_bucket("slack", |bucket, _| bucket.config()), updated);
    }
}
