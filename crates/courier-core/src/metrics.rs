//! Process-wide delivery counters with Prometheus text exposition.
//!
//! Counters are addressed by name and spring into existence at zero on first
//! use. Known names are listed in [`Metric`]; anything else goes through
//! [`Metric::Custom`]. All operations are safe to call concurrently from the
//! worker and request handlers.

use std::{borrow::Cow, collections::BTreeMap};

use dashmap::{mapref::entry::Entry, DashMap};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

/// Content type of [`MetricsRegistry::render`] output.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Counters emitted by the delivery pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Events stored for the first time.
    EventsIngested,
    /// Ingestions ignored because the id already existed.
    EventsDuplicate,
    /// Delivery jobs inserted.
    JobsEnqueued,
    /// Dead-lettered jobs moved back to retry.
    JobsReplayed,
    /// Individual HTTP attempts sent to a transport.
    OutboundAttempt,
    /// Jobs delivered successfully.
    OutboundOk,
    /// Jobs rescheduled after a failed attempt.
    OutboundRetry,
    /// Jobs dead-lettered.
    OutboundFailed,
    /// Jobs that used their whole attempt budget.
    RetryExhausted,
    /// Backoff retries inside a single outbound call.
    CallRetry,
    /// Breaker transitions to open.
    CircuitOpen,
    /// Breaker transitions to closed.
    CircuitClose,
    /// Calls refused by an open breaker.
    CircuitRejected,
    /// Non-blocking token acquisitions that found the bucket empty.
    RateLimitRejected,
    /// Blocking token acquisitions that hit their deadline.
    RateLimitTimeout,
    /// Worker iterations that failed on storage access.
    WorkerErrors,
    /// Faults injected by the chaos transport.
    ChaosInjected,
    /// Any other counter name.
    Custom(String),
}

impl Metric {
    /// Every named metric, registered eagerly so scrapes show zeros.
    pub const KNOWN: [Self; 17] = [
        Self::EventsIngested,
        Self::EventsDuplicate,
        Self::JobsEnqueued,
        Self::JobsReplayed,
        Self::OutboundAttempt,
        Self::OutboundOk,
        Self::OutboundRetry,
        Self::OutboundFailed,
        Self::RetryExhausted,
        Self::CallRetry,
        Self::CircuitOpen,
        Self::CircuitClose,
        Self::CircuitRejected,
        Self::RateLimitRejected,
        Self::RateLimitTimeout,
        Self::WorkerErrors,
        Self::ChaosInjected,
    ];

    /// Exposition name.
    pub fn name(&self) -> Cow<'_, str> {
        let name = match self {
            Self::EventsIngested => "events_ingested",
            Self::EventsDuplicate => "events_duplicate",
            Self::JobsEnqueued => "jobs_enqueued",
            Self::JobsReplayed => "jobs_replayed",
            Self::OutboundAttempt => "outbound_attempt",
            Self::OutboundOk => "outbound_ok",
            Self::OutboundRetry => "outbound_retry",
            Self::OutboundFailed => "outbound_failed",
            Self::RetryExhausted => "retry_exhausted",
            Self::CallRetry => "call_retry",
            Self::CircuitOpen => "circuit_open",
            Self::CircuitClose => "circuit_close",
            Self::CircuitRejected => "circuit_rejected",
            Self::RateLimitRejected => "rate_limit_rejected",
            Self::RateLimitTimeout => "rate_limit_timeout",
            Self::WorkerErrors => "worker_errors",
            Self::ChaosInjected => "chaos_injected",
            Self::Custom(name) => return sanitize(name),
        };
        Cow::Borrowed(name)
    }

    fn help(&self) -> &'static str {
        match self {
            Self::EventsIngested => "Events stored for the first time",
            Self::EventsDuplicate => "Duplicate event ingestions ignored",
            Self::JobsEnqueued => "Delivery jobs enqueued",
            Self::JobsReplayed => "Dead-lettered jobs replayed",
            Self::OutboundAttempt => "Outbound HTTP attempts",
            Self::OutboundOk => "Delivery jobs completed successfully",
            Self::OutboundRetry => "Delivery jobs rescheduled after failure",
            Self::OutboundFailed => "Delivery jobs moved to failed",
            Self::RetryExhausted => "Delivery jobs that exhausted their attempts",
            Self::CallRetry => "Backoff retries inside outbound calls",
            Self::CircuitOpen => "Circuit breaker open transitions",
            Self::CircuitClose => "Circuit breaker close transitions",
            Self::CircuitRejected => "Calls rejected by an open circuit",
            Self::RateLimitRejected => "Rate limit token requests rejected",
            Self::RateLimitTimeout => "Rate limit waits that timed out",
            Self::WorkerErrors => "Delivery worker storage errors",
            Self::ChaosInjected => "Faults injected by chaos scenarios",
            Self::Custom(_) => "Custom counter",
        }
    }
}

impl From<&str> for Metric {
    fn from(name: &str) -> Self {
        Self::KNOWN
            .into_iter()
            .find(|metric| metric.name() == name)
            .unwrap_or_else(|| Self::Custom(name.to_string()))
    }
}

/// Maps an arbitrary string onto the Prometheus name alphabet.
fn sanitize(name: &str) -> Cow<'_, str> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':');
    if valid {
        return Cow::Borrowed(name);
    }
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == ':' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    Cow::Owned(out)
}

/// Named counters backed by a Prometheus registry.
#[derive(Debug)]
pub struct MetricsRegistry {
    registry: Registry,
    counters: DashMap<String, IntCounter>,
}

impl MetricsRegistry {
    /// Creates a registry with every known counter at zero.
    pub fn new() -> Self {
        let metrics = Self { registry: Registry::new(), counters: DashMap::new() };
        for metric in &Metric::KNOWN {
            metrics.counter(metric);
        }
        metrics
    }

    fn counter(&self, metric: &Metric) -> Option<IntCounter> {
        let name = metric.name();
        if let Some(existing) = self.counters.get(name.as_ref()) {
            return Some(existing.clone());
        }

        let entry = self.counters.entry(name.to_string());
        let counter = match entry {
            Entry::Occupied(occupied) => return Some(occupied.get().clone()),
            Entry::Vacant(vacant) => match IntCounter::new(name.as_ref(), metric.help()) {
                Ok(counter) => vacant.insert(counter).clone(),
                Err(e) => {
                    tracing::warn!(metric = %name, error = %e, "failed to create counter");
                    return None;
                },
            },
        };

        if let Err(e) = self.registry.register(Box::new(counter.clone())) {
            tracing::warn!(metric = %name, error = %e, "failed to register counter");
        }
        Some(counter)
    }

    /// Adds `value` to a counter.
    ///
    /// Increments share the entry's read lock, so they run concurrently with
    /// each other but never inside a [`set`](Self::set).
    pub fn inc_by(&self, metric: impl Into<Metric>, value: u64) {
        let metric = metric.into();
        if self.counter(&metric).is_none() {
            return;
        }
        if let Some(counter) = self.counters.get(metric.name().as_ref()) {
            counter.inc_by(value);
        }
    }

    /// Adds one to a counter.
    pub fn inc(&self, metric: impl Into<Metric>) {
        self.inc_by(metric, 1);
    }

    /// Overwrites a counter.
    ///
    /// Reset and add run under the entry's write lock; an increment racing
    /// with `set` lands either before it (and is overwritten) or after it.
    pub fn set(&self, metric: impl Into<Metric>, value: u64) {
        let metric = metric.into();
        if self.counter(&metric).is_none() {
            return;
        }
        if let Some(counter) = self.counters.get_mut(metric.name().as_ref()) {
            counter.reset();
            counter.inc_by(value);
        }
    }

    /// Current value, zero for counters never touched.
    pub fn get(&self, metric: impl Into<Metric>) -> u64 {
        let metric = metric.into();
        self.counters.get(metric.name().as_ref()).map_or(0, |c| c.get())
    }

    /// Every counter and its value, ordered by name.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.iter().map(|entry| (entry.key().clone(), entry.value().get())).collect()
    }

    /// Text exposition with `HELP`, `TYPE` and value lines per counter.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            tracing::error!(error = %e, "failed to encode metrics");
            return String::from("# error encoding metrics\n");
        }

        String::from_utf8(buffer).unwrap_or_else(|_| String::from("# metrics were not utf-8\n"))
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&String> for Metric {
    fn from(name: &String) -> Self {
        Self::from(name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn known_counters_start_at_zero() {
        let metrics = MetricsRegistry::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.len(), Metric::KNOWN.len());
        assert!(snapshot.values().all(|v| *v == 0));
    }

    #[test]
    fn inc_set_and_get() {
        let metrics = MetricsRegistry::new();
        metrics.inc(Metric::OutboundOk);
        metrics.inc_by(Metric::OutboundOk, 4);
        assert_eq!(metrics.get(Metric::OutboundOk), 5);
        assert_eq!(metrics.get("outbound_ok"), 5);

        metrics.set(Metric::OutboundOk, 2);
        assert_eq!(metrics.get(Metric::OutboundOk), 2);
    }

    #[test]
    fn custom_names_auto_initialize() {
        let metrics = MetricsRegistry::new();
        assert_eq!(metrics.get("slack-posts"), 0);

        metrics.inc("slack-posts");
        assert_eq!(metrics.get("slack-posts"), 1);
        assert_eq!(metrics.snapshot().get("slack_posts"), Some(&1));
    }

    #[test]
    fn string_names_resolve_to_known_metrics() {
        assert_eq!(Metric::from("retry_exhausted"), Metric::RetryExhausted);
        assert_eq!(Metric::from("9lives"), Metric::Custom("9lives".into()));
        assert_eq!(Metric::from("9lives").name(), "_9lives");
    }

    #[test]
    fn render_emits_help_type_and_value() {
        let metrics = MetricsRegistry::new();
        metrics.inc_by(Metric::CircuitOpen, 3);

        let text = metrics.render();
        assert!(text.contains("# HELP circuit_open Circuit breaker open transitions"));
        assert!(text.contains("# TYPE circuit_open counter"));
        assert!(text.contains("circuit_open 3"));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let metrics = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        metrics.inc("burst");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.get("burst"), 8_000);
    }

    #[test]
    fn set_is_never_observed_half_applied() {
        let metrics = Arc::new(MetricsRegistry::new());
        metrics.set("queue_depth", 1);

        // Increments keep the value odd; only a reset caught mid-set is even.
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for i in 0..2_000_u64 {
                        if w == 0 {
                            metrics.set("queue_depth", 2 * i + 1);
                        } else {
                            metrics.inc_by("queue_depth", 2);
                        }
                    }
                })
            })
            .collect();
        let reader = {
            let metrics = metrics.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    assert_eq!(metrics.get("queue_depth") % 2, 1);
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(metrics.get("queue_depth") % 2, 1);
    }
}
