//! Per-destination circuit breakers.
//!
//! Each destination gets a three-state breaker, created lazily the first
//! time its name is seen and kept for the life of the process.
//!
//! ```text
//!   CLOSED --(failure_threshold consecutive failures)--> OPEN
//!   OPEN   --(cooldown elapsed, next permission check)--> HALF_OPEN
//!   HALF_OPEN --(any failure)--> OPEN (cooldown restarts)
//!   HALF_OPEN --(success_threshold consecutive successes)--> CLOSED
//! ```
//!
//! Every check-and-transition happens under one lock acquisition, so
//! concurrent callers for the same destination never observe a half-applied
//! transition. Open/close hooks run after the lock is released.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{MetricsRegistry, RealClock};
//! use courier_delivery::circuit::{CircuitBreakerRegistry, CircuitConfig};
//!
//! # async fn example() {
//! let breakers = CircuitBreakerRegistry::new(
//!     CircuitConfig::default(),
//!     Arc::new(RealClock::new()),
//!     Arc::new(MetricsRegistry::new()),
//! );
//!
//! if breakers.can_request("slack").await {
//!     let outcome: Result<(), ()> = Ok(());
//!     match outcome {
//!         Ok(()) => breakers.record_success("slack").await,
//!         Err(()) => breakers.record_failure("slack").await,
//!     }
//! }
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use courier_core::{Clock, Metric, MetricsRegistry};
use dashmap::{mapref::one::RefMut, DashMap};
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Thresholds for one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures in CLOSED that open the breaker.
    pub failure_threshold: u32,
    /// Consecutive successes in HALF_OPEN that close the breaker.
    pub success_threshold: u32,
    /// How long OPEN rejects before allowing a probe.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, success_threshold: 2, cooldown: Duration::from_secs(30) }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected without a network call.
    Open,
    /// Probing whether the destination recovered.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Observable view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Destination name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted in CLOSED.
    pub consecutive_failures: u32,
    /// Consecutive successes counted in HALF_OPEN.
    pub consecutive_successes: u32,
    /// When OPEN will next admit a probe.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Receives breaker transitions.
///
/// Called outside the breaker lock; implementations may log, alert, or
/// inspect the registry.
pub trait CircuitListener: Send + Sync + fmt::Debug {
    /// The breaker moved to OPEN.
    fn on_open(&self, snapshot: &CircuitSnapshot);

    /// The breaker moved to CLOSED.
    fn on_close(&self, snapshot: &CircuitSnapshot);
}

/// Listener that records transitions in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl CircuitListener for LoggingListener {
    fn on_open(&self, snapshot: &CircuitSnapshot) {
        tracing::warn!(
            destination = %snapshot.name,
            next_attempt_at = ?snapshot.next_attempt_at,
            "circuit opened"
        );
    }

    fn on_close(&self, snapshot: &CircuitSnapshot) {
        tracing::info!(destination = %snapshot.name, "circuit closed");
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl Breaker {
    const fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            next_attempt_at: None,
        }
    }

    fn snapshot(&self, name: &str) -> CircuitSnapshot {
        CircuitSnapshot {
            name: name.to_string(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            next_attempt_at: self.next_attempt_at,
        }
    }
}

enum Transition {
    Opened(CircuitSnapshot),
    Closed(CircuitSnapshot),
}

/// Registry owning one breaker per destination.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitConfig,
    overrides: HashMap<String, CircuitConfig>,
    circuits: DashMap<String, Breaker>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    listeners: Vec<Arc<dyn CircuitListener>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry applying `config` to every destination.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            config,
            overrides: HashMap::new(),
            circuits: DashMap::new(),
            clock,
            metrics,
            listeners: vec![Arc::new(LoggingListener)],
        }
    }

    /// Uses `config` instead of the default for `destination`.
    #[must_use]
    pub fn with_override(mut self, destination: impl Into<String>, config: CircuitConfig) -> Self {
        self.overrides.insert(destination.into(), config);
        self
    }

    /// Adds a transition listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn CircuitListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Thresholds in effect for `destination`.
    pub fn config_for(&self, destination: &str) -> &CircuitConfig {
        self.overrides.get(destination).unwrap_or(&self.config)
    }

    /// Exclusive handle on `destination`'s breaker, created on first use.
    ///
    /// Holds the shard lock until dropped; never keep it across an await.
    fn breaker(&self, destination: &str) -> RefMut<'_, String, Breaker> {
        self.circuits.entry(destination.to_string()).or_insert_with(Breaker::new)
    }

    /// Whether a request to `destination` may be attempted right now.
    ///
    /// Moves OPEN to HALF_OPEN once the cooldown has elapsed and admits that
    /// call. Call immediately before each attempt; the answer must not be
    /// cached.
    pub async fn can_request(&self, destination: &str) -> bool {
        let cooldown = self.config_for(destination).cooldown;
        let now = self.clock.now();

        let mut breaker = self.breaker(destination);

        match breaker.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = breaker.opened_at.map_or(cooldown, |at| now.duration_since(at));
                if elapsed >= cooldown {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.consecutive_successes = 0;
                    breaker.next_attempt_at = None;
                    tracing::info!(destination, "circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            },
        }
    }

    /// Like [`can_request`](Self::can_request) but yields a `CIRCUIT_OPEN`
    /// error on rejection.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::CircuitOpen` when the breaker refuses.
    pub async fn check(&self, destination: &str) -> Result<()> {
        if self.can_request(destination).await {
            Ok(())
        } else {
            self.metrics.inc(Metric::CircuitRejected);
            tracing::debug!(destination, "request rejected by open circuit");
            Err(DeliveryError::circuit_open(destination))
        }
    }

    /// Records a successful attempt.
    pub async fn record_success(&self, destination: &str) {
        let success_threshold = self.config_for(destination).success_threshold;

        let transition = {
            let mut breaker = self.breaker(destination);
            breaker.consecutive_failures = 0;

            match breaker.state {
                CircuitState::Closed => None,
                CircuitState::Open => {
                    tracing::debug!(destination, "success recorded while circuit open");
                    None
                },
                CircuitState::HalfOpen => {
                    breaker.consecutive_successes += 1;
                    if breaker.consecutive_successes >= success_threshold {
                        *breaker = Breaker::new();
                        Some(Transition::Closed(breaker.snapshot(destination)))
                    } else {
                        None
                    }
                },
            }
        };

        self.announce(transition);
    }

    /// Records a failed attempt.
    pub async fn record_failure(&self, destination: &str) {
        let config = self.config_for(destination).clone();
        let now = self.clock.now();
        let reopen_at = self.clock.utc_after(config.cooldown);

        let transition = {
            let mut breaker = self.breaker(destination);
            breaker.consecutive_successes = 0;

            let should_open = match breaker.state {
                CircuitState::Closed => {
                    breaker.consecutive_failures += 1;
                    breaker.consecutive_failures >= config.failure_threshold
                },
                CircuitState::HalfOpen => true,
                CircuitState::Open => false,
            };

            if should_open {
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(now);
                breaker.next_attempt_at = Some(reopen_at);
                Some(Transition::Opened(breaker.snapshot(destination)))
            } else {
                None
            }
        };

        self.announce(transition);
    }

    /// Current view of `destination`'s breaker, creating it if unseen.
    pub async fn state(&self, destination: &str) -> CircuitSnapshot {
        self.breaker(destination).snapshot(destination)
    }

    /// Every known breaker, ordered by name.
    pub async fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<_> =
            self.circuits.iter().map(|entry| entry.value().snapshot(entry.key())).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Forces a breaker into `state`, firing the matching hook.
    pub async fn force_state(&self, destination: &str, state: CircuitState) {
        let reopen_at = self.clock.utc_after(self.config_for(destination).cooldown);
        let now = self.clock.now();

        let transition = {
            let mut breaker = self.breaker(destination);
            match state {
                CircuitState::Closed => {
                    *breaker = Breaker::new();
                    Some(Transition::Closed(breaker.snapshot(destination)))
                },
                CircuitState::Open => {
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(now);
                    breaker.next_attempt_at = Some(reopen_at);
                    Some(Transition::Opened(breaker.snapshot(destination)))
                },
                CircuitState::HalfOpen => {
                    breaker.state = CircuitState::HalfOpen;
                    breaker.consecutive_successes = 0;
                    breaker.next_attempt_at = None;
                    None
                },
            }
        };

        self.announce(transition);
    }

    fn announce(&self, transition: Option<Transition>) {
        match transition {
            Some(Transition::Opened(snapshot)) => {
                self.metrics.inc(Metric::CircuitOpen);
                for listener in &self.listeners {
                    listener.on_open(&snapshot);
                }
            },
            Some(Transition::Closed(snapshot)) => {
                self.metrics.inc(Metric::CircuitClose);
                for listener in &self.listeners {
                    listener.on_close(&snapshot);
                }
            },
            None => {},
        }
    }
}
