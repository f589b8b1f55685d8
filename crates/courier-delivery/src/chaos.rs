//! Fault injection for exercising the resilience layer.
//!
//! A [`ChaosEngine`] holds named, independently started scenarios, each with
//! an optional expiry. [`ChaosTransport`] wraps the real [`Transport`] and
//! consults the engine on every send; with no active scenario it is a plain
//! pass-through. Nothing here is wired into the production path unless the
//! operator enables chaos explicitly.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use courier_core::{Clock, Metric, MetricsRegistry};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    error::{DeliveryError, Result},
    transport::{OutboundRequest, Transport, TransportResponse},
};

fn default_failure_status() -> u16 {
    503
}

/// A single kind of injected fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fault {
    /// Every call to `destination` fails with a connection error.
    KillDestination {
        /// Destination taken down
        destination: String,
    },
    /// Calls are delayed before being sent.
    Latency {
        /// Affected destination, or every destination when absent
        #[serde(default)]
        destination: Option<String>,
        /// Added delay in milliseconds
        delay_ms: u64,
    },
    /// A fraction of calls is answered with an error status.
    IntermittentFailure {
        /// Affected destination, or every destination when absent
        #[serde(default)]
        destination: Option<String>,
        /// Probability in `[0, 1]` that a call fails
        failure_rate: f64,
        /// Status returned for failed calls
        #[serde(default = "default_failure_status")]
        status: u16,
    },
}

impl Fault {
    /// Short label for logs.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::KillDestination { .. } => "kill_destination",
            Self::Latency { .. } => "latency",
            Self::IntermittentFailure { .. } => "intermittent_failure",
        }
    }

    /// Whether this fault targets `destination`.
    pub fn applies_to(&self, destination: &str) -> bool {
        match self {
            Self::KillDestination { destination: target } => target == destination,
            Self::Latency { destination: target, .. }
            | Self::IntermittentFailure { destination: target, .. } => {
                target.as_deref().is_none_or(|t| t == destination)
            },
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::KillDestination { destination } if destination.trim().is_empty() => {
                Err(DeliveryError::configuration("kill_destination needs a destination"))
            },
            Self::IntermittentFailure { failure_rate, .. }
                if !(0.0..=1.0).contains(failure_rate) =>
            {
                Err(DeliveryError::configuration(format!(
                    "failure_rate must be within [0, 1], got {failure_rate}"
                )))
            },
            Self::IntermittentFailure { status, .. } if !(100..=599).contains(status) => {
                Err(DeliveryError::configuration(format!("invalid status {status}")))
            },
            _ => Ok(()),
        }
    }
}

/// Request to start a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaosScenario {
    /// What to inject.
    #[serde(flatten)]
    pub fault: Fault,
    /// Lifetime in milliseconds; runs until stopped when absent.
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl ChaosScenario {
    /// Scenario that runs until stopped.
    pub const fn new(fault: Fault) -> Self {
        Self { fault, duration_ms: None }
    }

    /// Sets the lifetime.
    #[must_use]
    pub fn lasting(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// A running scenario as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveScenario {
    /// Scenario name.
    pub name: String,
    /// Injected fault.
    pub fault: Fault,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Expiry, if any.
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Armed {
    scenario: ActiveScenario,
    deadline: Option<Instant>,
}

/// Registry of named fault scenarios.
#[derive(Debug)]
pub struct ChaosEngine {
    scenarios: DashMap<String, Armed>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
}

impl ChaosEngine {
    /// Creates an engine with nothing running.
    pub fn new(clock: Arc<dyn Clock>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { scenarios: DashMap::new(), clock, metrics }
    }

    /// Starts or replaces scenario `name`.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an empty name or an invalid fault.
    pub fn start(&self, name: &str, scenario: ChaosScenario) -> Result<ActiveScenario> {
        if name.trim().is_empty() {
            return Err(DeliveryError::configuration("scenario name must not be empty"));
        }
        scenario.fault.validate()?;

        let lifetime = scenario.duration_ms.map(Duration::from_millis);
        let active = ActiveScenario {
            name: name.to_string(),
            fault: scenario.fault,
            started_at: self.clock.now_utc(),
            expires_at: lifetime.map(|d| self.clock.utc_after(d)),
        };
        let deadline = lifetime.and_then(|d| self.clock.now().checked_add(d));

        tracing::warn!(
            scenario = name,
            fault = active.fault.label(),
            expires_at = ?active.expires_at,
            "chaos scenario started"
        );
        self.scenarios
            .insert(name.to_string(), Armed { scenario: active.clone(), deadline });
        Ok(active)
    }

    /// Stops scenario `name`; returns whether it was running.
    pub fn stop(&self, name: &str) -> bool {
        self.purge_expired();
        let stopped = self.scenarios.remove(name).is_some();
        if stopped {
            tracing::info!(scenario = name, "chaos scenario stopped");
        }
        stopped
    }

    /// Stops every scenario.
    pub fn stop_all(&self) {
        self.scenarios.clear();
    }

    /// Running scenarios, sorted by name.
    pub fn active(&self) -> Vec<ActiveScenario> {
        self.purge_expired();
        let mut active: Vec<ActiveScenario> =
            self.scenarios.iter().map(|entry| entry.scenario.clone()).collect();
        active.sort_by(|a, b| a.name.cmp(&b.name));
        active
    }

    /// Faults currently targeting `destination`.
    pub fn faults_for(&self, destination: &str) -> Vec<Fault> {
        self.purge_expired();
        self.scenarios
            .iter()
            .filter(|entry| entry.scenario.fault.applies_to(destination))
            .map(|entry| entry.scenario.fault.clone())
            .collect()
    }

    fn purge_expired(&self) {
        let now = self.clock.now();
        self.scenarios.retain(|name, armed| {
            let alive = armed.deadline.is_none_or(|deadline| now < deadline);
            if !alive {
                tracing::info!(scenario = %name, "chaos scenario expired");
            }
            alive
        });
    }

    fn injected(&self) {
        self.metrics.inc(Metric::ChaosInjected);
    }
}

/// [`Transport`] that applies active chaos scenarios before delegating.
#[derive(Debug, Clone)]
pub struct ChaosTransport {
    inner: Arc<dyn Transport>,
    engine: Arc<ChaosEngine>,
}

impl ChaosTransport {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Transport>, engine: Arc<ChaosEngine>) -> Self {
        Self { inner, engine }
    }
}

#[async_trait]
impl Transport for ChaosTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse> {
        let faults = self.engine.faults_for(&request.destination);
        if faults.is_empty() {
            return self.inner.send(request).await;
        }

        let latency: Duration = faults
            .iter()
            .filter_map(|fault| match fault {
                Fault::Latency { delay_ms, .. } => Some(Duration::from_millis(*delay_ms)),
                _ => None,
            })
            .sum();
        if !latency.is_zero() {
            self.engine.injected();
            if latency >= request.timeout {
                self.engine.clock.sleep(request.timeout).await;
                return Err(DeliveryError::timeout(
                    u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX),
                ));
            }
            self.engine.clock.sleep(latency).await;
        }

        for fault in &faults {
            match fault {
                Fault::KillDestination { destination } => {
                    self.engine.injected();
                    return Err(DeliveryError::network(format!(
                        "connection refused: {destination} is down (chaos)"
                    )));
                },
                Fault::IntermittentFailure { failure_rate, status, .. }
                    if rand::rng().random_bool(*failure_rate) =>
                {
                    self.engine.injected();
                    return Ok(TransportResponse {
                        status: *status,
                        headers: Default::default(),
                        body: Bytes::from_static(b"injected failure"),
                    });
                },
                _ => {},
            }
        }

        self.inner.send(request).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicU32, Ordering},
    };

    use courier_core::TestClock;

    use super::*;

    #[derive(Debug, Default)]
    struct CountingTransport {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&self, _request: OutboundRequest) -> Result<TransportResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TransportResponse::empty(200))
        }
    }

    fn request(destination: &str) -> OutboundRequest {
        OutboundRequest {
            destination: destination.to_string(),
            url: "http://localhost/hook".to_string(),
            headers: HashMap::new(),
            body: Bytes::from_static(b"{}"),
            timeout: Duration::from_secs(1),
            attempt: 1,
        }
    }

    fn setup() -> (TestClock, Arc<ChaosEngine>, Arc<CountingTransport>, ChaosTransport) {
        let clock = TestClock::new();
        let metrics = Arc::new(MetricsRegistry::new());
        let engine = Arc::new(ChaosEngine::new(Arc::new(clock.clone()), metrics));
        let inner = Arc::new(CountingTransport::default());
        let transport = ChaosTransport::new(inner.clone(), engine.clone());
        (clock, engine, inner, transport)
    }

    #[tokio::test]
    async fn passes_through_without_scenarios() {
        let (_, _, inner, transport) = setup();
        let response = transport.send(request("crm")).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn killed_destination_never_reaches_inner_transport() {
        let (_, engine, inner, transport) = setup();
        engine
            .start("outage", ChaosScenario::new(Fault::KillDestination {
                destination: "crm".into(),
            }))
            .unwrap();

        let err = transport.send(request("crm")).await.unwrap_err();
        assert_eq!(err.code(), "NETWORK");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);

        transport.send(request("slack")).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.metrics.get(Metric::ChaosInjected), 1);
    }

    #[tokio::test]
    async fn scenarios_expire() {
        let (clock, engine, _, transport) = setup();
        engine
            .start(
                "outage",
                ChaosScenario::new(Fault::KillDestination { destination: "crm".into() })
                    .lasting(Duration::from_secs(30)),
            )
            .unwrap();
        assert_eq!(engine.active().len(), 1);

        clock.advance(Duration::from_secs(31));
        assert!(engine.active().is_empty());
        assert!(transport.send(request("crm")).await.is_ok());
    }

    #[tokio::test]
    async fn latency_past_deadline_times_out() {
        let (clock, engine, inner, transport) = setup();
        engine
            .start("slow", ChaosScenario::new(Fault::Latency {
                destination: None,
                delay_ms: 5_000,
            }))
            .unwrap();

        let err = transport.send(request("voice")).await.unwrap_err();
        assert_eq!(err, DeliveryError::timeout(1_000));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
        assert!(clock.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn certain_intermittent_failure_returns_status() {
        let (_, engine, inner, transport) = setup();
        engine
            .start("flaky", ChaosScenario::new(Fault::IntermittentFailure {
                destination: Some("crm".into()),
                failure_rate: 1.0,
                status: 502,
            }))
            .unwrap();

        let response = transport.send(request("crm")).await.unwrap();
        assert_eq!(response.status, 502);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_faults_are_rejected() {
        let (_, engine, _, _) = setup();
        let bad_rate = ChaosScenario::new(Fault::IntermittentFailure {
            destination: None,
            failure_rate: 1.5,
            status: 503,
        });
        assert!(engine.start("x", bad_rate).is_err());
        assert!(engine
            .start("", ChaosScenario::new(Fault::Latency { destination: None, delay_ms: 1 }))
            .is_err());
    }

    #[test]
    fn stop_reports_whether_running() {
        let (_, engine, _, _) = setup();
        engine
            .start("slow", ChaosScenario::new(Fault::Latency { destination: None, delay_ms: 10 }))
            .unwrap();
        assert!(engine.stop("slow"));
        assert!(!engine.stop("slow"));
    }

    #[test]
    fn scenario_parses_from_json() {
        let scenario: ChaosScenario = serde_json::from_value(serde_json::json!({
            "kind": "intermittent_failure",
            "failure_rate": 0.25,
            "duration_ms": 60000
        }))
        .unwrap();
        assert_eq!(scenario.duration_ms, Some(60_000));
        assert_eq!(scenario.fault, Fault::IntermittentFailure {
            destination: None,
            failure_rate: 0.25,
            status: 503,
        });
    }
}
