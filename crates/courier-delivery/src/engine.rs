//! Top-level owner of the delivery subsystem.
//!
//! [`DeliveryEngine`] wires the breaker registry, rate limiter, retrying
//! client, job queue, router and optional chaos layer together, and runs
//! the single worker loop as a background task.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use courier_core::{Clock, Event, JobId, MetricsRegistry};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    chaos::{ChaosEngine, ChaosTransport},
    circuit::{CircuitBreakerRegistry, CircuitConfig},
    client::{ClientConfig, OutboundClient},
    error::Result,
    queue::DeliveryQueue,
    ratelimit::{builtin_profiles, BucketConfig, RateLimiter, GENERIC_PROFILE},
    retry::RetryPolicy,
    routing::{EventRouter, Route},
    storage::QueueStorage,
    transport::Transport,
    worker::{DeliveryWorker, WorkerConfig},
};

/// Rate-limit profiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Profile for destinations without their own.
    pub generic: BucketConfig,
    /// Per-destination profiles.
    pub profiles: HashMap<String, BucketConfig>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { generic: GENERIC_PROFILE, profiles: builtin_profiles() }
    }
}

/// Everything the engine needs to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeliveryConfig {
    /// Polling parameters.
    pub worker: WorkerConfig,
    /// Per-call timeout, backoff and rate-limit wait.
    pub client: ClientConfig,
    /// Queue-level retry schedule.
    pub retry: RetryPolicy,
    /// Default breaker thresholds.
    pub circuit: CircuitConfig,
    /// Breaker thresholds for specific destinations.
    pub circuit_overrides: HashMap<String, CircuitConfig>,
    /// Token-bucket profiles.
    pub rate_limits: RateLimitConfig,
    /// Forwarding rules.
    pub routes: Vec<Route>,
    /// Wrap the transport in the chaos layer.
    pub chaos_enabled: bool,
}

/// Delivery subsystem with a startable, stoppable worker.
pub struct DeliveryEngine {
    config: DeliveryConfig,
    queue: Arc<DeliveryQueue>,
    client: Arc<OutboundClient>,
    router: Arc<EventRouter>,
    chaos: Option<Arc<ChaosEngine>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    running: Arc<AtomicBool>,
    cancellation_token: Mutex<CancellationToken>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("running", &self.is_running())
            .field("chaos", &self.chaos.is_some())
            .finish_non_exhaustive()
    }
}

impl DeliveryEngine {
    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an invalid bucket profile or route.
    pub fn new(
        config: DeliveryConfig,
        storage: Arc<dyn QueueStorage>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        config.rate_limits.generic.validate()?;
        for profile in config.rate_limits.profiles.values() {
            profile.validate()?;
        }
        let router = Arc::new(EventRouter::new(config.routes.clone())?);

        let mut breakers =
            CircuitBreakerRegistry::new(config.circuit.clone(), clock.clone(), metrics.clone());
        for (destination, overrides) in &config.circuit_overrides {
            breakers = breakers.with_override(destination.clone(), overrides.clone());
        }

        let limiter = RateLimiter::new(config.rate_limits.generic, clock.clone(), metrics.clone())
            .with_profiles(config.rate_limits.profiles.clone());

        let (transport, chaos) = if config.chaos_enabled {
            let chaos = Arc::new(ChaosEngine::new(clock.clone(), metrics.clone()));
            let wrapped: Arc<dyn Transport> =
                Arc::new(ChaosTransport::new(transport, chaos.clone()));
            warn!("chaos layer enabled on the outbound transport");
            (wrapped, Some(chaos))
        } else {
            (transport, None)
        };

        let client = Arc::new(OutboundClient::new(
            transport,
            Arc::new(breakers),
            Arc::new(limiter),
            metrics.clone(),
            clock.clone(),
            config.client.clone(),
        ));
        let queue = Arc::new(DeliveryQueue::new(storage, clock.clone(), metrics.clone()));

        Ok(Self {
            config,
            queue,
            client,
            router,
            chaos,
            clock,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
            cancellation_token: Mutex::new(CancellationToken::new()),
            worker_handle: Mutex::new(None),
        })
    }

    fn worker(&self, cancellation_token: CancellationToken) -> DeliveryWorker {
        DeliveryWorker::new(
            self.queue.storage().clone(),
            self.client.clone(),
            self.router.clone(),
            self.config.retry.clone(),
            self.config.worker.clone(),
            self.clock.clone(),
            self.metrics.clone(),
            cancellation_token,
        )
    }

    /// Spawns the worker loop; returns `false` if it was already running.
    pub async fn start(&self) -> bool {
        if self.running.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err()
        {
            info!("delivery engine already running");
            return false;
        }

        let token = CancellationToken::new();
        *self.cancellation_token.lock().await = token.clone();

        let worker = self.worker(token);
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = worker.run().await {
                error!(error = %err, "delivery worker exited with error");
            }
            running.store(false, Ordering::SeqCst);
        });
        *self.worker_handle.lock().await = Some(handle);

        info!(
            batch_size = self.config.worker.batch_size,
            routes = self.router.routes().len(),
            "delivery engine started"
        );
        true
    }

    /// Cooperatively stops the worker and waits for it to finish the job
    /// in hand.
    pub async fn stop(&self) {
        self.cancellation_token.lock().await.cancel();
        let handle = self.worker_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "delivery worker task panicked");
            }
            info!("delivery engine stopped");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the worker loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Processes one batch inline, without the background loop.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the job store fails.
    pub async fn process_batch(&self) -> Result<usize> {
        self.worker(CancellationToken::new()).process_batch().await
    }

    /// Enqueues one job per route matching `event`.
    ///
    /// # Errors
    ///
    /// Returns the first enqueue error.
    pub async fn route_event(&self, event: &Event) -> Result<Vec<JobId>> {
        let jobs = self.router.jobs_for(event);
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        self.queue.enqueue_all(jobs).await
    }

    /// Enqueues jobs for the routes of `event` that have no job yet.
    ///
    /// An event stored by an ingestion whose enqueue failed has no jobs, or
    /// only some of them. Calling this on redelivery of that event fills the
    /// gap; for a fully routed event it enqueues nothing.
    ///
    /// # Errors
    ///
    /// Returns the first lookup or enqueue error.
    pub async fn route_missing(&self, event: &Event) -> Result<Vec<JobId>> {
        let existing = self.queue.jobs_for_event(&event.id).await?;
        let missing: Vec<_> = self
            .router
            .jobs_for(event)
            .into_iter()
            .filter(|job| !existing.iter().any(|e| e.destination == job.destination))
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }
        warn!(
            event_id = %event.id,
            missing = missing.len(),
            "re-enqueueing deliveries lost by an earlier ingestion"
        );
        self.queue.enqueue_all(missing).await
    }

    /// Engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Job queue.
    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Retrying client; also usable for ad-hoc calls.
    pub fn client(&self) -> &Arc<OutboundClient> {
        &self.client
    }

    /// Breakers shared by every outbound call.
    pub fn circuits(&self) -> &Arc<CircuitBreakerRegistry> {
        self.client.breakers()
    }

    /// Buckets shared by every outbound call.
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        self.client.limiter()
    }

    /// Chaos engine, when enabled.
    pub fn chaos(&self) -> Option<&Arc<ChaosEngine>> {
        self.chaos.as_ref()
    }

    /// Event router.
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Shared metrics.
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Clock used for every time decision.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use courier_core::{JobStatus, TestClock};
    use serde_json::json;

    use super::*;
    use crate::{
        storage::memory::MemoryQueueStorage,
        transport::{OutboundRequest, TransportResponse},
    };

    #[derive(Debug)]
    struct AlwaysOk;

    #[async_trait]
    impl Transport for AlwaysOk {
        async fn send(&self, _request: OutboundRequest) -> Result<TransportResponse> {
            Ok(TransportResponse::json(200, &json!({"ok": true})))
        }
    }

    fn engine(config: DeliveryConfig) -> DeliveryEngine {
        DeliveryEngine::new(
            config,
            Arc::new(MemoryQueueStorage::new()),
            Arc::new(AlwaysOk),
            Arc::new(TestClock::new()),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_is_cooperative() {
        let engine = engine(DeliveryConfig::default());
        assert!(engine.start().await);
        assert!(!engine.start().await);
        assert!(engine.is_running());

        engine.stop().await;
        assert!(!engine.is_running());

        assert!(engine.start().await);
        engine.stop().await;
    }

    #[tokio::test]
    async fn routes_events_to_matching_destinations() {
        let engine = engine(DeliveryConfig {
            routes: vec![
                Route::new("crm", "https://crm.example/hook").for_types(["lead.created"]),
                Route::new("slack", "https://hooks.example/slack"),
            ],
            ..DeliveryConfig::default()
        });
        let event = Event {
            id: "evt-1".into(),
            event_type: "page.viewed".into(),
            ts: chrono::Utc::now(),
            path: "/".into(),
            body: json!({}),
        };

        let ids = engine.route_event(&event).await.unwrap();
        assert_eq!(ids.len(), 1);

        assert_eq!(engine.process_batch().await.unwrap(), 1);
        let job = engine.queue().find_job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Ok);
    }

    #[tokio::test]
    async fn route_missing_fills_only_absent_destinations() {
        let storage = MemoryQueueStorage::new();
        let engine = DeliveryEngine::new(
            DeliveryConfig {
                routes: vec![
                    Route::new("crm", "https://crm.example/hook"),
                    Route::new("slack", "https://hooks.example/slack"),
                ],
                ..DeliveryConfig::default()
            },
            Arc::new(storage.clone()),
            Arc::new(AlwaysOk),
            Arc::new(TestClock::new()),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap();
        let event = Event {
            id: "evt-partial".into(),
            event_type: "lead.created".into(),
            ts: chrono::Utc::now(),
            path: "/".into(),
            body: json!({}),
        };

        // An earlier ingestion stored only the crm job.
        let crm = engine.router.jobs_for(&event).remove(0);
        engine.queue().enqueue(crm).await.unwrap();

        let ids = engine.route_missing(&event).await.unwrap();
        assert_eq!(ids.len(), 1);
        let filled = engine.queue().find_job(ids[0]).await.unwrap().unwrap();
        assert_eq!(filled.destination, "slack");

        assert!(engine.route_missing(&event).await.unwrap().is_empty());
        assert_eq!(storage.all_jobs().await.len(), 2);
    }

    #[test]
    fn invalid_profiles_are_rejected() {
        let mut config = DeliveryConfig::default();
        config.rate_limits.profiles.insert("crm".into(), BucketConfig::per_second(0, 1));
        let result = DeliveryEngine::new(
            config,
            Arc::new(MemoryQueueStorage::new()),
            Arc::new(AlwaysOk),
            Arc::new(TestClock::new()),
            Arc::new(MetricsRegistry::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn chaos_is_only_present_when_enabled() {
        assert!(engine(DeliveryConfig::default()).chaos().is_none());
        let enabled = engine(DeliveryConfig { chaos_enabled: true, ..DeliveryConfig::default() });
        assert!(enabled.chaos().is_some());
    }
}
