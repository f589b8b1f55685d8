//! Scripted [`Transport`] with call recording.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use courier_delivery::{DeliveryError, OutboundRequest, Transport, TransportResponse};
use serde_json::Value;

/// One scripted answer.
#[derive(Debug, Clone, PartialEq)]
pub enum StubReply {
    /// Empty body with this status.
    Status(u16),
    /// JSON body with this status.
    Json(u16, Value),
    /// 429 with a `Retry-After` header.
    TooManyRequests {
        /// Seconds sent in `Retry-After`
        retry_after: u64,
    },
    /// Connection-level failure.
    ConnectionReset,
}

impl StubReply {
    fn into_result(self) -> courier_delivery::Result<TransportResponse> {
        match self {
            Self::Status(status) => Ok(TransportResponse::empty(status)),
            Self::Json(status, body) => Ok(TransportResponse::json(status, &body)),
            Self::TooManyRequests { retry_after } => Ok(TransportResponse {
                status: 429,
                headers: HashMap::from([("retry-after".to_string(), retry_after.to_string())]),
                body: Bytes::new(),
            }),
            Self::ConnectionReset => Err(DeliveryError::network("connection reset by peer")),
        }
    }
}

#[derive(Debug)]
struct State {
    scripts: HashMap<String, VecDeque<StubReply>>,
    fallbacks: HashMap<String, StubReply>,
    default_reply: StubReply,
    latency: Option<Duration>,
    calls: Vec<OutboundRequest>,
}

/// Transport answering from per-destination scripts.
///
/// Each destination first consumes its queued replies, then repeats its
/// fallback, then the global default (`200`). Every request is recorded
/// before it is answered.
#[derive(Debug, Clone)]
pub struct StubTransport {
    state: Arc<Mutex<State>>,
}

impl Default for StubTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl StubTransport {
    /// Answers `200` to everything.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                scripts: HashMap::new(),
                fallbacks: HashMap::new(),
                default_reply: StubReply::Status(200),
                latency: None,
                calls: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Always answers `reply` for `destination` once its script is used up.
    pub fn always(&self, destination: &str, reply: StubReply) -> &Self {
        self.lock().fallbacks.insert(destination.to_string(), reply);
        self
    }

    /// Queues replies for `destination`, consumed in order.
    pub fn script(&self, destination: &str, replies: impl IntoIterator<Item = StubReply>) -> &Self {
        self.lock().scripts.entry(destination.to_string()).or_default().extend(replies);
        self
    }

    /// Reply for destinations with nothing configured.
    pub fn default_reply(&self, reply: StubReply) -> &Self {
        self.lock().default_reply = reply;
        self
    }

    /// Delays every answer by `latency` of real time.
    pub fn with_latency(&self, latency: Duration) -> &Self {
        self.lock().latency = Some(latency);
        self
    }

    /// Every recorded request.
    pub fn calls(&self) -> Vec<OutboundRequest> {
        self.lock().calls.clone()
    }

    /// Total requests seen.
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Requests seen for `destination`.
    pub fn calls_to(&self, destination: &str) -> usize {
        self.lock().calls.iter().filter(|call| call.destination == destination).count()
    }

    /// Forgets recorded requests.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send(&self, request: OutboundRequest) -> courier_delivery::Result<TransportResponse> {
        let (reply, latency) = {
            let mut state = self.lock();
            let destination = request.destination.clone();
            state.calls.push(request);

            let scripted = state.scripts.get_mut(&destination).and_then(VecDeque::pop_front);
            let reply = scripted
                .or_else(|| state.fallbacks.get(&destination).cloned())
                .unwrap_or_else(|| state.default_reply.clone());
            (reply, state.latency)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        reply.into_result()
    }
}
