//! Configuration management for the courier service.

use std::{collections::BTreeMap, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use courier_delivery::{
    ratelimit::{builtin_profiles, GENERIC_PROFILE},
    BackoffPolicy, BucketConfig, CircuitConfig, ClientConfig, DeliveryConfig, RateLimitConfig,
    RetryPolicy, Route, TransportConfig, WorkerConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";

const ENV_PREFIX: &str = "COURIER_";

/// Breaker thresholds for one destination, in file/env friendly units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitProfile {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Cooldown in milliseconds.
    #[serde(default = "default_circuit_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl CircuitProfile {
    fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

/// Token-bucket shape, in file/env friendly units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketProfile {
    /// Burst size.
    pub capacity: u32,
    /// Tokens credited per period.
    pub refill_rate: u32,
    /// Period length in milliseconds.
    #[serde(default = "default_refill_period_ms")]
    pub refill_period_ms: u64,
}

impl BucketProfile {
    /// Typed bucket configuration.
    pub const fn to_bucket_config(self) -> BucketConfig {
        BucketConfig {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            refill_period: Duration::from_millis(self.refill_period_ms),
        }
    }
}

impl From<BucketConfig> for BucketProfile {
    fn from(config: BucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            refill_period_ms: u64::try_from(config.refill_period.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority): `COURIER_<KEY>`, nested
///    keys separated by `__`, plus bare `DATABASE_URL` and `RUST_LOG`
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use courier_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Server
    /// Server bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Server bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Inbound HTTP request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    // Database
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
    /// Connection attempts at startup before giving up.
    #[serde(default = "default_connect_retries")]
    pub database_connect_retries: u32,

    // Worker
    /// Jobs fetched per poll.
    #[serde(default = "default_batch_size")]
    pub worker_batch_size: usize,
    /// Sleep between empty polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    // Queue retry
    /// Attempts before a job is dead-lettered.
    #[serde(default = "default_max_job_attempts")]
    pub max_job_attempts: u32,
    /// Queue backoff unit in milliseconds.
    #[serde(default = "default_queue_backoff_base_ms")]
    pub queue_backoff_base_ms: u64,
    /// Queue backoff cap in milliseconds.
    #[serde(default = "default_queue_backoff_max_ms")]
    pub queue_backoff_max_ms: u64,
    /// Relative queue backoff jitter (0.0 to 1.0).
    #[serde(default = "default_queue_backoff_jitter")]
    pub queue_backoff_jitter: f64,

    // Outbound call
    /// Attempts inside one outbound call.
    #[serde(default = "default_call_retry_attempts")]
    pub call_retry_attempts: u32,
    /// Delay after the first failed call attempt in milliseconds.
    #[serde(default = "default_call_retry_base_delay_ms")]
    pub call_retry_base_delay_ms: u64,
    /// Growth factor between call attempts.
    #[serde(default = "default_call_retry_factor")]
    pub call_retry_factor: f64,
    /// Relative call backoff jitter (0.0 to 1.0).
    #[serde(default = "default_call_retry_jitter")]
    pub call_retry_jitter: f64,
    /// Longest delay between call attempts in milliseconds.
    #[serde(default = "default_call_retry_max_delay_ms")]
    pub call_retry_max_delay_ms: u64,
    /// Per-attempt deadline in milliseconds.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    /// Longest wait for a rate-limit token in milliseconds.
    #[serde(default = "default_rate_limit_wait_cap_ms")]
    pub rate_limit_wait_cap_ms: u64,
    /// `User-Agent` for outbound calls.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // Circuit breaker
    /// Consecutive failures that open a breaker.
    #[serde(default = "default_failure_threshold")]
    pub circuit_failure_threshold: u32,
    /// Consecutive half-open successes that close a breaker.
    #[serde(default = "default_success_threshold")]
    pub circuit_success_threshold: u32,
    /// Open-state cooldown in milliseconds.
    #[serde(default = "default_circuit_cooldown_ms")]
    pub circuit_cooldown_ms: u64,
    /// Per-destination breaker thresholds.
    #[serde(default)]
    pub circuit_overrides: BTreeMap<String, CircuitProfile>,

    // Rate limiting
    /// Bucket for destinations without a profile.
    #[serde(default = "default_generic_bucket")]
    pub rate_limit_generic: BucketProfile,
    /// Per-destination buckets.
    #[serde(default = "default_bucket_profiles")]
    pub rate_limits: BTreeMap<String, BucketProfile>,

    // Routing
    /// Forwarding rules applied to ingested events.
    #[serde(default)]
    pub routes: Vec<Route>,

    // Security
    /// Shared secret for `X-Courier-Signature` on ingestion.
    #[serde(default)]
    pub signing_secret: Option<String>,
    /// Bearer token required on operator endpoints.
    #[serde(default)]
    pub operator_token: Option<String>,

    // Operations
    /// Enables the chaos layer and its endpoints.
    #[serde(default)]
    pub chaos_enabled: bool,
    /// Log filter.
    #[serde(default = "default_log_level")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    /// Provider chain used by [`Config::load`].
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Env::raw().only(&["DATABASE_URL", "RUST_LOG"]))
    }

    /// Extracts and validates configuration from `figment`.
    ///
    /// # Errors
    ///
    /// Returns error if extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the delivery engine's configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker: WorkerConfig {
                batch_size: self.worker_batch_size,
                poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
                delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
            },
            client: self.to_client_config(),
            retry: self.to_retry_policy(),
            circuit: self.to_circuit_config(),
            circuit_overrides: self
                .circuit_overrides
                .iter()
                .map(|(destination, profile)| (destination.clone(), profile.to_circuit_config()))
                .collect(),
            rate_limits: self.to_rate_limits(),
            routes: self.to_routes(),
            chaos_enabled: self.chaos_enabled,
        }
    }

    /// Convert to the outbound client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            default_timeout: Duration::from_millis(self.delivery_timeout_ms),
            rate_limit_wait_cap: Duration::from_millis(self.rate_limit_wait_cap_ms),
            backoff: BackoffPolicy {
                attempts: self.call_retry_attempts,
                base_delay: Duration::from_millis(self.call_retry_base_delay_ms),
                factor: self.call_retry_factor,
                jitter: self.call_retry_jitter,
                max_delay: Duration::from_millis(self.call_retry_max_delay_ms),
            },
        }
    }

    /// Convert to the queue retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_job_attempts,
            base_delay: Duration::from_millis(self.queue_backoff_base_ms),
            max_delay: Duration::from_millis(self.queue_backoff_max_ms),
            jitter: self.queue_backoff_jitter,
        }
    }

    /// Convert to the default breaker configuration.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: self.circuit_success_threshold,
            cooldown: Duration::from_millis(self.circuit_cooldown_ms),
        }
    }

    /// Convert to the limiter's profiles.
    pub fn to_rate_limits(&self) -> RateLimitConfig {
        RateLimitConfig {
            generic: self.rate_limit_generic.to_bucket_config(),
            profiles: self
                .rate_limits
                .iter()
                .map(|(destination, profile)| (destination.clone(), profile.to_bucket_config()))
                .collect(),
        }
    }

    /// Forwarding rules.
    pub fn to_routes(&self) -> Vec<Route> {
        self.routes.clone()
    }

    /// Convert to the reqwest transport configuration.
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig { user_agent: self.user_agent.clone(), ..TransportConfig::default() }
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Returns error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.rfind('@') {
            let scheme_end = self.database_url.find("://").map_or(0, |pos| pos + 3);
            if let Some(colon_pos) = self.database_url[scheme_end..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(scheme_end + colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.worker_batch_size == 0 {
            anyhow::bail!("worker_batch_size must be greater than 0");
        }

        if self.worker_poll_interval_ms == 0 {
            anyhow::bail!("worker_poll_interval_ms must be greater than 0");
        }

        if self.max_job_attempts == 0 {
            anyhow::bail!("max_job_attempts must be greater than 0");
        }

        if self.call_retry_attempts == 0 {
            anyhow::bail!("call_retry_attempts must be greater than 0");
        }

        if self.call_retry_factor < 1.0 {
            anyhow::bail!("call_retry_factor must be at least 1.0");
        }

        if !(0.0..=1.0).contains(&self.queue_backoff_jitter) {
            anyhow::bail!("queue_backoff_jitter must be between 0.0 and 1.0");
        }

        if !(0.0..=1.0).contains(&self.call_retry_jitter) {
            anyhow::bail!("call_retry_jitter must be between 0.0 and 1.0");
        }

        if self.delivery_timeout_ms == 0 {
            anyhow::bail!("delivery_timeout_ms must be greater than 0");
        }

        if self.circuit_failure_threshold == 0 || self.circuit_success_threshold == 0 {
            anyhow::bail!("circuit thresholds must be greater than 0");
        }

        for (destination, profile) in &self.circuit_overrides {
            if profile.failure_threshold == 0 || profile.success_threshold == 0 {
                anyhow::bail!("circuit thresholds for {destination} must be greater than 0");
            }
        }

        self.rate_limit_generic
            .to_bucket_config()
            .validate()
            .context("invalid rate_limit_generic profile")?;

        for (destination, profile) in &self.rate_limits {
            profile
                .to_bucket_config()
                .validate()
                .with_context(|| format!("invalid rate limit profile for {destination}"))?;
        }

        for route in &self.routes {
            route.validate().context("invalid route")?;
        }

        if self.signing_secret.as_deref().is_some_and(|s| s.trim().is_empty()) {
            anyhow::bail!("signing_secret must not be blank when set");
        }

        if self.operator_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            anyhow::bail!("operator_token must not be blank when set");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_connect_retries: default_connect_retries(),
            worker_batch_size: default_batch_size(),
            worker_poll_interval_ms: default_poll_interval_ms(),
            max_job_attempts: default_max_job_attempts(),
            queue_backoff_base_ms: default_queue_backoff_base_ms(),
            queue_backoff_max_ms: default_queue_backoff_max_ms(),
            queue_backoff_jitter: default_queue_backoff_jitter(),
            call_retry_attempts: default_call_retry_attempts(),
            call_retry_base_delay_ms: default_call_retry_base_delay_ms(),
            call_retry_factor: default_call_retry_factor(),
            call_retry_jitter: default_call_retry_jitter(),
            call_retry_max_delay_ms: default_call_retry_max_delay_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            rate_limit_wait_cap_ms: default_rate_limit_wait_cap_ms(),
            user_agent: default_user_agent(),
            circuit_failure_threshold: default_failure_threshold(),
            circuit_success_threshold: default_success_threshold(),
            circuit_cooldown_ms: default_circuit_cooldown_ms(),
            circuit_overrides: BTreeMap::new(),
            rate_limit_generic: default_generic_bucket(),
            rate_limits: default_bucket_profiles(),
            routes: Vec::new(),
            signing_secret: None,
            operator_token: None,
            chaos_enabled: false,
            rust_log: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_retries() -> u32 {
    5
}

fn default_batch_size() -> usize {
    25
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_job_attempts() -> u32 {
    8
}

fn default_queue_backoff_base_ms() -> u64 {
    400
}

fn default_queue_backoff_max_ms() -> u64 {
    300_000
}

fn default_queue_backoff_jitter() -> f64 {
    0.25
}

fn default_call_retry_attempts() -> u32 {
    5
}

fn default_call_retry_base_delay_ms() -> u64 {
    250
}

fn default_call_retry_factor() -> f64 {
    2.2
}

fn default_call_retry_jitter() -> f64 {
    0.5
}

fn default_call_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_delivery_timeout_ms() -> u64 {
    10_000
}

fn default_rate_limit_wait_cap_ms() -> u64 {
    5_000
}

fn default_user_agent() -> String {
    concat!("courier/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_circuit_cooldown_ms() -> u64 {
    30_000
}

fn default_refill_period_ms() -> u64 {
    1_000
}

fn default_generic_bucket() -> BucketProfile {
    BucketProfile::from(GENERIC_PROFILE)
}

fn default_bucket_profiles() -> BTreeMap<String, BucketProfile> {
    builtin_profiles().into_iter().map(|(name, config)| (name, config.into())).collect()
}

fn default_log_level() -> String {
    "info,courier=debug,tower_http=debug".to_string()
}
