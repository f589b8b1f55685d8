//! Courier HTTP API.
//!
//! Event ingestion, operator endpoints over the delivery engine, the
//! metrics scrape target, and layered configuration for the binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use courier_core::EventStore;
use courier_delivery::DeliveryEngine;

pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use server::{create_router, start_server};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Inbound event store.
    pub events: Arc<dyn EventStore>,
    /// Delivery subsystem.
    pub engine: Arc<DeliveryEngine>,
    /// Secret for inbound signatures; ingestion is unsigned when absent.
    pub signing_secret: Option<Arc<str>>,
    /// Bearer token for operator endpoints; open when absent.
    pub operator_token: Option<Arc<str>>,
}

impl AppState {
    /// State without signature or operator checks.
    pub fn new(events: Arc<dyn EventStore>, engine: Arc<DeliveryEngine>) -> Self {
        Self { events, engine, signing_secret: None, operator_token: None }
    }

    /// Requires `X-Courier-Signature` on ingestion.
    #[must_use]
    pub fn with_signing_secret(mut self, secret: impl Into<Arc<str>>) -> Self {
        self.signing_secret = Some(secret.into());
        self
    }

    /// Requires `Authorization: Bearer <token>` on operator endpoints.
    #[must_use]
    pub fn with_operator_token(mut self, token: impl Into<Arc<str>>) -> Self {
        self.operator_token = Some(token.into());
        self
    }

    /// Applies the security settings from `config`.
    #[must_use]
    pub fn with_config(self, config: &Config) -> Self {
        let state = match &config.signing_secret {
            Some(secret) => self.with_signing_secret(secret.as_str()),
            None => self,
        };
        match &config.operator_token {
            Some(token) => state.with_operator_token(token.as_str()),
            None => state,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("engine", &self.engine)
            .field("signed_ingestion", &self.signing_secret.is_some())
            .field("operator_auth", &self.operator_token.is_some())
            .finish_non_exhaustive()
    }
}
