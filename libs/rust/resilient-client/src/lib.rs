//! Authenticated, resilient outbound HTTP clients.
//!
//! This crate provides:
//! - Per-destination client profiles loaded from configuration
//! - OAuth2 client-credentials token caching with single-flight refresh
//! - Retry policies with exponential backoff driven by classified errors
//! - Connection pool limits, proxy support and request logging
//! - Monitoring events, Prometheus metrics and tracing setup

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod monitoring;
pub mod profile;
pub mod registry;
pub mod retry;
pub mod telemetry;
pub mod token;

pub use client::{ClientRequest, ClientResponse, RequestBody, ResilientClient};
pub use config::ClientsConfig;
pub use error::{ClassifiedError, ConfigError, ErrorKind};
pub use http::build_http_client;
pub use metrics::ClientMetrics;
pub use monitoring::{
    CallEvent, CallOutcome, MetricsSink, MonitoringSink, RecordingSink, TokenEvent, TokenOutcome,
    TracingSink,
};
pub use profile::{AuthConfig, ClientProfile, PoolConfig, ProxyConfig, RetryConfig, TimeoutConfig};
pub use registry::ClientRegistry;
pub use retry::RetryPolicy;
pub use telemetry::{TelemetryConfig, init_tracing};
pub use token::{
    AccessToken, HttpTokenFetcher, MockTokenFetcher, TokenFetcher, TokenState, TokenStore,
};
pub use tokio_util::sync::CancellationToken;
