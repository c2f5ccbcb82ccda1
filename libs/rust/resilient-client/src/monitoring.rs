//! Monitoring events and sinks.
//!
//! The request executor and the token store report what they did through a
//! [`MonitoringSink`]. Sinks observe only; they never influence control flow.

use crate::error::{ClassifiedError, ErrorKind};
use crate::metrics::ClientMetrics;
use crate::profile::LogConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Placeholder logged instead of sensitive header values.
pub const OBFUSCATED_VALUE: &str = "xxxxx";

/// How a call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Downstream answered with a success status
    Success {
        /// HTTP status
        status: u16,
    },
    /// Call ended with a classified error
    Failure {
        /// Error kind
        kind: ErrorKind,
        /// Error code
        code: String,
        /// HTTP status, when one was received
        status: Option<u16>,
    },
}

impl CallOutcome {
    /// Outcome describing a terminal error.
    #[must_use]
    pub fn from_error(error: &ClassifiedError) -> Self {
        Self::Failure {
            kind: error.kind,
            code: error.code.clone(),
            status: error.status,
        }
    }

    /// Whether the call succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// One completed `execute` call.
#[derive(Debug, Clone)]
pub struct CallEvent {
    /// Profile name
    pub destination: String,
    /// HTTP method
    pub method: String,
    /// Target URL
    pub target: String,
    /// Wall time across all attempts
    pub duration: Duration,
    /// Final outcome
    pub outcome: CallOutcome,
    /// Retries performed by the retry policy
    pub retry_count: u32,
    /// Trace id sent as `X-B3-TRACE-ID`
    pub request_id: String,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

/// How a token fetch or refresh ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    /// New token obtained with client credentials
    Issued,
    /// Token replaced through the refresh-token grant
    Refreshed,
    /// Fetch failed
    Failed {
        /// Error kind
        kind: ErrorKind,
        /// Error code
        code: String,
    },
}

/// One token fetch or refresh.
#[derive(Debug, Clone)]
pub struct TokenEvent {
    /// Profile name
    pub destination: String,
    /// Outcome
    pub outcome: TokenOutcome,
    /// Time spent talking to the identity endpoint
    pub duration: Duration,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

/// Receiver for monitoring events.
pub trait MonitoringSink: Send + Sync {
    /// Record a completed call.
    fn record_call(&self, event: &CallEvent);

    /// Record a token fetch or refresh.
    fn record_token(&self, event: &TokenEvent);
}

/// Sink that writes events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MonitoringSink for TracingSink {
    fn record_call(&self, event: &CallEvent) {
        let duration_ms = u64::try_from(event.duration.as_millis()).unwrap_or(u64::MAX);
        match &event.outcome {
            CallOutcome::Success { status } => info!(
                destination = %event.destination,
                method = %event.method,
                target = %event.target,
                status,
                duration_ms,
                retry_count = event.retry_count,
                request_id = %event.request_id,
                "Outbound call completed"
            ),
            CallOutcome::Failure { kind, code, status } => warn!(
                destination = %event.destination,
                method = %event.method,
                target = %event.target,
                kind = %kind,
                code = %code,
                status = ?status,
                duration_ms,
                retry_count = event.retry_count,
                request_id = %event.request_id,
                "Outbound call failed"
            ),
        }
    }

    fn record_token(&self, event: &TokenEvent) {
        let duration_ms = u64::try_from(event.duration.as_millis()).unwrap_or(u64::MAX);
        match &event.outcome {
            TokenOutcome::Failed { kind, code } => warn!(
                destination = %event.destination,
                kind = %kind,
                code = %code,
                duration_ms,
                "Token fetch failed"
            ),
            outcome => info!(
                destination = %event.destination,
                outcome = ?outcome,
                duration_ms,
                "Token obtained"
            ),
        }
    }
}

/// Sink that feeds [`ClientMetrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricsSink {
    metrics: Arc<ClientMetrics>,
}

impl MetricsSink {
    /// Create a sink updating `metrics`.
    #[must_use]
    pub const fn new(metrics: Arc<ClientMetrics>) -> Self {
        Self { metrics }
    }

    /// Shared metrics handle.
    #[must_use]
    pub fn metrics(&self) -> Arc<ClientMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl MonitoringSink for MetricsSink {
    fn record_call(&self, event: &CallEvent) {
        self.metrics.record_call(
            &event.destination,
            event.outcome.is_success(),
            event.retry_count,
            event.duration,
        );
    }

    fn record_token(&self, event: &TokenEvent) {
        let failed = matches!(event.outcome, TokenOutcome::Failed { .. });
        self.metrics.record_token(&event.destination, !failed);
    }
}

/// Sink that keeps every event in memory. Intended for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<CallEvent>>,
    tokens: Mutex<Vec<TokenEvent>>,
}

impl RecordingSink {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded call events.
    #[must_use]
    pub fn calls(&self) -> Vec<CallEvent> {
        self.calls.lock().clone()
    }

    /// Recorded token events.
    #[must_use]
    pub fn tokens(&self) -> Vec<TokenEvent> {
        self.tokens.lock().clone()
    }
}

impl MonitoringSink for RecordingSink {
    fn record_call(&self, event: &CallEvent) {
        self.calls.lock().push(event.clone());
    }

    fn record_token(&self, event: &TokenEvent) {
        self.tokens.lock().push(event.clone());
    }
}

/// Render headers for logging, masking the configured sensitive names.
#[must_use]
pub fn obfuscate_headers(headers: &HeaderMap, sensitive: &[String]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let masked = sensitive.iter().any(|s| s.eq_ignore_ascii_case(name.as_str()));
            let shown = if masked {
                OBFUSCATED_VALUE.to_string()
            } else {
                value.to_str().unwrap_or("<binary>").to_string()
            };
            (name.as_str().to_string(), shown)
        })
        .collect()
}

/// Log one dispatch according to the profile's log settings.
pub fn log_request(
    config: &LogConfig,
    destination: &str,
    method: &str,
    url: &str,
    headers: &HeaderMap,
) {
    if !config.enabled {
        return;
    }
    info!(destination, method, url, "Start call API");
    if tracing::enabled!(tracing::Level::DEBUG) {
        for (name, value) in obfuscate_headers(headers, &config.obfuscate_headers) {
            debug!(destination, header = %name, value = %value, "Request header");
        }
    }
}
