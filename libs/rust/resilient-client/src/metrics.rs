//! Per-destination call metrics in Prometheus text format.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const PREFIX: &str = "resilient_client";

/// Counters for one destination.
#[derive(Debug, Default)]
pub struct DestinationMetrics {
    calls: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    duration_ms: AtomicU64,
    token_fetches: AtomicU64,
    token_failures: AtomicU64,
}

impl DestinationMetrics {
    fn snapshot(&self) -> [(&'static str, &'static str, u64); 6] {
        [
            ("calls_total", "Completed outbound calls", self.calls.load(Ordering::Relaxed)),
            (
                "call_failures_total",
                "Outbound calls ending in error",
                self.failures.load(Ordering::Relaxed),
            ),
            (
                "retries_total",
                "Retries performed by the retry policy",
                self.retries.load(Ordering::Relaxed),
            ),
            (
                "call_duration_ms_total",
                "Cumulative call duration in milliseconds",
                self.duration_ms.load(Ordering::Relaxed),
            ),
            (
                "token_fetches_total",
                "Token fetches and refreshes",
                self.token_fetches.load(Ordering::Relaxed),
            ),
            (
                "token_failures_total",
                "Failed token fetches",
                self.token_failures.load(Ordering::Relaxed),
            ),
        ]
    }
}

/// Metrics keyed by destination name.
#[derive(Debug, Default)]
pub struct ClientMetrics {
    destinations: RwLock<BTreeMap<String, Arc<DestinationMetrics>>>,
}

impl ClientMetrics {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn destination(&self, name: &str) -> Arc<DestinationMetrics> {
        if let Some(existing) = self.destinations.read().get(name) {
            return Arc::clone(existing);
        }
        Arc::clone(self.destinations.write().entry(name.to_string()).or_default())
    }

    /// Record a completed call.
    pub fn record_call(&self, destination: &str, success: bool, retries: u32, duration: Duration) {
        let metrics = self.destination(destination);
        metrics.calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            metrics.failures.fetch_add(1, Ordering::Relaxed);
        }
        metrics.retries.fetch_add(u64::from(retries), Ordering::Relaxed);
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        metrics.duration_ms.fetch_add(millis, Ordering::Relaxed);
    }

    /// Record a token fetch.
    pub fn record_token(&self, destination: &str, success: bool) {
        let metrics = self.destination(destination);
        metrics.token_fetches.fetch_add(1, Ordering::Relaxed);
        if !success {
            metrics.token_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Completed calls for a destination.
    #[must_use]
    pub fn calls_total(&self, destination: &str) -> u64 {
        self.read(destination, |m| m.calls.load(Ordering::Relaxed))
    }

    /// Failed calls for a destination.
    #[must_use]
    pub fn failures_total(&self, destination: &str) -> u64 {
        self.read(destination, |m| m.failures.load(Ordering::Relaxed))
    }

    /// Retries for a destination.
    #[must_use]
    pub fn retries_total(&self, destination: &str) -> u64 {
        self.read(destination, |m| m.retries.load(Ordering::Relaxed))
    }

    /// Token fetches for a destination.
    #[must_use]
    pub fn token_fetches_total(&self, destination: &str) -> u64 {
        self.read(destination, |m| m.token_fetches.load(Ordering::Relaxed))
    }

    fn read(&self, destination: &str, f: impl Fn(&DestinationMetrics) -> u64) -> u64 {
        self.destinations.read().get(destination).map_or(0, |m| f(m))
    }

    /// Format all metrics as Prometheus text.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let destinations = self.destinations.read();
        let snapshots: Vec<_> = destinations
            .iter()
            .map(|(name, metrics)| (name.clone(), metrics.snapshot()))
            .collect();
        drop(destinations);

        let mut out = String::new();
        let Some((_, first)) = snapshots.first() else {
            return out;
        };
        for (index, (metric, help, _)) in first.iter().enumerate() {
            let _ = writeln!(out, "# HELP {PREFIX}_{metric} {help}");
            let _ = writeln!(out, "# TYPE {PREFIX}_{metric} counter");
            for (destination, values) in &snapshots {
                let _ = writeln!(
                    out,
                    "{PREFIX}_{metric}{{destination=\"{destination}\"}} {}",
                    values[index].2
                );
            }
        }
        out
    }
}
