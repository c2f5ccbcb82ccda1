//! Shared setup for the resilient-client end-to-end suites.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use resilient_client::{ClientRegistry, ClientsConfig, TelemetryConfig};

/// Install a debug-level subscriber once per test binary.
pub fn init_test_tracing() {
    let _ = resilient_client::init_tracing(&TelemetryConfig::default().with_log_level("debug"));
}

/// Build a registry from TOML text using the HTTP token fetcher.
///
/// # Panics
///
/// Panics if the configuration is invalid; only used from tests.
#[must_use]
#[allow(clippy::expect_used)]
pub fn registry_from_toml(text: &str) -> ClientRegistry {
    let config =
        ClientsConfig::parse(text, config::FileFormat::Toml).expect("valid test configuration");
    ClientRegistry::from_config(&config).expect("registry builds")
}
