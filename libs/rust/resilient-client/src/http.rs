//! HTTP client construction per destination.
//!
//! Each profile gets its own `reqwest::Client`, so connection pools and
//! timeouts are isolated between destinations.

use crate::error::{ClassifiedError, codes};
use crate::profile::{ClientProfile, ProxyConfig};
use reqwest::{Client, ClientBuilder, Proxy};
use std::time::Duration;

/// User agent sent on every request.
pub const USER_AGENT: &str = concat!("resilient-client/", env!("CARGO_PKG_VERSION"));

const TCP_KEEPALIVE: Duration = Duration::from_secs(300);

/// Build the HTTP client for a profile.
///
/// Applies connect/read timeouts, pool idle limits, TCP keepalive, rustls
/// and the optional proxy.
///
/// # Errors
///
/// Returns an unretryable error if the proxy address is malformed or the
/// client cannot be built.
///
/// # Examples
///
/// ```
/// use resilient_client::{ClientProfile, build_http_client};
///
/// let profile = ClientProfile::new("billing", "http://billing.internal");
/// let client = build_http_client(&profile).expect("Failed to build client");
/// ```
pub fn build_http_client(profile: &ClientProfile) -> Result<Client, ClassifiedError> {
    let mut builder = ClientBuilder::new()
        .connect_timeout(profile.timeout.connect())
        .read_timeout(profile.timeout.read())
        .pool_idle_timeout(profile.pool.max_idle_time())
        .pool_max_idle_per_host(profile.pool.max_connections)
        .tcp_keepalive(TCP_KEEPALIVE)
        .user_agent(USER_AGENT)
        .use_rustls_tls();

    if profile.proxy.enabled {
        builder = apply_proxy(builder, &profile.proxy, &profile.name)?;
    }

    builder.build().map_err(|e| {
        ClassifiedError::unretryable(
            codes::INVALID_PROFILE,
            format!("failed to build HTTP client: {e}"),
        )
        .with_param(&profile.name)
    })
}

fn apply_proxy(
    mut builder: ClientBuilder,
    proxy: &ProxyConfig,
    destination: &str,
) -> Result<ClientBuilder, ClassifiedError> {
    let invalid = |e: reqwest::Error| {
        ClassifiedError::unretryable(codes::INVALID_PROFILE, format!("invalid proxy: {e}"))
            .with_param(destination)
    };

    if let (Some(host), Some(port)) = (&proxy.host, proxy.port) {
        builder = builder.proxy(Proxy::http(format!("http://{host}:{port}")).map_err(invalid)?);
    }
    if let (Some(host), Some(port)) = (&proxy.https_host, proxy.https_port) {
        builder = builder.proxy(Proxy::https(format!("http://{host}:{port}")).map_err(invalid)?);
    }
    Ok(builder)
}
