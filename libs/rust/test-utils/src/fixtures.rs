//! Test fixtures with sample data.

use resilient_client::{AuthConfig, ClientProfile, RetryConfig};
use serde_json::{Value, json};

/// Client id used by sample OAuth profiles.
pub const CLIENT_ID: &str = "billing-client";

/// Client secret used by sample OAuth profiles.
pub const CLIENT_SECRET: &str = "s3cret";

/// Successful token endpoint body.
#[must_use]
pub fn token_body(access_token: &str, expires_in: u64) -> Value {
    json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "not-before-policy": 0,
        "scope": "profile email"
    })
}

/// Token endpoint body carrying a refresh token.
#[must_use]
pub fn token_body_with_refresh(access_token: &str, expires_in: u64, refresh_token: &str) -> Value {
    let mut body = token_body(access_token, expires_in);
    body["refresh_token"] = json!(refresh_token);
    body
}

/// Provider error body as returned for bad client credentials.
#[must_use]
pub fn invalid_client_body() -> Value {
    json!({
        "error": "invalid_client",
        "error_description": "Invalid client or Invalid client credentials"
    })
}

/// Provider error body with an arbitrary code.
#[must_use]
pub fn provider_error_body(code: &str, description: &str) -> Value {
    json!({ "error": code, "error_description": description })
}

/// Retry block with short delays for tests running on a real clock.
#[must_use]
pub fn fast_retry() -> RetryConfig {
    RetryConfig::default().with_backoff(10, 2.0).with_max_backoff(50)
}

/// Plain profile pointing at `address`.
#[must_use]
pub fn plain_profile(name: &str, address: &str) -> ClientProfile {
    ClientProfile::new(name, address).with_retry(fast_retry())
}

/// OAuth profile pointing at `address` and fetching tokens from `token_endpoint`.
#[must_use]
pub fn oauth_profile(name: &str, address: &str, token_endpoint: &str) -> ClientProfile {
    plain_profile(name, address).with_oauth(AuthConfig::new(
        token_endpoint,
        CLIENT_ID,
        CLIENT_SECRET,
    ))
}

/// TOML configuration with one OAuth and one basic-auth destination.
#[must_use]
pub fn sample_toml(downstream: &str, identity: &str) -> String {
    format!(
        r#"
[telemetry]
log_level = "debug"

[[clients]]
name = "billing"
address = "{downstream}"
internal_oauth = true

[clients.auth]
token_endpoint = "{identity}/token"
client_id = "{CLIENT_ID}"
client_secret = "{CLIENT_SECRET}"

[clients.retry]
backoff_ms = 10
max_backoff_ms = 50

[[clients]]
name = "ledger"
address = "{downstream}"

[clients.basic]
username = "svc"
password = "pw"
"#
    )
}
