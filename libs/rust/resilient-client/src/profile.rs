//! Per-destination client configuration.
//!
//! A [`ClientProfile`] describes one downstream destination: where it lives,
//! how to authenticate against it, and the pool/timeout/retry/proxy/logging
//! limits that apply to calls made to it. Profiles are immutable once loaded
//! and shared read-only by every component.

use crate::error::ConfigError;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

mod secret_serde {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        secret: &SecretString,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(secret.expose_secret())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<SecretString, D::Error> {
        String::deserialize(deserializer).map(SecretString::from)
    }

    pub mod option {
        use secrecy::{ExposeSecret, SecretString};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            secret: &Option<SecretString>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match secret {
                Some(secret) => serializer.serialize_some(secret.expose_secret()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<SecretString>, D::Error> {
            Option::<String>::deserialize(deserializer).map(|value| value.map(SecretString::from))
        }
    }
}

/// Connection pool limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrent in-flight requests to the destination
    pub max_connections: usize,
    /// Maximum callers queued waiting for a connection slot
    pub max_pending: usize,
    /// Reject instead of queueing when all slots are busy
    pub fail_fast: bool,
    /// Idle time before a pooled connection is closed
    pub max_idle_time_ms: u64,
    /// Maximum lifetime of a pooled connection
    pub max_life_time_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 2000,
            max_pending: 2000,
            fail_fast: false,
            max_idle_time_ms: 90_000,
            max_life_time_ms: None,
        }
    }
}

impl PoolConfig {
    /// Set the in-flight limit.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the queue limit.
    #[must_use]
    pub const fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    /// Reject excess callers instead of queueing them.
    #[must_use]
    pub const fn with_fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    /// Idle timeout as a duration.
    #[must_use]
    pub const fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }
}

/// Per-stage request timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout
    pub connect_ms: u64,
    /// Response read timeout
    pub read_ms: u64,
    /// Request write timeout
    pub write_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 500,
            read_ms: 180_000,
            write_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    /// Build a timeout block from the three stage limits.
    #[must_use]
    pub const fn new(connect_ms: u64, read_ms: u64, write_ms: u64) -> Self {
        Self {
            connect_ms,
            read_ms,
            write_ms,
        }
    }

    /// Connect timeout.
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    /// Read timeout.
    #[must_use]
    pub const fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }

    /// Write timeout.
    #[must_use]
    pub const fn write(&self) -> Duration {
        Duration::from_millis(self.write_ms)
    }

    /// Upper bound for one complete exchange.
    #[must_use]
    pub const fn total(&self) -> Duration {
        Duration::from_millis(
            self.connect_ms
                .saturating_add(self.write_ms)
                .saturating_add(self.read_ms),
        )
    }
}

/// Retry and backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Disable to make every call single-attempt
    pub enabled: bool,
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub backoff_ms: u64,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Ceiling for any single delay
    pub max_backoff_ms: u64,
    /// Add up to 25% random jitter (still capped)
    pub jitter: bool,
    /// Downstream statuses treated as transient
    pub retryable_status_codes: Vec<u16>,
    /// HTTP methods eligible for retry
    pub methods: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            backoff_ms: 100,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            jitter: false,
            retryable_status_codes: vec![429, 502, 503, 504],
            methods: vec!["GET".to_string(), "PUT".to_string(), "DELETE".to_string()],
        }
    }
}

impl RetryConfig {
    /// Set the attempt limit.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set base delay and multiplier.
    #[must_use]
    pub const fn with_backoff(mut self, backoff_ms: u64, multiplier: f64) -> Self {
        self.backoff_ms = backoff_ms;
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the delay ceiling.
    #[must_use]
    pub const fn with_max_backoff(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = max_backoff_ms;
        self
    }

    /// Enable jitter.
    #[must_use]
    pub const fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Replace the retryable status list.
    #[must_use]
    pub fn with_retryable_status_codes(mut self, codes: impl Into<Vec<u16>>) -> Self {
        self.retryable_status_codes = codes.into();
        self
    }

    /// Replace the retryable method list.
    #[must_use]
    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    /// Disable retries.
    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Outbound proxy settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Route traffic through the proxy
    pub enabled: bool,
    /// HTTP proxy host
    pub host: Option<String>,
    /// HTTP proxy port
    pub port: Option<u16>,
    /// Separate proxy host for HTTPS targets
    pub https_host: Option<String>,
    /// Separate proxy port for HTTPS targets
    pub https_port: Option<u16>,
}

/// Request logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log each dispatch
    pub enabled: bool,
    /// Header names whose values are masked in logs
    pub obfuscate_headers: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            obfuscate_headers: vec!["authorization".to_string(), "proxy-authorization".to_string()],
        }
    }
}

/// Monitoring event settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Emit call and token events
    pub enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// HTTP Basic credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicCredentials {
    /// User name
    pub username: String,
    /// Password
    #[serde(with = "secret_serde")]
    pub password: SecretString,
}

impl PartialEq for BasicCredentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username
            && self.password.expose_secret() == other.password.expose_secret()
    }
}

/// OAuth2 client-credentials settings for the identity endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Explicit token endpoint; derived from `server_url` and `realm` when absent
    #[serde(default)]
    pub token_endpoint: Option<String>,
    /// Keycloak base URL
    #[serde(default)]
    pub server_url: Option<String>,
    /// Keycloak realm
    #[serde(default)]
    pub realm: Option<String>,
    /// OAuth2 client id
    pub client_id: String,
    /// OAuth2 client secret
    #[serde(with = "secret_serde")]
    pub client_secret: SecretString,
    /// Requested scope
    #[serde(default)]
    pub scope: Option<String>,
}

impl PartialEq for AuthConfig {
    fn eq(&self, other: &Self) -> bool {
        self.token_endpoint == other.token_endpoint
            && self.server_url == other.server_url
            && self.realm == other.realm
            && self.client_id == other.client_id
            && self.client_secret.expose_secret() == other.client_secret.expose_secret()
            && self.scope == other.scope
    }
}

impl AuthConfig {
    /// Auth block pointing at an explicit token endpoint.
    #[must_use]
    pub fn new(
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            token_endpoint: Some(token_endpoint.into()),
            server_url: None,
            realm: None,
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            scope: None,
        }
    }

    /// Auth block for a Keycloak realm.
    #[must_use]
    pub fn keycloak(
        server_url: impl Into<String>,
        realm: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            token_endpoint: None,
            server_url: Some(server_url.into()),
            realm: Some(realm.into()),
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            scope: None,
        }
    }

    /// Set the requested scope.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Resolve the token endpoint URL.
    ///
    /// ```
    /// use resilient_client::AuthConfig;
    ///
    /// let auth = AuthConfig::keycloak("http://sso:8080/", "internal", "svc", "secret");
    /// assert_eq!(
    ///     auth.token_url().as_deref(),
    ///     Some("http://sso:8080/realms/internal/protocol/openid-connect/token"),
    /// );
    /// ```
    #[must_use]
    pub fn token_url(&self) -> Option<String> {
        if let Some(endpoint) = &self.token_endpoint {
            return Some(endpoint.clone());
        }
        match (&self.server_url, &self.realm) {
            (Some(server), Some(realm)) => Some(format!(
                "{}/realms/{realm}/protocol/openid-connect/token",
                server.trim_end_matches('/')
            )),
            _ => None,
        }
    }
}

/// Configuration for one downstream destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    /// Unique destination name
    pub name: String,
    /// Base URL of the destination
    pub address: String,
    /// Basic credentials sent on every call
    #[serde(default)]
    pub basic: Option<BasicCredentials>,
    /// Fixed `Authorization` header value
    #[serde(default, with = "secret_serde::option")]
    pub authorization: Option<SecretString>,
    /// Connection pool limits
    #[serde(default)]
    pub pool: PoolConfig,
    /// Timeouts
    #[serde(default)]
    pub timeout: TimeoutConfig,
    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Proxy
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Request logging
    #[serde(default)]
    pub log: LogConfig,
    /// Monitoring events
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Identity endpoint settings
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Attach a client-credentials bearer token to every call
    #[serde(default)]
    pub internal_oauth: bool,
}

impl PartialEq for ClientProfile {
    fn eq(&self, other: &Self) -> bool {
        let authorization =
            |p: &Self| p.authorization.as_ref().map(|v| v.expose_secret().to_owned());
        self.name == other.name
            && self.address == other.address
            && self.basic == other.basic
            && authorization(self) == authorization(other)
            && self.pool == other.pool
            && self.timeout == other.timeout
            && self.retry == other.retry
            && self.proxy == other.proxy
            && self.log == other.log
            && self.monitoring == other.monitoring
            && self.auth == other.auth
            && self.internal_oauth == other.internal_oauth
    }
}

impl ClientProfile {
    /// Profile with default limits and no authentication.
    #[must_use]
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            basic: None,
            authorization: None,
            pool: PoolConfig::default(),
            timeout: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            proxy: ProxyConfig::default(),
            log: LogConfig::default(),
            monitoring: MonitoringConfig::default(),
            auth: None,
            internal_oauth: false,
        }
    }

    /// Enable bearer authentication with the given identity settings.
    #[must_use]
    pub fn with_oauth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self.internal_oauth = true;
        self
    }

    /// Send HTTP Basic credentials.
    #[must_use]
    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.basic = Some(BasicCredentials {
            username: username.into(),
            password: SecretString::from(password.into()),
        });
        self
    }

    /// Send a fixed `Authorization` header value.
    #[must_use]
    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(SecretString::from(value.into()));
        self
    }

    /// Replace the pool block.
    #[must_use]
    pub const fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Replace the timeout block.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the retry block.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the proxy block.
    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    /// Turn monitoring events on or off.
    #[must_use]
    pub const fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitoring.enabled = enabled;
        self
    }

    /// Turn request logging on or off.
    #[must_use]
    pub const fn with_logging(mut self, enabled: bool) -> Self {
        self.log.enabled = enabled;
        self
    }

    /// Check the profile for values that would make it unusable.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                profile: "<unnamed>".to_string(),
                field: "name".to_string(),
            });
        }
        parse_absolute_url(&self.name, "address", &self.address)?;

        if self.pool.max_connections == 0 {
            return Err(self.invalid("pool.max_connections", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(self.invalid("retry.max_attempts", "must be at least 1"));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(self.invalid("retry.backoff_multiplier", "must be at least 1.0"));
        }
        if self.retry.max_backoff_ms < self.retry.backoff_ms {
            return Err(self.invalid("retry.max_backoff_ms", "must not be below retry.backoff_ms"));
        }
        if let Some(method) = self
            .retry
            .methods
            .iter()
            .find(|m| reqwest::Method::from_bytes(m.as_bytes()).is_err())
        {
            return Err(self.invalid("retry.methods", &format!("unknown HTTP method {method}")));
        }
        if self.proxy.enabled && (self.proxy.host.is_none() || self.proxy.port.is_none()) {
            return Err(ConfigError::MissingRequired {
                profile: self.name.clone(),
                field: "proxy.host/proxy.port".to_string(),
            });
        }
        if self.internal_oauth {
            let auth = self.auth.as_ref().ok_or_else(|| ConfigError::MissingRequired {
                profile: self.name.clone(),
                field: "auth".to_string(),
            })?;
            if auth.client_id.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    profile: self.name.clone(),
                    field: "auth.client_id".to_string(),
                });
            }
            let token_url = auth.token_url().ok_or_else(|| ConfigError::MissingRequired {
                profile: self.name.clone(),
                field: "auth.token_endpoint".to_string(),
            })?;
            parse_absolute_url(&self.name, "auth.token_endpoint", &token_url)?;
        }
        Ok(())
    }

    fn invalid(&self, field: &str, reason: &str) -> ConfigError {
        ConfigError::InvalidValue {
            profile: self.name.clone(),
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn parse_absolute_url(profile: &str, field: &str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidUrl {
        profile: profile.to_string(),
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidUrl {
            profile: profile.to_string(),
            field: field.to_string(),
            reason: "not an absolute base URL".to_string(),
        });
    }
    Ok(url)
}
