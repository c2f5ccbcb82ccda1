//! Token values and identity provider wire formats.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// An access token issued by the identity provider.
///
/// Immutable; a refresh produces a new value rather than mutating this one.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Token value sent in the `Authorization` header
    pub value: String,
    /// Token type reported by the provider (usually `Bearer`)
    pub token_type: String,
    /// Absolute expiry in epoch milliseconds
    pub expires_at_epoch_millis: i64,
    /// Refresh token, when the provider issues one
    pub refresh_token: Option<String>,
}

impl AccessToken {
    /// Build a token from a provider response received at `now_ms`.
    #[must_use]
    pub fn from_response(response: TokenResponse, now_ms: i64) -> Self {
        let lifetime_ms = i64::try_from(response.expires_in)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        Self {
            value: response.access_token,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at_epoch_millis: now_ms.saturating_add(lifetime_ms),
            refresh_token: response.refresh_token,
        }
    }

    /// Whether the token may still be used at `now_ms`, keeping `margin_ms` in reserve.
    #[must_use]
    pub const fn is_usable_at(&self, now_ms: i64, margin_ms: i64) -> bool {
        now_ms < self.expires_at_epoch_millis.saturating_sub(margin_ms)
    }

    /// `Authorization` header value.
    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.value)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_at_epoch_millis", &self.expires_at_epoch_millis)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}

/// Successful token endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Token type
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    pub expires_in: u64,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Structured error body returned by the identity provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderErrorBody {
    /// OAuth2 error code
    pub error: Option<String>,
    /// Human-readable description
    pub error_description: Option<String>,
}

/// Lifecycle state of a cached token entry.
///
/// A failed fetch or refresh drops the entry straight back to `Empty`; the
/// failure itself is reported as a token event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// No token cached
    Empty,
    /// First fetch in flight
    Fetching,
    /// Token cached and usable
    Valid,
    /// Token near expiry, replacement in flight
    Refreshing,
}

/// Cached token for one profile.
#[derive(Debug, Clone)]
pub struct TokenCacheEntry {
    /// Owning profile name
    pub profile_name: String,
    /// Current token, if any
    pub token: Option<AccessToken>,
    /// Lifecycle state
    pub state: TokenState,
}

impl TokenCacheEntry {
    /// Fresh entry with no token.
    #[must_use]
    pub fn empty(profile_name: impl Into<String>) -> Self {
        Self {
            profile_name: profile_name.into(),
            token: None,
            state: TokenState::Empty,
        }
    }
}
