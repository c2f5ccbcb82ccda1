//! OAuth2 client-credentials exchange against the identity endpoint.
//!
//! Fetchers never retry; retry decisions belong to the caller.

use crate::error::{ClassifiedError, ErrorKind, codes};
use crate::http::build_http_client;
use crate::profile::{ClientProfile, TimeoutConfig};
use crate::token::types::{AccessToken, ProviderErrorBody, TokenResponse, now_millis};
use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Provider error codes that mean the client credentials themselves are bad.
const PERMANENT_CREDENTIAL_ERRORS: &[&str] = &[
    "invalid_client",
    "unauthorized_client",
    "unsupported_grant_type",
    "invalid_scope",
];

/// Obtains access tokens for a profile.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    /// Perform a client-credentials exchange.
    async fn fetch(&self, profile: &ClientProfile) -> Result<AccessToken, ClassifiedError>;

    /// Exchange a refresh token. Defaults to a fresh client-credentials fetch.
    async fn refresh(
        &self,
        profile: &ClientProfile,
        refresh_token: &str,
    ) -> Result<AccessToken, ClassifiedError> {
        let _ = refresh_token;
        self.fetch(profile).await
    }
}

/// Classify a non-2xx identity endpoint response.
///
/// 5xx and 429 are transient, 4xx with a permanent credential error code is
/// unretryable, anything else is an authentication failure.
#[must_use]
pub fn classify_token_error(status: u16, body: &str, destination: &str) -> ClassifiedError {
    let parsed: ProviderErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed
        .error
        .clone()
        .unwrap_or_else(|| codes::TOKEN_ENDPOINT_ERROR.to_string());
    let message = parsed
        .error_description
        .or(parsed.error)
        .unwrap_or_else(|| format!("identity endpoint returned HTTP {status}"));

    let kind = if status >= 500 || status == 429 {
        ErrorKind::Transient
    } else if (400..500).contains(&status) && PERMANENT_CREDENTIAL_ERRORS.contains(&code.as_str()) {
        ErrorKind::Unretryable
    } else {
        ErrorKind::Auth
    };

    ClassifiedError::new(kind, code, message)
        .with_status(status)
        .with_param(destination)
}

/// Token fetcher speaking the OAuth2 token endpoint protocol over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTokenFetcher {
    http: reqwest::Client,
}

impl HttpTokenFetcher {
    /// Create a fetcher with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self, ClassifiedError> {
        let identity = ClientProfile::new("identity", "http://localhost")
            .with_timeout(TimeoutConfig::new(5_000, 30_000, 30_000));
        Ok(Self {
            http: build_http_client(&identity)?,
        })
    }

    /// Create a fetcher on top of an existing client.
    #[must_use]
    pub const fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn request_token(
        &self,
        profile: &ClientProfile,
        mut form: Vec<(&'static str, String)>,
    ) -> Result<AccessToken, ClassifiedError> {
        let auth = profile.auth.as_ref().ok_or_else(|| {
            ClassifiedError::unretryable(codes::INVALID_PROFILE, "profile has no auth block")
                .with_param(&profile.name)
        })?;
        let url = auth.token_url().ok_or_else(|| {
            ClassifiedError::unretryable(codes::INVALID_PROFILE, "token endpoint not configured")
                .with_param(&profile.name)
        })?;

        form.push(("client_id", auth.client_id.clone()));
        form.push(("client_secret", auth.client_secret.expose_secret().to_string()));
        if let Some(scope) = &auth.scope {
            form.push(("scope", scope.clone()));
        }

        debug!(destination = %profile.name, url = %url, "Requesting access token");
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(profile.timeout.total())
            .form(&form)
            .send()
            .await
            .map_err(|e| ClassifiedError::from_transport(&e, &profile.name))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ClassifiedError::from_transport(&e, &profile.name))?;

        if !(200..300).contains(&status) {
            let error = classify_token_error(status, &body, &profile.name);
            warn!(
                destination = %profile.name,
                status,
                code = %error.code,
                kind = %error.kind,
                "Token request rejected"
            );
            return Err(error);
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            ClassifiedError::unretryable(
                codes::UN_DESERIALIZE,
                format!("invalid token response: {e}"),
            )
            .with_param(&profile.name)
        })?;
        Ok(AccessToken::from_response(parsed, now_millis()))
    }
}

#[async_trait]
impl TokenFetcher for HttpTokenFetcher {
    #[instrument(skip(self, profile), fields(destination = %profile.name))]
    async fn fetch(&self, profile: &ClientProfile) -> Result<AccessToken, ClassifiedError> {
        self.request_token(profile, vec![("grant_type", "client_credentials".to_string())])
            .await
    }

    #[instrument(skip_all, fields(destination = %profile.name))]
    async fn refresh(
        &self,
        profile: &ClientProfile,
        refresh_token: &str,
    ) -> Result<AccessToken, ClassifiedError> {
        self.request_token(
            profile,
            vec![
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", refresh_token.to_string()),
            ],
        )
        .await
    }
}

/// Scripted fetcher for tests.
///
/// Queued responses are returned in order; once the queue is empty every
/// call issues a new token `token-<n>` valid for five minutes.
#[derive(Debug, Default)]
pub struct MockTokenFetcher {
    queue: Mutex<VecDeque<Result<TokenResponse, ClassifiedError>>>,
    delay: Duration,
    fetch_calls: AtomicU32,
    refresh_calls: AtomicU32,
}

impl MockTokenFetcher {
    /// Create an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue a token with the given lifetime in seconds.
    pub fn push_token(&self, value: impl Into<String>, expires_in: u64) -> &Self {
        self.queue.lock().push_back(Ok(TokenResponse {
            access_token: value.into(),
            token_type: Some("Bearer".to_string()),
            expires_in,
            refresh_token: None,
        }));
        self
    }

    /// Queue a token that carries a refresh token.
    pub fn push_token_with_refresh(
        &self,
        value: impl Into<String>,
        expires_in: u64,
        refresh_token: impl Into<String>,
    ) -> &Self {
        self.queue.lock().push_back(Ok(TokenResponse {
            access_token: value.into(),
            token_type: Some("Bearer".to_string()),
            expires_in,
            refresh_token: Some(refresh_token.into()),
        }));
        self
    }

    /// Queue a failure.
    pub fn push_error(&self, error: ClassifiedError) -> &Self {
        self.queue.lock().push_back(Err(error));
        self
    }

    /// Number of client-credentials fetches performed.
    #[must_use]
    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of refresh-token exchanges performed.
    #[must_use]
    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    async fn next(&self, call: u32) -> Result<AccessToken, ClassifiedError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.queue.lock().pop_front();
        let response = scripted.unwrap_or_else(|| {
            Ok(TokenResponse {
                access_token: format!("token-{call}"),
                token_type: Some("Bearer".to_string()),
                expires_in: 300,
                refresh_token: None,
            })
        })?;
        Ok(AccessToken::from_response(response, now_millis()))
    }
}

#[async_trait]
impl TokenFetcher for MockTokenFetcher {
    async fn fetch(&self, _profile: &ClientProfile) -> Result<AccessToken, ClassifiedError> {
        let call = self.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.next(call).await
    }

    async fn refresh(
        &self,
        _profile: &ClientProfile,
        _refresh_token: &str,
    ) -> Result<AccessToken, ClassifiedError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.next(call).await
    }
}
