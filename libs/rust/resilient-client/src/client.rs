//! Request executor for one destination.
//!
//! [`ResilientClient`] attaches credentials, enforces the pool limits,
//! dispatches through the profile's `reqwest::Client`, turns every failure
//! into a [`ClassifiedError`] and lets the [`RetryPolicy`] decide what
//! happens next.

use crate::error::{ClassifiedError, codes};
use crate::http::build_http_client;
use crate::monitoring::{CallEvent, CallOutcome, MonitoringSink, TracingSink, log_request};
use crate::profile::ClientProfile;
use crate::retry::RetryPolicy;
use crate::token::{AccessToken, HttpTokenFetcher, TokenStore};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use secrecy::ExposeSecret;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

/// Header carrying the trace id of each call (`X-B3-TRACE-ID`).
pub const TRACE_ID_HEADER: &str = "x-b3-trace-id";

/// Request payload.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    /// No body
    #[default]
    Empty,
    /// JSON body
    Json(serde_json::Value),
    /// URL-encoded form body
    Form(Vec<(String, String)>),
    /// Raw text body
    Text(String),
}

/// A call to a destination, relative to its base address.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// HTTP method
    pub method: Method,
    /// Path appended to the profile address, or an absolute URL
    pub path: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// Extra headers
    pub headers: HeaderMap,
    /// Payload
    pub body: RequestBody,
    /// Trace id to propagate; generated when absent
    pub trace_id: Option<String>,
    /// Overall deadline across all attempts
    pub deadline: Option<Duration>,
}

impl ClientRequest {
    /// Create a request with no body.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            trace_id: None,
            deadline: None,
        }
    }

    /// `GET` request.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST` request.
    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// `PUT` request.
    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// `DELETE` request.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Add a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set a JSON body.
    #[must_use]
    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    /// Set a form body.
    #[must_use]
    pub fn with_form<K, V>(mut self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body =
            RequestBody::Form(fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Set a text body.
    #[must_use]
    pub fn with_text(mut self, body: impl Into<String>) -> Self {
        self.body = RequestBody::Text(body.into());
        self
    }

    /// Propagate an existing trace id.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Bound the whole call, retries included.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Successful downstream response.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    /// HTTP status
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
    /// Raw body
    pub body: Vec<u8>,
}

impl ClientResponse {
    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an unretryable `un_deserialize` error if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClassifiedError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            ClassifiedError::unretryable(
                codes::UN_DESERIALIZE,
                format!("invalid response body: {e}"),
            )
        })
    }

    /// Decode the body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns an unretryable `un_deserialize` error if the body is not UTF-8.
    pub fn text(&self) -> Result<String, ClassifiedError> {
        String::from_utf8(self.body.clone()).map_err(|e| {
            ClassifiedError::unretryable(
                codes::UN_DESERIALIZE,
                format!("response body is not UTF-8: {e}"),
            )
        })
    }
}

struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Authenticated, retrying HTTP client bound to one [`ClientProfile`].
pub struct ResilientClient {
    profile: ClientProfile,
    http: reqwest::Client,
    policy: RetryPolicy,
    single_attempt: RetryPolicy,
    tokens: Option<Arc<TokenStore>>,
    sink: Arc<dyn MonitoringSink>,
    static_authorization: Option<HeaderValue>,
    permits: Semaphore,
    pending: AtomicUsize,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("destination", &self.profile.name)
            .field("address", &self.profile.address)
            .field("oauth", &self.tokens.is_some())
            .finish_non_exhaustive()
    }
}

impl ResilientClient {
    /// Create a client for `profile`.
    ///
    /// Profiles with `internal_oauth` get a private [`TokenStore`] backed by
    /// an [`HttpTokenFetcher`]; use [`Self::with_parts`] to share one.
    ///
    /// # Errors
    ///
    /// Returns an unretryable `invalid_profile` error if the profile fails
    /// validation or its HTTP client cannot be built.
    pub fn new(profile: ClientProfile) -> Result<Self, ClassifiedError> {
        let tokens = if profile.internal_oauth {
            Some(Arc::new(TokenStore::new(Arc::new(HttpTokenFetcher::new()?))))
        } else {
            None
        };
        Self::with_parts(profile, tokens, Arc::new(TracingSink))
    }

    /// Create a client from explicit collaborators.
    ///
    /// `tokens` is required for `internal_oauth` profiles and ignored otherwise.
    ///
    /// # Errors
    ///
    /// Returns an unretryable `invalid_profile` error if the profile fails
    /// validation, lacks a token store it needs, or its HTTP client cannot
    /// be built.
    pub fn with_parts(
        profile: ClientProfile,
        tokens: Option<Arc<TokenStore>>,
        sink: Arc<dyn MonitoringSink>,
    ) -> Result<Self, ClassifiedError> {
        profile
            .validate()
            .map_err(|e| ClassifiedError::from(e).with_param(&profile.name))?;

        let tokens = if profile.internal_oauth {
            Some(tokens.ok_or_else(|| {
                ClassifiedError::unretryable(
                    codes::INVALID_PROFILE,
                    "internal_oauth profile needs a token store",
                )
                .with_param(&profile.name)
            })?)
        } else {
            None
        };
        let http = build_http_client(&profile)?;
        let static_authorization = static_authorization(&profile)?;
        let policy = RetryPolicy::for_profile(&profile);
        let single_attempt = RetryPolicy::new(profile.retry.clone().disabled());
        let permits = Semaphore::new(profile.pool.max_connections);

        Ok(Self {
            profile,
            http,
            policy,
            single_attempt,
            tokens,
            sink,
            static_authorization,
            permits,
            pending: AtomicUsize::new(0),
        })
    }

    /// Report call events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn MonitoringSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Profile this client was built from.
    #[must_use]
    pub const fn profile(&self) -> &ClientProfile {
        &self.profile
    }

    /// Token store used for bearer authentication, if any.
    #[must_use]
    pub const fn token_store(&self) -> Option<&Arc<TokenStore>> {
        self.tokens.as_ref()
    }

    /// Execute a request.
    ///
    /// # Errors
    ///
    /// Returns the classified error of the last attempt.
    pub async fn execute(&self, request: ClientRequest) -> Result<ClientResponse, ClassifiedError> {
        self.execute_with_cancel(request, &CancellationToken::new()).await
    }

    /// Execute a request that stops early when `cancel` fires.
    ///
    /// A token fetch this call was waiting on keeps running and still fills
    /// the cache for other callers.
    ///
    /// # Errors
    ///
    /// Returns the classified error of the last attempt, or a `cancelled` /
    /// `deadline_exceeded` error.
    #[instrument(
        skip_all,
        fields(destination = %self.profile.name, method = %request.method, path = %request.path)
    )]
    pub async fn execute_with_cancel(
        &self,
        request: ClientRequest,
        cancel: &CancellationToken,
    ) -> Result<ClientResponse, ClassifiedError> {
        let started = Instant::now();
        let trace_id = request
            .trace_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let last_attempt = AtomicU32::new(1);
        let refresh_spent = AtomicBool::new(false);

        let result = match self.resolve(&request) {
            Ok(url) => {
                let policy = if self.policy.allows_method(&request.method) {
                    &self.policy
                } else {
                    &self.single_attempt
                };
                let work = policy.execute(|attempt| {
                    last_attempt.store(attempt, Ordering::SeqCst);
                    self.attempt(&request, &url, &trace_id, &refresh_spent)
                });
                let bounded = async {
                    match request.deadline {
                        Some(limit) => tokio::time::timeout(limit, work).await.unwrap_or_else(|_| {
                            Err(ClassifiedError::deadline_exceeded(&self.profile.name))
                        }),
                        None => work.await,
                    }
                };
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(ClassifiedError::cancelled(&self.profile.name)),
                    result = bounded => result,
                }
            }
            Err(error) => Err(error),
        };

        let retry_count = last_attempt.load(Ordering::SeqCst).saturating_sub(1);
        if self.profile.monitoring.enabled {
            let outcome = match &result {
                Ok(response) => CallOutcome::Success {
                    status: response.status,
                },
                Err(error) => CallOutcome::from_error(error),
            };
            self.sink.record_call(&CallEvent {
                destination: self.profile.name.clone(),
                method: request.method.to_string(),
                target: request.path.clone(),
                duration: started.elapsed(),
                outcome,
                retry_count,
                request_id: trace_id,
                timestamp: chrono::Utc::now(),
            });
        }
        result
    }

    /// `GET path`.
    ///
    /// # Errors
    ///
    /// See [`Self::execute`].
    pub async fn get(&self, path: &str) -> Result<ClientResponse, ClassifiedError> {
        self.execute(ClientRequest::get(path)).await
    }

    /// `POST path` with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` if `body` cannot be serialized, otherwise see [`Self::execute`].
    pub async fn post_json<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ClientResponse, ClassifiedError> {
        let body = to_json(body)?;
        self.execute(ClientRequest::post(path).with_json(body)).await
    }

    /// `POST path` with a form body.
    ///
    /// # Errors
    ///
    /// See [`Self::execute`].
    pub async fn post_form(
        &self,
        path: &str,
        fields: &[(&str, &str)],
    ) -> Result<ClientResponse, ClassifiedError> {
        self.execute(ClientRequest::post(path).with_form(fields.iter().copied()))
            .await
    }

    /// `PUT path` with a JSON body.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` if `body` cannot be serialized, otherwise see [`Self::execute`].
    pub async fn put_json<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ClientResponse, ClassifiedError> {
        let body = to_json(body)?;
        self.execute(ClientRequest::put(path).with_json(body)).await
    }

    /// `DELETE path`.
    ///
    /// # Errors
    ///
    /// See [`Self::execute`].
    pub async fn delete(&self, path: &str) -> Result<ClientResponse, ClassifiedError> {
        self.execute(ClientRequest::delete(path)).await
    }

    fn resolve(&self, request: &ClientRequest) -> Result<Url, ClassifiedError> {
        let raw = if request.path.starts_with("http://") || request.path.starts_with("https://") {
            request.path.clone()
        } else {
            format!(
                "{}/{}",
                self.profile.address.trim_end_matches('/'),
                request.path.trim_start_matches('/')
            )
        };
        let mut url = Url::parse(&raw).map_err(|e| {
            ClassifiedError::unretryable(
                codes::INVALID_REQUEST,
                format!("invalid target {raw}: {e}"),
            )
            .with_param(&self.profile.name)
        })?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }

    async fn attempt(
        &self,
        request: &ClientRequest,
        url: &Url,
        trace_id: &str,
        refresh_spent: &AtomicBool,
    ) -> Result<ClientResponse, ClassifiedError> {
        let _permit = self.acquire_permit().await?;

        let token = match &self.tokens {
            Some(store) => Some(store.get_token(&self.profile).await?),
            None => None,
        };
        let response = self.dispatch(request, url, trace_id, token.as_ref()).await?;

        // One forced refresh per request, whatever attempt hits the 401.
        if response.status == 401 && !refresh_spent.swap(true, Ordering::SeqCst) {
            if let (Some(store), Some(rejected)) = (&self.tokens, token.as_ref()) {
                debug!(destination = %self.profile.name, "Token rejected, refreshing once");
                store.invalidate_token(&self.profile.name, rejected);
                let fresh = store.get_token(&self.profile).await?;
                let response = self.dispatch(request, url, trace_id, Some(&fresh)).await?;
                return self.check_status(response);
            }
        }
        self.check_status(response)
    }

    async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>, ClassifiedError> {
        let closed = || {
            ClassifiedError::transient(codes::INTERNAL, "connection pool closed")
                .with_param(&self.profile.name)
        };
        match self.permits.try_acquire() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(closed()),
            Err(TryAcquireError::NoPermits) => {}
        }

        let exhausted = || {
            ClassifiedError::transient(codes::POOL_EXHAUSTED, "connection pool exhausted")
                .with_param(&self.profile.name)
        };
        if self.profile.pool.fail_fast {
            warn!(destination = %self.profile.name, "Connection pool exhausted, failing fast");
            return Err(exhausted());
        }

        let waiting = self.pending.fetch_add(1, Ordering::SeqCst);
        let _pending = PendingGuard(&self.pending);
        if waiting >= self.profile.pool.max_pending {
            warn!(destination = %self.profile.name, waiting, "Pending acquire queue full");
            return Err(exhausted());
        }
        self.permits.acquire().await.map_err(|_| closed())
    }

    async fn dispatch(
        &self,
        request: &ClientRequest,
        url: &Url,
        trace_id: &str,
        token: Option<&AccessToken>,
    ) -> Result<ClientResponse, ClassifiedError> {
        let name = &self.profile.name;
        let mut headers = request.headers.clone();

        let authorization = match token {
            Some(token) => Some(sensitive_header(&token.authorization_header(), name)?),
            None => self.static_authorization.clone(),
        };
        if let Some(value) = authorization {
            headers.insert(AUTHORIZATION, value);
        }
        let trace_value = HeaderValue::from_str(trace_id).map_err(|e| {
            ClassifiedError::unretryable(codes::INVALID_REQUEST, format!("invalid trace id: {e}"))
                .with_param(name)
        })?;
        headers.insert(HeaderName::from_static(TRACE_ID_HEADER), trace_value);

        log_request(&self.profile.log, name, request.method.as_str(), url.as_str(), &headers);

        let builder = self
            .http
            .request(request.method.clone(), url.clone())
            .headers(headers)
            .timeout(self.profile.timeout.total());
        let builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Text(text) => builder.body(text.clone()),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| ClassifiedError::from_transport(&e, name))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| ClassifiedError::from_transport(&e, name))?;

        Ok(ClientResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }

    fn check_status(&self, response: ClientResponse) -> Result<ClientResponse, ClassifiedError> {
        let status = response.status;
        if (200..300).contains(&status) {
            return Ok(response);
        }
        let name = &self.profile.name;
        let message = format!("{name} returned HTTP {status}");

        // A 401 reaching this point has already had its one forced refresh.
        let error = if status == 401 {
            ClassifiedError::auth(codes::UNAUTHORIZED, message).mark_auth_retried()
        } else if self.policy.is_retryable_status(status) {
            ClassifiedError::transient(codes::UPSTREAM_STATUS, message)
        } else {
            ClassifiedError::unretryable(codes::UPSTREAM_STATUS, message)
        };
        Err(error.with_status(status).with_param(name))
    }
}

fn to_json<T: Serialize>(body: &T) -> Result<serde_json::Value, ClassifiedError> {
    serde_json::to_value(body).map_err(|e| {
        ClassifiedError::unretryable(
            codes::INVALID_REQUEST,
            format!("request body not serializable: {e}"),
        )
    })
}

fn sensitive_header(value: &str, destination: &str) -> Result<HeaderValue, ClassifiedError> {
    let mut header = HeaderValue::from_str(value).map_err(|e| {
        ClassifiedError::unretryable(
            codes::INVALID_PROFILE,
            format!("invalid authorization header: {e}"),
        )
        .with_param(destination)
    })?;
    header.set_sensitive(true);
    Ok(header)
}

fn static_authorization(profile: &ClientProfile) -> Result<Option<HeaderValue>, ClassifiedError> {
    if let Some(value) = &profile.authorization {
        return sensitive_header(value.expose_secret(), &profile.name).map(Some);
    }
    if let Some(basic) = &profile.basic {
        let encoded = STANDARD.encode(format!(
            "{}:{}",
            basic.username,
            basic.password.expose_secret()
        ));
        return sensitive_header(&format!("Basic {encoded}"), &profile.name).map(Some);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::monitoring::RecordingSink;
    use crate::profile::{AuthConfig, PoolConfig, RetryConfig};
    use crate::token::{MockTokenFetcher, TokenFetcher};
    use wiremock::matchers::{body_json, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry() -> RetryConfig {
        RetryConfig::default().with_backoff(10, 1.0).with_max_backoff(10)
    }

    fn plain_profile(server: &MockServer) -> ClientProfile {
        ClientProfile::new("billing", server.uri()).with_retry(fast_retry())
    }

    fn oauth_client(server: &MockServer, fetcher: &Arc<MockTokenFetcher>) -> ResilientClient {
        let profile = plain_profile(server).with_oauth(AuthConfig::new(
            "http://sso.internal/token",
            "billing-client",
            "s3cret",
        ));
        let store = Arc::new(TokenStore::new(Arc::clone(fetcher) as Arc<dyn TokenFetcher>));
        ResilientClient::with_parts(profile, Some(store), Arc::new(TracingSink)).unwrap()
    }

    fn recorded(client: ResilientClient) -> (ResilientClient, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (client.with_sink(Arc::clone(&sink) as Arc<dyn MonitoringSink>), sink)
    }

    #[tokio::test]
    async fn test_transient_statuses_retried_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invoices"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/invoices"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let (client, sink) = recorded(ResilientClient::new(plain_profile(&server)).unwrap());
        let response = client.get("/invoices").await.unwrap();

        assert_eq!(response.text().unwrap(), "ok");
        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].retry_count, 2);
        assert_eq!(calls[0].outcome, CallOutcome::Success { status: 200 });
    }

    #[tokio::test]
    async fn test_transient_status_exhausts_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let client = ResilientClient::new(plain_profile(&server)).unwrap();
        let err = client.get("/invoices").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Transient);
        assert_eq!(err.code, codes::UPSTREAM_STATUS);
        assert_eq!(err.status, Some(502));
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = ResilientClient::new(plain_profile(&server)).unwrap();
        let err = client.get("/missing").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Unretryable);
        assert_eq!(err.status, Some(404));
    }

    #[tokio::test]
    async fn test_post_not_retried_by_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoices"))
            .and(body_json(serde_json::json!({"amount": 10})))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let client = ResilientClient::new(plain_profile(&server)).unwrap();
        let err = client
            .post_json("/invoices", &serde_json::json!({"amount": 10}))
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_rejected_token_refreshed_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer token-2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = Arc::new(MockTokenFetcher::new());
        let (client, sink) = recorded(oauth_client(&server, &fetcher));
        let response = client.get("/invoices").await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(fetcher.fetch_calls(), 2);
        assert_eq!(sink.calls()[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_second_rejection_surfaces_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let fetcher = Arc::new(MockTokenFetcher::new());
        let client = oauth_client(&server, &fetcher);
        let err = client.get("/invoices").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Auth);
        assert_eq!(err.code, codes::UNAUTHORIZED);
        assert!(err.auth_retried());
        assert_eq!(fetcher.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_spent_once_per_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer token-2"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer token-2"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer token-3"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let fetcher = Arc::new(MockTokenFetcher::new());
        let client = oauth_client(&server, &fetcher);
        let err = client.get("/invoices").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Auth);
        assert_eq!(err.status, Some(401));
        assert!(err.auth_retried());
        assert_eq!(fetcher.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_client_fails_without_dispatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let fetcher = Arc::new(MockTokenFetcher::new());
        fetcher.push_error(ClassifiedError::unretryable(
            codes::INVALID_CLIENT,
            "Invalid client credentials",
        ));
        let client = oauth_client(&server, &fetcher);
        let err = client.get("/invoices").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Unretryable);
        assert_eq!(err.code, codes::INVALID_CLIENT);
        assert_eq!(fetcher.fetch_calls(), 1);
        let store = client.token_store().unwrap();
        assert_eq!(store.state("billing"), crate::token::TokenState::Empty);
    }

    #[tokio::test]
    async fn test_basic_credentials_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            ResilientClient::new(plain_profile(&server).with_basic_auth("user", "pass")).unwrap();
        assert_eq!(client.get("/").await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_trace_id_propagated_and_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("x-b3-trace-id", "abc123"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (client, sink) = recorded(ResilientClient::new(plain_profile(&server)).unwrap());
        client
            .execute(ClientRequest::get("/").with_trace_id("abc123"))
            .await
            .unwrap();

        assert_eq!(sink.calls()[0].request_id, "abc123");
    }

    #[tokio::test]
    async fn test_trace_id_generated_when_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("x-b3-trace-id"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = ResilientClient::new(plain_profile(&server)).unwrap();
        assert!(client.get("/").await.is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_stops_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let client = ResilientClient::new(plain_profile(&server)).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = client
            .execute_with_cancel(ClientRequest::get("/slow"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::CANCELLED);
        assert_eq!(err.kind, ErrorKind::Unretryable);
    }

    #[tokio::test]
    async fn test_deadline_bounds_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let client = ResilientClient::new(plain_profile(&server)).unwrap();
        let err = client
            .execute(ClientRequest::get("/slow").with_deadline(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::DEADLINE_EXCEEDED);
    }

    #[tokio::test]
    async fn test_fail_fast_pool_rejects_excess_calls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let profile = plain_profile(&server)
            .with_pool(PoolConfig::default().with_max_connections(1).with_fail_fast())
            .with_retry(RetryConfig::default().disabled());
        let client = Arc::new(ResilientClient::new(profile).unwrap());

        let first = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.get("/slow").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = client.get("/slow").await.unwrap_err();

        assert_eq!(err.code, codes::POOL_EXHAUSTED);
        assert_eq!(err.kind, ErrorKind::Transient);
        assert!(first.await.unwrap().is_ok());
    }

    fn single_slot_profile(server: &MockServer, max_pending: usize) -> ClientProfile {
        plain_profile(server)
            .with_pool(
                PoolConfig::default()
                    .with_max_connections(1)
                    .with_max_pending(max_pending),
            )
            .with_retry(RetryConfig::default().disabled())
    }

    async fn slow_server(delay: Duration) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(delay))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_queued_call_waits_for_permit() {
        let server = slow_server(Duration::from_millis(200)).await;
        let client = Arc::new(ResilientClient::new(single_slot_profile(&server, 4)).unwrap());

        let first = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.get("/slow").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let queued_at = Instant::now();
        let response = client.get("/slow").await.unwrap();

        assert_eq!(response.status, 200);
        assert!(queued_at.elapsed() >= Duration::from_millis(300));
        assert!(first.await.unwrap().is_ok());
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_queue_limit_rejects_overflow() {
        let server = slow_server(Duration::from_millis(300)).await;
        let client = Arc::new(ResilientClient::new(single_slot_profile(&server, 1)).unwrap());

        let spawn_call = || {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.get("/slow").await })
        };
        let running = spawn_call();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queued = spawn_call();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = client.get("/slow").await.unwrap_err();
        assert_eq!(err.code, codes::POOL_EXHAUSTED);
        assert_eq!(err.kind, ErrorKind::Transient);
        assert!(running.await.unwrap().is_ok());
        assert!(queued.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_saturated_destination_does_not_block_others() {
        let slow = slow_server(Duration::from_millis(500)).await;
        let fast = slow_server(Duration::ZERO).await;
        let saturated = Arc::new(ResilientClient::new(single_slot_profile(&slow, 4)).unwrap());
        let other = ResilientClient::new(
            ClientProfile::new("ledger", fast.uri())
                .with_pool(PoolConfig::default().with_max_connections(1)),
        )
        .unwrap();

        let busy: Vec<_> = (0..3)
            .map(|_| {
                let client = Arc::clone(&saturated);
                tokio::spawn(async move { client.get("/slow").await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let response = tokio::time::timeout(Duration::from_millis(200), other.get("/"))
            .await
            .expect("other destination must not wait on the saturated pool")
            .unwrap();
        assert_eq!(response.status, 200);
        for call in busy {
            assert!(call.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_fixed_authorization_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "ApiKey k3y"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            ResilientClient::new(plain_profile(&server).with_authorization("ApiKey k3y")).unwrap();
        assert_eq!(client.get("/").await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_monitoring_disabled_emits_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (client, sink) =
            recorded(ResilientClient::new(plain_profile(&server).with_monitoring(false)).unwrap());
        client.get("/").await.unwrap();
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn test_query_and_json_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/invoices"))
            .and(wiremock::matchers::query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"count": 3})))
            .expect(1)
            .mount(&server)
            .await;

        let client = ResilientClient::new(plain_profile(&server)).unwrap();
        let response = client
            .execute(ClientRequest::get("invoices").with_query("page", "2"))
            .await
            .unwrap();
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["count"], 3);
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let err = ResilientClient::new(ClientProfile::new("bad", "not a url")).unwrap_err();
        assert_eq!(err.code, codes::INVALID_PROFILE);
        assert_eq!(err.kind, ErrorKind::Unretryable);
    }
}
