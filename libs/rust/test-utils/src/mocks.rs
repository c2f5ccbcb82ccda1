//! Wiremock-backed identity provider and downstream servers.

use crate::fixtures::{invalid_client_body, token_body};
use serde_json::Value;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Path of the mocked token endpoint.
pub const TOKEN_PATH: &str = "/token";

/// Mock OAuth2 token endpoint.
pub struct MockIdentityProvider {
    server: MockServer,
}

impl MockIdentityProvider {
    /// Start an identity provider with no responses mounted.
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Base URL of the provider.
    #[must_use]
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Full token endpoint URL.
    #[must_use]
    pub fn token_endpoint(&self) -> String {
        format!("{}{TOKEN_PATH}", self.server.uri())
    }

    /// Issue `access_token` for every client-credentials request.
    pub async fn issue(&self, access_token: &str, expires_in: u64) {
        self.respond(200, token_body(access_token, expires_in), None, None).await;
    }

    /// Issue `access_token` for the next `times` requests, after a `delay`.
    pub async fn issue_slowly(
        &self,
        access_token: &str,
        expires_in: u64,
        delay: Duration,
        times: u64,
    ) {
        self.respond(200, token_body(access_token, expires_in), Some(delay), Some(times))
            .await;
    }

    /// Reject the client credentials.
    pub async fn reject_client(&self) {
        self.respond(401, invalid_client_body(), None, None).await;
    }

    /// Fail the next `times` requests with a server error.
    pub async fn fail(&self, status: u16, times: u64) {
        self.respond(status, serde_json::json!({}), None, Some(times)).await;
    }

    /// Mount an arbitrary response.
    pub async fn respond(
        &self,
        status: u16,
        body: Value,
        delay: Option<Duration>,
        times: Option<u64>,
    ) {
        let mut template = ResponseTemplate::new(status).set_body_json(body);
        if let Some(delay) = delay {
            template = template.set_delay(delay);
        }
        let mock = Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type="))
            .respond_with(template);
        match times {
            Some(times) => mock.up_to_n_times(times).mount(&self.server).await,
            None => mock.mount(&self.server).await,
        }
    }

    /// Number of token requests received.
    pub async fn token_requests(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map_or(0, |requests| {
                requests
                    .iter()
                    .filter(|r| r.url.path() == TOKEN_PATH)
                    .count()
            })
    }
}

/// Mock downstream destination.
pub struct MockDownstream {
    server: MockServer,
}

impl MockDownstream {
    /// Start a downstream with no responses mounted.
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Base URL of the downstream.
    #[must_use]
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Underlying server for custom mocks.
    #[must_use]
    pub const fn server(&self) -> &MockServer {
        &self.server
    }

    /// Answer `GET route` with `status` for the next `times` requests, or forever.
    pub async fn get(&self, route: &str, status: u16, times: Option<u64>) {
        let mock = Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status));
        match times {
            Some(times) => mock.up_to_n_times(times).mount(&self.server).await,
            None => mock.mount(&self.server).await,
        }
    }

    /// Requests received, with their `Authorization` header values.
    pub async fn authorizations(&self) -> Vec<Option<String>> {
        self.server.received_requests().await.map_or_else(Vec::new, |requests| {
            requests
                .iter()
                .map(|r| {
                    r.headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                })
                .collect()
        })
    }

    /// Number of requests received.
    pub async fn request_count(&self) -> usize {
        self.server.received_requests().await.map_or(0, |requests| requests.len())
    }
}
