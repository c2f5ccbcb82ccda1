//! One client per configured destination.

use crate::client::{ClientRequest, ClientResponse, ResilientClient};
use crate::config::ClientsConfig;
use crate::error::{ClassifiedError, codes};
use crate::monitoring::{MonitoringSink, TracingSink};
use crate::token::{HttpTokenFetcher, TokenFetcher, TokenStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Clients built from a [`ClientsConfig`], sharing one token store and sink.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: HashMap<String, Arc<ResilientClient>>,
    tokens: Arc<TokenStore>,
}

impl ClientRegistry {
    /// Build clients for every profile, fetching tokens over HTTP and
    /// reporting to `tracing`.
    ///
    /// # Errors
    ///
    /// Fails on the first profile that cannot be turned into a client.
    pub fn from_config(config: &ClientsConfig) -> Result<Self, ClassifiedError> {
        Self::with_parts(config, Arc::new(HttpTokenFetcher::new()?), Arc::new(TracingSink))
    }

    /// Build clients with explicit collaborators.
    ///
    /// # Errors
    ///
    /// Fails on duplicate names or the first invalid profile.
    pub fn with_parts(
        config: &ClientsConfig,
        fetcher: Arc<dyn TokenFetcher>,
        sink: Arc<dyn MonitoringSink>,
    ) -> Result<Self, ClassifiedError> {
        config.validate()?;

        let tokens = Arc::new(TokenStore::new(fetcher).with_sink(Arc::clone(&sink)));
        let mut clients = HashMap::with_capacity(config.clients.len());
        for profile in &config.clients {
            let client = ResilientClient::with_parts(
                profile.clone(),
                Some(Arc::clone(&tokens)),
                Arc::clone(&sink),
            )?;
            info!(
                destination = %profile.name,
                address = %profile.address,
                oauth = profile.internal_oauth,
                "Registered client"
            );
            clients.insert(profile.name.clone(), Arc::new(client));
        }
        Ok(Self { clients, tokens })
    }

    /// Client for a destination.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ResilientClient>> {
        self.clients.get(name).cloned()
    }

    /// Client for a destination, failing for unknown names.
    ///
    /// # Errors
    ///
    /// Returns an unretryable `invalid_profile` error if no such profile exists.
    pub fn client(&self, name: &str) -> Result<Arc<ResilientClient>, ClassifiedError> {
        self.get(name).ok_or_else(|| {
            ClassifiedError::unretryable(
                codes::INVALID_PROFILE,
                format!("no client profile named {name}"),
            )
            .with_param(name)
        })
    }

    /// Execute a request against a named destination.
    ///
    /// # Errors
    ///
    /// See [`ResilientClient::execute`].
    pub async fn execute(
        &self,
        name: &str,
        request: ClientRequest,
    ) -> Result<ClientResponse, ClassifiedError> {
        self.client(name)?.execute(request).await
    }

    /// Shared token store.
    #[must_use]
    pub const fn token_store(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Registered destination names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{AuthConfig, ClientProfile};
    use crate::token::MockTokenFetcher;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ClientsConfig {
        ClientsConfig {
            clients: vec![
                ClientProfile::new("billing", server.uri()).with_oauth(AuthConfig::new(
                    "http://sso.internal/token",
                    "billing-client",
                    "s3cret",
                )),
                ClientProfile::new("ledger", server.uri()),
            ],
            ..ClientsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_registry_routes_by_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = Arc::new(MockTokenFetcher::new());
        let registry = ClientRegistry::with_parts(
            &config(&server),
            Arc::clone(&fetcher) as Arc<dyn TokenFetcher>,
            Arc::new(TracingSink),
        )
        .unwrap();

        let mut names: Vec<_> = registry.names().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["billing", "ledger"]);

        assert_eq!(registry.execute("billing", ClientRequest::get("/")).await.unwrap().status, 200);
        assert_eq!(registry.execute("ledger", ClientRequest::get("/")).await.unwrap().status, 204);
        assert_eq!(fetcher.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_destination_rejected() {
        let server = MockServer::start().await;
        let registry = ClientRegistry::with_parts(
            &config(&server),
            Arc::new(MockTokenFetcher::new()),
            Arc::new(TracingSink),
        )
        .unwrap();

        let err = registry.execute("missing", ClientRequest::get("/")).await.unwrap_err();
        assert_eq!(err.code, codes::INVALID_PROFILE);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_invalid_profile_fails_construction() {
        let config = ClientsConfig {
            clients: vec![ClientProfile::new("bad", "::not-a-url::")],
            ..ClientsConfig::default()
        };
        let err = ClientRegistry::with_parts(
            &config,
            Arc::new(MockTokenFetcher::new()),
            Arc::new(TracingSink),
        )
        .unwrap_err();
        assert_eq!(err.code, codes::INVALID_PROFILE);
    }
}
