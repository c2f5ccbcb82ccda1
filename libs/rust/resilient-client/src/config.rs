//! Loading client profiles from files and the environment.
//!
//! Sources are layered in this order, later ones winning:
//! 1. the optional configuration file (format chosen by extension)
//! 2. `.env` entries, loaded into the process environment by `dotenvy`
//! 3. environment variables prefixed with `RESILIENT_CLIENT`, nested with `__`
//!    (for example `RESILIENT_CLIENT__TELEMETRY__LOG_LEVEL=debug`)

use crate::error::ConfigError;
use crate::profile::ClientProfile;
use crate::telemetry::TelemetryConfig;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RESILIENT_CLIENT";

/// Top-level configuration: all destination profiles plus telemetry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientsConfig {
    /// Destination profiles
    #[serde(default)]
    pub clients: Vec<ClientProfile>,
    /// Tracing setup
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl ClientsConfig {
    /// Load configuration from `path` (if any) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or a profile is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Ok(env_file) = dotenvy::dotenv() {
            debug!(path = %env_file.display(), "Loaded .env file");
        }

        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let loaded: Self = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        info!(profiles = loaded.clients.len(), "Client configuration loaded");
        Ok(loaded)
    }

    /// Parse configuration held in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not parse or a profile is invalid.
    pub fn parse(text: &str, format: FileFormat) -> Result<Self, ConfigError> {
        let parsed: Self = Config::builder()
            .add_source(File::from_str(text, format))
            .build()?
            .try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check name uniqueness and every profile.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for profile in &self.clients {
            if !seen.insert(profile.name.as_str()) {
                return Err(ConfigError::DuplicateProfile(profile.name.clone()));
            }
            profile.validate()?;
        }
        Ok(())
    }

    /// Look up a profile by name.
    #[must_use]
    pub fn profile(&self, name: &str) -> Option<&ClientProfile> {
        self.clients.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TOML: &str = r#"
[telemetry]
log_level = "debug"

[[clients]]
name = "billing"
address = "http://billing.internal:8080"
internal_oauth = true

[clients.auth]
server_url = "http://sso.internal"
realm = "platform"
client_id = "billing-client"
client_secret = "s3cret"

[clients.retry]
max_attempts = 5

[[clients]]
name = "ledger"
address = "http://ledger.internal"

[clients.basic]
username = "svc"
password = "pw"
"#;

    #[test]
    fn test_parse_toml_profiles() {
        let config = ClientsConfig::parse(TOML, FileFormat::Toml).unwrap();

        assert_eq!(config.clients.len(), 2);
        assert_eq!(config.telemetry.log_level, "debug");

        let billing = config.profile("billing").unwrap();
        assert!(billing.internal_oauth);
        assert_eq!(billing.retry.max_attempts, 5);
        assert_eq!(billing.retry.backoff_ms, 100);
        assert_eq!(billing.pool.max_connections, 2000);
        assert_eq!(
            billing.auth.as_ref().unwrap().token_url().unwrap(),
            "http://sso.internal/realms/platform/protocol/openid-connect/token"
        );

        let ledger = config.profile("ledger").unwrap();
        assert_eq!(ledger.basic.as_ref().unwrap().username, "svc");
        assert!(config.profile("missing").is_none());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let text = r#"
[[clients]]
name = "billing"
address = "http://a"

[[clients]]
name = "billing"
address = "http://b"
"#;
        let err = ClientsConfig::parse(text, FileFormat::Toml).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateProfile(name) if name == "billing"));
    }

    #[test]
    fn test_oauth_without_auth_block_rejected() {
        let text = r#"{"clients":[{"name":"billing","address":"http://a","internal_oauth":true}]}"#;
        let err = ClientsConfig::parse(text, FileFormat::Json).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let (path, mut file) = temp_config_file("clients.toml");
        file.write_all(TOML.as_bytes()).unwrap();
        drop(file);

        let config = ClientsConfig::load(Some(&path)).unwrap();
        assert_eq!(config.clients.len(), 2);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_load_missing_file_fails() {
        let err = ClientsConfig::load(Some(Path::new("/nonexistent/clients.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Source(_)));
    }

    fn temp_config_file(name: &str) -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("{}-{name}", uuid::Uuid::new_v4().simple()));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
