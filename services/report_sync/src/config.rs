//! services/report_sync/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// The default quiet period before a pending edit is written.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Anonymous users idle for this many days are purged from the database.
pub const DEFAULT_ANONYMOUS_USER_TTL_DAYS: u64 = 30;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Connection parameters of the auth/document backend.
///
/// Passed explicitly to whatever needs them; nothing reads these from globals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendConfig {
    pub api_key: Option<String>,
    pub project_id: String,
    pub auth_domain: Option<String>,
    pub storage_bucket: Option<String>,
    pub messaging_sender_id: Option<String>,
    pub app_id: Option<String>,
    pub measurement_id: Option<String>,
}

impl BackendConfig {
    /// A config with only the project id set.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            api_key: None,
            project_id: project_id.into(),
            auth_domain: None,
            storage_bucket: None,
            messaging_sender_id: None,
            app_id: None,
            measurement_id: None,
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// When set, the Postgres adapters are used instead of the in-memory ones.
    pub database_url: Option<String>,
    pub log_level: Level,
    pub debounce: Duration,
    pub allowed_origin: String,
    /// How long an idle anonymous user is kept; `None` keeps them forever.
    pub anonymous_user_ttl: Option<Duration>,
    pub backend: BackendConfig,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // --- Server Settings ---
        let bind_address_str = lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let debounce = match lookup("DEBOUNCE_MS") {
            Some(raw) => {
                let millis = raw.parse::<u64>().map_err(|_| {
                    ConfigError::InvalidValue(
                        "DEBOUNCE_MS".to_string(),
                        format!("'{}' is not a number of milliseconds", raw),
                    )
                })?;
                Duration::from_millis(millis)
            }
            None => DEFAULT_DEBOUNCE,
        };

        let allowed_origin =
            lookup("ALLOWED_ORIGIN").unwrap_or_else(|| "http://localhost:3000".to_string());

        let anonymous_user_ttl = match lookup("ANONYMOUS_USER_TTL_DAYS") {
            Some(raw) => {
                let days = raw.parse::<u64>().map_err(|_| {
                    ConfigError::InvalidValue(
                        "ANONYMOUS_USER_TTL_DAYS".to_string(),
                        format!("'{}' is not a number of days", raw),
                    )
                })?;
                (days > 0).then(|| Duration::from_secs(days * SECONDS_PER_DAY))
            }
            None => Some(Duration::from_secs(
                DEFAULT_ANONYMOUS_USER_TTL_DAYS * SECONDS_PER_DAY,
            )),
        };

        // --- Backend Connection ---
        let backend = BackendConfig {
            api_key: lookup("BACKEND_API_KEY"),
            project_id: lookup("BACKEND_PROJECT_ID")
                .ok_or_else(|| ConfigError::MissingVar("BACKEND_PROJECT_ID".to_string()))?,
            auth_domain: lookup("BACKEND_AUTH_DOMAIN"),
            storage_bucket: lookup("BACKEND_STORAGE_BUCKET"),
            messaging_sender_id: lookup("BACKEND_MESSAGING_SENDER_ID"),
            app_id: lookup("BACKEND_APP_ID"),
            measurement_id: lookup("BACKEND_MEASUREMENT_ID"),
        };

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            debounce,
            allowed_origin,
            anonymous_user_ttl,
            backend,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_project_is_set() {
        let config = Config::from_lookup(lookup_from(&[("BACKEND_PROJECT_ID", "nippou")])).unwrap();
        assert_eq!(config.bind_address.to_string(), "0.0.0.0:3000");
        assert_eq!(config.debounce, DEFAULT_DEBOUNCE);
        assert!(config.database_url.is_none());
        assert_eq!(config.backend, BackendConfig::new("nippou"));
        assert_eq!(
            config.anonymous_user_ttl,
            Some(Duration::from_secs(30 * 24 * 60 * 60))
        );
    }

    #[test]
    fn zero_anonymous_ttl_disables_the_sweep() {
        let config = Config::from_lookup(lookup_from(&[
            ("BACKEND_PROJECT_ID", "nippou"),
            ("ANONYMOUS_USER_TTL_DAYS", "0"),
        ]))
        .unwrap();
        assert_eq!(config.anonymous_user_ttl, None);

        let err = Config::from_lookup(lookup_from(&[
            ("BACKEND_PROJECT_ID", "nippou"),
            ("ANONYMOUS_USER_TTL_DAYS", "a month"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(var, _) if var == "ANONYMOUS_USER_TTL_DAYS"));
    }

    #[test]
    fn missing_project_id_is_an_error() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(var) if var == "BACKEND_PROJECT_ID"));
    }

    #[test]
    fn bad_debounce_is_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("BACKEND_PROJECT_ID", "nippou"),
            ("DEBOUNCE_MS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(var, _) if var == "DEBOUNCE_MS"));
    }

    #[test]
    fn backend_block_is_collected() {
        let config = Config::from_lookup(lookup_from(&[
            ("BACKEND_PROJECT_ID", "nippou"),
            ("BACKEND_API_KEY", "key"),
            ("BACKEND_AUTH_DOMAIN", "nippou.example.com"),
            ("DATABASE_URL", "postgres://localhost/nippou"),
            ("DEBOUNCE_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.backend.api_key.as_deref(), Some("key"));
        assert_eq!(config.backend.auth_domain.as_deref(), Some("nippou.example.com"));
        assert_eq!(config.debounce, Duration::from_millis(250));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/nippou"));
    }
}
