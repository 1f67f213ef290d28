//! Server configuration from environment variables.

use std::time::Duration;

use anyhow::{Context, Result};
use roost_mediator::{MediatorConfig, RetryPolicy};
use tracing::info;

/// Runtime configuration for the server binary.
///
/// Every knob has a default suitable for local development; production
/// deployments override via `ROOST_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port for the HTTP/WebSocket listener.
    pub http_port: u16,
    /// Path to the libSQL database file.
    pub db_path: String,
    /// Mediator core settings derived from the environment.
    pub mediator: MediatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 7402,
            db_path: "roost.db".to_string(),
            mediator: MediatorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let http_port = match std::env::var("ROOST_HTTP_PORT") {
            Ok(v) => v.parse().context("invalid ROOST_HTTP_PORT")?,
            Err(_) => defaults.http_port,
        };
        let db_path =
            std::env::var("ROOST_DB_PATH").unwrap_or_else(|_| defaults.db_path.clone());

        let mut mediator = MediatorConfig::default();
        if let Ok(v) = std::env::var("ROOST_RETRY_BASE_DELAY_MS") {
            let ms: u64 = v.parse().context("invalid ROOST_RETRY_BASE_DELAY_MS")?;
            let retry = mediator.retry;
            mediator =
                mediator.with_retry(RetryPolicy::new(Duration::from_millis(ms), retry.max_retries));
        }
        if let Ok(v) = std::env::var("ROOST_MAX_RETRIES") {
            let max: u32 = v.parse().context("invalid ROOST_MAX_RETRIES")?;
            let retry = mediator.retry;
            mediator = mediator.with_retry(RetryPolicy::new(retry.base_delay, max));
        }
        if let Ok(v) = std::env::var("ROOST_SWEEP_INTERVAL_SECS") {
            let secs: u64 = v.parse().context("invalid ROOST_SWEEP_INTERVAL_SECS")?;
            mediator = mediator.with_sweep_interval(Duration::from_secs(secs));
        }
        if let Ok(v) = std::env::var("ROOST_SWEEP_BATCH_LIMIT") {
            let limit: usize = v.parse().context("invalid ROOST_SWEEP_BATCH_LIMIT")?;
            mediator = mediator.with_sweep_batch_limit(limit);
        }
        if let Ok(v) = std::env::var("ROOST_REQUIRE_MEDIATION_GRANT") {
            mediator = mediator
                .with_mediation_gating(parse_bool(&v).context("invalid ROOST_REQUIRE_MEDIATION_GRANT")?);
        }
        if let Ok(v) = std::env::var("ROOST_DEFAULT_GRANT_ALL") {
            mediator = mediator
                .with_default_grant_all(parse_bool(&v).context("invalid ROOST_DEFAULT_GRANT_ALL")?);
        }

        Ok(Self {
            http_port,
            db_path,
            mediator,
        })
    }

    /// Log the effective configuration at startup. Never logs secrets;
    /// this config carries none, but the rule stands.
    pub fn log_config(&self) {
        info!(
            http_port = self.http_port,
            db_path = %self.db_path,
            retry_base_delay_ms = self.mediator.retry.base_delay.as_millis() as u64,
            max_retries = self.mediator.retry.max_retries,
            sweep_interval_secs = self.mediator.sweep_interval.as_secs(),
            sweep_batch_limit = self.mediator.sweep_batch_limit,
            require_mediation_grant = self.mediator.require_mediation_grant,
            default_grant_all = self.mediator.default_grant_all,
            "Server configuration loaded"
        );
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.http_port, 7402);
        assert_eq!(config.db_path, "roost.db");
        assert!(!config.mediator.require_mediation_grant);
    }

    #[test]
    fn test_from_env_overrides_retry() {
        std::env::set_var("ROOST_RETRY_BASE_DELAY_MS", "250");
        std::env::set_var("ROOST_MAX_RETRIES", "7");

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.mediator.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.mediator.retry.max_retries, 7);

        std::env::remove_var("ROOST_RETRY_BASE_DELAY_MS");
        std::env::remove_var("ROOST_MAX_RETRIES");
    }

    #[test]
    fn test_parse_bool_variants() {
        assert!(parse_bool("true").unwrap());
        assert!(parse_bool("YES").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("false").unwrap());
        assert!(!parse_bool("off").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
