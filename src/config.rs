//! Configuration for the sluice outbox worker.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use rand::Rng;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sluice_core::LEASE_DURATION;
use sluice_delivery::{ClientConfig, DeliveryConfig, RetryPolicy};

const CONFIG_FILE: &str = "sluice.toml";

/// Worker configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`sluice.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// The store is addressed by `DATABASE_URL` when set, otherwise by the
/// `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD` and `DB_NAME` components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// Full PostgreSQL connection URL. Takes precedence over the components.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default, alias = "DATABASE_URL")]
    pub database_url: Option<String>,
    /// Database host.
    ///
    /// Environment variable: `DB_HOST`
    #[serde(default = "default_db_host", alias = "DB_HOST")]
    pub db_host: String,
    /// Database port.
    ///
    /// Environment variable: `DB_PORT`
    #[serde(default = "default_db_port", alias = "DB_PORT")]
    pub db_port: u16,
    /// Database user.
    ///
    /// Environment variable: `DB_USER`
    #[serde(default = "default_db_user", alias = "DB_USER")]
    pub db_user: String,
    /// Database password.
    ///
    /// Environment variable: `DB_PASSWORD`
    #[serde(default = "default_db_password", alias = "DB_PASSWORD")]
    pub db_password: String,
    /// Database name.
    ///
    /// Environment variable: `DB_NAME`
    #[serde(default = "default_db_name", alias = "DB_NAME")]
    pub db_name: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Channel the outbox trigger notifies on.
    ///
    /// Environment variable: `DB_CHANNEL`
    #[serde(default = "default_db_channel", alias = "DB_CHANNEL")]
    pub db_channel: String,

    // Delivery
    /// FHIR server base URL.
    ///
    /// Environment variable: `FHIR_SERVER`
    #[serde(default = "default_fhir_server", alias = "FHIR_SERVER")]
    pub fhir_server: String,
    /// Identity recorded in `locked_by` on claimed rows.
    ///
    /// Environment variable: `WORKER_ID`
    #[serde(default = "default_worker_id", alias = "WORKER_ID")]
    pub worker_id: String,
    /// Attempt ceiling. Carried for operators; delivery does not consult it.
    ///
    /// Environment variable: `MAX_RETRIES`
    #[serde(default = "default_max_retries", alias = "MAX_RETRIES")]
    pub max_retries: u32,
    /// Interval between poll ticks in milliseconds.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,
    /// Groups drained per notification.
    ///
    /// Environment variable: `PROCESS_BURST_LIMIT`
    #[serde(default, alias = "PROCESS_BURST_LIMIT")]
    pub process_burst_limit: Option<usize>,
    /// Older name for `process_burst_limit`, used when that is unset.
    ///
    /// Environment variable: `BURST_LIMIT`
    #[serde(default, alias = "BURST_LIMIT")]
    pub burst_limit: Option<usize>,
    /// FHIR request timeout in milliseconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_MS`
    #[serde(default = "default_delivery_timeout_ms", alias = "DELIVERY_TIMEOUT_MS")]
    pub delivery_timeout_ms: u64,
    /// Time allowed for the engine to stop, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Metrics
    /// Port of the Prometheus scrape endpoint.
    ///
    /// Environment variable: `METRICS_PORT`
    #[serde(default = "default_metrics_port", alias = "METRICS_PORT")]
    pub metrics_port: u16,
    /// Interval between backlog gauge refreshes, in seconds.
    ///
    /// Environment variable: `METRICS_POLL_SECONDS`
    #[serde(default = "default_metrics_poll_seconds", alias = "METRICS_POLL_SECONDS")]
    pub metrics_poll_seconds: u64,

    // Logging
    /// Log filter used when `RUST_LOG` is not a valid directive.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or a value fails
    /// validation.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Connection URL for the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be assembled from the components.
    pub fn connection_url(&self) -> Result<String> {
        if let Some(url) = self.database_url.as_deref().filter(|url| !url.trim().is_empty()) {
            return Ok(url.to_string());
        }

        let mut url = Url::parse(&format!(
            "postgresql://{}:{}/{}",
            self.db_host, self.db_port, self.db_name
        ))
        .context("Invalid database host or name")?;
        url.set_username(&self.db_user)
            .map_err(|()| anyhow::anyhow!("database URL cannot carry a user"))?;
        url.set_password(Some(&self.db_password))
            .map_err(|()| anyhow::anyhow!("database URL cannot carry a password"))?;
        Ok(url.to_string())
    }

    /// Connection URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        let Ok(url) = self.connection_url() else {
            return "<invalid database url>".to_string();
        };
        match Url::parse(&url) {
            Ok(mut parsed) if parsed.password().is_some() => {
                if parsed.set_password(Some("***")).is_ok() {
                    return parsed.to_string();
                }
                url
            },
            _ => url,
        }
    }

    /// FHIR base URL with exactly one trailing slash.
    pub fn normalized_fhir_server(&self) -> String {
        format!("{}/", self.fhir_server.trim().trim_end_matches('/'))
    }

    /// Groups drained per notification, honoring the older `BURST_LIMIT`.
    pub fn effective_burst_limit(&self) -> usize {
        self.process_burst_limit.or(self.burst_limit).unwrap_or(sluice_delivery::DEFAULT_BURST_LIMIT)
    }

    /// Interval between backlog gauge refreshes.
    pub fn metrics_poll_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_poll_seconds)
    }

    /// Convert to the delivery crate's engine configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            worker_id: self.worker_id.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            burst_limit: self.effective_burst_limit(),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            channel: self.db_channel.clone(),
            retry_policy: RetryPolicy { max_retries: self.max_retries, ..RetryPolicy::default() },
            client_config: self.to_client_config(),
            ..DeliveryConfig::default()
        }
    }

    /// Convert to FHIR client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.normalized_fhir_server(),
            timeout: Duration::from_millis(self.delivery_timeout_ms),
            ..ClientConfig::default()
        }
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        self.connection_url()?;

        if self.db_channel.trim().is_empty() {
            anyhow::bail!("db_channel must not be empty");
        }

        if self.worker_id.trim().is_empty() {
            anyhow::bail!("worker_id must not be empty");
        }

        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be greater than 0");
        }

        if self.effective_burst_limit() == 0 {
            anyhow::bail!("process_burst_limit must be greater than 0");
        }

        if Duration::from_millis(self.delivery_timeout_ms) >= LEASE_DURATION {
            anyhow::bail!(
                "delivery_timeout_ms must be shorter than the {}s claim lease",
                LEASE_DURATION.as_secs()
            );
        }

        if self.metrics_poll_seconds == 0 {
            anyhow::bail!("metrics_poll_seconds must be greater than 0");
        }

        Url::parse(&self.normalized_fhir_server())
            .with_context(|| format!("fhir_server {:?} is not a valid URL", self.fhir_server))?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            db_host: default_db_host(),
            db_port: default_db_port(),
            db_user: default_db_user(),
            db_password: default_db_password(),
            db_name: default_db_name(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            db_channel: default_db_channel(),
            fhir_server: default_fhir_server(),
            worker_id: default_worker_id(),
            max_retries: default_max_retries(),
            poll_interval_ms: default_poll_interval_ms(),
            process_burst_limit: None,
            burst_limit: None,
            delivery_timeout_ms: default_delivery_timeout_ms(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            metrics_port: default_metrics_port(),
            metrics_poll_seconds: default_metrics_poll_seconds(),
            rust_log: default_log_level(),
        }
    }
}

fn default_db_host() -> String {
    "postgres".to_string()
}

fn default_db_port() -> u16 {
    5432
}

fn default_db_user() -> String {
    "postgres".to_string()
}

fn default_db_password() -> String {
    "postgres".to_string()
}

fn default_db_name() -> String {
    "health_tables".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    0
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_db_channel() -> String {
    sluice_delivery::DEFAULT_CHANNEL.to_string()
}

fn default_fhir_server() -> String {
    sluice_delivery::DEFAULT_FHIR_SERVER.to_string()
}

fn default_worker_id() -> String {
    format!("worker-{}", rand::rng().random_range(0..10_000))
}

fn default_max_retries() -> u32 {
    sluice_delivery::DEFAULT_MAX_RETRIES
}

fn default_poll_interval_ms() -> u64 {
    sluice_delivery::DEFAULT_POLL_INTERVAL_MS
}

fn default_delivery_timeout_ms() -> u64 {
    sluice_delivery::DEFAULT_DELIVERY_TIMEOUT_MS
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_metrics_port() -> u16 {
    9464
}

fn default_metrics_poll_seconds() -> u64 {
    10
}

fn default_log_level() -> String {
    "info,sluice=debug".to_string()
}
