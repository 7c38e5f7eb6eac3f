//! Configuration module for field-reconciliation-service.

use crate::matching::MatchingConfig;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    /// `None` runs the service on the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub field_ops: FieldOpsConfig,
    pub books: BooksConfig,
    pub sync: SyncConfig,
    pub matching: MatchingConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct FieldOpsConfig {
    pub base_url: String,
    pub api_token: Secret<String>,
    pub page_size: u32,
    pub request_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct BooksConfig {
    pub base_url: String,
    pub access_token: Secret<String>,
    pub holding_account_name: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Upper bound on how far back field payments are fetched.
    pub lookback_days: i64,
    pub books_window_days: i64,
    /// Pause between sequential external calls.
    pub request_delay: Duration,
    /// Period of the background pass. `None` disables the scheduler.
    pub interval: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            books_window_days: 30,
            request_delay: Duration::from_millis(250),
            interval: None,
        }
    }
}

fn parsed<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl ReconciliationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let sync_defaults = SyncConfig::default();
        let request_delay =
            Duration::from_millis(parsed("SYNC_REQUEST_DELAY_MS", sync_defaults.request_delay.as_millis() as u64));

        let auto_accept_threshold: f64 = parsed(
            "MATCH_AUTO_ACCEPT_THRESHOLD",
            MatchingConfig::default().auto_accept_threshold,
        );
        if !(0.0..=1.0).contains(&auto_accept_threshold) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MATCH_AUTO_ACCEPT_THRESHOLD must be between 0 and 1, got {}",
                auto_accept_threshold
            )));
        }

        let database = env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .map(|url| DatabaseConfig {
                url: Secret::new(url),
                max_connections: parsed("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parsed("DATABASE_MIN_CONNECTIONS", 2),
            });

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "field-reconciliation-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database,
            field_ops: FieldOpsConfig {
                base_url: env::var("FIELD_OPS_BASE_URL").unwrap_or_default(),
                api_token: Secret::new(env::var("FIELD_OPS_API_TOKEN").unwrap_or_default()),
                page_size: parsed("FIELD_OPS_PAGE_SIZE", 100),
                request_delay,
            },
            books: BooksConfig {
                base_url: env::var("BOOKS_BASE_URL").unwrap_or_default(),
                access_token: Secret::new(env::var("BOOKS_ACCESS_TOKEN").unwrap_or_default()),
                holding_account_name: env::var("BOOKS_HOLDING_ACCOUNT_NAME")
                    .unwrap_or_else(|_| "Undeposited Funds".to_string()),
            },
            sync: SyncConfig {
                lookback_days: parsed("SYNC_LOOKBACK_DAYS", sync_defaults.lookback_days).max(1),
                books_window_days: parsed("SYNC_BOOKS_WINDOW_DAYS", sync_defaults.books_window_days)
                    .max(1),
                request_delay,
                interval: env::var("SYNC_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs),
            },
            matching: MatchingConfig {
                auto_accept_threshold,
                ..MatchingConfig::default()
            },
        })
    }
}
