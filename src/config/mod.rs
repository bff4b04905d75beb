//! Configuration management for the Dripway engine
//!
//! Handles server configuration, database location, scheduler cadence and the
//! endpoints of the external collaborators (job runner, subscriber directory).

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Sweep, lease and background job cadence
    pub scheduler: SchedulerConfig,
    /// External collaborator endpoints
    pub integrations: IntegrationsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding `dripway.db` (default: "data")
    pub data_dir: String,
}

/// Step scheduler and background job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two due-enrollment sweeps
    pub sweep_interval_secs: u64,
    /// Maximum enrollments claimed per sweep
    pub batch_size: u32,
    /// Claim lease length; an unfinished claim is reclaimable after this
    pub lease_secs: u64,
    /// Retry limit used when neither the step nor the sequence sets one
    pub default_retry_limit: u32,
    /// Cron expression (with seconds) for the date-based trigger scan
    pub date_scan_cron: String,
    /// Cron expression (with seconds) for the statistics projection
    pub stats_cron: String,
    /// Seconds between two registry refreshes from storage
    pub registry_refresh_secs: u64,
}

/// Endpoints of external collaborators. `None` selects the in-memory adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationsConfig {
    /// Job runner base URL (email sends)
    pub job_runner_url: Option<String>,
    /// Subscriber directory base URL
    pub directory_url: Option<String>,
    /// Action endpoint base URL (tag changes)
    pub actions_url: Option<String>,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("DRIPWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("DRIPWAY_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("DRIPWAY_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            scheduler: SchedulerConfig::default(),
            integrations: IntegrationsConfig {
                job_runner_url: std::env::var("DRIPWAY_JOB_RUNNER_URL").ok(),
                directory_url: std::env::var("DRIPWAY_DIRECTORY_URL").ok(),
                actions_url: std::env::var("DRIPWAY_ACTIONS_URL").ok(),
            },
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: env_parse("DRIPWAY_SWEEP_INTERVAL_SECS", 5),
            batch_size: env_parse("DRIPWAY_SWEEP_BATCH_SIZE", 100),
            lease_secs: env_parse("DRIPWAY_LEASE_SECS", 60),
            default_retry_limit: env_parse("DRIPWAY_DEFAULT_RETRY_LIMIT", 2),
            date_scan_cron: std::env::var("DRIPWAY_DATE_SCAN_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            stats_cron: std::env::var("DRIPWAY_STATS_CRON")
                .unwrap_or_else(|_| "0 */5 * * * *".to_string()),
            registry_refresh_secs: env_parse("DRIPWAY_REGISTRY_REFRESH_SECS", 30),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}
