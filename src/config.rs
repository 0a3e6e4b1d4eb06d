//! Monitor configuration from environment variables

use std::env;
use std::time::Duration;

use ethers_core::types::U256;

/// Timeout for outgoing HTTP requests made by the price adapter fetchers.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// The smallest polling interval the flux monitor supports. Polling faster
/// than the HTTP timeout would stack fetches on top of each other.
pub const MINIMUM_POLLING_INTERVAL: Duration = DEFAULT_HTTP_TIMEOUT;

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Process-wide monitor configuration
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Minimum funds (in the aggregator's payment token) the contract must
    /// hold before this node bothers submitting an answer
    pub minimum_contract_payment: U256,

    /// Timeout applied to each price adapter HTTP request
    pub http_timeout: Duration,

    /// Path to the SQLite store holding jobs and bridges
    pub db_path: String,
}

impl MonitorConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `FLUXMON_MINIMUM_CONTRACT_PAYMENT` (default: 100)
    /// - `FLUXMON_HTTP_TIMEOUT_MS` (default: 5000)
    /// - `FLUXMON_DB_PATH` (default: fluxmon.db)
    pub fn from_env() -> Self {
        let minimum_contract_payment = env::var("FLUXMON_MINIMUM_CONTRACT_PAYMENT")
            .ok()
            .and_then(|s| U256::from_dec_str(&s).ok())
            .unwrap_or_else(|| U256::from(100u64));

        let http_timeout = env::var("FLUXMON_HTTP_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT);

        let db_path = env::var("FLUXMON_DB_PATH").unwrap_or_else(|_| "fluxmon.db".to_string());

        Self {
            minimum_contract_payment,
            http_timeout,
            db_path,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            minimum_contract_payment: U256::from(100u64),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            db_path: "fluxmon.db".to_string(),
        }
    }
}
