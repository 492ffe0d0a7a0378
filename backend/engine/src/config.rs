//! Application configuration loaded from environment variables.

use crate::errors::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Ledger gateway RPC endpoint
    pub rpc_url: String,
    /// Address of the event registry contract on the external ledger
    pub contract_id: String,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) the confirmation worker polls pending transactions
    pub confirm_poll_interval_secs: u64,
    /// A transaction still pending after this window is treated as failed
    /// for reconciliation purposes (it may later confirm regardless)
    pub confirm_timeout_secs: i64,
    /// How often (in seconds) the scheduler checks for elapsed stage windows
    pub scheduler_interval_secs: u64,
    /// Refuse a mirrored write when the caller's balance cannot cover it
    pub enforce_balance_guard: bool,
    /// Resubmit failed mirrors automatically instead of waiting for an operator
    pub auto_retry_failed_mirrors: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            rpc_url: env_var("RPC_URL").unwrap_or_else(|_| "http://localhost:8545".to_string()),
            contract_id: env_var("CONTRACT_ID").map_err(|_| {
                EngineError::Config("CONTRACT_ID environment variable is required".to_string())
            })?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./arena_engine.db".to_string()),
            api_port: parse_var("API_PORT", "3001")?,
            confirm_poll_interval_secs: parse_var("CONFIRM_POLL_INTERVAL_SECS", "10")?,
            confirm_timeout_secs: parse_var("CONFIRM_TIMEOUT_SECS", "300")?,
            scheduler_interval_secs: parse_var("SCHEDULER_INTERVAL_SECS", "30")?,
            enforce_balance_guard: parse_var("ENFORCE_BALANCE_GUARD", "true")?,
            auto_retry_failed_mirrors: parse_var("AUTO_RETRY_FAILED_MIRRORS", "false")?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| EngineError::Config(format!("Missing env var: {key}")))
}

fn parse_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| EngineError::Config(format!("Invalid {key}")))
}

#[cfg(test)]
impl Config {
    /// Configuration used by unit tests: no network endpoints are ever
    /// contacted, the gateway is mocked.
    pub fn for_tests() -> Self {
        Config {
            rpc_url: "http://localhost:0".to_string(),
            contract_id: "0xTEST".to_string(),
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            confirm_poll_interval_secs: 1,
            confirm_timeout_secs: 300,
            scheduler_interval_secs: 1,
            enforce_balance_guard: true,
            auto_retry_failed_mirrors: false,
        }
    }
}
