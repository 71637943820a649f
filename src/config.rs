use crate::error::{AppError, Result};
use crate::types::ValueBand;

pub const RPC_URL: &str = "http://127.0.0.1:8332";

/// Default minimum total transaction value (BTC) for a transaction to qualify.
pub const DEFAULT_MIN_TRANSFER: f64 = 1000.0;

/// Default look-back before a market event (seconds).
pub const DEFAULT_LOOKBACK_SECS: i64 = 3_600;

/// Chain source retry backoff: base delay doubles per attempt up to the cap.
pub const RETRY_BASE_MS: u64 = 200;
pub const RETRY_MAX_MS: u64 = 5_000;
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Upper bound on event × filter pairs scanned concurrently.
pub const MAX_CONCURRENT_SCANS: usize = 4;

/// Scheduler tick interval (seconds).
pub const TICK_SECS: u64 = 10;

/// A task still running after this long is marked failed (seconds).
pub const TASK_TIMEOUT_SECS: u64 = 600;

/// Interval applied to task entries that omit `interval=`.
pub const DEFAULT_TASK_INTERVAL_SECS: u64 = 60;

/// Default record count returned by the read API.
pub const API_DEFAULT_LIMIT: i64 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub rpc_timeout_secs: u64,
    pub log_level: String,
    pub db_path: String,
    /// File holding the last processed block height (CURSOR_PATH)
    pub cursor_path: String,
    /// Market event list (EVENTS_FILE)
    pub events_file: String,
    /// Optional `address,label` file (LABELS_FILE)
    pub labels_file: Option<String>,
    /// Directory for events.csv and exported record files (OUTPUT_DIR)
    pub output_dir: String,
    /// Value band used by `events` mode and by batch rows that leave a bound empty.
    pub band: ValueBand,
    pub lookback_secs: i64,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub max_concurrent_scans: usize,
    pub task_timeout_secs: u64,
    pub tick_secs: u64,
    /// Task declarations for `agent` mode (TASKS_FILE)
    pub tasks_file: String,
    pub api_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let min_transfer = std::env::var("MIN_TRANSFER")
            .unwrap_or_else(|_| DEFAULT_MIN_TRANSFER.to_string())
            .parse::<f64>()
            .map_err(|_| AppError::Configuration("MIN_TRANSFER must be a number".to_string()))?;
        let max_transfer = parse_optional_f64(&std::env::var("MAX_TRANSFER").unwrap_or_default())
            .map_err(|_| AppError::Configuration("MAX_TRANSFER must be a number or 'none'".to_string()))?;

        let lookback_secs = std::env::var("LOOKBACK_SECS")
            .unwrap_or_else(|_| DEFAULT_LOOKBACK_SECS.to_string())
            .parse::<i64>()
            .map_err(|_| AppError::Configuration("LOOKBACK_SECS must be an integer".to_string()))?;

        Ok(Self {
            rpc_url: std::env::var("RPC_URL").unwrap_or_else(|_| RPC_URL.to_string()),
            rpc_user: std::env::var("RPC_USER").ok().filter(|s| !s.is_empty()),
            rpc_password: std::env::var("RPC_PASSWORD").ok().filter(|s| !s.is_empty()),
            rpc_timeout_secs: std::env::var("RPC_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<u64>()
                .unwrap_or(30),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "addresses.db".to_string()),
            cursor_path: std::env::var("CURSOR_PATH")
                .unwrap_or_else(|_| "last_block.txt".to_string()),
            events_file: std::env::var("EVENTS_FILE").unwrap_or_else(|_| "events.csv".to_string()),
            labels_file: std::env::var("LABELS_FILE").ok().filter(|s| !s.is_empty()),
            output_dir: std::env::var("OUTPUT_DIR").unwrap_or_else(|_| "output".to_string()),
            band: ValueBand { min: min_transfer, max: max_transfer },
            lookback_secs,
            retry_max_attempts: std::env::var("RETRY_MAX_ATTEMPTS")
                .unwrap_or_else(|_| RETRY_MAX_ATTEMPTS.to_string())
                .parse::<u32>()
                .unwrap_or(RETRY_MAX_ATTEMPTS)
                .max(1),
            retry_base_ms: std::env::var("RETRY_BASE_MS")
                .unwrap_or_else(|_| RETRY_BASE_MS.to_string())
                .parse::<u64>()
                .unwrap_or(RETRY_BASE_MS),
            retry_max_ms: std::env::var("RETRY_MAX_MS")
                .unwrap_or_else(|_| RETRY_MAX_MS.to_string())
                .parse::<u64>()
                .unwrap_or(RETRY_MAX_MS),
            max_concurrent_scans: std::env::var("MAX_CONCURRENT_SCANS")
                .unwrap_or_else(|_| MAX_CONCURRENT_SCANS.to_string())
                .parse::<usize>()
                .unwrap_or(MAX_CONCURRENT_SCANS)
                .max(1),
            task_timeout_secs: std::env::var("TASK_TIMEOUT_SECS")
                .unwrap_or_else(|_| TASK_TIMEOUT_SECS.to_string())
                .parse::<u64>()
                .map_err(|_| AppError::Configuration("TASK_TIMEOUT_SECS must be an integer".to_string()))?,
            tick_secs: std::env::var("TICK_SECS")
                .unwrap_or_else(|_| TICK_SECS.to_string())
                .parse::<u64>()
                .map_err(|_| AppError::Configuration("TICK_SECS must be an integer".to_string()))?
                .max(1),
            tasks_file: std::env::var("TASKS_FILE").unwrap_or_else(|_| "agent.conf".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Configuration("API_PORT must be a valid port number".to_string()))?,
        })
    }

    pub fn retry_policy(&self) -> crate::scanner::RetryPolicy {
        crate::scanner::RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_ms: self.retry_base_ms,
            max_ms: self.retry_max_ms,
        }
    }
}

/// Empty or `none` is `None`; anything else must parse.
pub fn parse_optional_f64(raw: &str) -> std::result::Result<Option<f64>, std::num::ParseFloatError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    raw.parse::<f64>().map(Some)
}
