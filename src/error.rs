use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

/// Bitcoin Core RPC code returned while the node is still loading its index.
const RPC_IN_WARMUP: i64 = -28;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Reorg detected at height {height}: expected parent {expected}, got {actual}")]
    ReorgDetected {
        height: u64,
        expected: String,
        actual: String,
    },

    #[error("Chain source unavailable after {attempts} attempt(s): {reason}")]
    SourceUnavailable { attempts: u32, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Task '{0}' timed out")]
    TaskTimeout(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Errors worth retrying against the chain source.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Http(_) | AppError::Io(_) => true,
            AppError::Rpc { code, .. } => *code == RPC_IN_WARMUP,
            _ => false,
        }
    }

    pub fn is_reorg(&self) -> bool {
        matches!(self, AppError::ReorgDetected { .. })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::InvalidEvent(_) | AppError::Configuration(_) => StatusCode::BAD_REQUEST,
            AppError::SourceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
