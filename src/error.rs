//! Error types for arb-ledger

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: i64, available: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid settlement transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Settlement lease lost for entry {0}")]
    LeaseLost(String),

    #[error("Transient storage failure: {0}")]
    TransientStorage(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::TransientStorage(_))
    }

    /// Stable machine-readable name, used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidInput(_) => "invalid_input",
            LedgerError::Unauthorized(_) => "unauthorized",
            LedgerError::Forbidden(_) => "forbidden",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::InvalidTransition { .. } => "invalid_transition",
            LedgerError::LeaseLost(_) => "lease_lost",
            LedgerError::TransientStorage(_) => "transient_storage_failure",
            LedgerError::Storage(_) => "storage_error",
            LedgerError::Config(_) => "config_error",
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                LedgerError::TransientStorage(e.to_string())
            }
            _ => LedgerError::Storage(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Storage(format!("JSON error: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
