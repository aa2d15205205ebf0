use crate::domain::deposit::DepositStatus;
use crate::domain::limits::{LimitCheckResult, LimitViolation};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RailError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Limit check failed ({violation}): {}", check.reason)]
    Limit {
        violation: LimitViolation,
        check: Box<LimitCheckResult>,
    },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("A deposit with reference {0} already exists")]
    DuplicateReference(String),
    #[error("Invalid deposit transition from {from} to {to}")]
    InvalidTransition {
        from: DepositStatus,
        to: DepositStatus,
    },
    #[error("Deposit {0} was modified concurrently")]
    StaleState(String),
    #[error("Provider error (retryable): {0}")]
    RetryableProvider(String),
    #[error("Provider error: {0}")]
    NonRetryableProvider(String),
    #[error("Webhook signature is invalid")]
    SignatureInvalid,
    #[error("Operation cancelled")]
    Cancelled,
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl RailError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Only transient provider failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableProvider(_))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for RailError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RailError>;
