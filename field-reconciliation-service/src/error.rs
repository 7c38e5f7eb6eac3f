//! Error taxonomy for reconciliation passes and record updates.

use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconciliationError {
    /// External system unreachable or rejected our credentials. Fatal to a pass.
    #[error("Connectivity error ({system}): {message}")]
    Connectivity {
        system: &'static str,
        message: String,
    },

    /// One page or one lookup failed; the caller skips the item and continues.
    #[error("Partial fetch error ({system}): {message}")]
    PartialFetch {
        system: &'static str,
        message: String,
    },

    #[error("Books payment {books_payment_id} is already linked to another record")]
    AlreadyConsumed { books_payment_id: String },

    /// The record left the state a write expected, usually through a human override.
    #[error("Reconciliation record {record_id} is now {status}")]
    RecordChanged { record_id: uuid::Uuid, status: String },

    #[error("A reconciliation pass is already running")]
    PassInProgress,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl ReconciliationError {
    pub fn connectivity(system: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Connectivity {
            system,
            message: err.to_string(),
        }
    }

    pub fn partial(system: &'static str, err: impl std::fmt::Display) -> Self {
        Self::PartialFetch {
            system,
            message: err.to_string(),
        }
    }

    /// Label used for the `errors_total` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connectivity { .. } => "connectivity",
            Self::PartialFetch { .. } => "partial_fetch",
            Self::AlreadyConsumed { .. } => "already_consumed",
            Self::RecordChanged { .. } => "record_changed",
            Self::PassInProgress => "pass_in_progress",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Database(_) => "database",
        }
    }
}

impl From<sqlx::Error> for ReconciliationError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(anyhow::Error::new(err))
    }
}

impl From<ReconciliationError> for AppError {
    fn from(err: ReconciliationError) -> Self {
        match err {
            ReconciliationError::Connectivity { .. } | ReconciliationError::PartialFetch { .. } => {
                AppError::BadGateway(err.to_string())
            }
            ReconciliationError::AlreadyConsumed { .. }
            | ReconciliationError::RecordChanged { .. }
            | ReconciliationError::PassInProgress => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            ReconciliationError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            ReconciliationError::NotFound(msg) => AppError::NotFound(anyhow::anyhow!(msg)),
            ReconciliationError::Database(e) => AppError::DatabaseError(e),
        }
    }
}
