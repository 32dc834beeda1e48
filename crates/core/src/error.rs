use serde::{Deserialize, Serialize};

/// Domain errors. The variant decides whether a producer should retry.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum LambdaError {
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("schema: {0}")]
    Schema(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("build: {0}")]
    Build(String),
}

pub type LambdaResult<T> = Result<T, LambdaError>;

impl LambdaError {
    /// Terminal errors are the caller's fault and must not be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Schema(_) | Self::Validation(_) | Self::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Stable snake_case code used in response bodies and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::Schema(_) => "schema_validation_failed",
            Self::Validation(_) => "validation_failed",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "processing_failed",
            Self::Build(_) => "build_failed",
        }
    }
}

/// Errors surfaced by the backing resource store.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("conflict on {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<StoreError> for LambdaError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => LambdaError::NotFound(format!("{what} not found")),
            StoreError::AlreadyExists(what) => LambdaError::Conflict(format!("{what} already exists")),
            // A stale write did not land; the producer has to retry it.
            StoreError::Conflict(what) => LambdaError::Transient(format!("concurrent update of {what}")),
            StoreError::Unavailable(msg) => LambdaError::Transient(msg),
        }
    }
}
