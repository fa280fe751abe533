//! Error taxonomy for the core engine
//!
//! Storage failures carry operation context but never the backend's raw
//! internals; the grant resolver additionally converts them to denial
//! (fail closed) before they can cross an authorization decision.

use crate::types::RowId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("row {id} not found")]
    NotFound { id: RowId },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("row {id} is referenced by {references} other row(s)")]
    ConflictingReference { id: RowId, references: usize },

    #[error("access denied")]
    AccessDenied,

    #[error("storage failure during {op}")]
    Storage { op: &'static str },
}

impl CoreError {
    pub fn not_found(id: RowId) -> Self {
        CoreError::NotFound { id }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        CoreError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn storage(op: &'static str) -> Self {
        CoreError::Storage { op }
    }

    /// Stable machine-readable code for the wire contract
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound { .. } => "not_found",
            CoreError::InvalidArgument { .. } => "invalid_argument",
            CoreError::ConflictingReference { .. } => "conflicting_reference",
            CoreError::AccessDenied => "access_denied",
            CoreError::Storage { .. } => "storage_failure",
        }
    }
}
