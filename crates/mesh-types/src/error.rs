use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid identifier {input:?}: {reason}")]
    InvalidIdentifier { input: String, reason: String },

    #[error("invalid store identifier {input:?}: {reason}")]
    InvalidMeshBaseIdentifier { input: String, reason: String },

    #[error("type registered twice: {0}")]
    DuplicateType(String),
}
