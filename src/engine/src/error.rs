//! Error types for the decision engine

use thiserror::Error;

use crate::conditions::ConditionError;

/// Decision engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Conflicting or otherwise unusable policy configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Policy loader failure
    #[error("Policy loader error: {0}")]
    PolicyLoader(String),

    /// Condition evaluation failure
    #[error("Condition evaluation failed: {0}")]
    Condition(#[from] ConditionError),

    /// Policy evaluation failure
    #[error("Failed to evaluate policies: {0}")]
    Evaluation(String),

    /// Audit log failure
    #[error("Audit log error: {0}")]
    AuditLog(String),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation did not complete within its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
