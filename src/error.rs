//! Error types for the improvement loop

use thiserror::Error;

/// Errors produced by the improvement loop
#[derive(Error, Debug)]
pub enum ImprovementError {
    /// A proposed action failed pre-execution validation
    #[error("Validation failed: {reason}")]
    Validation { reason: String },

    /// An action could not apply its change
    #[error("Execution failed: {detail}")]
    Execution { detail: String },

    /// A monitored metric degraded past its threshold
    #[error("Degradation detected on {metric}: {detail}")]
    Degradation { metric: String, detail: String },

    /// A rollback did not restore prior state; manual intervention required
    #[error("Rollback of action {action_id} failed: {detail}; manual intervention required")]
    RollbackFailed { action_id: String, detail: String },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ImprovementError>;
