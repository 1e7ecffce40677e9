//! Runtime error types.

use thiserror::Error;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur while driving the container engine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The engine could not be reached or the connection broke.
    #[error("engine transport error during {operation}: {message}")]
    Transport { operation: String, message: String },

    /// Sandbox (or its image) could not be created or started.
    #[error("provisioning {target} failed: {message}")]
    Provision { target: String, message: String },

    /// Attach or stream relay failed. A nonzero exit code is not this.
    #[error("exec in {target} failed: {message}")]
    Exec { target: String, message: String },

    /// The engine answered with an unexpected status.
    #[error("engine returned {status} for {operation}: {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },

    /// The operation's cancellation token fired first.
    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn transport(operation: impl Into<String>, message: impl ToString) -> Self {
        RuntimeError::Transport {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn provision(target: impl Into<String>, message: impl ToString) -> Self {
        RuntimeError::Provision {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn exec(target: impl Into<String>, message: impl ToString) -> Self {
        RuntimeError::Exec {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        RuntimeError::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RuntimeError::Cancelled { .. })
    }
}
