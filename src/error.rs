//! Error taxonomy for the settlement engine.
//!
//! Every failure reaches the caller as an [`EngineError`]. Local validation
//! failures are raised before any request is issued; transport and server
//! failures leave batch, cache and selection state untouched.

use thiserror::Error;

use crate::models::BatchStatus;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Rejected locally (empty selection, missing filter, unknown id).
    #[error("{0}")]
    Validation(String),

    /// Network failure or HTTP 5xx. Safe to retry.
    #[error("{0}")]
    Transport(String),

    /// HTTP 4xx carrying the server's message.
    #[error("{message} (HTTP {status})")]
    ServerRejection { status: u16, message: String },

    #[error("Invalid batch transition: {from} -> {to}")]
    InvalidTransition { from: BatchStatus, to: BatchStatus },

    /// The same operation is already in flight.
    #[error("{0} already in progress")]
    Busy(&'static str),

    #[error("Invalid response from settlement API: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Only transport failures are worth retrying without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
