//! Error types for orthos-remote

use orthos_exec::ExecError;
use thiserror::Error;

use crate::types::{Channel, Outcome};

/// Errors raised inside an adapter before they are classified
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    /// Transport-level failure talking to the channel host
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Device or service is busy or still booting
    #[error("device busy: {0}")]
    Busy(String),

    /// Credentials or privileges were refused
    #[error("rejected: {0}")]
    Rejected(String),

    /// Channel cannot perform this action
    #[error("unsupported action {action} on {channel} channel")]
    Unsupported {
        channel: Channel,
        action: &'static str,
    },

    /// Device answered but reports a state the action cannot proceed from
    #[error("device reports invalid state: {0}")]
    InvalidState(String),

    #[error("machine has no remote power")]
    NoRemotePower,

    /// Cancellation observed at a safe checkpoint
    #[error("cancelled before {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RemoteError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Exec(e) => e.is_transient(),
            RemoteError::Busy(_) => true,
            _ => false,
        }
    }
}

impl From<RemoteError> for Outcome {
    fn from(err: RemoteError) -> Self {
        if err.is_transient() {
            Outcome::transient(err.to_string())
        } else {
            Outcome::permanent(err.to_string())
        }
    }
}
