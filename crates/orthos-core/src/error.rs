//! Core error types for orthos-core

use thiserror::Error;

use crate::task::TaskState;

/// Errors surfaced by the engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Request rejected before anything was written or queued
    #[error("validation failed: {0}")]
    Validation(String),

    /// Reservation held by someone else
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("machine not found: {0}")]
    MachineNotFound(String),

    #[error("machine already registered: {0}")]
    MachineExists(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid task transition from {from} to {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    /// Actor mailbox or lifecycle failure
    #[error("actor communication error: {0}")]
    ActorError(String),

    /// Snapshot could not be written or read
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        CoreError::Conflict(message.into())
    }
}
