//! Actor implementations

pub mod reconciler;
pub mod scheduler;

use kameo::error::SendError;

use crate::error::CoreError;

pub use reconciler::{ReconcilerActor, ReconcilerArgs};
pub use scheduler::{SchedulerActor, SchedulerArgs};

/// Unwrap a handler error from an `ask`, flattening mailbox failures
pub(crate) fn flatten_send_error<M>(error: SendError<M, CoreError>) -> CoreError {
    match error {
        SendError::HandlerError(e) => e,
        other => CoreError::ActorError(other.to_string()),
    }
}
