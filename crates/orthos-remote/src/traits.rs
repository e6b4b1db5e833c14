//! Adapter and prober traits

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::RemoteError;
use crate::types::{Channel, Outcome, ProbeOutcome, RemoteAction, Target};

/// Uniform capability surface of an out-of-band channel
///
/// The scheduler never calls an adapter twice concurrently for the same
/// machine; different machines may be in flight at once. Adapters check
/// `cancel` only at safe checkpoints between protocol steps and never abort a
/// command that has already been sent.
#[async_trait]
pub trait RemoteControl: Send + Sync {
    async fn execute(
        &self,
        target: &Target,
        action: &RemoteAction,
        cancel: &CancellationToken,
    ) -> Outcome;

    fn channel(&self) -> Channel;
}

/// Lightweight reachability check used by the reconciler
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &Target) -> ProbeOutcome;

    fn method(&self) -> &'static str;
}

/// Safe checkpoint: stop here if cancellation was requested
///
/// # Errors
/// Returns `RemoteError::Cancelled` naming the step that will not run
pub fn checkpoint(cancel: &CancellationToken, next_step: &str) -> Result<(), RemoteError> {
    if cancel.is_cancelled() {
        return Err(RemoteError::Cancelled(next_step.to_string()));
    }
    Ok(())
}
