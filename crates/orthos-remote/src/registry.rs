//! Channel → adapter lookup

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::traits::RemoteControl;
use crate::types::{Channel, Outcome, RemoteAction, Target};

/// The adapters configured for this deployment, one per channel
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn RemoteControl>>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under the channel it reports
    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn RemoteControl>) -> Self {
        self.adapters.insert(adapter.channel(), adapter);
        self
    }

    #[must_use]
    pub fn get(&self, channel: Channel) -> Option<Arc<dyn RemoteControl>> {
        self.adapters.get(&channel).cloned()
    }

    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self.adapters.keys().copied().collect();
        channels.sort_by_key(|c| c.to_string());
        channels
    }

    /// Route `action` to its channel's adapter
    ///
    /// A channel without an adapter is a deployment gap, not something a
    /// retry can fix, so it reports a permanent failure.
    pub async fn execute(
        &self,
        target: &Target,
        action: &RemoteAction,
        cancel: &CancellationToken,
    ) -> Outcome {
        let channel = action.channel();
        match self.adapters.get(&channel) {
            Some(adapter) => adapter.execute(target, action, cancel).await,
            None => Outcome::permanent(format!("no adapter configured for {channel} channel")),
        }
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct Fixed(Channel);

    #[async_trait]
    impl RemoteControl for Fixed {
        async fn execute(&self, _: &Target, _: &RemoteAction, _: &CancellationToken) -> Outcome {
            Outcome::success_with(self.0.to_string())
        }

        fn channel(&self) -> Channel {
            self.0
        }
    }

    #[tokio::test]
    async fn test_routes_by_channel() {
        let registry = AdapterRegistry::new()
            .with(Arc::new(Fixed(Channel::Power)))
            .with(Arc::new(Fixed(Channel::Console)));
        let target = Target::new("m1", "m1.lab");
        let cancel = CancellationToken::new();

        assert_eq!(
            registry.execute(&target, &RemoteAction::PowerOff, &cancel).await,
            Outcome::success_with("power")
        );
        assert_eq!(
            registry.execute(&target, &RemoteAction::ConsoleAttach, &cancel).await,
            Outcome::success_with("console")
        );
    }

    #[tokio::test]
    async fn test_missing_channel_is_permanent() {
        let registry = AdapterRegistry::new();
        let outcome = registry
            .execute(
                &Target::new("m1", "m1.lab"),
                &RemoteAction::Provision {
                    choice: "sles".into(),
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(
            outcome,
            Outcome::permanent("no adapter configured for provision channel")
        );
    }
}
