//! Capability Adapter
//!
//! Thin seam between the connection monitor and the external provider.
//! Opening a channel first tries the bootstrap RPC for its resource; the RPC
//! sits behind a circuit breaker and its successes are cached for the life
//! of the adapter, so each resource is bootstrapped at most once.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use super::breaker::{BreakerConfig, BreakerStatus, CircuitBreaker};
use super::error::ProviderResult;
use super::messages::{BroadcastPayload, ChannelConfig, SignalSink};
use super::{BootstrapRpc, ChannelProvider, ProviderChannel};
use crate::registry::SubscriptionDescriptor;

/// Wraps the channel provider and bootstrap RPC
pub struct CapabilityAdapter {
    provider: Arc<dyn ChannelProvider>,
    bootstrap: Option<Arc<dyn BootstrapRpc>>,
    breaker: CircuitBreaker,
    /// Resources already enabled for realtime
    enabled: Mutex<HashSet<String>>,
    channel_config: ChannelConfig,
}

impl CapabilityAdapter {
    pub fn new(
        provider: Arc<dyn ChannelProvider>,
        bootstrap: Option<Arc<dyn BootstrapRpc>>,
        breaker: BreakerConfig,
        channel_config: ChannelConfig,
    ) -> Self {
        Self {
            provider,
            bootstrap,
            breaker: CircuitBreaker::new(breaker),
            enabled: Mutex::new(HashSet::new()),
            channel_config,
        }
    }

    /// Ask the backend to enable live updates for `resource`
    ///
    /// Returns true if the resource is known to be enabled. Failures and
    /// skipped calls return false; callers open the channel regardless.
    pub async fn bootstrap_resource(&self, resource: &str) -> bool {
        if self.enabled.lock().contains(resource) {
            return true;
        }

        let Some(rpc) = &self.bootstrap else {
            return false;
        };

        if !self.breaker.allow() {
            tracing::debug!(resource = %resource, "Bootstrap skipped, circuit open");
            return false;
        }

        match rpc.enable_realtime(resource).await {
            Ok(()) => {
                self.breaker.record_success();
                self.enabled.lock().insert(resource.to_string());
                tracing::info!(resource = %resource, "Realtime bootstrap succeeded");
                true
            }
            Err(e) => {
                self.breaker.record_failure();
                tracing::warn!(resource = %resource, error = %e, "Realtime bootstrap failed");
                false
            }
        }
    }

    /// Create and subscribe a provider channel for `descriptor`
    ///
    /// Status callbacks, broadcasts and matching row changes are all
    /// delivered to `sink`.
    pub async fn open(
        &self,
        descriptor: &SubscriptionDescriptor,
        name: &str,
        sink: SignalSink,
    ) -> ProviderResult<Arc<dyn ProviderChannel>> {
        if !descriptor.is_liveness() {
            self.bootstrap_resource(descriptor.resource()).await;
        }

        let channel = self.provider.channel(name, self.channel_config.clone());
        if !descriptor.is_liveness() {
            channel.on(descriptor.change_spec(), sink.clone());
        }

        if let Err(e) = channel.subscribe(sink).await {
            self.close(channel).await;
            return Err(e);
        }

        tracing::debug!(channel = %name, "Provider channel subscribed");
        Ok(channel)
    }

    /// Remove a provider channel; errors are logged, never propagated
    pub async fn close(&self, channel: Arc<dyn ProviderChannel>) {
        let name = channel.name().to_string();
        if let Err(e) = self.provider.remove_channel(channel).await {
            tracing::warn!(channel = %name, error = %e, "Failed to remove provider channel");
        }
    }

    pub async fn send(
        &self,
        channel: &Arc<dyn ProviderChannel>,
        payload: BroadcastPayload,
    ) -> ProviderResult<()> {
        channel.send(payload).await
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status()
    }

    pub fn is_enabled(&self, resource: &str) -> bool {
        self.enabled.lock().contains(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::{MemoryBootstrap, MemoryProvider};
    use crate::provider::{ChangeKind, ChannelSignal, ChannelStatus};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn adapter(provider: &MemoryProvider, bootstrap: &Arc<MemoryBootstrap>) -> CapabilityAdapter {
        CapabilityAdapter::new(
            Arc::new(provider.clone()),
            Some(Arc::clone(bootstrap) as Arc<dyn BootstrapRpc>),
            BreakerConfig::default(),
            ChannelConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_bootstrap_success_is_cached() {
        let provider = MemoryProvider::new();
        let bootstrap = Arc::new(MemoryBootstrap::new());
        let adapter = adapter(&provider, &bootstrap);

        assert!(adapter.bootstrap_resource("jobs").await);
        assert!(adapter.bootstrap_resource("jobs").await);
        assert_eq!(bootstrap.calls(), 1);
        assert!(adapter.is_enabled("jobs"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_skips_bootstrap_after_failures() {
        let provider = MemoryProvider::new();
        let bootstrap = Arc::new(MemoryBootstrap::new());
        bootstrap.set_failing(true);
        let adapter = adapter(&provider, &bootstrap);

        for _ in 0..3 {
            assert!(!adapter.bootstrap_resource("jobs").await);
        }
        assert_eq!(adapter.breaker_status(), BreakerStatus::Open);

        assert!(!adapter.bootstrap_resource("jobs").await);
        assert_eq!(bootstrap.calls(), 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        bootstrap.set_failing(false);
        assert!(adapter.bootstrap_resource("jobs").await);
        assert_eq!(bootstrap.calls(), 4);
        assert_eq!(adapter.breaker_status(), BreakerStatus::Closed);
    }

    #[tokio::test]
    async fn test_open_proceeds_when_bootstrap_fails() {
        let provider = MemoryProvider::new();
        let bootstrap = Arc::new(MemoryBootstrap::new());
        bootstrap.set_failing(true);
        let adapter = adapter(&provider, &bootstrap);

        let descriptor = SubscriptionDescriptor::new("jobs", ChangeKind::Update);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = adapter
            .open(&descriptor, &descriptor.channel_name(), tx)
            .await
            .unwrap();

        assert_eq!(channel.name(), descriptor.channel_name());
        assert!(matches!(
            rx.recv().await,
            Some(ChannelSignal::Status(ChannelStatus::Open))
        ));
    }

    #[tokio::test]
    async fn test_failed_subscribe_removes_channel() {
        let provider = MemoryProvider::new();
        provider.set_fail_subscribe(true);
        let bootstrap = Arc::new(MemoryBootstrap::new());
        let adapter = adapter(&provider, &bootstrap);

        let descriptor = SubscriptionDescriptor::new("jobs", ChangeKind::Any);
        let (tx, _rx) = mpsc::unbounded_channel();
        let name = descriptor.channel_name();

        assert!(adapter.open(&descriptor, &name, tx).await.is_err());
        assert!(!provider.is_live(&name));
        assert_eq!(provider.remove_count(&name), 1);
    }
}
