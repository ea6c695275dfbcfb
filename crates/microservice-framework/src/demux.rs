//! # API Demux
//!
//! An [`ApiDemux<C>`] owns every [`ApiChannel`] for capability `C` and routes each
//! call to the right one by [`RoutingKey`]: the global channel, or a tenant-scoped
//! one. Local code sees a single call surface no matter how many provider instances
//! back it.
//!
//! # Architecture Note
//! - **Lazy channels**: [`ApiDemux::channel`] creates a channel the first time a
//!   routing key is seen, using the injected [`AddressResolver`] and
//!   [`TransportFactory`]. Creation is serialized, so concurrent first calls for
//!   the same key share one channel. A new channel is brought up to the demux's
//!   current lifecycle state before it becomes visible.
//! - **Bounded tenant channels**: tenant ids can come from untrusted input (broker
//!   messages, request paths), so at most
//!   [`DemuxSettings::max_tenant_channels`] tenant channels are kept. Creating one
//!   more retires an unreachable tenant channel first, otherwise the least
//!   recently used one. The global channel is never evicted.
//! - **Cascading lifecycle**: initialize/start/stop on the demux cascade to every
//!   owned channel. Initialize and start are required steps; if initialize fails
//!   part way, the channels already initialized are stopped again.
//! - **No retry policy**: call failures from `invoke` reach the caller unchanged.
//!   Waiting is opt-in via [`ApiDemux::wait_for_channel`].

use crate::backoff::BackoffPolicy;
use crate::channel::{ApiChannel, ChannelInfo, ConnectivityState};
use crate::component::{Lifecycle, LifecycleComponent, LifecycleState};
use crate::config::DiscoveryConfig;
use crate::error::{ApiError, BoxError, ConfigError, LifecycleError};
use crate::monitor::ProgressMonitor;
use crate::step::{CompositeLifecycleStep, LifecycleStep};
use crate::transport::{Capability, Endpoint, TransportFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Selects the channel a call goes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingKey {
    Global,
    Tenant(String),
}

impl RoutingKey {
    pub fn tenant(id: impl Into<String>) -> Self {
        RoutingKey::Tenant(id.into())
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            RoutingKey::Global => None,
            RoutingKey::Tenant(id) => Some(id),
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingKey::Global => f.write_str("global"),
            RoutingKey::Tenant(id) => write!(f, "tenant:{id}"),
        }
    }
}

/// Service discovery: locates a provider instance for a capability and key.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, capability: &str, key: &RoutingKey) -> Result<Endpoint, BoxError>;
}

/// Resolver backed by fixed [`DiscoveryConfig`] entries.
///
/// Tenant keys use the entry's `tenant_host` template (with `{tenant}` replaced by
/// the tenant id) when one is configured, and the global host otherwise.
pub struct StaticAddressResolver {
    config: DiscoveryConfig,
}

impl StaticAddressResolver {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AddressResolver for StaticAddressResolver {
    async fn resolve(&self, capability: &str, key: &RoutingKey) -> Result<Endpoint, BoxError> {
        let address = self
            .config
            .services
            .get(capability)
            .ok_or_else(|| ConfigError::MissingAddress(capability.to_string()))?;
        let host = match (key, &address.tenant_host) {
            (RoutingKey::Tenant(tenant), Some(template)) => template.replace("{tenant}", tenant),
            _ => address.host.clone(),
        };
        Ok(Endpoint::new(host, address.port))
    }
}

/// Per-demux tuning.
#[derive(Debug, Clone)]
pub struct DemuxSettings {
    /// Keys whose channels are created eagerly during initialize.
    pub initial_keys: Vec<RoutingKey>,
    /// Backoff used by channels while waiting for availability.
    pub backoff: BackoffPolicy,
    /// Upper bound on live tenant-scoped channels.
    pub max_tenant_channels: usize,
}

impl Default for DemuxSettings {
    fn default() -> Self {
        Self {
            initial_keys: vec![RoutingKey::Global],
            backoff: BackoffPolicy::default(),
            max_tenant_channels: 64,
        }
    }
}

struct Slot<C: Capability> {
    channel: Arc<ApiChannel<C>>,
    last_used: u64,
}

/// Routes calls for capability `C` to its channels.
pub struct ApiDemux<C: Capability> {
    lifecycle: Lifecycle,
    resolver: Arc<dyn AddressResolver>,
    transports: Arc<dyn TransportFactory<C>>,
    settings: DemuxSettings,
    channels: Mutex<BTreeMap<RoutingKey, Slot<C>>>,
    uses: AtomicU64,
    creation: tokio::sync::Mutex<()>,
    self_ref: Weak<Self>,
}

impl<C: Capability> ApiDemux<C> {
    pub fn new(
        resolver: Arc<dyn AddressResolver>,
        transports: Arc<dyn TransportFactory<C>>,
        settings: DemuxSettings,
    ) -> Arc<Self> {
        let logger = tracing::info_span!("api_demux", capability = C::NAME);
        Arc::new_cyclic(|me| Self {
            lifecycle: Lifecycle::with_logger(format!("{} API demux", C::NAME), logger),
            resolver,
            transports,
            settings,
            channels: Mutex::new(BTreeMap::new()),
            uses: AtomicU64::new(0),
            creation: tokio::sync::Mutex::new(()),
            self_ref: me.clone(),
        })
    }

    pub fn capability(&self) -> &'static str {
        C::NAME
    }

    /// The channel for `key`, created and brought up on first use.
    pub async fn channel(&self, key: &RoutingKey) -> Result<Arc<ApiChannel<C>>, ApiError> {
        self.get_or_create(key, true).await
    }

    /// The active channel for `key`, if one exists. Never creates.
    pub fn active_channel(&self, key: &RoutingKey) -> Option<Arc<ApiChannel<C>>> {
        self.channels.lock().get(key).map(|slot| slot.channel.clone())
    }

    /// Routing keys with an active channel, in key order.
    pub fn routing_keys(&self) -> Vec<RoutingKey> {
        self.channels.lock().keys().cloned().collect()
    }

    /// Connectivity of the channel for `key`; `Unknown` when there is none yet.
    pub fn connectivity(&self, key: &RoutingKey) -> ConnectivityState {
        self.active_channel(key)
            .map(|c| c.connectivity())
            .unwrap_or(ConnectivityState::Unknown)
    }

    pub fn channel_infos(&self) -> Vec<ChannelInfo> {
        self.channels_snapshot().iter().map(|c| c.info()).collect()
    }

    /// Routes `request` to the channel for `key`. Call errors pass through unchanged.
    pub async fn invoke(&self, key: &RoutingKey, request: C::Request) -> Result<C::Response, ApiError> {
        self.channel(key).await?.invoke(request).await
    }

    pub async fn invoke_global(&self, request: C::Request) -> Result<C::Response, ApiError> {
        self.invoke(&RoutingKey::Global, request).await
    }

    /// Waits until the channel for `key` is available.
    pub async fn wait_for_channel(
        &self,
        key: &RoutingKey,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        self.channel(key).await?.wait_for_available(timeout, cancel).await
    }

    /// Replaces the channel for `key` with a freshly resolved one.
    ///
    /// The replacement is brought up first and then swapped in; the old channel is
    /// retired and stopped afterwards, so callers never see a gap.
    pub async fn reconnect(&self, key: &RoutingKey) -> Result<Arc<ApiChannel<C>>, ApiError> {
        let _guard = self.creation.lock().await;
        let replacement = self.create_channel(key).await?;
        self.bring_up(&replacement).await?;

        let previous = self.insert(key, replacement.clone());
        self.lifecycle.adopt(self.me(), replacement.clone());

        if let Some(old) = previous {
            info!(parent: self.lifecycle.logger(), routing_key = %key, old = %old.endpoint(), new = %replacement.endpoint(), "Retiring channel after reconnect");
            self.retire_channel(old).await;
        }
        Ok(replacement)
    }

    /// Removes and stops the channel for `key`. Returns false if there was none.
    pub async fn retire(&self, key: &RoutingKey) -> bool {
        let _guard = self.creation.lock().await;
        let removed = self.channels.lock().remove(key);
        match removed {
            Some(slot) => {
                info!(parent: self.lifecycle.logger(), routing_key = %key, "Retiring channel");
                self.retire_channel(slot.channel).await;
                true
            }
            None => false,
        }
    }

    async fn retire_channel(&self, channel: Arc<ApiChannel<C>>) {
        self.lifecycle.release_child(channel.id());
        if let Err(e) = channel.stop(&ProgressMonitor::new(channel.name())).await {
            warn!(parent: self.lifecycle.logger(), routing_key = %channel.routing_key(), error = %e, "Retired channel failed to stop");
        }
    }

    fn tick(&self) -> u64 {
        self.uses.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, key: &RoutingKey, channel: Arc<ApiChannel<C>>) -> Option<Arc<ApiChannel<C>>> {
        let slot = Slot {
            channel,
            last_used: self.tick(),
        };
        self.channels
            .lock()
            .insert(key.clone(), slot)
            .map(|old| old.channel)
    }

    /// Looks up `key` and marks it as recently used.
    fn touch(&self, key: &RoutingKey) -> Option<Arc<ApiChannel<C>>> {
        let tick = self.tick();
        let mut channels = self.channels.lock();
        let slot = channels.get_mut(key)?;
        slot.last_used = tick;
        Some(slot.channel.clone())
    }

    /// Removes tenant channels beyond the configured bound, sparing `keep`.
    fn evict_tenants(&self, keep: &RoutingKey) -> Vec<Arc<ApiChannel<C>>> {
        let mut channels = self.channels.lock();
        let mut evicted = Vec::new();
        loop {
            let tenants = channels.keys().filter(|k| k.tenant_id().is_some()).count();
            if tenants <= self.settings.max_tenant_channels {
                break;
            }
            let victim = channels
                .iter()
                .filter(|(k, _)| k.tenant_id().is_some() && *k != keep)
                .min_by_key(|(_, slot)| {
                    (
                        slot.channel.connectivity() == ConnectivityState::Available,
                        slot.last_used,
                    )
                })
                .map(|(k, _)| k.clone());
            match victim.and_then(|k| channels.remove(&k)) {
                Some(slot) => evicted.push(slot.channel),
                None => break,
            }
        }
        evicted
    }

    fn me(&self) -> Weak<dyn LifecycleComponent> {
        self.self_ref.clone()
    }

    fn channels_snapshot(&self) -> Vec<Arc<ApiChannel<C>>> {
        self.channels
            .lock()
            .values()
            .map(|slot| slot.channel.clone())
            .collect()
    }

    async fn get_or_create(&self, key: &RoutingKey, bring_up: bool) -> Result<Arc<ApiChannel<C>>, ApiError> {
        if let Some(existing) = self.touch(key) {
            return Ok(existing);
        }
        let _guard = self.creation.lock().await;
        if let Some(existing) = self.touch(key) {
            return Ok(existing);
        }

        let channel = self.create_channel(key).await?;
        if bring_up {
            self.bring_up(&channel).await?;
        }
        self.insert(key, channel.clone());
        self.lifecycle.adopt(self.me(), channel.clone());
        info!(parent: self.lifecycle.logger(), routing_key = %key, endpoint = %channel.endpoint(), "Channel created");

        for old in self.evict_tenants(key) {
            info!(parent: self.lifecycle.logger(), routing_key = %old.routing_key(), "Evicting tenant channel");
            self.retire_channel(old).await;
        }
        Ok(channel)
    }

    async fn create_channel(&self, key: &RoutingKey) -> Result<Arc<ApiChannel<C>>, ApiError> {
        let endpoint = self
            .resolver
            .resolve(C::NAME, key)
            .await
            .map_err(|e| ApiError::Resolution {
                capability: C::NAME,
                routing_key: key.clone(),
                source: Arc::from(e),
            })?;
        let transport = self.transports.create(&endpoint);
        Ok(Arc::new(ApiChannel::new(
            key.clone(),
            endpoint,
            transport,
            self.settings.backoff,
        )))
    }

    /// Brings `channel` up to the demux's current lifecycle state.
    async fn bring_up(&self, channel: &Arc<ApiChannel<C>>) -> Result<(), LifecycleError> {
        let monitor = ProgressMonitor::new(channel.name());
        match self.state() {
            LifecycleState::Initializing | LifecycleState::Initialized => {
                channel.initialize(&monitor).await
            }
            LifecycleState::Starting | LifecycleState::Started => {
                channel.initialize(&monitor).await?;
                channel.start(&monitor).await
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<C: Capability> LifecycleComponent for ApiDemux<C> {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn on_initialize(&self, monitor: &ProgressMonitor) -> Result<(), BoxError> {
        for key in &self.settings.initial_keys {
            self.get_or_create(key, false).await?;
        }

        let channels = self.channels_snapshot();
        let mut init = CompositeLifecycleStep::new(format!("Initialize {} channels", C::NAME));
        for channel in &channels {
            init.add_initialize_step(channel.clone(), true);
        }

        if let Err(e) = init.execute(monitor).await {
            let initialized: Vec<Arc<dyn LifecycleComponent>> = channels
                .iter()
                .filter(|c| c.state() == LifecycleState::Initialized)
                .map(|c| c.clone() as Arc<dyn LifecycleComponent>)
                .collect();
            warn!(parent: self.lifecycle.logger(), error = %e, rollback = initialized.len(), "Channel initialization failed, rolling back");
            let rollback = CompositeLifecycleStep::stop_all(
                format!("Roll back {} channels", C::NAME),
                &initialized,
            );
            rollback.execute(monitor).await?;
            return Err(e.into());
        }
        Ok(())
    }

    async fn on_start(&self, monitor: &ProgressMonitor) -> Result<(), BoxError> {
        let mut start = CompositeLifecycleStep::new(format!("Start {} channels", C::NAME));
        for channel in self.channels_snapshot() {
            start.add_start_step(channel, true);
        }
        start.execute(monitor).await?;
        Ok(())
    }

    async fn on_stop(&self, monitor: &ProgressMonitor) -> Result<(), BoxError> {
        let mut first_error: Option<LifecycleError> = None;
        for channel in self.channels_snapshot().iter().rev() {
            if let Err(e) = channel.stop(monitor).await {
                warn!(parent: self.lifecycle.logger(), routing_key = %channel.routing_key(), error = %e, "Channel failed to stop");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

// =============================================================================
// TYPE-ERASED DEPENDENCY
// =============================================================================

/// A demux seen without its capability type, so a service can hold many.
#[async_trait]
pub trait ApiDependency: LifecycleComponent {
    fn capability_name(&self) -> &'static str;

    fn connectivity_of(&self, key: &RoutingKey) -> ConnectivityState;

    fn channel_infos(&self) -> Vec<ChannelInfo>;

    async fn wait_until_available(
        &self,
        key: &RoutingKey,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError>;
}

#[async_trait]
impl<C: Capability> ApiDependency for ApiDemux<C> {
    fn capability_name(&self) -> &'static str {
        C::NAME
    }

    fn connectivity_of(&self, key: &RoutingKey) -> ConnectivityState {
        self.connectivity(key)
    }

    fn channel_infos(&self) -> Vec<ChannelInfo> {
        ApiDemux::channel_infos(self)
    }

    async fn wait_until_available(
        &self,
        key: &RoutingKey,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        self.wait_for_channel(key, timeout, cancel).await
    }
}
