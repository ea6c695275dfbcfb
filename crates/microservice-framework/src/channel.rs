//! # API Channel
//!
//! One logical connection to one instance of a remote capability provider. A
//! channel tracks *reachability* (`ConnectivityState`) independently of its
//! lifecycle state: a channel can be `Started` while its provider is still
//! `Unavailable`.
//!
//! # Blocking Semantics
//! - [`ApiChannel::invoke`] never waits. If the channel is not `Available` it fails
//!   straight away with [`ApiError::NotAvailable`]. A started channel that is
//!   `Unavailable` re-probes once before failing, at most once per backoff
//!   interval, so a provider that comes back is picked up by normal traffic.
//! - [`ApiChannel::wait_for_available`] is the only suspension point. It re-probes
//!   the transport on a [`BackoffPolicy`] schedule until the provider becomes
//!   reachable, the optional timeout elapses, or the supplied
//!   [`CancellationToken`] fires. No lock is held while it sleeps.

use crate::backoff::BackoffPolicy;
use crate::component::{Lifecycle, LifecycleComponent, LifecycleState};
use crate::demux::RoutingKey;
use crate::error::{ApiError, BoxError};
use crate::monitor::ProgressMonitor;
use crate::transport::{ApiTransport, Capability, Endpoint};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reachability of a channel's remote provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectivityState {
    Unknown,
    Connecting,
    Available,
    Unavailable,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectivityState::Unknown => "unknown",
            ConnectivityState::Connecting => "connecting",
            ConnectivityState::Available => "available",
            ConnectivityState::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

struct ChannelStatus {
    connectivity: ConnectivityState,
    last_error: Option<String>,
    // Earliest time `invoke` may probe again, and how many probes have failed.
    next_probe: Option<Instant>,
    failed_probes: u32,
}

/// Serializable view of one channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub capability: &'static str,
    pub routing_key: RoutingKey,
    pub endpoint: Endpoint,
    pub connectivity: ConnectivityState,
    pub last_error: Option<String>,
}

/// A connection to one provider of capability `C`.
pub struct ApiChannel<C: Capability> {
    lifecycle: Lifecycle,
    routing_key: RoutingKey,
    endpoint: Endpoint,
    transport: Arc<dyn ApiTransport<C>>,
    backoff: BackoffPolicy,
    status: Mutex<ChannelStatus>,
}

impl<C: Capability> ApiChannel<C> {
    pub fn new(
        routing_key: RoutingKey,
        endpoint: Endpoint,
        transport: Arc<dyn ApiTransport<C>>,
        backoff: BackoffPolicy,
    ) -> Self {
        let logger = tracing::info_span!(
            "api_channel",
            capability = C::NAME,
            routing_key = %routing_key,
            endpoint = %endpoint
        );
        Self {
            lifecycle: Lifecycle::with_logger(
                format!("{} API channel ({})", C::NAME, routing_key),
                logger,
            ),
            routing_key,
            endpoint,
            transport,
            backoff,
            status: Mutex::new(ChannelStatus {
                connectivity: ConnectivityState::Unknown,
                last_error: None,
                next_probe: None,
                failed_probes: 0,
            }),
        }
    }

    pub fn capability(&self) -> &'static str {
        C::NAME
    }

    pub fn routing_key(&self) -> &RoutingKey {
        &self.routing_key
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.status.lock().connectivity
    }

    /// Last transport error observed by this channel.
    pub fn last_api_error(&self) -> Option<String> {
        self.status.lock().last_error.clone()
    }

    /// Updates the connectivity state. Used by health pollers and by the channel's
    /// own probes.
    pub fn set_connectivity(&self, state: ConnectivityState) {
        let previous = {
            let mut status = self.status.lock();
            let previous = status.connectivity;
            status.connectivity = state;
            if state == ConnectivityState::Available {
                status.last_error = None;
                status.next_probe = None;
                status.failed_probes = 0;
            }
            previous
        };
        if previous != state {
            info!(parent: self.lifecycle.logger(), from = %previous, to = %state, "Connectivity changed");
        }
    }

    fn record_unavailable(&self, error: &BoxError) {
        self.set_connectivity(ConnectivityState::Unavailable);
        self.status.lock().last_error = Some(error.to_string());
    }

    /// Probes the transport once and records the result.
    ///
    /// A probe that cannot be carried out counts as `Unavailable`.
    pub async fn refresh_connectivity(&self) -> ConnectivityState {
        match self.transport.probe().await {
            Ok(state) => {
                self.set_connectivity(state);
                state
            }
            Err(e) => {
                debug!(parent: self.lifecycle.logger(), error = %e, "Connectivity probe failed");
                self.record_unavailable(&e);
                ConnectivityState::Unavailable
            }
        }
    }

    /// Waits until the provider is reachable.
    ///
    /// Returns immediately if the channel is already `Available`. Otherwise polls
    /// with backoff until available, until `timeout` elapses (never earlier), or
    /// until `cancel` fires.
    pub async fn wait_for_available(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        if self.connectivity() == ConnectivityState::Available {
            return Ok(());
        }

        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut attempt: u32 = 0;

        info!(parent: self.lifecycle.logger(), ?timeout, "Waiting for API to become available");
        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }
            if self.refresh_connectivity().await == ConnectivityState::Available {
                info!(parent: self.lifecycle.logger(), waited = ?started.elapsed(), "API is available");
                return Ok(());
            }

            let mut delay = self.backoff.next(attempt);
            attempt = attempt.saturating_add(1);
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    warn!(parent: self.lifecycle.logger(), "Timed out waiting for API");
                    return Err(ApiError::Timeout {
                        capability: C::NAME,
                        routing_key: self.routing_key.clone(),
                        waited: now - started,
                    });
                }
                delay = delay.min(deadline - now);
            }
            debug!(parent: self.lifecycle.logger(), attempt, ?delay, "API not available yet, retrying");

            tokio::select! {
                _ = cancel.cancelled() => return Err(self.cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn cancelled(&self) -> ApiError {
        debug!(parent: self.lifecycle.logger(), "Wait for API cancelled");
        ApiError::Cancelled {
            capability: C::NAME,
            routing_key: self.routing_key.clone(),
        }
    }

    /// Claims the next on-demand probe slot if one is due.
    fn claim_probe(&self) -> bool {
        let now = Instant::now();
        let mut status = self.status.lock();
        if status.next_probe.is_some_and(|due| now < due) {
            return false;
        }
        status.next_probe = Some(now + self.backoff.next(status.failed_probes));
        status.failed_probes = status.failed_probes.saturating_add(1);
        true
    }

    /// Forwards `request` if the channel is `Available`.
    pub async fn invoke(&self, request: C::Request) -> Result<C::Response, ApiError> {
        let mut state = self.connectivity();
        if state == ConnectivityState::Unavailable
            && self.state() == LifecycleState::Started
            && self.claim_probe()
        {
            debug!(parent: self.lifecycle.logger(), "Re-probing unavailable API");
            state = self.refresh_connectivity().await;
        }
        if state != ConnectivityState::Available {
            return Err(ApiError::NotAvailable {
                capability: C::NAME,
                routing_key: self.routing_key.clone(),
                state,
            });
        }
        self.transport.send(request).await.map_err(|e| ApiError::Call {
            capability: C::NAME,
            routing_key: self.routing_key.clone(),
            source: Arc::from(e),
        })
    }

    pub fn info(&self) -> ChannelInfo {
        let status = self.status.lock();
        ChannelInfo {
            capability: C::NAME,
            routing_key: self.routing_key.clone(),
            endpoint: self.endpoint.clone(),
            connectivity: status.connectivity,
            last_error: status.last_error.clone(),
        }
    }
}

#[async_trait]
impl<C: Capability> LifecycleComponent for ApiChannel<C> {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn on_initialize(&self, _monitor: &ProgressMonitor) -> Result<(), BoxError> {
        self.set_connectivity(ConnectivityState::Connecting);
        if let Err(e) = self.transport.connect().await {
            self.record_unavailable(&e);
            return Err(e);
        }
        match self.transport.probe().await {
            Ok(state) => {
                self.set_connectivity(state);
                Ok(())
            }
            Err(e) => {
                // Release the connection opened above before failing.
                if let Err(close) = self.transport.disconnect().await {
                    warn!(parent: self.lifecycle.logger(), error = %close, "Disconnect after failed probe also failed");
                }
                self.record_unavailable(&e);
                Err(e)
            }
        }
    }

    async fn on_start(&self, _monitor: &ProgressMonitor) -> Result<(), BoxError> {
        let state = self.refresh_connectivity().await;
        if state != ConnectivityState::Available {
            warn!(parent: self.lifecycle.logger(), %state, "Channel started but API is not available");
        }
        Ok(())
    }

    async fn on_stop(&self, _monitor: &ProgressMonitor) -> Result<(), BoxError> {
        let result = self.transport.disconnect().await;
        self.set_connectivity(ConnectivityState::Unknown);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::LifecycleState;
    use crate::mock::MockTransport;

    struct Ping;

    impl Capability for Ping {
        const NAME: &'static str = "ping";
        type Request = u32;
        type Response = u32;
    }

    fn channel(mock: &MockTransport<Ping>) -> ApiChannel<Ping> {
        ApiChannel::new(
            RoutingKey::Global,
            Endpoint::new("ping", 1),
            mock.transport(),
            BackoffPolicy::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_immediately_when_available() {
        let mock = MockTransport::<Ping>::new();
        let ch = channel(&mock);
        let monitor = ProgressMonitor::new("test");
        ch.initialize(&monitor).await.unwrap();
        assert_eq!(ch.connectivity(), ConnectivityState::Available);

        let probes = mock.probe_count();
        let before = Instant::now();
        ch.wait_for_available(Some(Duration::from_secs(1)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(before.elapsed(), Duration::ZERO);
        assert_eq!(mock.probe_count(), probes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_after_deadline() {
        let mock = MockTransport::<Ping>::new();
        mock.set_connectivity(ConnectivityState::Unavailable);
        let ch = channel(&mock);
        ch.initialize(&ProgressMonitor::new("test")).await.unwrap();

        let before = Instant::now();
        let err = ch
            .wait_for_available(Some(Duration::from_secs(2)), &CancellationToken::new())
            .await
            .unwrap_err();
        let waited = before.elapsed();

        assert!(matches!(err, ApiError::Timeout { .. }));
        assert!(waited >= Duration::from_secs(2));
        assert!(waited < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_succeeds_once_provider_recovers() {
        let mock = MockTransport::<Ping>::new();
        mock.set_connectivity(ConnectivityState::Unavailable);
        let ch = Arc::new(channel(&mock));
        ch.initialize(&ProgressMonitor::new("test")).await.unwrap();

        let flip = mock.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(650)).await;
            flip.set_connectivity(ConnectivityState::Available);
        });

        ch.wait_for_available(None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ch.connectivity(), ConnectivityState::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancellable() {
        let mock = MockTransport::<Ping>::new();
        mock.set_connectivity(ConnectivityState::Unavailable);
        let ch = channel(&mock);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let err = ch.wait_for_available(None, &cancel).await.unwrap_err();
        assert!(matches!(err, ApiError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_invoke_fails_fast_when_unavailable() {
        let mock = MockTransport::<Ping>::new();
        mock.set_connectivity(ConnectivityState::Unavailable);
        let ch = channel(&mock);
        ch.initialize(&ProgressMonitor::new("test")).await.unwrap();

        let err = ch.invoke(7).await.unwrap_err();
        assert!(matches!(
            err,
            ApiError::NotAvailable {
                state: ConnectivityState::Unavailable,
                ..
            }
        ));
        assert_eq!(mock.send_count(), 0);
    }

    #[tokio::test]
    async fn test_invoke_passes_call_errors_through() {
        let mock = MockTransport::<Ping>::new();
        mock.expect_send().return_ok(8);
        mock.expect_send().return_err("boom");
        let ch = channel(&mock);
        ch.initialize(&ProgressMonitor::new("test")).await.unwrap();

        assert_eq!(ch.invoke(7).await.unwrap(), 8);
        let err = ch.invoke(7).await.unwrap_err();
        assert!(matches!(err, ApiError::Call { .. }));
        assert!(err.to_string().contains("boom"));
        mock.verify();
    }

    #[tokio::test]
    async fn test_failed_probe_releases_connection() {
        let mock = MockTransport::<Ping>::new();
        mock.fail_probe("probe socket closed");
        let ch = channel(&mock);

        ch.initialize(&ProgressMonitor::new("test")).await.unwrap_err();
        assert_eq!(ch.state(), LifecycleState::Error);
        assert_eq!(mock.connect_count(), 1);
        assert_eq!(mock.disconnect_count(), 1);
        assert_eq!(ch.connectivity(), ConnectivityState::Unavailable);
    }

    #[tokio::test]
    async fn test_start_records_unavailable_without_failing() {
        let mock = MockTransport::<Ping>::new();
        let ch = channel(&mock);
        let monitor = ProgressMonitor::new("test");
        ch.initialize(&monitor).await.unwrap();

        mock.set_connectivity(ConnectivityState::Unavailable);
        ch.start(&monitor).await.unwrap();
        assert_eq!(ch.state(), LifecycleState::Started);
        assert_eq!(ch.connectivity(), ConnectivityState::Unavailable);

        ch.stop(&monitor).await.unwrap();
        assert_eq!(ch.connectivity(), ConnectivityState::Unknown);
        assert_eq!(mock.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_picks_up_recovered_provider() {
        let mock = MockTransport::<Ping>::new();
        mock.set_connectivity(ConnectivityState::Unavailable);
        mock.expect_send().return_ok(8);
        let ch = channel(&mock);
        let monitor = ProgressMonitor::new("test");
        ch.initialize(&monitor).await.unwrap();
        ch.start(&monitor).await.unwrap();
        let probes = mock.probe_count();

        // First call probes, the next one inside the backoff window does not.
        assert!(ch.invoke(7).await.is_err());
        assert!(ch.invoke(7).await.is_err());
        assert_eq!(mock.probe_count(), probes + 1);

        mock.set_connectivity(ConnectivityState::Available);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ch.invoke(7).await.unwrap(), 8);
        assert_eq!(ch.connectivity(), ConnectivityState::Available);
        assert_eq!(mock.probe_count(), probes + 2);
        mock.verify();
    }
}
