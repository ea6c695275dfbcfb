//! # Microservice Orchestration
//!
//! A [`Microservice`] is the root lifecycle component of a process. It owns an
//! ordered list of members (API demuxes and any other components such as broker
//! consumer runtimes) and drives them through one boot sequence:
//!
//! 1. **Initialize** every member in declaration order (one composite step).
//! 2. **Start** every member in the same order.
//! 3. Mark the service started.
//! 4. Wait (bounded, cancellable) for the APIs flagged `wait_on_startup`.
//!
//! [`Microservice::shutdown`] cancels any pending wait and runs the mirrored stop
//! sequence in reverse order.
//!
//! ## Failure Semantics
//!
//! Members flagged `require_succeed` abort the boot on failure; members that were
//! already brought up are stopped again before the error is returned, so the
//! service never half-serves. The same holds for a required API that does not
//! become available during the startup wait: members are stopped and the service
//! ends in `Error`. Best-effort members only degrade [`HealthStatus`].
//!
//! ```rust,ignore
//! let service = MicroserviceBuilder::new("Web/REST")
//!     .dependency(users, DependencyOptions::required().wait_on_startup())
//!     .dependency(schedules, DependencyOptions::optional())
//!     .component(consumer_runtime, true)
//!     .build();
//!
//! service.boot().await?;
//! assert!(service.health().is_serving());
//! service.shutdown().await?;
//! ```

use crate::channel::ConnectivityState;
use crate::component::{attach_child, Lifecycle, LifecycleAction, LifecycleComponent, LifecycleState};
use crate::config::{DependencyConfig, MicroserviceConfig};
use crate::demux::{ApiDependency, RoutingKey};
use crate::error::{BoxError, FrameworkError};
use crate::monitor::ProgressMonitor;
use crate::step::{CompositeLifecycleStep, LifecycleStep};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How strictly the service depends on one API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyOptions {
    pub require_succeed: bool,
    pub wait_on_startup: bool,
}

impl DependencyOptions {
    pub fn required() -> Self {
        Self {
            require_succeed: true,
            wait_on_startup: false,
        }
    }

    pub fn optional() -> Self {
        Self {
            require_succeed: false,
            wait_on_startup: false,
        }
    }

    pub fn wait_on_startup(mut self) -> Self {
        self.wait_on_startup = true;
        self
    }
}

impl From<&DependencyConfig> for DependencyOptions {
    fn from(cfg: &DependencyConfig) -> Self {
        Self {
            require_succeed: cfg.require_succeed,
            wait_on_startup: cfg.wait_on_startup,
        }
    }
}

/// Overall service health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded { reasons: Vec<String> },
    Unhealthy { reason: String },
}

impl HealthStatus {
    /// True unless the service is unhealthy.
    pub fn is_serving(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy { .. })
    }
}

struct Member {
    component: Arc<dyn LifecycleComponent>,
    api: Option<Arc<dyn ApiDependency>>,
    require_succeed: bool,
    wait_on_startup: bool,
}

/// Collects the members of a [`Microservice`].
pub struct MicroserviceBuilder {
    name: String,
    identifier: String,
    api_wait_timeout: Option<Duration>,
    members: Vec<Member>,
}

impl MicroserviceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            identifier: name.to_lowercase().replace(|c: char| !c.is_alphanumeric(), "-"),
            name,
            api_wait_timeout: Some(Duration::from_secs(30)),
            members: Vec::new(),
        }
    }

    /// Takes name, identifier and API wait timeout from `config`. Dependencies are
    /// still added explicitly, since only the caller can construct typed demuxes.
    pub fn from_config(config: &MicroserviceConfig) -> Self {
        Self::new(config.name.clone())
            .identifier(config.identifier.clone())
            .api_wait_timeout(config.api_wait.timeout())
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Upper bound for each startup API wait. `None` waits until shutdown.
    pub fn api_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.api_wait_timeout = timeout;
        self
    }

    pub fn dependency<D>(mut self, demux: Arc<D>, options: DependencyOptions) -> Self
    where
        D: ApiDependency + 'static,
    {
        let api: Arc<dyn ApiDependency> = demux.clone();
        self.members.push(Member {
            component: demux,
            api: Some(api),
            require_succeed: options.require_succeed,
            wait_on_startup: options.wait_on_startup,
        });
        self
    }

    pub fn component<T>(mut self, component: Arc<T>, require_succeed: bool) -> Self
    where
        T: LifecycleComponent + 'static,
    {
        self.members.push(Member {
            component,
            api: None,
            require_succeed,
            wait_on_startup: false,
        });
        self
    }

    pub fn build(self) -> Arc<Microservice> {
        let logger = tracing::info_span!("microservice", name = %self.name, identifier = %self.identifier);
        let children: Vec<Arc<dyn LifecycleComponent>> =
            self.members.iter().map(|m| m.component.clone()).collect();
        let service = Arc::new(Microservice {
            lifecycle: Lifecycle::with_logger(self.name.clone(), logger),
            monitor: ProgressMonitor::new(self.name),
            identifier: self.identifier,
            api_wait_timeout: self.api_wait_timeout,
            members: self.members,
            shutdown: Mutex::new(CancellationToken::new()),
        });
        for child in children {
            attach_child(&service, child);
        }
        service
    }
}

/// Root component of a microservice process.
pub struct Microservice {
    lifecycle: Lifecycle,
    monitor: ProgressMonitor,
    identifier: String,
    api_wait_timeout: Option<Duration>,
    members: Vec<Member>,
    shutdown: Mutex<CancellationToken>,
}

impl Microservice {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The monitor every boot and shutdown step reports into.
    pub fn monitor(&self) -> &ProgressMonitor {
        &self.monitor
    }

    /// The API dependency for `capability`, if the service has one.
    pub fn api(&self, capability: &str) -> Option<Arc<dyn ApiDependency>> {
        self.members
            .iter()
            .filter_map(|m| m.api.as_ref())
            .find(|api| api.capability_name() == capability)
            .cloned()
    }

    /// Global-channel connectivity of the API for `capability`.
    pub fn api_connectivity(&self, capability: &str) -> Option<ConnectivityState> {
        self.api(capability)
            .map(|api| api.connectivity_of(&RoutingKey::Global))
    }

    /// Initializes and starts every member, then waits for startup APIs.
    pub async fn boot(&self) -> Result<(), FrameworkError> {
        {
            let mut token = self.shutdown.lock();
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        info!(parent: self.lifecycle.logger(), members = self.members.len(), "Booting microservice");
        self.initialize(&self.monitor).await?;
        self.start(&self.monitor).await?;
        info!(parent: self.lifecycle.logger(), errors = self.monitor.error_count(), "Microservice started");
        if let Err(e) = self.wait_for_apis().await {
            // A cancelled wait belongs to a shutdown that stops the members itself.
            if !self.shutdown.lock().is_cancelled() {
                self.roll_back(&self.monitor).await;
                self.lifecycle.fail(LifecycleAction::Start, Box::new(e.clone()));
            }
            return Err(e);
        }
        Ok(())
    }

    /// Blocks until every API flagged `wait_on_startup` is available.
    ///
    /// A required API that times out (or whose wait is cancelled by shutdown) fails
    /// the call; an optional one is only logged.
    pub async fn wait_for_apis(&self) -> Result<(), FrameworkError> {
        let cancel = self.shutdown.lock().clone();
        for member in self.members.iter().filter(|m| m.wait_on_startup) {
            let Some(api) = &member.api else { continue };
            info!(parent: self.lifecycle.logger(), capability = api.capability_name(), "Waiting for API");
            match api
                .wait_until_available(&RoutingKey::Global, self.api_wait_timeout, &cancel)
                .await
            {
                Ok(()) => {}
                Err(e) if member.require_succeed => return Err(e.into()),
                Err(e) => {
                    warn!(parent: self.lifecycle.logger(), capability = api.capability_name(), error = %e, "Optional API did not become available");
                }
            }
        }
        Ok(())
    }

    /// Cancels pending waits and stops every member in reverse order.
    pub async fn shutdown(&self) -> Result<(), FrameworkError> {
        info!(parent: self.lifecycle.logger(), "Shutting down microservice");
        self.shutdown.lock().cancel();
        self.stop(&self.monitor).await?;
        Ok(())
    }

    pub fn health(&self) -> HealthStatus {
        let state = self.state();
        if state != LifecycleState::Started {
            let reason = match self.last_error() {
                Some(e) => e.to_string(),
                None => format!("service is {state}"),
            };
            return HealthStatus::Unhealthy { reason };
        }

        let mut reasons = Vec::new();
        for member in &self.members {
            let member_state = member.component.state();
            if member_state != LifecycleState::Started {
                if member.require_succeed {
                    let reason = match member.component.last_error() {
                        Some(e) => e.to_string(),
                        None => format!("{} is {}", member.component.name(), member_state),
                    };
                    return HealthStatus::Unhealthy { reason };
                }
                reasons.push(format!("{} is {}", member.component.name(), member_state));
                continue;
            }
            if let Some(api) = &member.api {
                let connectivity = api.connectivity_of(&RoutingKey::Global);
                if connectivity != ConnectivityState::Available {
                    reasons.push(format!("{} API is {}", api.capability_name(), connectivity));
                }
            }
        }

        if reasons.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded { reasons }
        }
    }

    fn components(&self) -> Vec<Arc<dyn LifecycleComponent>> {
        self.members.iter().map(|m| m.component.clone()).collect()
    }

    /// Stops every member that got past `Created`, in reverse order.
    async fn roll_back(&self, monitor: &ProgressMonitor) {
        let reached: Vec<Arc<dyn LifecycleComponent>> = self
            .components()
            .into_iter()
            .filter(|c| matches!(c.state(), LifecycleState::Initialized | LifecycleState::Started))
            .collect();
        warn!(parent: self.lifecycle.logger(), members = reached.len(), "Rolling back members");
        let step = CompositeLifecycleStep::stop_all(format!("Roll back {}", self.name()), &reached);
        if let Err(e) = step.execute(monitor).await {
            warn!(parent: self.lifecycle.logger(), error = %e, "Roll back incomplete");
        }
    }
}

#[async_trait]
impl LifecycleComponent for Microservice {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn on_initialize(&self, monitor: &ProgressMonitor) -> Result<(), BoxError> {
        let mut step = CompositeLifecycleStep::new(format!("Initialize {}", self.name()));
        for member in &self.members {
            step.add_initialize_step(member.component.clone(), member.require_succeed);
        }
        if let Err(e) = step.execute(monitor).await {
            self.roll_back(monitor).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn on_start(&self, monitor: &ProgressMonitor) -> Result<(), BoxError> {
        let mut step = CompositeLifecycleStep::new(format!("Start {}", self.name()));
        for member in &self.members {
            if member.component.state() == LifecycleState::Error {
                warn!(parent: self.lifecycle.logger(), member = member.component.name(), "Not starting failed optional member");
                continue;
            }
            step.add_start_step(member.component.clone(), member.require_succeed);
        }
        if let Err(e) = step.execute(monitor).await {
            self.roll_back(monitor).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn on_stop(&self, monitor: &ProgressMonitor) -> Result<(), BoxError> {
        let step = CompositeLifecycleStep::stop_all(format!("Stop {}", self.name()), &self.components());
        step.execute(monitor).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingComponent;

    #[tokio::test]
    async fn test_boot_and_shutdown_order() {
        let log = RecordingComponent::call_log();
        let service = MicroserviceBuilder::new("Test Service")
            .component(Arc::new(RecordingComponent::new("a", &log)), true)
            .component(Arc::new(RecordingComponent::new("b", &log)), true)
            .build();

        service.boot().await.unwrap();
        assert_eq!(service.health(), HealthStatus::Healthy);
        service.shutdown().await.unwrap();

        assert_eq!(
            log.lock().as_slice(),
            ["initialize a", "initialize b", "start a", "start b", "stop b", "stop a"]
        );
        assert_eq!(service.state(), LifecycleState::Stopped);
        assert_eq!(service.identifier(), "test-service");
    }

    #[tokio::test]
    async fn test_required_failure_rolls_back_and_reports_unhealthy() {
        let log = RecordingComponent::call_log();
        let service = MicroserviceBuilder::new("svc")
            .component(Arc::new(RecordingComponent::new("a", &log)), true)
            .component(
                Arc::new(RecordingComponent::new("b", &log).fail_on(LifecycleAction::Start)),
                true,
            )
            .component(Arc::new(RecordingComponent::new("c", &log)), true)
            .build();

        let err = service.boot().await.unwrap_err();
        assert!(err.to_string().contains("b refused to start"));
        assert!(!log.lock().contains(&"start c".to_string()));
        assert!(log.lock().contains(&"stop a".to_string()));
        assert!(matches!(service.health(), HealthStatus::Unhealthy { .. }));
    }

    #[tokio::test]
    async fn test_optional_failure_degrades() {
        let log = RecordingComponent::call_log();
        let service = MicroserviceBuilder::new("svc")
            .component(Arc::new(RecordingComponent::new("core", &log)), true)
            .component(
                Arc::new(RecordingComponent::new("extra", &log).fail_on(LifecycleAction::Initialize)),
                false,
            )
            .build();

        service.boot().await.unwrap();
        assert_eq!(service.monitor().error_count(), 1);
        match service.health() {
            HealthStatus::Degraded { reasons } => assert_eq!(reasons, vec!["extra is error"]),
            other => panic!("unexpected health {other:?}"),
        }
        assert!(!log.lock().contains(&"start extra".to_string()));
    }
}
