//! # Microservice Framework
//!
//! This crate provides the building blocks for microservices that depend on each
//! other's APIs and on a message broker: a uniform lifecycle for every moving part,
//! ordered composite start/stop sequences with progress reporting, and
//! availability-aware API channels that hide how many provider instances sit
//! behind a capability.
//!
//! ## Architecture Overview
//!
//! The framework separates concerns into four layers:
//!
//! 1. **Lifecycle Layer** ([`LifecycleComponent`], [`Lifecycle`]) - one state machine
//!    shared by every component, with async hooks for the parts that differ
//! 2. **Step Layer** ([`CompositeLifecycleStep`], [`ProgressMonitor`]) - ordered,
//!    nested batches of lifecycle operations with required/best-effort semantics
//! 3. **API Layer** ([`ApiChannel`], [`ApiDemux`]) - connections to remote
//!    capabilities, tracked for availability and routed by [`RoutingKey`]
//! 4. **Service Layer** ([`Microservice`], [`ConsumerRuntime`]) - the process root
//!    that boots, supervises and shuts down everything above
//!
//! Every layer is itself a lifecycle component, so a service is a tree:
//!
//! ```text
//! Microservice "Web/REST"
//! ├── user-management API demux
//! │   ├── user-management API channel (global)
//! │   └── user-management API channel (tenant:acme)
//! ├── schedule-management API demux
//! │   └── schedule-management API channel (global)
//! └── Device Event Consumer runtime
//!     └── Device Event Consumer
//! ```
//!
//! ## Core Abstractions
//!
//! ### [`LifecycleComponent`] - The State Machine
//!
//! Implementors embed a [`Lifecycle`] and override only the hooks they need.
//! The provided `initialize/start/stop` methods enforce the transition table,
//! record failures and log them in the component's own span:
//!
//! ```rust
//! use microservice_framework::{BoxError, Lifecycle, LifecycleComponent, LifecycleState, ProgressMonitor};
//! use async_trait::async_trait;
//!
//! struct Cache {
//!     lifecycle: Lifecycle,
//! }
//!
//! #[async_trait]
//! impl LifecycleComponent for Cache {
//!     fn lifecycle(&self) -> &Lifecycle {
//!         &self.lifecycle
//!     }
//!
//!     async fn on_start(&self, _monitor: &ProgressMonitor) -> Result<(), BoxError> {
//!         Err("cache directory is read-only".into())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let cache = Cache { lifecycle: Lifecycle::new("cache") };
//! let monitor = ProgressMonitor::new("boot");
//!
//! cache.initialize(&monitor).await.unwrap();
//! assert!(cache.start(&monitor).await.is_err());
//! assert_eq!(cache.state(), LifecycleState::Error);
//! # }
//! ```
//!
//! ### [`ApiDemux`] - Routing Calls to a Capability
//!
//! A [`Capability`] names a remote API and its request/response types. The demux
//! resolves an [`Endpoint`] per routing key, creates channels through a
//! [`TransportFactory`] and forwards calls. The in-process [`LocalTransportFactory`]
//! serves a capability from a local handler:
//!
//! ```rust
//! use microservice_framework::{
//!     ApiDemux, BoxError, Capability, CapabilityHandler, DemuxSettings, DependencyOptions,
//!     DiscoveryConfig, Endpoint, HealthStatus, LocalTransportFactory, MicroserviceBuilder,
//!     ServiceAddress, StaticAddressResolver,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl Capability for Echo {
//!     const NAME: &'static str = "echo";
//!     type Request = String;
//!     type Response = String;
//! }
//!
//! struct EchoHandler;
//!
//! #[async_trait]
//! impl CapabilityHandler<Echo> for EchoHandler {
//!     async fn handle(&self, request: String) -> Result<String, BoxError> {
//!         Ok(request)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let discovery = DiscoveryConfig::default().with_service("echo", ServiceAddress::new("echo", 7000));
//! let transports = Arc::new(LocalTransportFactory::<Echo>::new());
//! transports.register(Endpoint::new("echo", 7000), Arc::new(EchoHandler));
//!
//! let echo = ApiDemux::<Echo>::new(
//!     Arc::new(StaticAddressResolver::new(discovery)),
//!     transports,
//!     DemuxSettings::default(),
//! );
//!
//! let service = MicroserviceBuilder::new("Echo Client")
//!     .dependency(echo.clone(), DependencyOptions::required().wait_on_startup())
//!     .build();
//!
//! service.boot().await.unwrap();
//! assert_eq!(service.health(), HealthStatus::Healthy);
//! assert_eq!(echo.invoke_global("ping".to_string()).await.unwrap(), "ping");
//!
//! service.shutdown().await.unwrap();
//! # }
//! ```
//!
//! ## Failure Model
//!
//! - **Required steps fail fast**: the first failing required operation aborts its
//!   composite and the error propagates unchanged.
//! - **Best-effort steps degrade**: failures are recorded in the [`ProgressMonitor`]
//!   and surface through [`Microservice::health`].
//! - **Calls never retry**: [`ApiChannel::invoke`] on an unavailable channel fails
//!   with [`ApiError::NotAvailable`]; callers that want to wait use
//!   `wait_for_available` with an explicit timeout and [`CancellationToken`].
//!
//! ## Concurrency Model
//!
//! - Lifecycle transitions are linearizable per component; state lives behind a
//!   `parking_lot` mutex that is never held across an `.await`
//! - Composite steps run strictly in declaration order
//! - Each broker consumer runtime owns one receive loop task; batches are
//!   processed one at a time
//! - Cancellation is explicit ([`CancellationToken`]), never implied by dropping
//!
//! ## Testing
//!
//! The [`mock`] module provides an expectation-driven [`MockTransport`](mock::MockTransport)
//! and recording lifecycle components, and [`InMemoryBroker`] stands in for a real
//! broker. See the [`mock`] module for usage patterns.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod backoff;
pub mod broker;
pub mod channel;
pub mod component;
pub mod config;
pub mod consumer;
pub mod demux;
pub mod error;
pub mod microservice;
pub mod mock;
pub mod monitor;
pub mod step;
pub mod tracing;
pub mod transport;

// Re-export core types for convenience
pub use backoff::{BackoffConfig, BackoffPolicy};
pub use broker::{InMemoryBroker, InMemorySubscription};
pub use channel::{ApiChannel, ChannelInfo, ConnectivityState};
pub use component::{
    attach_child, ComponentId, ComponentStatus, Lifecycle, LifecycleAction, LifecycleComponent,
    LifecycleState,
};
pub use config::{
    ApiWaitConfig, ConsumerConfig, DependencyConfig, DiscoveryConfig, MicroserviceConfig,
    ServiceAddress,
};
pub use consumer::{
    BatchErrorPolicy, BrokerConsumer, BrokerSubscription, ConsumerRecord, ConsumerRuntime,
    ConsumerStats, MessageBroker, TopicPartition,
};
pub use demux::{
    AddressResolver, ApiDemux, ApiDependency, DemuxSettings, RoutingKey, StaticAddressResolver,
};
pub use error::{
    ApiError, BatchProcessingError, BoxError, BrokerError, ConfigError, FrameworkError,
    LifecycleError, SharedError,
};
pub use microservice::{DependencyOptions, HealthStatus, Microservice, MicroserviceBuilder};
pub use monitor::{ProgressContext, ProgressEvent, ProgressMonitor, ProgressSnapshot};
pub use step::{CompositeLifecycleStep, LifecycleOperation, LifecycleStep};
pub use transport::{
    ApiTransport, Capability, CapabilityHandler, Endpoint, LocalTransport, LocalTransportError,
    LocalTransportFactory, TransportFactory,
};
