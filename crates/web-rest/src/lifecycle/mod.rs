//! # Service Lifecycle & Orchestration
//!
//! This module wires the Web/REST service together: one API demux per capability,
//! the device event consumer, and the [`Microservice`](microservice_framework::Microservice)
//! root that boots and stops them as a unit.
//!
//! ## The Orchestration Pattern
//!
//! Individual demuxes and consumers are simple; **wiring them together** is where
//! the complexity lives. [`WebRestMicroservice`] is the conductor.
//!
//! **Key Responsibilities:**
//! 1. **Demux Creation** - One [`ApiDemux`](microservice_framework::ApiDemux) per
//!    capability, all sharing one address resolver built from discovery settings
//! 2. **Dependency Policy** - `require_succeed` / `wait_on_startup` per capability,
//!    taken from configuration
//! 3. **Consumer Registration** - The device event consumer runtime is added after
//!    the demuxes, so it starts only once event management is up
//! 4. **Graceful Shutdown** - The mirrored stop sequence: consumer first, then the
//!    demuxes in reverse declaration order
//!
//! ```rust,ignore
//! let config = web_rest::config::load_config()?;
//! let backends = LocalBackends::new();
//! let broker = Arc::new(InMemoryBroker::new());
//!
//! let service = WebRestMicroservice::new(&config, backends.transports(&config), broker)?;
//! service.boot().await?;
//! let alice = service.user_client().get_user("alice").await?;
//! service.shutdown().await?;
//! ```
//!
//! ## Transports
//!
//! The service never constructs transports itself. [`Transports`] carries one
//! [`TransportFactory`](microservice_framework::TransportFactory) per capability,
//! so the same wiring runs against in-process backends, mocks, or a real network
//! transport.
//!
//! ## Observability & Tracing
//!
//! Every demux, channel and the consumer runtime log inside their own span. Run
//! with `RUST_LOG=info` for lifecycle transitions, `RUST_LOG=debug` for per-call
//! payloads. See [`microservice_framework::tracing`] for details.

pub mod web_rest;

pub use web_rest::*;
