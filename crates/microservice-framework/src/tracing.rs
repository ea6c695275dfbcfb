//! # Observability & Tracing
//!
//! Every lifecycle component carries its own `tracing::Span` (see
//! [`Lifecycle::logger`](crate::component::Lifecycle::logger)). Events emitted
//! from hooks, channel probes and consumer loops are recorded inside that span,
//! so a compact log line already names the component it came from:
//!
//! ```text
//! INFO api_channel{capability="user-management" routing_key=global endpoint=users:9000}: Connectivity changed from=connecting to=available
//! ERROR consumer{consumer_id="web-rest-1" group="web-rest"}: Batch processing failed attempt=1 error=...
//! ```
//!
//! ## Usage Examples
//!
//! ```bash
//! # Lifecycle transitions and startup summary
//! RUST_LOG=info cargo run -p web-rest
//!
//! # Per-operation progress and channel probes
//! RUST_LOG=microservice_framework=debug cargo run -p web-rest
//! ```
//!
//! The framework never installs a subscriber on its own. Binaries call
//! [`setup_tracing`] once; tests that want output call [`try_setup_tracing`].

use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber, filtered by `RUST_LOG`.
///
/// Panics if a global subscriber is already set.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false) // component spans already identify the source
        .compact()
        .init();
}

/// Like [`setup_tracing`] but returns `false` instead of panicking when a
/// subscriber is already installed.
pub fn try_setup_tracing() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}
