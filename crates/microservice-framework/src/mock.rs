//! # Mock Framework & Testing Guide
//!
//! The `MockTransport<C>` type implements the same [`ApiTransport`] API as a real
//! transport but operates entirely in memory. It lets you set expectations and
//! return values for unit tests, and lets you flip the provider's connectivity at
//! any point, so channel and demux logic can be tested without any backend.
//!
//! ## When to use Mocks vs Local Transports
//!
//! | Feature | MockTransport | LocalTransportFactory |
//! |---------|---------------|-----------------------|
//! | **Speed** | Instant (in-memory) | Instant (in-process handler) |
//! | **Responses** | Scripted (expectations) | Computed by a real handler |
//! | **Failure injection** | `return_err`, `fail_connect`, `fail_probe` | Availability switch only |
//! | **Use Case** | Channel/demux behavior, error paths | Full service wiring |
//!
//! ## Testing Strategies
//!
//! <details>
//! <summary><b>Pattern 0: Channel Logic Test (Pure Mock)</b></summary>
//!
//! ```rust
//! use microservice_framework::mock::MockTransport;
//! use microservice_framework::{
//!     ApiChannel, BackoffPolicy, Capability, Endpoint, LifecycleComponent,
//!     ProgressMonitor, RoutingKey,
//! };
//!
//! struct Users;
//! impl Capability for Users {
//!     const NAME: &'static str = "user-management";
//!     type Request = String;
//!     type Response = u32;
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     // 1. Setup Mocks
//!     let mock = MockTransport::<Users>::new();
//!     mock.expect_send().return_ok(42);
//!
//!     // 2. Create Channel with Mocks
//!     let channel = ApiChannel::new(
//!         RoutingKey::Global,
//!         Endpoint::new("users", 8080),
//!         mock.transport(),
//!         BackoffPolicy::default(),
//!     );
//!     channel.initialize(&ProgressMonitor::new("test")).await.unwrap();
//!
//!     // 3. Test Logic
//!     assert_eq!(channel.invoke("admin".into()).await.unwrap(), 42);
//!     mock.verify();
//! }
//! ```
//! </details>
//!
//! <details>
//! <summary><b>Pattern 1: Demux with Mocked Providers</b></summary>
//!
//! Register a [`MockTransportFactory`] with an `ApiDemux` and fetch per-endpoint
//! mocks with [`MockTransportFactory::transport`] to script each provider. See
//! `tests/integration_test.rs` for the full startup scenarios.
//! </details>
//!
//! <details>
//! <summary><b>Pattern 2: Ordering Tests with Recording Components</b></summary>
//!
//! [`RecordingComponent`] appends `"<action> <name>"` to a shared [`CallLog`] every
//! time one of its hooks runs, and can be told to fail a given action. Use it to
//! assert step ordering and failure propagation.
//! </details>

use crate::channel::ConnectivityState;
use crate::component::{Lifecycle, LifecycleAction, LifecycleComponent};
use crate::error::BoxError;
use crate::monitor::ProgressMonitor;
use crate::transport::{ApiTransport, Capability, Endpoint, TransportFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

// =============================================================================
// EXPECTATION BUILDER API
// =============================================================================

type SendExpectation<C> = Result<<C as Capability>::Response, String>;

struct MockState<C: Capability> {
    expectations: Mutex<VecDeque<SendExpectation<C>>>,
    connectivity: Mutex<ConnectivityState>,
    connect_error: Mutex<Option<String>>,
    probe_error: Mutex<Option<String>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    probes: AtomicUsize,
    sends: AtomicUsize,
}

/// A mock transport with expectation tracking for fluent testing.
///
/// Clones share state, so a test can keep one handle while the channel owns
/// another.
///
/// # Example
/// ```ignore
/// let mock = MockTransport::<Users>::new();
/// mock.expect_send().return_ok(user);
/// mock.set_connectivity(ConnectivityState::Unavailable);
///
/// let transport = mock.transport();
/// // Hand the transport to a channel...
/// mock.verify(); // Ensures all expectations were met
/// ```
pub struct MockTransport<C: Capability> {
    state: Arc<MockState<C>>,
}

impl<C: Capability> Clone for MockTransport<C> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<C: Capability> Default for MockTransport<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Capability> MockTransport<C> {
    /// Creates a mock with no expectations whose provider is reachable once connected.
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                expectations: Mutex::new(VecDeque::new()),
                connectivity: Mutex::new(ConnectivityState::Available),
                connect_error: Mutex::new(None),
                probe_error: Mutex::new(None),
                connected: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
                sends: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the transport for use in tests.
    pub fn transport(&self) -> Arc<dyn ApiTransport<C>> {
        Arc::new(self.clone())
    }

    /// Expects a `send` call.
    pub fn expect_send(&self) -> SendExpectationBuilder<C> {
        SendExpectationBuilder {
            state: self.state.clone(),
        }
    }

    /// Sets what `probe` reports while connected.
    pub fn set_connectivity(&self, state: ConnectivityState) {
        *self.state.connectivity.lock() = state;
    }

    /// Makes every subsequent `connect` fail with `message`.
    pub fn fail_connect(&self, message: &str) {
        *self.state.connect_error.lock() = Some(message.to_string());
    }

    /// Makes every subsequent `probe` fail with `message`.
    pub fn fail_probe(&self, message: &str) {
        *self.state.probe_error.lock() = Some(message.to_string());
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn send_count(&self) -> usize {
        self.state.sends.load(Ordering::SeqCst)
    }

    /// Verifies that all expectations were met.
    pub fn verify(&self) {
        let exps = self.state.expectations.lock();
        if !exps.is_empty() {
            panic!("Not all expectations were met. {} remaining", exps.len());
        }
    }
}

#[async_trait]
impl<C: Capability> ApiTransport<C> for MockTransport<C> {
    async fn connect(&self) -> Result<(), BoxError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.state.connect_error.lock().clone() {
            return Err(message.into());
        }
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BoxError> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self) -> Result<ConnectivityState, BoxError> {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.state.probe_error.lock().clone() {
            return Err(message.into());
        }
        if !self.is_connected() {
            return Ok(ConnectivityState::Unavailable);
        }
        Ok(*self.state.connectivity.lock())
    }

    async fn send(&self, _request: C::Request) -> Result<C::Response, BoxError> {
        self.state.sends.fetch_add(1, Ordering::SeqCst);
        let expectation = self.state.expectations.lock().pop_front();
        match expectation {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(message.into()),
            None => panic!("Unexpected send to {} mock transport", C::NAME),
        }
    }
}

/// Builder for `send` expectations.
pub struct SendExpectationBuilder<C: Capability> {
    state: Arc<MockState<C>>,
}

impl<C: Capability> SendExpectationBuilder<C> {
    /// Sets the expectation to return a successful response.
    pub fn return_ok(self, response: C::Response) {
        self.state.expectations.lock().push_back(Ok(response));
    }

    /// Sets the expectation to return a transport error.
    pub fn return_err(self, message: &str) {
        self.state.expectations.lock().push_back(Err(message.to_string()));
    }
}

/// Hands out one [`MockTransport`] per endpoint.
pub struct MockTransportFactory<C: Capability> {
    transports: Mutex<HashMap<Endpoint, MockTransport<C>>>,
    created: AtomicUsize,
}

impl<C: Capability> Default for MockTransportFactory<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Capability> MockTransportFactory<C> {
    pub fn new() -> Self {
        Self {
            transports: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// The mock serving `endpoint`, created on first use.
    pub fn transport(&self, endpoint: &Endpoint) -> MockTransport<C> {
        self.transports
            .lock()
            .entry(endpoint.clone())
            .or_default()
            .clone()
    }

    /// Number of transports handed to channels so far.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl<C: Capability> TransportFactory<C> for MockTransportFactory<C> {
    fn create(&self, endpoint: &Endpoint) -> Arc<dyn ApiTransport<C>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.transport(endpoint).transport()
    }
}

// =============================================================================
// RECORDING COMPONENTS
// =============================================================================

/// Shared, ordered log of hook invocations.
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// A lifecycle component that records every hook it runs.
pub struct RecordingComponent {
    lifecycle: Lifecycle,
    log: CallLog,
    fail_on: Option<LifecycleAction>,
}

impl RecordingComponent {
    pub fn call_log() -> CallLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    pub fn new(name: &str, log: &CallLog) -> Self {
        Self {
            lifecycle: Lifecycle::new(name),
            log: log.clone(),
            fail_on: None,
        }
    }

    /// Makes the hook for `action` fail after it has been recorded.
    pub fn fail_on(mut self, action: LifecycleAction) -> Self {
        self.fail_on = Some(action);
        self
    }

    fn record(&self, action: LifecycleAction) -> Result<(), BoxError> {
        self.log.lock().push(format!("{} {}", action, self.lifecycle.name()));
        if self.fail_on == Some(action) {
            return Err(format!("{} refused to {}", self.lifecycle.name(), action).into());
        }
        Ok(())
    }
}

#[async_trait]
impl LifecycleComponent for RecordingComponent {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn on_initialize(&self, _monitor: &ProgressMonitor) -> Result<(), BoxError> {
        self.record(LifecycleAction::Initialize)
    }

    async fn on_start(&self, _monitor: &ProgressMonitor) -> Result<(), BoxError> {
        self.record(LifecycleAction::Start)
    }

    async fn on_stop(&self, _monitor: &ProgressMonitor) -> Result<(), BoxError> {
        self.record(LifecycleAction::Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Capability for Echo {
        const NAME: &'static str = "echo";
        type Request = ();
        type Response = &'static str;
    }

    #[tokio::test]
    async fn test_expectations_are_consumed_in_order() {
        let mock = MockTransport::<Echo>::new();
        mock.expect_send().return_ok("first");
        mock.expect_send().return_err("second failed");

        let transport = mock.transport();
        assert_eq!(transport.send(()).await.unwrap(), "first");
        assert!(transport.send(()).await.is_err());
        mock.verify();
    }

    #[tokio::test]
    #[should_panic(expected = "Not all expectations were met")]
    async fn test_verify_panics_on_unmet_expectation() {
        let mock = MockTransport::<Echo>::new();
        mock.expect_send().return_ok("never sent");
        mock.verify();
    }

    #[tokio::test]
    async fn test_factory_shares_mock_per_endpoint() {
        let factory = MockTransportFactory::<Echo>::new();
        let endpoint = Endpoint::new("echo", 1);
        factory.transport(&endpoint).set_connectivity(ConnectivityState::Unavailable);

        let transport = factory.create(&endpoint);
        transport.connect().await.unwrap();
        assert_eq!(transport.probe().await.unwrap(), ConnectivityState::Unavailable);
        assert_eq!(factory.created_count(), 1);
        assert!(factory.transport(&endpoint).is_connected());
    }
}
