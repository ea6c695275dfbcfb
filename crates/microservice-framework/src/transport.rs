//! # Capabilities & Transports
//!
//! A [`Capability`] names one domain-management API and fixes its request and
//! response types. Everything below the demux is generic over the capability, so
//! there is exactly one channel type and one demux type for all of them.
//!
//! The transport is an injected collaborator: an [`ApiTransport`] exposes
//! `send(request) -> response` plus a connectivity signal (`probe`), and a
//! [`TransportFactory`] builds one transport per resolved [`Endpoint`].
//!
//! [`LocalTransportFactory`] is the in-process implementation: requests are
//! dispatched straight to a registered [`CapabilityHandler`], and availability is a
//! switch that tests and the sample service can flip at runtime.

use crate::channel::ConnectivityState;
use crate::error::BoxError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A capability API: its name and its call surface.
pub trait Capability: Send + Sync + 'static {
    /// Stable capability name, e.g. `"device-management"`.
    const NAME: &'static str;
    type Request: Send + fmt::Debug + 'static;
    type Response: Send + fmt::Debug + 'static;
}

/// Resolved address of one capability provider instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Call transport for one endpoint of capability `C`.
#[async_trait]
pub trait ApiTransport<C: Capability>: Send + Sync {
    /// Opens the underlying connection.
    async fn connect(&self) -> Result<(), BoxError>;

    /// Releases the underlying connection. Must be safe to call more than once.
    async fn disconnect(&self) -> Result<(), BoxError>;

    /// Connectivity signal: is the remote side reachable right now?
    ///
    /// An `Err` means the probe itself could not be carried out.
    async fn probe(&self) -> Result<ConnectivityState, BoxError>;

    async fn send(&self, request: C::Request) -> Result<C::Response, BoxError>;
}

/// Builds a transport bound to a resolved endpoint.
pub trait TransportFactory<C: Capability>: Send + Sync {
    fn create(&self, endpoint: &Endpoint) -> Arc<dyn ApiTransport<C>>;
}

/// Server side of an in-process capability.
#[async_trait]
pub trait CapabilityHandler<C: Capability>: Send + Sync {
    async fn handle(&self, request: C::Request) -> Result<C::Response, BoxError>;
}

/// Error returned by [`LocalTransport`] when no handler answers.
#[derive(Debug, thiserror::Error)]
pub enum LocalTransportError {
    #[error("no {capability} handler registered at {endpoint}")]
    NoHandler {
        capability: &'static str,
        endpoint: Endpoint,
    },
    #[error("{capability} handler at {endpoint} is unavailable")]
    Unavailable {
        capability: &'static str,
        endpoint: Endpoint,
    },
    #[error("transport to {0} is not connected")]
    NotConnected(Endpoint),
}

struct LocalBackend<C: Capability> {
    handler: Arc<dyn CapabilityHandler<C>>,
    available: Arc<AtomicBool>,
}

impl<C: Capability> Clone for LocalBackend<C> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            available: self.available.clone(),
        }
    }
}

/// In-process transport dispatching to a [`CapabilityHandler`].
pub struct LocalTransport<C: Capability> {
    endpoint: Endpoint,
    backend: Option<LocalBackend<C>>,
    connected: AtomicBool,
}

impl<C: Capability> LocalTransport<C> {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn reachable(&self) -> bool {
        self.backend
            .as_ref()
            .is_some_and(|b| b.available.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl<C: Capability> ApiTransport<C> for LocalTransport<C> {
    async fn connect(&self) -> Result<(), BoxError> {
        self.connected.store(true, Ordering::SeqCst);
        debug!(capability = C::NAME, endpoint = %self.endpoint, "Local transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BoxError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self) -> Result<ConnectivityState, BoxError> {
        if self.is_connected() && self.reachable() {
            Ok(ConnectivityState::Available)
        } else {
            Ok(ConnectivityState::Unavailable)
        }
    }

    async fn send(&self, request: C::Request) -> Result<C::Response, BoxError> {
        if !self.is_connected() {
            return Err(LocalTransportError::NotConnected(self.endpoint.clone()).into());
        }
        let backend = self.backend.as_ref().ok_or_else(|| LocalTransportError::NoHandler {
            capability: C::NAME,
            endpoint: self.endpoint.clone(),
        })?;
        if !backend.available.load(Ordering::SeqCst) {
            return Err(LocalTransportError::Unavailable {
                capability: C::NAME,
                endpoint: self.endpoint.clone(),
            }
            .into());
        }
        backend.handler.handle(request).await
    }
}

/// Registry of in-process handlers keyed by endpoint.
pub struct LocalTransportFactory<C: Capability> {
    backends: Mutex<HashMap<Endpoint, LocalBackend<C>>>,
    _capability: PhantomData<fn() -> C>,
}

impl<C: Capability> Default for LocalTransportFactory<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Capability> LocalTransportFactory<C> {
    pub fn new() -> Self {
        Self {
            backends: Mutex::new(HashMap::new()),
            _capability: PhantomData,
        }
    }

    /// Serves `handler` at `endpoint`. Registered handlers start out available.
    pub fn register(&self, endpoint: Endpoint, handler: Arc<dyn CapabilityHandler<C>>) {
        self.backends.lock().insert(
            endpoint,
            LocalBackend {
                handler,
                available: Arc::new(AtomicBool::new(true)),
            },
        );
    }

    /// Flips availability of the handler at `endpoint`. Returns false if nothing is
    /// registered there.
    pub fn set_available(&self, endpoint: &Endpoint, available: bool) -> bool {
        match self.backends.lock().get(endpoint) {
            Some(backend) => {
                backend.available.store(available, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

impl<C: Capability> TransportFactory<C> for LocalTransportFactory<C> {
    fn create(&self, endpoint: &Endpoint) -> Arc<dyn ApiTransport<C>> {
        let backend = self.backends.lock().get(endpoint).cloned();
        Arc::new(LocalTransport {
            endpoint: endpoint.clone(),
            backend,
            connected: AtomicBool::new(false),
        })
    }
}
