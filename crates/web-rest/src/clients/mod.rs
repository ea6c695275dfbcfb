//! # Typed API Clients
//!
//! Thin, capability-specific wrappers over an [`ApiDemux`]. A client turns
//! `invoke(key, XxxRequest::Get { .. })` plus a match on the response enum into
//! one method call with a typed result.
//!
//! Clients are cheap to clone (they hold an `Arc` to the demux) and never retry:
//! an unavailable API surfaces as [`ClientError::Api`] with
//! [`ApiError::NotAvailable`] inside, distinct from a failed call.

pub mod asset_resolver;
pub mod device_client;
pub mod tenant_client;
pub mod user_client;

pub use asset_resolver::AssetResolver;
pub use device_client::DeviceManagementClient;
pub use tenant_client::TenantManagementClient;
pub use user_client::UserManagementClient;

use async_trait::async_trait;
use microservice_framework::{ApiDemux, ApiError, Capability, RoutingKey};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Errors returned by the typed clients.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("{capability} answered {operation} with an unexpected response: {response}")]
    UnexpectedResponse {
        capability: &'static str,
        operation: &'static str,
        response: String,
    },
}

impl ClientError {
    /// Builds [`ClientError::UnexpectedResponse`] for capability `C`.
    pub fn unexpected<C: Capability>(operation: &'static str, response: &C::Response) -> Self {
        ClientError::UnexpectedResponse {
            capability: C::NAME,
            operation,
            response: format!("{response:?}"),
        }
    }

    /// True when the API was not reachable, as opposed to a failed call.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ClientError::Api(e) if e.is_unavailable())
    }
}

/// Trait for capability-specific clients to inherit the raw call surface.
///
/// Implementors only expose their demux; `invoke` and `wait_until_available`
/// are provided.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Clone)]
/// pub struct ScheduleClient {
///     inner: Arc<ScheduleManagementApiDemux>,
/// }
///
/// impl ApiClient<ScheduleManagement> for ScheduleClient {
///     fn inner(&self) -> &ApiDemux<ScheduleManagement> {
///         &self.inner
///     }
/// }
///
/// // invoke() and wait_until_available() are provided automatically!
/// let response = client.invoke(&RoutingKey::tenant("acme"), ScheduleRequest::List).await?;
/// ```
#[async_trait]
pub trait ApiClient<C: Capability>: Send + Sync {
    /// Access the demux the client routes through.
    fn inner(&self) -> &ApiDemux<C>;

    /// Sends one request on the channel selected by `key`.
    #[tracing::instrument(skip(self, request), fields(capability = C::NAME))]
    async fn invoke(&self, key: &RoutingKey, request: C::Request) -> Result<C::Response, ClientError> {
        tracing::debug!(?request, "Sending request");
        Ok(self.inner().invoke(key, request).await?)
    }

    /// Blocks until the channel for `key` is available.
    #[tracing::instrument(skip(self, cancel), fields(capability = C::NAME))]
    async fn wait_until_available(
        &self,
        key: &RoutingKey,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        Ok(self.inner().wait_for_channel(key, timeout, cancel).await?)
    }
}
