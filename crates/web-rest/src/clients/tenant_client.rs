//! # Tenant Management Client
//!
//! Tenants are global. Their tokens become the [`RoutingKey`] for every
//! tenant-scoped API.
use crate::capabilities::{TenantManagement, TenantManagementApiDemux};
use crate::clients::{ApiClient, ClientError};
use crate::model::{Tenant, TenantCreate, TenantRequest, TenantResponse};
use microservice_framework::{ApiDemux, RoutingKey};
use std::sync::Arc;
use tracing::instrument;

/// Client for the tenant-management API.
#[derive(Clone)]
pub struct TenantManagementClient {
    inner: Arc<TenantManagementApiDemux>,
}

impl TenantManagementClient {
    pub fn new(inner: Arc<TenantManagementApiDemux>) -> Self {
        Self { inner }
    }

    #[instrument(skip(self, params), fields(token = %params.token))]
    pub async fn create_tenant(&self, params: TenantCreate) -> Result<Tenant, ClientError> {
        match self.invoke(&RoutingKey::Global, TenantRequest::Create(params)).await? {
            TenantResponse::Created(tenant) => Ok(tenant),
            other => Err(ClientError::unexpected::<TenantManagement>("create_tenant", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_tenant(&self, token: &str) -> Result<Option<Tenant>, ClientError> {
        let request = TenantRequest::Get {
            token: token.to_string(),
        };
        match self.invoke(&RoutingKey::Global, request).await? {
            TenantResponse::Found(tenant) => Ok(tenant),
            other => Err(ClientError::unexpected::<TenantManagement>("get_tenant", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn list_tenants(&self) -> Result<Vec<Tenant>, ClientError> {
        match self.invoke(&RoutingKey::Global, TenantRequest::List).await? {
            TenantResponse::Listed(tenants) => Ok(tenants),
            other => Err(ClientError::unexpected::<TenantManagement>("list_tenants", &other)),
        }
    }

    /// Routing key for calls made on behalf of `tenant`.
    pub fn routing_key(tenant: &Tenant) -> RoutingKey {
        RoutingKey::tenant(tenant.token.clone())
    }
}

impl ApiClient<TenantManagement> for TenantManagementClient {
    fn inner(&self) -> &ApiDemux<TenantManagement> {
        &self.inner
    }
}
