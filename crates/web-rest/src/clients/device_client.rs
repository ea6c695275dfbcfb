//! # Device Management Client
//!
//! Devices live inside a tenant: every call takes the tenant token and is routed
//! to that tenant's channel.
use crate::capabilities::{DeviceManagement, DeviceManagementApiDemux};
use crate::clients::{ApiClient, ClientError};
use crate::model::{Device, DeviceCreate, DeviceRequest, DeviceResponse};
use microservice_framework::{ApiDemux, RoutingKey};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Client for the device-management API.
#[derive(Clone)]
pub struct DeviceManagementClient {
    inner: Arc<DeviceManagementApiDemux>,
}

impl DeviceManagementClient {
    pub fn new(inner: Arc<DeviceManagementApiDemux>) -> Self {
        Self { inner }
    }

    #[instrument(skip(self, params), fields(device = %params.token))]
    pub async fn create_device(&self, tenant: &str, params: DeviceCreate) -> Result<Device, ClientError> {
        debug!(?params, "create_device called");
        match self
            .invoke(&RoutingKey::tenant(tenant), DeviceRequest::Create(params))
            .await?
        {
            DeviceResponse::Created(device) => Ok(device),
            other => Err(ClientError::unexpected::<DeviceManagement>("create_device", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_device(&self, tenant: &str, token: &str) -> Result<Option<Device>, ClientError> {
        let request = DeviceRequest::Get {
            token: token.to_string(),
        };
        match self.invoke(&RoutingKey::tenant(tenant), request).await? {
            DeviceResponse::Found(device) => Ok(device),
            other => Err(ClientError::unexpected::<DeviceManagement>("get_device", &other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn list_devices(&self, tenant: &str) -> Result<Vec<Device>, ClientError> {
        match self.invoke(&RoutingKey::tenant(tenant), DeviceRequest::List).await? {
            DeviceResponse::Listed(devices) => Ok(devices),
            other => Err(ClientError::unexpected::<DeviceManagement>("list_devices", &other)),
        }
    }
}

impl ApiClient<DeviceManagement> for DeviceManagementClient {
    fn inner(&self) -> &ApiDemux<DeviceManagement> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microservice_framework::mock::MockTransportFactory;
    use microservice_framework::{
        DemuxSettings, DiscoveryConfig, Endpoint, LifecycleComponent, ProgressMonitor, ServiceAddress,
        StaticAddressResolver,
    };

    #[tokio::test]
    async fn test_calls_route_to_tenant_channel() {
        let discovery = DiscoveryConfig::default().with_service(
            "device-management",
            ServiceAddress::new("devices", 8003).with_tenant_host("devices-{tenant}"),
        );
        let factory = Arc::new(MockTransportFactory::<DeviceManagement>::new());
        let acme = factory.transport(&Endpoint::new("devices-acme", 8003));
        acme.expect_send().return_ok(DeviceResponse::Listed(Vec::new()));

        let demux = ApiDemux::<DeviceManagement>::new(
            Arc::new(StaticAddressResolver::new(discovery)),
            factory.clone(),
            DemuxSettings::default(),
        );
        let monitor = ProgressMonitor::new("test");
        demux.initialize(&monitor).await.unwrap();
        demux.start(&monitor).await.unwrap();

        let client = DeviceManagementClient::new(demux.clone());
        assert!(client.list_devices("acme").await.unwrap().is_empty());

        acme.verify();
        let global = factory.transport(&Endpoint::new("devices", 8003));
        assert_eq!(global.send_count(), 0);
        assert_eq!(demux.routing_keys(), vec![RoutingKey::Global, RoutingKey::tenant("acme")]);
    }
}
