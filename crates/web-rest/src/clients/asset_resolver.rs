//! # Asset Resolver
//!
//! Looks up assets referenced by devices through the `asset-management`
//! capability. Lookups are cached per tenant; the cache only holds assets that
//! were found, so a missing asset is asked for again next time.
use crate::capabilities::{AssetManagement, AssetManagementApiDemux};
use crate::clients::{ApiClient, ClientError};
use crate::model::{Asset, AssetRequest, AssetResponse, Device};
use microservice_framework::{ApiDemux, RoutingKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

type CacheKey = (String, String);

/// Resolves asset tokens to [`Asset`]s.
#[derive(Clone)]
pub struct AssetResolver {
    inner: Arc<AssetManagementApiDemux>,
    cache: Arc<Mutex<HashMap<CacheKey, Asset>>>,
}

impl AssetResolver {
    pub fn new(inner: Arc<AssetManagementApiDemux>) -> Self {
        Self {
            inner,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, tenant: &str, token: &str) -> Result<Option<Asset>, ClientError> {
        let key = (tenant.to_string(), token.to_string());
        if let Some(asset) = self.cache.lock().get(&key).cloned() {
            debug!("Cache hit");
            return Ok(Some(asset));
        }

        let request = AssetRequest::Get {
            token: token.to_string(),
        };
        let found = match self.invoke(&RoutingKey::tenant(tenant), request).await? {
            AssetResponse::Found(asset) => asset,
            other => return Err(ClientError::unexpected::<AssetManagement>("resolve", &other)),
        };
        if let Some(asset) = &found {
            self.cache.lock().insert(key, asset.clone());
        }
        Ok(found)
    }

    /// The asset `device` is assigned to, if any.
    pub async fn resolve_for_device(&self, tenant: &str, device: &Device) -> Result<Option<Asset>, ClientError> {
        match &device.asset_token {
            Some(token) => self.resolve(tenant, token).await,
            None => Ok(None),
        }
    }

    /// Drops every cached asset.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

impl ApiClient<AssetManagement> for AssetResolver {
    fn inner(&self) -> &ApiDemux<AssetManagement> {
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

    fn truck() -> Asset {
        Asset {
            token: "truck-7".into(),
            name: "Truck 7".into(),
            asset_type: "vehicle".into(),
        }
    }

    #[tokio::test]
    async fn test_found_assets_are_cached() {
        let discovery =
            DiscoveryConfig::default().with_service("asset-management", ServiceAddress::new("assets", 8005));
        let factory = Arc::new(MockTransportFactory::<AssetManagement>::new());
        let mock = factory.transport(&Endpoint::new("assets", 8005));
        // One lookup per token: the second resolve of truck-7 is served from cache.
        mock.expect_send().return_ok(AssetResponse::Found(Some(truck())));
        mock.expect_send().return_ok(AssetResponse::Found(None));

        let demux = ApiDemux::<AssetManagement>::new(
            Arc::new(StaticAddressResolver::new(discovery)),
            factory,
            DemuxSettings::default(),
        );
        let monitor = ProgressMonitor::new("test");
        demux.initialize(&monitor).await.unwrap();
        demux.start(&monitor).await.unwrap();
        let resolver = AssetResolver::new(demux);

        assert_eq!(resolver.resolve("acme", "truck-7").await.unwrap(), Some(truck()));
        assert_eq!(resolver.resolve("acme", "truck-7").await.unwrap(), Some(truck()));
        assert_eq!(resolver.resolve("acme", "crane-1").await.unwrap(), None);

        let unassigned = Device {
            token: "d-1".into(),
            device_type: "tracker".into(),
            asset_token: None,
            metadata: Default::default(),
        };
        assert_eq!(resolver.resolve_for_device("acme", &unassigned).await.unwrap(), None);

        assert_eq!(mock.send_count(), 2);
        mock.verify();
    }
}
