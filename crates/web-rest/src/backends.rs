//! # In-Process Backends
//!
//! Minimal in-memory implementations of the seven management capabilities, served
//! through [`LocalTransportFactory`]. The binary uses them so the service can run
//! standalone; integration tests use them as real (if tiny) providers.
//!
//! Each backend keeps its state in a map behind a mutex and generates ids from an
//! atomic counter (`event_1`, `batch_2`, ...). They know nothing about tenants: a
//! backend registered at a tenant-scoped endpoint simply is that tenant's
//! instance.

use crate::capabilities::*;
use crate::model::*;
use crate::lifecycle::Transports;
use async_trait::async_trait;
use microservice_framework::{
    BoxError, CapabilityHandler, Endpoint, LocalTransportFactory, MicroserviceConfig,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn next_id(counter: &AtomicU64, prefix: &str) -> String {
    format!("{}_{}", prefix, counter.fetch_add(1, Ordering::SeqCst) + 1)
}

#[derive(Default)]
pub struct InMemoryUsers {
    users: Mutex<BTreeMap<String, User>>,
}

#[async_trait]
impl CapabilityHandler<UserManagement> for InMemoryUsers {
    async fn handle(&self, request: UserRequest) -> Result<UserResponse, BoxError> {
        let mut users = self.users.lock();
        Ok(match request {
            UserRequest::Create(params) => {
                if users.contains_key(&params.username) {
                    return Err(format!("user '{}' already exists", params.username).into());
                }
                let user = User::from(params);
                users.insert(user.username.clone(), user.clone());
                UserResponse::Created(user)
            }
            UserRequest::Get { username } => UserResponse::Found(users.get(&username).cloned()),
            UserRequest::List => UserResponse::Listed(users.values().cloned().collect()),
            UserRequest::Delete { username } => UserResponse::Deleted(users.remove(&username)),
        })
    }
}

#[derive(Default)]
pub struct InMemoryTenants {
    tenants: Mutex<BTreeMap<String, Tenant>>,
}

#[async_trait]
impl CapabilityHandler<TenantManagement> for InMemoryTenants {
    async fn handle(&self, request: TenantRequest) -> Result<TenantResponse, BoxError> {
        let mut tenants = self.tenants.lock();
        Ok(match request {
            TenantRequest::Create(params) => {
                let tenant = Tenant {
                    token: params.token,
                    name: params.name,
                    authorized_user_ids: params.authorized_user_ids,
                };
                tenants.insert(tenant.token.clone(), tenant.clone());
                TenantResponse::Created(tenant)
            }
            TenantRequest::Get { token } => TenantResponse::Found(tenants.get(&token).cloned()),
            TenantRequest::List => TenantResponse::Listed(tenants.values().cloned().collect()),
        })
    }
}

#[derive(Default)]
pub struct InMemoryDevices {
    devices: Mutex<BTreeMap<String, Device>>,
}

#[async_trait]
impl CapabilityHandler<DeviceManagement> for InMemoryDevices {
    async fn handle(&self, request: DeviceRequest) -> Result<DeviceResponse, BoxError> {
        let mut devices = self.devices.lock();
        Ok(match request {
            DeviceRequest::Create(params) => {
                let device = Device {
                    token: params.token,
                    device_type: params.device_type,
                    asset_token: params.asset_token,
                    metadata: params.metadata,
                };
                devices.insert(device.token.clone(), device.clone());
                DeviceResponse::Created(device)
            }
            DeviceRequest::Get { token } => DeviceResponse::Found(devices.get(&token).cloned()),
            DeviceRequest::List => DeviceResponse::Listed(devices.values().cloned().collect()),
        })
    }
}

/// Stores events in arrival order. Rejects events for devices listed in
/// `rejected_devices`, which lets tests inject a failing record.
#[derive(Default)]
pub struct InMemoryDeviceEvents {
    events: Mutex<Vec<StoredEvent>>,
    ids: AtomicU64,
    rejected_devices: Mutex<Vec<String>>,
}

impl InMemoryDeviceEvents {
    pub fn reject_device(&self, device_token: impl Into<String>) {
        self.rejected_devices.lock().push(device_token.into());
    }

    pub fn stored(&self) -> Vec<StoredEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl CapabilityHandler<DeviceEventManagement> for InMemoryDeviceEvents {
    async fn handle(&self, request: DeviceEventRequest) -> Result<DeviceEventResponse, BoxError> {
        match request {
            DeviceEventRequest::Add(event) => {
                if self.rejected_devices.lock().iter().any(|d| d == event.device_token()) {
                    return Err(format!("events from device '{}' are rejected", event.device_token()).into());
                }
                let stored = StoredEvent {
                    id: next_id(&self.ids, "event"),
                    event,
                };
                self.events.lock().push(stored.clone());
                Ok(DeviceEventResponse::Added(stored))
            }
            DeviceEventRequest::ListForDevice { device_token } => Ok(DeviceEventResponse::Listed(
                self.events
                    .lock()
                    .iter()
                    .filter(|e| e.event.device_token() == device_token)
                    .cloned()
                    .collect(),
            )),
        }
    }
}

#[derive(Default)]
pub struct InMemoryAssets {
    assets: Mutex<BTreeMap<String, Asset>>,
}

#[async_trait]
impl CapabilityHandler<AssetManagement> for InMemoryAssets {
    async fn handle(&self, request: AssetRequest) -> Result<AssetResponse, BoxError> {
        let mut assets = self.assets.lock();
        Ok(match request {
            AssetRequest::Create(asset) => {
                assets.insert(asset.token.clone(), asset.clone());
                AssetResponse::Created(asset)
            }
            AssetRequest::Get { token } => AssetResponse::Found(assets.get(&token).cloned()),
            AssetRequest::List => AssetResponse::Listed(assets.values().cloned().collect()),
        })
    }
}

#[derive(Default)]
pub struct InMemoryBatches {
    operations: Mutex<BTreeMap<String, BatchOperation>>,
    ids: AtomicU64,
}

#[async_trait]
impl CapabilityHandler<BatchManagement> for InMemoryBatches {
    async fn handle(&self, request: BatchRequest) -> Result<BatchResponse, BoxError> {
        Ok(match request {
            BatchRequest::Submit(command) => {
                let operation = BatchOperation {
                    token: next_id(&self.ids, "batch"),
                    command,
                    status: BatchStatus::Pending,
                };
                self.operations
                    .lock()
                    .insert(operation.token.clone(), operation.clone());
                BatchResponse::Submitted(operation)
            }
            BatchRequest::Get { token } => BatchResponse::Found(self.operations.lock().get(&token).cloned()),
        })
    }
}

#[derive(Default)]
pub struct InMemorySchedules {
    schedules: Mutex<Vec<Schedule>>,
}

#[async_trait]
impl CapabilityHandler<ScheduleManagement> for InMemorySchedules {
    async fn handle(&self, request: ScheduleRequest) -> Result<ScheduleResponse, BoxError> {
        let mut schedules = self.schedules.lock();
        Ok(match request {
            ScheduleRequest::Create(schedule) => {
                schedules.push(schedule.clone());
                ScheduleResponse::Created(schedule)
            }
            ScheduleRequest::List => ScheduleResponse::Listed(schedules.clone()),
        })
    }
}

/// One in-memory backend per capability, registered at the global address each
/// capability has in a [`MicroserviceConfig`].
#[derive(Default)]
pub struct LocalBackends {
    pub users: Arc<InMemoryUsers>,
    pub tenants: Arc<InMemoryTenants>,
    pub devices: Arc<InMemoryDevices>,
    pub events: Arc<InMemoryDeviceEvents>,
    pub assets: Arc<InMemoryAssets>,
    pub batches: Arc<InMemoryBatches>,
    pub schedules: Arc<InMemorySchedules>,
}

impl LocalBackends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds local transport factories serving these backends. Capabilities
    /// without a discovery entry get an empty factory, so their channels never
    /// become available.
    pub fn transports(&self, config: &MicroserviceConfig) -> Transports {
        Transports {
            users: serve::<UserManagement>(config, self.users.clone()),
            tenants: serve::<TenantManagement>(config, self.tenants.clone()),
            devices: serve::<DeviceManagement>(config, self.devices.clone()),
            events: serve::<DeviceEventManagement>(config, self.events.clone()),
            assets: serve::<AssetManagement>(config, self.assets.clone()),
            batches: serve::<BatchManagement>(config, self.batches.clone()),
            schedules: serve::<ScheduleManagement>(config, self.schedules.clone()),
        }
    }
}

fn serve<C: microservice_framework::Capability>(
    config: &MicroserviceConfig,
    handler: Arc<dyn CapabilityHandler<C>>,
) -> Arc<LocalTransportFactory<C>> {
    let factory = Arc::new(LocalTransportFactory::<C>::new());
    if let Some(address) = config.discovery.services.get(C::NAME) {
        factory.register(Endpoint::new(address.host.clone(), address.port), handler);
    }
    factory
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_backend_rejects_flagged_devices() {
        let events = InMemoryDeviceEvents::default();
        events.reject_device("broken");
        let ok = DeviceEvent::Location {
            device_token: "d-1".into(),
            latitude: 33.75,
            longitude: -84.39,
            event_date: 1,
        };
        let bad = DeviceEvent::Alert {
            device_token: "broken".into(),
            level: AlertLevel::Critical,
            message: "overheated".into(),
            event_date: 2,
        };

        let stored = events.handle(DeviceEventRequest::Add(ok)).await.unwrap();
        assert!(matches!(stored, DeviceEventResponse::Added(StoredEvent { ref id, .. }) if id == "event_1"));
        assert!(events.handle(DeviceEventRequest::Add(bad)).await.is_err());
        assert_eq!(events.stored().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_user_is_rejected() {
        let users = InMemoryUsers::default();
        users
            .handle(UserRequest::Create(UserCreate::new("alice", "a@example.com")))
            .await
            .unwrap();
        let err = users
            .handle(UserRequest::Create(UserCreate::new("alice", "b@example.com")))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "user 'alice' already exists");
    }
}
