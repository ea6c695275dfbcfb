use crate::capabilities::*;
use crate::clients::{AssetResolver, DeviceManagementClient, TenantManagementClient, UserManagementClient};
use crate::consumer::DeviceEventConsumer;
use microservice_framework::{
    AddressResolver, ApiDemux, BrokerConsumer, Capability, ComponentStatus, ConfigError, ConsumerRuntime,
    DemuxSettings, DependencyOptions, FrameworkError, HealthStatus, LifecycleComponent,
    MessageBroker, Microservice, MicroserviceBuilder, MicroserviceConfig, RoutingKey,
    StaticAddressResolver, TransportFactory,
};
use std::sync::Arc;
use tracing::info;

/// One transport factory per capability.
pub struct Transports {
    pub users: Arc<dyn TransportFactory<UserManagement>>,
    pub tenants: Arc<dyn TransportFactory<TenantManagement>>,
    pub devices: Arc<dyn TransportFactory<DeviceManagement>>,
    pub events: Arc<dyn TransportFactory<DeviceEventManagement>>,
    pub assets: Arc<dyn TransportFactory<AssetManagement>>,
    pub batches: Arc<dyn TransportFactory<BatchManagement>>,
    pub schedules: Arc<dyn TransportFactory<ScheduleManagement>>,
}

/// The Web/REST aggregator service.
///
/// Holds the demux for every capability it consumes and the runtime of its device
/// event consumer. Members boot in [`ALL`] order followed by the consumer runtime.
pub struct WebRestMicroservice {
    service: Arc<Microservice>,
    pub users: Arc<UserManagementApiDemux>,
    pub tenants: Arc<TenantManagementApiDemux>,
    pub devices: Arc<DeviceManagementApiDemux>,
    pub events: Arc<DeviceEventManagementApiDemux>,
    pub assets: Arc<AssetManagementApiDemux>,
    pub batches: Arc<BatchManagementApiDemux>,
    pub schedules: Arc<ScheduleManagementApiDemux>,
    consumer: Arc<DeviceEventConsumer>,
    consumer_runtime: Arc<ConsumerRuntime>,
}

impl WebRestMicroservice {
    /// Builds the service from `config`. Nothing is connected until [`boot`](Self::boot).
    pub fn new(
        config: &MicroserviceConfig,
        transports: Transports,
        broker: Arc<dyn MessageBroker>,
    ) -> Result<Self, ConfigError> {
        crate::config::validate(config)?;

        let resolver: Arc<dyn AddressResolver> =
            Arc::new(StaticAddressResolver::new(config.discovery.clone()));
        let settings = DemuxSettings {
            initial_keys: vec![RoutingKey::Global],
            backoff: config.api_wait.backoff_policy(),
            ..DemuxSettings::default()
        };

        let users = ApiDemux::new(resolver.clone(), transports.users, settings.clone());
        let tenants = ApiDemux::new(resolver.clone(), transports.tenants, settings.clone());
        let devices = ApiDemux::new(resolver.clone(), transports.devices, settings.clone());
        let events = ApiDemux::new(resolver.clone(), transports.events, settings.clone());
        let assets = ApiDemux::new(resolver.clone(), transports.assets, settings.clone());
        let batches = ApiDemux::new(resolver.clone(), transports.batches, settings.clone());
        let schedules = ApiDemux::new(resolver, transports.schedules, settings);

        // All instances share the service identifier as their consumer group.
        let consumer = DeviceEventConsumer::new(config.identifier.clone(), events.clone());
        let consumer_runtime = ConsumerRuntime::new(consumer.clone(), broker, config.consumer.clone());

        let options = |capability: &str| {
            config
                .dependency(capability)
                .map(DependencyOptions::from)
                .unwrap_or_else(DependencyOptions::required)
        };
        let service = MicroserviceBuilder::from_config(config)
            .dependency(users.clone(), options(UserManagement::NAME))
            .dependency(tenants.clone(), options(TenantManagement::NAME))
            .dependency(devices.clone(), options(DeviceManagement::NAME))
            .dependency(events.clone(), options(DeviceEventManagement::NAME))
            .dependency(assets.clone(), options(AssetManagement::NAME))
            .dependency(batches.clone(), options(BatchManagement::NAME))
            .dependency(schedules.clone(), options(ScheduleManagement::NAME))
            .component(
                consumer_runtime.clone(),
                options(DeviceEventManagement::NAME).require_succeed,
            )
            .build();

        info!(identifier = %config.identifier, consumer_id = %consumer.consumer_id(), "Web/REST service assembled");
        Ok(Self {
            service,
            users,
            tenants,
            devices,
            events,
            assets,
            batches,
            schedules,
            consumer,
            consumer_runtime,
        })
    }

    pub fn service(&self) -> &Arc<Microservice> {
        &self.service
    }

    pub fn consumer(&self) -> &Arc<DeviceEventConsumer> {
        &self.consumer
    }

    pub fn consumer_runtime(&self) -> &Arc<ConsumerRuntime> {
        &self.consumer_runtime
    }

    pub async fn boot(&self) -> Result<(), FrameworkError> {
        self.service.boot().await
    }

    pub async fn shutdown(&self) -> Result<(), FrameworkError> {
        self.service.shutdown().await
    }

    pub fn health(&self) -> HealthStatus {
        self.service.health()
    }

    /// Component tree with per-member state, for diagnostics.
    pub fn status(&self) -> ComponentStatus {
        self.service.status()
    }

    // --- Typed Clients ---

    pub fn user_client(&self) -> UserManagementClient {
        UserManagementClient::new(self.users.clone())
    }

    pub fn tenant_client(&self) -> TenantManagementClient {
        TenantManagementClient::new(self.tenants.clone())
    }

    pub fn device_client(&self) -> DeviceManagementClient {
        DeviceManagementClient::new(self.devices.clone())
    }

    pub fn asset_resolver(&self) -> AssetResolver {
        AssetResolver::new(self.assets.clone())
    }
}
