use async_trait::async_trait;
use microservice_framework::{
    ApiDemux, ApiError, BatchErrorPolicy, BatchProcessingError, BoxError, BrokerConsumer, Capability,
    CapabilityHandler, ConnectivityState, ConsumerConfig, ConsumerRecord, ConsumerRuntime,
    DemuxSettings, DependencyOptions, DiscoveryConfig, Endpoint, FrameworkError, HealthStatus,
    InMemoryBroker, Lifecycle, LifecycleComponent, LifecycleState, LocalTransportFactory,
    MicroserviceBuilder, ProgressMonitor, RoutingKey, ServiceAddress, StaticAddressResolver,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// --- Test Capabilities ---

struct UserManagement;
struct TenantManagement;
struct ScheduleManagement;

impl Capability for UserManagement {
    const NAME: &'static str = "user-management";
    type Request = String;
    type Response = String;
}

impl Capability for TenantManagement {
    const NAME: &'static str = "tenant-management";
    type Request = String;
    type Response = String;
}

impl Capability for ScheduleManagement {
    const NAME: &'static str = "schedule-management";
    type Request = String;
    type Response = String;
}

/// Answers every request with `"<host>:<request>"`.
struct HostEcho(&'static str);

#[async_trait]
impl<C> CapabilityHandler<C> for HostEcho
where
    C: Capability<Request = String, Response = String>,
{
    async fn handle(&self, request: String) -> Result<String, BoxError> {
        Ok(format!("{}:{}", self.0, request))
    }
}

fn discovery() -> DiscoveryConfig {
    DiscoveryConfig::default()
        .with_service(
            "user-management",
            ServiceAddress::new("users", 9000).with_tenant_host("{tenant}.users"),
        )
        .with_service("tenant-management", ServiceAddress::new("tenants", 9000))
        .with_service("schedule-management", ServiceAddress::new("schedules", 9000))
}

fn demux<C>(transports: Arc<LocalTransportFactory<C>>) -> Arc<ApiDemux<C>>
where
    C: Capability<Request = String, Response = String>,
{
    ApiDemux::<C>::new(
        Arc::new(StaticAddressResolver::new(discovery())),
        transports,
        DemuxSettings::default(),
    )
}

fn serving<C>(host: &'static str) -> Arc<LocalTransportFactory<C>>
where
    C: Capability<Request = String, Response = String>,
{
    let transports = Arc::new(LocalTransportFactory::<C>::new());
    transports.register(Endpoint::new(host, 9000), Arc::new(HostEcho(host)));
    transports
}

// --- Microservice Scenarios ---

#[tokio::test(start_paused = true)]
async fn test_optional_unavailable_api_degrades_but_boots() {
    let users = demux(serving::<UserManagement>("users"));
    let tenants = demux(serving::<TenantManagement>("tenants"));

    let schedule_transports = serving::<ScheduleManagement>("schedules");
    schedule_transports.set_available(&Endpoint::new("schedules", 9000), false);
    let schedules = demux(schedule_transports.clone());

    let service = MicroserviceBuilder::new("Web/REST")
        .api_wait_timeout(Some(Duration::from_secs(2)))
        .dependency(users.clone(), DependencyOptions::required().wait_on_startup())
        .dependency(tenants.clone(), DependencyOptions::required().wait_on_startup())
        .dependency(schedules.clone(), DependencyOptions::optional().wait_on_startup())
        .build();

    service.boot().await.expect("boot succeeds without the optional API");

    assert_eq!(service.state(), LifecycleState::Started);
    assert_eq!(
        service.api_connectivity("schedule-management"),
        Some(ConnectivityState::Unavailable)
    );
    assert_eq!(
        service.health(),
        HealthStatus::Degraded {
            reasons: vec!["schedule-management API is unavailable".to_string()]
        }
    );

    // Required APIs keep serving while the optional one is down.
    assert_eq!(users.invoke_global("alice".into()).await.unwrap(), "users:alice");
    let err = schedules.invoke_global("nightly".into()).await.unwrap_err();
    assert!(matches!(err, ApiError::NotAvailable { .. }));

    // Recovery is observed by the next wait.
    schedule_transports.set_available(&Endpoint::new("schedules", 9000), true);
    service
        .api("schedule-management")
        .unwrap()
        .wait_until_available(&RoutingKey::Global, Some(Duration::from_secs(10)), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(service.health(), HealthStatus::Healthy);

    service.shutdown().await.unwrap();
    assert_eq!(schedules.connectivity(&RoutingKey::Global), ConnectivityState::Unknown);
    assert_eq!(service.state(), LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_required_api_failure_aborts_boot_and_rolls_back() {
    let tenants = demux(serving::<TenantManagement>("tenants"));
    // No address for user-management: the demux cannot create its global channel.
    let users = ApiDemux::<UserManagement>::new(
        Arc::new(StaticAddressResolver::new(DiscoveryConfig::default())),
        serving::<UserManagement>("users"),
        DemuxSettings::default(),
    );
    let schedules = demux(serving::<ScheduleManagement>("schedules"));

    let service = MicroserviceBuilder::new("Web/REST")
        .dependency(tenants.clone(), DependencyOptions::required())
        .dependency(users.clone(), DependencyOptions::required())
        .dependency(schedules.clone(), DependencyOptions::optional())
        .build();

    let err = service.boot().await.unwrap_err();
    assert!(matches!(err, FrameworkError::Lifecycle(_)));
    assert!(err.to_string().contains("user-management API demux"), "{err}");

    assert_eq!(tenants.state(), LifecycleState::Stopped, "rolled back");
    assert_eq!(users.state(), LifecycleState::Error);
    assert_eq!(schedules.state(), LifecycleState::Created, "never reached");
    assert!(!service.health().is_serving());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_startup_wait() {
    let schedule_transports = serving::<ScheduleManagement>("schedules");
    schedule_transports.set_available(&Endpoint::new("schedules", 9000), false);
    let schedules = demux(schedule_transports);

    let service = MicroserviceBuilder::new("Scheduler")
        .api_wait_timeout(None)
        .dependency(schedules, DependencyOptions::required().wait_on_startup())
        .build();

    let booting = tokio::spawn({
        let service = service.clone();
        async move { service.boot().await }
    });
    tokio::time::sleep(Duration::from_secs(60)).await;
    service.shutdown().await.unwrap();

    let err = booting.await.unwrap().unwrap_err();
    assert!(matches!(err, FrameworkError::Api(ApiError::Cancelled { .. })), "{err}");
}

#[tokio::test(start_paused = true)]
async fn test_required_api_timeout_stops_members() {
    let tenants = demux(serving::<TenantManagement>("tenants"));
    let user_transports = serving::<UserManagement>("users");
    user_transports.set_available(&Endpoint::new("users", 9000), false);
    let users = demux(user_transports);

    let service = MicroserviceBuilder::new("Web/REST")
        .api_wait_timeout(Some(Duration::from_secs(2)))
        .dependency(tenants.clone(), DependencyOptions::required())
        .dependency(users.clone(), DependencyOptions::required().wait_on_startup())
        .build();

    let err = service.boot().await.unwrap_err();
    assert!(matches!(err, FrameworkError::Api(ApiError::Timeout { .. })), "{err}");

    assert_eq!(service.state(), LifecycleState::Error);
    assert!(matches!(service.health(), HealthStatus::Unhealthy { .. }));
    assert_eq!(tenants.state(), LifecycleState::Stopped);
    assert_eq!(users.state(), LifecycleState::Stopped);
    assert!(tenants.invoke_global("acme".into()).await.is_err());

    service.shutdown().await.unwrap();
    assert_eq!(service.state(), LifecycleState::Stopped);
}

// --- Demux Routing ---

#[tokio::test]
async fn test_tenant_keys_route_to_distinct_channels() {
    let transports = Arc::new(LocalTransportFactory::<UserManagement>::new());
    transports.register(Endpoint::new("users", 9000), Arc::new(HostEcho("users")));
    transports.register(Endpoint::new("acme.users", 9000), Arc::new(HostEcho("acme")));
    transports.register(Endpoint::new("globex.users", 9000), Arc::new(HostEcho("globex")));
    let users = demux(transports);

    let monitor = ProgressMonitor::new("routing");
    users.initialize(&monitor).await.unwrap();
    users.start(&monitor).await.unwrap();

    let acme = RoutingKey::tenant("acme");
    let globex = RoutingKey::tenant("globex");
    assert_eq!(users.invoke(&acme, "a".into()).await.unwrap(), "acme:a");
    assert_eq!(users.invoke(&globex, "b".into()).await.unwrap(), "globex:b");
    assert_eq!(users.invoke_global("c".into()).await.unwrap(), "users:c");

    let first = users.channel(&acme).await.unwrap();
    let again = users.channel(&acme).await.unwrap();
    let other = users.channel(&globex).await.unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(
        users.routing_keys(),
        vec![RoutingKey::Global, acme.clone(), globex.clone()]
    );
    assert_eq!(first.state(), LifecycleState::Started);

    users.stop(&monitor).await.unwrap();
    assert_eq!(first.state(), LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_channel_times_out_after_deadline() {
    let transports = serving::<UserManagement>("users");
    transports.set_available(&Endpoint::new("users", 9000), false);
    let users = demux(transports);
    let monitor = ProgressMonitor::new("timeout");
    users.initialize(&monitor).await.unwrap();
    users.start(&monitor).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = users
        .wait_for_channel(&RoutingKey::Global, Some(Duration::from_secs(3)), &CancellationToken::new())
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, ApiError::Timeout { .. }), "{err}");
    assert!(waited >= Duration::from_secs(3), "returned early after {waited:?}");
    assert!(waited < Duration::from_millis(3100), "overshot: {waited:?}");
}

// --- Broker Consumer ---

struct DeviceEventSink {
    lifecycle: Lifecycle,
    applied: Mutex<Vec<String>>,
}

impl DeviceEventSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            lifecycle: Lifecycle::new("Device Event Sink"),
            applied: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LifecycleComponent for DeviceEventSink {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

#[async_trait]
impl BrokerConsumer for DeviceEventSink {
    fn consumer_id(&self) -> &str {
        "sink-1"
    }

    fn consumer_group_id(&self) -> &str {
        "group-1"
    }

    fn source_topic_names(&self) -> Vec<String> {
        vec!["device-events".to_string()]
    }

    async fn process_batch(&self, records: &[ConsumerRecord]) -> Result<(), BatchProcessingError> {
        for (index, record) in records.iter().enumerate() {
            let text = String::from_utf8_lossy(&record.payload).to_string();
            if text == "m2" {
                return Err(BatchProcessingError::at("sink-1", index, "unparseable measurement"));
            }
            self.applied.lock().push(text);
        }
        Ok(())
    }
}

fn three_message_broker() -> Arc<InMemoryBroker> {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic("device-events", 1);
    for payload in ["m1", "m2", "m3"] {
        broker.publish("device-events", None, payload).unwrap();
    }
    broker
}

fn consumer_settings(policy: BatchErrorPolicy) -> ConsumerConfig {
    ConsumerConfig {
        poll_timeout_ms: 20,
        error_policy: policy,
        ..ConsumerConfig::default()
    }
}

#[tokio::test]
async fn test_failing_record_halts_consumer_without_commit() {
    let broker = three_message_broker();
    let sink = DeviceEventSink::new();
    let runtime = ConsumerRuntime::new(sink.clone(), broker.clone(), consumer_settings(BatchErrorPolicy::Halt));
    let monitor = ProgressMonitor::new("consumer");

    runtime.initialize(&monitor).await.unwrap();
    runtime.start(&monitor).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), runtime.wait_for_halt())
        .await
        .expect("receive loop halts");

    let error = runtime.last_batch_error().expect("error is reported");
    assert_eq!(error.consumer_id, "sink-1");
    assert_eq!(error.record_index, Some(1));
    assert_eq!(sink.applied.lock().as_slice(), ["m1"]);
    assert_eq!(broker.committed("group-1", "device-events", 0), None);
    assert_eq!(runtime.state(), LifecycleState::Error);
    assert!(!runtime.is_receiving());

    runtime.stop(&monitor).await.unwrap();
    assert!(broker.members("group-1").is_empty());
}

#[tokio::test]
async fn test_failing_record_is_skipped_and_committed() {
    let broker = three_message_broker();
    let sink = DeviceEventSink::new();
    let runtime = ConsumerRuntime::new(sink.clone(), broker.clone(), consumer_settings(BatchErrorPolicy::Skip));
    let monitor = ProgressMonitor::new("consumer");

    runtime.initialize(&monitor).await.unwrap();
    runtime.start(&monitor).await.unwrap();

    for _ in 0..400 {
        if broker.committed("group-1", "device-events", 0) == Some(3) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(broker.committed("group-1", "device-events", 0), Some(3));
    assert_eq!(runtime.last_batch_error().and_then(|e| e.record_index), Some(1));
    // The consumer aborted at m2, so m3 was never applied even though the batch
    // was committed.
    assert_eq!(sink.applied.lock().as_slice(), ["m1"]);
    let stats = runtime.stats();
    assert_eq!(stats.batches_failed, 1);
    assert_eq!(stats.batches_skipped, 1);
    assert_eq!(runtime.state(), LifecycleState::Started);
    assert!(runtime.is_receiving());

    runtime.stop(&monitor).await.unwrap();
    assert_eq!(runtime.state(), LifecycleState::Stopped);
    assert_eq!(sink.state(), LifecycleState::Stopped);
}
