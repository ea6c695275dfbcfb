//! # Web/REST Service
//!
//! Runs the Web/REST aggregator against in-process backends.
//!
//! ## 🚀 What it does
//!
//! 1. Loads configuration from `WEB_REST_CONFIG` (or the built-in default).
//! 2. Serves every capability from [`LocalBackends`] and boots the service.
//! 3. Creates a tenant, a user and a device through the typed clients.
//! 4. Publishes a device event to the in-memory broker and waits until the
//!    consumer has forwarded it.
//! 5. Reports health and shuts down.
//!
//! ```bash
//! RUST_LOG=info cargo run -p web-rest
//! ```

use microservice_framework::tracing::setup_tracing;
use microservice_framework::InMemoryBroker;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Instrument};
use web_rest::backends::LocalBackends;
use web_rest::consumer::DEVICE_EVENTS_TOPIC;
use web_rest::model::{DeviceCreate, DeviceEvent, DeviceEventEnvelope, TenantCreate, UserCreate};
use web_rest::WebRestMicroservice;

#[tokio::main]
async fn main() -> Result<(), String> {
    // Setup tracing once for the entire application
    setup_tracing();

    let config = web_rest::config::load_config().map_err(|e| e.to_string())?;
    info!(identifier = %config.identifier, "Starting Web/REST service");

    let backends = LocalBackends::new();
    let broker = InMemoryBroker::new();
    broker.create_topic(DEVICE_EVENTS_TOPIC, 4);

    let service = WebRestMicroservice::new(&config, backends.transports(&config), Arc::new(broker.clone()))
        .map_err(|e| e.to_string())?;
    service.boot().await.map_err(|e| e.to_string())?;

    let span = tracing::info_span!("tenant_setup");
    async {
        let tenant = service
            .tenant_client()
            .create_tenant(TenantCreate {
                token: "acme".to_string(),
                name: "Acme Corp".to_string(),
                authorized_user_ids: vec!["alice".to_string()],
            })
            .await
            .map_err(|e| e.to_string())?;
        info!(tenant = %tenant.token, "Tenant created");

        service
            .user_client()
            .create_user(UserCreate::new("alice", "alice@example.com"))
            .await
            .map_err(|e| e.to_string())?;

        service
            .device_client()
            .create_device(
                &tenant.token,
                DeviceCreate {
                    token: "d-1".to_string(),
                    device_type: "thermometer".to_string(),
                    asset_token: None,
                    metadata: Default::default(),
                },
            )
            .await
            .map_err(|e| e.to_string())?;
        info!("Device registered");
        Ok::<_, String>(())
    }
    .instrument(span)
    .await?;

    let envelope = DeviceEventEnvelope {
        tenant: "acme".to_string(),
        event: DeviceEvent::Measurement {
            device_token: "d-1".to_string(),
            name: "temperature".to_string(),
            value: 21.5,
            event_date: 1_700_000_000,
        },
    };
    let payload = serde_json::to_vec(&envelope).map_err(|e| e.to_string())?;
    broker
        .publish(DEVICE_EVENTS_TOPIC, Some("d-1"), payload)
        .map_err(|e| e.to_string())?;

    let forwarded = tokio::time::timeout(Duration::from_secs(5), async {
        while service.consumer().forwarded() == 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    match forwarded {
        Ok(()) => info!(stored = backends.events.stored().len(), "Device event forwarded"),
        Err(_) => error!("Device event was not forwarded in time"),
    }

    let health = service.health();
    info!(health = %serde_json::to_string(&health).unwrap_or_default(), "Service health");

    service.shutdown().await.map_err(|e| e.to_string())?;

    info!("Web/REST service stopped");
    Ok(())
}
