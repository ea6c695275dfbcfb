//! # Device Event Consumer
//!
//! Reads [`DeviceEventEnvelope`]s from the `device-events` topic and forwards each
//! event to device-event management on its tenant's channel.
//!
//! Records are forwarded strictly in batch order. The first record that cannot be
//! decoded or forwarded aborts the batch with a [`BatchProcessingError`] carrying
//! that record's index; records after it are left untouched and what happens to
//! the batch is up to the runtime's [`BatchErrorPolicy`](microservice_framework::BatchErrorPolicy).
//!
//! All Web/REST instances join one consumer group, so partitions are shared
//! between instances rather than every instance seeing every event.

use crate::capabilities::DeviceEventManagementApiDemux;
use crate::model::{DeviceEventEnvelope, DeviceEventRequest, DeviceEventResponse};
use async_trait::async_trait;
use microservice_framework::{
    BatchProcessingError, BoxError, BrokerConsumer, ConsumerRecord, Lifecycle, LifecycleComponent,
    LifecycleState, ProgressMonitor, RoutingKey,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Topic carrying inbound device events.
pub const DEVICE_EVENTS_TOPIC: &str = "device-events";

pub struct DeviceEventConsumer {
    lifecycle: Lifecycle,
    consumer_id: String,
    group_id: String,
    events: Arc<DeviceEventManagementApiDemux>,
    forwarded: AtomicU64,
}

impl DeviceEventConsumer {
    /// Creates a consumer in `group_id`. The consumer id is derived from the group
    /// and the component id, so it is unique per instance.
    pub fn new(group_id: impl Into<String>, events: Arc<DeviceEventManagementApiDemux>) -> Arc<Self> {
        let lifecycle = Lifecycle::new("Device Event Consumer");
        let group_id = group_id.into();
        Arc::new(Self {
            consumer_id: format!("{}-{}", group_id, lifecycle.id()),
            lifecycle,
            group_id,
            events,
            forwarded: AtomicU64::new(0),
        })
    }

    /// Number of events successfully handed to device-event management.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::SeqCst)
    }

    fn failed_at(&self, index: usize, source: impl Into<BoxError>) -> BatchProcessingError {
        BatchProcessingError::at(self.consumer_id.clone(), index, source)
    }
}

#[async_trait]
impl LifecycleComponent for DeviceEventConsumer {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn on_start(&self, _monitor: &ProgressMonitor) -> Result<(), BoxError> {
        // Events can only be forwarded once the event API has been brought up.
        if self.events.state() != LifecycleState::Started {
            return Err(format!(
                "{} is {}, not started",
                self.events.name(),
                self.events.state()
            )
            .into());
        }
        info!(parent: self.lifecycle.logger(), consumer_id = %self.consumer_id, "Device event consumer ready");
        Ok(())
    }
}

#[async_trait]
impl BrokerConsumer for DeviceEventConsumer {
    fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    fn consumer_group_id(&self) -> &str {
        &self.group_id
    }

    fn source_topic_names(&self) -> Vec<String> {
        vec![DEVICE_EVENTS_TOPIC.to_string()]
    }

    async fn process_batch(&self, records: &[ConsumerRecord]) -> Result<(), BatchProcessingError> {
        debug!(parent: self.lifecycle.logger(), size = records.len(), "Forwarding batch");
        for (index, record) in records.iter().enumerate() {
            let envelope: DeviceEventEnvelope =
                serde_json::from_slice(&record.payload).map_err(|e| self.failed_at(index, e))?;
            let key = RoutingKey::tenant(envelope.tenant);

            match self.events.invoke(&key, DeviceEventRequest::Add(envelope.event)).await {
                Ok(DeviceEventResponse::Added(stored)) => {
                    self.forwarded.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        parent: self.lifecycle.logger(),
                        routing_key = %key,
                        event_id = %stored.id,
                        offset = record.offset,
                        "Event forwarded"
                    );
                }
                Ok(other) => {
                    return Err(self.failed_at(index, format!("unexpected response: {other:?}")));
                }
                Err(e) => return Err(self.failed_at(index, e)),
            }
        }
        Ok(())
    }
}
