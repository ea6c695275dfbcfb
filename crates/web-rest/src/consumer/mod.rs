//! # Broker Consumers
//!
//! Consumers hosted by the Web/REST service. Each one is a
//! [`BrokerConsumer`](microservice_framework::BrokerConsumer) driven by a
//! [`ConsumerRuntime`](microservice_framework::ConsumerRuntime) that the service
//! registers as a member.

pub mod device_events;

pub use device_events::{DeviceEventConsumer, DEVICE_EVENTS_TOPIC};
