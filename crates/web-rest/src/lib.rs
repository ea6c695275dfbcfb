//! # Web/REST Service Library
//!
//! The Web/REST aggregator microservice built on `microservice_framework`. It
//! consumes seven management capabilities through API demuxes and forwards
//! device events from the broker to device-event management.
//!
//! - **[capabilities]**: marker types and demux aliases for every consumed API
//! - **[model]**: request/response payloads per capability
//! - **[clients]**: typed clients over the demuxes
//! - **[consumer]**: the device event broker consumer
//! - **[lifecycle]**: [`WebRestMicroservice`], which wires everything together
//! - **[backends]**: in-memory capability providers for standalone runs and tests
//! - **[config]**: default configuration and the `WEB_REST_CONFIG` loader

pub mod backends;
pub mod capabilities;
pub mod clients;
pub mod config;
pub mod consumer;
pub mod lifecycle;
pub mod model;

pub use lifecycle::{Transports, WebRestMicroservice};
