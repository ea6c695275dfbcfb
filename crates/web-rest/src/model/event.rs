use serde::{Deserialize, Serialize};

/// A single event reported by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    Measurement {
        device_token: String,
        name: String,
        value: f64,
        event_date: u64,
    },
    Location {
        device_token: String,
        latitude: f64,
        longitude: f64,
        event_date: u64,
    },
    Alert {
        device_token: String,
        level: AlertLevel,
        message: String,
        event_date: u64,
    },
}

impl DeviceEvent {
    pub fn device_token(&self) -> &str {
        match self {
            DeviceEvent::Measurement { device_token, .. }
            | DeviceEvent::Location { device_token, .. }
            | DeviceEvent::Alert { device_token, .. } => device_token,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// Broker payload on the `device-events` topic: an event plus the tenant it
/// belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEventEnvelope {
    pub tenant: String,
    pub event: DeviceEvent,
}

/// An event after it was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: String,
    pub event: DeviceEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceEventRequest {
    Add(DeviceEvent),
    ListForDevice { device_token: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceEventResponse {
    Added(StoredEvent),
    Listed(Vec<StoredEvent>),
}
