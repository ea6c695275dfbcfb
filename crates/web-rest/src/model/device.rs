use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A registered device within one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub token: String,
    pub device_type: String,
    /// Asset the device is currently assigned to, if any.
    #[serde(default)]
    pub asset_token: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Payload for registering a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCreate {
    pub token: String,
    pub device_type: String,
    #[serde(default)]
    pub asset_token: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceRequest {
    Create(DeviceCreate),
    Get { token: String },
    List,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceResponse {
    Created(Device),
    Found(Option<Device>),
    Listed(Vec<Device>),
}
