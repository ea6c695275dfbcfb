use serde::{Deserialize, Serialize};

/// A tenant. Its `token` doubles as the routing key for tenant-scoped APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub authorized_user_ids: Vec<String>,
}

/// Payload for creating a new tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantCreate {
    pub token: String,
    pub name: String,
    #[serde(default)]
    pub authorized_user_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TenantRequest {
    Create(TenantCreate),
    Get { token: String },
    List,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TenantResponse {
    Created(Tenant),
    Found(Option<Tenant>),
    Listed(Vec<Tenant>),
}
