use serde::{Deserialize, Serialize};

/// Something devices can be assigned to (a person, a truck, a building).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub token: String,
    pub name: String,
    pub asset_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssetRequest {
    Create(Asset),
    Get { token: String },
    List,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssetResponse {
    Created(Asset),
    Found(Option<Asset>),
    Listed(Vec<Asset>),
}
