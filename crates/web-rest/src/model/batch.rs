use serde::{Deserialize, Serialize};

/// A command sent to many devices at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCommand {
    pub command: String,
    pub device_tokens: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Finished,
}

/// Tracks the fan-out of one [`BatchCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperation {
    pub token: String,
    pub command: BatchCommand,
    pub status: BatchStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchRequest {
    Submit(BatchCommand),
    Get { token: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchResponse {
    Submitted(BatchOperation),
    Found(Option<BatchOperation>),
}
