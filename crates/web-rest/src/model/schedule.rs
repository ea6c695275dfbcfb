use serde::{Deserialize, Serialize};

/// A recurring trigger, e.g. for batch commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub token: String,
    pub name: String,
    /// Cron expression, stored verbatim.
    pub cron: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScheduleRequest {
    Create(Schedule),
    List,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScheduleResponse {
    Created(Schedule),
    Listed(Vec<Schedule>),
}
