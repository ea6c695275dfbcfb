//! # Framework Errors
//!
//! This module defines the error types used throughout the microservice framework.
//! Each concern gets its own enum so callers can match on exactly what went wrong:
//!
//! - [`LifecycleError`]: a component failed (or refused) an initialize/start/stop.
//! - [`ApiError`]: a capability API was unreachable, timed out, or a call failed.
//! - [`BatchProcessingError`]: a broker consumer could not apply a batch.
//! - [`BrokerError`]: the message broker rejected a subscription or commit.
//! - [`ConfigError`]: the supplied configuration is inconsistent.
//!
//! [`FrameworkError`] wraps all of them for top-level orchestration code.

use crate::channel::ConnectivityState;
use crate::component::{ComponentId, LifecycleAction, LifecycleState};
use crate::demux::RoutingKey;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error returned by lifecycle hooks and external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared error source. Errors are cloned into progress monitors and status
/// reports, so sources are reference counted.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Errors raised by a component's initialize/start/stop.
///
/// Always tagged with the id and name of the component that failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    #[error("component '{name}' ({id}) failed during {action}: {source}")]
    Failed {
        id: ComponentId,
        name: String,
        action: LifecycleAction,
        source: SharedError,
    },
    #[error("component '{name}' ({id}) cannot {action} while {state}")]
    InvalidState {
        id: ComponentId,
        name: String,
        action: LifecycleAction,
        state: LifecycleState,
    },
}

impl LifecycleError {
    /// Id of the component the error is attributed to.
    pub fn component_id(&self) -> ComponentId {
        match self {
            LifecycleError::Failed { id, .. } | LifecycleError::InvalidState { id, .. } => *id,
        }
    }

    /// Display name of the component the error is attributed to.
    pub fn component_name(&self) -> &str {
        match self {
            LifecycleError::Failed { name, .. } | LifecycleError::InvalidState { name, .. } => name,
        }
    }

    /// The lifecycle action that was being performed.
    pub fn action(&self) -> LifecycleAction {
        match self {
            LifecycleError::Failed { action, .. } | LifecycleError::InvalidState { action, .. } => {
                *action
            }
        }
    }
}

/// Errors raised by API channels and demuxes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The channel is not reachable right now. Distinct from a failed call.
    #[error("{capability} API not available for {routing_key} (connectivity: {state})")]
    NotAvailable {
        capability: &'static str,
        routing_key: RoutingKey,
        state: ConnectivityState,
    },
    /// The channel was available but the remote invocation failed.
    #[error("{capability} API call failed for {routing_key}: {source}")]
    Call {
        capability: &'static str,
        routing_key: RoutingKey,
        source: SharedError,
    },
    /// A bounded wait for availability elapsed.
    #[error("timed out after {waited:?} waiting for {capability} API ({routing_key})")]
    Timeout {
        capability: &'static str,
        routing_key: RoutingKey,
        waited: Duration,
    },
    /// A wait for availability was cancelled by the caller (usually shutdown).
    #[error("wait for {capability} API ({routing_key}) was cancelled")]
    Cancelled {
        capability: &'static str,
        routing_key: RoutingKey,
    },
    /// The address resolution collaborator could not locate an instance.
    #[error("unable to resolve {capability} API address for {routing_key}: {source}")]
    Resolution {
        capability: &'static str,
        routing_key: RoutingKey,
        source: SharedError,
    },
    /// A lazily created channel failed to come up.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl ApiError {
    /// True when the error means "not reachable (yet)" rather than a genuine failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ApiError::NotAvailable { .. } | ApiError::Timeout { .. } | ApiError::Cancelled { .. }
        )
    }
}

/// A broker consumer failed to apply a batch.
#[derive(Debug, Clone, thiserror::Error)]
#[error("consumer '{consumer_id}' failed to process batch{}: {source}", describe_index(.record_index))]
pub struct BatchProcessingError {
    pub consumer_id: String,
    /// Index (within the batch) of the record that failed, when known.
    pub record_index: Option<usize>,
    pub source: SharedError,
}

fn describe_index(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!(" at record {i}"),
        None => String::new(),
    }
}

impl BatchProcessingError {
    pub fn new(consumer_id: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            record_index: None,
            source: Arc::from(source.into()),
        }
    }

    /// Error attributed to a specific record of the batch.
    pub fn at(consumer_id: impl Into<String>, record_index: usize, source: impl Into<BoxError>) -> Self {
        Self {
            record_index: Some(record_index),
            ..Self::new(consumer_id, source)
        }
    }
}

/// Errors raised by a message broker collaborator.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum BrokerError {
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
    #[error("Consumer '{0}' subscribed to no topics")]
    EmptySubscription(String),
    #[error("Consumer '{consumer_id}' is not a member of group '{group_id}'")]
    NotMember { group_id: String, consumer_id: String },
    #[error("Consumer '{consumer_id}' is already a member of group '{group_id}'")]
    DuplicateMember { group_id: String, consumer_id: String },
}

/// Errors raised while validating configuration.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Duplicate dependency on capability '{0}'")]
    DuplicateDependency(String),
    #[error("Unknown capability '{0}'")]
    UnknownCapability(String),
    #[error("No address configured for capability '{0}'")]
    MissingAddress(String),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Umbrella error for top-level orchestration.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameworkError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Batch(#[from] BatchProcessingError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
