//! # Configuration
//!
//! Plain `serde` structures describing a microservice: which capability APIs it
//! depends on (and how strictly), how long to wait for them, where their providers
//! live, and how its broker consumer behaves. Every field has a default, so a
//! partial document deserializes cleanly.
//!
//! The framework never reads files. Callers hand it a constructed
//! [`MicroserviceConfig`] and call [`MicroserviceConfig::validate`].

use crate::backoff::{BackoffConfig, BackoffPolicy};
use crate::consumer::BatchErrorPolicy;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicroserviceConfig {
    /// Display name, used for logging and the root component.
    pub name: String,
    /// Stable identifier, e.g. `"web-rest"`.
    pub identifier: String,
    pub dependencies: Vec<DependencyConfig>,
    pub api_wait: ApiWaitConfig,
    pub discovery: DiscoveryConfig,
    pub consumer: ConsumerConfig,
}

impl Default for MicroserviceConfig {
    fn default() -> Self {
        Self {
            name: "Microservice".to_string(),
            identifier: "microservice".to_string(),
            dependencies: Vec::new(),
            api_wait: ApiWaitConfig::default(),
            discovery: DiscoveryConfig::default(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl MicroserviceConfig {
    pub fn dependency(&self, capability: &str) -> Option<&DependencyConfig> {
        self.dependencies.iter().find(|d| d.capability == capability)
    }

    /// Checks internal consistency: unique dependencies, an address for each,
    /// and sane numeric settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identifier.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "identifier",
                reason: "must not be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if !seen.insert(dep.capability.as_str()) {
                return Err(ConfigError::DuplicateDependency(dep.capability.clone()));
            }
            if !self.discovery.services.contains_key(&dep.capability) {
                return Err(ConfigError::MissingAddress(dep.capability.clone()));
            }
        }

        check_backoff(&self.api_wait.backoff, "api_wait.backoff", "api_wait.backoff.factor")?;

        if self.consumer.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "consumer.max_batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.consumer.poll_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "consumer.poll_timeout_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if let BatchErrorPolicy::Retry { max_attempts: 0 } = self.consumer.error_policy {
            return Err(ConfigError::InvalidValue {
                field: "consumer.error_policy.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        check_backoff(
            &self.consumer.retry_backoff,
            "consumer.retry_backoff",
            "consumer.retry_backoff.factor",
        )
    }

    /// Rejects dependencies on capabilities outside `known`.
    pub fn validate_capabilities(&self, known: &[&str]) -> Result<(), ConfigError> {
        match self
            .dependencies
            .iter()
            .find(|d| !known.contains(&d.capability.as_str()))
        {
            Some(dep) => Err(ConfigError::UnknownCapability(dep.capability.clone())),
            None => Ok(()),
        }
    }
}

fn check_backoff(
    backoff: &BackoffConfig,
    field: &'static str,
    factor_field: &'static str,
) -> Result<(), ConfigError> {
    if backoff.first_ms == 0 || backoff.max_ms < backoff.first_ms {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!(
                "expected 0 < first_ms <= max_ms, got first_ms={} max_ms={}",
                backoff.first_ms, backoff.max_ms
            ),
        });
    }
    if backoff.factor.is_nan() || backoff.factor < 1.0 {
        return Err(ConfigError::InvalidValue {
            field: factor_field,
            reason: format!("must be >= 1.0, got {}", backoff.factor),
        });
    }
    Ok(())
}

/// One capability API the service depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub capability: String,
    /// Failing to initialize/start this demux aborts service startup.
    #[serde(default = "default_true")]
    pub require_succeed: bool,
    /// Block after start until this API is reachable.
    #[serde(default)]
    pub wait_on_startup: bool,
}

impl DependencyConfig {
    pub fn required(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            require_succeed: true,
            wait_on_startup: false,
        }
    }

    pub fn optional(capability: impl Into<String>) -> Self {
        Self {
            require_succeed: false,
            ..Self::required(capability)
        }
    }

    pub fn wait_on_startup(mut self) -> Self {
        self.wait_on_startup = true;
        self
    }
}

fn default_true() -> bool {
    true
}

/// Settings for blocking waits on API availability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiWaitConfig {
    /// Upper bound for a startup wait. `None` waits until cancelled.
    pub timeout_ms: Option<u64>,
    pub backoff: BackoffConfig,
}

impl Default for ApiWaitConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Some(30_000),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ApiWaitConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        self.backoff.into()
    }
}

/// Where one capability's providers live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
    /// Host template for tenant-scoped instances; `{tenant}` is replaced by the
    /// tenant id.
    #[serde(default)]
    pub tenant_host: Option<String>,
}

impl ServiceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tenant_host: None,
        }
    }

    pub fn with_tenant_host(mut self, template: impl Into<String>) -> Self {
        self.tenant_host = Some(template.into());
        self
    }
}

/// Static service discovery table keyed by capability name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub services: BTreeMap<String, ServiceAddress>,
}

impl DiscoveryConfig {
    pub fn with_service(mut self, capability: impl Into<String>, address: ServiceAddress) -> Self {
        self.services.insert(capability.into(), address);
        self
    }
}

/// Broker consumer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub max_batch_size: usize,
    pub poll_timeout_ms: u64,
    pub error_policy: BatchErrorPolicy,
    /// Backoff between retries under [`BatchErrorPolicy::Retry`].
    pub retry_backoff: BackoffConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            poll_timeout_ms: 500,
            error_policy: BatchErrorPolicy::default(),
            retry_backoff: BackoffConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> MicroserviceConfig {
        MicroserviceConfig {
            dependencies: vec![
                DependencyConfig::required("user-management").wait_on_startup(),
                DependencyConfig::optional("schedule-management"),
            ],
            discovery: DiscoveryConfig::default()
                .with_service("user-management", ServiceAddress::new("users", 9000))
                .with_service("schedule-management", ServiceAddress::new("schedules", 9000)),
            ..MicroserviceConfig::default()
        }
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let cfg: MicroserviceConfig = serde_json::from_str(
            r#"{
                "identifier": "web-rest",
                "dependencies": [{ "capability": "user-management" }],
                "consumer": { "error_policy": { "policy": "retry", "max_attempts": 3 } }
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.name, "Microservice");
        assert!(cfg.dependencies[0].require_succeed);
        assert!(!cfg.dependencies[0].wait_on_startup);
        assert_eq!(cfg.api_wait.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(cfg.consumer.max_batch_size, 100);
        assert_eq!(
            cfg.consumer.error_policy,
            BatchErrorPolicy::Retry { max_attempts: 3 }
        );
    }

    #[test]
    fn test_validate_accepts_consistent_config() {
        assert_eq!(valid().validate(), Ok(()));
        assert_eq!(
            valid().validate_capabilities(&["user-management", "schedule-management"]),
            Ok(())
        );
    }

    #[test]
    fn test_validate_rejects_duplicates_and_missing_addresses() {
        let mut cfg = valid();
        cfg.dependencies.push(DependencyConfig::required("user-management"));
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::DuplicateDependency("user-management".into()))
        );

        let mut cfg = valid();
        cfg.dependencies.push(DependencyConfig::required("asset-management"));
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::MissingAddress("asset-management".into()))
        );
        assert_eq!(
            cfg.validate_capabilities(&["user-management", "schedule-management"]),
            Err(ConfigError::UnknownCapability("asset-management".into()))
        );
    }

    #[test]
    fn test_validate_rejects_bad_numbers() {
        let mut cfg = valid();
        cfg.consumer.max_batch_size = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { field: "consumer.max_batch_size", .. })
        ));

        let mut cfg = valid();
        cfg.api_wait.backoff.factor = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_consumer_timing() {
        let mut cfg = valid();
        cfg.consumer.poll_timeout_ms = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { field: "consumer.poll_timeout_ms", .. })
        ));

        let mut cfg = valid();
        cfg.consumer.retry_backoff.first_ms = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { field: "consumer.retry_backoff", .. })
        ));

        let mut cfg = valid();
        cfg.consumer.retry_backoff.max_ms = cfg.consumer.retry_backoff.first_ms - 1;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.consumer.retry_backoff.factor = f64::NAN;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { field: "consumer.retry_backoff.factor", .. })
        ));
    }
}
