//! # Service Configuration
//!
//! The Web/REST service is configured with a plain
//! [`MicroserviceConfig`] document. [`load_config`] reads it as JSON from the path
//! in `WEB_REST_CONFIG`; without that variable the built-in [`default_config`] is
//! used, which points every capability at `localhost`.
//!
//! ```json
//! {
//!   "identifier": "web-rest",
//!   "dependencies": [
//!     { "capability": "user-management", "wait_on_startup": true },
//!     { "capability": "schedule-management", "require_succeed": false }
//!   ],
//!   "discovery": {
//!     "services": {
//!       "user-management": { "host": "users", "port": 8001 },
//!       "schedule-management": { "host": "schedules", "port": 8007, "tenant_host": "{tenant}.schedules" }
//!     }
//!   }
//! }
//! ```

use crate::capabilities;
use microservice_framework::{
    ConfigError, DependencyConfig, DiscoveryConfig, MicroserviceConfig, ServiceAddress,
};
use std::path::PathBuf;

/// Environment variable holding the configuration file path.
pub const CONFIG_ENV: &str = "WEB_REST_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Built-in configuration: every capability on `localhost`, ports 8001-8007 in
/// [`capabilities::ALL`] order. Users and tenants are awaited on startup; schedule
/// management is optional.
pub fn default_config() -> MicroserviceConfig {
    let mut dependencies = Vec::new();
    let mut discovery = DiscoveryConfig::default();
    for (port, name) in (8001u16..).zip(capabilities::ALL.iter().copied()) {
        let dependency = match name {
            "user-management" | "tenant-management" => DependencyConfig::required(name).wait_on_startup(),
            "schedule-management" => DependencyConfig::optional(name),
            _ => DependencyConfig::required(name),
        };
        dependencies.push(dependency);
        discovery = discovery.with_service(name, ServiceAddress::new("localhost", port));
    }

    MicroserviceConfig {
        name: "Web/REST".to_string(),
        identifier: "web-rest".to_string(),
        dependencies,
        discovery,
        ..MicroserviceConfig::default()
    }
}

/// Loads and validates the configuration named by `WEB_REST_CONFIG`, or the
/// default configuration when the variable is unset.
pub fn load_config() -> Result<MicroserviceConfig, ConfigLoadError> {
    let config = match std::env::var_os(CONFIG_ENV) {
        Some(path) => read_config(PathBuf::from(path))?,
        None => default_config(),
    };
    validate(&config)?;
    Ok(config)
}

fn read_config(path: PathBuf) -> Result<MicroserviceConfig, ConfigLoadError> {
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(source) => return Err(ConfigLoadError::Io { path, source }),
    };
    serde_json::from_str(&text).map_err(|source| ConfigLoadError::Parse { path, source })
}

/// Framework validation plus the service's own rule: every capability it talks to
/// needs a discovery entry, whether or not it is listed as a dependency.
pub fn validate(config: &MicroserviceConfig) -> Result<(), ConfigError> {
    config.validate()?;
    config.validate_capabilities(capabilities::ALL)?;
    match capabilities::ALL
        .iter()
        .find(|name| !config.discovery.services.contains_key(**name))
    {
        Some(name) => Err(ConfigError::MissingAddress(name.to_string())),
        None => Ok(()),
    }
}
