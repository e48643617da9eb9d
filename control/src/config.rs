//! Configuration for the routesync controller
//!
//! Process-wide settings, loaded once at startup and handed to the
//! reconciler. Nothing in here is read per reconciliation.

use k8s_openapi::api::core::v1::ConfigMap;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {var}: {reason}")]
    InvalidValue {
        var: String,
        value: String,
        reason: String,
    },

    #[error("Invalid global config reference '{0}', expected <namespace>/<name>")]
    InvalidConfigMapRef(String),
}

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Gateway admin API connection
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Retry directives
    #[serde(default)]
    pub retry: RetryConfig,

    /// Address of the /metrics and /healthz listener
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    /// Namespace to watch (None = all namespaces)
    pub watch_namespace: Option<String>,

    /// ConfigMap holding cluster-wide gateway settings
    pub global_config: Option<ConfigMapRef>,
}

/// Gateway admin API connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Base admin URL, routes live under `{admin_url}/routes/{id}`
    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    /// Value of the `X-API-KEY` header (empty = header not sent)
    #[serde(default)]
    pub admin_key: String,

    /// Per-request timeout in seconds (default: 10s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Retry directives returned to the work queue
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// After a failed PUT (default: 60s)
    #[serde(default = "default_apply_failure")]
    pub apply_failure_secs: u64,

    /// After a failed DELETE (default: 900s)
    #[serde(default = "default_delete_failure")]
    pub delete_failure_secs: u64,

    /// After a store or other transient error (default: 15s)
    #[serde(default = "default_error")]
    pub error_secs: u64,

    /// After an optimistic concurrency conflict (default: 1s)
    #[serde(default = "default_conflict")]
    pub conflict_secs: u64,
}

/// Reference to a namespaced ConfigMap
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ConfigMapRef {
    pub namespace: String,
    pub name: String,
}

impl ConfigMapRef {
    /// Parse `<namespace>/<name>`
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(ConfigError::InvalidConfigMapRef(value.to_string())),
        }
    }
}

fn default_admin_url() -> String {
    "http://127.0.0.1:9180/apisix/admin".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_apply_failure() -> u64 {
    60
}

fn default_delete_failure() -> u64 {
    15 * 60
}

fn default_error() -> u64 {
    15
}

fn default_conflict() -> u64 {
    1
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            admin_url: default_admin_url(),
            admin_key: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            apply_failure_secs: default_apply_failure(),
            delete_failure_secs: default_delete_failure(),
            error_secs: default_error(),
            conflict_secs: default_conflict(),
        }
    }
}

impl RetryConfig {
    pub fn apply_failure(&self) -> Duration {
        Duration::from_secs(self.apply_failure_secs)
    }

    pub fn delete_failure(&self) -> Duration {
        Duration::from_secs(self.delete_failure_secs)
    }

    pub fn error(&self) -> Duration {
        Duration::from_secs(self.error_secs)
    }

    pub fn conflict(&self) -> Duration {
        Duration::from_secs(self.conflict_secs)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            retry: RetryConfig::default(),
            metrics_addr: default_metrics_addr(),
            watch_namespace: None,
            global_config: None,
        }
    }
}

/// ConfigMap key overriding the admin URL
pub const GLOBAL_ADMIN_URL_KEY: &str = "adminUrl";
/// ConfigMap key overriding the admin key
pub const GLOBAL_ADMIN_KEY_KEY: &str = "adminKey";

impl ControllerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("ROUTESYNC_ADMIN_URL") {
            config.gateway.admin_url = val;
        }
        if let Some(val) = lookup("ROUTESYNC_ADMIN_KEY") {
            config.gateway.admin_key = val;
        }
        if let Some(secs) = parse_secs(&lookup, "ROUTESYNC_REQUEST_TIMEOUT_SECS")? {
            config.gateway.request_timeout_secs = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "ROUTESYNC_APPLY_RETRY_SECS")? {
            config.retry.apply_failure_secs = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "ROUTESYNC_DELETE_RETRY_SECS")? {
            config.retry.delete_failure_secs = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "ROUTESYNC_ERROR_RETRY_SECS")? {
            config.retry.error_secs = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "ROUTESYNC_CONFLICT_RETRY_SECS")? {
            config.retry.conflict_secs = secs;
        }
        if let Some(val) = lookup("ROUTESYNC_METRICS_ADDR") {
            config.metrics_addr = val;
        }
        if let Some(val) = lookup("ROUTESYNC_WATCH_NAMESPACE").filter(|v| !v.is_empty()) {
            config.watch_namespace = Some(val);
        }
        if let Some(val) = lookup("ROUTESYNC_GLOBAL_CONFIG").filter(|v| !v.is_empty()) {
            config.global_config = Some(ConfigMapRef::parse(&val)?);
        }

        Ok(config)
    }

    /// Override gateway settings from the cluster-wide ConfigMap.
    ///
    /// Returns true if any setting changed.
    pub fn apply_config_map(&mut self, config_map: &ConfigMap) -> bool {
        let Some(data) = &config_map.data else {
            return false;
        };

        let mut changed = false;
        if let Some(url) = data.get(GLOBAL_ADMIN_URL_KEY).filter(|v| !v.is_empty()) {
            self.gateway.admin_url = url.clone();
            changed = true;
        }
        if let Some(key) = data.get(GLOBAL_ADMIN_KEY_KEY) {
            self.gateway.admin_key = key.clone();
            changed = true;
        }
        changed
    }
}

fn parse_secs<F>(lookup: &F, var: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                var: var.to_string(),
                value,
                reason: e.to_string(),
            }),
    }
}
