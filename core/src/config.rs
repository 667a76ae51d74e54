//! Gateway configuration.
//!
//! Read once at startup, from a TOML document or from `HEALTH_GATEWAY_*`
//! environment variables, and threaded into the gateway at construction.
//! Every field has a default so an empty document is a valid cloud setup.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::endpoints::ServiceId;
use crate::platform::BackendMode;

pub const ENV_MODE: &str = "HEALTH_GATEWAY_MODE";
pub const ENV_LOCAL_HOST: &str = "HEALTH_GATEWAY_LOCAL_HOST";
pub const ENV_DEVICE_HOST: &str = "HEALTH_GATEWAY_DEVICE_HOST";
pub const ENV_MAX_ATTEMPTS: &str = "HEALTH_GATEWAY_MAX_ATTEMPTS";
pub const ENV_FALLBACK_TO_MOCK: &str = "HEALTH_GATEWAY_FALLBACK_TO_MOCK";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value `{value}` for {name}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}

/// Host and port table used by the base URL resolver.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostSettings {
    /// Loopback name for web and simulator runtimes in local mode.
    pub local_host: String,
    /// LAN host a physical device uses to reach the developer machine.
    pub device_host: String,
    /// Port of each service in the local container stack.
    pub local_ports: BTreeMap<ServiceId, u16>,
    /// Public base URL of each service in cloud mode.
    pub cloud_urls: BTreeMap<ServiceId, String>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            local_host: "localhost".to_string(),
            device_host: "localhost".to_string(),
            local_ports: BTreeMap::from([(ServiceId::ApiGateway, 8004)]),
            cloud_urls: BTreeMap::from([
                (ServiceId::ApiGateway, "https://api.diabetactic.com".to_string()),
                (ServiceId::Tidepool, "https://api.tidepool.org".to_string()),
            ]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub mode: BackendMode,
    pub hosts: HostSettings,
    pub retry: RetrySettings,
    /// Lead time before expiry at which the access token is refreshed.
    pub refresh_skew_secs: u64,
    /// Serve reads from services flagged unavailable through the mock adapter.
    /// Writes to a flagged service fail with `SERVICE_UNAVAILABLE` instead.
    pub fallback_to_mock: bool,
    pub mock_latency_ms: u64,
    /// Background cache sweep period; `None` relies on lazy expiry alone.
    pub cache_sweep_interval_secs: Option<u64>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::Cloud,
            hosts: HostSettings::default(),
            retry: RetrySettings::default(),
            refresh_skew_secs: 300,
            fallback_to_mock: false,
            mock_latency_ms: 0,
            cache_sweep_interval_secs: None,
        }
    }
}

impl GatewayConfig {
    /// Configuration for `mode` with every other field defaulted.
    pub fn for_mode(mode: BackendMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// Fails on malformed TOML, unknown fields, or inconsistent values.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `HEALTH_GATEWAY_*` process environment variables.
    ///
    /// # Errors
    ///
    /// Fails if a variable holds an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Fails if a variable holds an unparseable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = GatewayConfig::default();

        if let Some(value) = lookup(ENV_MODE) {
            config.mode = value.parse().map_err(|_| ConfigError::InvalidValue {
                name: ENV_MODE,
                value,
            })?;
        }
        if let Some(value) = lookup(ENV_LOCAL_HOST) {
            config.hosts.local_host = value;
        }
        if let Some(value) = lookup(ENV_DEVICE_HOST) {
            config.hosts.device_host = value;
        }
        if let Some(value) = lookup(ENV_MAX_ATTEMPTS) {
            config.retry.max_attempts = value.parse().map_err(|_| ConfigError::InvalidValue {
                name: ENV_MAX_ATTEMPTS,
                value,
            })?;
        }
        if let Some(value) = lookup(ENV_FALLBACK_TO_MOCK) {
            config.fallback_to_mock = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: ENV_FALLBACK_TO_MOCK,
                        value,
                    })
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Rejects a zero attempt budget, an inverted backoff range, and cloud
    /// mode without a URL for every service.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.mode == BackendMode::Cloud {
            if let Some(service) = ServiceId::ALL
                .into_iter()
                .find(|s| !self.hosts.cloud_urls.contains_key(s))
            {
                return Err(ConfigError::Invalid(format!(
                    "hosts.cloud_urls has no entry for {service}"
                )));
            }
        }
        Ok(())
    }

    pub fn refresh_skew(&self) -> Duration {
        Duration::from_secs(self.refresh_skew_secs)
    }

    pub fn mock_latency(&self) -> Duration {
        Duration::from_millis(self.mock_latency_ms)
    }

    pub fn cache_sweep_interval(&self) -> Option<Duration> {
        self.cache_sweep_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
