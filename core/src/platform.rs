//! Backend mode and per-platform base URL resolution.
//!
//! # Design
//! The runtime a client runs in decides how it reaches a local backend: a
//! browser or simulator shares the host's loopback, the Android emulator sits
//! behind a NAT and must use the `10.0.2.2` alias, and a physical device needs
//! the developer machine's LAN address. Cloud mode ignores the platform.
//! Resolution is pure; results are memoized because neither the platform nor
//! the mode changes during a process lifetime.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::config::HostSettings;
use crate::endpoints::ServiceId;

/// Loopback alias the Android emulator uses to reach the host machine.
pub const ANDROID_EMULATOR_HOST: &str = "10.0.2.2";

/// Where real requests, if any, are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Every call is answered by the in-process mock adapter.
    Mock,
    /// Containerized backend on the developer machine.
    Local,
    /// Public hosted backend.
    Cloud,
}

impl BackendMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendMode::Mock => "mock",
            BackendMode::Local => "local",
            BackendMode::Cloud => "cloud",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(BackendMode::Mock),
            "local" => Ok(BackendMode::Local),
            "cloud" => Ok(BackendMode::Cloud),
            other => Err(format!("unknown backend mode `{other}`")),
        }
    }
}

/// Runtime classification supplied by the platform collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Web,
    AndroidEmulator,
    AndroidDevice,
    IosSimulator,
    IosDevice,
}

impl Platform {
    pub fn is_physical_device(self) -> bool {
        matches!(self, Platform::AndroidDevice | Platform::IosDevice)
    }
}

/// Source of the current runtime classification.
pub trait PlatformInfo: Send + Sync {
    fn platform(&self) -> Platform;
}

/// Fixed platform, for apps that detect it once at startup and for tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticPlatform(pub Platform);

impl PlatformInfo for StaticPlatform {
    fn platform(&self) -> Platform {
        self.0
    }
}

/// Maps (service, mode, platform) to a base URL.
#[derive(Debug)]
pub struct BaseUrlResolver {
    hosts: HostSettings,
    memo: Mutex<HashMap<(ServiceId, BackendMode, Platform), String>>,
}

impl BaseUrlResolver {
    pub fn new(hosts: HostSettings) -> Self {
        Self {
            hosts,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, service: ServiceId, mode: BackendMode, platform: &dyn PlatformInfo) -> String {
        let platform = platform.platform();
        self.memo
            .lock()
            .entry((service, mode, platform))
            .or_insert_with(|| resolve_base_url(&self.hosts, service, mode, platform))
            .clone()
    }
}

/// Pure resolution table.
pub fn resolve_base_url(hosts: &HostSettings, service: ServiceId, mode: BackendMode, platform: Platform) -> String {
    match (mode, service) {
        // The gateway never dispatches over the network in mock mode.
        (BackendMode::Mock, _) => format!("mock://{service}"),
        // Tidepool is external and has no local container.
        (BackendMode::Cloud, _) | (BackendMode::Local, ServiceId::Tidepool) => cloud_url(hosts, service),
        (BackendMode::Local, _) => {
            let host = match platform {
                Platform::AndroidEmulator => ANDROID_EMULATOR_HOST,
                p if p.is_physical_device() => hosts.device_host.as_str(),
                _ => hosts.local_host.as_str(),
            };
            match hosts.local_ports.get(&service) {
                Some(port) => format!("http://{host}:{port}"),
                None => format!("http://{host}"),
            }
        }
    }
}

fn cloud_url(hosts: &HostSettings, service: ServiceId) -> String {
    hosts
        .cloud_urls
        .get(&service)
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("https://{service}.invalid"))
}
