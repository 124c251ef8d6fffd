// Server configuration
//
// Loaded by the binary from JSON; every field has a default so a partial file
// (or none at all) yields a runnable server.

use crate::crypto::{KeyOverrides, SpecialKeyOverride};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for legacy TCP clients
    pub tcp_listen: String,

    /// Listen address for the REST API
    pub http_listen: String,

    /// Active sessions silent this long are evicted
    pub idle_timeout_secs: u64,

    /// Pending sessions that never complete INFO are evicted after this long
    pub pending_timeout_secs: u64,

    /// Interval between idle sweeps
    pub sweep_interval_secs: u64,

    /// How long a REST report request waits for the client's SRSP
    pub request_timeout_secs: u64,

    /// Longest accepted inbound line; longer lines drop the connection
    pub max_line_bytes: usize,

    /// Basic-Auth realm announced on 401
    pub http_realm: String,

    /// Basic-Auth users: name -> password
    pub http_users: BTreeMap<String, String>,

    /// Hand-assigned keys for legacy client classes
    pub key_overrides: Vec<SpecialKeyOverride>,

    /// License serial number
    pub serial_number: Option<String>,

    /// Registration key matching `serial_number`
    pub registration_key: Option<String>,

    /// Directory for daily log files; stdout only when unset
    pub log_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_listen: "0.0.0.0:4000".to_string(),
            http_listen: "0.0.0.0:8080".to_string(),
            idle_timeout_secs: 300,
            pending_timeout_secs: 60,
            sweep_interval_secs: 10,
            request_timeout_secs: 60,
            max_line_bytes: 1024 * 1024,
            http_realm: "Report Server".to_string(),
            http_users: BTreeMap::new(),
            key_overrides: Vec::new(),
            serial_number: None,
            registration_key: None,
            log_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Lookup table built from `key_overrides`
    pub fn overrides(&self) -> KeyOverrides {
        KeyOverrides::new(self.key_overrides.iter().cloned())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            pending_timeout: Duration::from_secs(self.pending_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            max_line_bytes: self.max_line_bytes,
        }
    }
}

/// Runtime settings of the lifecycle manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub idle_timeout: Duration,
    pub pending_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_line_bytes: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ServerConfig::default().manager_config()
    }
}
