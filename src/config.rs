// Configuration module - exporter settings and their resolution
//
// Every setting resolves in the same order:
// 1. Command-line flag (parsed in main)
// 2. Named environment variable
// 3. Fixed default
//
// This only covers where the exporter finds the cluster and where it
// listens; everything about what to collect lives on the cluster side
// (the rbd_stats_pools mgr option).

use std::env;
use std::net::SocketAddr;
use thiserror::Error;

/// Default path to the cluster configuration file
pub const DEFAULT_CONF: &str = "/etc/ceph/ceph.conf";

/// Default cluster name
pub const DEFAULT_CLUSTER: &str = "ceph";

/// Default path to the admin keyring
pub const DEFAULT_KEYRING: &str = "/etc/ceph/ceph.client.admin.keyring";

/// Default bind host for the metrics endpoint
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default bind port for the metrics endpoint
pub const DEFAULT_PORT: &str = "9280";

/// Errors that can occur while resolving the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid port '{0}': expected an integer between 1 and 65535")]
    InvalidPort(String),

    #[error("invalid bind address '{0}': {1}")]
    InvalidBindAddress(String, std::net::AddrParseError),
}

/// Resolved exporter configuration
///
/// # Environment Variables
/// | field     | variable              | default                               |
/// |-----------|-----------------------|---------------------------------------|
/// | `conf`    | `CEPH_CONF`           | `/etc/ceph/ceph.conf`                 |
/// | `cluster` | `CLUSTER_NAME`        | `ceph`                                |
/// | `keyring` | `CEPH_KEYRING`        | `/etc/ceph/ceph.client.admin.keyring` |
/// | `host`    | `RBD_EXPORTER_SERVER` | `0.0.0.0`                             |
/// | `port`    | `RBD_EXPORTER_PORT`   | `9280`                                |
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Cluster name passed to the cluster CLIs
    pub cluster: String,

    /// Path to the cluster configuration file
    pub conf: String,

    /// Path to the keyring used by the fallback query
    pub keyring: String,

    /// Host the metrics endpoint binds to
    pub host: String,

    /// Port the metrics endpoint binds to
    pub port: u16,
}

impl ExporterConfig {
    /// Builds the configuration from optional flag values, falling back to
    /// environment variables and then the fixed defaults.
    ///
    /// # Arguments
    /// Each argument is the corresponding command-line flag's value, or
    /// `None` if the flag was not given.
    pub fn resolve(
        cluster: Option<String>,
        conf: Option<String>,
        keyring: Option<String>,
        host: Option<String>,
        port: Option<String>,
    ) -> Result<Self, ConfigError> {
        let port = port.unwrap_or_else(|| from_env_or("RBD_EXPORTER_PORT", DEFAULT_PORT));
        let port: u16 = match port.parse() {
            Ok(port) if port > 0 => port,
            _ => return Err(ConfigError::InvalidPort(port)),
        };

        Ok(ExporterConfig {
            cluster: cluster.unwrap_or_else(|| from_env_or("CLUSTER_NAME", DEFAULT_CLUSTER)),
            conf: conf.unwrap_or_else(|| from_env_or("CEPH_CONF", DEFAULT_CONF)),
            keyring: keyring.unwrap_or_else(|| from_env_or("CEPH_KEYRING", DEFAULT_KEYRING)),
            host: host.unwrap_or_else(|| from_env_or("RBD_EXPORTER_SERVER", DEFAULT_HOST)),
            port,
        })
    }

    /// Returns the socket address the metrics endpoint should bind to.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|e| ConfigError::InvalidBindAddress(addr, e))
    }
}

/// Reads an environment variable, falling back to a default.
/// An empty value counts as unset.
fn from_env_or(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}
