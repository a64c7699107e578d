//! Server configuration types and defaults.

use geod_host::{HostConfig, Protocol};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Settings of the periodic maintenance thread.
#[derive(Debug, Clone)]
pub struct HousekeeperConfig {
    /// Seconds between maintenance cycles.
    pub cycle_secs: u64,
    /// Number of cycles kept in the rolling statistics window.
    pub stats_window: usize,
    /// Maximum connection contexts examined per listener and cycle.
    pub reap_scan_limit: usize,
    pub aux_idle_timeout: Duration,
}

impl Default for HousekeeperConfig {
    fn default() -> Self {
        Self {
            cycle_secs: 5,
            stats_window: 12,
            reap_scan_limit: 128,
            aux_idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_bind: SocketAddr,
    pub ws_bind: Option<SocketAddr>,
    pub control_bind: Option<SocketAddr>,
    pub backlog: u32,
    /// Concurrent connections allowed per listener.
    pub max_connections: usize,
    /// Read timeout of a connection, in seconds.
    pub connection_timeout: u64,
    pub bind_retries: u32,
    pub bind_backoff_ms: u64,
    pub plugin_directory: PathBuf,
    pub auto_load: bool,
    pub aux_library: Option<PathBuf>,
    pub cache_cleanup_on_start: bool,
    pub housekeeper: HousekeeperConfig,
    pub host: HostConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            ws_bind: None,
            control_bind: None,
            backlog: 128,
            max_connections: 256,
            connection_timeout: 30,
            bind_retries: 10,
            bind_backoff_ms: 500,
            plugin_directory: PathBuf::from("plugins"),
            auto_load: true,
            aux_library: None,
            cache_cleanup_on_start: true,
            housekeeper: HousekeeperConfig::default(),
            host: HostConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Every configured listener, HTTP first.
    pub fn listeners(&self) -> Vec<(Protocol, SocketAddr)> {
        let mut listeners = vec![(Protocol::Http, self.http_bind)];
        if let Some(addr) = self.ws_bind {
            listeners.push((Protocol::Ws, addr));
        }
        if let Some(addr) = self.control_bind {
            listeners.push((Protocol::Control, addr));
        }
        listeners
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout.max(1))
    }
}
