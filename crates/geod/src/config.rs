//! Configuration file of the geod daemon.
//!
//! Loaded from TOML; every section and key is optional and falls back to the
//! defaults below. A missing file is created with the defaults.

use anyhow::Context;
use geod_host::HostConfig;
use geod_server::{HousekeeperConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub modules: ModuleSettings,
    pub housekeeper: HousekeeperSettings,
    pub aux: AuxSettings,
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
    /// Free-form per-module tables, served through the host configuration lookup.
    pub module_config: HashMap<String, toml::Table>,
}

/// Listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub http_bind: String,
    pub ws_bind: Option<String>,
    pub control_bind: Option<String>,
    pub backlog: u32,
    /// Concurrent connections per listener.
    pub max_connections: usize,
    /// Connection read timeout in seconds.
    pub connection_timeout: u64,
    pub bind_retries: u32,
    pub bind_backoff_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_bind: "127.0.0.1:8080".to_string(),
            ws_bind: None,
            control_bind: None,
            backlog: 128,
            max_connections: 256,
            connection_timeout: 30,
            bind_retries: 10,
            bind_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleSettings {
    pub directory: String,
    pub auto_load: bool,
    /// Seconds a module may stay unused before it is unloaded.
    pub idle_timeout: u64,
    pub lock_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub shutdown_max_retry: u32,
    pub standby_attempts: u32,
    /// Routes per protocol and module.
    pub max_routes: usize,
    pub max_own_threads: usize,
    pub max_modules: usize,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            directory: "plugins".to_string(),
            auto_load: true,
            idle_timeout: 60,
            lock_timeout_ms: 20,
            shutdown_timeout_ms: 100,
            shutdown_max_retry: 5,
            standby_attempts: 3,
            max_routes: 32,
            max_own_threads: 4,
            max_modules: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeeperSettings {
    pub cycle_secs: u64,
    /// Cycles kept in the rolling statistics window.
    pub stats_window: usize,
    pub reap_scan_limit: usize,
    pub aux_idle_timeout: u64,
}

impl Default for HousekeeperSettings {
    fn default() -> Self {
        Self {
            cycle_secs: 5,
            stats_window: 12,
            reap_scan_limit: 128,
            aux_idle_timeout: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuxSettings {
    /// Shared library providing terrain queries.
    pub library: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub directory: String,
    /// Seconds before a cache entry expires.
    pub max_age: u64,
    pub cleanup_on_start: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            directory: "var/cache".to_string(),
            max_age: 3600,
            cleanup_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

fn toml_value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_addr(what: &str, addr: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("invalid {} address: {}", what, addr))
}

impl AppConfig {
    /// Loads the configuration, writing a default file if none exists.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the TOML configuration file
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let binds = [
            ("http_bind", Some(&self.server.http_bind)),
            ("ws_bind", self.server.ws_bind.as_ref()),
            ("control_bind", self.server.control_bind.as_ref()),
        ];
        for (key, addr) in binds {
            if let Some(addr) = addr {
                if addr.parse::<SocketAddr>().is_err() {
                    return Err(format!("Invalid {} address: {}", key, addr));
                }
            }
        }

        if self.server.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        if self.modules.directory.is_empty() {
            return Err("Module directory cannot be empty".to_string());
        }
        if self.modules.lock_timeout_ms == 0 {
            return Err("lock_timeout_ms must be greater than zero".to_string());
        }
        if self.modules.max_modules == 0 {
            return Err("max_modules must be at least 1".to_string());
        }
        if self.housekeeper.cycle_secs == 0 {
            return Err("Housekeeper cycle_secs must be at least 1".to_string());
        }
        if self.housekeeper.stats_window == 0 {
            return Err("Housekeeper stats_window must be at least 1".to_string());
        }
        if self.cache.directory.is_empty() {
            return Err("Cache directory cannot be empty".to_string());
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {LOG_LEVELS:?}",
                &self.logging.level
            ));
        }
        Ok(())
    }

    pub fn to_server_config(&self) -> anyhow::Result<ServerConfig> {
        let module_config = self
            .module_config
            .iter()
            .map(|(group, table)| {
                let values = table
                    .iter()
                    .map(|(k, v)| (k.clone(), toml_value_to_string(v)))
                    .collect();
                (group.clone(), values)
            })
            .collect();

        let host = HostConfig {
            lock_timeout: Duration::from_millis(self.modules.lock_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.modules.shutdown_timeout_ms),
            shutdown_max_retry: self.modules.shutdown_max_retry,
            standby_attempts: self.modules.standby_attempts,
            idle_timeout: Duration::from_secs(self.modules.idle_timeout),
            max_routes: self.modules.max_routes,
            max_own_threads: self.modules.max_own_threads,
            max_modules: self.modules.max_modules,
            cache_dir: PathBuf::from(&self.cache.directory),
            cache_max_age: Duration::from_secs(self.cache.max_age),
            module_config,
        };

        Ok(ServerConfig {
            http_bind: parse_addr("http", &self.server.http_bind)?,
            ws_bind: self
                .server
                .ws_bind
                .as_deref()
                .map(|a| parse_addr("ws", a))
                .transpose()?,
            control_bind: self
                .server
                .control_bind
                .as_deref()
                .map(|a| parse_addr("control", a))
                .transpose()?,
            backlog: self.server.backlog,
            max_connections: self.server.max_connections,
            connection_timeout: self.server.connection_timeout,
            bind_retries: self.server.bind_retries,
            bind_backoff_ms: self.server.bind_backoff_ms,
            plugin_directory: PathBuf::from(&self.modules.directory),
            auto_load: self.modules.auto_load,
            aux_library: self.aux.library.as_ref().map(PathBuf::from),
            cache_cleanup_on_start: self.cache.cleanup_on_start,
            housekeeper: HousekeeperConfig {
                cycle_secs: self.housekeeper.cycle_secs,
                stats_window: self.housekeeper.stats_window,
                reap_scan_limit: self.housekeeper.reap_scan_limit,
                aux_idle_timeout: Duration::from_secs(self.housekeeper.aux_idle_timeout),
            },
            host,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.http_bind, "127.0.0.1:8080");
        assert_eq!(config.modules.idle_timeout, 60);
        assert_eq!(config.housekeeper.stats_window, 12);
        assert!(config.cache.cleanup_on_start);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
[server]
control_bind = "127.0.0.1:9000"

[modules]
idle_timeout = 120
"#,
        )
        .unwrap();
        assert_eq!(config.server.http_bind, "127.0.0.1:8080");
        assert_eq!(config.server.control_bind.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(config.modules.idle_timeout, 120);
        assert_eq!(config.modules.standby_attempts, 3);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn validation_reports_bad_values() {
        let mut config = AppConfig::default();
        config.server.ws_bind = Some("nowhere".to_string());
        assert!(config.validate().unwrap_err().contains("Invalid ws_bind address"));

        let mut config = AppConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().unwrap_err().contains("Invalid log level"));

        let mut config = AppConfig::default();
        config.modules.directory.clear();
        assert!(config.validate().unwrap_err().contains("Module directory"));
    }

    #[test]
    fn conversion_carries_module_config_as_strings() {
        let config: AppConfig = toml::from_str(
            r#"
[server]
http_bind = "0.0.0.0:8081"
ws_bind = "0.0.0.0:8082"

[modules]
lock_timeout_ms = 50

[aux]
library = "/usr/lib/libmapgen.so"

[module_config.hello]
greeting = "hi"
ticks = 3
"#,
        )
        .unwrap();

        let server = config.to_server_config().unwrap();
        assert_eq!(server.http_bind.port(), 8081);
        assert_eq!(server.ws_bind.map(|a| a.port()), Some(8082));
        assert!(server.control_bind.is_none());
        assert_eq!(server.host.lock_timeout, Duration::from_millis(50));
        assert_eq!(server.aux_library, Some(PathBuf::from("/usr/lib/libmapgen.so")));

        let hello = &server.host.module_config["hello"];
        assert_eq!(hello["greeting"], "hi");
        assert_eq!(hello["ticks"], "3");
    }

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geod.toml");

        let config = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(config.server.http_bind, "127.0.0.1:8080");
        assert!(path.exists());

        let reloaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(reloaded.modules.directory, "plugins");
    }

    #[tokio::test]
    async fn existing_file_is_read() {
        let file = NamedTempFile::new().unwrap();
        tokio::fs::write(
            file.path(),
            "[logging]\nlevel = \"debug\"\njson_format = true\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load_from_file(file.path()).await.unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
    }
}
