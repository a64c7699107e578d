//! Services the host offers to modules.

use crate::terrain::{AuxResource, TerrainInfo};
use crate::cache::CacheDir;
use crate::context::{ModuleContext, RequestHandler};
use crate::error::HostError;
use crate::lifecycle::HostConfig;
use crate::own_thread::ThreadControl;
use crate::request::Request;
use crate::routes::{Protocol, RouteIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Log levels available to modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Receives module log lines. Created by the host process so that modules
/// loaded from shared libraries log through the host's subscriber.
pub type LogSink = Arc<dyn Fn(LogLevel, &str, &str) + Send + Sync>;

fn tracing_sink() -> LogSink {
    Arc::new(|level: LogLevel, module: &str, message: &str| match level {
        LogLevel::Error => error!(target: "geod::module", module, "{}", message),
        LogLevel::Warn => warn!(target: "geod::module", module, "{}", message),
        LogLevel::Info => info!(target: "geod::module", module, "{}", message),
        LogLevel::Debug => debug!(target: "geod::module", module, "{}", message),
        LogLevel::Trace => trace!(target: "geod::module", module, "{}", message),
    })
}

pub struct HostInterface {
    module_config: HashMap<String, HashMap<String, String>>,
    routes: Arc<RouteIndex>,
    cache: CacheDir,
    aux: AuxResource,
    log_sink: LogSink,
    max_routes: usize,
}

impl HostInterface {
    pub fn new(config: &HostConfig, routes: Arc<RouteIndex>, cache: CacheDir, aux: AuxResource) -> Self {
        Self {
            module_config: config.module_config.clone(),
            routes,
            cache,
            aux,
            log_sink: tracing_sink(),
            max_routes: config.max_routes,
        }
    }

    pub fn log(&self, module: &ModuleContext, level: LogLevel, message: &str) {
        (self.log_sink)(level, module.name(), message);
    }

    pub fn config_string(&self, group: &str, key: &str, default: &str) -> String {
        self.module_config
            .get(group)
            .and_then(|g| g.get(key))
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Integer setting; unparsable values fall back to `default`.
    pub fn config_int(&self, group: &str, key: &str, default: i64) -> i64 {
        match self.module_config.get(group).and_then(|g| g.get(key)) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("[module_config.{}] {} = {:?} is not an integer", group, key, raw);
                default
            }),
            None => default,
        }
    }

    /// Claims routes for `module`. Each protocol can be registered once per
    /// module; extra paths beyond the route limit are dropped. Returns how
    /// many paths were recorded.
    pub fn register_routes(&self, module: &ModuleContext, protocol: Protocol, paths: &[&str]) -> usize {
        if module.routes().is_registered(protocol) {
            warn!(
                "Module {} tried to register {} routes twice",
                module.name(),
                protocol
            );
            return 0;
        }

        let mut paths: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        if paths.len() > self.max_routes {
            warn!(
                "Module {} registered {} {} routes; keeping the first {}",
                module.name(),
                paths.len(),
                protocol,
                self.max_routes
            );
            paths.truncate(self.max_routes);
        }

        if protocol == Protocol::Http {
            for path in &paths {
                self.routes.insert(path, module.id());
            }
        }

        let count = paths.len();
        if !module.routes().publish(protocol, paths) {
            return 0;
        }
        debug!("Module {} registered {} {} route(s)", module.name(), count, protocol);
        count
    }

    pub fn set_handler<F>(&self, module: &ModuleContext, protocol: Protocol, handler: F)
    where
        F: Fn(&ModuleContext, &mut Request<'_>) + Send + Sync + 'static,
    {
        let handler: RequestHandler = Arc::new(handler);
        module.set_handler(protocol, handler);
    }

    pub fn spawn_own_thread<F>(&self, module: &ModuleContext, name: &str, body: F) -> Result<(), HostError>
    where
        F: FnOnce(&ThreadControl) + Send + 'static,
    {
        module.threads().spawn(module.name(), name, body)
    }

    pub fn cache(&self) -> &CacheDir {
        &self.cache
    }

    pub fn aux(&self) -> &AuxResource {
        &self.aux
    }

    pub fn routes(&self) -> &RouteIndex {
        &self.routes
    }

    /// Takes a reference on the auxiliary map library, loading it if needed.
    pub fn map_start(&self) -> Result<(), HostError> {
        self.aux.start()
    }

    pub fn map_stop(&self) {
        self.aux.stop()
    }

    pub fn terrain_at(&self, lat: f32, lon: f32) -> Option<TerrainInfo> {
        self.aux.terrain_at(lat, lon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn host(max_routes: usize) -> (HostInterface, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HostConfig {
            max_routes,
            ..HostConfig::default()
        };
        config.module_config.insert(
            "tiles".into(),
            HashMap::from([
                ("zoom".to_string(), "7".to_string()),
                ("style".to_string(), "relief".to_string()),
                ("bad".to_string(), "seven".to_string()),
            ]),
        );
        let cache = CacheDir::new(dir.path(), Duration::from_secs(60));
        let host = HostInterface::new(&config, Arc::new(RouteIndex::new()), cache, AuxResource::disabled());
        (host, dir)
    }

    #[test]
    fn config_lookup_with_defaults() {
        let (host, _dir) = host(8);
        assert_eq!(host.config_string("tiles", "style", "flat"), "relief");
        assert_eq!(host.config_string("tiles", "missing", "flat"), "flat");
        assert_eq!(host.config_string("other", "style", "flat"), "flat");
        assert_eq!(host.config_int("tiles", "zoom", 1), 7);
        assert_eq!(host.config_int("tiles", "bad", 1), 1);
        assert_eq!(host.config_int("tiles", "missing", 3), 3);
    }

    #[test]
    fn routes_are_truncated_and_registered_once() {
        let (host, _dir) = host(2);
        let module = ModuleContext::new(4, "tiles", 1);

        assert_eq!(host.register_routes(&module, Protocol::Http, &["/a", "/b", "/c"]), 2);
        assert_eq!(host.routes().lookup("/a"), Some(4));
        assert_eq!(host.routes().lookup("/c"), None);
        assert_eq!(host.register_routes(&module, Protocol::Http, &["/d"]), 0);
        assert_eq!(module.routes().paths(Protocol::Http).len(), 2);

        assert_eq!(host.register_routes(&module, Protocol::Control, &["tiles purge"]), 1);
        assert!(module.routes().matches(Protocol::Control, "tiles purge"));
    }

    #[test]
    fn handlers_are_stored_per_protocol() {
        let (host, _dir) = host(8);
        let module = ModuleContext::new(0, "m", 1);
        host.set_handler(&module, Protocol::Http, |_, req| {
            let _ = req.send_response(200, "text/plain", b"ok");
        });
        assert!(module.handler(Protocol::Http).is_some());
        assert!(module.handler(Protocol::Ws).is_none());
        module.clear_handlers();
        assert!(module.handler(Protocol::Http).is_none());
    }

    #[test]
    fn map_calls_fail_without_aux_library() {
        let (host, _dir) = host(8);
        assert!(matches!(host.map_start(), Err(HostError::AuxUnavailable)));
        assert!(host.terrain_at(0.0, 0.0).is_none());
    }
}
