//! Server orchestration: binds the listeners, runs the accept loop and the
//! housekeeper, and performs the orderly shutdown.

use crate::config::ServerConfig;
use crate::dispatcher;
use crate::error::ServerError;
use crate::housekeeper::Housekeeper;
use crate::listener::{bind_with_retry, ListenerSocket};
use crate::shutdown::ShutdownSignal;
use geod_host::{AuxResource, DylibAuxLoader, DylibLoader, ModuleLoader, Protocol, Registry};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// State every worker, the housekeeper and the built-in handlers share.
pub struct ServerShared {
    pub registry: Arc<Registry>,
    pub listeners: Vec<Arc<ListenerSocket>>,
    pub shutdown: ShutdownSignal,
    pub config: ServerConfig,
    pub started_at: Instant,
}

impl ServerShared {
    pub fn new(registry: Arc<Registry>, listeners: Vec<Arc<ListenerSocket>>, config: ServerConfig) -> Self {
        Self {
            registry,
            listeners,
            shutdown: ShutdownSignal::new(),
            config,
            started_at: Instant::now(),
        }
    }

    fn with_signal(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn alive_connections(&self) -> usize {
        self.listeners.iter().map(|l| l.connections().alive()).sum()
    }
}

pub struct GeodServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    shutdown: ShutdownSignal,
}

impl GeodServer {
    /// Creates a server loading modules from the configured plugin directory.
    pub fn new(config: ServerConfig) -> Self {
        let loader: Arc<dyn ModuleLoader> = Arc::new(DylibLoader::new(&config.plugin_directory));
        let aux = match &config.aux_library {
            Some(path) => AuxResource::new(Box::new(DylibAuxLoader::new(path))),
            None => AuxResource::disabled(),
        };
        Self::with_loader(config, loader, aux)
    }

    /// Creates a server with an explicit module loader and auxiliary library.
    ///
    /// # Arguments
    ///
    /// * `loader` - Source of module libraries, e.g. a `StaticLoader` in tests
    /// * `aux` - The shared terrain library, or `AuxResource::disabled()`
    pub fn with_loader(config: ServerConfig, loader: Arc<dyn ModuleLoader>, aux: AuxResource) -> Self {
        let registry = Arc::new(Registry::new(config.host.clone(), loader, aux));
        Self {
            config,
            registry,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Prepares the cache, registers modules, binds every listener and
    /// starts serving.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let cache = self.registry.host().cache();
        if let Err(e) = cache.prepare(self.config.cache_cleanup_on_start) {
            warn!("Cache directory {} unavailable: {}", cache.root().display(), e);
        }

        if self.config.auto_load {
            let registered = self.registry.scan_and_register();
            info!("🧩 {} module(s) registered", registered);
        }

        let mut sockets = Vec::new();
        for (protocol, addr) in self.config.listeners() {
            let std_listener = bind_with_retry(
                addr,
                self.config.backlog,
                self.config.bind_retries,
                self.config.bind_backoff_ms,
            )
            .await?;
            let local_addr = std_listener.local_addr()?;
            let listener = TcpListener::from_std(std_listener)?;
            let socket = Arc::new(ListenerSocket::new(
                protocol,
                local_addr,
                self.config.max_connections,
                self.config.housekeeper.stats_window,
            ));
            info!("🚀 {} listener on {}", protocol, local_addr);
            sockets.push((socket, listener));
        }

        let listeners = sockets.iter().map(|(s, _)| s.clone()).collect();
        let shared = Arc::new(
            ServerShared::new(self.registry.clone(), listeners, self.config.clone())
                .with_signal(self.shutdown.clone()),
        );

        let housekeeper = Housekeeper::start(shared.clone())
            .map_err(|e| ServerError::Internal(format!("failed to start housekeeper: {}", e)))?;
        let accept_task = tokio::spawn(dispatcher::accept_loop(shared.clone(), sockets));

        Ok(ServerHandle {
            shared,
            accept_task,
            housekeeper: Some(housekeeper),
        })
    }
}

/// A running server.
pub struct ServerHandle {
    shared: Arc<ServerShared>,
    accept_task: JoinHandle<()>,
    housekeeper: Option<Housekeeper>,
}

impl ServerHandle {
    pub fn local_addr(&self, protocol: Protocol) -> Option<SocketAddr> {
        self.shared
            .listeners
            .iter()
            .find(|l| l.protocol() == protocol)
            .map(|l| l.local_addr())
    }

    pub fn shared(&self) -> &Arc<ServerShared> {
        &self.shared
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shared.shutdown.clone()
    }

    /// Resolves once shutdown has been requested (signal, control `stop`).
    pub async fn wait_for_stop(&self) {
        self.shared.shutdown.wait().await;
    }

    /// Stops accepting, drains live connections for up to the connection
    /// timeout, stops the housekeeper and unloads every module.
    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        info!("Shutting down");
        self.shared.shutdown.request();

        if let Err(e) = (&mut self.accept_task).await {
            error!("Accept loop ended abnormally: {}", e);
        }

        let deadline = Instant::now() + self.shared.config.connection_timeout();
        while self.shared.alive_connections() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.shared.alive_connections();
        if remaining > 0 {
            warn!("{} connection(s) still open at shutdown", remaining);
        }

        if let Some(mut housekeeper) = self.housekeeper.take() {
            tokio::task::spawn_blocking(move || housekeeper.stop())
                .await
                .map_err(|e| ServerError::Internal(e.to_string()))?;
        }

        let registry = self.shared.registry.clone();
        tokio::task::spawn_blocking(move || registry.shutdown_all())
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;

        info!("Server stopped");
        Ok(())
    }
}
