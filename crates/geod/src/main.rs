//! geod daemon entry point.
//!
//! Loads the configuration, installs logging, starts the server and waits
//! for a termination signal or a control `stop`.

mod cli;
mod config;
mod signals;

use anyhow::{anyhow, Context};
use cli::CliArgs;
use config::{AppConfig, LoggingSettings};
use geod_server::GeodServer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// Logging Setup
// ============================================================================

fn setup_logging(config: &LoggingSettings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_names(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_names(true),
            )
            .try_init()?;
    }

    info!("🔧 Logging initialized with level: {}", config.level);
    Ok(())
}

// ============================================================================
// Application
// ============================================================================

struct Application {
    config: AppConfig,
    server: GeodServer,
}

impl Application {
    async fn new(args: CliArgs) -> anyhow::Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(plugin_dir) = args.plugin_dir {
            config.modules.directory = plugin_dir.to_string_lossy().to_string();
        }
        if let Some(bind_address) = args.bind_address {
            config.server.http_bind = bind_address;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {}", e))?;
        setup_logging(&config.logging)?;

        let server = GeodServer::new(config.to_server_config()?);
        info!(
            "📂 Config: {} | Modules: {}",
            args.config_path.display(),
            config.modules.directory
        );
        Ok(Self { config, server })
    }

    async fn run(self) -> anyhow::Result<()> {
        info!("🌍 Starting geod v{}", env!("CARGO_PKG_VERSION"));
        info!("  HTTP: {}", self.config.server.http_bind);
        if let Some(ws) = &self.config.server.ws_bind {
            info!("  WebSocket: {}", ws);
        }
        if let Some(control) = &self.config.server.control_bind {
            info!("  Control: {}", control);
        }
        info!(
            "  Module idle timeout: {}s, housekeeper cycle: {}s",
            self.config.modules.idle_timeout, self.config.housekeeper.cycle_secs
        );

        let registry = self.server.registry().clone();
        let handle = self.server.start().await.context("server failed to start")?;
        let shutdown = handle.shutdown_signal();

        let reload_task = tokio::spawn(signals::forward_reload_requests(registry, shutdown.clone()));

        info!("✅ geod is running");
        tokio::select! {
            result = signals::wait_for_termination() => {
                if let Err(e) = result {
                    error!("Signal handling failed: {}", e);
                }
            }
            _ = handle.wait_for_stop() => {
                info!("🛑 Stop requested from a control session");
            }
        }

        handle.shutdown().await?;
        match reload_task.await {
            Ok(Err(e)) => warn!("Reload signal handler failed: {}", e),
            Err(e) => warn!("Reload signal task ended abnormally: {}", e),
            Ok(Ok(())) => {}
        }

        info!("✅ geod shutdown complete");
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let result = async {
        let app = Application::new(args).await?;
        app.run().await
    }
    .await;

    if let Err(e) = result {
        eprintln!("geod: {:#}", e);
        error!("Fatal: {:#}", e);
        std::process::exit(1);
    }
}
