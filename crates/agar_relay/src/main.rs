//! Main application entry point for the relay.
//!
//! Loads configuration, installs logging, starts the relay and waits for a
//! shutdown signal.

mod cli;
mod config;
mod signals;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cli::CliArgs;
use config::{AppConfig, LoggingSettings};
use relay_server::{ConnectionPool, RelayServer};
use signals::setup_signal_handlers;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the configured level.
fn setup_logging(config: &LoggingSettings) {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true),
            )
            .init();
    }

    info!("🔧 Logging initialized with level: {}", log_level);
}

/// The relay plus the background tasks that report on it.
pub struct Application {
    config: AppConfig,
    server: Arc<RelayServer>,
}

impl Application {
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config_path)
            .await
            .with_context(|| format!("Failed to load {}", args.config_path.display()))?;

        if let Some(bind_address) = args.bind_address {
            config.server.bind_address = bind_address;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }
        if let Some(key) = args.key {
            config.protocol.key = key;
        }

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;

        setup_logging(&config.logging);

        let server = RelayServer::new(config.to_relay_config()?)?;

        info!("🚀 Agar Relay v{}", env!("CARGO_PKG_VERSION"));
        info!("📂 Config: {}", args.config_path.display());

        Ok(Self {
            config,
            server: Arc::new(server),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        info!(
            "  🗺️ Discovery: {} ({})",
            self.config.discovery.url, self.config.discovery.region
        );
        info!(
            "  🏊 Pool: {} ready / {} max, retry every {}s",
            self.config.pool.ready_threshold, self.config.pool.max_connections, self.config.pool.retry_delay_secs
        );
        info!("  👥 Max sessions: {}", self.config.server.max_sessions);
        if !self.config.server.forward_client_input {
            info!("  👀 Observe-only mode: client input is not forwarded");
        }

        let events_handle = tokio::spawn(log_events(Arc::clone(self.server.pool())));

        let health_handle = match self.config.logging.health_interval_secs {
            0 => None,
            secs => Some(tokio::spawn(log_health(
                Arc::clone(&self.server),
                Duration::from_secs(secs),
            ))),
        };

        let mut server_handle = {
            let server = Arc::clone(&self.server);
            tokio::spawn(async move { server.start().await })
        };

        let finished = tokio::select! {
            result = &mut server_handle => Some(result),
            signal = setup_signal_handlers() => {
                if let Err(e) = signal {
                    error!("Signal handling failed: {}", e);
                }
                info!("🛑 Shutdown requested");
                self.server.shutdown();
                None
            }
        };
        let result = match finished {
            Some(result) => result,
            None => server_handle.await,
        };

        let outcome: anyhow::Result<()> = match result {
            Ok(Ok(())) => {
                info!("✅ Relay stopped cleanly");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("❌ Relay error: {}", e);
                Err(e.into())
            }
            Err(e) => {
                error!("❌ Relay task failed: {}", e);
                Err(e.into())
            }
        };

        events_handle.abort();
        if let Some(handle) = health_handle {
            handle.abort();
        }

        info!("👋 Goodbye");
        outcome
    }
}

/// Logs decoded upstream traffic at debug level.
async fn log_events(pool: Arc<ConnectionPool>) {
    let mut events = pool.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => debug!(
                connection_id = event.connection_id,
                kind = event.message.kind(),
                "Upstream message"
            ),
            Err(RecvError::Lagged(skipped)) => warn!("Event logger skipped {} messages", skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Periodically logs a pool health line.
async fn log_health(server: Arc<RelayServer>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        interval.tick().await;

        let status = server.pool().status();
        info!(
            "📊 Pool Health - {} open | {} free | {} busy | {} sessions | warm: {}",
            status.total,
            status.free,
            status.busy,
            server.active_sessions(),
            status.warm
        );
        for group in &status.groups {
            debug!("  {} -> {} open, {} busy", group.origin_endpoint, group.open, group.busy);
        }
        if !status.warm && !status.retry_pending {
            warn!("⚠️ Pool is cold with no retry pending");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let app = match Application::new(args).await {
        Ok(app) => app,
        Err(e) => {
            eprintln!("❌ Failed to start relay: {e:#}");
            std::process::exit(1);
        }
    };

    app.run().await
}
