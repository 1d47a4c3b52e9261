//! Data Collection Task Orchestrator
//!
//! The control plane server: persists declarative collection tasks,
//! schedules them against wall-clock rules, materialises each run as an
//! isolated container on a worker host, ingests the container's callbacks,
//! and reconciles terminal state from authoritative container status.

/// Server version from Cargo.toml
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod cache;
mod config;
mod database;
mod executor;
mod host;
mod ports;
mod reconciler;
mod scheduler;

#[cfg(test)]
mod tests;

use cache::Cache;
use config::ConfigManager;
use database::ServerDatabase;
use executor::ExecutionEngine;
use host::{DockerHost, HostDriver};
use ports::PortAllocator;
use reconciler::Reconciler;
use scheduler::ScheduleEngine;
use shared::config::{HostMode, ServerConfig};

/// Command-line arguments for the orchestrator server
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Control plane for the data collection task orchestrator", long_about = None)]
struct CliArgs {
    /// Path to the server configuration file (server.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen address from config file
    #[arg(long = "listen-address", value_name = "ADDRESS")]
    listen_address: Option<String>,

    /// Override the API key from config file
    #[arg(long = "api-key", value_name = "KEY")]
    api_key: Option<String>,

    /// Override the data directory from config file
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<String>,

    /// Override the cache backend URL from config file
    #[arg(long = "cache-url", value_name = "URL")]
    cache_url: Option<String>,
}

/// The main application structure for the server, holding the frozen
/// configuration and the handles of every background activity for graceful
/// shutdown.
pub struct Server {
    config: Arc<ServerConfig>,
    listen_address: SocketAddr,
    database: Option<Arc<Mutex<ServerDatabase>>>,
    engine_task_handle: Option<JoinHandle<()>>,
    heartbeat_writer_handle: Option<JoinHandle<()>>,
    scheduler_task_handle: Option<JoinHandle<()>>,
    reconciler_task_handle: Option<JoinHandle<()>>,
    cleanup_task_handle: Option<JoinHandle<()>>,
    wal_checkpoint_task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl Server {
    /// Load and validate configuration; fails fast on a bad config file.
    pub fn new(config_path: PathBuf, cli_args: &CliArgs) -> Result<Self> {
        let mut config_manager = ConfigManager::new(config_path)?;

        if cli_args.listen_address.is_some()
            || cli_args.api_key.is_some()
            || cli_args.data_dir.is_some()
            || cli_args.cache_url.is_some()
        {
            let changed = config_manager.override_and_persist_config(
                cli_args.listen_address.clone(),
                cli_args.api_key.clone(),
                cli_args.data_dir.clone(),
                cli_args.cache_url.clone(),
            )?;
            if changed {
                info!("Configuration overrides applied and persisted to disk");
            } else {
                info!("Command-line values match existing config, no changes needed");
            }
        }

        let config = config_manager
            .server_config
            .clone()
            .context("Server configuration not loaded")?;

        let listen_address: SocketAddr = config
            .listen_address
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", config.listen_address))?;

        Ok(Self {
            config: Arc::new(config),
            listen_address,
            database: None,
            engine_task_handle: None,
            heartbeat_writer_handle: None,
            scheduler_task_handle: None,
            reconciler_task_handle: None,
            cleanup_task_handle: None,
            wal_checkpoint_task_handle: None,
            shutdown_tx: None,
        })
    }

    /// Starts the server and runs until the HTTP listener stops.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting Data Collection Task Orchestrator");
        info!(
            listen_address = %self.listen_address,
            host_mode = ?self.config.host_mode,
            port_range = format!("{}-{}", self.config.port_range_start, self.config.port_range_end),
            scheduler_interval = self.config.scheduler_interval_seconds,
            reconciler_interval = self.config.reconciler_interval_seconds,
            "Server configuration loaded"
        );

        // Initialize the store.
        info!("Initializing database");
        let mut database = ServerDatabase::new(&self.config.data_dir)
            .context("Failed to create database manager")?;
        database
            .initialize()
            .await
            .context("Failed to initialize database")?;
        let database = Arc::new(Mutex::new(database));
        self.database = Some(Arc::clone(&database));
        info!("Database initialized successfully");

        // Connect the cache backend.
        let cache = Cache::connect(&self.config.cache_url)
            .await
            .context("Failed to connect cache backend")?;

        // Host driver and port allocator.
        let host: Arc<dyn HostDriver> = Arc::new(DockerHost::from_config(&self.config));
        if self.config.host_mode == HostMode::Remote {
            if let Err(e) = host.check_connection().await {
                warn!("Container host connection check failed: {}", e);
            }
        }
        let ports = Arc::new(PortAllocator::new(
            Arc::clone(&host),
            self.config.port_range_start,
            self.config.port_range_end,
        ));

        // Create shutdown broadcast channel.
        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Execution engine and its admission channel.
        let (admit_tx, admit_rx) = mpsc::channel(self.config.admission_channel_capacity);
        let engine = ExecutionEngine::new(
            Arc::clone(&self.config),
            Arc::clone(&database),
            cache.clone(),
            Arc::clone(&host),
            Arc::clone(&ports),
        );
        self.engine_task_handle = Some(engine.spawn_worker(admit_rx, shutdown_tx.subscribe()));

        // Fire-and-forget writer for heartbeat store updates.
        let heartbeat_writer =
            api::monitoring::HeartbeatWriter::new(self.config.heartbeat_queue_capacity);
        self.heartbeat_writer_handle = Some(
            heartbeat_writer.spawn_drain(Arc::clone(&database), shutdown_tx.subscribe()),
        );

        // Scheduler loop: leader-elected due-schedule scan.
        let schedule_engine = ScheduleEngine::new(
            Arc::clone(&self.config),
            Arc::clone(&database),
            cache.clone(),
            admit_tx.clone(),
        );
        let scheduler_interval = self.config.scheduler_interval_seconds;
        let mut scheduler_shutdown_rx = shutdown_tx.subscribe();
        let scheduler_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(scheduler_interval));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match schedule_engine.tick().await {
                            Ok(fired) if fired > 0 => {
                                info!("Scheduler fired {} schedules", fired);
                            }
                            Ok(_) => {}
                            Err(e) => error!("Scheduler tick failed: {:#}", e),
                        }
                    }
                    _ = scheduler_shutdown_rx.recv() => {
                        info!("Scheduler task received shutdown signal");
                        schedule_engine.release_leadership().await;
                        break;
                    }
                }
            }
        });
        self.scheduler_task_handle = Some(scheduler_task);

        // Reconciler loop: container-authoritative liveness sweep.
        let reconciler = Reconciler::new(
            Arc::clone(&self.config),
            Arc::clone(&database),
            cache.clone(),
            Arc::clone(&host),
            engine.clone(),
            admit_tx.clone(),
        );
        let reconciler_interval = self.config.reconciler_interval_seconds;
        let mut reconciler_shutdown_rx = shutdown_tx.subscribe();
        let reconciler_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(reconciler_interval));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = reconciler.run_pass().await {
                            error!("Reconcile pass failed: {:#}", e);
                        }
                    }
                    _ = reconciler_shutdown_rx.recv() => {
                        info!("Reconciler task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.reconciler_task_handle = Some(reconciler_task);

        // Periodic cleanup: old executions, stale staged configs, stopped
        // containers.
        let cleanup_config = Arc::clone(&self.config);
        let cleanup_db = Arc::clone(&database);
        let cleanup_host = Arc::clone(&host);
        let mut cleanup_shutdown_rx = shutdown_tx.subscribe();
        let cleanup_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(
                cleanup_config.initial_cleanup_delay_seconds,
            ))
            .await;
            let mut interval = tokio::time::interval(Duration::from_secs(
                (cleanup_config.cleanup_interval_hours as u64) * 3600,
            ));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        info!("Running periodic cleanup");
                        let cutoff = shared::utils::current_timestamp()
                            - (cleanup_config.execution_retention_days as i64) * 86400;
                        let mut db = cleanup_db.lock().await;
                        match db.cleanup_old_executions(cutoff).await {
                            Ok(deleted) => info!("Cleaned up {} old executions", deleted),
                            Err(e) => error!("Execution cleanup failed: {:#}", e),
                        }
                        drop(db);
                        if let Err(e) = cleanup_host
                            .purge_stale_configs(Duration::from_secs(86400))
                            .await
                        {
                            warn!("Stale config purge failed: {}", e);
                        }
                        if let Err(e) = cleanup_host.prune_stopped_containers().await {
                            warn!("Container prune failed: {}", e);
                        }
                    }
                    _ = cleanup_shutdown_rx.recv() => {
                        info!("Cleanup task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.cleanup_task_handle = Some(cleanup_task);

        // Periodic WAL checkpoint.
        let wal_interval = self.config.wal_checkpoint_interval_seconds;
        let wal_db = Arc::clone(&database);
        let mut wal_shutdown_rx = shutdown_tx.subscribe();
        let wal_checkpoint_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(wal_interval));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let mut db = wal_db.lock().await;
                        match db.checkpoint_wal().await {
                            Ok(frames) => {
                                if frames > 0 {
                                    info!("WAL checkpoint completed: {} frames", frames);
                                }
                            }
                            Err(e) => warn!("WAL checkpoint failed: {:#}", e),
                        }
                    }
                    _ = wal_shutdown_rx.recv() => {
                        info!("WAL checkpoint task received shutdown signal");
                        break;
                    }
                }
            }
        });
        self.wal_checkpoint_task_handle = Some(wal_checkpoint_task);

        // Application state and router.
        let app_state = api::AppState::new(
            Arc::clone(&self.config),
            Arc::clone(&database),
            cache,
            engine,
            admit_tx,
            heartbeat_writer,
        );
        let app = api::create_router(app_state);

        info!("Starting HTTP server on {}", self.listen_address);
        let listener = tokio::net::TcpListener::bind(self.listen_address)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind TCP listener to {}. \
                     Check if port is already in use (EADDRINUSE) or requires elevated permissions (EACCES).",
                    self.listen_address
                )
            })?;

        // Create a shutdown signal receiver for axum.
        let shutdown_signal = {
            let mut rx = shutdown_tx.subscribe();
            async move {
                let _ = rx.recv().await;
                info!("HTTP server received shutdown signal");
            }
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }

    /// Performs a graceful shutdown of the server: signal every background
    /// task, wait for each with a bounded timeout, then close the store.
    pub async fn shutdown(&mut self) {
        info!("Shutting down task orchestrator gracefully");

        let timeout_secs = self.config.graceful_shutdown_timeout_seconds;

        if let Some(shutdown_tx) = &self.shutdown_tx {
            if let Err(e) = shutdown_tx.send(()) {
                warn!("Failed to send shutdown signal: {}", e);
            }
        }

        let tasks = [
            ("execution engine", self.engine_task_handle.take()),
            ("heartbeat writer", self.heartbeat_writer_handle.take()),
            ("scheduler", self.scheduler_task_handle.take()),
            ("reconciler", self.reconciler_task_handle.take()),
            ("cleanup", self.cleanup_task_handle.take()),
            ("WAL checkpoint", self.wal_checkpoint_task_handle.take()),
        ];
        for (name, handle) in tasks {
            let Some(handle) = handle else { continue };
            info!("Waiting for {} task to complete (timeout: {}s)", name, timeout_secs);
            match tokio::time::timeout(Duration::from_secs(timeout_secs), handle).await {
                Ok(Ok(())) => info!("{} task completed successfully", name),
                Ok(Err(e)) => warn!("{} task panicked: {}", name, e),
                Err(_) => warn!("{} task shutdown timeout reached, aborting", name),
            }
        }

        if let Some(database) = &self.database {
            info!("Closing database connection");
            let mut db = database.lock().await;
            db.close().await;
            info!("Database connection closed");
        }

        info!("Server shutdown complete");
    }
}

/// Sets up signal handlers for graceful shutdown.
/// Returns a future that completes when a shutdown signal is received.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                error!("Falling back to Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("Received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("Received Ctrl+C");
        }
    }
}

/// Server entry point: initializes logging, loads configuration, and runs
/// until a shutdown signal is received.
#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("./logs", "server.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli_args = CliArgs::parse();

    info!("Task orchestrator v{} starting up", SERVER_VERSION);
    info!("Configuration file: {}", cli_args.config_file.display());

    let mut server = match Server::new(cli_args.config_file.clone(), &cli_args) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to initialize server: {:#}", e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {:#}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown");
        }
    }

    server.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
