use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use haneul::collector::{FlavorRegistry, SiteCache};
use haneul::config::Config;
use haneul::dispatcher::{DispatcherProcess, HttpClusterGateway};
use haneul::models::{Cluster, DispatcherResource, ResourceKey, Scheduler, Workload};
use haneul::routing::{LogEventSink, RoutingController, ShellProcessManager};
use haneul::store::MemoryStore;

#[derive(Parser)]
#[command(
    name = "haneul",
    version,
    about = "Global-scheduler control plane with consistent-hash cluster routing",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    /// Config file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the routing controller and collector cache
    Controller {
        /// Script launched per scheduler shard
        #[arg(long, default_value = "./hack/start_scheduler.sh")]
        start_script: PathBuf,

        /// Script invoked when a scheduler shard is deleted
        #[arg(long, default_value = "./hack/close_scheduler.sh")]
        close_script: PathBuf,
    },

    /// Run one dispatcher fan-out process
    Dispatcher {
        /// Name of the dispatcher resource this process is bound to
        #[arg(long)]
        name: String,

        /// Namespace of the dispatcher resource
        #[arg(long, default_value = "default")]
        namespace: String,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        Config::from_env()?
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    config.logging.format = cli.log_format.clone();
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Stop signal wired to ctrl-c
fn shutdown_signal() -> watch::Receiver<bool> {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = stop_tx.send(true);
        }
    });
    stop_rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config);

    if let Err(err) = haneul::metrics::init_metrics() {
        eprintln!("Warning: metrics initialization failed: {err}");
    }

    match cli.command {
        Commands::Controller {
            start_script,
            close_script,
        } => run_controller(config, start_script, close_script).await,
        Commands::Dispatcher { name, namespace } => {
            run_dispatcher(config, name, namespace).await
        }
    }
}

async fn run_controller(
    config: Config,
    start_script: PathBuf,
    close_script: PathBuf,
) -> Result<()> {
    info!("starting haneul controller");

    // The in-memory store is the default backend; a deployment against a real
    // API server plugs its own ObjectStore implementations in here.
    let schedulers = Arc::new(MemoryStore::<Scheduler>::new());
    let clusters = Arc::new(MemoryStore::<Cluster>::new());

    let controller = RoutingController::new(
        schedulers,
        clusters,
        Arc::new(ShellProcessManager::new(start_script, close_script)),
        Arc::new(LogEventSink),
        config.routing_config(),
    );

    let cache = SiteCache::new(config.collector_config(), Arc::new(FlavorRegistry::new()));

    let stop_rx = shutdown_signal();
    let sweeper = cache.run(stop_rx.clone());
    controller.run(stop_rx).await;
    sweeper.await.context("expiry sweep task failed")?;

    info!("controller stopped");
    Ok(())
}

async fn run_dispatcher(config: Config, name: String, namespace: String) -> Result<()> {
    info!(dispatcher = %name, "starting haneul dispatcher");

    let dispatchers = Arc::new(MemoryStore::<DispatcherResource>::new());
    let workloads = Arc::new(MemoryStore::<Workload>::new());

    let process = DispatcherProcess::new(
        ResourceKey::new("system", namespace, name),
        dispatchers,
        workloads,
        Arc::new(HttpClusterGateway::new()),
        config.dispatcher_config(),
    )
    .await
    .context("failed to load dispatcher record")?;

    let stop_rx = shutdown_signal();
    process.run(stop_rx).await;

    info!("dispatcher stopped");
    Ok(())
}
