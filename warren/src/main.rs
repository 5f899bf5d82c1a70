//! Daemon entry point: loads a TOML config (overridable by `WARREN_*`
//! env vars), starts tracing, and runs manager, worker, or both depending on
//! `mode` (spec §6 configuration surface; SPEC_FULL.md §A.3/§B bootstrap-vs-
//! join and graceful-drain supplements).

mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use warren_manager::Manager;

#[derive(Parser)]
#[command(name = "warren", about = "Warren cluster daemon")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Address of an existing manager to join instead of bootstrapping a
    /// new cluster (SPEC_FULL.md §B). Requires `--token`.
    #[arg(long)]
    join: Option<String>,

    /// Join token presented to `--join`'s target.
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = config::DaemonConfig::load(&cli.config)?;
    if let Some(join_address) = cli.join {
        let mut manager = config
            .manager
            .take()
            .expect("--join requires a [manager] section in the config file");
        manager.bootstrap = false;
        manager.join_address = Some(join_address);
        manager.join_token = cli.token;
        config.manager = Some(manager);
    }

    let result = match config.mode {
        config::Mode::Manager => run_manager(config.manager.expect("manager config required for mode=manager")).await,
        config::Mode::Worker => run_worker(config.worker.expect("worker config required for mode=worker")).await,
        config::Mode::Hybrid => {
            let manager = config.manager.expect("manager config required for mode=hybrid");
            let worker = config.worker.expect("worker config required for mode=hybrid");
            tokio::select! {
                r = run_manager(manager) => r,
                r = run_worker(worker) => r,
            }
        }
    };

    if let Err(e) = &result {
        error!(error = %e, "daemon exited with error");
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    let format = std::env::var("WARREN_LOG_FORMAT").unwrap_or_default();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if format == "json" {
        tracing_subscriber::fmt().with_env_filter(env_filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).compact().init();
    }
}

/// Graceful-drain signal: resolves on SIGTERM or SIGINT (SPEC_FULL.md §B).
async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("install ctrl_c handler") };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn run_manager(config: warren_manager::ManagerConfig) -> anyhow::Result<()> {
    let manager = Manager::start(&config).await?;
    manager.spawn_background_tasks(&config);

    let network = manager.serve_network(&config.bind_address, shutdown_signal());
    let admin = manager.serve_admin_socket(&config.admin_socket_path, shutdown_signal());

    info!(bind_address = %config.bind_address, "manager started");
    tokio::try_join!(network, admin)?;
    info!("manager drained cleanly");
    Ok(())
}

async fn run_worker(config: warren_worker::WorkerConfig) -> anyhow::Result<()> {
    info!(node_id = %config.node_id, "worker started");
    tokio::select! {
        result = warren_worker::run(config) => result,
        _ = shutdown_signal() => {
            info!("worker received shutdown signal, leaving running containers in place");
            Ok(())
        }
    }
}
