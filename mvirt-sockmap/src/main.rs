//! mvirt-sockmap daemon: splices accepted TCP connections pairwise in the kernel.

use anyhow::Context;
use clap::Parser;
use mvirt_sockmap::config::{DEFAULT_CAPACITY, DEFAULT_LISTEN};
use mvirt_sockmap::program::DEFAULT_PROGRAM_PATH;
use mvirt_sockmap::{Binder, BinderConfig, ManagerConfig, RedirectTableManager, bind_listener};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mvirt-sockmap")]
#[command(about = "mvirt kernel TCP splicing daemon")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Number of redirect table slots (even, at least 2)
    #[arg(short, long, default_value_t = DEFAULT_CAPACITY)]
    capacity: u32,

    /// Path of the compiled redirect program
    #[arg(short, long, default_value = DEFAULT_PROGRAM_PATH)]
    program: PathBuf,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    info!("mvirt-sockmap starting...");

    // No redirection is possible without the manager
    let manager = match RedirectTableManager::new(&ManagerConfig::new(&args.program, args.capacity))
    {
        Ok(m) => Arc::new(m),
        Err(e) => {
            error!(error = %e, "Failed to create redirect table manager");
            error!("Do you have root privileges? Try running with 'sudo'.");
            std::process::exit(1);
        }
    };

    if let Err(e) = serve(Arc::clone(&manager), args.listen).await {
        error!(error = %e, "Server error");
    }

    info!("Shutting down...");
    if let Err(e) = manager.close() {
        error!(error = %e, "Failed to close redirect table manager");
        std::process::exit(1);
    }

    info!("mvirt-sockmap stopped");
}

async fn serve(manager: Arc<RedirectTableManager>, listen: SocketAddr) -> anyhow::Result<()> {
    let config = BinderConfig {
        listen,
        ..BinderConfig::default()
    };
    let listener =
        bind_listener(&config).with_context(|| format!("failed to listen on {}", listen))?;

    // Setup signal handlers
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;

    Binder::new(manager)
        .run(listener, async {
            tokio::select! {
                _ = sigint.recv() => { info!("Received SIGINT"); }
                _ = sigterm.recv() => { info!("Received SIGTERM"); }
            }
        })
        .await;

    Ok(())
}
