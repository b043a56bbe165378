#![doc = include_str!("../README.md")]

mod config;
mod load;
mod server;
mod telemetry;

use clap::Parser;
use config::{BenchConfig, CliArgs};
use load::run_load;
use server::LocalServer;
use telemetry::init_telemetry;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = BenchConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let server_shutdown = CancellationToken::new();
    let server = match &config.serve_addr {
        Some(addr) => Some(LocalServer::start(addr, server_shutdown.clone()).await?),
        None => None,
    };

    let res = run(&config, &cancel).await;

    if let Some(server) = server {
        server_shutdown.cancel();
        server.join().await?;
    }
    res
}

async fn run(config: &BenchConfig, cancel: &CancellationToken) -> anyhow::Result<()> {
    let pool = chanpool::dial_n(
        cancel,
        &config.target,
        config.connections,
        config.dial_options.clone(),
    )
    .await?;
    tracing::info!(
        "Dialed {} connections to {}",
        pool.num_connections(),
        config.target
    );

    let report = run_load(&pool, config.requests, config.concurrency, cancel).await?;
    tracing::info!(
        "{} calls ({} failed) in {:.2} ms: {:.2} calls/sec",
        report.total(),
        report.failed,
        report.elapsed.as_secs_f64() * 1000.0,
        report.throughput()
    );

    if let Err(e) = pool.close().await {
        tracing::error!("Error closing connection pool: {e}");
        return Err(e.into());
    }
    Ok(())
}

fn log_startup_info(config: &BenchConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting chanpool-bench with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting chanpool-bench against {} with {} connections and {} callers",
            config.target,
            config.connections,
            config.concurrency
        );
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Stopping load, in-flight calls will finish");
    cancel.cancel();
}
