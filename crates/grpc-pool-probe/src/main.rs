#![doc = include_str!("../README.md")]

mod probe;

use clap::Parser;
use grpc_pool::{Pool, ShutdownStatus};
use probe::config::{CliArgs, ProbeConfig};
use probe::telemetry::init_telemetry;
use tokio::signal;
use tokio_util::sync::CancellationToken;

// mimalloc holds up better than the system allocator under contention, most
// noticeably on musl.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ProbeConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let server_shutdown = CancellationToken::new();
    let server = config.serve_addr.map(|addr| {
        tokio::spawn(probe::serve_health(addr, server_shutdown.clone()))
    });

    let pool = Pool::from_config(config.pool.clone())?;
    pool.run().await;

    let summary = probe::run_rounds(&pool, &config, &shutdown).await;
    tracing::info!(
        ok = summary.ok,
        failed = summary.failed,
        acquire_timeouts = summary.acquire_timeouts,
        "Probe finished"
    );

    match pool.close().await {
        ShutdownStatus::Drained => tracing::info!("Pool drained cleanly"),
        ShutdownStatus::TimedOut { outstanding } => {
            tracing::warn!("Pool closed with {outstanding} references still held");
        }
    }

    server_shutdown.cancel();
    if let Some(server) = server {
        if let Err(e) = server.await? {
            tracing::error!("Health server failed: {e:#}");
        }
    }

    providers.shutdown();
    Ok(())
}

fn log_startup_info(config: &ProbeConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Probing {} with full config: {:#?}",
            config.pool.target,
            config
        );
    } else {
        tracing::info!(
            "Probing {} with {} concurrent checks per round",
            config.pool.target,
            config.concurrency
        );
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, finishing the current round...");
    shutdown.cancel();
}
