//! Streaming generation gateway (v1)
//!
//! An admission queue and stream-timeout front end for a slow,
//! single-capacity generator, built with Tokio and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request      ┌───────────────────────────────────────────────────────┐
//!     ────────────────────┼─▶ http server ──▶ queue (FIFO) ──▶ worker + permit    │
//!                         │        ▲                                 │            │
//!                         │        │                                 ▼            │
//!     Client Response     │   arbiter ◀── stream machine ◀── upstream backend ◀──┼── Generator
//!     ◀───────────────────┼── (JSON / SSE)   (ttfb/silence/hard)   (NDJSON)      │
//!                         │                                                       │
//!                         │   sweeper: evicts waiting callers that disconnected   │
//!                         │   config · observability · resilience · lifecycle     │
//!                         └───────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use stream_gateway::backend::UpstreamBackend;
use stream_gateway::config::loader::load_config;
use stream_gateway::lifecycle::signals::shutdown_signal;
use stream_gateway::lifecycle::Gateway;
use stream_gateway::observability::{logging, metrics};
use stream_gateway::HttpServer;

#[derive(Parser)]
#[command(name = "stream-gateway")]
#[command(about = "Admission queue and stream timeouts for a single-capacity generator", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Gateway exited with error");
            eprintln!("stream-gateway: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref())?;
    logging::init_logging(&config.observability);

    tracing::info!("stream-gateway v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        backend = %config.backend.url,
        min_completion_timeout_ms = config.timeouts.min_completion_timeout_ms,
        min_silence_threshold_ms = config.timeouts.min_silence_threshold_ms,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let backend = Arc::new(UpstreamBackend::new(&config.backend)?);
    let mut gateway = Gateway::start(&config, backend)?;

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::new(&config, gateway.manager().clone());
    let server_task = tokio::spawn(server.run(listener, gateway.subscribe()));

    let worker_result = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        result = gateway.worker_exit() => result,
    };

    let shutdown_result = gateway.shutdown().await;
    match server_task.await {
        Ok(Err(err)) => tracing::error!(error = %err, "HTTP server failed"),
        Err(err) => tracing::error!(error = %err, "HTTP server task failed"),
        Ok(Ok(())) => {}
    }

    worker_result?;
    shutdown_result?;
    tracing::info!("Shutdown complete");
    Ok(())
}
