//! Startup orchestration.
//!
//! # Responsibilities
//! - Build the queue manager from configuration
//! - Validate the shared queue primitives before any task starts
//! - Start background tasks (queue worker, disconnect sweeper)
//! - Tear everything down in order on shutdown
//!
//! # Design Decisions
//! - Fail fast: a configuration error is fatal
//! - The HTTP listener is started by the caller, after the core is running

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

use crate::backend::GenerationBackend;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::lifecycle::shutdown::Shutdown;
use crate::queue::{QueueManager, QueueSettings};

/// How long shutdown waits for the worker to leave its loop.
const WORKER_STOP_GRACE: Duration = Duration::from_secs(5);

/// The running gateway core.
pub struct Gateway {
    manager: Arc<QueueManager>,
    shutdown: Shutdown,
    worker: Option<JoinHandle<GatewayResult<()>>>,
    sweeper: JoinHandle<()>,
}

impl Gateway {
    /// Validate and start the worker and sweeper. Must run inside a Tokio runtime.
    pub fn start(config: &GatewayConfig, backend: Arc<dyn GenerationBackend>) -> GatewayResult<Self> {
        let manager = Arc::new(QueueManager::new(backend, QueueSettings::from_config(config)));
        manager.state().validate()?;

        let shutdown = Shutdown::new();
        let worker = tokio::spawn(manager.clone().run_worker(shutdown.subscribe()));
        let sweeper = tokio::spawn(manager.clone().run_sweeper(shutdown.subscribe()));

        tracing::info!(
            sweep_interval_ms = config.queue.sweep_interval_ms,
            tick_ms = config.queue.tick_ms,
            min_completion_timeout_ms = config.timeouts.min_completion_timeout_ms,
            min_silence_threshold_ms = config.timeouts.min_silence_threshold_ms,
            "Gateway core started"
        );

        Ok(Self {
            manager,
            shutdown,
            worker: Some(worker),
            sweeper,
        })
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Subscribe another task (e.g. the HTTP server) to shutdown.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Resolve when the worker exits on its own, which only happens on a
    /// configuration error.
    pub async fn worker_exit(&mut self) -> GatewayResult<()> {
        let Some(worker) = self.worker.as_mut() else {
            return std::future::pending().await;
        };
        let result = join_worker(worker).await;
        self.worker = None;
        result
    }

    /// Stop background tasks and tear down the queue primitives.
    pub async fn shutdown(mut self) -> GatewayResult<()> {
        tracing::info!("Gateway shutting down");
        self.shutdown.trigger();

        let result = match self.worker.take() {
            Some(mut worker) => match time::timeout(WORKER_STOP_GRACE, join_worker(&mut worker)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("Worker still busy after grace period; aborting");
                    worker.abort();
                    Ok(())
                }
            },
            None => Ok(()),
        };
        if time::timeout(WORKER_STOP_GRACE, &mut self.sweeper).await.is_err() {
            self.sweeper.abort();
        }

        self.manager.state().teardown();
        tracing::info!("Gateway stopped");
        result
    }
}

async fn join_worker(worker: &mut JoinHandle<GatewayResult<()>>) -> GatewayResult<()> {
    match worker.await {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(GatewayError::Configuration(format!("queue worker failed: {err}"))),
    }
}
