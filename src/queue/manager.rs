//! Admission queue manager.
//!
//! # Responsibilities
//! - Admit requests in FIFO order and hand back a ticket
//! - Run the single worker that serializes generations behind the permit
//! - Evict waiting requests whose callers disconnected
//! - Rotate the backend by superseding the in-flight session
//! - Report queue status
//!
//! # Design Decisions
//! - One worker task; the permit is held for the whole generation and
//!   released by an RAII guard on every path, panics included
//! - A failing generation finalizes its own caller and never stops the worker
//! - Only a torn-down permit (configuration error) halts the worker
//! - Eviction probes run concurrently, each bounded by the liveness budget

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::backend::GenerationBackend;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::net::{is_alive, ConnectionProbe};
use crate::observability::metrics;
use crate::queue::request::{
    GenerationRequest, LifecycleState, QueuedRequest, RequestId, RequestRecord,
};
use crate::queue::state::{ProcessingPermit, QueueState};
use crate::resilience::{PolicySettings, TimeoutPolicy};
use crate::stream::{
    Completion, DeliveryMode, MachineSettings, Outcome, ResponseArbiter, ResponseEvent,
    StreamSession, StreamTimeoutMachine,
};

/// How long finished records stay visible in the status registry.
const RECORD_RETENTION: Duration = Duration::from_secs(600);

/// Worker and sweep settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub policy: PolicySettings,
    pub machine: MachineSettings,
    pub liveness_budget: Duration,
    pub sweep_interval: Duration,
    pub response_buffer: usize,
    pub default_model: Option<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

impl QueueSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            policy: PolicySettings::from(&config.timeouts),
            machine: MachineSettings::from_config(&config.queue, &config.timeouts),
            liveness_budget: Duration::from_millis(config.queue.liveness_poll_ms),
            sweep_interval: Duration::from_millis(config.queue.sweep_interval_ms),
            response_buffer: config.queue.response_buffer.max(2),
            default_model: config.backend.default_model.clone(),
        }
    }
}

/// Handle returned to an admitted caller.
#[derive(Debug)]
pub struct Ticket {
    pub id: RequestId,
    /// 1-based position at admission.
    pub position: usize,
    pub events: mpsc::Receiver<ResponseEvent>,
}

impl Ticket {
    /// Wait for the final event, skipping deltas.
    ///
    /// Returns `None` if the worker dropped the request without finalizing it.
    pub async fn completion(mut self) -> Option<Completion> {
        while let Some(event) = self.events.recv().await {
            if let ResponseEvent::Finished(completion) = event {
                return Some(completion);
            }
        }
        None
    }
}

/// Snapshot of the queue for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub depth: usize,
    pub waiting: Vec<String>,
    pub current: Option<String>,
    pub permits_held: usize,
    pub active_model: Option<String>,
    pub enqueued_total: u64,
    pub processed_total: u64,
    pub evicted_total: u64,
}

/// Lifecycle view of a single request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestStatus {
    pub id: String,
    pub state: LifecycleState,
    pub position: Option<usize>,
    pub waited_ms: u64,
}

/// Owns the admission queue and its worker.
pub struct QueueManager {
    state: Arc<QueueState>,
    backend: Arc<dyn GenerationBackend>,
    settings: QueueSettings,
}

impl QueueManager {
    pub fn new(backend: Arc<dyn GenerationBackend>, settings: QueueSettings) -> Self {
        Self {
            state: Arc::new(QueueState::new()),
            backend,
            settings,
        }
    }

    pub fn state(&self) -> &Arc<QueueState> {
        &self.state
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Admit `request` at the tail of the queue.
    pub fn enqueue(&self, request: GenerationRequest, connection: Arc<dyn ConnectionProbe>) -> Ticket {
        let id = RequestId::new();
        // One slot stays reserved for the final event.
        let (responder, events) = mpsc::channel(self.settings.response_buffer.max(2));
        let connection_id = connection.id();
        let stream = request.stream;
        let entry = QueuedRequest {
            id,
            request,
            connection,
            responder,
            record: Arc::new(RequestRecord::new(id)),
        };
        let position = self.state.push(entry);
        metrics::record_enqueued();

        tracing::info!(
            request_id = %id,
            connection_id = %connection_id,
            position,
            stream,
            "Request enqueued"
        );

        Ticket {
            id,
            position,
            events,
        }
    }

    /// Serve the queue until `shutdown` fires.
    ///
    /// Returns an error only if the processing permit is unusable.
    pub async fn run_worker(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> GatewayResult<()> {
        self.state.validate()?;
        tracing::info!("Queue worker started");

        loop {
            let entry = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(waiting = self.state.depth(), "Queue worker stopping");
                    return Ok(());
                }
                entry = self.state.next_waiting() => entry,
            };

            if let Err(err) = self.process(entry).await {
                tracing::error!(error = %err, "Queue worker halted");
                return Err(err);
            }
        }
    }

    /// Process one dequeued request to completion.
    ///
    /// Errors only with `GatewayError::Configuration`; request-scoped
    /// failures are delivered to the caller instead.
    pub async fn process(&self, entry: QueuedRequest) -> GatewayResult<()> {
        let id = entry.id;
        let record = entry.record.clone();
        let responder = entry.responder.clone();

        let permit = match ProcessingPermit::acquire(self.state.clone(), id).await {
            Ok(permit) => permit,
            Err(err) => {
                let _ = responder.try_send(ResponseEvent::Finished(failed(id, err.clone())));
                return Err(err);
            }
        };
        record.transition(LifecycleState::Dequeued);

        let policy = TimeoutPolicy::compute(entry.request.size_chars(), &self.settings.policy);
        tracing::info!(
            request_id = %id,
            waited_ms = record.enqueued_at().elapsed().as_millis() as u64,
            ttfb_secs = policy.ttfb_budget,
            silence_secs = policy.silence_budget,
            hard_secs = policy.hard_limit,
            "Request dequeued"
        );

        let started = Instant::now();
        let completion = match AssertUnwindSafe(self.generate(entry, policy))
            .catch_unwind()
            .await
        {
            Ok(completion) => completion,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(request_id = %id, panic = %message, "Generation panicked");
                let completion = failed(id, GatewayError::Backend(format!("internal error: {message}")));
                let _ = responder.try_send(ResponseEvent::Finished(completion.clone()));
                completion
            }
        };

        metrics::record_terminal(completion.outcome.reason());
        metrics::record_generation_duration(started.elapsed());
        record.transition(LifecycleState::Completed);
        drop(permit);
        self.state.note_processed();
        Ok(())
    }

    async fn generate(&self, entry: QueuedRequest, policy: TimeoutPolicy) -> Completion {
        let QueuedRequest {
            id,
            request,
            connection,
            responder,
            ..
        } = entry;

        let mode = if request.stream {
            DeliveryMode::Incremental
        } else {
            DeliveryMode::Batched
        };
        let arbiter = ResponseArbiter::new(id, mode, policy, responder, connection.clone());

        if !is_alive(connection.as_ref(), self.settings.liveness_budget).await {
            let mut session = StreamSession::new(id);
            return arbiter.abandon(&mut session);
        }

        if let Err(err) = self.prepare_backend(&request).await {
            return arbiter.fail(err).await;
        }

        let source = match self.backend.start(id, &request).await {
            Ok(source) => source,
            Err(err) => return arbiter.fail(err).await,
        };

        let machine = StreamTimeoutMachine::new(
            StreamSession::new(id),
            source,
            policy,
            self.state.clone(),
            self.settings.machine,
        );
        arbiter.run(machine).await
    }

    /// Switch model and apply parameters only when they changed.
    async fn prepare_backend(&self, request: &GenerationRequest) -> GatewayResult<()> {
        if let Some(model) = request.model.as_ref().or(self.settings.default_model.as_ref()) {
            let mut active = self.state.model_switch().lock().await;
            if active.as_deref() != Some(model.as_str()) {
                tracing::info!(model = %model, previous = ?active.as_deref(), "Switching model");
                self.backend.switch_model(model).await?;
                *active = Some(model.clone());
            }
        }

        let mut cached = self.state.params_cache().lock().await;
        if cached.as_ref() != Some(&request.params) {
            tracing::debug!(params = ?request.params, "Applying generation parameters");
            self.backend.apply_params(&request.params).await?;
            *cached = Some(request.params.clone());
        }
        Ok(())
    }

    /// Invalidate the in-flight session so the next request gets a fresh backend.
    ///
    /// The cached parameters are cleared so they are re-applied. Returns the
    /// superseded request id, if one was streaming.
    pub async fn supersede_current(&self) -> Option<RequestId> {
        let superseded = self.state.rotate();
        self.state.params_cache().lock().await.take();
        match superseded {
            Some(id) => tracing::info!(request_id = %id, "Backend rotated; in-flight session superseded"),
            None => tracing::info!("Backend rotated; no session in flight"),
        }
        superseded
    }

    /// Remove waiting requests whose callers are gone. Returns how many were evicted.
    pub async fn sweep_disconnected(&self) -> usize {
        let snapshot = self.state.waiting_snapshot();
        if snapshot.is_empty() {
            self.state.prune_records(RECORD_RETENTION);
            return 0;
        }

        let budget = self.settings.liveness_budget;
        let probes = snapshot.iter().map(|(id, connection)| async move {
            (*id, is_alive(connection.as_ref(), budget).await)
        });
        let dead: Vec<RequestId> = join_all(probes)
            .await
            .into_iter()
            .filter_map(|(id, alive)| (!alive).then_some(id))
            .collect();

        let evicted = self.state.remove_waiting(&dead);
        for entry in &evicted {
            entry.record.transition(LifecycleState::EvictedDisconnected);
            tracing::info!(
                request_id = %entry.id,
                connection_id = %entry.connection.id(),
                "Evicted disconnected caller"
            );
        }
        if !evicted.is_empty() {
            metrics::record_evictions(evicted.len());
        }
        self.state.prune_records(RECORD_RETENTION);
        evicted.len()
    }

    /// Sweep on a fixed interval until `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.settings.sweep_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("Queue sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let evicted = self.sweep_disconnected().await;
                    if evicted > 0 {
                        tracing::debug!(evicted, depth = self.state.depth(), "Sweep finished");
                    }
                }
            }
        }
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            depth: self.state.depth(),
            waiting: self
                .state
                .waiting_ids()
                .into_iter()
                .map(|id| id.to_string())
                .collect(),
            current: self.state.current().map(|id| id.to_string()),
            permits_held: self.state.permits_held(),
            active_model: self.state.active_model(),
            enqueued_total: self.state.enqueued_total(),
            processed_total: self.state.processed_total(),
            evicted_total: self.state.evicted_total(),
        }
    }

    /// Lifecycle state of `id`, if it is still known.
    pub fn lifecycle(&self, id: RequestId) -> Option<RequestStatus> {
        let record = self.state.record(id)?;
        let position = self
            .state
            .waiting_ids()
            .iter()
            .position(|waiting| *waiting == id)
            .map(|index| index + 1);
        let waited = record
            .dequeued_at()
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(record.enqueued_at());
        Some(RequestStatus {
            id: id.to_string(),
            state: record.state(),
            position,
            waited_ms: waited.as_millis() as u64,
        })
    }

    /// Wait until at least `count` requests have been processed.
    pub async fn wait_processed(&self, count: u64) {
        let mut processed = self.state.subscribe_processed();
        let _ = processed.wait_for(|total| *total >= count).await;
    }
}

fn failed(id: RequestId, err: GatewayError) -> Completion {
    Completion {
        id,
        outcome: Outcome::Failed(err),
        content: String::new(),
        received: 0,
        elapsed: Duration::ZERO,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
