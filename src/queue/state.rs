//! Shared admission-queue state.
//!
//! # Responsibilities
//! - Hold the FIFO of waiting requests and wake the worker on enqueue
//! - Own the single processing permit and the current streaming id
//! - Own the model-switch and parameter-cache locks
//! - Keep the status registry of request lifecycle records
//!
//! # Design Decisions
//! - Mutation is `pub(crate)` and driven by the queue manager; the stream
//!   machine only compares ids through `is_streaming`
//! - The current streaming id is set only while the permit is held and is
//!   cleared by the permit guard before the permit is released
//! - Lock order is permit, then at most one of model-switch / params-cache

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify, OwnedSemaphorePermit, Semaphore};

use crate::error::{GatewayError, GatewayResult};
use crate::observability::metrics;
use crate::queue::request::{GenerationParams, QueuedRequest, RequestId, RequestRecord};

/// The generator serves one request at a time.
pub const PERMIT_CAPACITY: usize = 1;

/// Process-wide queue state.
#[derive(Debug)]
pub struct QueueState {
    waiting: Mutex<VecDeque<QueuedRequest>>,
    work_available: Notify,
    permit: Arc<Semaphore>,
    current: Mutex<Option<RequestId>>,
    model_switch: AsyncMutex<Option<String>>,
    params_cache: AsyncMutex<Option<GenerationParams>>,
    records: DashMap<RequestId, Arc<RequestRecord>>,
    enqueued_total: AtomicU64,
    evicted_total: AtomicU64,
    processed: watch::Sender<u64>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueState {
    pub fn new() -> Self {
        let (processed, _) = watch::channel(0);
        Self {
            waiting: Mutex::new(VecDeque::new()),
            work_available: Notify::new(),
            permit: Arc::new(Semaphore::new(PERMIT_CAPACITY)),
            current: Mutex::new(None),
            model_switch: AsyncMutex::new(None),
            params_cache: AsyncMutex::new(None),
            records: DashMap::new(),
            enqueued_total: AtomicU64::new(0),
            evicted_total: AtomicU64::new(0),
            processed,
        }
    }

    /// Fail fast if the shared primitives are unusable.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.permit.is_closed() {
            return Err(GatewayError::Configuration(
                "processing permit has been torn down".into(),
            ));
        }
        let held = self.permits_held();
        if held > PERMIT_CAPACITY {
            return Err(GatewayError::Configuration(format!(
                "processing permit over-committed: {held} held"
            )));
        }
        Ok(())
    }

    /// Close the processing permit; later dequeues fail with a configuration error.
    pub fn teardown(&self) {
        self.permit.close();
        self.work_available.notify_waiters();
    }

    /// Processing permits currently held (0 or 1).
    pub fn permits_held(&self) -> usize {
        PERMIT_CAPACITY.saturating_sub(self.permit.available_permits())
    }

    /// Whether `id` is the session currently allowed to stream.
    pub fn is_streaming(&self, id: RequestId) -> bool {
        *lock(&self.current) == Some(id)
    }

    pub fn current(&self) -> Option<RequestId> {
        *lock(&self.current)
    }

    pub fn depth(&self) -> usize {
        lock(&self.waiting).len()
    }

    /// Ids of waiting requests in FIFO order.
    pub fn waiting_ids(&self) -> Vec<RequestId> {
        lock(&self.waiting).iter().map(|entry| entry.id).collect()
    }

    pub fn record(&self, id: RequestId) -> Option<Arc<RequestRecord>> {
        self.records.get(&id).map(|entry| entry.value().clone())
    }

    pub fn enqueued_total(&self) -> u64 {
        self.enqueued_total.load(Ordering::Relaxed)
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }

    pub fn processed_total(&self) -> u64 {
        *self.processed.borrow()
    }

    pub fn subscribe_processed(&self) -> watch::Receiver<u64> {
        self.processed.subscribe()
    }

    /// Last model the generator was switched to.
    pub fn active_model(&self) -> Option<String> {
        self.model_switch.try_lock().ok().and_then(|model| model.clone())
    }

    pub(crate) fn model_switch(&self) -> &AsyncMutex<Option<String>> {
        &self.model_switch
    }

    pub(crate) fn params_cache(&self) -> &AsyncMutex<Option<GenerationParams>> {
        &self.params_cache
    }

    /// Append `entry` and return its 1-based position.
    pub(crate) fn push(&self, entry: QueuedRequest) -> usize {
        self.records.insert(entry.id, entry.record.clone());
        let position = {
            let mut waiting = lock(&self.waiting);
            waiting.push_back(entry);
            waiting.len()
        };
        self.enqueued_total.fetch_add(1, Ordering::Relaxed);
        metrics::record_queue_depth(position);
        self.work_available.notify_one();
        position
    }

    fn pop(&self) -> Option<QueuedRequest> {
        let mut waiting = lock(&self.waiting);
        let entry = waiting.pop_front();
        metrics::record_queue_depth(waiting.len());
        entry
    }

    /// Wait for the next waiting request. Cancel-safe.
    pub(crate) async fn next_waiting(&self) -> QueuedRequest {
        loop {
            let notified = self.work_available.notified();
            if let Some(entry) = self.pop() {
                return entry;
            }
            notified.await;
        }
    }

    /// Snapshot of the waiting entries for a liveness sweep.
    pub(crate) fn waiting_snapshot(&self) -> Vec<(RequestId, Arc<dyn crate::net::ConnectionProbe>)> {
        lock(&self.waiting)
            .iter()
            .map(|entry| (entry.id, entry.connection.clone()))
            .collect()
    }

    /// Remove waiting entries whose id is in `ids`. Returns the removed entries.
    pub(crate) fn remove_waiting(&self, ids: &[RequestId]) -> Vec<QueuedRequest> {
        if ids.is_empty() {
            return Vec::new();
        }
        let mut waiting = lock(&self.waiting);
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(waiting.len());
        for entry in waiting.drain(..) {
            if ids.contains(&entry.id) {
                removed.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        *waiting = kept;
        metrics::record_queue_depth(waiting.len());
        self.evicted_total
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    /// Drop finished records older than `max_age`.
    pub(crate) fn prune_records(&self, max_age: std::time::Duration) -> usize {
        let now = tokio::time::Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| match record.finished_at() {
            Some(finished) => now.saturating_duration_since(finished) < max_age,
            None => true,
        });
        before - self.records.len()
    }

    pub(crate) fn set_streaming(&self, id: RequestId) {
        *lock(&self.current) = Some(id);
    }

    fn clear_streaming(&self, id: RequestId) {
        let mut current = lock(&self.current);
        if *current == Some(id) {
            *current = None;
        }
    }

    /// Invalidate the current streaming id. Returns the superseded id.
    pub(crate) fn rotate(&self) -> Option<RequestId> {
        lock(&self.current).take()
    }

    pub(crate) fn note_processed(&self) {
        self.processed.send_modify(|count| *count += 1);
    }

    pub(crate) fn permit(&self) -> Arc<Semaphore> {
        self.permit.clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// RAII guard over the processing permit.
///
/// Marks `id` as the streaming session on acquire and clears it on drop,
/// before the permit returns to the semaphore.
#[derive(Debug)]
pub struct ProcessingPermit {
    state: Arc<QueueState>,
    id: RequestId,
    _permit: OwnedSemaphorePermit,
}

impl ProcessingPermit {
    pub async fn acquire(state: Arc<QueueState>, id: RequestId) -> GatewayResult<Self> {
        let permit = state.permit().acquire_owned().await.map_err(|_| {
            GatewayError::Configuration("processing permit has been torn down".into())
        })?;
        state.set_streaming(id);
        metrics::record_permit_held(true);
        Ok(Self {
            state,
            id,
            _permit: permit,
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl Drop for ProcessingPermit {
    fn drop(&mut self) {
        self.state.clear_streaming(self.id);
        metrics::record_permit_held(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permit_guard_tracks_current() {
        let state = Arc::new(QueueState::new());
        assert_eq!(state.permits_held(), 0);

        let id = RequestId::new();
        let permit = ProcessingPermit::acquire(state.clone(), id).await.unwrap();
        assert_eq!(state.permits_held(), 1);
        assert!(state.is_streaming(id));

        drop(permit);
        assert_eq!(state.permits_held(), 0);
        assert_eq!(state.current(), None);
    }

    #[tokio::test]
    async fn test_rotate_clears_only_current() {
        let state = Arc::new(QueueState::new());
        let id = RequestId::new();
        let permit = ProcessingPermit::acquire(state.clone(), id).await.unwrap();

        assert_eq!(state.rotate(), Some(id));
        assert!(!state.is_streaming(id));
        // Permit is still held by the in-flight session.
        assert_eq!(state.permits_held(), 1);
        drop(permit);
        assert_eq!(state.permits_held(), 0);
    }

    #[tokio::test]
    async fn test_teardown_fails_fast() {
        let state = Arc::new(QueueState::new());
        assert!(state.validate().is_ok());
        state.teardown();

        assert!(matches!(state.validate(), Err(GatewayError::Configuration(_))));
        let err = ProcessingPermit::acquire(state.clone(), RequestId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }
}
