//! Response finalization arbiter.
//!
//! # Responsibilities
//! - Deliver a session's events to exactly one caller channel
//! - Let the first terminal event decide the outcome; discard everything after
//! - Stop delivery when the caller disconnects mid-stream
//!
//! # Design Decisions
//! - The `finalized` flag is owned by the arbiter and set before the final
//!   event leaves; later producers observe it and their events are counted
//!   as discarded rather than sent
//! - Batched callers get the full content only on `completed`; partial
//!   content of a failed session is dropped
//! - Every delta send is bounded by the caller's disconnect, a send budget,
//!   and the session's hard limit; a caller that stops reading is finalized
//!   with a backpressure or hard-timeout outcome, not treated as gone
//! - One channel slot is reserved up front for the final event so it never
//!   waits behind undelivered deltas

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};

use crate::error::GatewayError;
use crate::net::ConnectionProbe;
use crate::observability::metrics;
use crate::queue::RequestId;
use crate::resilience::TimeoutPolicy;
use crate::stream::machine::StreamTimeoutMachine;
use crate::stream::session::StreamSession;
use crate::stream::{NormalizedEvent, TerminalReason};

/// How content reaches the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// One response with the full content at the end.
    Batched,
    /// Each fragment is forwarded as it arrives.
    Incremental,
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Failed(GatewayError),
}

impl Outcome {
    /// Stable reason string reported to callers and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Outcome::Completed => TerminalReason::Completed.as_str(),
            Outcome::Failed(err) => match err.reason() {
                Some(reason) => reason.as_str(),
                None => match err {
                    GatewayError::Disconnected => "client_disconnected",
                    GatewayError::Configuration(_) => "configuration_error",
                    GatewayError::Backpressure(_) => "caller_backpressure",
                    _ => "backend_error",
                },
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

/// Final result of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub id: RequestId,
    pub outcome: Outcome,
    /// Full content for batched completed requests, empty otherwise.
    pub content: String,
    pub received: u64,
    pub elapsed: Duration,
}

/// Event delivered on a caller's response channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    Delta(String),
    Finished(Completion),
}

/// What happened to an offered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Forwarded,
    Buffered,
    Finalized,
    Discarded,
    CallerGone,
}

/// Result of one bounded send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sent {
    Delivered,
    CallerGone,
    TimedOut,
}

/// Serializes one session's events onto one caller channel.
pub struct ResponseArbiter {
    id: RequestId,
    mode: DeliveryMode,
    policy: TimeoutPolicy,
    sink: mpsc::Sender<ResponseEvent>,
    terminal_slot: Option<mpsc::OwnedPermit<ResponseEvent>>,
    connection: Arc<dyn ConnectionProbe>,
    send_budget: Duration,
    finalized: bool,
    discarded: u64,
    completion: Option<Completion>,
}

impl ResponseArbiter {
    pub fn new(
        id: RequestId,
        mode: DeliveryMode,
        policy: TimeoutPolicy,
        sink: mpsc::Sender<ResponseEvent>,
        connection: Arc<dyn ConnectionProbe>,
    ) -> Self {
        let terminal_slot = sink.clone().try_reserve_owned().ok();
        Self {
            id,
            mode,
            policy,
            sink,
            terminal_slot,
            connection,
            send_budget: policy.streaming(),
            finalized: false,
            discarded: 0,
            completion: None,
        }
    }

    /// Override how long a single send may wait on a slow caller.
    pub fn with_send_budget(mut self, budget: Duration) -> Self {
        self.send_budget = budget;
        self
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Events received after finalization.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Drive `machine` to its terminal event, delivering along the way.
    pub async fn run(mut self, mut machine: StreamTimeoutMachine) -> Completion {
        let connection = self.connection.clone();
        loop {
            let next = tokio::select! {
                biased;
                _ = connection.disconnected() => {
                    return self.abandon(machine.session_mut());
                }
                event = machine.next_event() => event,
            };

            let Some(event) = next else {
                // The machine always emits a terminal first; treat a bare end as failure.
                let err = GatewayError::Backend("stream ended without a terminal event".into());
                self.finalize(Outcome::Failed(err), machine.session_mut()).await;
                break;
            };

            match self.offer(event, machine.session_mut()).await {
                Delivery::Finalized => break,
                Delivery::CallerGone => return self.abandon(machine.session_mut()),
                Delivery::Forwarded | Delivery::Buffered | Delivery::Discarded => {}
            }
        }

        let leftovers = machine.drain_after_terminal().await;
        if leftovers > 0 {
            self.discard(leftovers);
        }
        self.into_completion(machine.session())
    }

    /// Offer one event for delivery.
    pub async fn offer(&mut self, event: NormalizedEvent, session: &mut StreamSession) -> Delivery {
        if self.finalized {
            self.discard(1);
            return Delivery::Discarded;
        }

        match event {
            NormalizedEvent::Data(text) => match self.mode {
                DeliveryMode::Batched => Delivery::Buffered,
                DeliveryMode::Incremental => {
                    let hard_deadline = session.started_at().checked_add(self.policy.hard());
                    let deadline = [Instant::now().checked_add(self.send_budget), hard_deadline]
                        .into_iter()
                        .flatten()
                        .min();
                    match self.send(ResponseEvent::Delta(text), deadline).await {
                        Sent::Delivered => Delivery::Forwarded,
                        Sent::CallerGone => Delivery::CallerGone,
                        Sent::TimedOut => {
                            let past_hard = hard_deadline.is_some_and(|at| Instant::now() >= at);
                            let err = if past_hard {
                                GatewayError::HardTimeout(self.policy.hard_limit)
                            } else {
                                GatewayError::Backpressure(self.send_budget.as_secs_f64())
                            };
                            self.finalize(Outcome::Failed(err), session).await;
                            Delivery::Finalized
                        }
                    }
                }
            },
            NormalizedEvent::Terminal(reason) => {
                let outcome = match GatewayError::from_reason(reason, &self.policy) {
                    None => Outcome::Completed,
                    Some(err) => Outcome::Failed(err),
                };
                self.finalize(outcome, session).await;
                Delivery::Finalized
            }
            NormalizedEvent::BackendFailure(message) => {
                self.finalize(Outcome::Failed(GatewayError::Backend(message)), session)
                    .await;
                Delivery::Finalized
            }
        }
    }

    /// Finalize without a session, e.g. when the backend failed to start.
    pub async fn fail(mut self, err: GatewayError) -> Completion {
        let mut session = StreamSession::new(self.id);
        self.finalize(Outcome::Failed(err), &mut session).await;
        self.into_completion(&session)
    }

    /// Finalize a caller that went away; nothing is sent.
    pub fn abandon(mut self, session: &mut StreamSession) -> Completion {
        if !self.finalized {
            self.finalized = true;
            session.abort();
            tracing::info!(
                request_id = %self.id,
                connection_id = %self.connection.id(),
                received = session.received(),
                "Caller disconnected; stream abandoned"
            );
            self.completion = Some(self.build(Outcome::Failed(GatewayError::Disconnected), session));
        }
        self.into_completion(session)
    }

    async fn finalize(&mut self, outcome: Outcome, session: &mut StreamSession) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        match &outcome {
            Outcome::Completed => {
                session.finalize();
            }
            Outcome::Failed(err) if err.is_retryable() && !matches!(err, GatewayError::Superseded) => {
                session.finalize();
            }
            Outcome::Failed(_) => {
                session.abort();
            }
        }

        let completion = self.build(outcome, session);
        if completion.outcome.is_success() {
            tracing::info!(
                request_id = %self.id,
                received = completion.received,
                elapsed_ms = completion.elapsed.as_millis() as u64,
                "Request completed"
            );
        } else {
            tracing::warn!(
                request_id = %self.id,
                reason = completion.outcome.reason(),
                received = completion.received,
                elapsed_ms = completion.elapsed.as_millis() as u64,
                "Request finished without completion"
            );
        }

        if !self.send_final(ResponseEvent::Finished(completion.clone())).await {
            tracing::debug!(request_id = %self.id, "Caller gone before final event");
        }
        self.completion = Some(completion);
    }

    /// Deliver the final event through the reserved slot.
    async fn send_final(&mut self, event: ResponseEvent) -> bool {
        match self.terminal_slot.take() {
            Some(slot) => {
                if self.sink.is_closed() {
                    return false;
                }
                slot.send(event);
                true
            }
            None => {
                let deadline = Instant::now().checked_add(self.send_budget);
                self.send(event, deadline).await == Sent::Delivered
            }
        }
    }

    fn build(&self, outcome: Outcome, session: &mut StreamSession) -> Completion {
        let content = match (&outcome, self.mode) {
            (Outcome::Completed, DeliveryMode::Batched) => session.take_content(),
            _ => {
                session.take_content();
                String::new()
            }
        };
        Completion {
            id: self.id,
            outcome,
            content,
            received: session.received(),
            elapsed: session.elapsed(Instant::now()),
        }
    }

    async fn send(&self, event: ResponseEvent, deadline: Option<Instant>) -> Sent {
        let send = async {
            match deadline {
                Some(at) => time::timeout_at(at, self.sink.send(event)).await,
                None => Ok(self.sink.send(event).await),
            }
        };
        tokio::select! {
            biased;
            _ = self.connection.disconnected() => Sent::CallerGone,
            sent = send => match sent {
                Ok(Ok(())) => Sent::Delivered,
                Ok(Err(_)) => Sent::CallerGone,
                Err(_) => Sent::TimedOut,
            },
        }
    }

    fn discard(&mut self, count: u64) {
        self.discarded += count;
        metrics::record_discarded(count);
        tracing::debug!(
            request_id = %self.id,
            count,
            total = self.discarded,
            "Discarded events after finalization"
        );
    }

    fn into_completion(self, session: &StreamSession) -> Completion {
        match self.completion {
            Some(completion) => completion,
            None => Completion {
                id: self.id,
                outcome: Outcome::Failed(GatewayError::Disconnected),
                content: String::new(),
                received: session.received(),
                elapsed: session.elapsed(Instant::now()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{connection_pair, ConnectionGuard};
    use crate::queue::QueueState;
    use crate::stream::machine::MachineSettings;
    use crate::stream::source::{channel_source, SourceFeed};

    fn policy() -> TimeoutPolicy {
        TimeoutPolicy {
            ttfb_budget: 15.0,
            silence_budget: 60.0,
            hard_limit: 180.0,
        }
    }

    struct Harness {
        arbiter: ResponseArbiter,
        events: mpsc::Receiver<ResponseEvent>,
        guard: ConnectionGuard,
        session: StreamSession,
    }

    fn harness(mode: DeliveryMode) -> Harness {
        let id = RequestId::new();
        let (conn, guard) = connection_pair();
        let (tx, rx) = mpsc::channel(16);
        Harness {
            arbiter: ResponseArbiter::new(id, mode, policy(), tx, Arc::new(conn)),
            events: rx,
            guard,
            session: StreamSession::new(id),
        }
    }

    fn machine_for(id: RequestId) -> (SourceFeed, StreamTimeoutMachine) {
        let queue = Arc::new(QueueState::new());
        queue.set_streaming(id);
        let (feed, source) = channel_source(16);
        let machine = StreamTimeoutMachine::new(
            StreamSession::new(id),
            Box::new(source),
            policy(),
            queue,
            MachineSettings::default(),
        );
        (feed, machine)
    }

    #[tokio::test]
    async fn test_events_after_terminal_are_discarded() {
        let mut h = harness(DeliveryMode::Incremental);

        let first = h.arbiter.offer(NormalizedEvent::Data("a".into()), &mut h.session).await;
        assert_eq!(first, Delivery::Forwarded);

        let done = h
            .arbiter
            .offer(NormalizedEvent::Terminal(TerminalReason::Completed), &mut h.session)
            .await;
        assert_eq!(done, Delivery::Finalized);

        let late = [
            NormalizedEvent::Data("late".into()),
            NormalizedEvent::Terminal(TerminalReason::HardTimeout),
            NormalizedEvent::BackendFailure("boom".into()),
        ];
        for event in late {
            assert_eq!(h.arbiter.offer(event, &mut h.session).await, Delivery::Discarded);
        }
        assert_eq!(h.arbiter.discarded(), 3);

        assert_eq!(h.events.recv().await, Some(ResponseEvent::Delta("a".into())));
        match h.events.recv().await {
            Some(ResponseEvent::Finished(c)) => assert_eq!(c.outcome, Outcome::Completed),
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batched_partial_content_dropped_on_failure() {
        let mut h = harness(DeliveryMode::Batched);
        h.session.record_fragment("partial", Instant::now());

        h.arbiter
            .offer(NormalizedEvent::Terminal(TerminalReason::SilenceDetected), &mut h.session)
            .await;

        match h.events.recv().await {
            Some(ResponseEvent::Finished(c)) => {
                assert_eq!(c.outcome, Outcome::Failed(GatewayError::SilenceTimeout(60.0)));
                assert!(c.content.is_empty());
                assert_eq!(c.received, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_batched_collects_content() {
        let h = harness(DeliveryMode::Batched);
        let mut events = h.events;
        let (feed, machine) = machine_for(h.session.id());
        feed.fragment("hel").await;
        feed.fragment("lo").await;
        feed.finish().await;
        feed.fragment("late").await;

        let completion = h.arbiter.run(machine).await;
        assert_eq!(completion.outcome, Outcome::Completed);
        assert_eq!(completion.content, "hello");

        assert_eq!(events.recv().await, Some(ResponseEvent::Finished(completion)));
        drop(h.guard);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_disconnect() {
        let h = harness(DeliveryMode::Incremental);
        let (feed, machine) = machine_for(h.session.id());
        feed.fragment("a").await;

        let guard = h.guard;
        let arbiter = h.arbiter;
        let run = tokio::spawn(async move { arbiter.run(machine).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        guard.disconnect();

        let completion = run.await.unwrap();
        assert_eq!(completion.outcome, Outcome::Failed(GatewayError::Disconnected));
        assert_eq!(completion.outcome.reason(), "client_disconnected");
        assert_eq!(completion.received, 1);
    }

    /// Feed "a" immediately and "b" at 50s, then stay open without a terminal.
    fn drip_feed(feed: SourceFeed) {
        tokio::spawn(async move {
            feed.fragment("a").await;
            tokio::time::sleep(Duration::from_secs(50)).await;
            feed.fragment("b").await;
            std::future::pending::<()>().await;
        });
    }

    fn stalled_reader(
        policy: TimeoutPolicy,
    ) -> (ResponseArbiter, mpsc::Receiver<ResponseEvent>, ConnectionGuard, RequestId) {
        let id = RequestId::new();
        let (conn, guard) = connection_pair();
        // One slot for deltas, one reserved for the final event.
        let (tx, rx) = mpsc::channel(2);
        let arbiter = ResponseArbiter::new(id, DeliveryMode::Incremental, policy, tx, Arc::new(conn));
        (arbiter, rx, guard, id)
    }

    fn machine_with(id: RequestId, policy: TimeoutPolicy) -> (SourceFeed, StreamTimeoutMachine) {
        let queue = Arc::new(QueueState::new());
        queue.set_streaming(id);
        let (feed, source) = channel_source(16);
        let machine = StreamTimeoutMachine::new(
            StreamSession::new(id),
            Box::new(source),
            policy,
            queue,
            MachineSettings::default(),
        );
        (feed, machine)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_reader_cannot_outlive_hard_limit() {
        let policy = TimeoutPolicy {
            ttfb_budget: 15.0,
            silence_budget: 60.0,
            hard_limit: 90.0,
        };
        let (arbiter, mut events, guard, id) = stalled_reader(policy);
        let (feed, machine) = machine_with(id, policy);
        drip_feed(feed);

        let started = Instant::now();
        let completion = arbiter.run(machine).await;
        let waited = started.elapsed();

        assert_eq!(completion.outcome, Outcome::Failed(GatewayError::HardTimeout(90.0)));
        assert_eq!(completion.outcome.reason(), "hard_timeout");
        assert!(waited <= Duration::from_secs(91), "ran for {waited:?}");
        drop(guard);

        assert_eq!(events.recv().await, Some(ResponseEvent::Delta("a".into())));
        match events.recv().await {
            Some(ResponseEvent::Finished(c)) => {
                assert_eq!(c.outcome, Outcome::Failed(GatewayError::HardTimeout(90.0)))
            }
            other => panic!("expected final event, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_reader_finalizes_with_backpressure() {
        let (arbiter, mut events, _guard, id) = stalled_reader(policy());
        let arbiter = arbiter.with_send_budget(Duration::from_secs(5));
        let (feed, machine) = machine_with(id, policy());
        drip_feed(feed);

        let completion = arbiter.run(machine).await;
        assert_eq!(completion.outcome, Outcome::Failed(GatewayError::Backpressure(5.0)));
        assert_eq!(completion.outcome.reason(), "caller_backpressure");
        assert_eq!(completion.received, 2);

        assert_eq!(events.recv().await, Some(ResponseEvent::Delta("a".into())));
        assert!(matches!(
            events.recv().await,
            Some(ResponseEvent::Finished(Completion {
                outcome: Outcome::Failed(GatewayError::Backpressure(_)),
                ..
            }))
        ));
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_final_event_skips_full_delta_buffer() {
        let (mut arbiter, mut events, _guard, id) = stalled_reader(policy());
        let mut session = StreamSession::new(id);

        let first = arbiter.offer(NormalizedEvent::Data("a".into()), &mut session).await;
        assert_eq!(first, Delivery::Forwarded);
        let done = arbiter
            .offer(NormalizedEvent::Terminal(TerminalReason::Completed), &mut session)
            .await;
        assert_eq!(done, Delivery::Finalized);

        assert_eq!(events.recv().await, Some(ResponseEvent::Delta("a".into())));
        assert!(matches!(events.recv().await, Some(ResponseEvent::Finished(_))));
    }
}
