//! Stream timeout state machine.
//!
//! # Responsibilities
//! - Turn raw generator events into normalized data and terminal events
//! - Enforce the TTFB, silence and hard budgets of a `TimeoutPolicy`
//! - Defer silence termination while the generator reports itself busy
//! - Stop promptly when a backend rotation supersedes the session
//!
//! # Design Decisions
//! - One bounded pull per tick; no wait is longer than the tick interval
//! - The hard limit is checked before every pull and can never be snoozed
//! - Snoozing halves the observed idle time and is capped per silence
//!   period; once the credits are spent only the hard limit applies
//! - On supersession, buffered events are drained without waiting. If the
//!   generator had already finished, the buffered content is delivered and
//!   the session completes; otherwise it ends as superseded
//!
//! # Tick Algorithm
//! ```text
//! 1. session no longer current         → supersession drain
//! 2. elapsed > hard limit              → hard_timeout
//! 3. pull one event (≤ tick)
//!      fragment  → Data
//!      finished  → completed
//!      failed    → BackendFailure(message)
//! 4. no fragment yet, elapsed > ttfb   → ttfb_timeout
//! 5. idle > max(silence, ttfb)
//!      busy and credits left           → snooze
//!      busy and credits spent          → keep waiting (hard limit governs)
//!      otherwise                       → silence_detected
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use tokio::time::{Duration, Instant};

use crate::config::{QueueConfig, TimeoutConfig};
use crate::queue::QueueState;
use crate::resilience::TimeoutPolicy;
use crate::stream::session::{SessionPhase, StreamSession};
use crate::stream::source::{RawEvent, RawEventSource, SourcePoll};
use crate::stream::{NormalizedEvent, TerminalReason};

/// Upper bound on events pulled by a non-waiting drain.
const MAX_DRAIN: usize = 4096;

/// Knobs of the tick loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineSettings {
    /// Longest single wait on the source.
    pub tick: Duration,
    /// Snooze credits per silence period.
    pub max_consecutive_snoozes: u32,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            max_consecutive_snoozes: 8,
        }
    }
}

impl MachineSettings {
    pub fn from_config(queue: &QueueConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            tick: Duration::from_millis(queue.tick_ms.max(1)),
            max_consecutive_snoozes: timeouts.max_consecutive_snoozes,
        }
    }
}

/// Drives one streaming session to exactly one terminal event.
pub struct StreamTimeoutMachine {
    session: StreamSession,
    source: Box<dyn RawEventSource>,
    policy: TimeoutPolicy,
    queue: Arc<QueueState>,
    settings: MachineSettings,
    pending: VecDeque<NormalizedEvent>,
    terminated: bool,
    snooze_exhausted: bool,
}

impl StreamTimeoutMachine {
    pub fn new(
        session: StreamSession,
        source: Box<dyn RawEventSource>,
        policy: TimeoutPolicy,
        queue: Arc<QueueState>,
        settings: MachineSettings,
    ) -> Self {
        Self {
            session,
            source,
            policy,
            queue,
            settings,
            pending: VecDeque::new(),
            terminated: false,
            snooze_exhausted: false,
        }
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut StreamSession {
        &mut self.session
    }

    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// Whether the terminal event has been produced.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Produce the next event. Returns `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<NormalizedEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        if self.terminated {
            return None;
        }

        loop {
            if !self.queue.is_streaming(self.session.id()) {
                return self.on_superseded().await;
            }

            let now = Instant::now();
            if self.session.elapsed(now) > self.policy.hard() {
                return Some(self.terminate(TerminalReason::HardTimeout));
            }

            match self.source.next_event(self.settings.tick).await {
                SourcePoll::Event(RawEvent::Fragment(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.session.record_fragment(&text, Instant::now());
                    self.snooze_exhausted = false;
                    return Some(NormalizedEvent::Data(text));
                }
                SourcePoll::Event(RawEvent::Finished) => {
                    return Some(self.terminate(TerminalReason::Completed));
                }
                SourcePoll::Event(RawEvent::Failed(message)) => {
                    return Some(self.fail(message));
                }
                SourcePoll::Closed => {
                    return Some(self.fail("generation ended without a finish marker".to_string()));
                }
                SourcePoll::Idle => {}
            }

            if let Some(reason) = self.check_budgets(Instant::now()) {
                return Some(self.terminate(reason));
            }
        }
    }

    /// Adapt the machine into a stream of normalized events.
    pub fn into_stream(self) -> impl Stream<Item = NormalizedEvent> + Send {
        stream::unfold(self, |mut machine| async move {
            machine.next_event().await.map(|event| (event, machine))
        })
    }

    /// Pull and count whatever is still buffered after the terminal event.
    pub async fn drain_after_terminal(&mut self) -> u64 {
        let mut drained = self.pending.len() as u64;
        self.pending.clear();
        for _ in 0..MAX_DRAIN {
            match self.source.next_event(Duration::ZERO).await {
                SourcePoll::Event(_) => drained += 1,
                SourcePoll::Idle | SourcePoll::Closed => break,
            }
        }
        drained
    }

    fn check_budgets(&mut self, now: Instant) -> Option<TerminalReason> {
        if self.session.received() == 0 {
            return (self.session.elapsed(now) > self.policy.ttfb())
                .then_some(TerminalReason::TtfbTimeout);
        }

        let budget = self.policy.streaming();
        if self.session.idle(now) <= budget {
            return None;
        }

        let busy = self.source.is_generating() == Some(true);
        if !busy || self.session.phase() != SessionPhase::Streaming {
            return Some(TerminalReason::SilenceDetected);
        }

        if self
            .session
            .snooze(now, self.settings.max_consecutive_snoozes)
        {
            tracing::debug!(
                request_id = %self.session.id(),
                snoozes = self.session.consecutive_snoozes(),
                "Generator busy; deferring silence timeout"
            );
        } else if !self.snooze_exhausted {
            self.snooze_exhausted = true;
            tracing::warn!(
                request_id = %self.session.id(),
                hard_limit_secs = self.policy.hard_limit,
                "Snooze credits exhausted; waiting on hard limit"
            );
        }
        None
    }

    async fn on_superseded(&mut self) -> Option<NormalizedEvent> {
        let mut buffered = Vec::new();
        let mut finished = false;
        for _ in 0..MAX_DRAIN {
            match self.source.next_event(Duration::ZERO).await {
                SourcePoll::Event(RawEvent::Fragment(text)) => buffered.push(text),
                SourcePoll::Event(RawEvent::Finished) => {
                    finished = true;
                    break;
                }
                SourcePoll::Event(RawEvent::Failed(_)) | SourcePoll::Idle | SourcePoll::Closed => {
                    break;
                }
            }
        }

        if finished {
            tracing::info!(
                request_id = %self.session.id(),
                buffered = buffered.len(),
                "Superseded after generator finished; delivering buffered content"
            );
            let now = Instant::now();
            for text in buffered.into_iter().filter(|t| !t.is_empty()) {
                self.session.record_fragment(&text, now);
                self.pending.push_back(NormalizedEvent::Data(text));
            }
            let done = self.terminate(TerminalReason::Completed);
            self.pending.push_back(done);
            return self.pending.pop_front();
        }

        tracing::info!(
            request_id = %self.session.id(),
            discarded = buffered.len(),
            "Session superseded by backend rotation"
        );
        Some(self.terminate(TerminalReason::Superseded))
    }

    fn terminate(&mut self, reason: TerminalReason) -> NormalizedEvent {
        self.terminated = true;
        tracing::debug!(
            request_id = %self.session.id(),
            reason = %reason,
            received = self.session.received(),
            elapsed_ms = self.session.elapsed(Instant::now()).as_millis() as u64,
            "Stream terminated"
        );
        NormalizedEvent::Terminal(reason)
    }

    fn fail(&mut self, message: String) -> NormalizedEvent {
        self.terminated = true;
        tracing::warn!(
            request_id = %self.session.id(),
            received = self.session.received(),
            error = %message,
            "Generation source failed"
        );
        NormalizedEvent::BackendFailure(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RequestId;
    use crate::stream::source::{channel_source, SourceFeed};
    use futures_util::StreamExt;

    fn policy(ttfb: f64, silence: f64, hard: f64) -> TimeoutPolicy {
        TimeoutPolicy {
            ttfb_budget: ttfb,
            silence_budget: silence,
            hard_limit: hard,
        }
    }

    fn machine(policy: TimeoutPolicy) -> (SourceFeed, Arc<QueueState>, StreamTimeoutMachine) {
        let id = RequestId::new();
        let queue = Arc::new(QueueState::new());
        queue.set_streaming(id);
        let (feed, source) = channel_source(64);
        let machine = StreamTimeoutMachine::new(
            StreamSession::new(id),
            Box::new(source),
            policy,
            queue.clone(),
            MachineSettings::default(),
        );
        (feed, queue, machine)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttfb_timeout_without_fragments() {
        let (_feed, _queue, mut machine) = machine(policy(15.0, 60.0, 180.0));
        let started = Instant::now();

        let event = machine.next_event().await;
        assert_eq!(event, Some(NormalizedEvent::Terminal(TerminalReason::TtfbTimeout)));
        assert_eq!(machine.session().received(), 0);

        let waited = started.elapsed();
        assert!(waited > Duration::from_secs(15));
        assert!(waited <= Duration::from_secs(16));
        assert_eq!(machine.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_generator_snoozes_until_hard_limit() {
        let (feed, _queue, mut machine) = machine(policy(15.0, 60.0, 180.0));
        let started = Instant::now();

        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            feed.fragment("partial").await;
            feed.set_generating(true);
            std::future::pending::<()>().await;
        });

        assert_eq!(
            machine.next_event().await,
            Some(NormalizedEvent::Data("partial".into()))
        );

        let terminal = machine.next_event().await;
        let waited = started.elapsed();
        assert_eq!(terminal, Some(NormalizedEvent::Terminal(TerminalReason::HardTimeout)));
        assert!(waited > Duration::from_secs(61));
        assert!(waited > Duration::from_secs(180));
        assert!(waited <= Duration::from_secs(181));
        producer.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_generator_is_silence() {
        let (feed, _queue, mut machine) = machine(policy(15.0, 60.0, 180.0));
        let started = Instant::now();

        feed.fragment("only").await;
        assert_eq!(machine.next_event().await, Some(NormalizedEvent::Data("only".into())));

        let terminal = machine.next_event().await;
        assert_eq!(
            terminal,
            Some(NormalizedEvent::Terminal(TerminalReason::SilenceDetected))
        );
        let waited = started.elapsed();
        assert!(waited > Duration::from_secs(60));
        assert!(waited <= Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_stream_completes() {
        let (feed, _queue, machine) = machine(policy(15.0, 60.0, 180.0));
        feed.fragment("a").await;
        feed.fragment("").await;
        feed.fragment("b").await;
        feed.finish().await;

        let events: Vec<_> = machine.into_stream().collect().await;
        assert_eq!(
            events,
            vec![
                NormalizedEvent::Data("a".into()),
                NormalizedEvent::Data("b".into()),
                NormalizedEvent::Terminal(TerminalReason::Completed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_verbatim() {
        let (feed, _queue, mut machine) = machine(policy(15.0, 60.0, 180.0));
        feed.fail("page crashed").await;
        assert_eq!(
            machine.next_event().await,
            Some(NormalizedEvent::BackendFailure("page crashed".into()))
        );
        assert!(machine.is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_source_is_backend_failure() {
        let (feed, _queue, mut machine) = machine(policy(15.0, 60.0, 180.0));
        drop(feed);
        assert!(matches!(
            machine.next_event().await,
            Some(NormalizedEvent::BackendFailure(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supersession_ends_within_a_tick() {
        let (feed, queue, mut machine) = machine(policy(15.0, 60.0, 180.0));
        feed.fragment("a").await;
        assert_eq!(machine.next_event().await, Some(NormalizedEvent::Data("a".into())));

        feed.fragment("b").await;
        queue.rotate();
        let started = Instant::now();
        assert_eq!(
            machine.next_event().await,
            Some(NormalizedEvent::Terminal(TerminalReason::Superseded))
        );
        assert!(started.elapsed() <= MachineSettings::default().tick);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supersession_after_finish_delivers_buffered() {
        let (feed, queue, mut machine) = machine(policy(15.0, 60.0, 180.0));
        feed.fragment("tail").await;
        feed.finish().await;
        queue.rotate();

        assert_eq!(machine.next_event().await, Some(NormalizedEvent::Data("tail".into())));
        assert_eq!(
            machine.next_event().await,
            Some(NormalizedEvent::Terminal(TerminalReason::Completed))
        );
        assert_eq!(machine.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_counts_leftovers() {
        let (feed, _queue, mut machine) = machine(policy(15.0, 60.0, 180.0));
        feed.finish().await;
        feed.fragment("late-1").await;
        feed.fragment("late-2").await;

        assert_eq!(
            machine.next_event().await,
            Some(NormalizedEvent::Terminal(TerminalReason::Completed))
        );
        assert_eq!(machine.drain_after_terminal().await, 2);
    }
}
