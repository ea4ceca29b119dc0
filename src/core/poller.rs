// Generic poller for eventually-consistent remote data.
//
// Several workflows in this tool trigger a remote side effect and then have
// to wait for some externally observable record of it to show up: Cloud
// Logging entries lag behind an Apps Script execution, and the OAuth token
// file only appears once the user finishes authorizing in a browser. This
// module implements that wait once - a bounded, exponentially backing off
// poll loop - so the call sites don't each carry their own copy.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The window during which the remote side-effecting action ran. The poller
/// waits for `ended_at` to be reflected downstream.
#[derive(Debug, Clone, Copy)]
pub struct TriggerEvent {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// The latest externally observable record returned by a query. Produced
/// anew on every fetch; never mutated.
#[derive(Debug, Clone)]
pub struct ObservedEvent<P> {
    pub timestamp: DateTime<Utc>,
    pub payload: P,
}

/// Failure classification for a single `fetch_latest` call.
///
/// Transient failures are logged and retried until the poll times out;
/// non-retryable ones (revoked authorization, bad request) abort the poll
/// immediately.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("transient query failure: {0}")]
    Transient(String),
    #[error("non-retryable query failure: {0}")]
    NonRetryable(String),
}

/// Query seam the poller is parameterized over. Implementations must be safe
/// to call repeatedly; the poller never issues overlapping calls within one
/// session, so each response supersedes the previous one.
#[async_trait]
pub trait LatestEventSource: Send + Sync {
    type Payload: Send;

    /// Fetch the most recent observable event, or `None` if nothing is
    /// visible yet.
    async fn fetch_latest(&self) -> Result<Option<ObservedEvent<Self::Payload>>, QueryError>;
}

/// How an observed event is compared against the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchCondition {
    /// The observed timestamp must fall within the tolerance window around
    /// `trigger.ended_at`. The window is symmetric - downstream clocks may
    /// be skewed in either direction.
    Timestamp,
    /// Any observed event at all counts as a match. Used when the query is
    /// an existence check, e.g. watching for the token file to appear.
    Presence,
}

impl MatchCondition {
    fn matches<P>(
        &self,
        observed: &ObservedEvent<P>,
        trigger: &TriggerEvent,
        tolerance: Duration,
    ) -> bool {
        match self {
            MatchCondition::Timestamp => {
                let skew = (observed.timestamp - trigger.ended_at)
                    .num_milliseconds()
                    .unsigned_abs();
                skew <= tolerance.as_millis() as u64
            }
            MatchCondition::Presence => true,
        }
    }
}

/// Tuning knobs for one poll session.
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    /// Delay before the second query (the first happens immediately).
    pub initial_delay: Duration,
    /// Upper bound for the backoff delay.
    pub max_delay: Duration,
    /// Each delay is the previous one raised to this power (in seconds),
    /// capped at `max_delay`.
    pub backoff_exponent: f64,
    /// Total wall-clock budget for the session.
    pub timeout: Duration,
    /// Tolerance window for [`MatchCondition::Timestamp`].
    pub match_tolerance: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            backoff_exponent: 1.2,
            timeout: Duration::from_secs(120),
            match_tolerance: Duration::from_secs(5),
        }
    }
}

/// Terminal failure kinds. Transient query errors never surface here; they
/// are swallowed and retried until the timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollFailure {
    #[error("poll cancelled while waiting")]
    Cancelled,
    #[error("non-retryable query failure: {0}")]
    NonRetryable(String),
}

/// Result of one poll session. Always one of these three - callers never get
/// a plain error for an ordinary timeout.
#[derive(Debug)]
pub enum PollOutcome<P> {
    /// A fresh event was observed within the tolerance window.
    Matched { payload: P, elapsed: Duration },
    /// The budget elapsed. `payload` carries whatever the final best-effort
    /// fetch returned; it is not guaranteed to reflect the trigger.
    TimedOut {
        payload: Option<P>,
        elapsed: Duration,
    },
    Failed(PollFailure),
}

impl<P> PollOutcome<P> {
    pub fn is_matched(&self) -> bool {
        matches!(self, PollOutcome::Matched { .. })
    }
}

// Per-session backoff state. Owned by one poll_until_match call; never
// shared across sessions.
struct PollState {
    attempt: u32,
    current_delay_secs: f64,
}

impl PollState {
    fn new(options: &PollOptions) -> Self {
        Self {
            attempt: 0,
            current_delay_secs: options.initial_delay.as_secs_f64(),
        }
    }

    fn current_delay(&self) -> Duration {
        Duration::from_secs_f64(self.current_delay_secs)
    }

    /// Advance to the next delay: `min(delay ^ exponent, max_delay)`.
    /// Never decreases: raising a sub-second delay to a power above one
    /// would shrink it, so the previous delay is a floor.
    fn advance(&mut self, options: &PollOptions) {
        self.attempt += 1;
        self.current_delay_secs = self
            .current_delay_secs
            .powf(options.backoff_exponent)
            .min(options.max_delay.as_secs_f64())
            .max(self.current_delay_secs);
    }
}

/// Drives bounded poll sessions against a [`LatestEventSource`].
///
/// A single session is sequential: it suspends only while sleeping between
/// queries, and that sleep is the cancellation point. Independent sessions
/// for different triggers may run concurrently; nothing is shared.
pub struct Poller {
    options: PollOptions,
    condition: MatchCondition,
}

impl Poller {
    pub fn new(options: PollOptions) -> Self {
        Self::with_condition(options, MatchCondition::Timestamp)
    }

    pub fn with_condition(options: PollOptions, condition: MatchCondition) -> Self {
        Self { options, condition }
    }

    pub fn options(&self) -> &PollOptions {
        &self.options
    }

    /// Poll until the source reflects the trigger, the budget elapses, or
    /// the session is cancelled.
    ///
    /// The first query happens immediately (the event may already be
    /// visible). On timeout one last unconditional query runs so the caller
    /// still gets the freshest data available.
    pub async fn poll_until_match<S>(
        &self,
        trigger: &TriggerEvent,
        source: &S,
        cancel: &CancellationToken,
    ) -> PollOutcome<S::Payload>
    where
        S: LatestEventSource,
    {
        let started = Instant::now();
        let mut state = PollState::new(&self.options);

        // Fast path: the event may already be visible.
        match source.fetch_latest().await {
            Ok(Some(observed))
                if self
                    .condition
                    .matches(&observed, trigger, self.options.match_tolerance) =>
            {
                tracing::debug!("event visible on first query, no polling needed");
                return PollOutcome::Matched {
                    payload: observed.payload,
                    elapsed: started.elapsed(),
                };
            }
            Ok(_) => {}
            Err(QueryError::NonRetryable(reason)) => {
                return PollOutcome::Failed(PollFailure::NonRetryable(reason));
            }
            Err(QueryError::Transient(reason)) => {
                tracing::warn!("initial query failed, will retry: {reason}");
            }
        }

        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.options.timeout {
                break;
            }

            // Never sleep past the timeout boundary. If the remaining budget
            // is smaller than the next delay, skip straight to the final
            // fetch instead of waiting out a sleep that cannot pay off.
            let delay = state.current_delay();
            if delay > self.options.timeout - elapsed {
                tracing::debug!(
                    "remaining budget ({:.1}s) smaller than next delay, ending poll",
                    (self.options.timeout - elapsed).as_secs_f64()
                );
                break;
            }

            tracing::debug!(
                "poll attempt {} ({:.1}s elapsed), waiting {:.1}s before next query",
                state.attempt + 1,
                elapsed.as_secs_f64(),
                state.current_delay_secs
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("poll cancelled during backoff wait");
                    return PollOutcome::Failed(PollFailure::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match source.fetch_latest().await {
                Ok(Some(observed))
                    if self
                        .condition
                        .matches(&observed, trigger, self.options.match_tolerance) =>
                {
                    let elapsed = started.elapsed();
                    tracing::info!(
                        "event observed after {:.1}s of polling",
                        elapsed.as_secs_f64()
                    );
                    return PollOutcome::Matched {
                        payload: observed.payload,
                        elapsed,
                    };
                }
                Ok(_) => {}
                Err(QueryError::NonRetryable(reason)) => {
                    return PollOutcome::Failed(PollFailure::NonRetryable(reason));
                }
                Err(QueryError::Transient(reason)) => {
                    tracing::warn!("query failed, continuing to poll: {reason}");
                }
            }

            state.advance(&self.options);
        }

        // Timed out. One final best-effort fetch - the data may be usable
        // even though it is not guaranteed to reflect the trigger.
        let payload = match source.fetch_latest().await {
            Ok(Some(observed)) => Some(observed.payload),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!("final query after timeout failed: {err}");
                None
            }
        };

        let elapsed = started.elapsed();
        tracing::warn!(
            "poll timed out after {:.1}s before the event became visible",
            elapsed.as_secs_f64()
        );
        PollOutcome::TimedOut { payload, elapsed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn trigger_at(ended_at: DateTime<Utc>) -> TriggerEvent {
        TriggerEvent {
            started_at: ended_at - chrono::Duration::seconds(2),
            ended_at,
        }
    }

    /// Source that replays a fixed sequence of responses, then keeps
    /// returning the last one.
    struct ScriptedSource {
        responses: Mutex<VecDeque<Option<DateTime<Utc>>>>,
        last: Mutex<Option<DateTime<Utc>>>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(timestamps: Vec<Option<DateTime<Utc>>>) -> Self {
            Self {
                responses: Mutex::new(timestamps.into()),
                last: Mutex::new(None),
                fetches: AtomicUsize::new(0),
            }
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LatestEventSource for ScriptedSource {
        type Payload = DateTime<Utc>;

        async fn fetch_latest(
            &self,
        ) -> Result<Option<ObservedEvent<Self::Payload>>, QueryError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut queue = self.responses.lock().unwrap();
                match queue.pop_front() {
                    Some(ts) => {
                        *self.last.lock().unwrap() = ts;
                        ts
                    }
                    None => *self.last.lock().unwrap(),
                }
            };
            Ok(next.map(|ts| ObservedEvent {
                timestamp: ts,
                payload: ts,
            }))
        }
    }

    /// Source whose queries always fail with the given error kind.
    struct FailingSource {
        retryable: bool,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl LatestEventSource for FailingSource {
        type Payload = ();

        async fn fetch_latest(&self) -> Result<Option<ObservedEvent<()>>, QueryError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.retryable {
                Err(QueryError::Transient("flaky network".into()))
            } else {
                Err(QueryError::NonRetryable("authorization revoked".into()))
            }
        }
    }

    #[test]
    fn backoff_sequence_is_non_decreasing_and_converges_to_max() {
        let options = PollOptions::default();
        let mut state = PollState::new(&options);
        let mut previous = state.current_delay_secs;
        let mut hit_max = false;

        for _ in 0..32 {
            state.advance(&options);
            assert!(
                state.current_delay_secs >= previous,
                "delay decreased: {} -> {}",
                previous,
                state.current_delay_secs
            );
            assert!(state.current_delay_secs <= options.max_delay.as_secs_f64());
            previous = state.current_delay_secs;
            if state.current_delay_secs == options.max_delay.as_secs_f64() {
                hit_max = true;
            }
        }

        assert!(hit_max, "delay never reached max_delay");
    }

    #[test]
    fn default_backoff_ramp_matches_expected_values() {
        // 10s -> 10^1.2 ≈ 15.85s -> ≈ 27.54s -> ≈ 53.46s -> capped at 60s
        let options = PollOptions::default();
        let mut state = PollState::new(&options);

        let expected = [10.0, 15.849, 27.542, 53.456, 60.0, 60.0];
        for want in expected {
            assert!(
                (state.current_delay_secs - want).abs() < 0.01,
                "expected {want}, got {}",
                state.current_delay_secs
            );
            state.advance(&options);
        }
    }

    #[test]
    fn subsecond_initial_delay_never_shrinks() {
        let options = PollOptions {
            initial_delay: Duration::from_millis(500),
            ..PollOptions::default()
        };
        let mut state = PollState::new(&options);
        let mut previous = state.current_delay_secs;

        for _ in 0..8 {
            state.advance(&options);
            assert!(
                state.current_delay_secs >= previous,
                "delay decreased: {} -> {}",
                previous,
                state.current_delay_secs
            );
            previous = state.current_delay_secs;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_match_performs_zero_sleeps() {
        let ended = Utc::now();
        let source = ScriptedSource::new(vec![Some(ended)]);
        let poller = Poller::new(PollOptions::default());
        let cancel = CancellationToken::new();

        let outcome = poller
            .poll_until_match(&trigger_at(ended), &source, &cancel)
            .await;

        assert!(outcome.is_matched());
        assert_eq!(source.fetch_count(), 1);
        match outcome {
            PollOutcome::Matched { elapsed, .. } => {
                assert_eq!(elapsed, Duration::ZERO, "fast path must not sleep")
            }
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn match_tolerance_is_a_closed_symmetric_window() {
        let ended = Utc::now();
        let poller = Poller::new(PollOptions {
            timeout: Duration::from_secs(1),
            ..PollOptions::default()
        });
        let cancel = CancellationToken::new();

        // Exactly 5000ms before the trigger: inside the window.
        let on_boundary = ScriptedSource::new(vec![Some(ended - chrono::Duration::milliseconds(5000))]);
        let outcome = poller
            .poll_until_match(&trigger_at(ended), &on_boundary, &cancel)
            .await;
        assert!(outcome.is_matched(), "5000ms skew should match");

        // 5001ms before: outside.
        let past_boundary =
            ScriptedSource::new(vec![Some(ended - chrono::Duration::milliseconds(5001))]);
        let outcome = poller
            .poll_until_match(&trigger_at(ended), &past_boundary, &cancel)
            .await;
        assert!(!outcome.is_matched(), "5001ms skew should not match");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_then_fresh_one_needs_two_sleeps() {
        // Scenario from the log-retrieval workflow: the first two queries see
        // stale entries (30s and 20s old), the third sees one 2s off the
        // trigger. With the default 10s initial delay and 1.2 exponent that
        // is two sleeps (10s, then ~15.8s) before the match.
        let ended = Utc::now();
        let source = ScriptedSource::new(vec![
            Some(ended - chrono::Duration::seconds(30)),
            Some(ended - chrono::Duration::seconds(20)),
            Some(ended - chrono::Duration::seconds(2)),
        ]);
        let poller = Poller::new(PollOptions::default());
        let cancel = CancellationToken::new();

        let outcome = poller
            .poll_until_match(&trigger_at(ended), &source, &cancel)
            .await;

        assert_eq!(source.fetch_count(), 3);
        match outcome {
            PollOutcome::Matched { elapsed, .. } => {
                // 10s + 10^1.2s ≈ 25.8s of sleeping in total.
                assert!(
                    elapsed >= Duration::from_secs(25) && elapsed <= Duration::from_secs(27),
                    "unexpected elapsed: {elapsed:?}"
                );
            }
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_performs_exactly_one_final_fetch() {
        let ended = Utc::now();
        let stale = ended - chrono::Duration::hours(1);
        let source = ScriptedSource::new(vec![Some(stale)]);
        let poller = Poller::new(PollOptions::default());
        let cancel = CancellationToken::new();

        let outcome = poller
            .poll_until_match(&trigger_at(ended), &source, &cancel)
            .await;

        // Sleeps of 10 + 15.8 + 27.5 + 53.5 ≈ 107s fit in the 120s budget;
        // the next 60s delay does not, so the loop ends there. One fast-path
        // fetch, four in-loop fetches, and exactly one final fetch.
        assert_eq!(source.fetch_count(), 6);
        match outcome {
            PollOutcome::TimedOut { payload, elapsed } => {
                assert_eq!(payload, Some(stale), "final fetch payload must ride the outcome");
                assert!(elapsed < poller.options().timeout + Duration::from_secs(1));
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_with_empty_source_carries_no_payload() {
        let source = ScriptedSource::new(vec![None]);
        let poller = Poller::new(PollOptions {
            timeout: Duration::from_secs(15),
            ..PollOptions::default()
        });
        let cancel = CancellationToken::new();

        let outcome = poller
            .poll_until_match(&trigger_at(Utc::now()), &source, &cancel)
            .await;

        match outcome {
            PollOutcome::TimedOut { payload, .. } => assert_eq!(payload, None),
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wakes_the_sleep_immediately() {
        let ended = Utc::now();
        let source = ScriptedSource::new(vec![Some(ended - chrono::Duration::hours(1))]);
        let poller = Poller::new(PollOptions::default());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let outcome = poller
            .poll_until_match(&trigger_at(ended), &source, &cancel)
            .await;

        match outcome {
            PollOutcome::Failed(PollFailure::Cancelled) => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
        // The poller was two seconds into a ten second sleep; it must not
        // have waited the sleep out.
        assert!(started.elapsed() < Duration::from_secs(10));
        // No further queries after cancellation.
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_timeout() {
        let source = FailingSource {
            retryable: true,
            fetches: AtomicUsize::new(0),
        };
        let poller = Poller::new(PollOptions {
            timeout: Duration::from_secs(30),
            ..PollOptions::default()
        });
        let cancel = CancellationToken::new();

        let outcome = poller
            .poll_until_match(&trigger_at(Utc::now()), &source, &cancel)
            .await;

        match outcome {
            PollOutcome::TimedOut { payload: None, .. } => {}
            other => panic!("expected TimedOut without payload, got {other:?}"),
        }
        assert!(source.fetches.load(Ordering::SeqCst) > 1, "failures must be retried");
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_aborts_without_polling() {
        let source = FailingSource {
            retryable: false,
            fetches: AtomicUsize::new(0),
        };
        let poller = Poller::new(PollOptions::default());
        let cancel = CancellationToken::new();

        let outcome = poller
            .poll_until_match(&trigger_at(Utc::now()), &source, &cancel)
            .await;

        match outcome {
            PollOutcome::Failed(PollFailure::NonRetryable(reason)) => {
                assert_eq!(reason, "authorization revoked")
            }
            other => panic!("expected NonRetryable, got {other:?}"),
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_condition_matches_any_observation() {
        let ancient = Utc::now() - chrono::Duration::days(365);
        let source = ScriptedSource::new(vec![Some(ancient)]);
        let poller = Poller::with_condition(PollOptions::default(), MatchCondition::Presence);
        let cancel = CancellationToken::new();

        let outcome = poller
            .poll_until_match(&trigger_at(Utc::now()), &source, &cancel)
            .await;

        assert!(outcome.is_matched(), "presence ignores timestamps");
    }
}
