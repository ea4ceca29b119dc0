// Authorization completion monitoring.
//
// The OAuth flow is split in two: the CLI prints an authorization URL, the
// user grants access in a browser, and some other invocation (or the
// `auth exchange` command) writes the token file. This module watches for
// that token file to appear so scripted setups can block until the account
// is usable. The watch is an ordinary poll session with a presence match -
// not a separate loop implementation.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::poller::{
    LatestEventSource, MatchCondition, PollFailure, PollOptions, PollOutcome, Poller, TriggerEvent,
};

/// Scopes requested for the Apps Script operations this tool performs.
pub const OAUTH_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/drive",
    "https://www.googleapis.com/auth/script.projects",
    "https://www.googleapis.com/auth/presentations",
    "https://www.googleapis.com/auth/spreadsheets",
    "https://www.googleapis.com/auth/logging.read",
];

/// How the wait for authorization ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthWait {
    /// The token marker appeared after roughly this long.
    Completed(Duration),
    /// The user never finished authorizing within the budget.
    TimedOut(Duration),
    Cancelled,
}

/// Watches a marker source (the token file) until authorization completes.
pub struct AuthMonitor {
    poller: Poller,
}

impl AuthMonitor {
    /// Checks roughly every ten seconds for up to ten minutes, matching the
    /// cadence users expect from the setup instructions.
    pub fn new() -> Self {
        Self::with_options(PollOptions {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            backoff_exponent: 1.0,
            timeout: Duration::from_secs(10 * 60),
            match_tolerance: Duration::from_secs(5),
        })
    }

    pub fn with_options(options: PollOptions) -> Self {
        Self {
            poller: Poller::with_condition(options, MatchCondition::Presence),
        }
    }

    pub async fn wait_for_authorization<S>(
        &self,
        source: &S,
        cancel: &CancellationToken,
    ) -> AuthWait
    where
        S: LatestEventSource,
    {
        // Presence matching ignores the trigger timestamps; the session just
        // needs a starting point for its elapsed-time accounting.
        let now = chrono::Utc::now();
        let trigger = TriggerEvent {
            started_at: now,
            ended_at: now,
        };

        match self.poller.poll_until_match(&trigger, source, cancel).await {
            PollOutcome::Matched { elapsed, .. } => {
                tracing::info!("token marker detected, authorization complete");
                AuthWait::Completed(elapsed)
            }
            PollOutcome::TimedOut { elapsed, .. } => {
                tracing::warn!("authorization not completed in time, check manually");
                AuthWait::TimedOut(elapsed)
            }
            PollOutcome::Failed(PollFailure::Cancelled) => AuthWait::Cancelled,
            PollOutcome::Failed(PollFailure::NonRetryable(reason)) => {
                // The marker sources only report transient failures; treat
                // anything else like a timeout so callers see a terminal state.
                tracing::error!("authorization watch failed: {reason}");
                AuthWait::TimedOut(Duration::ZERO)
            }
        }
    }
}

impl Default for AuthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::poller::{ObservedEvent, QueryError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Marker that "appears" after a fixed number of fetches.
    struct DelayedMarker {
        appears_after: usize,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl LatestEventSource for DelayedMarker {
        type Payload = ();

        async fn fetch_latest(&self) -> Result<Option<ObservedEvent<()>>, QueryError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            if n >= self.appears_after {
                Ok(Some(ObservedEvent {
                    timestamp: chrono::Utc::now(),
                    payload: (),
                }))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_when_marker_appears() {
        let marker = DelayedMarker {
            appears_after: 3,
            fetches: AtomicUsize::new(0),
        };
        let monitor = AuthMonitor::new();

        let wait = monitor
            .wait_for_authorization(&marker, &CancellationToken::new())
            .await;

        match wait {
            AuthWait::Completed(elapsed) => {
                // Three misses at a flat 10s cadence.
                assert_eq!(elapsed, Duration::from_secs(30));
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_appearing_marker_times_out() {
        let marker = DelayedMarker {
            appears_after: usize::MAX,
            fetches: AtomicUsize::new(0),
        };
        let monitor = AuthMonitor::with_options(PollOptions {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            backoff_exponent: 1.0,
            timeout: Duration::from_secs(35),
            match_tolerance: Duration::from_secs(5),
        });

        let wait = monitor
            .wait_for_authorization(&marker, &CancellationToken::new())
            .await;

        assert!(matches!(wait, AuthWait::TimedOut(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn ctrl_c_maps_to_cancelled() {
        let marker = DelayedMarker {
            appears_after: usize::MAX,
            fetches: AtomicUsize::new(0),
        };
        let monitor = AuthMonitor::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        // Already-cancelled token fires on the first sleep.
        let wait = monitor
            .wait_for_authorization(&marker, &cancel)
            .await;
        assert_eq!(wait, AuthWait::Cancelled);
    }
}
