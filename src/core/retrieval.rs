// Execute a remote Apps Script function, then retrieve its Cloud Logging
// output once the eventually-consistent logging backend has caught up.
//
// The orchestration lives here so it can be tested without HTTP concerns;
// the Google API clients in `infra/` implement the traits below.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::poller::{
    LatestEventSource, ObservedEvent, PollFailure, PollOptions, PollOutcome, Poller, QueryError,
    TriggerEvent,
};

/// Errors raised by the execute-and-retrieve workflow.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Apps Script API error: {0}")]
    Execution(String),
    #[error("Cloud Logging API error: {0}")]
    Logging(String),
    #[error("authorization failed: {0}")]
    Unauthorized(String),
    #[error("log retrieval cancelled")]
    Cancelled,
}

/// One stack frame from a failed script execution.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub function: String,
    pub line: i64,
}

/// Error reported by the script itself (as opposed to the API call failing).
#[derive(Debug, Clone)]
pub struct ScriptError {
    pub message: String,
    pub error_type: String,
    pub stack: Vec<StackFrame>,
}

/// Metadata for one remote execution, used to correlate log entries.
/// Immutable once created.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub function: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<ScriptError>,
}

impl ExecutionRecord {
    fn trigger(&self) -> TriggerEvent {
        TriggerEvent {
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// A single Cloud Logging entry, independent of the wire format.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: String,
    pub message: Option<String>,
    pub invocation_type: Option<String>,
}

impl LogEntry {
    /// Entries produced by `scripts.run` carry the "apps script api"
    /// invocation type; manual runs from the script editor do not.
    pub fn is_api_invocation(&self) -> bool {
        self.invocation_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("apps script api"))
    }
}

/// Restricts a log query to API-triggered executions or allows any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationFilter {
    ApiOnly,
    Any,
}

/// Half-open is not needed here; both bounds are inclusive on the wire.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Runs a named function remotely. An API-level failure should still yield a
/// record with `success = false` where possible, so log retrieval can
/// proceed with the observed time window.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn run_function(&self, function: &str) -> Result<ExecutionRecord, RetrievalError>;
}

/// Queries log entries for a time window, newest first.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn list_entries(
        &self,
        window: TimeWindow,
        filter: InvocationFilter,
        page_size: usize,
    ) -> Result<Vec<LogEntry>, RetrievalError>;
}

/// How far back the latest-entry probe looks when checking whether fresh
/// logs have landed.
const PROBE_LOOKBACK: Duration = Duration::from_secs(60 * 60);
/// Window padding for the final retrieval: logs can be stamped slightly
/// before the execution started and keep arriving for a while after it ends.
const WINDOW_LEAD: Duration = Duration::from_secs(60);
const WINDOW_TRAIL: Duration = Duration::from_secs(120);

/// Adapter that turns a [`LogSource`] into the poller's query seam: fetch
/// the single most recent API-execution entry, falling back to any
/// invocation type when none exist.
struct LatestEntryProbe<'a, L: LogSource> {
    logs: &'a L,
}

#[async_trait]
impl<'a, L: LogSource> LatestEventSource for LatestEntryProbe<'a, L> {
    type Payload = LogEntry;

    async fn fetch_latest(&self) -> Result<Option<ObservedEvent<LogEntry>>, QueryError> {
        let now = Utc::now();
        let window = TimeWindow {
            start: now - chrono_duration(PROBE_LOOKBACK),
            end: now,
        };

        let entries = match self
            .logs
            .list_entries(window, InvocationFilter::ApiOnly, 5)
            .await
        {
            Ok(entries) if !entries.is_empty() => entries,
            Ok(_) => {
                tracing::debug!("no recent API-typed entries, probing any invocation type");
                self.logs
                    .list_entries(window, InvocationFilter::Any, 3)
                    .await
                    .map_err(classify)?
            }
            Err(err) => return Err(classify(err)),
        };

        Ok(entries.into_iter().next().map(|entry| ObservedEvent {
            timestamp: entry.timestamp,
            payload: entry,
        }))
    }
}

// The paddings above are small constants, so this conversion cannot fail.
fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

fn classify(err: RetrievalError) -> QueryError {
    match err {
        RetrievalError::Unauthorized(reason) => QueryError::NonRetryable(reason),
        other => QueryError::Transient(other.to_string()),
    }
}

/// Outcome of one execute-and-retrieve run.
#[derive(Debug)]
pub struct RunReport {
    pub execution: ExecutionRecord,
    pub entries: Vec<LogEntry>,
    /// How long the poller waited for logs to become visible.
    pub waited: Duration,
    /// Set when the poll budget elapsed; the entries are then a best-effort
    /// final retrieval and may not reflect this execution.
    pub timed_out: bool,
}

impl RunReport {
    /// Split entries into API executions and manual editor runs.
    pub fn partition_by_invocation(&self) -> (Vec<&LogEntry>, Vec<&LogEntry>) {
        self.entries.iter().partition(|e| e.is_api_invocation())
    }
}

/// Orchestrates execution and log retrieval over the two trait seams.
pub struct LogRetrievalService<R: ScriptRunner, L: LogSource> {
    runner: R,
    logs: L,
    poller: Poller,
}

impl<R, L> LogRetrievalService<R, L>
where
    R: ScriptRunner,
    L: LogSource,
{
    pub fn new(runner: R, logs: L) -> Self {
        Self::with_options(runner, logs, PollOptions::default())
    }

    pub fn with_options(runner: R, logs: L, options: PollOptions) -> Self {
        Self {
            runner,
            logs,
            poller: Poller::new(options),
        }
    }

    /// Execute `function` remotely, wait for its logs to land, and retrieve
    /// everything from the execution window.
    pub async fn run_and_retrieve(
        &self,
        function: &str,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RetrievalError> {
        tracing::info!("executing remote function '{function}'");
        let execution = self.runner.run_function(function).await?;

        if execution.success {
            tracing::info!(
                "execution finished at {} in {:.1}s",
                execution.ended_at.to_rfc3339(),
                (execution.ended_at - execution.started_at)
                    .num_milliseconds()
                    .max(0) as f64
                    / 1000.0
            );
        } else {
            tracing::warn!("execution reported failure; retrieving logs anyway");
        }

        self.retrieve_for(execution, cancel).await
    }

    /// Wait for the logs of an already-completed execution and retrieve them.
    pub async fn retrieve_for(
        &self,
        execution: ExecutionRecord,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RetrievalError> {
        let probe = LatestEntryProbe { logs: &self.logs };
        let outcome = self
            .poller
            .poll_until_match(&execution.trigger(), &probe, cancel)
            .await;

        let (waited, timed_out) = match outcome {
            PollOutcome::Matched { elapsed, .. } => (elapsed, false),
            PollOutcome::TimedOut { elapsed, .. } => (elapsed, true),
            PollOutcome::Failed(PollFailure::Cancelled) => {
                return Err(RetrievalError::Cancelled);
            }
            PollOutcome::Failed(PollFailure::NonRetryable(reason)) => {
                return Err(RetrievalError::Unauthorized(reason));
            }
        };

        let entries = self.retrieve_window(&execution).await?;
        Ok(RunReport {
            execution,
            entries,
            waited,
            timed_out,
        })
    }

    /// Fetch every entry from the padded execution window, preferring
    /// API-typed entries and falling back to an unfiltered query when the
    /// window holds none.
    async fn retrieve_window(
        &self,
        execution: &ExecutionRecord,
    ) -> Result<Vec<LogEntry>, RetrievalError> {
        let window = TimeWindow {
            start: execution.started_at - chrono_duration(WINDOW_LEAD),
            end: execution.ended_at + chrono_duration(WINDOW_TRAIL),
        };

        let api_entries = self
            .logs
            .list_entries(window, InvocationFilter::ApiOnly, 50)
            .await?;
        if !api_entries.is_empty() {
            tracing::info!("retrieved {} API execution log entries", api_entries.len());
            return Ok(api_entries);
        }

        tracing::info!("no API-typed entries in the window, falling back to unfiltered query");
        let entries = self
            .logs
            .list_entries(window, InvocationFilter::Any, 50)
            .await?;
        if entries.is_empty() {
            tracing::warn!("no log entries found in the execution window");
        }
        Ok(entries)
    }
}
