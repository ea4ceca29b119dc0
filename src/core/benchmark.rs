// Benchmark for repeated execute-and-retrieve cycles.
//
// Used to answer "how fast can we iterate on a remote script?" - each cycle
// runs the function, waits for its logs through the shared poller, and
// records where the time went.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::retrieval::{LogRetrievalService, LogSource, RetrievalError, ScriptRunner};

/// Pause between cycles so back-to-back executions don't trip rate limits.
const CYCLE_PAUSE: Duration = Duration::from_secs(3);

/// Timing breakdown for one cycle.
#[derive(Debug, Clone)]
pub struct CycleResult {
    pub cycle: u32,
    pub execute_time: Duration,
    pub log_time: Duration,
    pub total_time: Duration,
    pub success: bool,
    pub entries_retrieved: usize,
    pub error: Option<String>,
}

/// Qualitative tier for the average cycle time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    Excellent,
    Good,
    Fair,
    Slow,
}

impl Assessment {
    pub fn from_average(avg: Duration) -> Self {
        match avg.as_secs() {
            0..=29 => Assessment::Excellent,
            30..=59 => Assessment::Good,
            60..=119 => Assessment::Fair,
            _ => Assessment::Slow,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Assessment::Excellent => "EXCELLENT: sub-30 second average cycle time",
            Assessment::Good => "GOOD: under 1 minute average cycle time",
            Assessment::Fair => "FAIR: 1-2 minute cycle times, room for improvement",
            Assessment::Slow => "SLOW: >2 minute cycle times, optimization needed",
        }
    }
}

/// Aggregated results across all cycles.
#[derive(Debug)]
pub struct BenchmarkSummary {
    pub results: Vec<CycleResult>,
}

impl BenchmarkSummary {
    pub fn successful(&self) -> Vec<&CycleResult> {
        self.results.iter().filter(|r| r.success).collect()
    }

    pub fn failed(&self) -> Vec<&CycleResult> {
        self.results.iter().filter(|r| !r.success).collect()
    }

    pub fn average_total(&self) -> Option<Duration> {
        average(self.successful().iter().map(|r| r.total_time))
    }

    pub fn average_execute(&self) -> Option<Duration> {
        average(self.successful().iter().map(|r| r.execute_time))
    }

    pub fn average_log(&self) -> Option<Duration> {
        average(self.successful().iter().map(|r| r.log_time))
    }

    pub fn fastest(&self) -> Option<Duration> {
        self.successful().iter().map(|r| r.total_time).min()
    }

    pub fn slowest(&self) -> Option<Duration> {
        self.successful().iter().map(|r| r.total_time).max()
    }

    pub fn assessment(&self) -> Option<Assessment> {
        self.average_total().map(Assessment::from_average)
    }
}

fn average(durations: impl Iterator<Item = Duration>) -> Option<Duration> {
    let collected: Vec<Duration> = durations.collect();
    if collected.is_empty() {
        return None;
    }
    let total: Duration = collected.iter().sum();
    Some(total / collected.len() as u32)
}

/// Runs execute-and-retrieve cycles through the retrieval service.
pub struct BenchmarkRunner<R: ScriptRunner, L: LogSource> {
    service: LogRetrievalService<R, L>,
    pause: Duration,
}

impl<R, L> BenchmarkRunner<R, L>
where
    R: ScriptRunner,
    L: LogSource,
{
    pub fn new(service: LogRetrievalService<R, L>) -> Self {
        Self {
            service,
            pause: CYCLE_PAUSE,
        }
    }

    /// Run `cycles` iterations. A failed cycle is recorded and the run
    /// continues; cancellation stops the run early with the results so far.
    pub async fn run(&self, function: &str, cycles: u32, cancel: &CancellationToken) -> BenchmarkSummary {
        let mut results = Vec::with_capacity(cycles as usize);

        for cycle in 1..=cycles {
            tracing::info!("benchmark cycle {cycle}/{cycles}");
            let cycle_start = tokio::time::Instant::now();

            match self.service.run_and_retrieve(function, cancel).await {
                Ok(report) => {
                    let total_time = cycle_start.elapsed();
                    let execute_time = (report.execution.ended_at - report.execution.started_at)
                        .to_std()
                        .unwrap_or_default();
                    // Everything that wasn't the remote execution was spent
                    // waiting for and fetching logs.
                    let log_time = total_time.saturating_sub(execute_time);

                    tracing::info!(
                        "cycle {cycle} completed in {:.1}s (execution {:.1}s, logs {:.1}s)",
                        total_time.as_secs_f64(),
                        execute_time.as_secs_f64(),
                        log_time.as_secs_f64()
                    );

                    results.push(CycleResult {
                        cycle,
                        execute_time,
                        log_time,
                        total_time,
                        success: report.execution.success && !report.timed_out,
                        entries_retrieved: report.entries.len(),
                        error: None,
                    });
                }
                Err(RetrievalError::Cancelled) => {
                    tracing::info!("benchmark cancelled during cycle {cycle}");
                    break;
                }
                Err(err) => {
                    let total_time = cycle_start.elapsed();
                    tracing::error!(
                        "cycle {cycle} failed after {:.1}s: {err}",
                        total_time.as_secs_f64()
                    );
                    results.push(CycleResult {
                        cycle,
                        execute_time: Duration::ZERO,
                        log_time: Duration::ZERO,
                        total_time,
                        success: false,
                        entries_retrieved: 0,
                        error: Some(err.to_string()),
                    });
                }
            }

            if cycle < cycles {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.pause) => {}
                }
            }
        }

        BenchmarkSummary { results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::core::retrieval::{ExecutionRecord, InvocationFilter, LogEntry, TimeWindow};

    /// Runner whose first `failures` calls fail; the rest succeed.
    struct FlakyRunner {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl ScriptRunner for FlakyRunner {
        async fn run_function(&self, function: &str) -> Result<ExecutionRecord, RetrievalError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(RetrievalError::Execution("quota exceeded".to_string()));
            }
            let ended = Utc::now();
            Ok(ExecutionRecord {
                function: function.to_string(),
                started_at: ended - chrono::Duration::seconds(2),
                ended_at: ended,
                success: true,
                result: None,
                error: None,
            })
        }
    }

    /// Log source whose latest entry is always fresh, so the per-cycle
    /// poll matches on its first query and never sleeps.
    struct FreshLogs;

    #[async_trait]
    impl LogSource for FreshLogs {
        async fn list_entries(
            &self,
            _window: TimeWindow,
            _filter: InvocationFilter,
            _page_size: usize,
        ) -> Result<Vec<LogEntry>, RetrievalError> {
            Ok(vec![LogEntry {
                timestamp: Utc::now(),
                severity: "INFO".to_string(),
                message: Some("toggled 4 fonts".to_string()),
                invocation_type: Some("apps script api".to_string()),
            }])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycle_is_recorded_and_the_run_continues() {
        let runner = FlakyRunner {
            calls: AtomicUsize::new(0),
            failures: 1,
        };
        let service = LogRetrievalService::new(runner, FreshLogs);
        let summary = BenchmarkRunner::new(service)
            .run("toggleFonts", 3, &CancellationToken::new())
            .await;

        assert_eq!(summary.results.len(), 3, "a failure must not end the run");
        assert_eq!(summary.failed().len(), 1);
        assert_eq!(summary.successful().len(), 2);

        let failed = &summary.results[0];
        assert_eq!(failed.cycle, 1);
        assert!(!failed.success);
        assert!(
            failed.error.as_deref().unwrap_or("").contains("quota exceeded"),
            "the failure reason must ride the cycle result"
        );
        assert!(summary.results[1].success);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_the_pause_stops_the_run() {
        let runner = FlakyRunner {
            calls: AtomicUsize::new(0),
            failures: 0,
        };
        let service = LogRetrievalService::new(runner, FreshLogs);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        // The first cycle completes without sleeping; cancel one second
        // into the three-second pause that follows it.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let summary = BenchmarkRunner::new(service)
            .run("toggleFonts", 5, &cancel)
            .await;

        assert_eq!(summary.results.len(), 1, "run must stop during the pause");
        assert!(summary.results[0].success);
    }

    fn result(cycle: u32, total_secs: u64, success: bool) -> CycleResult {
        CycleResult {
            cycle,
            execute_time: Duration::from_secs(total_secs / 3),
            log_time: Duration::from_secs(total_secs - total_secs / 3),
            total_time: Duration::from_secs(total_secs),
            success,
            entries_retrieved: if success { 5 } else { 0 },
            error: (!success).then(|| "Apps Script API error: boom".to_string()),
        }
    }

    #[test]
    fn summary_averages_only_successful_cycles() {
        let summary = BenchmarkSummary {
            results: vec![result(1, 20, true), result(2, 40, true), result(3, 300, false)],
        };

        assert_eq!(summary.successful().len(), 2);
        assert_eq!(summary.failed().len(), 1);
        assert_eq!(summary.average_total(), Some(Duration::from_secs(30)));
        assert_eq!(summary.fastest(), Some(Duration::from_secs(20)));
        assert_eq!(summary.slowest(), Some(Duration::from_secs(40)));
    }

    #[test]
    fn summary_with_no_successes_has_no_averages() {
        let summary = BenchmarkSummary {
            results: vec![result(1, 10, false)],
        };
        assert_eq!(summary.average_total(), None);
        assert_eq!(summary.assessment(), None);
    }

    #[test]
    fn assessment_tiers_follow_cycle_time() {
        assert_eq!(
            Assessment::from_average(Duration::from_secs(29)),
            Assessment::Excellent
        );
        assert_eq!(
            Assessment::from_average(Duration::from_secs(30)),
            Assessment::Good
        );
        assert_eq!(
            Assessment::from_average(Duration::from_secs(119)),
            Assessment::Fair
        );
        assert_eq!(
            Assessment::from_average(Duration::from_secs(120)),
            Assessment::Slow
        );
    }
}
