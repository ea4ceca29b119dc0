// Terminal rendering for run reports and benchmark summaries.

use crate::core::benchmark::BenchmarkSummary;
use crate::core::retrieval::{LogEntry, RunReport};

const RULE: &str = "════════════════════════════════════════════════════════════";

pub fn print_auth_instructions(url: &str) {
    println!("OAuth authorization URL:");
    println!("{RULE}");
    println!("{url}");
    println!("{RULE}");
    println!();
    println!("1. Open the URL in a browser and sign in");
    println!("2. Grant the requested permissions");
    println!("3. Copy the authorization code from the final page");
    println!("4. Run: gscript-ops auth exchange <code>");
}

pub fn print_run_report(report: &RunReport) {
    let execution = &report.execution;

    println!();
    println!("Execution of '{}'", execution.function);
    println!(
        "  started {} / ended {}",
        execution.started_at.to_rfc3339(),
        execution.ended_at.to_rfc3339()
    );
    println!("  success: {}", execution.success);

    if let Some(error) = &execution.error {
        println!("  script error ({}): {}", error.error_type, error.message);
        for frame in &error.stack {
            println!("    at {}:{}", frame.function, frame.line);
        }
    }

    if let Some(result) = &execution.result {
        println!("  result:");
        match serde_json::to_string_pretty(result) {
            Ok(pretty) => {
                for line in pretty.lines() {
                    println!("    {line}");
                }
            }
            Err(_) => println!("    {result}"),
        }
    }

    println!();
    if report.timed_out {
        println!(
            "Log poll timed out after {:.1}s; the entries below are best-effort",
            report.waited.as_secs_f64()
        );
    } else {
        println!(
            "Logs available after {:.1}s",
            report.waited.as_secs_f64()
        );
    }

    let (api, editor) = report.partition_by_invocation();

    println!("{RULE}");
    if report.entries.is_empty() {
        println!("No log entries found in the execution window");
    }
    if !api.is_empty() {
        println!("API executions ({} entries):", api.len());
        for (i, entry) in api.iter().enumerate() {
            print_entry(i + 1, entry);
        }
    }
    if !editor.is_empty() {
        println!("Editor executions ({} entries - manual runs):", editor.len());
        // Manual runs are noise here; show just a few for context.
        for (i, entry) in editor.iter().take(3).enumerate() {
            print_entry(i + 1, entry);
        }
        if editor.len() > 3 {
            println!("  ... and {} more editor executions", editor.len() - 3);
        }
    }
    println!("{RULE}");
}

fn print_entry(index: usize, entry: &LogEntry) {
    println!(
        "[{index}] {} [{}]",
        entry.timestamp.to_rfc3339(),
        entry.severity
    );
    if let Some(message) = &entry.message {
        println!("    {message}");
    }
}

pub fn print_benchmark(summary: &BenchmarkSummary) {
    println!();
    println!("BENCHMARK RESULTS");
    println!("{RULE}");
    println!(
        "Completed: {}/{} cycles",
        summary.successful().len(),
        summary.results.len()
    );

    if let (Some(avg), Some(fastest), Some(slowest)) =
        (summary.average_total(), summary.fastest(), summary.slowest())
    {
        println!();
        println!("Timing:");
        println!("  average cycle: {:.1}s", avg.as_secs_f64());
        println!("  fastest cycle: {:.1}s", fastest.as_secs_f64());
        println!("  slowest cycle: {:.1}s", slowest.as_secs_f64());
        if let Some(avg_execute) = summary.average_execute() {
            println!("  average execution: {:.1}s", avg_execute.as_secs_f64());
        }
        if let Some(avg_log) = summary.average_log() {
            println!("  average log retrieval: {:.1}s", avg_log.as_secs_f64());
        }

        println!();
        println!("Per cycle:");
        for result in summary.successful() {
            println!(
                "  cycle {}: {:.1}s (exec {:.1}s, logs {:.1}s, {} entries)",
                result.cycle,
                result.total_time.as_secs_f64(),
                result.execute_time.as_secs_f64(),
                result.log_time.as_secs_f64(),
                result.entries_retrieved
            );
        }

        if let Some(assessment) = summary.assessment() {
            println!();
            println!("Assessment: {}", assessment.describe());
        }
    }

    let failed = summary.failed();
    if !failed.is_empty() {
        println!();
        println!("Failed cycles:");
        for result in failed {
            println!(
                "  cycle {}: {}",
                result.cycle,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!("{RULE}");
}
