use std::fmt::Write as _;
use std::path::Path;

use anyhow::bail;
use muxgate_load::{StressReport, run_stress};
use tracing::{info, warn};

/// Command-line overrides for the `[load]` section.
#[derive(Debug, Default, Clone, Copy)]
pub struct Overrides {
    pub workers: Option<usize>,
    pub requests: Option<usize>,
}

pub async fn run(
    path: Option<&Path>,
    overrides: Overrides,
    iterations: usize,
    format: &str,
) -> anyhow::Result<()> {
    let mut config = super::load_config(path)?;
    if let Some(workers) = overrides.workers {
        config.load.workers = workers;
    }
    if let Some(requests) = overrides.requests {
        config.load.requests = requests;
    }
    config.validate()?;

    let mut failed = 0;
    for iteration in 1..=iterations.max(1) {
        let report = run_stress(&config).await?;
        let dispatch = &report.dispatch;
        info!(
            iteration,
            iterations,
            requests = dispatch.records.len(),
            completed = dispatch.completed(),
            retries = dispatch.retries(),
            connections = report.connections.len(),
            elapsed_ms = dispatch.elapsed_ms,
            "stress iteration finished"
        );
        match format {
            "json" => println!(
                "{}",
                serde_json::to_string(&serde_json::json!({
                    "iteration": iteration,
                    "ok": report.is_ok(),
                    "problems": report.problems(),
                    "report": &report,
                }))?
            ),
            _ => print!("{}", format_report(iteration, &report)),
        }
        if !report.is_ok() {
            warn!(iteration, problems = report.problems().len(), "stress iteration failed");
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} of {iterations} stress iterations failed");
    }
    Ok(())
}

fn format_report(iteration: usize, report: &StressReport) -> String {
    let dispatch = &report.dispatch;
    let verification = &report.verification;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "iteration {iteration}: {} requests, {} completed, {} retries, {} ms",
        dispatch.records.len(),
        dispatch.completed(),
        dispatch.retries(),
        dispatch.elapsed_ms
    );
    for (kind, count) in dispatch.failures_by_kind() {
        let _ = writeln!(out, "  failed {kind}: {count}");
    }
    if dispatch.panicked() > 0 {
        let _ = writeln!(out, "  panicked: {}", dispatch.panicked());
    }
    let drained = report.connections.iter().filter(|c| c.is_drained()).count();
    let _ = writeln!(
        out,
        "  connections: {} dialed, {drained} drained",
        report.connections.len()
    );
    let _ = writeln!(
        out,
        "  verified: {} completed, {} incomplete, {} mismatches",
        verification.completed,
        verification.incomplete,
        verification.mismatches.len()
    );
    let problems = report.problems();
    if problems.is_empty() {
        let _ = writeln!(out, "✓ ok");
    } else {
        for problem in problems {
            let _ = writeln!(out, "✗ {problem}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxgate_load::{GoAwayPolicy, LoadConfig};

    #[tokio::test]
    async fn text_report_summarises_a_run() {
        let mut config = LoadConfig::default();
        config.load.workers = 2;
        config.load.requests = 6;
        config.responder.goaway = GoAwayPolicy::Never;
        let report = run_stress(&config).await.unwrap();

        let text = format_report(1, &report);
        assert!(text.starts_with("iteration 1: 6 requests, 6 completed"));
        assert!(text.contains("1 dialed, 1 drained"));
        assert!(text.ends_with("✓ ok\n"));
    }

    #[tokio::test]
    async fn every_iteration_runs_with_overrides() {
        let overrides = Overrides {
            workers: Some(2),
            requests: Some(6),
        };
        run(None, overrides, 2, "json").await.unwrap();
    }
}
