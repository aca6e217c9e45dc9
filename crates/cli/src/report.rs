//! Human and machine renderings of a run report.

use helios_core::progress::{RunReport, RunStatus};
use std::collections::BTreeMap;
use std::fmt::Write;

pub fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "completed",
        RunStatus::Degraded => "completed with reduced capacity",
        RunStatus::AllWorkersFailed => "failed: no live workers",
        RunStatus::Interrupted => "interrupted",
    }
}

fn breakdown<K: serde::Serialize>(counts: &BTreeMap<K, u64>) -> String {
    let parts: Vec<String> = counts
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(k, n)| {
            let key = serde_json::to_value(k)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            format!("{key}: {n}")
        })
        .collect();
    if parts.is_empty() {
        String::new()
    } else {
        format!("  ({})", parts.join(", "))
    }
}

pub fn render_text(report: &RunReport) -> String {
    let t = &report.tally;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Helios run {} in {:.1}s",
        status_label(report.status),
        report.elapsed_ms as f64 / 1000.0
    );
    let _ = writeln!(out, "  discovered        {}", t.discovered);
    let _ = writeln!(out, "  succeeded         {}", t.succeeded);
    let _ = writeln!(out, "  failed            {}{}", t.total_failed(), breakdown(&t.failed));
    let _ = writeln!(out, "  skipped           {}{}", t.total_skipped(), breakdown(&t.skipped));
    let _ = writeln!(out, "  discovery errors  {}", t.discovery_errors);
    let _ = writeln!(out, "  results dropped   {}", t.results_dropped);
    let _ = writeln!(out, "  worker restarts   {}", report.worker_restarts);
    if !report.degraded_slots.is_empty() {
        let _ = writeln!(
            out,
            "warning: worker slots permanently lost: {}",
            join_ids(&report.degraded_slots)
        );
    }
    if !report.force_stopped.is_empty() {
        let _ = writeln!(
            out,
            "warning: workers force-stopped at shutdown: {}",
            join_ids(&report.force_stopped)
        );
    }
    out
}

pub fn render_json(report: &RunReport) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

fn join_ids(ids: &[usize]) -> String {
    ids.iter().map(usize::to_string).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use helios_core::models::{FailureKind, SkipReason};
    use helios_core::progress::Tally;
    use std::time::Duration;

    fn report(degraded: Vec<usize>) -> RunReport {
        let mut tally = Tally {
            discovered: 5,
            succeeded: 3,
            ..Tally::default()
        };
        tally.failed.insert(FailureKind::InvalidInput, 1);
        tally.failed.insert(FailureKind::WorkerCrash, 0);
        tally.skipped.insert(SkipReason::Unreadable, 1);
        RunReport::new(tally, true, false, degraded, vec![], 2, Duration::from_millis(1500))
    }

    #[test]
    fn text_lists_counts_and_reasons() {
        let text = render_text(&report(vec![]));
        assert!(text.starts_with("Helios run completed in 1.5s"));
        assert!(text.contains("failed            1  (invalid_input: 1)"));
        assert!(!text.contains("worker_crash"));
        assert!(text.contains("skipped           1  (unreadable: 1)"));
        assert!(text.contains("worker restarts   2"));
        assert!(!text.contains("warning"));
    }

    #[test]
    fn degraded_run_warns() {
        let text = render_text(&report(vec![1, 3]));
        assert!(text.contains("reduced capacity"));
        assert!(text.contains("warning: worker slots permanently lost: 1, 3"));
    }

    #[test]
    fn json_flattens_tally() {
        let json: serde_json::Value = serde_json::from_str(&render_json(&report(vec![])).unwrap()).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["succeeded"], 3);
        assert_eq!(json["failed"]["invalid_input"], 1);
        assert_eq!(json["skipped"]["unreadable"], 1);
    }
}
