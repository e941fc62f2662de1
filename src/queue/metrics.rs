//! Aggregate statistics over finished runs

use serde::Serialize;

use crate::models::{round4, RunRecord, RunStatus};

/// Pass/fail/error rates and duration statistics.
///
/// Duration fields are `None` when there is no data, so "no runs" is never
/// mistaken for "zero duration".
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregateMetrics {
    pub total_runs: usize,
    pub pass_rate: f64,
    pub fail_rate: f64,
    pub error_rate: f64,
    pub mean_duration_s: Option<f64>,
    pub median_duration_s: Option<f64>,
    pub p95_duration_s: Option<f64>,
    pub last_run_id: String,
}

impl AggregateMetrics {
    /// Compute metrics over finished runs given oldest first
    pub fn from_runs(runs: &[RunRecord]) -> Self {
        let total = runs.len();
        if total == 0 {
            return Self::default();
        }

        let count = |status: RunStatus| runs.iter().filter(|r| r.status == status).count();
        let denom = total as f64;

        let mut durations: Vec<f64> = runs.iter().filter_map(|r| r.duration_s).collect();
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mean = (!durations.is_empty())
            .then(|| round4(durations.iter().sum::<f64>() / durations.len() as f64));

        Self {
            total_runs: total,
            pass_rate: count(RunStatus::Passed) as f64 / denom,
            fail_rate: count(RunStatus::Failed) as f64 / denom,
            error_rate: count(RunStatus::Error) as f64 / denom,
            mean_duration_s: mean,
            median_duration_s: median(&durations),
            p95_duration_s: percentile(&durations, 0.95),
            last_run_id: runs.last().map(|r| r.run_id.clone()).unwrap_or_default(),
        }
    }

    /// Format as summary string
    pub fn format_summary(&self) -> String {
        let secs = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |d| format!("{d:.3}s"));
        format!(
            "runs={} pass={:.1}% fail={:.1}% error={:.1}% mean={} median={} p95={}",
            self.total_runs,
            self.pass_rate * 100.0,
            self.fail_rate * 100.0,
            self.error_rate * 100.0,
            secs(self.mean_duration_s),
            secs(self.median_duration_s),
            secs(self.p95_duration_s),
        )
    }
}

/// Median of sorted values
fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let mid = n / 2;
    if n % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Nearest-rank percentile of sorted values, index `round(p * (n - 1))`
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = (p * (sorted.len() - 1) as f64).round() as usize;
    Some(sorted[idx.min(sorted.len() - 1)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunFilters;

    fn run(status: RunStatus, duration: Option<f64>) -> RunRecord {
        let mut run = RunRecord::new(RunFilters::new());
        run.status = status;
        run.duration_s = duration;
        run
    }

    #[test]
    fn test_empty_metrics() {
        let m = AggregateMetrics::from_runs(&[]);
        assert_eq!(m.total_runs, 0);
        assert_eq!(m.pass_rate, 0.0);
        assert_eq!(m.fail_rate, 0.0);
        assert_eq!(m.error_rate, 0.0);
        assert!(m.mean_duration_s.is_none());
        assert!(m.median_duration_s.is_none());
        assert!(m.p95_duration_s.is_none());
        assert!(m.last_run_id.is_empty());
        assert!(m.format_summary().contains("mean=n/a"));
    }

    #[test]
    fn test_rates_sum_to_one() {
        let runs = vec![
            run(RunStatus::Passed, Some(0.1)),
            run(RunStatus::Failed, Some(0.2)),
            run(RunStatus::Error, None),
        ];
        let m = AggregateMetrics::from_runs(&runs);
        assert_eq!(m.total_runs, 3);
        assert!((m.pass_rate + m.fail_rate + m.error_rate - 1.0).abs() < 1e-9);
        assert_eq!(m.last_run_id, runs[2].run_id);
    }

    #[test]
    fn test_duration_statistics() {
        let durations = [0.20, 0.01, 0.05, 0.10, 0.02];
        let runs: Vec<RunRecord> = durations
            .iter()
            .map(|d| run(RunStatus::Passed, Some(*d)))
            .collect();
        let m = AggregateMetrics::from_runs(&runs);
        assert_eq!(m.pass_rate, 1.0);
        assert_eq!(m.mean_duration_s, Some(0.076));
        assert_eq!(m.median_duration_s, Some(0.05));
        // round(0.95 * 4) = 4 -> largest value
        assert_eq!(m.p95_duration_s, Some(0.20));
    }

    #[test]
    fn test_even_median_and_percentile_index() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(median(&sorted), Some(2.5));
        // round(0.95 * 3) = 3
        assert_eq!(percentile(&sorted, 0.95), Some(4.0));
        assert_eq!(percentile(&[7.0], 0.95), Some(7.0));
        let twenty: Vec<f64> = (1..=20).map(f64::from).collect();
        // round(0.95 * 19) = round(18.05) = 18
        assert_eq!(percentile(&twenty, 0.95), Some(19.0));
    }
}
