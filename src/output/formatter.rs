//! Output formatters for runs and metrics
//!
//! Provides Table, JSON, CSV and summary output formats.

use serde::Serialize;

use crate::models::{RunRecord, RunStatus};
use crate::queue::AggregateMetrics;
use crate::results::{FullOutput, PersistenceStats};

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "csv" => Some(OutputFormat::Csv),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

const CSV_HEADER: &str = "run_id,status,passed,failed,duration_s,filters,output_saved";

/// Run formatter
pub struct RunFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl RunFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    fn json<T: Serialize + ?Sized>(&self, value: &T) -> String {
        if self.format == OutputFormat::JsonPretty {
            serde_json::to_string_pretty(value).unwrap_or_default()
        } else {
            serde_json::to_string(value).unwrap_or_default()
        }
    }

    fn status_label(&self, status: RunStatus) -> String {
        let label = format!("{} {:7}", status.symbol(), status);
        if !self.colorize {
            return label;
        }
        let color = match status {
            RunStatus::Passed => "32",
            RunStatus::Failed | RunStatus::Error => "31",
            RunStatus::Queued | RunStatus::Running => "33",
        };
        format!("\x1b[{color}m{label}\x1b[0m")
    }

    /// Format a single run
    pub fn format_run(&self, run: &RunRecord) -> String {
        match self.format {
            OutputFormat::Table => self.format_run_table(run),
            OutputFormat::Json | OutputFormat::JsonPretty => self.json(run),
            OutputFormat::Csv => format!("{CSV_HEADER}\n{}", self.format_run_csv(run)),
            OutputFormat::Summary => run.to_string(),
        }
    }

    fn format_run_table(&self, run: &RunRecord) -> String {
        let mut output = String::new();
        output.push_str(&format!("Run:       {}\n", run.run_id));
        output.push_str(&format!("Status:    {}\n", self.status_label(run.status)));
        output.push_str(&format!("Filters:   {}\n", run.filters));
        output.push_str(&format!("Queued:    {}\n", run.queued_at.to_rfc3339()));
        if let Some(started) = run.started_at {
            output.push_str(&format!("Started:   {}\n", started.to_rfc3339()));
        }
        if let Some(finished) = run.finished_at {
            output.push_str(&format!("Finished:  {}\n", finished.to_rfc3339()));
        }
        if let Some(d) = run.duration_s {
            output.push_str(&format!("Duration:  {d:.3}s\n"));
        }
        output.push_str(&format!("Tests:     {} passed, {} failed\n", run.passed, run.failed));
        if run.is_truncated() {
            let saved = if run.output_saved { "saved" } else { "not saved" };
            output.push_str(&format!("Output:    truncated, full output {saved}\n"));
        }
        if !run.stdout.is_empty() {
            output.push_str("\n--- stdout ---\n");
            output.push_str(&run.stdout);
            output.push('\n');
        }
        if !run.stderr.is_empty() {
            output.push_str("\n--- stderr ---\n");
            output.push_str(&run.stderr);
            output.push('\n');
        }
        output
    }

    fn format_run_csv(&self, run: &RunRecord) -> String {
        format!(
            "{},{},{},{},{},\"{}\",{}",
            run.run_id,
            run.status.as_str(),
            run.passed,
            run.failed,
            run.duration_s.map(|d| d.to_string()).unwrap_or_default(),
            run.filters.to_string().replace('"', "\"\""),
            run.output_saved
        )
    }

    /// Format a run listing
    pub fn format_runs(&self, runs: &[RunRecord]) -> String {
        match self.format {
            OutputFormat::Table => self.format_runs_table(runs),
            OutputFormat::Json | OutputFormat::JsonPretty => self.json(runs),
            OutputFormat::Csv => {
                let mut output = String::from(CSV_HEADER);
                output.push('\n');
                for run in runs {
                    output.push_str(&self.format_run_csv(run));
                    output.push('\n');
                }
                output
            }
            OutputFormat::Summary => runs
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn format_runs_table(&self, runs: &[RunRecord]) -> String {
        if runs.is_empty() {
            return "No runs found".to_string();
        }
        let mut output = String::new();
        output.push_str(&format!(
            "{:28} {:9} {:>6} {:>6} {:>10}  {}\n",
            "RUN", "STATUS", "PASS", "FAIL", "DURATION", "FILTERS"
        ));
        output.push_str(&format!("{}\n", "─".repeat(80)));
        for run in runs {
            let duration = run
                .duration_s
                .map(|d| format!("{d:.2}s"))
                .unwrap_or_else(|| "-".to_string());
            output.push_str(&format!(
                "{:28} {} {:>6} {:>6} {:>10}  {}\n",
                run.run_id,
                self.status_label(run.status),
                run.passed,
                run.failed,
                duration,
                run.filters
            ));
        }
        output
    }

    /// Format aggregate metrics together with persistence health
    pub fn format_metrics(&self, metrics: &AggregateMetrics, health: &PersistenceStats) -> String {
        #[derive(Serialize)]
        struct MetricsJson<'a> {
            #[serde(flatten)]
            metrics: &'a AggregateMetrics,
            persistence: &'a PersistenceStats,
        }

        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.json(&MetricsJson {
                metrics,
                persistence: health,
            }),
            OutputFormat::Summary => metrics.format_summary(),
            OutputFormat::Table | OutputFormat::Csv => self.format_metrics_table(metrics, health),
        }
    }

    fn format_metrics_table(&self, metrics: &AggregateMetrics, health: &PersistenceStats) -> String {
        let secs = |v: Option<f64>| v.map_or_else(|| "n/a".to_string(), |d| format!("{d:.3}s"));
        let mut output = String::new();

        output.push_str("═══════════════════════════════════════════════\n");
        output.push_str(&format!(" Runs: {}\n", metrics.total_runs));
        output.push_str("═══════════════════════════════════════════════\n");
        output.push_str(&format!(" Pass rate:   {:5.1}%\n", metrics.pass_rate * 100.0));
        output.push_str(&format!(" Fail rate:   {:5.1}%\n", metrics.fail_rate * 100.0));
        output.push_str(&format!(" Error rate:  {:5.1}%\n", metrics.error_rate * 100.0));
        output.push_str(&format!(" Mean:        {}\n", secs(metrics.mean_duration_s)));
        output.push_str(&format!(" Median:      {}\n", secs(metrics.median_duration_s)));
        output.push_str(&format!(" p95:         {}\n", secs(metrics.p95_duration_s)));
        if !metrics.last_run_id.is_empty() {
            output.push_str(&format!(" Last run:    {}\n", metrics.last_run_id));
        }
        output.push_str("───────────────────────────────────────────────\n");
        output.push_str(&format!(" Log:         {}\n", health.persist_path.display()));
        output.push_str(&format!(" Errors:      {}\n", health.errors_total));
        if let Some(err) = &health.last_error {
            output.push_str(&format!(" Last error:  {err}\n"));
        }
        output
    }

    /// Format recovered full output
    pub fn format_full_output(&self, out: &FullOutput) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => self.json(out),
            _ => {
                let mut output = format!("# {} ({})\n", out.run_id, out.note);
                output.push_str(&out.stdout);
                if !out.stderr.is_empty() {
                    output.push_str("\n--- stderr ---\n");
                    output.push_str(&out.stderr);
                }
                output
            }
        }
    }
}

impl Default for RunFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunFilters;
    use chrono::Utc;

    fn finished(status: RunStatus) -> RunRecord {
        let mut run = RunRecord::new(RunFilters::new().keyword("queue"));
        run.claim(Utc::now());
        run.passed = 3;
        run.stdout = "a::PASSED".to_string();
        run.finish(status, Utc::now());
        run
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(OutputFormat::from_str("json"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::from_str("TABLE"), Some(OutputFormat::Table));
        assert_eq!(OutputFormat::from_str("unknown"), None);
    }

    #[test]
    fn test_formatter_creation() {
        let formatter = RunFormatter::new(OutputFormat::Json).no_color();
        assert_eq!(formatter.format, OutputFormat::Json);
        assert!(!formatter.colorize);
    }

    #[test]
    fn test_format_run_table() {
        let run = finished(RunStatus::Passed);
        let output = RunFormatter::default().no_color().format_run(&run);
        assert!(output.contains(&run.run_id));
        assert!(output.contains("PASSED"));
        assert!(output.contains("-k queue"));
        assert!(output.contains("--- stdout ---"));
    }

    #[test]
    fn test_format_runs_csv() {
        let runs = vec![finished(RunStatus::Passed), finished(RunStatus::Failed)];
        let output = RunFormatter::new(OutputFormat::Csv).format_runs(&runs);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert!(lines[2].contains(",failed,"));
    }

    #[test]
    fn test_format_runs_json() {
        let runs = vec![finished(RunStatus::Error)];
        let output = RunFormatter::new(OutputFormat::Json).format_runs(&runs);
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed[0]["status"], "error");
        assert_eq!(parsed[0]["k_expr"], "queue");
    }

    #[test]
    fn test_empty_listing() {
        let output = RunFormatter::default().format_runs(&[]);
        assert_eq!(output, "No runs found");
    }

    #[test]
    fn test_format_metrics_json_includes_health() {
        let metrics = AggregateMetrics::from_runs(&[finished(RunStatus::Passed)]);
        let health = PersistenceStats {
            errors_total: 2,
            last_error: Some("disk full".to_string()),
            last_error_ts: None,
            persist_path: "runs.jsonl".into(),
        };
        let output = RunFormatter::new(OutputFormat::Json).format_metrics(&metrics, &health);
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["total_runs"], 1);
        assert_eq!(parsed["pass_rate"], 1.0);
        assert_eq!(parsed["persistence"]["errors_total"], 2);

        let table = RunFormatter::default().format_metrics(&metrics, &health);
        assert!(table.contains("disk full"));
    }
}
