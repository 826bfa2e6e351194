use crate::error::Result;
use crate::io::atomic_write_json_pretty;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_EXIT_CODE: i32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// The simulator ran and exited non-zero, or died from a signal.
    Failed { exit_code: Option<i32> },
    /// The simulator could not be started.
    LaunchFailed { message: String },
    /// The simulator started but its exit status could not be collected.
    WaitFailed { message: String },
    /// Never started, or terminated, because the batch was cancelled.
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "pass",
            Self::Failed { .. } => "FAIL",
            Self::LaunchFailed { .. } => "LAUNCH-ERROR",
            Self::WaitFailed { .. } => "WAIT-ERROR",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub task_name: String,
    pub descriptor: String,
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "duration_as_millis")]
    pub duration: Duration,
    pub stdout_log: Option<PathBuf>,
    pub stderr_log: Option<PathBuf>,
}

impl RunResult {
    pub fn cancelled(task_name: &str, descriptor: &str) -> Self {
        Self {
            task_name: task_name.to_string(),
            descriptor: descriptor.to_string(),
            outcome: RunOutcome::Cancelled,
            exit_code: None,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            stdout_log: None,
            stderr_log: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

fn duration_as_millis<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
}

/// Results of one batch, in discovery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub run_id: String,
    pub run_dir: Option<PathBuf>,
    pub results: Vec<RunResult>,
    pub success: bool,
}

impl BatchReport {
    pub fn new(run_id: String, run_dir: Option<PathBuf>, results: Vec<RunResult>) -> Self {
        let success = results.iter().all(RunResult::is_success);
        Self {
            run_id,
            run_dir,
            results,
            success,
        }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.passed()
    }

    /// 0 when everything passed, otherwise the failure count capped at
    /// [`MAX_EXIT_CODE`].
    pub fn exit_code(&self) -> i32 {
        let failed = i32::try_from(self.failed()).unwrap_or(i32::MAX);
        failed.min(MAX_EXIT_CODE)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let value = serde_json::to_value(self)?;
        atomic_write_json_pretty(path, &value)
    }

    /// Plain-text pass/fail table.
    pub fn render_table(&self) -> String {
        let width = self
            .results
            .iter()
            .map(|r| r.task_name.len())
            .max()
            .unwrap_or(4)
            .max(4);
        let mut out = String::new();
        out.push_str(&format!(
            "{:<width$}  {:<12}  {:>6}  {:>10}\n",
            "task",
            "result",
            "exit",
            "duration",
            width = width
        ));
        for r in &self.results {
            let exit = r
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "{:<width$}  {:<12}  {:>6}  {:>9.1}s\n",
                r.task_name,
                r.outcome.label(),
                exit,
                r.duration.as_secs_f64(),
                width = width
            ));
            if let RunOutcome::LaunchFailed { message } | RunOutcome::WaitFailed { message } =
                &r.outcome
            {
                out.push_str(&format!("{:<width$}  -> {}\n", "", message, width = width));
            }
        }
        out.push_str(&format!(
            "{}/{} simulations passed\n",
            self.passed(),
            self.total()
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(task: &str, outcome: RunOutcome) -> RunResult {
        RunResult {
            task_name: task.to_string(),
            descriptor: task.trim_start_matches("run").to_lowercase(),
            exit_code: match &outcome {
                RunOutcome::Succeeded => Some(0),
                RunOutcome::Failed { exit_code } => *exit_code,
                _ => None,
            },
            outcome,
            started_at: Utc::now(),
            duration: Duration::from_millis(1500),
            stdout_log: None,
            stderr_log: None,
        }
    }

    #[test]
    fn success_is_and_of_all_runs() {
        let ok = BatchReport::new(
            "run_x".to_string(),
            None,
            vec![result("runA", RunOutcome::Succeeded), result("runB", RunOutcome::Succeeded)],
        );
        assert!(ok.success);
        assert_eq!(ok.exit_code(), 0);
        assert!(ok.render_table().contains("2/2 simulations passed"));

        let bad = BatchReport::new(
            "run_y".to_string(),
            None,
            vec![
                result("runA", RunOutcome::Failed { exit_code: Some(3) }),
                result("runB", RunOutcome::Succeeded),
                result(
                    "runC",
                    RunOutcome::LaunchFailed {
                        message: "No such file or directory".to_string(),
                    },
                ),
            ],
        );
        assert!(!bad.success);
        assert_eq!(bad.failed(), 2);
        assert_eq!(bad.exit_code(), 2);
        let table = bad.render_table();
        assert!(table.contains("FAIL"));
        assert!(table.contains("LAUNCH-ERROR"));
        assert!(table.contains("No such file or directory"));
    }

    #[test]
    fn wait_failure_keeps_its_message() {
        let report = BatchReport::new(
            "run_wait".to_string(),
            None,
            vec![result(
                "runA",
                RunOutcome::WaitFailed {
                    message: "Interrupted system call".to_string(),
                },
            )],
        );
        assert_eq!(report.exit_code(), 1);
        let table = report.render_table();
        assert!(table.contains("WAIT-ERROR"));
        assert!(table.contains("Interrupted system call"));
        let value = serde_json::to_value(&report).expect("json");
        assert_eq!(value["results"][0]["outcome"]["status"], "wait_failed");
        assert_eq!(
            value["results"][0]["outcome"]["message"],
            "Interrupted system call"
        );
    }

    #[test]
    fn empty_batch_is_successful() {
        let report = BatchReport::new("run_empty".to_string(), None, Vec::new());
        assert!(report.success);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn exit_code_is_capped() {
        let results = (0..150)
            .map(|i| result(&format!("run{}", i), RunOutcome::Failed { exit_code: Some(1) }))
            .collect();
        let report = BatchReport::new("run_many".to_string(), None, results);
        assert_eq!(report.exit_code(), MAX_EXIT_CODE);
    }

    #[test]
    fn json_shape_is_stable() {
        let report = BatchReport::new(
            "run_json".to_string(),
            None,
            vec![result("runA", RunOutcome::Failed { exit_code: Some(2) })],
        );
        let value = serde_json::to_value(&report).expect("json");
        assert_eq!(value["success"], serde_json::json!(false));
        assert_eq!(value["results"][0]["outcome"]["status"], "failed");
        assert_eq!(value["results"][0]["outcome"]["exit_code"], 2);
        assert_eq!(value["results"][0]["duration_ms"], 1500);
    }
}
