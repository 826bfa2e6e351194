use crate::config::InFlightPolicy;
use crate::report::{RunOutcome, RunResult};
use crate::spec::RunSpecification;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cooperative cancellation shared between the orchestrator, its workers
/// and whoever wants to stop the batch. A child token observes its parent
/// but cancelling the child leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.flag)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .map(|p| p.load(Ordering::SeqCst))
                .unwrap_or(false)
    }
}

pub struct LaunchContext<'a> {
    /// Per-batch directory; output is captured under `<run_dir>/<task>/`
    /// when set.
    pub run_dir: Option<&'a Path>,
    pub cancel: &'a CancellationToken,
    pub on_cancel: InFlightPolicy,
}

/// Runs one specification to completion. Implementations never fail the
/// batch: problems are reported through [`RunOutcome`].
pub trait Launcher: Sync {
    fn launch(&self, spec: &RunSpecification, ctx: &LaunchContext<'_>) -> RunResult;
}

#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    poll_interval: Duration,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ProcessLauncher {
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

struct CapturedOutput {
    stdout: Stdio,
    stderr: Stdio,
    stdout_log: Option<PathBuf>,
    stderr_log: Option<PathBuf>,
}

fn open_capture(run_dir: Option<&Path>, task_name: &str) -> std::io::Result<CapturedOutput> {
    let Some(run_dir) = run_dir else {
        return Ok(CapturedOutput {
            stdout: Stdio::null(),
            stderr: Stdio::null(),
            stdout_log: None,
            stderr_log: None,
        });
    };
    let task_dir = run_dir.join(task_name);
    fs::create_dir_all(&task_dir)?;
    let stdout_log = task_dir.join("stdout.log");
    let stderr_log = task_dir.join("stderr.log");
    Ok(CapturedOutput {
        stdout: Stdio::from(fs::File::create(&stdout_log)?),
        stderr: Stdio::from(fs::File::create(&stderr_log)?),
        stdout_log: Some(stdout_log),
        stderr_log: Some(stderr_log),
    })
}

enum Exit {
    Natural(ExitStatus),
    Terminated,
}

/// Owns the child until it has been reaped. Dropping it early (panic,
/// error return) kills and waits, so no process or pipe outlives the run.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    fn wait(&mut self, ctx: &LaunchContext<'_>, poll: Duration) -> std::io::Result<Exit> {
        if ctx.on_cancel == InFlightPolicy::Finish {
            let status = self.child.wait()?;
            self.reaped = true;
            return Ok(Exit::Natural(status));
        }
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.reaped = true;
                return Ok(Exit::Natural(status));
            }
            if ctx.cancel.is_cancelled() {
                let _ = self.child.kill();
                self.child.wait()?;
                self.reaped = true;
                return Ok(Exit::Terminated);
            }
            thread::sleep(poll);
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, spec: &RunSpecification, ctx: &LaunchContext<'_>) -> RunResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut result = RunResult {
            task_name: spec.task_name().to_string(),
            descriptor: spec.descriptor().name.clone(),
            outcome: RunOutcome::Succeeded,
            exit_code: None,
            started_at,
            duration: Duration::ZERO,
            stdout_log: None,
            stderr_log: None,
        };

        let capture = match open_capture(ctx.run_dir, spec.task_name()) {
            Ok(c) => c,
            Err(e) => {
                warn!(task = spec.task_name(), error = %e, "cannot open output logs");
                result.outcome = RunOutcome::LaunchFailed {
                    message: format!("cannot open output logs: {}", e),
                };
                return result;
            }
        };
        result.stdout_log = capture.stdout_log;
        result.stderr_log = capture.stderr_log;

        let mut cmd = Command::new(spec.executable());
        cmd.args(spec.executable_args());
        cmd.args(spec.arguments());
        if let Some(dir) = spec.working_dir() {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(capture.stdout);
        cmd.stderr(capture.stderr);

        debug!(
            task = spec.task_name(),
            command = %shell_join(&spec.command_line()),
            "spawning simulator"
        );
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    task = spec.task_name(),
                    executable = %spec.executable().display(),
                    error = %e,
                    "simulator failed to start"
                );
                result.outcome = RunOutcome::LaunchFailed {
                    message: format!("failed to start {}: {}", spec.executable().display(), e),
                };
                result.duration = clock.elapsed();
                return result;
            }
        };
        info!(
            task = spec.task_name(),
            pid = child.id(),
            mode = spec.policy().mode(),
            "simulation started"
        );

        let mut guard = ChildGuard::new(child);
        let exit = guard.wait(ctx, self.poll_interval);
        result.duration = clock.elapsed();
        match &exit {
            Ok(Exit::Terminated) => {
                warn!(task = spec.task_name(), "simulation terminated on cancellation");
            }
            Err(e) => {
                warn!(task = spec.task_name(), error = %e, "lost track of simulator process");
            }
            Ok(Exit::Natural(_)) => {}
        }
        (result.outcome, result.exit_code) = outcome_of(exit);
        info!(
            task = spec.task_name(),
            result = result.outcome.label(),
            exit_code = ?result.exit_code,
            elapsed_ms = result.duration.as_millis() as u64,
            "simulation finished"
        );
        result
    }
}

fn outcome_of(exit: std::io::Result<Exit>) -> (RunOutcome, Option<i32>) {
    match exit {
        Ok(Exit::Natural(status)) if status.success() => (RunOutcome::Succeeded, status.code()),
        Ok(Exit::Natural(status)) => (
            RunOutcome::Failed {
                exit_code: status.code(),
            },
            status.code(),
        ),
        Ok(Exit::Terminated) => (RunOutcome::Cancelled, None),
        Err(e) => (
            RunOutcome::WaitFailed {
                message: format!("cannot collect exit status: {}", e),
            },
            None,
        ),
    }
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
