use crate::config::{InFlightPolicy, RunnerConfig};
use crate::error::{Result, RunnerError};
use crate::io::{create_run_dir, new_run_id};
use crate::process::{CancellationToken, LaunchContext, Launcher, ProcessLauncher};
use crate::report::{BatchReport, RunResult};
use crate::spec::{task_name, RunSpecification};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryState {
    Empty,
    Populated,
    Executing,
    Completed,
}

/// Holds one specification per task name, in registration order.
/// Registration closes for good once anything has been executed.
#[derive(Debug)]
pub struct TaskRegistry {
    specs: Vec<RunSpecification>,
    by_name: BTreeMap<String, usize>,
    state: RegistryState,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            specs: Vec::new(),
            by_name: BTreeMap::new(),
            state: RegistryState::Empty,
        }
    }

    pub fn state(&self) -> RegistryState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn tasks(&self) -> &[RunSpecification] {
        &self.specs
    }

    /// Accepts a task name (`runFlock`) or a descriptor name (`flock`).
    pub fn get(&self, name: &str) -> Option<&RunSpecification> {
        self.position(name).map(|i| &self.specs[i])
    }

    fn position(&self, name: &str) -> Option<usize> {
        if let Some(&i) = self.by_name.get(name) {
            return Some(i);
        }
        task_name(name)
            .ok()
            .and_then(|derived| self.by_name.get(&derived).copied())
    }

    fn ensure_open(&self, name: &str) -> Result<()> {
        match self.state {
            RegistryState::Empty | RegistryState::Populated => Ok(()),
            RegistryState::Executing | RegistryState::Completed => {
                Err(RunnerError::RegistrySealed(name.to_string()))
            }
        }
    }

    pub fn register(&mut self, spec: RunSpecification) -> Result<()> {
        self.register_all(vec![spec])
    }

    /// All-or-nothing: a collision anywhere leaves the registry unchanged.
    pub fn register_all(&mut self, specs: Vec<RunSpecification>) -> Result<()> {
        let mut incoming: BTreeMap<&str, &Path> = BTreeMap::new();
        for spec in &specs {
            let name = spec.task_name();
            self.ensure_open(name)?;
            let existing = self
                .by_name
                .get(name)
                .map(|&i| self.specs[i].descriptor().path.as_path())
                .or_else(|| incoming.get(name).copied());
            if let Some(existing) = existing {
                return Err(RunnerError::DuplicateTask {
                    name: name.to_string(),
                    existing: existing.to_path_buf(),
                    incoming: spec.descriptor().path.clone(),
                });
            }
            incoming.insert(name, &spec.descriptor().path);
        }
        for spec in specs {
            self.by_name.insert(spec.task_name().to_string(), self.specs.len());
            self.specs.push(spec);
        }
        if !self.specs.is_empty() {
            self.state = RegistryState::Populated;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub concurrency: usize,
    pub on_cancel: InFlightPolicy,
    /// Cancel the rest of the batch after the first unsuccessful run.
    pub fail_fast: bool,
    /// Root for per-batch run directories; `None` disables capture.
    pub logs_dir: Option<PathBuf>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            on_cancel: InFlightPolicy::Finish,
            fail_fast: false,
            logs_dir: None,
        }
    }
}

impl ExecutionOptions {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            on_cancel: config.on_cancel,
            fail_fast: false,
            logs_dir: config.logs_dir.clone(),
        }
    }
}

/// Drives the registered specifications through a [`Launcher`].
pub struct Orchestrator<L: Launcher = ProcessLauncher> {
    registry: TaskRegistry,
    launcher: L,
    options: ExecutionOptions,
    cancel: CancellationToken,
}

impl Orchestrator<ProcessLauncher> {
    pub fn with_process_launcher(options: ExecutionOptions) -> Self {
        Self::new(ProcessLauncher::default(), options)
    }
}

impl<L: Launcher> Orchestrator<L> {
    pub fn new(launcher: L, options: ExecutionOptions) -> Self {
        Self {
            registry: TaskRegistry::new(),
            launcher,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn register(&mut self, spec: RunSpecification) -> Result<()> {
        self.registry.register(spec)
    }

    pub fn register_all(&mut self, specs: Vec<RunSpecification>) -> Result<()> {
        let count = specs.len();
        self.registry.register_all(specs)?;
        info!(count, total = self.registry.len(), "registered simulation tasks");
        Ok(())
    }

    /// Cancelling this token stops new runs from starting in every current
    /// and future batch of this orchestrator.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every registered task. Safe to call again after completion; each
    /// call re-executes everything under a fresh run id.
    pub fn run_all(&mut self) -> Result<BatchReport> {
        let indices: Vec<usize> = (0..self.registry.len()).collect();
        self.execute(&indices)
    }

    pub fn run(&mut self, name: &str) -> Result<RunResult> {
        self.run_report(name)?
            .results
            .into_iter()
            .next()
            .ok_or_else(|| RunnerError::UnknownTask(name.to_string()))
    }

    /// Like [`Orchestrator::run`] but keeps the batch envelope (run id,
    /// run directory) around the single result.
    pub fn run_report(&mut self, name: &str) -> Result<BatchReport> {
        let index = self
            .registry
            .position(name)
            .ok_or_else(|| RunnerError::UnknownTask(name.to_string()))?;
        self.execute(&[index])
    }

    fn execute(&mut self, indices: &[usize]) -> Result<BatchReport> {
        let (run_id, run_dir) = match &self.options.logs_dir {
            Some(root) => {
                let (run_id, dir) = create_run_dir(root)?;
                (run_id, Some(dir))
            }
            None => (new_run_id(), None),
        };

        self.registry.state = RegistryState::Executing;
        info!(
            run_id = %run_id,
            tasks = indices.len(),
            concurrency = self.options.concurrency,
            "starting batch"
        );
        let results = run_slots(
            &self.launcher,
            &self.registry.specs,
            indices,
            &self.options,
            &self.cancel,
            run_dir.as_deref(),
        );
        self.registry.state = RegistryState::Completed;

        let report = BatchReport::new(run_id, run_dir, results);
        if let Some(dir) = &report.run_dir {
            if let Err(e) = report.write_json(&dir.join("report.json")) {
                warn!(error = %e, "failed to write batch report");
            }
        }
        info!(
            run_id = %report.run_id,
            passed = report.passed(),
            total = report.total(),
            "batch finished"
        );
        Ok(report)
    }
}

/// Workers pull the next index from a shared counter and write each result
/// into that index's own slot, so the returned order is always the
/// registration order.
fn run_slots<L: Launcher>(
    launcher: &L,
    specs: &[RunSpecification],
    indices: &[usize],
    options: &ExecutionOptions,
    cancel: &CancellationToken,
    run_dir: Option<&Path>,
) -> Vec<RunResult> {
    let batch_cancel = cancel.child();
    let slots: Vec<OnceLock<RunResult>> = indices.iter().map(|_| OnceLock::new()).collect();
    let next = AtomicUsize::new(0);
    let workers = options.concurrency.clamp(1, indices.len().max(1));

    let work = || {
        let ctx = LaunchContext {
            run_dir,
            cancel: &batch_cancel,
            on_cancel: options.on_cancel,
        };
        loop {
            let slot = next.fetch_add(1, Ordering::SeqCst);
            if slot >= indices.len() {
                break;
            }
            let spec = &specs[indices[slot]];
            let result = if batch_cancel.is_cancelled() {
                info!(task = spec.task_name(), "skipping run, batch cancelled");
                RunResult::cancelled(spec.task_name(), &spec.descriptor().name)
            } else {
                launcher.launch(spec, &ctx)
            };
            if options.fail_fast && !result.is_success() && !batch_cancel.is_cancelled() {
                warn!(task = spec.task_name(), "fail-fast: cancelling remaining runs");
                batch_cancel.cancel();
            }
            let _ = slots[slot].set(result);
        }
    };

    if workers == 1 {
        work();
    } else {
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(&work);
            }
        });
    }

    slots
        .into_iter()
        .zip(indices)
        .map(|(slot, &i)| {
            slot.into_inner().unwrap_or_else(|| {
                RunResult::cancelled(specs[i].task_name(), &specs[i].descriptor().name)
            })
        })
        .collect()
}
