//! Discovers simulation descriptor files, turns each into a launch
//! specification for the external engine, and supervises the resulting
//! subprocesses as one batch.

pub mod config;
pub mod discovery;
pub mod error;
pub mod io;
pub mod policy;
pub mod process;
pub mod registry;
pub mod report;
pub mod spec;

pub use config::{EnvironmentSignals, InFlightPolicy, RunnerConfig};
pub use discovery::{descriptors_from_paths, discover, Discoverer, SimulationDescriptor};
pub use error::{Result, RunnerError};
pub use policy::{select_policy, ExecutionPolicy, MaxTime, PolicySettings};
pub use process::{shell_join, CancellationToken, LaunchContext, Launcher, ProcessLauncher};
pub use registry::{ExecutionOptions, Orchestrator, RegistryState, TaskRegistry};
pub use report::{BatchReport, RunOutcome, RunResult};
pub use spec::{task_name, RunSpecBuilder, RunSpecification};

/// Discovery followed by specification building. Any fatal error here
/// happens before a single simulation has been launched.
pub fn build_specs(
    config: &RunnerConfig,
    signals: EnvironmentSignals,
) -> Result<Vec<RunSpecification>> {
    config.validate()?;
    let builder = RunSpecBuilder::new(config, signals)?;
    let descriptors = Discoverer::new(&config.simulations_dir, &config.extension).scan()?;
    builder.build_all(&descriptors)
}

/// Discover, build and register everything under `config.simulations_dir`.
pub fn prepare<L: Launcher>(
    config: &RunnerConfig,
    signals: EnvironmentSignals,
    launcher: L,
    options: ExecutionOptions,
) -> Result<Orchestrator<L>> {
    let specs = build_specs(config, signals)?;
    let mut orchestrator = Orchestrator::new(launcher, options);
    orchestrator.register_all(specs)?;
    Ok(orchestrator)
}
