use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use sim_runner::{
    select_policy, shell_join, task_name, BatchReport, Discoverer, EnvironmentSignals,
    ExecutionOptions, InFlightPolicy, MaxTime, Orchestrator, PolicySettings, RunSpecification,
    RunnerConfig, RunnerError,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "runner", version, about = "Simulation batch runner")]
struct Cli {
    /// YAML config file (defaults to ./sim-runner.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OnCancelArg {
    #[value(name = "finish")]
    Finish,
    #[value(name = "terminate")]
    Terminate,
}

impl From<OnCancelArg> for InFlightPolicy {
    fn from(value: OnCancelArg) -> Self {
        match value {
            OnCancelArg::Finish => InFlightPolicy::Finish,
            OnCancelArg::Terminate => InFlightPolicy::Terminate,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct SelectionArgs {
    #[arg(long)]
    extension: Option<String>,
    /// Force headless mode, same as SIM_RUNNER_BATCH=true
    #[arg(long)]
    batch: bool,
    #[arg(long)]
    max_time: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the simulations that would become tasks
    Discover {
        dir: Option<PathBuf>,
        #[command(flatten)]
        selection: SelectionArgs,
        #[arg(long)]
        json: bool,
    },
    /// Run every discovered simulation
    RunAll {
        #[arg(long)]
        dir: Option<PathBuf>,
        #[command(flatten)]
        selection: SelectionArgs,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        fail_fast: bool,
        #[arg(long, value_enum)]
        on_cancel: Option<OnCancelArg>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run one simulation by task name (runFoo) or descriptor name (foo)
    Run {
        name: String,
        #[arg(long)]
        dir: Option<PathBuf>,
        #[command(flatten)]
        selection: SelectionArgs,
        #[arg(long, value_enum)]
        on_cancel: Option<OnCancelArg>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
}

struct CommandOutcome {
    payload: Option<Value>,
    exit_code: i32,
}

impl CommandOutcome {
    fn done() -> Self {
        Self {
            payload: None,
            exit_code: 0,
        }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli) {
        Ok(outcome) => {
            if let Some(payload) = outcome.payload {
                emit_json(&payload);
            }
            std::process::exit(outcome.exit_code);
        }
        Err(err) => {
            if json_mode {
                let (code, details) = match err.downcast_ref::<RunnerError>() {
                    Some(e) => (e.code(), error_details(e)),
                    None => ("command_failed", json!({})),
                };
                emit_json(&json_error(code, err.to_string(), details));
            } else {
                eprintln!("error: {:#}", err);
            }
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sim_runner=info,runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(
    path: Option<&std::path::Path>,
    dir: Option<PathBuf>,
    selection: &SelectionArgs,
) -> Result<RunnerConfig> {
    let mut config = RunnerConfig::load(path)?;
    config.apply_env();
    if let Some(dir) = dir {
        config.simulations_dir = dir;
    }
    if let Some(ext) = &selection.extension {
        config.extension = ext.clone();
    }
    if selection.batch {
        config.batch = true;
    }
    if let Some(max_time) = &selection.max_time {
        config.max_time = Some(max_time.clone());
    }
    debug!(?config, "effective configuration");
    Ok(config)
}

fn run_command(cli: Cli) -> Result<CommandOutcome> {
    let signals = EnvironmentSignals::from_env();
    match cli.command {
        Commands::Discover {
            dir,
            selection,
            json,
        } => {
            let config = load_config(cli.config.as_deref(), dir, &selection)?;
            config.validate()?;
            let entries = discover_entries(&config, signals)?;
            if json {
                return Ok(CommandOutcome {
                    payload: Some(json!({
                        "ok": true,
                        "command": "discover",
                        "dir": config.simulations_dir.display().to_string(),
                        "extension": config.extension,
                        "simulations": entries,
                    })),
                    exit_code: 0,
                });
            }
            println!("dir: {}", config.simulations_dir.display());
            println!("extension: {}", config.extension);
            println!("simulations: {}", entries.len());
            for entry in &entries {
                println!(
                    "  {}  {}  [{}]",
                    entry["task"].as_str().unwrap_or_default(),
                    entry["path"].as_str().unwrap_or_default(),
                    entry["mode"].as_str().unwrap_or_default()
                );
            }
        }
        Commands::RunAll {
            dir,
            selection,
            concurrency,
            fail_fast,
            on_cancel,
            dry_run,
            json,
        } => {
            let mut config = load_config(cli.config.as_deref(), dir, &selection)?;
            if let Some(n) = concurrency {
                config.concurrency = n;
            }
            if let Some(policy) = on_cancel {
                config.on_cancel = policy.into();
            }
            let mut options = ExecutionOptions::from_config(&config);
            options.fail_fast = fail_fast;
            let mut orch = sim_runner::prepare(
                &config,
                signals,
                sim_runner::ProcessLauncher::default(),
                options,
            )?;
            if dry_run {
                return Ok(dry_run_outcome(orch.registry().tasks(), json));
            }
            let report = orch.run_all()?;
            return report_outcome("run-all", &report, json);
        }
        Commands::Run {
            name,
            dir,
            selection,
            on_cancel,
            dry_run,
            json,
        } => {
            let mut config = load_config(cli.config.as_deref(), dir, &selection)?;
            if let Some(policy) = on_cancel {
                config.on_cancel = policy.into();
            }
            let mut orch: Orchestrator = sim_runner::prepare(
                &config,
                signals,
                sim_runner::ProcessLauncher::default(),
                ExecutionOptions::from_config(&config),
            )?;
            if dry_run {
                let spec = orch
                    .registry()
                    .get(&name)
                    .ok_or_else(|| RunnerError::UnknownTask(name.clone()))?;
                return Ok(dry_run_outcome(std::slice::from_ref(spec), json));
            }
            let report = orch.run_report(&name)?;
            return report_outcome("run", &report, json);
        }
    }
    Ok(CommandOutcome::done())
}

/// Descriptor listing that does not need an executable configured. Task
/// name collisions are still reported.
fn discover_entries(config: &RunnerConfig, signals: EnvironmentSignals) -> Result<Vec<Value>> {
    let signals = config.signals(signals);
    let settings = PolicySettings {
        max_time: config.max_time.as_deref().map(MaxTime::parse).transpose()?,
        effects_dir: config.effects_dir.clone(),
    };
    let descriptors = Discoverer::new(&config.simulations_dir, &config.extension).scan()?;
    let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut entries = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        let task = task_name(&descriptor.name)?;
        if let Some(existing) = seen.get(&task) {
            return Err(RunnerError::DuplicateTask {
                name: task,
                existing: existing.clone(),
                incoming: descriptor.path.clone(),
            }
            .into());
        }
        seen.insert(task.clone(), descriptor.path.clone());
        let policy = select_policy(&signals, &settings, &descriptor)?;
        entries.push(json!({
            "name": descriptor.name,
            "task": task,
            "path": descriptor.path.display().to_string(),
            "mode": policy.mode(),
            "policy": policy,
        }));
    }
    Ok(entries)
}

fn dry_run_outcome(specs: &[RunSpecification], json: bool) -> CommandOutcome {
    if json {
        let tasks: Vec<Value> = specs
            .iter()
            .map(|s| {
                json!({
                    "task": s.task_name(),
                    "description": s.description(),
                    "mode": s.policy().mode(),
                    "command": s.command_line(),
                })
            })
            .collect();
        return CommandOutcome {
            payload: Some(json!({"ok": true, "command": "dry-run", "tasks": tasks})),
            exit_code: 0,
        };
    }
    for spec in specs {
        println!("# {} ({})", spec.task_name(), spec.description());
        println!("{}", shell_join(&spec.command_line()));
    }
    CommandOutcome::done()
}

fn report_outcome(command: &str, report: &BatchReport, json: bool) -> Result<CommandOutcome> {
    let exit_code = report.exit_code();
    if json {
        return Ok(CommandOutcome {
            payload: Some(json!({
                "ok": report.success,
                "command": command,
                "report": serde_json::to_value(report)?,
            })),
            exit_code,
        });
    }
    print!("{}", report.render_table());
    println!("run_id: {}", report.run_id);
    if let Some(dir) = &report.run_dir {
        println!("run_dir: {}", dir.display());
    }
    Ok(CommandOutcome {
        payload: None,
        exit_code,
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{}",
            concat!(
                r#"{"ok":false,"error":{"code":"serialization_error","#,
                r#""message":"failed to serialize JSON payload","details":{}}}"#
            )
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_details(err: &RunnerError) -> Value {
    match err {
        RunnerError::Discovery { path, .. } => json!({ "path": path }),
        RunnerError::DuplicateTask {
            name,
            existing,
            incoming,
        } => json!({ "task": name, "existing": existing, "incoming": incoming }),
        RunnerError::UnknownTask(name) | RunnerError::RegistrySealed(name) => {
            json!({ "task": name })
        }
        RunnerError::InvalidTaskName { name, .. } => json!({ "name": name }),
        RunnerError::Configuration(_) | RunnerError::Io(_) | RunnerError::Serialization(_) => {
            json!({})
        }
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Discover { json, .. }
        | Commands::RunAll { json, .. }
        | Commands::Run { json, .. } => *json,
    }
}
