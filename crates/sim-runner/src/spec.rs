use crate::config::{EnvironmentSignals, RunnerConfig};
use crate::discovery::SimulationDescriptor;
use crate::error::{Result, RunnerError};
use crate::policy::{select_policy, ExecutionPolicy, MaxTime, PolicySettings};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const TASK_PREFIX: &str = "run";

/// `flock` becomes `runFlock`. Only the first character changes case, so
/// `a` and `A` collide; the registry reports that as a duplicate.
pub fn task_name(descriptor_name: &str) -> Result<String> {
    let invalid = |reason: &str| RunnerError::InvalidTaskName {
        name: descriptor_name.to_string(),
        reason: reason.to_string(),
    };
    let mut chars = descriptor_name.chars();
    let first = chars.next().ok_or_else(|| invalid("name is empty"))?;
    if descriptor_name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(invalid("name contains whitespace or control characters"));
    }
    let mut out = String::with_capacity(TASK_PREFIX.len() + descriptor_name.len());
    out.push_str(TASK_PREFIX);
    out.extend(first.to_uppercase());
    out.push_str(chars.as_str());
    Ok(out)
}

/// Everything needed to launch one simulation. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSpecification {
    task_name: String,
    descriptor: SimulationDescriptor,
    executable: PathBuf,
    executable_args: Vec<String>,
    arguments: Vec<String>,
    policy: ExecutionPolicy,
    working_dir: Option<PathBuf>,
}

impl RunSpecification {
    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn descriptor(&self) -> &SimulationDescriptor {
        &self.descriptor
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn executable_args(&self) -> &[String] {
        &self.executable_args
    }

    /// Engine arguments: `run <path> --override <fragment>`.
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn description(&self) -> String {
        format!("Launches simulation {}", self.descriptor.name)
    }

    /// Full argv, executable first.
    pub fn command_line(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(1 + self.executable_args.len() + self.arguments.len());
        argv.push(self.executable.to_string_lossy().to_string());
        argv.extend(self.executable_args.iter().cloned());
        argv.extend(self.arguments.iter().cloned());
        argv
    }
}

#[derive(Debug, Clone)]
pub struct RunSpecBuilder {
    executable: PathBuf,
    executable_args: Vec<String>,
    working_dir: Option<PathBuf>,
    signals: EnvironmentSignals,
    settings: PolicySettings,
}

impl RunSpecBuilder {
    pub fn new(config: &RunnerConfig, signals: EnvironmentSignals) -> Result<Self> {
        let executable = config
            .executable
            .clone()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                RunnerError::Configuration(format!(
                    "no simulator executable configured (set `executable` or {})",
                    crate::config::ENV_EXECUTABLE
                ))
            })?;
        let max_time = config.max_time.as_deref().map(MaxTime::parse).transpose()?;
        Ok(Self {
            executable,
            executable_args: config.executable_args.clone(),
            working_dir: config.working_dir.clone(),
            signals: config.signals(signals),
            settings: PolicySettings {
                max_time,
                effects_dir: config.effects_dir.clone(),
            },
        })
    }

    pub fn signals(&self) -> EnvironmentSignals {
        self.signals
    }

    pub fn build(&self, descriptor: &SimulationDescriptor) -> Result<RunSpecification> {
        let task_name = task_name(&descriptor.name)?;
        let policy = select_policy(&self.signals, &self.settings, descriptor)?;
        let arguments = vec![
            "run".to_string(),
            descriptor.path.to_string_lossy().to_string(),
            "--override".to_string(),
            policy.override_fragment()?,
        ];
        Ok(RunSpecification {
            task_name,
            descriptor: descriptor.clone(),
            executable: self.executable.clone(),
            executable_args: self.executable_args.clone(),
            arguments,
            policy,
            working_dir: self.working_dir.clone(),
        })
    }

    pub fn build_all(&self, descriptors: &[SimulationDescriptor]) -> Result<Vec<RunSpecification>> {
        descriptors.iter().map(|d| self.build(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_time: Option<&str>) -> RunnerConfig {
        RunnerConfig {
            executable: Some(PathBuf::from("java")),
            executable_args: vec![
                "-cp".to_string(),
                "build/libs/all.jar".to_string(),
                "it.example.Engine".to_string(),
            ],
            max_time: max_time.map(str::to_string),
            ..RunnerConfig::default()
        }
    }

    fn descriptor(name: &str) -> SimulationDescriptor {
        SimulationDescriptor {
            name: name.to_string(),
            path: PathBuf::from(format!("/project/src/main/yaml/{}.yml", name)),
        }
    }

    #[test]
    fn task_names_capitalize_first_char_only() {
        assert_eq!(task_name("flock").expect("name"), "runFlock");
        assert_eq!(task_name("Flock").expect("name"), "runFlock");
        assert_eq!(task_name("gradient_2d").expect("name"), "runGradient_2d");
        assert_eq!(task_name("élan").expect("name"), "runÉlan");
        assert_eq!(task_name("9lives").expect("name"), "run9lives");
    }

    #[test]
    fn task_names_reject_unusable_input() {
        assert!(matches!(
            task_name(""),
            Err(RunnerError::InvalidTaskName { .. })
        ));
        assert!(task_name("two words").is_err());
        assert!(task_name("tab\there").is_err());
    }

    #[test]
    fn builder_requires_executable() {
        let cfg = RunnerConfig::default();
        let err = RunSpecBuilder::new(&cfg, EnvironmentSignals::default()).expect_err("no exe");
        assert!(matches!(err, RunnerError::Configuration(_)));
    }

    #[test]
    fn builder_rejects_malformed_max_time_up_front() {
        let err = RunSpecBuilder::new(&config(Some("soon")), EnvironmentSignals::default())
            .expect_err("bad max time");
        assert!(matches!(err, RunnerError::Configuration(_)));
    }

    #[test]
    fn headless_spec_arguments() {
        let builder = RunSpecBuilder::new(
            &config(Some("10s")),
            EnvironmentSignals { ci: true, batch: false },
        )
        .expect("builder");
        let spec = builder.build(&descriptor("flock")).expect("spec");
        assert_eq!(spec.task_name(), "runFlock");
        assert!(spec.policy().is_headless());
        let args = spec.arguments();
        assert_eq!(args[0], "run");
        assert_eq!(args[1], "/project/src/main/yaml/flock.yml");
        assert_eq!(args[2], "--override");
        assert!(args[3].starts_with("terminate:"), "{}", args[3]);
        assert!(args[3].contains("AfterTime"));

        let argv = spec.command_line();
        assert_eq!(argv[0], "java");
        assert_eq!(&argv[1..4], &["-cp", "build/libs/all.jar", "it.example.Engine"]);
        assert_eq!(argv.len(), 8);
    }

    #[test]
    fn interactive_spec_arguments() {
        let builder = RunSpecBuilder::new(&config(None), EnvironmentSignals::default())
            .expect("builder");
        let spec = builder.build(&descriptor("flock")).expect("spec");
        assert!(!spec.policy().is_headless());
        assert!(spec.arguments()[3].starts_with("monitors:"));
        assert!(spec.arguments()[3].contains("effects/flock.json"));
        assert_eq!(spec.description(), "Launches simulation flock");
    }

    #[test]
    fn config_batch_flag_selects_headless() {
        let mut cfg = config(Some("5"));
        cfg.batch = true;
        let builder = RunSpecBuilder::new(&cfg, EnvironmentSignals::default()).expect("builder");
        assert!(builder.signals().headless());
        let specs = builder
            .build_all(&[descriptor("a"), descriptor("b")])
            .expect("specs");
        assert!(specs.iter().all(|s| s.policy().is_headless()));
    }
}
