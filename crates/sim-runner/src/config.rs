use crate::error::{Result, RunnerError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "sim-runner.yaml";
pub const DEFAULT_SIMULATIONS_DIR: &str = "src/main/yaml";
pub const DEFAULT_EXTENSION: &str = "yml";
pub const DEFAULT_EFFECTS_DIR: &str = "effects";
pub const DEFAULT_LOGS_DIR: &str = ".sim-runner/runs";

pub const ENV_CI: &str = "CI";
pub const ENV_BATCH: &str = "SIM_RUNNER_BATCH";
pub const ENV_MAX_TIME: &str = "SIM_RUNNER_MAX_TIME";
pub const ENV_EXECUTABLE: &str = "SIM_RUNNER_EXECUTABLE";

/// What happens to subprocesses that are already running when the batch is
/// cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    #[default]
    Finish,
    Terminate,
}

impl InFlightPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Finish => "finish",
            Self::Terminate => "terminate",
        }
    }
}

/// Process-wide signals that choose between headless and interactive runs.
/// Read once at startup and passed around by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvironmentSignals {
    pub ci: bool,
    pub batch: bool,
}

impl EnvironmentSignals {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            ci: lookup(ENV_CI).as_deref() == Some("true"),
            batch: lookup(ENV_BATCH).as_deref() == Some("true"),
        }
    }

    pub fn headless(&self) -> bool {
        self.ci || self.batch
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// Engine launcher, e.g. `java`. Required before any spec is built.
    pub executable: Option<PathBuf>,
    /// Inserted between the executable and the engine arguments
    /// (classpath, main class and the like).
    pub executable_args: Vec<String>,
    pub simulations_dir: PathBuf,
    pub extension: String,
    pub effects_dir: PathBuf,
    #[serde(deserialize_with = "scalar_as_string")]
    pub max_time: Option<String>,
    pub batch: bool,
    pub concurrency: usize,
    pub on_cancel: InFlightPolicy,
    /// `None` disables output capture; child output is discarded.
    pub logs_dir: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            executable: None,
            executable_args: Vec::new(),
            simulations_dir: PathBuf::from(DEFAULT_SIMULATIONS_DIR),
            extension: DEFAULT_EXTENSION.to_string(),
            effects_dir: PathBuf::from(DEFAULT_EFFECTS_DIR),
            max_time: None,
            batch: false,
            concurrency: 1,
            on_cancel: InFlightPolicy::Finish,
            logs_dir: Some(PathBuf::from(DEFAULT_LOGS_DIR)),
            working_dir: None,
        }
    }
}

/// Lets `max_time: 100` and `max_time: 10s` both deserialize.
fn scalar_as_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    match Option::<serde_yaml::Value>::deserialize(deserializer)? {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "max_time must be a scalar, got {:?}",
            other
        ))),
    }
}

impl RunnerConfig {
    /// Loads `path` when given, else `sim-runner.yaml` from the current
    /// directory if it exists, else the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::from_file(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            RunnerError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw).map_err(|e| match e {
            RunnerError::Serialization(msg) => {
                RunnerError::Configuration(format!("invalid config {}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_env(&mut self) {
        self.apply_lookup(|key| std::env::var(key).ok());
    }

    /// Environment values win over the config file. `CI` and the batch flag
    /// are not folded in here; they travel as [`EnvironmentSignals`].
    pub fn apply_lookup<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(exe) = lookup(ENV_EXECUTABLE).filter(|v| !v.trim().is_empty()) {
            self.executable = Some(PathBuf::from(exe));
        }
        if let Some(max_time) = lookup(ENV_MAX_TIME).filter(|v| !v.trim().is_empty()) {
            self.max_time = Some(max_time);
        }
    }

    /// Merges the config-level batch flag into the startup signals.
    pub fn signals(&self, env: EnvironmentSignals) -> EnvironmentSignals {
        EnvironmentSignals {
            ci: env.ci,
            batch: env.batch || self.batch,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(RunnerError::Configuration(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.extension.trim().is_empty() {
            return Err(RunnerError::Configuration(
                "extension cannot be empty".to_string(),
            ));
        }
        if self.extension.starts_with('.') {
            return Err(RunnerError::Configuration(format!(
                "extension '{}' must not include the leading dot",
                self.extension
            )));
        }
        Ok(())
    }
}
