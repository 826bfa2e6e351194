use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Fatal errors. Per-run launch failures and non-zero exits are not raised;
/// they are recorded in [`crate::RunOutcome`] so the batch keeps going.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("discovery failed for {}: {reason}", path.display())]
    Discovery { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("duplicate task '{name}': {} collides with {}", incoming.display(), existing.display())]
    DuplicateTask {
        name: String,
        existing: PathBuf,
        incoming: PathBuf,
    },

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("registry is sealed: cannot register '{0}' after execution has started")]
    RegistrySealed(String),

    #[error("invalid task name derived from '{name}': {reason}")]
    InvalidTaskName { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl RunnerError {
    /// Short machine-readable code, used in JSON error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Discovery { .. } => "discovery_error",
            Self::Configuration(_) => "configuration_error",
            Self::DuplicateTask { .. } => "duplicate_task",
            Self::UnknownTask(_) => "unknown_task",
            Self::RegistrySealed(_) => "registry_sealed",
            Self::InvalidTaskName { .. } => "invalid_task_name",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    pub(crate) fn discovery(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Discovery {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for RunnerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for RunnerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
