use crate::config::EnvironmentSignals;
use crate::discovery::SimulationDescriptor;
use crate::error::{Result, RunnerError};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

pub const TERMINATOR_AFTER_TIME: &str = "AfterTime";
pub const MONITOR_SWING_GUI: &str = "SwingGUI";

/// Simulated-time limit handed to the engine verbatim. The engine enforces
/// it; the runner never kills a run because of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct MaxTime(String);

impl MaxTime {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RunnerError::Configuration(
                "max time cannot be empty".to_string(),
            ));
        }
        if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(RunnerError::Configuration(format!(
                "max time '{}' must be a single token",
                raw
            )));
        }
        if !trimmed.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(RunnerError::Configuration(format!(
                "max time '{}' must start with a number",
                raw
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Plain numbers go out as YAML numbers, anything with a unit as a string.
    /// Numbers a `u64` or `f64` cannot hold exactly also stay strings.
    fn to_yaml(&self) -> serde_yaml::Value {
        let digits = self.0.chars().filter(|c| c.is_ascii_digit()).count();
        if digits == self.0.len() {
            if let Ok(n) = self.0.parse::<u64>() {
                return serde_yaml::Value::Number(n.into());
            }
        } else if digits + 1 == self.0.len() && self.0.contains('.') && digits <= 15 {
            if let Ok(f) = self.0.parse::<f64>() {
                return serde_yaml::Value::Number(f.into());
            }
        }
        serde_yaml::Value::String(self.0.clone())
    }
}

impl fmt::Display for MaxTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionPolicy {
    Headless { max_time: MaxTime },
    Interactive { effects_file: PathBuf },
}

impl ExecutionPolicy {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Headless { .. } => "headless",
            Self::Interactive { .. } => "interactive",
        }
    }

    pub fn is_headless(&self) -> bool {
        matches!(self, Self::Headless { .. })
    }

    /// The single YAML document passed after `--override`.
    pub fn override_fragment(&self) -> Result<String> {
        let rendered = match self {
            Self::Headless { max_time } => serde_yaml::to_string(&TerminateOverride {
                terminate: vec![Terminator {
                    kind: TERMINATOR_AFTER_TIME,
                    parameters: max_time.to_yaml(),
                }],
            })?,
            Self::Interactive { effects_file } => serde_yaml::to_string(&MonitorOverride {
                monitors: Monitor {
                    kind: MONITOR_SWING_GUI,
                    parameters: MonitorParameters {
                        graphics: effects_file.to_string_lossy().to_string(),
                    },
                },
            })?,
        };
        Ok(rendered.trim_end().to_string())
    }
}

#[derive(Serialize)]
struct TerminateOverride {
    terminate: Vec<Terminator>,
}

#[derive(Serialize)]
struct Terminator {
    #[serde(rename = "type")]
    kind: &'static str,
    parameters: serde_yaml::Value,
}

#[derive(Serialize)]
struct MonitorOverride {
    monitors: Monitor,
}

#[derive(Serialize)]
struct Monitor {
    #[serde(rename = "type")]
    kind: &'static str,
    parameters: MonitorParameters,
}

#[derive(Serialize)]
struct MonitorParameters {
    graphics: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySettings {
    pub max_time: Option<MaxTime>,
    pub effects_dir: PathBuf,
}

/// Headless iff CI or batch is set. Interactive runs point at
/// `<effects_dir>/<name>.json`; whether that file exists is the engine's
/// concern.
pub fn select_policy(
    signals: &EnvironmentSignals,
    settings: &PolicySettings,
    descriptor: &SimulationDescriptor,
) -> Result<ExecutionPolicy> {
    if signals.headless() {
        let max_time = settings.max_time.clone().ok_or_else(|| {
            RunnerError::Configuration(format!(
                "headless run of '{}' requires a max time (--max-time or {})",
                descriptor.name,
                crate::config::ENV_MAX_TIME
            ))
        })?;
        Ok(ExecutionPolicy::Headless { max_time })
    } else {
        Ok(ExecutionPolicy::Interactive {
            effects_file: settings
                .effects_dir
                .join(format!("{}.json", descriptor.name)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str) -> SimulationDescriptor {
        SimulationDescriptor {
            name: name.to_string(),
            path: PathBuf::from(format!("/sims/{}.yml", name)),
        }
    }

    fn settings(max_time: Option<&str>) -> PolicySettings {
        PolicySettings {
            max_time: max_time.map(|m| MaxTime::parse(m).expect("max time")),
            effects_dir: PathBuf::from("effects"),
        }
    }

    #[test]
    fn headless_iff_ci_or_batch() {
        let d = descriptor("flock");
        let s = settings(Some("10s"));
        for (ci, batch) in [(false, false), (true, false), (false, true), (true, true)] {
            let signals = EnvironmentSignals { ci, batch };
            let policy = select_policy(&signals, &s, &d).expect("policy");
            assert_eq!(policy.is_headless(), ci || batch, "ci={} batch={}", ci, batch);
        }
    }

    #[test]
    fn interactive_policy_names_effects_after_descriptor() {
        let policy = select_policy(
            &EnvironmentSignals::default(),
            &settings(None),
            &descriptor("flock"),
        )
        .expect("policy");
        assert_eq!(
            policy,
            ExecutionPolicy::Interactive {
                effects_file: PathBuf::from("effects/flock.json")
            }
        );
    }

    #[test]
    fn headless_without_max_time_is_a_configuration_error() {
        let signals = EnvironmentSignals { ci: true, batch: false };
        let err = select_policy(&signals, &settings(None), &descriptor("flock")).expect_err("fail");
        assert!(matches!(err, RunnerError::Configuration(_)));
    }

    #[test]
    fn max_time_rejects_garbage() {
        assert!(MaxTime::parse("").is_err());
        assert!(MaxTime::parse("10 s").is_err());
        assert!(MaxTime::parse("ten").is_err());
        assert!(MaxTime::parse("1\n- type: X").is_err());
        assert_eq!(MaxTime::parse(" 10s ").expect("ok").as_str(), "10s");
    }

    #[test]
    fn terminate_fragment_has_engine_shape() {
        let policy = ExecutionPolicy::Headless {
            max_time: MaxTime::parse("10s").expect("ok"),
        };
        let fragment = policy.override_fragment().expect("fragment");
        let parsed: serde_yaml::Value = serde_yaml::from_str(&fragment).expect("yaml");
        let first = &parsed["terminate"][0];
        assert_eq!(first["type"].as_str(), Some("AfterTime"));
        assert_eq!(first["parameters"].as_str(), Some("10s"));
        assert!(fragment.starts_with("terminate:"));
    }

    #[test]
    fn numeric_max_time_stays_numeric() {
        let policy = ExecutionPolicy::Headless {
            max_time: MaxTime::parse("250").expect("ok"),
        };
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(&policy.override_fragment().expect("fragment")).expect("yaml");
        assert_eq!(parsed["terminate"][0]["parameters"].as_u64(), Some(250));

        let policy = ExecutionPolicy::Headless {
            max_time: MaxTime::parse("2.5").expect("ok"),
        };
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(&policy.override_fragment().expect("fragment")).expect("yaml");
        assert_eq!(parsed["terminate"][0]["parameters"].as_f64(), Some(2.5));
    }

    #[test]
    fn oversized_numbers_are_passed_verbatim() {
        for raw in ["99999999999999999999", "3.14159265358979323846"] {
            let policy = ExecutionPolicy::Headless {
                max_time: MaxTime::parse(raw).expect("ok"),
            };
            let parsed: serde_yaml::Value =
                serde_yaml::from_str(&policy.override_fragment().expect("fragment"))
                    .expect("yaml");
            assert_eq!(parsed["terminate"][0]["parameters"].as_str(), Some(raw));
        }
    }

    #[test]
    fn monitor_fragment_has_engine_shape() {
        let policy = ExecutionPolicy::Interactive {
            effects_file: PathBuf::from("effects/flock.json"),
        };
        let fragment = policy.override_fragment().expect("fragment");
        let parsed: serde_yaml::Value = serde_yaml::from_str(&fragment).expect("yaml");
        assert_eq!(parsed["monitors"]["type"].as_str(), Some("SwingGUI"));
        assert_eq!(
            parsed["monitors"]["parameters"]["graphics"].as_str(),
            Some("effects/flock.json")
        );
    }
}
