use crate::backend::process::WorkerCommand;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Scheduling model a stage runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Isolated OS process per worker, items cross as serialized frames
    Process,
    /// OS thread per worker, shared memory
    Thread,
    /// Task on the single-threaded cooperative scheduler
    Cooperative,
}

impl BackendKind {
    /// Lowercase name used in config files and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Process => "process",
            BackendKind::Thread => "thread",
            BackendKind::Cooperative => "cooperative",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process" => Ok(BackendKind::Process),
            "thread" => Ok(BackendKind::Thread),
            "cooperative" => Ok(BackendKind::Cooperative),
            other => Err(PipelineError::config(format!(
                "unknown backend `{other}`, expected one of: process, thread, cooperative"
            ))),
        }
    }
}

/// What a stage does when its transform fails on an item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Close the stage's channels and fail the pipeline
    #[default]
    Abort,
    /// Log the failure and continue with the next item
    Skip,
}

impl ErrorPolicy {
    /// Lowercase name passed to process workers
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPolicy::Abort => "abort",
            ErrorPolicy::Skip => "skip",
        }
    }
}

impl FromStr for ErrorPolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "abort" => Ok(ErrorPolicy::Abort),
            "skip" => Ok(ErrorPolicy::Skip),
            other => Err(PipelineError::config(format!(
                "unknown error policy `{other}`, expected abort or skip"
            ))),
        }
    }
}

fn default_capacity() -> usize {
    16
}

/// Pipeline-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    /// Capacity used by `PipelineBuilder::then` and `PipelineBuilder::finish`
    #[serde(default = "default_capacity")]
    pub default_capacity: usize,
    /// Command used to start process workers; the current executable when unset
    #[serde(default)]
    pub worker: Option<WorkerCommand>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            error_policy: ErrorPolicy::default(),
            default_capacity: default_capacity(),
            worker: None,
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)
            .map_err(|e| PipelineError::config(format!("invalid pipeline config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no pipeline can run with
    pub fn validate(&self) -> Result<()> {
        if self.default_capacity == 0 {
            return Err(PipelineError::config("default_capacity must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("thread".parse::<BackendKind>().unwrap(), BackendKind::Thread);
        assert_eq!(
            "cooperative".parse::<BackendKind>().unwrap(),
            BackendKind::Cooperative
        );
        assert_eq!("process".parse::<BackendKind>().unwrap(), BackendKind::Process);
        assert!(matches!(
            "gpu".parse::<BackendKind>(),
            Err(PipelineError::ConfigError(_))
        ));
        assert!("Thread".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config = PipelineConfig::from_json_str(
            r#"{ "error_policy": "skip", "default_capacity": 4,
                 "worker": { "program": "/usr/bin/worker", "args": ["--quiet"] } }"#,
        )
        .unwrap();
        assert_eq!(config.error_policy, ErrorPolicy::Skip);
        assert_eq!(config.default_capacity, 4);
        assert!(config.worker.is_some());
    }

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.error_policy, ErrorPolicy::Abort);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(PipelineConfig::from_json_str(r#"{ "default_capacity": 0 }"#).is_err());
        assert!(PipelineConfig::from_json_str(r#"{ "error_policy": "retry" }"#).is_err());
        assert!(PipelineConfig::from_json_str(r#"{ "backend": "gpu" }"#).is_err());
    }
}
