use super::wire::{decode_line, encode_line, Frame, Reply};
use crate::config::ErrorPolicy;
use crate::error::{PipelineError, Result, StageError, TransformResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};

/// Name of the registered transform a worker process should run
pub const TRANSFORM_ENV: &str = "PIPELINE_WORKER_TRANSFORM";
/// Stage name used in the worker's logs and error reports
pub const STAGE_ENV: &str = "PIPELINE_WORKER_STAGE";
/// `abort` or `skip`
pub const POLICY_ENV: &str = "PIPELINE_WORKER_POLICY";

type ErasedTransform = Box<dyn Fn(Value) -> TransformResult<Value> + Send + Sync>;

/// Transforms a worker process can run, looked up by name
#[derive(Default)]
pub struct TransformRegistry {
    transforms: HashMap<String, ErasedTransform>,
}

impl TransformRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `transform` under `name`, replacing any previous entry
    pub fn register<T, U, F>(&mut self, name: impl Into<String>, transform: F) -> &mut Self
    where
        T: DeserializeOwned,
        U: Serialize,
        F: Fn(T) -> TransformResult<U> + Send + Sync + 'static,
    {
        let erased = move |value: Value| -> TransformResult<Value> {
            let item: T = serde_json::from_value(value)?;
            let output = transform(item)?;
            Ok(serde_json::to_value(output)?)
        };
        self.transforms.insert(name.into(), Box::new(erased));
        self
    }

    /// True if a transform is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    /// Registered transform names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.transforms.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Counters of one worker process run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub skipped: u64,
}

/// Serve the worker protocol when this process was started as a worker.
///
/// Call it first thing in `main`. Returns the exit code for a worker run and
/// `None` otherwise, so the binary carries on as usual.
pub fn run_worker_if_requested(registry: &TransformRegistry) -> Option<ExitCode> {
    let transform = std::env::var(TRANSFORM_ENV).ok()?;
    let stage = std::env::var(STAGE_ENV).unwrap_or_else(|_| transform.clone());
    let policy = match std::env::var(POLICY_ENV) {
        Ok(raw) => match raw.parse::<ErrorPolicy>() {
            Ok(policy) => policy,
            Err(e) => {
                error!(stage = %stage, error = %e, "invalid worker policy");
                return Some(ExitCode::from(2));
            }
        },
        Err(_) => ErrorPolicy::default(),
    };

    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    match serve(registry, &stage, &transform, policy, stdin, stdout) {
        Ok(stats) => {
            info!(
                stage = %stage,
                processed = stats.processed,
                skipped = stats.skipped,
                "worker finished"
            );
            Some(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(stage = %stage, error = %e, "worker stopped");
            Some(ExitCode::FAILURE)
        }
    }
}

/// Run `transform` over the frames read from `reader`, answering on `writer`
pub fn serve<R, W>(
    registry: &TransformRegistry,
    stage: &str,
    transform: &str,
    policy: ErrorPolicy,
    reader: R,
    mut writer: W,
) -> Result<WorkerStats>
where
    R: BufRead,
    W: Write,
{
    let Some(apply) = registry.transforms.get(transform) else {
        let cause = format!("unknown transform `{transform}`");
        send(
            &mut writer,
            &Reply::<Value>::Failed {
                item_context: "worker startup".into(),
                cause: cause.clone(),
            },
        )?;
        return Err(StageError::new(stage, "worker startup", cause).into());
    };

    let mut stats = WorkerStats::default();
    let mut sequence = 0u64;
    for line in reader.lines() {
        let line = line.map_err(|e| PipelineError::WorkerError(format!("reading frames: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }

        let frame: Frame<Value> = decode_line(&line)
            .map_err(|e| PipelineError::WorkerError(format!("malformed frame: {e}")))?;
        let item = match frame {
            Frame::Item(item) => item,
            Frame::End => {
                send(&mut writer, &Reply::<Value>::End)?;
                return Ok(stats);
            }
        };

        let item_context = format!("item #{sequence}");
        sequence += 1;
        match apply(item) {
            Ok(output) => {
                stats.processed += 1;
                send(&mut writer, &Reply::Item(output))?;
            }
            Err(cause) => match policy {
                ErrorPolicy::Skip => {
                    warn!(stage = %stage, item = %item_context, error = %cause, "skipping item");
                    stats.skipped += 1;
                    send(
                        &mut writer,
                        &Reply::<Value>::Skipped {
                            item_context,
                            cause: cause.to_string(),
                        },
                    )?;
                }
                ErrorPolicy::Abort => {
                    let error = StageError::new(stage, item_context.clone(), &cause);
                    send(
                        &mut writer,
                        &Reply::<Value>::Failed {
                            item_context,
                            cause: cause.to_string(),
                        },
                    )?;
                    return Err(error.into());
                }
            },
        }
    }

    // The host closed our stdin without an end frame; finish the stream anyway.
    debug!(stage = %stage, "input ended without an end frame");
    send(&mut writer, &Reply::<Value>::End)?;
    Ok(stats)
}

fn send<W: Write>(writer: &mut W, reply: &Reply<Value>) -> Result<()> {
    let line = encode_line(reply)
        .map_err(|e| PipelineError::WorkerError(format!("encoding reply: {e}")))?;
    writer
        .write_all(line.as_bytes())
        .and_then(|()| writer.flush())
        .map_err(|e| PipelineError::WorkerError(format!("writing reply: {e}")))
}
