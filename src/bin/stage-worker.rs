//! Worker executable for process stages.
//!
//! Started by the host with the transform name in `PIPELINE_WORKER_TRANSFORM`;
//! reads item frames on stdin and answers on stdout.

use concurrent_pipeline::logging::init_logging_with;
use concurrent_pipeline::{run_worker_if_requested, TransformRegistry, TransformResult};
use std::process::ExitCode;
use tracing::error;

fn double(n: i64) -> TransformResult<i64> {
    n.checked_mul(2)
        .ok_or_else(|| format!("{n} overflows when doubled").into())
}

fn registry() -> TransformRegistry {
    let mut registry = TransformRegistry::new();
    registry
        .register("double", double)
        .register("checked_double", |n: i64| -> TransformResult<i64> {
            if n == 7 {
                return Err("refusing 7".into());
            }
            double(n)
        })
        .register("sum_below", |n: u64| Ok((0..n).sum::<u64>()));
    registry
}

fn main() -> ExitCode {
    init_logging_with("warn");

    let registry = registry();
    match run_worker_if_requested(&registry) {
        Some(code) => code,
        None => {
            error!(
                transforms = ?registry.names(),
                "stage-worker is started by a pipeline host, not by hand"
            );
            ExitCode::from(2)
        }
    }
}
