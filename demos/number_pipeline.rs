//! Runs one pipeline across all three backends.
//!
//! `cargo run --example number_pipeline`
//!
//! The process stage re-runs this executable as its worker, which is why
//! `main` hands control to the registry before doing anything else.

use concurrent_pipeline::backend::cooperative::sleep;
use concurrent_pipeline::logging::init_logging;
use concurrent_pipeline::{
    run_worker_if_requested, BackendKind, PipelineBuilder, SharedCounter, SinkSpec, SourceSpec,
    StageSpec, TransformRegistry,
};
use serde::{Deserialize, Serialize};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Reading {
    sensor: u32,
    value: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Processed {
    sensor: u32,
    total: u64,
}

fn registry() -> TransformRegistry {
    let mut registry = TransformRegistry::new();
    registry.register("sum_below", |reading: Reading| {
        Ok(Processed {
            sensor: reading.sensor,
            total: (0..reading.value).sum(),
        })
    });
    registry
}

fn main() -> ExitCode {
    if let Some(code) = run_worker_if_requested(&registry()) {
        return code;
    }
    init_logging();

    let readings = (0..32u32).map(|sensor| Reading {
        sensor,
        value: u64::from(sensor) * 1000,
    });
    let total = SharedCounter::new(0);
    let sink_total = total.clone();

    let pipeline = PipelineBuilder::new(SourceSpec::iter("readings", readings))
        .stage(StageSpec::remote("sum", "sum_below").workers(2), 8)
        .stage(
            StageSpec::map_async("throttle", |processed: Processed| async move {
                sleep(Duration::from_millis(2)).await;
                Ok(processed)
            }),
            4,
        )
        .stage(
            StageSpec::map("scale", |processed: Processed| Ok(processed.total / 1000))
                .backend(BackendKind::Thread),
            4,
        )
        .sink(
            SinkSpec::for_each("accumulate", move |scaled: u64| {
                sink_total.increment(scaled as i64);
                Ok(())
            }),
            4,
        )
        .build();

    let running = match pipeline.and_then(|pipeline| pipeline.start()) {
        Ok(running) => running,
        Err(e) => {
            error!(error = %e, "failed to start pipeline");
            return ExitCode::FAILURE;
        }
    };

    match running.wait() {
        Ok(summary) => {
            for stage in &summary.stages {
                info!(
                    stage = %stage.name,
                    backend = %stage.backend,
                    processed = stage.metrics.processed,
                    p50_us = stage.metrics.latency_p50_us,
                    "stage summary"
                );
            }
            info!(total = total.get(), "done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "pipeline failed");
            ExitCode::FAILURE
        }
    }
}
