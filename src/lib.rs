//! Multi-stage data pipelines connected by bounded channels.
//!
//! A pipeline is a source, any number of transform stages and a sink. Every
//! handoff between two stages is a fixed-capacity [`Channel`], so a slow
//! consumer blocks its producer instead of letting memory grow. Each stage
//! picks the scheduling model its workers run under:
//!
//! - [`BackendKind::Thread`]: one OS thread per worker, shared memory
//! - [`BackendKind::Cooperative`]: tasks multiplexed onto one scheduler
//!   thread, suspending only at channel, semaphore, event or sleep awaits
//! - [`BackendKind::Process`]: one child process per worker running a
//!   transform registered by name, items crossing as JSON lines
//!
//! End of stream travels as channel closure: the last worker of a stage
//! closes its output once its input is drained. A failing stage (under the
//! default [`ErrorPolicy::Abort`]) closes both of its channels, so the rest
//! of the pipeline unwinds in both directions.
//!
//! # Example
//!
//! ```no_run
//! use concurrent_pipeline::{Collector, PipelineBuilder, SinkSpec, SourceSpec, StageSpec};
//!
//! # fn main() -> concurrent_pipeline::Result<()> {
//! let out = Collector::new();
//! let summary = PipelineBuilder::new(SourceSpec::iter("numbers", 0..20u64))
//!     .stage(StageSpec::map("double", |n: u64| Ok(n * 2)), 8)
//!     .sink(SinkSpec::collect("out", out.clone()), 8)
//!     .build()?
//!     .start()?
//!     .wait()?;
//!
//! assert_eq!(out.len(), 20);
//! assert_eq!(summary.stage("double").map(|s| s.metrics.processed), Some(20));
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
mod runner;
pub mod stage;
pub mod sync;

pub use backend::registry::{run_worker_if_requested, TransformRegistry};
pub use backend::{
    CooperativeTaskSet, ExecutorBackend, ProcessPool, StageTask, ThreadPool, WorkerCommand,
};
pub use channel::Channel;
pub use config::{BackendKind, ErrorPolicy, PipelineConfig};
pub use error::{BoxError, PipelineError, Result, StageError, TransformResult};
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use pipeline::{
    Completion, Pipeline, PipelineBuilder, PipelineSummary, RunningPipeline, StageSummary,
    TerminatedBuilder,
};
pub use runner::{StageReport, WorkerOutcome};
pub use stage::{Collector, FilterStage, MapStage, SinkSpec, SourceSpec, Stage, StageSpec};
pub use sync::{Event, Mutex, Semaphore, SemaphorePermit, SharedCounter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
