use crate::backend::{
    CooperativeTaskSet, ExecutorBackend, ProcessPool, ThreadPool, WorkerCommand,
};
use crate::channel::{Channel, Closeable};
use crate::config::{BackendKind, PipelineConfig};
use crate::error::{PipelineError, Result, StageError};
use crate::metrics::{MetricsSnapshot, StageMetrics};
use crate::runner::{
    lower_sink, lower_source, lower_stage, LaunchEnv, StageNode, StageReport, WorkerOutcome,
};
use crate::stage::{SinkSpec, SourceSpec, StageSpec};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

type PendingNode<T> = Box<dyn FnOnce(Channel<T>) -> Result<StageNode>>;

/// Everything gathered while the builder walks from source to sink
struct Parts {
    config: PipelineConfig,
    nodes: Vec<StageNode>,
    names: Vec<String>,
    channels: Vec<Arc<dyn Closeable>>,
    error: Option<PipelineError>,
}

impl Parts {
    fn new(config: PipelineConfig) -> Self {
        let error = config.validate().err();
        Self {
            config,
            nodes: Vec::new(),
            names: Vec::new(),
            channels: Vec::new(),
            error,
        }
    }

    /// Keep the first error; `build` reports it
    fn fail(&mut self, error: PipelineError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn register_name(&mut self, name: &str) {
        if self.names.iter().any(|existing| existing == name) {
            self.fail(PipelineError::config(format!("duplicate stage name `{name}`")));
        }
        self.names.push(name.to_string());
    }

    /// A new handoff channel feeding the stage called `into`
    fn edge<T: Send + 'static>(&mut self, capacity: usize, into: &str) -> Channel<T> {
        let channel = match Channel::new(capacity) {
            Ok(channel) => channel,
            Err(_) => {
                self.fail(PipelineError::config(format!(
                    "channel into `{into}` needs a positive capacity"
                )));
                Channel::create(1)
            }
        };
        self.channels.push(Arc::new(channel.clone()));
        channel
    }

    fn push(&mut self, node: Result<StageNode>) {
        match node {
            Ok(node) => self.nodes.push(node),
            Err(e) => self.fail(e),
        }
    }
}

/// Typed pipeline builder; `T` is the item type the last added stage emits.
///
/// Configuration problems (zero capacities, duplicate names, a transform
/// that cannot run on its backend) are collected and returned by
/// [`TerminatedBuilder::build`].
pub struct PipelineBuilder<T> {
    parts: Parts,
    tail: PendingNode<T>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Start a pipeline at `source` with the default configuration
    pub fn new(source: SourceSpec<T>) -> Self {
        Self::with_config(PipelineConfig::default(), source)
    }

    /// Start a pipeline at `source` with `config`
    pub fn with_config(config: PipelineConfig, source: SourceSpec<T>) -> Self {
        let mut parts = Parts::new(config);
        parts.register_name(&source.name);
        Self {
            parts,
            tail: Box::new(move |output| lower_source(source, output)),
        }
    }

    /// Append a stage reading from a new channel of `capacity` items
    pub fn stage<U: Send + 'static>(
        self,
        spec: StageSpec<T, U>,
        capacity: usize,
    ) -> PipelineBuilder<U> {
        let Self { mut parts, tail } = self;
        parts.register_name(&spec.name);
        let input = parts.edge::<T>(capacity, &spec.name);
        parts.push(tail(input.clone()));
        PipelineBuilder {
            parts,
            tail: Box::new(move |output| lower_stage(spec, input, output)),
        }
    }

    /// Append a stage using the configured default capacity
    pub fn then<U: Send + 'static>(self, spec: StageSpec<T, U>) -> PipelineBuilder<U> {
        let capacity = self.parts.config.default_capacity;
        self.stage(spec, capacity)
    }

    /// Terminate the pipeline with a sink
    pub fn sink(self, spec: SinkSpec<T>, capacity: usize) -> TerminatedBuilder {
        let Self { mut parts, tail } = self;
        parts.register_name(&spec.name);
        let input = parts.edge::<T>(capacity, &spec.name);
        parts.push(tail(input.clone()));
        parts.push(lower_sink(spec, input));
        TerminatedBuilder { parts }
    }

    /// Terminate with a sink fed through a channel of the default capacity
    pub fn finish(self, spec: SinkSpec<T>) -> TerminatedBuilder {
        let capacity = self.parts.config.default_capacity;
        self.sink(spec, capacity)
    }
}

/// A builder whose pipeline ends in a sink
pub struct TerminatedBuilder {
    parts: Parts,
}

impl TerminatedBuilder {
    /// Validate the topology; returns the first configuration error found
    pub fn build(self) -> Result<Pipeline> {
        let Parts {
            config,
            nodes,
            channels,
            error,
            ..
        } = self.parts;
        if let Some(error) = error {
            return Err(error);
        }
        Ok(Pipeline {
            config,
            nodes,
            channels,
        })
    }
}

/// A validated pipeline ready to start
pub struct Pipeline {
    config: PipelineConfig,
    nodes: Vec<StageNode>,
    channels: Vec<Arc<dyn Closeable>>,
}

impl Pipeline {
    /// Stage names from source to sink
    pub fn stage_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|node| node.name.as_str()).collect()
    }

    /// Number of channels between stages
    pub fn handoffs(&self) -> usize {
        self.channels.len()
    }

    /// Live metrics of the named stage
    pub fn stage_metrics(&self, name: &str) -> Option<&StageMetrics> {
        self.nodes
            .iter()
            .find(|node| node.name == name)
            .map(|node| &node.metrics)
    }

    /// Configuration the pipeline was built with
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn needs(&self, kind: BackendKind) -> bool {
        self.nodes.iter().any(|node| node.backend == kind)
    }

    /// Submit every stage worker to its backend; does not wait for them
    pub fn start(self) -> Result<RunningPipeline> {
        let mut backends: Vec<Box<dyn ExecutorBackend>> = vec![Box::new(ThreadPool::new())];
        if self.needs(BackendKind::Cooperative) {
            backends.push(Box::new(CooperativeTaskSet::new()?));
        }
        if self.needs(BackendKind::Process) {
            let command = match &self.config.worker {
                Some(command) => command.clone(),
                None => WorkerCommand::current_exe()?,
            };
            backends.push(Box::new(ProcessPool::new(command)));
        }

        let Pipeline {
            config,
            nodes,
            channels,
        } = self;
        let (reports, receiver) = unbounded();
        let cancelled = Arc::new(AtomicBool::new(false));
        let env = LaunchEnv {
            policy: config.error_policy,
            cancelled: Arc::clone(&cancelled),
            reports,
        };

        let mut stages = Vec::with_capacity(nodes.len());
        let mut pending = 0;
        for node in nodes {
            let StageNode {
                name,
                backend,
                workers,
                metrics,
                launch,
            } = node;
            info!(stage = %name, backend = %backend, workers, "starting stage");

            for task in launch(&env) {
                pending += 1;
                let kind = task.kind();
                match backends.iter_mut().find(|b| b.kind() == kind) {
                    // A rejected task is dropped and its worker reports the failure.
                    Some(executor) => {
                        if let Err(e) = executor.submit(task) {
                            error!(stage = %name, error = %e, "failed to submit stage worker");
                        }
                    }
                    None => {
                        error!(stage = %name, backend = %kind, "no executor for stage worker");
                    }
                }
            }

            stages.push(StageInfo {
                name,
                backend,
                workers,
                metrics,
            });
        }
        drop(env);
        info!(
            stages = stages.len(),
            workers = pending,
            policy = config.error_policy.as_str(),
            "pipeline started"
        );

        Ok(RunningPipeline {
            stages,
            backends,
            channels,
            reports: receiver,
            pending,
            cancelled,
            failure: None,
            saw_cancelled: false,
            completion: None,
        })
    }
}

struct StageInfo {
    name: String,
    backend: BackendKind,
    workers: usize,
    metrics: StageMetrics,
}

/// Per-stage counters at the end of a run
#[derive(Debug, Clone)]
pub struct StageSummary {
    pub name: String,
    pub backend: BackendKind,
    pub workers: usize,
    pub metrics: MetricsSnapshot,
}

/// Per-stage outcome of a finished run, in pipeline order
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub stages: Vec<StageSummary>,
}

impl PipelineSummary {
    /// Summary of the named stage
    pub fn stage(&self, name: &str) -> Option<&StageSummary> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}

/// How a run ended
#[derive(Debug, Clone)]
pub enum Completion {
    Success(PipelineSummary),
    /// The first stage failure reported; the rest of the pipeline unwound
    StageFailure {
        error: StageError,
        summary: PipelineSummary,
    },
    Cancelled(PipelineSummary),
    /// The wait expired; the pipeline keeps running
    TimedOut,
}

impl Completion {
    /// True when every stage completed
    pub fn is_success(&self) -> bool {
        matches!(self, Completion::Success(_))
    }

    /// Stage summaries, unless the wait timed out
    pub fn summary(&self) -> Option<&PipelineSummary> {
        match self {
            Completion::Success(summary)
            | Completion::StageFailure { summary, .. }
            | Completion::Cancelled(summary) => Some(summary),
            Completion::TimedOut => None,
        }
    }
}

/// A started pipeline.
///
/// Dropping it before completion cancels the run.
pub struct RunningPipeline {
    stages: Vec<StageInfo>,
    backends: Vec<Box<dyn ExecutorBackend>>,
    channels: Vec<Arc<dyn Closeable>>,
    reports: Receiver<StageReport>,
    pending: usize,
    cancelled: Arc<AtomicBool>,
    failure: Option<StageError>,
    saw_cancelled: bool,
    completion: Option<Completion>,
}

impl RunningPipeline {
    /// Wait until every stage worker has reported, then join the backends.
    ///
    /// With a timeout, returns [`Completion::TimedOut`] once it expires
    /// without stopping anything; waiting again resumes where this left off.
    pub fn await_completion(&mut self, timeout: Option<Duration>) -> Completion {
        if let Some(completion) = &self.completion {
            return completion.clone();
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        if !self.collect_reports(deadline) {
            return Completion::TimedOut;
        }
        self.conclude()
    }

    /// Run to the end, mapping anything but success to an error
    pub fn wait(mut self) -> Result<PipelineSummary> {
        self.collect_reports(None);
        match self.conclude() {
            Completion::Success(summary) => Ok(summary),
            Completion::StageFailure { error, .. } => Err(error.into()),
            Completion::Cancelled(_) | Completion::TimedOut => Err(PipelineError::Cancelled),
        }
    }

    /// Like [`wait`](Self::wait), cancelling the run if it does not finish in time
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<PipelineSummary> {
        match self.await_completion(Some(timeout)) {
            Completion::Success(summary) => Ok(summary),
            Completion::StageFailure { error, .. } => Err(error.into()),
            Completion::Cancelled(_) => Err(PipelineError::Cancelled),
            Completion::TimedOut => {
                self.cancel();
                Err(PipelineError::TimedOut(timeout))
            }
        }
    }

    /// Ask every worker to stop and close every channel; returns immediately
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("cancelling pipeline");
        for channel in &self.channels {
            channel.close_channel();
        }
    }

    /// True once a completion has been observed
    pub fn is_finished(&self) -> bool {
        self.completion.is_some()
    }

    /// Live metrics of the named stage
    pub fn stage_metrics(&self, name: &str) -> Option<&StageMetrics> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .map(|stage| &stage.metrics)
    }

    /// Snapshot every stage's metrics
    pub fn summary(&self) -> PipelineSummary {
        PipelineSummary {
            stages: self
                .stages
                .iter()
                .map(|stage| StageSummary {
                    name: stage.name.clone(),
                    backend: stage.backend,
                    workers: stage.workers,
                    metrics: stage.metrics.snapshot(),
                })
                .collect(),
        }
    }

    /// Returns false if the deadline passed first
    fn collect_reports(&mut self, deadline: Option<Instant>) -> bool {
        while self.pending > 0 {
            let received = match deadline {
                Some(deadline) => self.reports.recv_deadline(deadline),
                None => self.reports.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(report) => self.record(report),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => {
                    error!(pending = self.pending, "stage workers vanished without reporting");
                    self.pending = 0;
                }
            }
        }
        true
    }

    fn record(&mut self, report: StageReport) {
        self.pending -= 1;
        match report.outcome {
            WorkerOutcome::Completed => {}
            WorkerOutcome::Cancelled => self.saw_cancelled = true,
            WorkerOutcome::Failed(error) => {
                if self.failure.is_none() {
                    self.failure = Some(error);
                } else {
                    warn!(
                        stage = %report.stage,
                        worker = report.worker,
                        error = %error,
                        "further stage failure"
                    );
                }
            }
        }
    }

    fn conclude(&mut self) -> Completion {
        if let Some(completion) = &self.completion {
            return completion.clone();
        }
        for backend in &mut self.backends {
            if let Err(e) = backend.join_all() {
                error!(backend = %backend.kind(), error = %e, "failed to join backend");
            }
        }

        let summary = self.summary();
        let completion = match self.failure.clone() {
            Some(error) => Completion::StageFailure { error, summary },
            None if self.saw_cancelled || self.cancelled.load(Ordering::Acquire) => {
                Completion::Cancelled(summary)
            }
            None => Completion::Success(summary),
        };
        match &completion {
            Completion::StageFailure { error, .. } => error!(error = %error, "pipeline failed"),
            Completion::Cancelled(_) => info!("pipeline cancelled"),
            _ => info!("pipeline completed"),
        }
        self.completion = Some(completion.clone());
        completion
    }
}

impl Drop for RunningPipeline {
    fn drop(&mut self) {
        if self.completion.is_none() {
            self.cancel();
        }
    }
}
