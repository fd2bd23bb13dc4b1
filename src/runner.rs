use crate::backend::{process, BlockingTask, CooperativeTask, ProcessTask, StageTask, WorkerCommand};
use crate::channel::Channel;
use crate::config::{BackendKind, ErrorPolicy};
use crate::error::{BoxError, PipelineError, Result, StageError};
use crate::metrics::StageMetrics;
use crate::stage::{
    AsyncTransform, Generator, SinkSpec, SinkWork, SourceSpec, Stage, StageFactory, StageSpec,
    Work,
};
use crossbeam::channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// How one worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Input ended (or the generator ran out) and everything was written
    Completed,
    /// Stopped early because a neighbouring channel was closed or the pipeline was cancelled
    Cancelled,
    Failed(StageError),
}

/// Sent by every worker exactly once
#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: String,
    pub worker: usize,
    pub outcome: WorkerOutcome,
}

/// Why a worker loop stopped before its input ended
pub(crate) enum Halt {
    Cancelled,
    Failed(StageError),
}

pub(crate) type Flow = std::result::Result<(), Halt>;

pub(crate) enum Next<T> {
    Item(T),
    End,
    Cancelled,
}

/// Settings every worker of a pipeline shares
#[derive(Clone)]
pub(crate) struct LaunchEnv {
    pub(crate) policy: ErrorPolicy,
    pub(crate) cancelled: Arc<AtomicBool>,
    pub(crate) reports: Sender<StageReport>,
}

/// State shared by the workers of one stage
pub(crate) struct StageShared {
    pub(crate) name: String,
    pub(crate) policy: ErrorPolicy,
    pub(crate) metrics: StageMetrics,
    pub(crate) cancelled: Arc<AtomicBool>,
    live_workers: AtomicUsize,
    reports: Sender<StageReport>,
}

impl StageShared {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// One worker's view of its stage.
///
/// Reads the input, writes the output and, when the worker ends for any
/// reason, closes the right channels and sends exactly one [`StageReport`].
pub(crate) struct WorkerContext<I, O> {
    pub(crate) shared: Arc<StageShared>,
    pub(crate) worker: usize,
    pub(crate) input: Option<Channel<I>>,
    pub(crate) output: Option<Channel<O>>,
    reported: bool,
}

impl<I, O> WorkerContext<I, O> {
    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    pub(crate) fn item_context(&self, sequence: u64) -> String {
        format!("item #{sequence} (worker {})", self.worker)
    }

    /// Apply the error policy to a failed item
    pub(crate) fn item_failed(&self, item_context: String, cause: BoxError) -> Flow {
        match self.shared.policy {
            ErrorPolicy::Skip => {
                warn!(
                    stage = %self.shared.name,
                    item = %item_context,
                    error = %cause,
                    "skipping item"
                );
                self.shared.metrics.record_skipped();
                Ok(())
            }
            ErrorPolicy::Abort => Err(Halt::Failed(StageError::new(
                self.shared.name.as_str(),
                item_context,
                cause,
            ))),
        }
    }

    pub(crate) fn lifecycle_failed(&self, phase: &str, cause: BoxError) -> Halt {
        Halt::Failed(StageError::new(self.shared.name.as_str(), phase, cause))
    }

    pub(crate) fn next_item(&self) -> Next<I> {
        let Some(input) = &self.input else {
            return Next::End;
        };
        if self.shared.is_cancelled() {
            return Next::Cancelled;
        }
        match input.get() {
            Some(item) => Next::Item(item),
            None => self.end_of_input(),
        }
    }

    pub(crate) async fn next_item_async(&self) -> Next<I> {
        let Some(input) = &self.input else {
            return Next::End;
        };
        if self.shared.is_cancelled() {
            return Next::Cancelled;
        }
        match input.get_async().await {
            Some(item) => Next::Item(item),
            None => self.end_of_input(),
        }
    }

    fn end_of_input(&self) -> Next<I> {
        if self.shared.is_cancelled() {
            return Next::Cancelled;
        }
        self.shared.metrics.record_end_marker();
        Next::End
    }

    pub(crate) fn emit(&self, item: O) -> Flow {
        match &self.output {
            Some(output) => output.put(item).map_err(|_| Halt::Cancelled),
            None => Ok(()),
        }
    }

    pub(crate) async fn emit_async(&self, item: O) -> Flow {
        match &self.output {
            Some(output) => output.put_async(item).await.map_err(|_| Halt::Cancelled),
            None => Ok(()),
        }
    }

    pub(crate) fn close_input(&self) {
        if let Some(input) = &self.input {
            input.close();
        }
    }

    fn close_output(&self) {
        if let Some(output) = &self.output {
            output.close();
        }
    }

    /// Close channels as the outcome requires and report it
    pub(crate) fn finish(mut self, flow: Flow) {
        let outcome = match flow {
            Ok(()) => WorkerOutcome::Completed,
            Err(Halt::Cancelled) => WorkerOutcome::Cancelled,
            Err(Halt::Failed(e)) => WorkerOutcome::Failed(e),
        };
        self.report(outcome);
    }

    fn report(&mut self, outcome: WorkerOutcome) {
        self.reported = true;

        match &outcome {
            WorkerOutcome::Completed => {
                debug!(stage = %self.shared.name, worker = self.worker, "worker completed");
            }
            WorkerOutcome::Cancelled => {
                // Upstream producers must not stay blocked on a consumer that left.
                self.close_input();
                debug!(stage = %self.shared.name, worker = self.worker, "worker cancelled");
            }
            WorkerOutcome::Failed(e) => {
                self.close_input();
                self.close_output();
                error!(stage = %self.shared.name, worker = self.worker, error = %e, "stage failed");
            }
        }

        // The last worker out ends the stream for the next stage, exactly once.
        if self.shared.live_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.close_output();
            info!(
                stage = %self.shared.name,
                processed = self.shared.metrics.processed(),
                skipped = self.shared.metrics.skipped(),
                "stage finished"
            );
        }

        let report = StageReport {
            stage: self.shared.name.clone(),
            worker: self.worker,
            outcome,
        };
        if self.shared.reports.send(report).is_err() {
            debug!(stage = %self.shared.name, "pipeline dropped before worker report");
        }
    }
}

impl<I, O> Drop for WorkerContext<I, O> {
    fn drop(&mut self) {
        if !self.reported {
            let error = StageError::new(
                self.shared.name.as_str(),
                format!("worker {}", self.worker),
                "worker stopped without reporting (panicked or was never started)",
            );
            self.report(WorkerOutcome::Failed(error));
        }
    }
}

/// A stage lowered to the tasks its workers will run
pub(crate) struct StageNode {
    pub(crate) name: String,
    pub(crate) backend: BackendKind,
    pub(crate) workers: usize,
    pub(crate) metrics: StageMetrics,
    pub(crate) launch: Box<dyn FnOnce(&LaunchEnv) -> Vec<StageTask> + Send>,
}

fn contexts<I, O>(
    name: &str,
    workers: usize,
    metrics: &StageMetrics,
    input: Option<Channel<I>>,
    output: Option<Channel<O>>,
    env: &LaunchEnv,
) -> Vec<WorkerContext<I, O>> {
    let shared = Arc::new(StageShared {
        name: name.to_string(),
        policy: env.policy,
        metrics: metrics.clone(),
        cancelled: Arc::clone(&env.cancelled),
        live_workers: AtomicUsize::new(workers),
        reports: env.reports.clone(),
    });

    (0..workers)
        .map(|worker| WorkerContext {
            shared: Arc::clone(&shared),
            worker,
            input: input.clone(),
            output: output.clone(),
            reported: false,
        })
        .collect()
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(PipelineError::config("stage names must not be empty"));
    }
    Ok(())
}

fn validate_workers(name: &str, workers: usize) -> Result<()> {
    if workers == 0 {
        return Err(PipelineError::config(format!(
            "stage `{name}` needs at least one worker"
        )));
    }
    Ok(())
}

pub(crate) fn lower_source<T: Send + 'static>(
    spec: SourceSpec<T>,
    output: Channel<T>,
) -> Result<StageNode> {
    let SourceSpec {
        name,
        backend,
        generator,
    } = spec;
    validate_name(&name)?;
    if backend == BackendKind::Process {
        return Err(PipelineError::config(format!(
            "source `{name}` runs in the host; sources cannot use the process backend"
        )));
    }

    let metrics = StageMetrics::new();
    let node_metrics = metrics.clone();
    let task_name = name.clone();
    let launch = move |env: &LaunchEnv| -> Vec<StageTask> {
        let mut contexts = contexts::<(), T>(&task_name, 1, &node_metrics, None, Some(output), env);
        let Some(ctx) = contexts.pop() else {
            return Vec::new();
        };
        vec![match backend {
            BackendKind::Cooperative => StageTask::Cooperative(CooperativeTask {
                name: task_name,
                future: Box::pin(run_source_async(ctx, generator)),
            }),
            _ => StageTask::Blocking(BlockingTask {
                name: task_name,
                run: Box::new(move || run_source(ctx, generator)),
            }),
        }]
    };

    Ok(StageNode {
        name,
        backend,
        workers: 1,
        metrics,
        launch: Box::new(launch),
    })
}

pub(crate) fn lower_stage<T, U>(
    spec: StageSpec<T, U>,
    input: Channel<T>,
    output: Channel<U>,
) -> Result<StageNode>
where
    T: Send + 'static,
    U: Send + 'static,
{
    let StageSpec {
        name,
        backend,
        workers,
        work,
    } = spec;
    validate_name(&name)?;
    validate_workers(&name, workers)?;

    match (&work, backend) {
        (Work::Blocking(_), BackendKind::Thread | BackendKind::Cooperative) => {}
        (Work::Async(_), BackendKind::Cooperative) => {}
        (Work::Remote(_), BackendKind::Process) => {}
        (Work::Async(_), _) => {
            return Err(PipelineError::config(format!(
                "stage `{name}` has an async transform and must use the cooperative backend"
            )))
        }
        (Work::Remote(_), _) => {
            return Err(PipelineError::config(format!(
                "stage `{name}` names a registered transform and must use the process backend"
            )))
        }
        (Work::Blocking(_), BackendKind::Process) => {
            return Err(PipelineError::config(format!(
                "stage `{name}` captures a closure, which cannot cross a process boundary; \
                 use StageSpec::remote with a registered transform"
            )))
        }
    }

    let metrics = StageMetrics::new();
    let node_metrics = metrics.clone();
    let task_name = name.clone();
    let launch = move |env: &LaunchEnv| -> Vec<StageTask> {
        contexts(&task_name, workers, &node_metrics, Some(input), Some(output), env)
            .into_iter()
            .map(|ctx| match &work {
                Work::Blocking(factory) if backend == BackendKind::Cooperative => {
                    StageTask::Cooperative(CooperativeTask {
                        name: task_name.clone(),
                        future: Box::pin(run_stage_async(ctx, Arc::clone(factory))),
                    })
                }
                Work::Blocking(factory) => {
                    let factory = Arc::clone(factory);
                    StageTask::Blocking(BlockingTask {
                        name: task_name.clone(),
                        run: Box::new(move || run_stage(ctx, factory)),
                    })
                }
                Work::Async(transform) => StageTask::Cooperative(CooperativeTask {
                    name: task_name.clone(),
                    future: Box::pin(run_async_transform(ctx, Arc::clone(transform))),
                }),
                Work::Remote(remote) => {
                    let remote = Arc::clone(remote);
                    StageTask::Process(ProcessTask {
                        name: task_name.clone(),
                        launch: Box::new(move |command: &WorkerCommand| {
                            process::launch_remote(ctx, remote, command)
                        }),
                    })
                }
            })
            .collect()
    };

    Ok(StageNode {
        name,
        backend,
        workers,
        metrics,
        launch: Box::new(launch),
    })
}

pub(crate) fn lower_sink<T: Send + 'static>(
    spec: SinkSpec<T>,
    input: Channel<T>,
) -> Result<StageNode> {
    let SinkSpec {
        name,
        backend,
        workers,
        work,
    } = spec;
    validate_name(&name)?;
    validate_workers(&name, workers)?;
    if backend == BackendKind::Process {
        return Err(PipelineError::config(format!(
            "sink `{name}` runs in the host; sinks cannot use the process backend"
        )));
    }

    let work = Arc::new(work);
    let metrics = StageMetrics::new();
    let node_metrics = metrics.clone();
    let task_name = name.clone();
    let launch = move |env: &LaunchEnv| -> Vec<StageTask> {
        contexts::<T, ()>(&task_name, workers, &node_metrics, Some(input), None, env)
            .into_iter()
            .map(|ctx| {
                let work = Arc::clone(&work);
                match backend {
                    BackendKind::Cooperative => StageTask::Cooperative(CooperativeTask {
                        name: task_name.clone(),
                        future: Box::pin(run_sink_async(ctx, work)),
                    }),
                    _ => StageTask::Blocking(BlockingTask {
                        name: task_name.clone(),
                        run: Box::new(move || run_sink(ctx, work)),
                    }),
                }
            })
            .collect()
    };

    Ok(StageNode {
        name,
        backend,
        workers,
        metrics,
        launch: Box::new(launch),
    })
}

fn run_source<T>(ctx: WorkerContext<(), T>, generator: Generator<T>) {
    info!(stage = %ctx.name(), "source started");
    let flow = drive_source(&ctx, generator);
    ctx.finish(flow);
}

fn drive_source<T>(ctx: &WorkerContext<(), T>, generator: Generator<T>) -> Flow {
    for (sequence, item) in (0u64..).zip(generator) {
        if ctx.shared.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        match item {
            Ok(item) => {
                ctx.emit(item)?;
                ctx.shared.metrics.record_processed();
            }
            Err(cause) => ctx.item_failed(ctx.item_context(sequence), cause)?,
        }
    }
    Ok(())
}

async fn run_source_async<T>(ctx: WorkerContext<(), T>, generator: Generator<T>) {
    info!(stage = %ctx.name(), "source started");
    let flow = drive_source_async(&ctx, generator).await;
    ctx.finish(flow);
}

async fn drive_source_async<T>(ctx: &WorkerContext<(), T>, generator: Generator<T>) -> Flow {
    for (sequence, item) in (0u64..).zip(generator) {
        if ctx.shared.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        match item {
            Ok(item) => {
                ctx.emit_async(item).await?;
                ctx.shared.metrics.record_processed();
            }
            Err(cause) => ctx.item_failed(ctx.item_context(sequence), cause)?,
        }
    }
    Ok(())
}

fn run_stage<T: 'static, U: 'static>(ctx: WorkerContext<T, U>, factory: StageFactory<T, U>) {
    debug!(stage = %ctx.name(), worker = ctx.worker, "stage worker started");
    let mut stage = factory();
    let flow = drive_stage(&ctx, stage.as_mut());
    ctx.finish(flow);
}

fn drive_stage<T: 'static, U: 'static>(
    ctx: &WorkerContext<T, U>,
    stage: &mut dyn Stage<T, U>,
) -> Flow {
    stage
        .on_start()
        .map_err(|e| ctx.lifecycle_failed("start", e))?;

    let mut sequence = 0u64;
    let flow = loop {
        let item = match ctx.next_item() {
            Next::Item(item) => item,
            Next::End => break Ok(()),
            Next::Cancelled => break Err(Halt::Cancelled),
        };

        let started = Instant::now();
        let step = match stage.process(item) {
            Ok(outputs) => {
                ctx.shared.metrics.record_latency(started.elapsed());
                ctx.shared.metrics.record_processed();
                outputs.into_iter().try_for_each(|output| ctx.emit(output))
            }
            Err(cause) => ctx.item_failed(ctx.item_context(sequence), cause),
        };
        sequence += 1;
        if let Err(halt) = step {
            break Err(halt);
        }
    };

    shutdown(ctx, stage, flow)
}

/// Run `on_shutdown` on every exit path; its failure only matters after a clean run
fn shutdown<T: 'static, U: 'static>(
    ctx: &WorkerContext<T, U>,
    stage: &mut dyn Stage<T, U>,
    flow: Flow,
) -> Flow {
    match (stage.on_shutdown(), flow) {
        (Ok(()), flow) => flow,
        (Err(e), Ok(())) => Err(ctx.lifecycle_failed("shutdown", e)),
        (Err(e), halted) => {
            warn!(stage = %ctx.name(), error = %e, "shutdown hook failed after the stage halted");
            halted
        }
    }
}

/// A synchronous stage on the cooperative scheduler: `process` runs inline,
/// only the channel operations suspend.
async fn run_stage_async<T: 'static, U: 'static>(
    ctx: WorkerContext<T, U>,
    factory: StageFactory<T, U>,
) {
    debug!(stage = %ctx.name(), worker = ctx.worker, "cooperative stage worker started");
    let mut stage = factory();
    let flow = drive_stage_async(&ctx, stage.as_mut()).await;
    ctx.finish(flow);
}

async fn drive_stage_async<T: 'static, U: 'static>(
    ctx: &WorkerContext<T, U>,
    stage: &mut dyn Stage<T, U>,
) -> Flow {
    if let Err(e) = stage.on_start() {
        return Err(ctx.lifecycle_failed("start", e));
    }

    let mut sequence = 0u64;
    let flow = loop {
        let item = match ctx.next_item_async().await {
            Next::Item(item) => item,
            Next::End => break Ok(()),
            Next::Cancelled => break Err(Halt::Cancelled),
        };

        let started = Instant::now();
        let step = match stage.process(item) {
            Ok(outputs) => {
                ctx.shared.metrics.record_latency(started.elapsed());
                ctx.shared.metrics.record_processed();
                emit_all_async(ctx, outputs).await
            }
            Err(cause) => ctx.item_failed(ctx.item_context(sequence), cause),
        };
        sequence += 1;
        if let Err(halt) = step {
            break Err(halt);
        }
    };

    shutdown(ctx, stage, flow)
}

async fn emit_all_async<T, U>(ctx: &WorkerContext<T, U>, outputs: Vec<U>) -> Flow {
    for output in outputs {
        ctx.emit_async(output).await?;
    }
    Ok(())
}

async fn run_async_transform<T, U>(ctx: WorkerContext<T, U>, transform: AsyncTransform<T, U>) {
    debug!(stage = %ctx.name(), worker = ctx.worker, "async stage worker started");
    let flow = drive_async_transform(&ctx, transform).await;
    ctx.finish(flow);
}

async fn drive_async_transform<T, U>(
    ctx: &WorkerContext<T, U>,
    transform: AsyncTransform<T, U>,
) -> Flow {
    let mut sequence = 0u64;
    loop {
        let item = match ctx.next_item_async().await {
            Next::Item(item) => item,
            Next::End => return Ok(()),
            Next::Cancelled => return Err(Halt::Cancelled),
        };

        let started = Instant::now();
        match transform(item).await {
            Ok(output) => {
                ctx.shared.metrics.record_latency(started.elapsed());
                ctx.shared.metrics.record_processed();
                ctx.emit_async(output).await?;
            }
            Err(cause) => ctx.item_failed(ctx.item_context(sequence), cause)?,
        }
        sequence += 1;
    }
}

fn consume<T>(ctx: &WorkerContext<T, ()>, work: &SinkWork<T>, item: T, sequence: u64) -> Flow {
    let result = match work {
        SinkWork::Collect(collector) => {
            collector.push(item);
            Ok(())
        }
        SinkWork::ForEach(consumer) => consumer(item),
    };
    match result {
        Ok(()) => {
            ctx.shared.metrics.record_processed();
            Ok(())
        }
        Err(cause) => ctx.item_failed(ctx.item_context(sequence), cause),
    }
}

fn run_sink<T>(ctx: WorkerContext<T, ()>, work: Arc<SinkWork<T>>) {
    debug!(stage = %ctx.name(), worker = ctx.worker, "sink worker started");
    let mut sequence = 0u64;
    let flow = loop {
        let item = match ctx.next_item() {
            Next::Item(item) => item,
            Next::End => break Ok(()),
            Next::Cancelled => break Err(Halt::Cancelled),
        };
        if let Err(halt) = consume(&ctx, &work, item, sequence) {
            break Err(halt);
        }
        sequence += 1;
    };
    ctx.finish(flow);
}

async fn run_sink_async<T>(ctx: WorkerContext<T, ()>, work: Arc<SinkWork<T>>) {
    debug!(stage = %ctx.name(), worker = ctx.worker, "cooperative sink worker started");
    let mut sequence = 0u64;
    let flow = loop {
        let item = match ctx.next_item_async().await {
            Next::Item(item) => item,
            Next::End => break Ok(()),
            Next::Cancelled => break Err(Halt::Cancelled),
        };
        if let Err(halt) = consume(&ctx, &work, item, sequence) {
            break Err(halt);
        }
        sequence += 1;
    };
    ctx.finish(flow);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CooperativeTaskSet, ExecutorBackend};
    use crate::error::TransformResult;
    use crate::sync::SharedCounter;
    use crossbeam::channel::unbounded;
    use tracing_test::traced_test;

    fn env(policy: ErrorPolicy) -> (LaunchEnv, crossbeam::channel::Receiver<StageReport>) {
        let (reports, receiver) = unbounded();
        (
            LaunchEnv {
                policy,
                cancelled: Arc::new(AtomicBool::new(false)),
                reports,
            },
            receiver,
        )
    }

    fn run_blocking(tasks: Vec<StageTask>) {
        for task in tasks {
            match task {
                StageTask::Blocking(task) => (task.run)(),
                _ => panic!("expected a blocking task"),
            }
        }
    }

    #[test]
    fn test_last_worker_closes_output() {
        let (env, reports) = env(ErrorPolicy::Abort);
        let input = Channel::new(8).unwrap();
        let output = Channel::new(8).unwrap();
        for i in 0..4u32 {
            input.put(i).unwrap();
        }
        input.close();

        let node = lower_stage(
            StageSpec::map("inc", |n: u32| Ok(n + 1)).workers(2),
            input,
            output.clone(),
        )
        .unwrap();
        let tasks = (node.launch)(&env);
        assert_eq!(tasks.len(), 2);

        let mut tasks = tasks.into_iter();
        run_blocking(tasks.next().into_iter().collect());
        assert!(!output.is_closed());
        run_blocking(tasks.collect());
        assert!(output.is_closed());

        assert_eq!(node.metrics.end_markers(), 2);
        assert_eq!(reports.try_iter().count(), 2);
    }

    #[test]
    #[traced_test]
    fn test_skip_policy_logs_and_continues() {
        let (env, reports) = env(ErrorPolicy::Skip);
        let input = Channel::new(8).unwrap();
        let output = Channel::new(8).unwrap();
        for i in 0..3u32 {
            input.put(i).unwrap();
        }
        input.close();

        let node = lower_stage(
            StageSpec::map("odd_only", |n: u32| {
                if n == 1 {
                    Err("one is not allowed".into())
                } else {
                    Ok(n)
                }
            }),
            input,
            output.clone(),
        )
        .unwrap();
        run_blocking((node.launch)(&env));

        assert_eq!(output.get(), Some(0));
        assert_eq!(output.get(), Some(2));
        assert_eq!(output.get(), None);
        assert_eq!(node.metrics.skipped(), 1);
        assert_eq!(reports.recv().unwrap().outcome, WorkerOutcome::Completed);
        assert!(logs_contain("skipping item"));
    }

    #[test]
    fn test_abort_closes_both_sides() {
        let (env, reports) = env(ErrorPolicy::Abort);
        let input = Channel::new(8).unwrap();
        let output = Channel::new(8).unwrap();
        for i in 0..5u32 {
            input.put(i).unwrap();
        }

        let node = lower_stage(
            StageSpec::map("fails_on_two", |n: u32| {
                if n == 2 {
                    Err("two".into())
                } else {
                    Ok(n)
                }
            }),
            input.clone(),
            output.clone(),
        )
        .unwrap();
        run_blocking((node.launch)(&env));

        assert!(input.is_closed());
        assert!(output.is_closed());
        assert!(matches!(input.put(9), Err(PipelineError::ChannelClosed)));
        let report = reports.recv().unwrap();
        match report.outcome {
            WorkerOutcome::Failed(e) => {
                assert_eq!(e.stage_name, "fails_on_two");
                assert_eq!(e.cause, "two");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    struct Twice {
        hooks: SharedCounter,
    }

    impl Stage<u32, u32> for Twice {
        fn process(&mut self, item: u32) -> TransformResult<Vec<u32>> {
            Ok(vec![item, item])
        }

        fn on_start(&mut self) -> TransformResult<()> {
            self.hooks.increment(1);
            Ok(())
        }

        fn on_shutdown(&mut self) -> TransformResult<()> {
            self.hooks.increment(10);
            Ok(())
        }
    }

    fn twice_spec(hooks: &SharedCounter, backend: BackendKind) -> StageSpec<u32, u32> {
        let hooks = hooks.clone();
        StageSpec::new("twice", move || Twice {
            hooks: hooks.clone(),
        })
        .backend(backend)
    }

    #[test]
    fn test_custom_stage_on_both_in_process_schedulers() {
        for backend in [BackendKind::Thread, BackendKind::Cooperative] {
            let (env, reports) = env(ErrorPolicy::Abort);
            let hooks = SharedCounter::new(0);
            let input = Channel::new(4).unwrap();
            let output = Channel::new(8).unwrap();
            for i in 0..3u32 {
                input.put(i).unwrap();
            }
            input.close();

            let node = lower_stage(twice_spec(&hooks, backend), input, output.clone()).unwrap();
            let tasks = (node.launch)(&env);
            if backend == BackendKind::Cooperative {
                let mut set = CooperativeTaskSet::new().unwrap();
                for task in tasks {
                    assert_eq!(task.kind(), BackendKind::Cooperative);
                    set.submit(task).unwrap();
                }
                set.join_all().unwrap();
            } else {
                run_blocking(tasks);
            }

            let mut seen = Vec::new();
            while let Some(item) = output.get() {
                seen.push(item);
            }
            assert_eq!(seen, vec![0, 0, 1, 1, 2, 2], "backend {backend}");
            assert_eq!(hooks.get(), 11, "backend {backend}");
            assert_eq!(node.metrics.processed(), 3);
            assert_eq!(reports.recv().unwrap().outcome, WorkerOutcome::Completed);
        }
    }

    #[test]
    fn test_dropped_worker_reports_failure() {
        let (env, reports) = env(ErrorPolicy::Abort);
        let output: Channel<u32> = Channel::new(2).unwrap();
        let node = lower_source(SourceSpec::iter("numbers", 0..3u32), output.clone()).unwrap();
        drop((node.launch)(&env));

        assert!(output.is_closed());
        assert!(matches!(
            reports.recv().unwrap().outcome,
            WorkerOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_backend_mismatch_rejected() {
        let input: Channel<u32> = Channel::new(1).unwrap();
        let output: Channel<u32> = Channel::new(1).unwrap();
        let result = lower_stage(
            StageSpec::map_async("sleepy", |n: u32| async move { Ok(n) })
                .backend(BackendKind::Thread),
            input.clone(),
            output.clone(),
        );
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));

        let result = lower_stage(
            StageSpec::map("closure", |n: u32| Ok(n)).backend(BackendKind::Process),
            input,
            output,
        );
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }
}
