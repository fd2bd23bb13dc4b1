use super::registry::{POLICY_ENV, STAGE_ENV, TRANSFORM_ENV};
use super::wire::{Frame, Reply};
use super::{ExecutorBackend, StageTask};
use crate::channel::Channel;
use crate::config::BackendKind;
use crate::error::{PipelineError, Result, StageError};
use crate::runner::{Flow, Halt, StageShared, WorkerContext};
use crate::stage::RemoteTransform;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::{ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// How to start a worker process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Run `program` with no extra arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-run the current executable as the worker
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| {
            PipelineError::WorkerError(format!("cannot locate the current executable: {e}"))
        })?;
        Ok(Self::new(program))
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

/// One child process per stage worker.
///
/// Two host threads pump each child: a feeder from the input channel to its
/// stdin and a reader from its stdout to the output channel. Only serialized
/// frames cross the boundary.
pub struct ProcessPool {
    command: WorkerCommand,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl ProcessPool {
    /// Start every worker with `command`
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            handles: Vec::new(),
        }
    }

    /// Command each worker is started with
    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Host threads submitted and not yet joined
    pub fn active(&self) -> usize {
        self.handles.len()
    }
}

impl ExecutorBackend for ProcessPool {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    fn submit(&mut self, task: StageTask) -> Result<()> {
        let task = match task {
            StageTask::Process(task) => task,
            other => {
                return Err(PipelineError::config(format!(
                    "stage `{}` cannot run on the process backend",
                    other.name()
                )))
            }
        };

        let handles = (task.launch)(&self.command);
        debug!(stage = %task.name, threads = handles.len(), "launched process worker");
        self.handles
            .extend(handles.into_iter().map(|handle| (task.name.clone(), handle)));
        Ok(())
    }

    fn join_all(&mut self) -> Result<()> {
        let mut panicked = Vec::new();
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(stage = %name, "process worker thread panicked");
                panicked.push(name);
            }
        }
        if panicked.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::WorkerError(format!(
                "process worker threads panicked in stages: {}",
                panicked.join(", ")
            )))
        }
    }
}

/// Start the host thread that owns one worker process
pub(crate) fn launch_remote<T, U>(
    ctx: WorkerContext<T, U>,
    remote: Arc<RemoteTransform<T, U>>,
    command: &WorkerCommand,
) -> Vec<JoinHandle<()>>
where
    T: Send + 'static,
    U: Send + 'static,
{
    let mut process = command.to_command();
    process
        .env(TRANSFORM_ENV, &remote.transform)
        .env(STAGE_ENV, ctx.name())
        .env(POLICY_ENV, ctx.shared.policy.as_str())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let thread_name = format!("stage-{}-{}", ctx.name(), ctx.worker);
    // On spawn failure the closure is dropped and the context reports the failure.
    match thread::Builder::new()
        .name(thread_name)
        .spawn(move || run_remote(ctx, remote, process))
    {
        Ok(handle) => vec![handle],
        Err(e) => {
            error!(error = %e, "failed to spawn process worker thread");
            Vec::new()
        }
    }
}

fn run_remote<T, U>(
    ctx: WorkerContext<T, U>,
    remote: Arc<RemoteTransform<T, U>>,
    mut process: Command,
) where
    T: Send + 'static,
    U: Send + 'static,
{
    let mut child = match process.spawn() {
        Ok(child) => child,
        Err(e) => {
            let halt = ctx.lifecycle_failed(
                "worker startup",
                format!("failed to start worker process: {e}").into(),
            );
            ctx.finish(Err(halt));
            return;
        }
    };
    debug!(
        stage = %ctx.name(),
        worker = ctx.worker,
        pid = child.id(),
        "worker process started"
    );

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        let halt = ctx.lifecycle_failed("worker startup", "worker pipes unavailable".into());
        ctx.finish(Err(halt));
        return;
    };

    let stop = Arc::new(AtomicBool::new(false));
    let feed_error = Arc::new(Mutex::new(None::<StageError>));
    // One credit per item in flight inside the child, as many as the input holds.
    let window = ctx.input.as_ref().map_or(1, Channel::capacity);
    let (credits, returned) = bounded::<()>(window);
    let feeder = {
        let input = ctx.input.clone();
        let shared = Arc::clone(&ctx.shared);
        let remote = Arc::clone(&remote);
        let stop = Arc::clone(&stop);
        let feed_error = Arc::clone(&feed_error);
        thread::Builder::new()
            .name(format!("feed-{}-{}", ctx.name(), ctx.worker))
            .spawn(move || feed(input, stdin, credits, &*remote, &shared, &stop, &feed_error))
    };
    let feeder = match feeder {
        Ok(handle) => handle,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            let halt = ctx.lifecycle_failed(
                "worker startup",
                format!("failed to spawn feeder thread: {e}").into(),
            );
            ctx.finish(Err(halt));
            return;
        }
    };

    let mut flow = read_replies(&ctx, BufReader::new(stdout), &remote, &returned);
    // A feeder waiting for credit sees the window disconnect and stops.
    drop(returned);
    if flow.is_err() {
        stop.store(true, Ordering::Release);
        ctx.close_input();
        // The child may be blocked on either pipe; it has nothing left to say.
        if let Err(e) = child.kill() {
            debug!(stage = %ctx.name(), error = %e, "worker process already exited");
        }
    }

    if feeder.join().is_err() {
        flow = Err(ctx.lifecycle_failed("feeding worker", "feeder thread panicked".into()));
    }
    if let Some(e) = feed_error.lock().take() {
        flow = Err(Halt::Failed(e));
    }

    match child.wait() {
        Ok(status) if !status.success() && flow.is_ok() => {
            warn!(
                stage = %ctx.name(),
                %status,
                "worker process exited with failure after its end marker"
            );
        }
        Ok(_) => {}
        Err(e) => warn!(stage = %ctx.name(), error = %e, "failed to reap worker process"),
    }
    ctx.finish(flow);
}

/// Input channel to child stdin, ending with one end frame.
///
/// Each item takes a credit before it is written and the reader hands the
/// credit back when the item's reply arrives, so no more items than the
/// window holds sit in the pipes and the child at once.
fn feed<T, U>(
    input: Option<Channel<T>>,
    stdin: ChildStdin,
    credits: Sender<()>,
    remote: &RemoteTransform<T, U>,
    shared: &StageShared,
    stop: &AtomicBool,
    feed_error: &Mutex<Option<StageError>>,
) {
    let mut writer = BufWriter::new(stdin);
    let stopped = || stop.load(Ordering::Acquire) || shared.is_cancelled();

    if let Some(input) = input {
        while let Some(item) = input.get() {
            if stopped() || credits.send(()).is_err() {
                return;
            }
            let line = match (remote.encode)(&Frame::Item(item)) {
                Ok(line) => line,
                Err(e) => {
                    *feed_error.lock() = Some(StageError::new(
                        shared.name.as_str(),
                        "encoding item for worker",
                        e,
                    ));
                    return;
                }
            };
            if let Err(e) = writer.write_all(line.as_bytes()).and_then(|()| writer.flush()) {
                debug!(stage = %shared.name, error = %e, "worker stdin closed");
                return;
            }
        }
    }

    if stopped() {
        return;
    }
    shared.metrics.record_end_marker();
    let end = (remote.encode)(&Frame::End);
    let written = match end {
        Ok(line) => writer.write_all(line.as_bytes()).and_then(|()| writer.flush()),
        Err(e) => Err(std::io::Error::other(e)),
    };
    if let Err(e) = written {
        debug!(stage = %shared.name, error = %e, "could not send end frame");
    }
}

/// Child stdout to output channel, until the worker's end reply
fn read_replies<T, U>(
    ctx: &WorkerContext<T, U>,
    reader: impl BufRead,
    remote: &RemoteTransform<T, U>,
    credits: &Receiver<()>,
) -> Flow {
    for line in reader.lines() {
        let line = line.map_err(|e| ctx.lifecycle_failed("reading worker replies", e.into()))?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = (remote.decode)(&line)
            .map_err(|e| ctx.lifecycle_failed("decoding worker reply", e.into()))?;

        match reply {
            Reply::Item(item) => {
                ctx.shared.metrics.record_processed();
                ctx.emit(item)?;
                let _ = credits.try_recv();
            }
            Reply::Skipped {
                item_context,
                cause,
            } => {
                warn!(stage = %ctx.name(), item = %item_context, error = %cause, "skipping item");
                ctx.shared.metrics.record_skipped();
                let _ = credits.try_recv();
            }
            Reply::Failed {
                item_context,
                cause,
            } => {
                return Err(Halt::Failed(StageError::new(
                    ctx.name(),
                    format!("{item_context} (worker {})", ctx.worker),
                    cause,
                )));
            }
            Reply::End => {
                if ctx.shared.is_cancelled() {
                    return Err(Halt::Cancelled);
                }
                return Ok(());
            }
        }
    }

    Err(ctx.lifecycle_failed(
        "worker process",
        "worker exited without sending its end marker".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ErrorPolicy;
    use crate::runner::{lower_stage, LaunchEnv, WorkerOutcome};
    use crate::stage::StageSpec;
    use crossbeam::channel::unbounded;

    #[test]
    fn test_worker_command_from_json() {
        let command: WorkerCommand =
            serde_json::from_str(r#"{ "program": "/opt/bin/stage-worker" }"#).unwrap();
        assert_eq!(command, WorkerCommand::new("/opt/bin/stage-worker"));

        let command = WorkerCommand::new("worker").arg("--quiet");
        assert_eq!(command.args, vec!["--quiet".to_string()]);
    }

    #[test]
    fn test_current_exe_resolves() {
        let command = WorkerCommand::current_exe().unwrap();
        assert!(command.program.is_absolute());
    }

    #[test]
    fn test_missing_program_fails_stage() {
        let (reports, receiver) = unbounded();
        let env = LaunchEnv {
            policy: ErrorPolicy::Abort,
            cancelled: Arc::new(AtomicBool::new(false)),
            reports,
        };
        let input: Channel<u32> = Channel::new(4).unwrap();
        let output: Channel<u32> = Channel::new(4).unwrap();
        input.put(1).unwrap();

        let node = lower_stage(
            StageSpec::remote("double", "double"),
            input.clone(),
            output.clone(),
        )
        .unwrap();

        let mut pool = ProcessPool::new(WorkerCommand::new("/nonexistent/stage-worker"));
        for task in (node.launch)(&env) {
            pool.submit(task).unwrap();
        }
        pool.join_all().unwrap();

        match receiver.recv().unwrap().outcome {
            WorkerOutcome::Failed(e) => {
                assert_eq!(e.stage_name, "double");
                assert!(e.cause.contains("failed to start worker process"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(input.is_closed());
        assert!(output.is_closed());
    }

    #[test]
    fn test_rejects_other_tasks() {
        let mut pool = ProcessPool::new(WorkerCommand::new("worker"));
        let task = StageTask::Blocking(crate::backend::BlockingTask {
            name: "local".into(),
            run: Box::new(|| {}),
        });
        assert!(matches!(pool.submit(task), Err(PipelineError::ConfigError(_))));
        assert_eq!(pool.active(), 0);
    }
}
