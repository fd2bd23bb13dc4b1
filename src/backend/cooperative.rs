use super::{CooperativeTask, ExecutorBackend, StageTask};
use crate::config::BackendKind;
use crate::error::{PipelineError, Result};
use std::cell::Cell;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinSet;
use tracing::{debug, error};

thread_local! {
    static ON_SCHEDULER: Cell<bool> = const { Cell::new(false) };
}

/// True when called from the cooperative scheduler thread
pub fn on_scheduler_thread() -> bool {
    ON_SCHEDULER.with(Cell::get)
}

/// Panics when a blocking primitive is used from a cooperative task
pub(crate) fn assert_blocking_allowed(operation: &str) {
    if on_scheduler_thread() {
        panic!(
            "{operation} would block the cooperative scheduler thread; \
             cooperative tasks must use the async variant"
        );
    }
}

/// Explicit suspension point for cooperative tasks
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await
}

/// Tasks multiplexed onto one dedicated scheduler thread.
///
/// The thread drives a tokio current-thread runtime. A task gives up the
/// thread only at an `.await`, so CPU-bound work in one task stalls the rest.
pub struct CooperativeTaskSet {
    sender: Option<UnboundedSender<CooperativeTask>>,
    scheduler: Option<JoinHandle<()>>,
}

impl CooperativeTaskSet {
    /// Start the scheduler thread; tasks run as soon as they are submitted
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| {
                PipelineError::WorkerError(format!("failed to build cooperative runtime: {e}"))
            })?;

        let (sender, mut receiver) = unbounded_channel::<CooperativeTask>();
        let scheduler = thread::Builder::new()
            .name("cooperative-scheduler".into())
            .spawn(move || {
                ON_SCHEDULER.with(|flag| flag.set(true));
                runtime.block_on(async move {
                    let mut tasks = JoinSet::new();
                    while let Some(task) = receiver.recv().await {
                        debug!(stage = %task.name, "scheduling cooperative task");
                        tasks.spawn(task.future);
                    }
                    while let Some(joined) = tasks.join_next().await {
                        if let Err(e) = joined {
                            error!(error = %e, "cooperative task did not finish cleanly");
                        }
                    }
                });
            })
            .map_err(|e| {
                PipelineError::WorkerError(format!("failed to spawn scheduler thread: {e}"))
            })?;

        Ok(Self {
            sender: Some(sender),
            scheduler: Some(scheduler),
        })
    }
}

impl ExecutorBackend for CooperativeTaskSet {
    fn kind(&self) -> BackendKind {
        BackendKind::Cooperative
    }

    fn submit(&mut self, task: StageTask) -> Result<()> {
        let task = match task {
            StageTask::Cooperative(task) => task,
            other => {
                return Err(PipelineError::config(format!(
                    "stage `{}` cannot run on the cooperative backend",
                    other.name()
                )))
            }
        };

        let sender = self.sender.as_ref().ok_or_else(|| {
            PipelineError::WorkerError("cooperative scheduler already joined".into())
        })?;
        sender.send(task).map_err(|rejected| {
            PipelineError::WorkerError(format!(
                "cooperative scheduler stopped before stage `{}` was submitted",
                rejected.0.name
            ))
        })
    }

    fn join_all(&mut self) -> Result<()> {
        // Dropping the sender lets the scheduler stop accepting tasks and drain.
        self.sender.take();
        match self.scheduler.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| PipelineError::WorkerError("cooperative scheduler panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for CooperativeTaskSet {
    fn drop(&mut self) {
        self.sender.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::sync::SharedCounter;

    #[test]
    fn test_tasks_share_one_thread() {
        let mut set = CooperativeTaskSet::new().unwrap();
        let channel = Channel::new(1).unwrap();
        let seen = SharedCounter::new(0);

        let producer = channel.clone();
        set.submit(StageTask::Cooperative(CooperativeTask {
            name: "producer".into(),
            future: Box::pin(async move {
                assert!(on_scheduler_thread());
                for i in 0..10 {
                    producer.put_async(i).await.unwrap();
                }
                producer.close();
            }),
        }))
        .unwrap();

        let consumer = channel.clone();
        let counter = seen.clone();
        set.submit(StageTask::Cooperative(CooperativeTask {
            name: "consumer".into(),
            future: Box::pin(async move {
                while let Some(value) = consumer.get_async().await {
                    counter.increment(value);
                    sleep(Duration::from_millis(1)).await;
                }
            }),
        }))
        .unwrap();

        set.join_all().unwrap();
        assert_eq!(seen.get(), 45);
        assert!(!on_scheduler_thread());
    }

    #[test]
    fn test_blocking_call_panics_on_scheduler() {
        let mut set = CooperativeTaskSet::new().unwrap();
        let channel: Channel<u8> = Channel::new(1).unwrap();
        let finished = SharedCounter::new(0);

        let blocked = channel.clone();
        let counter = finished.clone();
        set.submit(StageTask::Cooperative(CooperativeTask {
            name: "misbehaving".into(),
            future: Box::pin(async move {
                let _ = blocked.get();
                counter.increment(1);
            }),
        }))
        .unwrap();

        set.join_all().unwrap();
        assert_eq!(finished.get(), 0);
    }
}
