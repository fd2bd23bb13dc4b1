use super::{ExecutorBackend, StageTask};
use crate::config::BackendKind;
use crate::error::{PipelineError, Result};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// One named OS thread per stage worker, all sharing the host's memory
#[derive(Default)]
pub struct ThreadPool {
    handles: Vec<(String, JoinHandle<()>)>,
}

impl ThreadPool {
    /// An empty pool; threads are spawned on submit
    pub fn new() -> Self {
        Self::default()
    }

    /// Threads submitted and not yet joined
    pub fn active(&self) -> usize {
        self.handles.len()
    }
}

impl ExecutorBackend for ThreadPool {
    fn kind(&self) -> BackendKind {
        BackendKind::Thread
    }

    fn submit(&mut self, task: StageTask) -> Result<()> {
        let task = match task {
            StageTask::Blocking(task) => task,
            other => {
                return Err(PipelineError::config(format!(
                    "stage `{}` cannot run on the thread backend",
                    other.name()
                )))
            }
        };

        let handle = thread::Builder::new()
            .name(format!("stage-{}", task.name))
            .spawn(task.run)
            .map_err(|e| {
                PipelineError::WorkerError(format!(
                    "failed to spawn thread for stage `{}`: {e}",
                    task.name
                ))
            })?;

        debug!(stage = %task.name, "spawned stage thread");
        self.handles.push((task.name, handle));
        Ok(())
    }

    fn join_all(&mut self) -> Result<()> {
        let mut panicked = Vec::new();
        for (name, handle) in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(stage = %name, "stage thread panicked");
                panicked.push(name);
            }
        }

        if panicked.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::WorkerError(format!(
                "threads panicked for stages: {}",
                panicked.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BlockingTask;
    use crate::sync::SharedCounter;

    #[test]
    fn test_runs_and_joins_tasks() {
        let counter = SharedCounter::new(0);
        let mut pool = ThreadPool::new();
        for i in 0..4 {
            let counter = counter.clone();
            pool.submit(StageTask::Blocking(BlockingTask {
                name: format!("worker-{i}"),
                run: Box::new(move || {
                    counter.increment(1);
                }),
            }))
            .unwrap();
        }
        assert_eq!(pool.active(), 4);
        pool.join_all().unwrap();
        assert_eq!(counter.get(), 4);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_reports_panicked_thread() {
        let mut pool = ThreadPool::new();
        pool.submit(StageTask::Blocking(BlockingTask {
            name: "explodes".into(),
            run: Box::new(|| panic!("stage body failed")),
        }))
        .unwrap();
        assert!(matches!(pool.join_all(), Err(PipelineError::WorkerError(_))));
    }

    #[test]
    fn test_rejects_cooperative_task() {
        let mut pool = ThreadPool::new();
        let result = pool.submit(StageTask::Cooperative(crate::backend::CooperativeTask {
            name: "coop".into(),
            future: Box::pin(async {}),
        }));
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }
}
