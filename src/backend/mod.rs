pub mod cooperative;
pub mod process;
pub mod registry;
pub mod thread;
pub mod wire;

use crate::config::BackendKind;
use crate::error::Result;
use futures::future::BoxFuture;
use std::thread::JoinHandle;

pub use cooperative::CooperativeTaskSet;
pub use process::{ProcessPool, WorkerCommand};
pub use thread::ThreadPool;

/// Runs stage workers under one scheduling model.
///
/// A task carries its worker's whole lifecycle: it reports its own outcome
/// and closes its own channels, so a backend only runs and joins.
pub trait ExecutorBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Start running a stage worker; must not block on the worker itself
    fn submit(&mut self, task: StageTask) -> Result<()>;

    /// Wait for every submitted worker to finish
    fn join_all(&mut self) -> Result<()>;
}

/// A stage worker ready to be scheduled
pub enum StageTask {
    Blocking(BlockingTask),
    Cooperative(CooperativeTask),
    Process(ProcessTask),
}

impl StageTask {
    /// Name of the stage this worker belongs to
    pub fn name(&self) -> &str {
        match self {
            StageTask::Blocking(task) => &task.name,
            StageTask::Cooperative(task) => &task.name,
            StageTask::Process(task) => &task.name,
        }
    }

    /// Backend able to run this task
    pub fn kind(&self) -> BackendKind {
        match self {
            StageTask::Blocking(_) => BackendKind::Thread,
            StageTask::Cooperative(_) => BackendKind::Cooperative,
            StageTask::Process(_) => BackendKind::Process,
        }
    }
}

/// Worker body run to completion on a dedicated OS thread
pub struct BlockingTask {
    pub name: String,
    pub run: Box<dyn FnOnce() + Send + 'static>,
}

/// Worker body run as a task on the cooperative scheduler
pub struct CooperativeTask {
    pub name: String,
    pub future: BoxFuture<'static, ()>,
}

/// Starts a child process and the host-side threads that feed and drain it
pub struct ProcessTask {
    pub name: String,
    pub launch: Box<dyn FnOnce(&WorkerCommand) -> Vec<JoinHandle<()>> + Send + 'static>,
}
