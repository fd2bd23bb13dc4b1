use crate::backend::wire::{decode_line, encode_line, Frame, Reply};
use crate::config::BackendKind;
use crate::error::TransformResult;
use crate::sync::Mutex;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

/// A processing step between two channels
pub trait Stage<T, U>: Send + 'static {
    /// Process one input item, producing zero or more outputs
    fn process(&mut self, item: T) -> TransformResult<Vec<U>>;

    /// Called on the worker before the first item
    fn on_start(&mut self) -> TransformResult<()> {
        Ok(())
    }

    /// Called on the worker after its input ended
    fn on_shutdown(&mut self) -> TransformResult<()> {
        Ok(())
    }
}

/// One output per input
pub struct MapStage<F> {
    mapper: F,
}

impl<F> MapStage<F> {
    /// Wrap a one-to-one transform
    pub fn new(mapper: F) -> Self {
        Self { mapper }
    }
}

impl<T, U, F> Stage<T, U> for MapStage<F>
where
    F: FnMut(T) -> TransformResult<U> + Send + 'static,
{
    fn process(&mut self, item: T) -> TransformResult<Vec<U>> {
        Ok(vec![(self.mapper)(item)?])
    }
}

/// Passes through items matching a predicate
pub struct FilterStage<F> {
    predicate: F,
}

impl<F> FilterStage<F> {
    /// Keep the items `predicate` accepts
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<T, F> Stage<T, T> for FilterStage<F>
where
    F: FnMut(&T) -> bool + Send + 'static,
{
    fn process(&mut self, item: T) -> TransformResult<Vec<T>> {
        if (self.predicate)(&item) {
            Ok(vec![item])
        } else {
            Ok(vec![])
        }
    }
}

pub(crate) type StageFactory<T, U> = Arc<dyn Fn() -> Box<dyn Stage<T, U>> + Send + Sync>;
pub(crate) type AsyncTransform<T, U> =
    Arc<dyn Fn(T) -> BoxFuture<'static, TransformResult<U>> + Send + Sync>;

/// A transform resolved by name inside a worker process
pub(crate) struct RemoteTransform<T, U> {
    pub(crate) transform: String,
    pub(crate) encode: fn(&Frame<T>) -> serde_json::Result<String>,
    pub(crate) decode: fn(&str) -> serde_json::Result<Reply<U>>,
}

pub(crate) enum Work<T, U> {
    Blocking(StageFactory<T, U>),
    Async(AsyncTransform<T, U>),
    Remote(Arc<RemoteTransform<T, U>>),
}

/// A middle stage: `{name, transform, backend}` plus its worker count
pub struct StageSpec<T, U> {
    pub(crate) name: String,
    pub(crate) backend: BackendKind,
    pub(crate) workers: usize,
    pub(crate) work: Work<T, U>,
}

impl<T, U> StageSpec<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// A stage built from a factory; each worker gets its own instance
    pub fn new<S, F>(name: impl Into<String>, factory: F) -> Self
    where
        S: Stage<T, U>,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let factory: StageFactory<T, U> =
            Arc::new(move || -> Box<dyn Stage<T, U>> { Box::new(factory()) });
        Self {
            name: name.into(),
            backend: BackendKind::Thread,
            workers: 1,
            work: Work::Blocking(factory),
        }
    }

    /// One output per input; runs on threads or cooperative tasks
    pub fn map<F>(name: impl Into<String>, mapper: F) -> Self
    where
        F: Fn(T) -> TransformResult<U> + Send + Sync + 'static,
    {
        let mapper = Arc::new(mapper);
        Self::new(name, move || {
            let mapper = Arc::clone(&mapper);
            MapStage::new(move |item: T| mapper(item))
        })
    }

    /// An async transform; only valid on the cooperative backend
    pub fn map_async<F, Fut>(name: impl Into<String>, mapper: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TransformResult<U>> + Send + 'static,
    {
        Self {
            name: name.into(),
            backend: BackendKind::Cooperative,
            workers: 1,
            work: Work::Async(Arc::new(move |item: T| mapper(item).boxed())),
        }
    }

    /// Run this stage on a specific backend
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Number of workers sharing this stage's input and output
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Stage name used in metrics, logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> StageSpec<T, T>
where
    T: Send + 'static,
{
    /// Keeps the items matching `predicate`
    pub fn filter<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        Self::new(name, move || {
            let predicate = Arc::clone(&predicate);
            FilterStage::new(move |item: &T| predicate(item))
        })
    }
}

impl<T, U> StageSpec<T, U>
where
    T: Serialize + Send + 'static,
    U: DeserializeOwned + Send + 'static,
{
    /// A stage run in worker processes by the transform registered as `transform`.
    ///
    /// No closure is captured: worker processes share no memory with the host.
    pub fn remote(name: impl Into<String>, transform: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: BackendKind::Process,
            workers: 1,
            work: Work::Remote(Arc::new(RemoteTransform {
                transform: transform.into(),
                encode: encode_line::<Frame<T>>,
                decode: decode_line::<Reply<U>>,
            })),
        }
    }
}

pub(crate) type Generator<T> = Box<dyn Iterator<Item = TransformResult<T>> + Send>;

/// A stage with no input: writes generated items, then ends its output
pub struct SourceSpec<T> {
    pub(crate) name: String,
    pub(crate) backend: BackendKind,
    pub(crate) generator: Generator<T>,
}

impl<T: Send + 'static> SourceSpec<T> {
    /// A source that emits every item of `items`
    pub fn iter<I>(name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::try_iter(name, items.into_iter().map(Ok))
    }

    /// A generator whose items may fail
    pub fn try_iter<I>(name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = TransformResult<T>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            name: name.into(),
            backend: BackendKind::Thread,
            generator: Box::new(items.into_iter()),
        }
    }

    /// Run the source on a specific backend
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }
}

/// Items gathered by a collecting sink
#[derive(Debug)]
pub struct Collector<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T> Default for Collector<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> Collector<T> {
    /// An empty collector; clones share the same buffer
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, item: T) {
        self.items.lock().push(item);
    }

    /// Number of items collected
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True when nothing has been collected
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything collected so far
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }
}

impl<T: Clone> Collector<T> {
    /// Copy of everything collected so far
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().clone()
    }
}

pub(crate) enum SinkWork<T> {
    Collect(Collector<T>),
    ForEach(Arc<dyn Fn(T) -> TransformResult<()> + Send + Sync>),
}

/// A stage with no output: drains its input and counts what it consumed
pub struct SinkSpec<T> {
    pub(crate) name: String,
    pub(crate) backend: BackendKind,
    pub(crate) workers: usize,
    pub(crate) work: SinkWork<T>,
}

impl<T: Send + 'static> SinkSpec<T> {
    /// A sink that appends every item to `collector`
    pub fn collect(name: impl Into<String>, collector: Collector<T>) -> Self {
        Self {
            name: name.into(),
            backend: BackendKind::Thread,
            workers: 1,
            work: SinkWork::Collect(collector),
        }
    }

    /// A sink that hands every item to `consumer`
    pub fn for_each<F>(name: impl Into<String>, consumer: F) -> Self
    where
        F: Fn(T) -> TransformResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            backend: BackendKind::Thread,
            workers: 1,
            work: SinkWork::ForEach(Arc::new(consumer)),
        }
    }

    /// Run the sink on a specific backend
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Number of concurrent sink workers
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_stage() {
        let mut stage = MapStage::new(|n: u32| Ok(n * 2));
        assert_eq!(stage.process(5).unwrap(), vec![10]);
    }

    #[test]
    fn test_filter_stage() {
        let mut stage = FilterStage::new(|n: &u32| n % 2 == 0);
        assert!(stage.process(3).unwrap().is_empty());
        assert_eq!(stage.process(4).unwrap(), vec![4]);
    }

    #[test]
    fn test_spec_defaults() {
        let spec = StageSpec::map("double", |n: u32| Ok(n * 2));
        assert_eq!(spec.backend, BackendKind::Thread);
        assert_eq!(spec.workers, 1);

        let spec = StageSpec::map_async("wait", |n: u32| async move { Ok(n) });
        assert_eq!(spec.backend, BackendKind::Cooperative);

        let spec: StageSpec<u32, u32> = StageSpec::remote("square", "square").workers(3);
        assert_eq!(spec.backend, BackendKind::Process);
        assert_eq!(spec.workers, 3);
    }

    #[test]
    fn test_collector_take() {
        let collector = Collector::new();
        collector.clone().push(1);
        collector.push(2);
        assert_eq!(collector.snapshot(), vec![1, 2]);
        assert_eq!(collector.take(), vec![1, 2]);
        assert!(collector.is_empty());
    }
}
