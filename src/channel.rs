use crate::backend::cooperative::assert_blocking_allowed;
use crate::error::{PipelineError, Result};
use crate::sync::WakerList;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;
use std::time::{Duration, Instant};

struct State<T> {
    buffer: VecDeque<T>,
    closed: bool,
    peak_len: usize,
    blocked_producers: usize,
    blocked_consumers: usize,
    put_wakers: WakerList,
    get_wakers: WakerList,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

/// A fixed-capacity FIFO queue with an explicit end of stream.
///
/// The same channel serves thread workers (blocking `put`/`get`), cooperative
/// tasks (`put_async`/`get_async`) and the host-side pumps of process
/// workers. Closing is idempotent: once closed no item can be enqueued, and
/// consumers drain what is buffered before they observe `None`.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Channel")
            .field("capacity", &self.shared.capacity)
            .field("len", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T> Channel<T> {
    /// Create a channel holding at most `capacity` items
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::config("channel capacity must be positive"));
        }
        Ok(Self::create(capacity))
    }

    /// Build a channel whose capacity was already validated
    pub(crate) fn create(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: VecDeque::with_capacity(capacity),
                    closed: false,
                    peak_len: 0,
                    blocked_producers: 0,
                    blocked_consumers: 0,
                    put_wakers: WakerList::default(),
                    get_wakers: WakerList::default(),
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Enqueue an item, blocking while the buffer is full
    pub fn put(&self, item: T) -> Result<()> {
        assert_blocking_allowed("Channel::put");
        self.put_until(item, None)
    }

    /// Enqueue an item, giving up once `timeout` has elapsed
    pub fn put_timeout(&self, item: T, timeout: Duration) -> Result<()> {
        assert_blocking_allowed("Channel::put_timeout");
        self.put_until(item, Some((Instant::now() + timeout, timeout)))
    }

    fn put_until(&self, item: T, deadline: Option<(Instant, Duration)>) -> Result<()> {
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(PipelineError::ChannelClosed);
            }
            if state.buffer.len() < self.shared.capacity {
                break;
            }

            state.blocked_producers += 1;
            let timed_out = match deadline {
                Some((at, _)) => self.shared.not_full.wait_until(&mut state, at).timed_out(),
                None => {
                    self.shared.not_full.wait(&mut state);
                    false
                }
            };
            state.blocked_producers -= 1;

            if timed_out && !state.closed && state.buffer.len() >= self.shared.capacity {
                let waited = deadline.map(|(_, d)| d).unwrap_or_default();
                return Err(PipelineError::TimedOut(waited));
            }
        }

        self.push_locked(&mut state, item);
        Ok(())
    }

    /// Dequeue an item, blocking while the buffer is empty and open.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub fn get(&self) -> Option<T> {
        assert_blocking_allowed("Channel::get");
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = self.pop_locked(&mut state) {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state.blocked_consumers += 1;
            self.shared.not_empty.wait(&mut state);
            state.blocked_consumers -= 1;
        }
    }

    /// Dequeue an item, giving up once `timeout` has elapsed
    pub fn get_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        assert_blocking_allowed("Channel::get_timeout");
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(item) = self.pop_locked(&mut state) {
                return Ok(Some(item));
            }
            if state.closed {
                return Ok(None);
            }
            state.blocked_consumers += 1;
            let result = self.shared.not_empty.wait_until(&mut state, deadline);
            state.blocked_consumers -= 1;
            if result.timed_out() && state.buffer.is_empty() && !state.closed {
                return Err(PipelineError::TimedOut(timeout));
            }
        }
    }

    /// Cooperative `put`: suspends only while the buffer is full
    pub async fn put_async(&self, item: T) -> Result<()> {
        let mut slot = Some(item);
        poll_fn(|cx| {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Poll::Ready(Err(PipelineError::ChannelClosed));
            }
            if state.buffer.len() < self.shared.capacity {
                if let Some(item) = slot.take() {
                    self.push_locked(&mut state, item);
                }
                return Poll::Ready(Ok(()));
            }
            state.put_wakers.register(cx.waker());
            Poll::Pending
        })
        .await
    }

    /// Cooperative `get`: suspends only while the buffer is empty and open
    pub async fn get_async(&self) -> Option<T> {
        poll_fn(|cx| {
            let mut state = self.shared.state.lock();
            if let Some(item) = self.pop_locked(&mut state) {
                return Poll::Ready(Some(item));
            }
            if state.closed {
                return Poll::Ready(None);
            }
            state.get_wakers.register(cx.waker());
            Poll::Pending
        })
        .await
    }

    /// Close the channel for writing.
    ///
    /// Returns true only for the call that actually closed it; later calls
    /// have no effect.
    pub fn close(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.put_wakers.wake_all();
        state.get_wakers.wake_all();
        drop(state);

        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();
        true
    }

    fn push_locked(&self, state: &mut State<T>, item: T) {
        state.buffer.push_back(item);
        state.peak_len = state.peak_len.max(state.buffer.len());
        state.get_wakers.wake_all();
        self.shared.not_empty.notify_one();
    }

    fn pop_locked(&self, state: &mut State<T>) -> Option<T> {
        let item = state.buffer.pop_front()?;
        state.put_wakers.wake_all();
        self.shared.not_full.notify_one();
        Some(item)
    }

    /// Number of buffered items
    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most items the channel holds before `put` blocks
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// True once `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Buffer utilization as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len() * 100) / self.shared.capacity).min(100) as u32
    }

    /// Largest number of items ever buffered at once
    pub fn peak_len(&self) -> usize {
        self.shared.state.lock().peak_len
    }

    /// Producers currently suspended on a full buffer
    pub fn waiting_producers(&self) -> usize {
        let state = self.shared.state.lock();
        state.blocked_producers + state.put_wakers.len()
    }

    /// Consumers currently suspended on an empty buffer
    pub fn waiting_consumers(&self) -> usize {
        let state = self.shared.state.lock();
        state.blocked_consumers + state.get_wakers.len()
    }
}

/// Type-erased handle used to close every channel of a pipeline
pub(crate) trait Closeable: Send + Sync {
    fn close_channel(&self) -> bool;
}

impl<T: Send> Closeable for Channel<T> {
    fn close_channel(&self) -> bool {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_zero_capacity_rejected() {
        let result = Channel::<u8>::new(0);
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }

    #[test]
    fn test_fifo_single_producer() {
        let channel = Channel::new(4).unwrap();
        let producer = {
            let channel = channel.clone();
            thread::spawn(move || {
                for i in 0..100u32 {
                    channel.put(i).unwrap();
                }
                channel.close();
            })
        };

        let mut received = Vec::new();
        while let Some(item) = channel.get() {
            received.push(item);
        }
        producer.join().unwrap();

        assert_eq!(received, (0..100).collect::<Vec<_>>());
        assert!(channel.peak_len() <= 4);
    }

    #[test]
    fn test_put_blocks_at_capacity() {
        let channel = Channel::new(3).unwrap();
        for i in 0..3 {
            channel.put(i).unwrap();
        }

        let producer = {
            let channel = channel.clone();
            thread::spawn(move || channel.put(3))
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while channel.waiting_producers() == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(channel.waiting_producers(), 1);
        assert_eq!(channel.len(), 3);

        assert_eq!(channel.get(), Some(0));
        producer.join().unwrap().unwrap();
        assert_eq!(channel.len(), 3);
        assert_eq!(channel.peak_len(), 3);
    }

    #[test]
    fn test_close_is_idempotent() {
        let channel: Channel<u8> = Channel::new(2).unwrap();
        assert!(channel.close());
        assert!(!channel.close());
        assert!(channel.is_closed());
    }

    #[test]
    fn test_drains_after_close() {
        let channel = Channel::new(4).unwrap();
        channel.put("a").unwrap();
        channel.put("b").unwrap();
        channel.close();

        assert!(matches!(channel.put("c"), Err(PipelineError::ChannelClosed)));
        assert_eq!(channel.get(), Some("a"));
        assert_eq!(channel.get(), Some("b"));
        assert_eq!(channel.get(), None);
        assert_eq!(channel.get(), None);
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let channel: Channel<u32> = Channel::new(1).unwrap();
        let consumer = {
            let channel = channel.clone();
            thread::spawn(move || channel.get())
        };

        while channel.waiting_consumers() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        channel.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_close_fails_blocked_producer() {
        let channel = Channel::new(1).unwrap();
        channel.put(1).unwrap();
        let producer = {
            let channel = channel.clone();
            thread::spawn(move || channel.put(2))
        };

        while channel.waiting_producers() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        channel.close();
        assert!(matches!(
            producer.join().unwrap(),
            Err(PipelineError::ChannelClosed)
        ));
        assert_eq!(channel.get(), Some(1));
        assert_eq!(channel.get(), None);
    }

    #[test]
    fn test_timeouts() {
        let channel = Channel::new(1).unwrap();
        assert!(matches!(
            channel.get_timeout(Duration::from_millis(20)),
            Err(PipelineError::TimedOut(_))
        ));

        channel.put(7).unwrap();
        assert!(matches!(
            channel.put_timeout(8, Duration::from_millis(20)),
            Err(PipelineError::TimedOut(_))
        ));
        assert_eq!(channel.len(), 1);
        assert_eq!(channel.get_timeout(Duration::from_millis(20)).unwrap(), Some(7));
    }

    #[test]
    fn test_utilization() {
        let channel = Channel::new(10).unwrap();
        for i in 0..5 {
            channel.put(i).unwrap();
        }
        assert_eq!(channel.utilization(), 50);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_async_handoff_with_backpressure() {
        let channel = Channel::new(2).unwrap();
        let producer = {
            let channel = channel.clone();
            tokio::spawn(async move {
                for i in 0..10u32 {
                    channel.put_async(i).await.unwrap();
                }
                channel.close();
            })
        };

        let mut received = Vec::new();
        while let Some(item) = channel.get_async().await {
            received.push(item);
        }
        producer.await.unwrap();

        assert_eq!(received, (0..10).collect::<Vec<_>>());
        assert!(channel.peak_len() <= 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_async_put_after_close() {
        let channel = Channel::new(2).unwrap();
        channel.close();
        assert!(matches!(
            channel.put_async(1).await,
            Err(PipelineError::ChannelClosed)
        ));
        assert_eq!(channel.get_async().await, None);
    }
}
