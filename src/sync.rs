use crate::backend::cooperative::assert_blocking_allowed;
use crate::error::{PipelineError, Result};
use parking_lot::{Condvar, MutexGuard};
use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Poll, Waker};
use std::time::{Duration, Instant};

/// Wakers of suspended cooperative tasks
#[derive(Debug, Default)]
pub(crate) struct WakerList {
    wakers: Vec<Waker>,
}

impl WakerList {
    pub(crate) fn register(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|w| w.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }

    pub(crate) fn wake_all(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.wakers.len()
    }
}

/// Mutual exclusion with scoped acquisition.
///
/// Like every primitive here it has a blocking API for OS threads; blocking
/// calls made on the cooperative scheduler thread panic rather than stall it.
///
/// The guard releases on every exit path, including unwinding. It is not
/// `Send`, so it cannot be held across an `.await` in a cooperative task.
#[derive(Debug, Default)]
pub struct Mutex<T> {
    inner: parking_lot::Mutex<T>,
}

impl<T> Mutex<T> {
    /// Wrap `value` behind the lock
    pub fn new(value: T) -> Self {
        Self {
            inner: parking_lot::Mutex::new(value),
        }
    }

    /// Block until the lock is held
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Acquire the lock or fail with `TimedOut`
    pub fn lock_timeout(&self, timeout: Duration) -> Result<MutexGuard<'_, T>> {
        self.inner
            .try_lock_for(timeout)
            .ok_or(PipelineError::TimedOut(timeout))
    }

    /// Run `f` while holding the lock
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Consume the mutex and return the value
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// A mutex-guarded integer shared explicitly between workers
#[derive(Debug, Clone, Default)]
pub struct SharedCounter {
    value: Arc<Mutex<i64>>,
}

impl SharedCounter {
    /// A counter starting at `initial`; clones share the value
    pub fn new(initial: i64) -> Self {
        Self {
            value: Arc::new(Mutex::new(initial)),
        }
    }

    /// Add `amount` and return the new value
    pub fn increment(&self, amount: i64) -> i64 {
        self.value.with_lock(|value| {
            *value += amount;
            *value
        })
    }

    /// Current value
    pub fn get(&self) -> i64 {
        *self.value.lock()
    }
}

#[derive(Debug)]
struct SemaphoreState {
    available: usize,
    holders: usize,
    peak_holders: usize,
    wakers: WakerList,
}

/// Counting semaphore admitting at most `n` concurrent holders.
///
/// Waiters are not served in FIFO order: when a permit is released the
/// blocked threads and suspended tasks race for it. The only guarantee is
/// that no more than `n` permits are held at any instant.
#[derive(Debug)]
pub struct Semaphore {
    state: parking_lot::Mutex<SemaphoreState>,
    released: Condvar,
    permits: usize,
}

/// A held semaphore permit, released on drop
#[derive(Debug)]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

impl Semaphore {
    /// A semaphore with `permits` permits; zero is a configuration error
    pub fn new(permits: usize) -> Result<Self> {
        if permits == 0 {
            return Err(PipelineError::config("semaphore needs at least one permit"));
        }
        Ok(Self {
            state: parking_lot::Mutex::new(SemaphoreState {
                available: permits,
                holders: 0,
                peak_holders: 0,
                wakers: WakerList::default(),
            }),
            released: Condvar::new(),
            permits,
        })
    }

    /// Block until a permit is free
    pub fn acquire(&self) -> SemaphorePermit<'_> {
        assert_blocking_allowed("Semaphore::acquire");
        let mut state = self.state.lock();
        while state.available == 0 {
            self.released.wait(&mut state);
        }
        self.take_locked(&mut state)
    }

    /// Wait at most `timeout` for a permit
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<SemaphorePermit<'_>> {
        assert_blocking_allowed("Semaphore::acquire_timeout");
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.available == 0 {
            if self.released.wait_until(&mut state, deadline).timed_out() && state.available == 0
            {
                return Err(PipelineError::TimedOut(timeout));
            }
        }
        Ok(self.take_locked(&mut state))
    }

    /// Take a permit only if one is free now
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        let mut state = self.state.lock();
        if state.available == 0 {
            return None;
        }
        Some(self.take_locked(&mut state))
    }

    /// Suspend the task until a permit is free
    pub async fn acquire_async(&self) -> SemaphorePermit<'_> {
        poll_fn(|cx| {
            let mut state = self.state.lock();
            if state.available > 0 {
                return Poll::Ready(self.take_locked(&mut state));
            }
            state.wakers.register(cx.waker());
            Poll::Pending
        })
        .await
    }

    fn take_locked(&self, state: &mut SemaphoreState) -> SemaphorePermit<'_> {
        state.available -= 1;
        state.holders += 1;
        state.peak_holders = state.peak_holders.max(state.holders);
        SemaphorePermit { semaphore: self }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.available += 1;
        state.holders -= 1;
        // Every suspended task re-checks; a dropped future must not swallow the wakeup.
        state.wakers.wake_all();
        drop(state);
        self.released.notify_one();
    }

    /// Permits not currently held
    pub fn available_permits(&self) -> usize {
        self.state.lock().available
    }

    /// Highest number of simultaneous holders observed so far
    pub fn peak_holders(&self) -> usize {
        self.state.lock().peak_holders
    }

    /// Total permits the semaphore was created with
    pub fn permits(&self) -> usize {
        self.permits
    }
}

#[derive(Debug, Default)]
struct EventState {
    set: bool,
    wakers: WakerList,
}

/// One-shot broadcast signal
#[derive(Debug, Default)]
pub struct Event {
    state: parking_lot::Mutex<EventState>,
    fired: Condvar,
}

impl Event {
    /// An unset event
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the event; later calls have no effect
    pub fn set(&self) {
        let mut state = self.state.lock();
        if state.set {
            return;
        }
        state.set = true;
        state.wakers.wake_all();
        drop(state);
        self.fired.notify_all();
    }

    /// True once `set` has been called
    pub fn is_set(&self) -> bool {
        self.state.lock().set
    }

    /// Block until the event is set
    pub fn wait(&self) {
        assert_blocking_allowed("Event::wait");
        let mut state = self.state.lock();
        while !state.set {
            self.fired.wait(&mut state);
        }
    }

    /// Wait at most `timeout` for the event
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        assert_blocking_allowed("Event::wait_timeout");
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.set {
            if self.fired.wait_until(&mut state, deadline).timed_out() && !state.set {
                return Err(PipelineError::TimedOut(timeout));
            }
        }
        Ok(())
    }

    /// Suspend the task until the event is set
    pub async fn wait_async(&self) {
        poll_fn(|cx| {
            let mut state = self.state.lock();
            if state.set {
                return Poll::Ready(());
            }
            state.wakers.register(cx.waker());
            Poll::Pending
        })
        .await
    }
}
