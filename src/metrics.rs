use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of per-item processing times
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: Arc<Mutex<VecDeque<u64>>>,
    window_size: usize,
}

impl LatencyWindow {
    /// Keep the most recent `window_size` samples
    pub fn new(window_size: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    /// Record a processing time in nanoseconds
    pub fn record(&self, nanos: u64) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.window_size {
            samples.pop_front();
        }
        samples.push_back(nanos);
    }

    /// Percentile `p` (0.0-1.0) of the window, in microseconds
    pub fn percentile_us(&self, p: f64) -> f64 {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx.min(sorted.len() - 1)] as f64 / 1000.0
    }

    /// Number of samples currently held
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// True before the first sample
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counters shared by every worker of one stage
#[derive(Debug, Clone)]
pub struct StageMetrics {
    processed: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
    end_markers: Arc<AtomicU64>,
    latency: LatencyWindow,
    start_time: Instant,
}

impl StageMetrics {
    /// Zeroed counters; the throughput clock starts now
    pub fn new() -> Self {
        Self {
            processed: Arc::new(AtomicU64::new(0)),
            skipped: Arc::new(AtomicU64::new(0)),
            end_markers: Arc::new(AtomicU64::new(0)),
            latency: LatencyWindow::new(1000),
            start_time: Instant::now(),
        }
    }

    /// Record an item a source emitted, a stage transformed or a sink consumed
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an item dropped under the skip policy
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one worker observing end of stream on its input
    pub fn record_end_marker(&self) {
        self.end_markers.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long one item took to transform
    pub fn record_latency(&self, elapsed: Duration) {
        self.latency.record(elapsed.as_nanos() as u64);
    }

    /// Items emitted, transformed or consumed so far
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Items dropped under the skip policy
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// End markers seen, one per finished worker
    pub fn end_markers(&self) -> u64 {
        self.end_markers.load(Ordering::Relaxed)
    }

    /// Items per second since the stage was built
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.processed() as f64 / elapsed
        }
    }

    /// Copy the counters and latency percentiles
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed(),
            skipped: self.skipped(),
            end_markers: self.end_markers(),
            throughput: self.throughput(),
            latency_p50_us: self.latency.percentile_us(0.50),
            latency_p99_us: self.latency.percentile_us(0.99),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a stage's metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub skipped: u64,
    pub end_markers: u64,
    pub throughput: f64,
    pub latency_p50_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}
