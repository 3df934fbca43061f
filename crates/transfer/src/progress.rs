use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::types::{ProgressSnapshot, TransferProgress};

/// Default progress notification interval.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Finished transfers kept for late polls by default.
pub const DEFAULT_FINISHED_LIMIT: usize = 64;

/// Callback invoked with transfer progress.
pub type ProgressCallback = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

/// Registry of running transfers, polled by the command layer.
///
/// Pipelines register a [`TransferProgress`] when they start, publish
/// after every part and call [`finish`](Self::finish) at the end. Finished
/// transfers stay visible to late polls up to a limit
/// ([`DEFAULT_FINISHED_LIMIT`] unless set with
/// [`with_finished_limit`](Self::with_finished_limit)). Past it the oldest
/// finished entry is evicted. Running transfers are never evicted.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<RwLock<TrackerInner>>,
    stop: Arc<Mutex<Option<CancellationToken>>>,
}

struct TrackerInner {
    callbacks: Vec<ProgressCallback>,
    transfers: HashMap<Uuid, Arc<TransferProgress>>,
    interval: Duration,
    /// Finished transfers, oldest first.
    finished: VecDeque<Uuid>,
    finished_limit: usize,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProgressTracker {
    /// Creates a new tracker with the given notification interval.
    ///
    /// If `interval` is `None`, defaults to 500 ms.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TrackerInner {
                callbacks: Vec::new(),
                transfers: HashMap::new(),
                interval: interval.unwrap_or(DEFAULT_INTERVAL),
                finished: VecDeque::new(),
                finished_limit: DEFAULT_FINISHED_LIMIT,
            })),
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Keeps at most `limit` finished transfers.
    pub fn with_finished_limit(self, limit: usize) -> Self {
        {
            let mut inner = self.inner.write().unwrap();
            inner.finished_limit = limit;
            inner.evict_finished();
        }
        self
    }

    /// Registers a progress callback.
    pub fn on_progress(&self, callback: ProgressCallback) {
        let mut inner = self.inner.write().unwrap();
        inner.callbacks.push(callback);
    }

    /// Begins tracking a transfer.
    pub fn track(&self, transfer: Arc<TransferProgress>) {
        let id = transfer.id();
        let mut inner = self.inner.write().unwrap();
        inner.transfers.insert(id, transfer);
    }

    /// Publishes the final state of a transfer that just completed or
    /// failed, then drops the oldest finished entries over the limit.
    pub fn finish(&self, id: &Uuid) {
        self.notify_progress(id);
        let mut inner = self.inner.write().unwrap();
        if inner.transfers.contains_key(id) && !inner.finished.contains(id) {
            inner.finished.push_back(*id);
        }
        inner.evict_finished();
    }

    /// Stops tracking a transfer.
    pub fn untrack(&self, id: &Uuid) {
        let mut inner = self.inner.write().unwrap();
        inner.transfers.remove(id);
        inner.finished.retain(|f| f != id);
    }

    /// Returns a tracked transfer by ID.
    pub fn get(&self, id: &Uuid) -> Option<Arc<TransferProgress>> {
        let inner = self.inner.read().unwrap();
        inner.transfers.get(id).cloned()
    }

    /// Snapshots of every tracked transfer.
    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        let inner = self.inner.read().unwrap();
        inner.transfers.values().map(|t| t.snapshot()).collect()
    }

    /// Publishes the current state of one transfer to every callback.
    pub fn notify_progress(&self, id: &Uuid) {
        let inner = self.inner.read().unwrap();
        if let Some(transfer) = inner.transfers.get(id) {
            inner.publish(transfer.snapshot());
        }
    }

    /// Spawns a task that republishes running transfers every interval.
    ///
    /// Finished transfers are skipped. A second call replaces the first
    /// task; [`stop`](Self::stop) ends it.
    pub fn start(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.stop.lock().unwrap().replace(token.clone()) {
            previous.cancel();
        }

        let inner = Arc::clone(&self.inner);
        let period = inner.read().unwrap().interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let guard = inner.read().unwrap();
                guard
                    .transfers
                    .values()
                    .filter(|t| t.is_active())
                    .for_each(|t| guard.publish(t.snapshot()));
            }
        });
    }

    /// Ends the periodic task, if one is running.
    pub fn stop(&self) {
        if let Some(token) = self.stop.lock().unwrap().take() {
            token.cancel();
        }
    }
}

impl TrackerInner {
    fn publish(&self, snapshot: ProgressSnapshot) {
        for callback in &self.callbacks {
            callback(snapshot.clone());
        }
    }

    fn evict_finished(&mut self) {
        while self.finished.len() > self.finished_limit {
            if let Some(id) = self.finished.pop_front() {
                self.transfers.remove(&id);
            }
        }
    }
}

/// Rolling throughput estimate over the most recent parts.
///
/// Each sample is the byte count of one finished part. The rate is the
/// sum of every sample after the oldest, divided by the time between the
/// oldest and the newest. Samples older than the window are discarded,
/// as is anything beyond the sample cap.
pub struct SpeedCalculator {
    window: Duration,
    cap: usize,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl SpeedCalculator {
    /// `window` defaults to 30 s (a few parts at typical upload rates),
    /// `max_samples` to 100.
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        let cap = max_samples.unwrap_or(100).max(1);
        Self {
            window: window.unwrap_or(Duration::from_secs(30)),
            cap,
            samples: Mutex::new(VecDeque::with_capacity(cap)),
        }
    }

    pub fn add_sample(&self, bytes: u64) {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap();
        samples.push_back((now, bytes));
        while samples.len() > self.cap
            || samples
                .front()
                .is_some_and(|(at, _)| now.duration_since(*at) > self.window)
        {
            samples.pop_front();
        }
    }

    /// Bytes per second across the window; 0.0 until two samples exist.
    pub fn bytes_per_second(&self) -> f64 {
        let samples = self.samples.lock().unwrap();
        let (Some((oldest, _)), Some((newest, _))) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let span = newest.duration_since(*oldest).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        let moved: u64 = samples.iter().skip(1).map(|(_, bytes)| bytes).sum();
        moved as f64 / span
    }

    /// Time left for `remaining_bytes` at the current rate.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        match self.bytes_per_second() {
            rate if rate > 0.0 => Some(Duration::from_secs_f64(remaining_bytes as f64 / rate)),
            _ => None,
        }
    }

    pub fn reset(&self) {
        self.samples.lock().unwrap().clear();
    }
}
