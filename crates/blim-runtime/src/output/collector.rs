//! Background collector draining an [`OutputPipe`] into a ring buffer.
//!
//! # Lifecycle
//!
//! ```text
//!            start()                 stop()
//! NotRunning ───────▶ Running ────────────▶ Stopping
//!     ▲                  │                      │
//!     │   pipe closed    │    worker exited     │
//!     └──────────────────┴──────────────────────┘
//! ```
//!
//! Transitions are compare-and-swap on an atomic state word, so at most one
//! worker thread is alive at any time.

use super::{OutputPipe, OutputRecord, OutputSource};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Largest accepted ring buffer size.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Default time [`OutputCollector::start`] waits for the worker.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(1);

/// Default time [`OutputCollector::stop`] waits before reporting a timeout.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Collector errors.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The pipe was closed before the collector was created.
    #[error("output pipe is closed")]
    ClosedPipe,

    /// Buffer size outside `1..=MAX_BUFFER_SIZE`.
    #[error("buffer size {size} out of range (1..={MAX_BUFFER_SIZE})")]
    InvalidBufferSize { size: usize },

    #[error("collector is already running")]
    AlreadyRunning,

    #[error("collector is stopping, wait for it to finish")]
    Stopping,

    #[error("collector failed to start within {0:?} timeout")]
    StartTimeout(Duration),

    #[error("stop completed but exceeded {0:?} timeout")]
    StopTimeout(Duration),

    #[error("failed to spawn collector worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// The worker hit an unexpected fault while buffering a record.
    #[error("collector worker fault: {0}")]
    WorkerFault(String),
}

impl CollectorError {
    /// Returns `true` if the same call may succeed later without changes.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AlreadyRunning | Self::Stopping | Self::StartTimeout(_) | Self::StopTimeout(_)
        )
    }
}

/// Collector lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectorState {
    NotRunning = 0,
    Running = 1,
    Stopping = 2,
}

impl CollectorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::NotRunning,
        }
    }
}

/// Snapshot of collector counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorMetrics {
    pub records_processed: u64,
    pub errors_occurred: u64,
    pub records_overwritten: u64,
}

/// Handler invoked for internal collector errors.
pub type ErrorHandler = Arc<dyn Fn(&CollectorError) + Send + Sync>;

struct Shared {
    state: AtomicU8,
    processed: AtomicU64,
    errors: AtomicU64,
    overwritten: AtomicU64,
    buffer: ArrayQueue<OutputRecord>,
    on_error: ErrorHandler,
}

impl Shared {
    fn state(&self) -> CollectorState {
        CollectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: CollectorState, to: CollectorState) -> Result<(), CollectorState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(CollectorState::from_u8)
    }

    fn enqueue(&self, record: OutputRecord) {
        // Overlapping writers are not attributable individually; the count is aggregate.
        if self.buffer.force_push(record).is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self, err: CollectorError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        (self.on_error)(&err);
    }
}

struct Worker {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn join(self) {
        drop(self.stop_tx);
        if self.handle.join().is_err() {
            warn!("collector worker panicked during shutdown");
        }
    }
}

/// Drains an [`OutputPipe`] into an internal ring buffer on a worker thread.
///
/// # Example
///
/// ```
/// use blim_runtime::output::{OutputCollector, OutputPipe, OutputRecord};
/// use std::sync::Arc;
///
/// let pipe = Arc::new(OutputPipe::new(16));
/// let collector = OutputCollector::new(Arc::clone(&pipe), 64).expect("collector");
/// collector.start().expect("start");
///
/// pipe.send(OutputRecord::stdout("hello\n"));
/// std::thread::sleep(std::time::Duration::from_millis(20));
///
/// collector.stop().expect("stop");
/// assert_eq!(collector.consume_plain_text(), "hello\n");
/// ```
pub struct OutputCollector {
    pipe: Arc<OutputPipe>,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
    start_timeout: Duration,
    stop_timeout: Duration,
}

impl OutputCollector {
    /// Creates a collector with the default error handler (logs via `tracing`).
    ///
    /// # Errors
    ///
    /// [`CollectorError::InvalidBufferSize`] if `buffer_size` is zero or above
    /// [`MAX_BUFFER_SIZE`]; [`CollectorError::ClosedPipe`] if the pipe is closed.
    pub fn new(pipe: Arc<OutputPipe>, buffer_size: usize) -> Result<Self, CollectorError> {
        Self::with_error_handler(
            pipe,
            buffer_size,
            Arc::new(|err: &CollectorError| error!(error = %err, "output collector error")),
        )
    }

    /// Creates a collector reporting internal errors to `on_error`.
    pub fn with_error_handler(
        pipe: Arc<OutputPipe>,
        buffer_size: usize,
        on_error: ErrorHandler,
    ) -> Result<Self, CollectorError> {
        if buffer_size == 0 || buffer_size > MAX_BUFFER_SIZE {
            return Err(CollectorError::InvalidBufferSize { size: buffer_size });
        }
        if pipe.is_closed() {
            return Err(CollectorError::ClosedPipe);
        }

        Ok(Self {
            pipe,
            shared: Arc::new(Shared {
                state: AtomicU8::new(CollectorState::NotRunning as u8),
                processed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                overwritten: AtomicU64::new(0),
                buffer: ArrayQueue::new(buffer_size),
                on_error,
            }),
            worker: Mutex::new(None),
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        })
    }

    /// Overrides the start/stop wait windows.
    #[must_use]
    pub fn with_timeouts(mut self, start: Duration, stop: Duration) -> Self {
        self.start_timeout = start;
        self.stop_timeout = stop;
        self
    }

    /// Starts the worker thread.
    ///
    /// Blocks until the worker reports it is running.
    ///
    /// # Errors
    ///
    /// [`CollectorError::AlreadyRunning`] / [`CollectorError::Stopping`] if a
    /// worker exists, [`CollectorError::StartTimeout`] if the worker does not
    /// report in time.
    pub fn start(&self) -> Result<(), CollectorError> {
        let mut slot = self.worker.lock();
        match self
            .shared
            .transition(CollectorState::NotRunning, CollectorState::Running)
        {
            Ok(()) => {}
            Err(CollectorState::Running) => return Err(CollectorError::AlreadyRunning),
            Err(_) => return Err(CollectorError::Stopping),
        }

        // A worker that exited on pipe close is reaped before a new one starts.
        if let Some(stale) = slot.take() {
            stale.join();
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let (started_tx, started_rx) = channel::bounded::<()>(1);
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let port = self.pipe.port();

        let handle = thread::Builder::new()
            .name("blim-output-collector".into())
            .spawn(move || run_worker(&shared, &port, &stop_rx, &started_tx, done_tx))
            .map_err(|e| {
                self.shared
                    .state
                    .store(CollectorState::NotRunning as u8, Ordering::Release);
                CollectorError::Spawn(e)
            })?;

        match started_rx.recv_timeout(self.start_timeout) {
            Ok(()) => {
                debug!("output collector started");
                *slot = Some(Worker {
                    stop_tx,
                    done_rx,
                    handle,
                });
                Ok(())
            }
            Err(_) => {
                Worker {
                    stop_tx,
                    done_rx,
                    handle,
                }
                .join();
                self.shared
                    .state
                    .store(CollectorState::NotRunning as u8, Ordering::Release);
                Err(CollectorError::StartTimeout(self.start_timeout))
            }
        }
    }

    /// Stops the worker thread.
    ///
    /// A no-op when not running. If the worker does not confirm exit within
    /// the stop window, this still waits for it and then reports
    /// [`CollectorError::StopTimeout`].
    pub fn stop(&self) -> Result<(), CollectorError> {
        match self
            .shared
            .transition(CollectorState::Running, CollectorState::Stopping)
        {
            Ok(()) => {}
            Err(CollectorState::NotRunning) => {
                if let Some(stale) = self.worker.lock().take() {
                    stale.join();
                }
                return Ok(());
            }
            Err(_) => return Err(CollectorError::Stopping),
        }

        let worker = self.worker.lock().take();
        let result = match worker {
            Some(worker) => {
                let Worker {
                    stop_tx,
                    done_rx,
                    handle,
                } = worker;
                drop(stop_tx);
                let waited = match done_rx.recv_timeout(self.stop_timeout) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(timeout = ?self.stop_timeout, "collector stop exceeded timeout, still waiting");
                        Err(CollectorError::StopTimeout(self.stop_timeout))
                    }
                };
                if handle.join().is_err() {
                    warn!("collector worker panicked");
                }
                waited
            }
            None => Ok(()),
        };

        self.shared
            .state
            .store(CollectorState::NotRunning as u8, Ordering::Release);
        debug!("output collector stopped");
        result
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CollectorState {
        self.shared.state()
    }

    /// Number of buffered records.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.shared.buffer.len()
    }

    /// Folds over the buffered records.
    ///
    /// While records remain, dequeues one and calls `consumer(Some(record))`.
    /// A result other than `T::default()` stops early and is returned. Once
    /// the buffer is empty, `consumer(None)` is called exactly once and its
    /// result returned.
    pub fn consume_records<T, E, F>(&self, mut consumer: F) -> Result<T, E>
    where
        T: Default + PartialEq,
        F: FnMut(Option<&OutputRecord>) -> Result<T, E>,
    {
        let empty = T::default();
        while let Some(record) = self.shared.buffer.pop() {
            let result = consumer(Some(&record))?;
            if result != empty {
                return Ok(result);
            }
        }
        consumer(None)
    }

    /// Drains every buffered record and concatenates their content.
    pub fn consume_plain_text(&self) -> String {
        let mut consumer = PlainTextConsumer::default();
        let result: Result<String, std::convert::Infallible> =
            self.consume_records(|record| Ok(consumer.accept(record)));
        match result {
            Ok(text) => text,
            Err(never) => match never {},
        }
    }

    /// Atomic snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> CollectorMetrics {
        CollectorMetrics {
            records_processed: self.shared.processed.load(Ordering::Relaxed),
            errors_occurred: self.shared.errors.load(Ordering::Relaxed),
            records_overwritten: self.shared.overwritten.load(Ordering::Relaxed),
        }
    }

    /// Resets all counters to zero.
    pub fn reset_metrics(&self) {
        self.shared.processed.store(0, Ordering::Relaxed);
        self.shared.errors.store(0, Ordering::Relaxed);
        self.shared.overwritten.store(0, Ordering::Relaxed);
    }
}

impl Drop for OutputCollector {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "collector stop on drop failed");
        }
    }
}

/// Folding function accumulating record content.
///
/// Returns an empty string for every record (keep going) and the whole
/// accumulated text on the final `None` call.
#[derive(Debug, Default)]
pub struct PlainTextConsumer {
    text: String,
    only: Option<OutputSource>,
}

impl PlainTextConsumer {
    /// Accumulates only records from `source`.
    #[must_use]
    pub fn only(source: OutputSource) -> Self {
        Self {
            text: String::new(),
            only: Some(source),
        }
    }

    pub fn accept(&mut self, record: Option<&OutputRecord>) -> String {
        match record {
            Some(r) => {
                if self.only.map_or(true, |s| s == r.source) {
                    self.text.push_str(&r.content);
                }
                String::new()
            }
            None => std::mem::take(&mut self.text),
        }
    }
}

fn run_worker(
    shared: &Shared,
    port: &Receiver<OutputRecord>,
    stop_rx: &Receiver<()>,
    started_tx: &Sender<()>,
    done_tx: Sender<()>,
) {
    let _ = started_tx.send(());

    loop {
        crossbeam::select! {
            recv(stop_rx) -> _ => break,
            recv(port) -> msg => match msg {
                Ok(record) => {
                    let buffered = panic::catch_unwind(AssertUnwindSafe(|| shared.enqueue(record)));
                    if let Err(payload) = buffered {
                        let reason = payload
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown".into());
                        shared.report(CollectorError::WorkerFault(reason));
                    }
                }
                Err(_) => {
                    debug!("output pipe closed, collector worker exiting");
                    // Leaves Stopping untouched so stop() owns that transition.
                    let _ = shared.transition(CollectorState::Running, CollectorState::NotRunning);
                    break;
                }
            },
        }
    }

    let _ = done_tx.send(());
}
