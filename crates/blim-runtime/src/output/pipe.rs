//! Bounded overwrite-oldest channel.

use super::OutputRecord;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Pipe carrying captured script output.
pub type OutputPipe = RingPipe<OutputRecord>;

/// Snapshot of pipe counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeMetrics {
    /// Values accepted by the pipe.
    pub written: u64,
    /// Values evicted to make room for newer ones.
    pub overwritten: u64,
    /// Values taken out through [`RingPipe::recv`] / [`RingPipe::try_recv`].
    pub processed: u64,
}

/// Bounded multi-producer channel that never blocks producers.
///
/// When the buffer is full, [`send`](Self::send) evicts the oldest buffered
/// value before inserting. Consumers either call [`recv`](Self::recv) /
/// [`try_recv`](Self::try_recv), which count as processed, or read the raw
/// [`port`](Self::port) directly, which bypasses the processed counter.
pub struct RingPipe<T> {
    tx: RwLock<Option<Sender<T>>>,
    rx: Receiver<T>,
    capacity: usize,
    written: AtomicU64,
    overwritten: AtomicU64,
    processed: AtomicU64,
}

impl<T> RingPipe<T> {
    /// Creates a pipe holding at most `capacity` values.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingPipe capacity must be positive");
        let (tx, rx) = channel::bounded(capacity);
        Self {
            tx: RwLock::new(Some(tx)),
            rx,
            capacity,
            written: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        }
    }

    /// Inserts `value`, evicting the oldest buffered value if full.
    ///
    /// Values sent after [`close`](Self::close) are discarded.
    pub fn send(&self, value: T) {
        self.force_send(value);
    }

    /// Like [`send`](Self::send), returning `true` if an older value was evicted.
    pub fn force_send(&self, value: T) -> bool {
        let guard = self.tx.read();
        let Some(tx) = guard.as_ref() else {
            trace!("send on closed pipe, value discarded");
            return false;
        };

        let mut value = value;
        let mut evicted = false;
        loop {
            match tx.try_send(value) {
                Ok(()) => {
                    self.written.fetch_add(1, Ordering::Relaxed);
                    return evicted;
                }
                Err(TrySendError::Full(v)) => {
                    value = v;
                    // A concurrent consumer may have freed the slot already.
                    if self.rx.try_recv().is_ok() {
                        self.overwritten.fetch_add(1, Ordering::Relaxed);
                        evicted = true;
                    }
                }
                Err(TrySendError::Disconnected(_)) => return evicted,
            }
        }
    }

    /// Inserts `value` only if there is room. Returns `false` when full or closed.
    pub fn try_send(&self, value: T) -> bool {
        let guard = self.tx.read();
        match guard.as_ref().map(|tx| tx.try_send(value)) {
            Some(Ok(())) => {
                self.written.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Blocks until a value is available.
    ///
    /// Returns `None` once the pipe is closed and drained.
    pub fn recv(&self) -> Option<T> {
        let value = self.rx.recv().ok()?;
        self.processed.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Blocks for at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let value = self.rx.recv_timeout(timeout)?;
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    /// Takes a value if one is buffered.
    pub fn try_recv(&self) -> Option<T> {
        let value = self.rx.try_recv().ok()?;
        self.processed.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Raw output port. Reads through it are not counted as processed.
    #[must_use]
    pub fn port(&self) -> Receiver<T> {
        self.rx.clone()
    }

    /// Closes the pipe. Buffered values stay readable; receivers see the end
    /// of the stream once they are drained.
    pub fn close(&self) {
        if self.tx.write().take().is_some() {
            trace!("pipe closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }

    /// Number of buffered values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Atomic snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> PipeMetrics {
        PipeMetrics {
            written: self.written.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }
}

impl<T> std::fmt::Debug for RingPipe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingPipe")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .field("metrics", &self.metrics())
            .finish()
    }
}
