//! Subscription dispatch.
//!
//! ```text
//!  device thread            worker thread (one per subscription)      engine
//! ┌──────────────┐  notify  ┌──────────────────────────────────────┐  lock  ┌──────────┐
//! │ Connection   │────────▶ │ RingPipe ─▶ Accumulator ─▶ StreamRecord│──────▶│ callback │
//! │              │          │ (drop oldest)   (mode + max_rate)     │        │ (Lua)    │
//! └──────────────┘          └──────────────────────────────────────┘        └──────────┘
//! ```
//!
//! The device thread only pushes into a bounded queue. The worker waits on
//! the queue and the accumulator's next deadline without holding the engine
//! lock, and takes the lock only to run the callback. A failing callback is
//! logged, written to stderr output, and the subscription keeps going.
//!
//! Cancelling a subscription closes its queue. The worker then releases the
//! device registration and the callback reference and exits. A worker whose
//! callback belongs to a runtime that has since been reset stops on its own.
//!
//! `max_rate` spacing is measured from the moment a callback acquires the
//! engine, not from when its record was taken off the queue.

mod accumulator;
mod config;
mod record;

pub use accumulator::Accumulator;
pub use config::{DispatchError, StreamMode, SubscriptionConfig};
pub use record::{StreamFlags, StreamRecord};

use crate::barrier;
use crate::callback::{CallbackRef, CallbackTable};
use crate::engine::EngineHandle;
use blim_device::{Connection, Notification, NotificationSink, RegistrationId};
use blim_runtime::config::DispatchConfig;
use blim_runtime::output::{OutputRecord, RingPipe};
use crossbeam::channel::{self, Receiver};
use mlua::{Function, Lua};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Identifies a subscription within its dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Counters of one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Callback invocations that returned normally.
    pub delivered: u64,
    /// Callback invocations that raised or faulted.
    pub failed: u64,
    /// Notifications discarded because the queue was full.
    pub dropped: u64,
}

struct QueueSink {
    queue: RingPipe<Notification>,
    overflowed: AtomicBool,
}

impl NotificationSink for QueueSink {
    fn notify(&self, notification: Notification) {
        if self.queue.force_send(notification) {
            self.overflowed.store(true, Ordering::Release);
            trace!("subscription queue full, oldest notification dropped");
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    callback: CallbackRef,
    active: AtomicBool,
    sink: Arc<QueueSink>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Subscription {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn stop(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        self.sink.queue.close();
        was_active
    }

    fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.sink.queue.metrics().overwritten,
        }
    }
}

#[derive(Default)]
struct Registry {
    live: HashMap<SubscriptionId, Arc<Subscription>>,
    /// Highest runtime generation torn down so far.
    retired: u64,
}

/// Turns device notifications into script callback invocations.
pub struct SubscriptionDispatcher {
    engine: EngineHandle,
    queue_capacity: usize,
    next_id: AtomicU64,
    registry: Arc<Mutex<Registry>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    orphans: Mutex<Vec<CallbackRef>>,
}

impl SubscriptionDispatcher {
    pub fn new(engine: EngineHandle, config: &DispatchConfig) -> Self {
        Self {
            engine,
            queue_capacity: config.queue_capacity.max(1),
            next_id: AtomicU64::new(1),
            registry: Arc::new(Mutex::new(Registry::default())),
            workers: Mutex::new(Vec::new()),
            orphans: Mutex::new(Vec::new()),
        }
    }

    /// Registers `config` with the device and starts its worker.
    ///
    /// Must not be called with the engine lock held if the device may block.
    ///
    /// # Errors
    ///
    /// Validation failures, device registration failures, a callback whose
    /// runtime was retired while the device registered, or a worker that
    /// could not be spawned. Nothing stays registered on error.
    #[tracing::instrument(skip_all, fields(mode = %config.mode, max_rate_ms = config.max_rate.as_millis() as u64))]
    pub fn subscribe(
        &self,
        connection: Arc<dyn Connection>,
        config: SubscriptionConfig,
    ) -> Result<SubscriptionId, DispatchError> {
        let callback = config.validate()?;
        let sink = Arc::new(QueueSink {
            queue: RingPipe::new(self.queue_capacity),
            overflowed: AtomicBool::new(false),
        });
        let registration = connection.subscribe(
            &config.selectors,
            Arc::clone(&sink) as Arc<dyn NotificationSink>,
        )?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Arc::new(Subscription {
            id,
            callback,
            active: AtomicBool::new(true),
            sink,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let accumulator = Accumulator::new(
            config.mode,
            config.max_rate,
            config.characteristics(),
            self.queue_capacity,
        );

        let worker = Worker {
            subscription: Arc::clone(&subscription),
            engine: self.engine.clone(),
            registry: Arc::clone(&self.registry),
            connection: Arc::clone(&connection),
            registration,
            accumulator,
        };

        // Checked and inserted under one lock so a concurrent retire either
        // sees this subscription or is seen by it.
        let mut registry = self.registry.lock();
        if callback.generation() <= registry.retired {
            drop(registry);
            connection.unsubscribe(registration);
            warn!(callback = %callback, "runtime reset during subscribe, registration undone");
            return Err(DispatchError::Retired);
        }
        let handle = match thread::Builder::new()
            .name(format!("blim-{id}"))
            .spawn(move || worker.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                drop(registry);
                connection.unsubscribe(registration);
                return Err(DispatchError::Spawn(e));
            }
        };
        registry.live.insert(id, subscription);
        drop(registry);

        let mut workers = self.workers.lock();
        workers.retain(|w| !w.is_finished());
        workers.push(handle);
        info!(subscription = %id, registration = %registration, "subscription started");
        Ok(id)
    }

    /// Stops delivery for `id`. Returns `false` if it is unknown or already
    /// cancelled.
    ///
    /// Never blocks on the engine; the worker releases the device
    /// registration and callback reference on its way out.
    pub fn cancel(&self, id: SubscriptionId) -> bool {
        let Some(subscription) = self.registry.lock().live.remove(&id) else {
            return false;
        };
        let stopped = subscription.stop();
        debug!(subscription = %id, "subscription cancelled");
        stopped
    }

    /// Cancels every subscription. Returns how many were active.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.registry.lock().live.drain().map(|(_, s)| s).collect();
        stop_all(&drained)
    }

    /// Cancels every subscription and refuses, from now on, callbacks minted
    /// by runtime `generation` or earlier. Returns how many were active.
    pub fn retire(&self, generation: u64) -> usize {
        let drained: Vec<_> = {
            let mut registry = self.registry.lock();
            registry.retired = registry.retired.max(generation);
            registry.live.drain().map(|(_, s)| s).collect()
        };
        debug!(generation, "runtime generation retired");
        stop_all(&drained)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.registry.lock().live.len()
    }

    /// Counters of a live subscription.
    #[must_use]
    pub fn stats(&self, id: SubscriptionId) -> Option<SubscriptionStats> {
        self.registry.lock().live.get(&id).map(|s| s.stats())
    }

    /// Waits for every finished or cancelled worker to exit.
    ///
    /// Must not be called with the engine lock held.
    pub fn join(&self) {
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                warn!("subscription worker panicked");
            }
        }
    }

    /// Parks a callback whose subscription never started, for release under
    /// the engine lock by [`reap_orphans`](Self::reap_orphans).
    pub(crate) fn orphan(&self, callback: CallbackRef) {
        self.orphans.lock().push(callback);
    }

    /// Releases parked callbacks belonging to the runtime `lua`.
    pub(crate) fn reap_orphans(&self, lua: &Lua) {
        let orphans: Vec<_> = self.orphans.lock().drain(..).collect();
        for callback in orphans {
            CallbackTable::release(lua, callback);
        }
    }
}

fn stop_all(subscriptions: &[Arc<Subscription>]) -> usize {
    let count = subscriptions.iter().filter(|s| s.stop()).count();
    if count > 0 {
        info!(count, "all subscriptions cancelled");
    }
    count
}

impl Drop for SubscriptionDispatcher {
    fn drop(&mut self) {
        // Not joined: a worker may be waiting on the engine lock.
        self.cancel_all();
    }
}

impl fmt::Debug for SubscriptionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionDispatcher")
            .field("active", &self.active_count())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

struct Worker {
    subscription: Arc<Subscription>,
    engine: EngineHandle,
    registry: Arc<Mutex<Registry>>,
    connection: Arc<dyn Connection>,
    registration: RegistrationId,
    accumulator: Accumulator,
}

impl Worker {
    fn run(mut self) {
        let id = self.subscription.id;
        let port = self.subscription.sink.queue.port();
        debug!(subscription = %id, "worker started");

        'run: while self.subscription.is_active() {
            if !self.wait(&port) {
                break;
            }
            if self.subscription.sink.overflowed.swap(false, Ordering::AcqRel) {
                self.accumulator.mark_dropped();
            }
            while let Some(record) = self.accumulator.poll(Instant::now()) {
                if !self.deliver(&record) {
                    break 'run;
                }
            }
        }

        self.subscription.stop();
        {
            let mut registry = self.registry.lock();
            if registry
                .live
                .get(&id)
                .is_some_and(|s| Arc::ptr_eq(s, &self.subscription))
            {
                registry.live.remove(&id);
            }
        }
        self.connection.unsubscribe(self.registration);
        self.release_callback();
        debug!(
            subscription = %id,
            delivered = self.accumulator.delivered(),
            "worker stopped"
        );
    }

    /// Blocks until a notification arrives or a record is due. Returns
    /// `false` once the queue is closed.
    fn wait(&mut self, port: &Receiver<Notification>) -> bool {
        let timer = match self.accumulator.next_due() {
            Some(due) => channel::at(due),
            None => channel::never(),
        };
        crossbeam::select! {
            recv(port) -> msg => match msg {
                Ok(notification) => {
                    let now = Instant::now();
                    self.accumulator.offer(notification, now);
                    while let Ok(more) = port.try_recv() {
                        self.accumulator.offer(more, now);
                    }
                    true
                }
                Err(_) => false,
            },
            recv(timer) -> _ => true,
        }
    }

    /// Runs the callback for one record. Returns `false` if the subscription
    /// or its runtime is gone, which ends the worker.
    #[tracing::instrument(skip_all, fields(subscription = %self.subscription.id, seq = record.seq))]
    fn deliver(&mut self, record: &StreamRecord) -> bool {
        let Some(engine) = self.engine.upgrade() else {
            return false;
        };
        let subscription = &self.subscription;
        let outcome = engine.run_exclusive(|rt| {
            if !subscription.is_active() || rt.generation() != subscription.callback.generation() {
                return Ok(None);
            }
            let Some(func) = CallbackTable::function(rt.lua(), subscription.callback) else {
                return Ok(None);
            };
            let started = Instant::now();
            let result = invoke(rt.lua(), &func, record);
            if result.is_err() {
                barrier::recover_stack(rt.lua());
            }
            Ok(Some((started, result)))
        });

        let result = match outcome {
            Ok(Some((started, result))) => {
                self.accumulator.mark_dispatched(started);
                result
            }
            Ok(None) => {
                debug!("callback no longer valid, worker stopping");
                return false;
            }
            Err(err) => {
                debug!(error = %err, "engine unavailable for delivery");
                return false;
            }
        };
        match result {
            Ok(()) => {
                self.subscription.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.subscription.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "subscription callback failed");
                engine.emit(OutputRecord::stderr(format!("Callback error: {err}\n")));
            }
        }
        true
    }

    fn release_callback(&self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let callback = self.subscription.callback;
        let _ = engine.run_exclusive(|rt| {
            if rt.generation() == callback.generation() {
                CallbackTable::release(rt.lua(), callback);
            }
            Ok(())
        });
    }
}

fn invoke(
    lua: &Lua,
    func: &Function,
    record: &StreamRecord,
) -> Result<(), crate::error::ScriptError> {
    barrier::contain("callback", || {
        let table = record.to_lua(lua)?;
        func.call::<()>(table)
    })
}
