//! Per-subscription delivery policy.
//!
//! The accumulator is a pure state machine: the worker feeds it
//! notifications with [`offer`](Accumulator::offer), asks when the next
//! record is due with [`next_due`](Accumulator::next_due), and takes records
//! with [`poll`](Accumulator::poll). Time is always passed in, so the policy
//! is tested without threads or sleeps.
//!
//! ```text
//!   EveryUpdate  ──●──●──●─────────▶  leading edge, one record per window, FIFO
//!                  ▼  ·  ·
//!                  r1 r2 r3          (r2, r3 released one window apart)
//!
//!   Batched      ──●──●──●───|─────▶  trailing edge at first + max_rate
//!                            ▼
//!                            r1 {X = [1, 2, 3]}
//!
//!   Aggregated   ──●──●──●───|─────▶  trailing edge, latest value per characteristic
//!                            ▼
//!                            r1 {X = 3}
//! ```

use super::config::StreamMode;
use super::record::{StreamFlags, StreamRecord};
use blim_device::Notification;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

pub struct Accumulator {
    mode: StreamMode,
    max_rate: Duration,
    subscribed: Vec<String>,
    backlog_limit: usize,

    queue: VecDeque<(Instant, Notification)>,
    batch: BTreeMap<String, Vec<Vec<u8>>>,
    latest: BTreeMap<String, Vec<u8>>,
    dirty: bool,

    pending_since: Option<Instant>,
    pending_ts: i64,
    last_dispatch: Option<Instant>,
    last_ts: i64,
    seq: u64,
    dropped: bool,
}

impl Accumulator {
    /// `subscribed` lists the characteristics an aggregated record should
    /// carry; `backlog_limit` bounds the EveryUpdate queue.
    pub fn new(
        mode: StreamMode,
        max_rate: Duration,
        subscribed: Vec<String>,
        backlog_limit: usize,
    ) -> Self {
        Self {
            mode,
            max_rate,
            subscribed,
            backlog_limit: backlog_limit.max(1),
            queue: VecDeque::new(),
            batch: BTreeMap::new(),
            latest: BTreeMap::new(),
            dirty: false,
            pending_since: None,
            pending_ts: 0,
            last_dispatch: None,
            last_ts: 0,
            seq: 0,
            dropped: false,
        }
    }

    /// Folds one notification into the pending state.
    pub fn offer(&mut self, notification: Notification, now: Instant) {
        match self.mode {
            StreamMode::EveryUpdate => {
                if self.queue.len() >= self.backlog_limit {
                    self.queue.pop_front();
                    self.dropped = true;
                }
                self.queue.push_back((now, notification));
            }
            StreamMode::Batched => {
                self.pending_since.get_or_insert(now);
                self.pending_ts = self.pending_ts.max(notification.ts_us);
                self.batch
                    .entry(notification.characteristic)
                    .or_default()
                    .push(notification.data);
            }
            StreamMode::Aggregated => {
                self.pending_since.get_or_insert(now);
                self.pending_ts = self.pending_ts.max(notification.ts_us);
                self.latest
                    .insert(notification.characteristic, notification.data);
                self.dirty = true;
            }
        }
    }

    /// Records that notifications were lost before reaching the accumulator.
    pub fn mark_dropped(&mut self) {
        self.dropped = true;
    }

    /// When the next record becomes available, or `None` if nothing is pending.
    #[must_use]
    pub fn next_due(&self) -> Option<Instant> {
        match self.mode {
            StreamMode::EveryUpdate => {
                let (arrived, _) = self.queue.front()?;
                match self.last_dispatch {
                    Some(last) if !self.max_rate.is_zero() => {
                        Some((*arrived).max(last + self.max_rate))
                    }
                    _ => Some(*arrived),
                }
            }
            StreamMode::Batched | StreamMode::Aggregated => {
                let window_end = self.pending_since? + self.max_rate;
                match self.last_dispatch {
                    Some(last) => Some(window_end.max(last + self.max_rate)),
                    None => Some(window_end),
                }
            }
        }
    }

    /// Takes the next record if it is due at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<StreamRecord> {
        if self.next_due()? > now {
            return None;
        }
        let mut record = StreamRecord::default();
        match self.mode {
            StreamMode::EveryUpdate => {
                let (_, n) = self.queue.pop_front()?;
                record.ts_us = n.ts_us;
                record.values.insert(n.characteristic, n.data);
            }
            StreamMode::Batched => {
                record.ts_us = self.pending_ts;
                record.batch_values = std::mem::take(&mut self.batch);
                self.pending_since = None;
            }
            StreamMode::Aggregated => {
                self.pending_since = None;
                if !std::mem::take(&mut self.dirty) {
                    return None;
                }
                record.ts_us = self.pending_ts;
                record.values = self.latest.clone();
                if self.subscribed.iter().any(|c| !self.latest.contains_key(c)) {
                    record.flags |= StreamFlags::MISSING;
                }
            }
        }

        if std::mem::take(&mut self.dropped) {
            record.flags |= StreamFlags::DROPPED;
        }
        self.seq += 1;
        record.seq = self.seq;
        record.ts_us = record.ts_us.max(self.last_ts);
        self.last_ts = record.ts_us;
        self.mark_dispatched(now);
        Some(record)
    }

    /// Moves the start of the current rate window to `at`, the moment the
    /// callback for the last polled record actually began.
    pub fn mark_dispatched(&mut self, at: Instant) {
        self.last_dispatch = Some(self.last_dispatch.map_or(at, |last| last.max(at)));
    }

    /// Records delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.seq
    }
}
