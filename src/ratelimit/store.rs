//! Fixed-window counting store.
//!
//! Records live in a sharded [`DashMap`], so an increment only locks the
//! shard that owns its key and a sweep walks the map one shard at a time.
//! Expiry is measured on the monotonic clock; the wall-clock reset time a
//! caller sees is fixed once, when the window opens.

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Default interval between background sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Lower bound on the sweep interval; a zero-period ticker would spin.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// The counting state for one identity key within one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountingRecord {
    /// The identity key this record counts for
    pub key: String,
    /// Requests charged against the current window
    pub count: u64,
    /// When the current window began
    pub window_start: Instant,
    /// When the current window ends
    pub window_end: Instant,
    /// Wall-clock time at which the window resets
    pub reset_at: DateTime<Utc>,
}

impl CountingRecord {
    fn open(key: &str, now: Instant, window: Duration) -> Self {
        let reset_at = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            key: key.to_string(),
            count: 1,
            window_start: now,
            window_end: now + window,
            reset_at,
        }
    }

    /// Whether the window has passed at `now`.
    ///
    /// A record is still live at exactly `window_end`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.window_end
    }
}

/// Point-in-time snapshot of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Live records at snapshot time
    pub total_keys: usize,
    /// Sum of the live records' counts
    pub total_requests: u64,
}

impl AddAssign for StoreStats {
    fn add_assign(&mut self, other: Self) {
        self.total_keys += other.total_keys;
        self.total_requests += other.total_requests;
    }
}

/// Concurrent mapping from identity key to its counting record.
#[derive(Debug, Default)]
pub struct WindowStore {
    records: DashMap<String, CountingRecord>,
}

impl WindowStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge one request to `key`, opening a fresh window when there is
    /// no live one.
    ///
    /// The shard lock is held across the read-modify-write, so concurrent
    /// increments of the same key are never lost.
    pub fn increment(&self, key: &str, window: Duration) -> CountingRecord {
        let now = Instant::now();

        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired_at(now) {
                    trace!(key = %key, "Window rolled over");
                    entry.insert(CountingRecord::open(key, now, window));
                } else {
                    let record = entry.get_mut();
                    record.count = record.count.saturating_add(1);
                }
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                trace!(key = %key, "Opening window");
                entry.insert(CountingRecord::open(key, now, window)).value().clone()
            }
        }
    }

    /// Look up the live record for `key`.
    pub fn get(&self, key: &str) -> Option<CountingRecord> {
        let now = Instant::now();
        self.records
            .get(key)
            .filter(|record| !record.is_expired_at(now))
            .map(|record| record.value().clone())
    }

    /// Undo one charge against the live record for `key`.
    ///
    /// Returns `false` without touching anything when the record is absent,
    /// expired, or already at zero.
    pub fn decrement(&self, key: &str) -> bool {
        self.decrement_where(key, |_| true)
    }

    /// Undo one charge, but only inside the window that opened at
    /// `window_start`. A charge from a window that has since rolled over
    /// must not be taken out of its successor.
    pub fn rollback(&self, key: &str, window_start: Instant) -> bool {
        self.decrement_where(key, |record| record.window_start == window_start)
    }

    fn decrement_where(&self, key: &str, matches: impl Fn(&CountingRecord) -> bool) -> bool {
        let now = Instant::now();
        match self.records.get_mut(key) {
            Some(mut record)
                if !record.is_expired_at(now) && record.count > 0 && matches(record.value()) =>
            {
                record.count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Drop the record for `key`, live or not.
    pub fn reset(&self, key: &str) -> bool {
        self.records.remove(key).is_some()
    }

    /// Drop every expired record, returning how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        self.records.retain(|_, record| {
            let live = !record.is_expired_at(now);
            if !live {
                evicted += 1;
            }
            live
        });
        evicted
    }

    /// Snapshot of the live records. Approximate under concurrent writes.
    pub fn stats(&self) -> StoreStats {
        let now = Instant::now();
        self.records
            .iter()
            .filter(|record| !record.is_expired_at(now))
            .fold(StoreStats::default(), |mut stats, record| {
                stats.total_keys += 1;
                stats.total_requests += record.count;
                stats
            })
    }

    /// Number of stored records, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Start a task that sweeps this store every `interval`.
    ///
    /// Must be called from within a Tokio runtime. The sweep stops when the
    /// returned handle is stopped or dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        let store = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let evicted = store.sweep();
                if evicted > 0 {
                    debug!(evicted, remaining = store.len(), "Swept expired windows");
                }
            }
        });

        SweeperHandle { task }
    }
}

/// Handle to a running background sweep.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop sweeping. A sweep in progress finishes first; the task is only
    /// cancelled while waiting for its next tick.
    pub fn stop(self) {
        self.task.abort();
    }

    /// Whether the sweep task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
