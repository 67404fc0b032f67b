//! Process-internal bus for structured build-log entries.
//!
//! Producers (the worker event pump, the agent's own build logger) push
//! entries without blocking; a single consumer (the log shipper) drains
//! them in batches. The queue is bounded: under pressure the oldest,
//! least-important `Msg` entry is shed and counted, while activity records
//! are always retained so the remote activity forest stays consistent.
//!
//! The bus is a handle, cloned and injected wherever logging is needed.
//! There is no process-global state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::Notify;
use tracing::trace;

use cadenza_protocol::log::{ActivityId, Level, LogEntry, LogField};

/// Capability set for emitting structured build-log entries.
///
/// Mirrors the four operations of the Nix logger interface. Implementations
/// stamp timestamps; callers only supply content.
pub trait BuildLogger: Send + Sync {
    fn log_msg(&self, level: Level, text: String);

    #[allow(clippy::too_many_arguments)]
    fn start_activity(
        &self,
        act: ActivityId,
        level: Level,
        kind: u64,
        text: String,
        fields: Vec<LogField>,
        parent: ActivityId,
    );

    fn stop_activity(&self, act: ActivityId);

    fn result(&self, act: ActivityId, kind: u64, fields: Vec<LogField>);
}

struct BusState {
    queue: VecDeque<LogEntry>,
    dropped: u64,
    closed: bool,
}

struct BusInner {
    state: Mutex<BusState>,
    notify: Notify,
    capacity: usize,
}

/// Bounded FIFO of [`LogEntry`]: many producers, one consumer.
#[derive(Clone)]
pub struct LoggerBus {
    inner: Arc<BusInner>,
}

impl LoggerBus {
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Bus capacity must be positive");
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState {
                    queue: VecDeque::with_capacity(capacity),
                    dropped: 0,
                    closed: false,
                }),
                notify: Notify::new(),
                capacity,
            }),
        }
    }

    /// Enqueue an entry without blocking.
    ///
    /// At capacity, the oldest `Msg` with the least-important level is shed
    /// to make room; activity records are never shed, so the queue may
    /// transiently exceed its bound when a burst consists only of them.
    /// Entries pushed after `close()` are discarded.
    pub fn push(&self, entry: LogEntry) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }

        if state.queue.len() >= self.inner.capacity
            && let Some(index) = shed_index(&state.queue)
        {
            state.queue.remove(index);
            state.dropped += 1;
            trace!(dropped = state.dropped, "Log bus full, shedding message");
        }

        state.queue.push_back(entry);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Drain up to `max` entries, FIFO. Waits until at least one entry is
    /// available or the bus is closed; returns an empty vec only when the
    /// bus is closed and fully drained.
    pub async fn pop_many(&self, max: usize) -> Vec<LogEntry> {
        loop {
            {
                let mut state = self.inner.state.lock().unwrap();
                if !state.queue.is_empty() {
                    let take = max.min(state.queue.len());
                    return state.queue.drain(..take).collect();
                }
                if state.closed {
                    return Vec::new();
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Close the bus. Idempotent; wakes every waiter. Entries already
    /// queued remain available to `pop_many`.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    /// Number of entries shed under pressure since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.state.lock().unwrap().dropped
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Index of the oldest discardable entry with the least-important level,
/// or `None` if the queue holds only activity records.
fn shed_index(queue: &VecDeque<LogEntry>) -> Option<usize> {
    let worst = queue
        .iter()
        .filter(|e| e.is_discardable())
        .filter_map(|e| e.level())
        .max()?;
    queue
        .iter()
        .position(|e| e.is_discardable() && e.level() == Some(worst))
}

/// [`BuildLogger`] that stamps entries with a monotonic millisecond clock
/// and pushes them onto a [`LoggerBus`].
pub struct BusLogger {
    bus: LoggerBus,
    t_zero: Instant,
}

impl BusLogger {
    pub fn new(bus: LoggerBus) -> Self {
        Self {
            bus,
            t_zero: Instant::now(),
        }
    }

    fn ms(&self) -> u64 {
        self.t_zero.elapsed().as_millis() as u64
    }
}

impl BuildLogger for BusLogger {
    fn log_msg(&self, level: Level, text: String) {
        let ms = self.ms();
        self.bus.push(LogEntry::Msg { level, ms, text });
    }

    fn start_activity(
        &self,
        act: ActivityId,
        level: Level,
        kind: u64,
        text: String,
        fields: Vec<LogField>,
        parent: ActivityId,
    ) {
        let ms = self.ms();
        self.bus.push(LogEntry::StartActivity {
            act,
            level,
            ms,
            kind,
            text,
            fields,
            parent,
        });
    }

    fn stop_activity(&self, act: ActivityId) {
        let ms = self.ms();
        self.bus.push(LogEntry::StopActivity { act, ms });
    }

    fn result(&self, act: ActivityId, kind: u64, fields: Vec<LogField>) {
        let ms = self.ms();
        self.bus.push(LogEntry::Result {
            act,
            ms,
            kind,
            fields,
        });
    }
}
