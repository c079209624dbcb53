//! Shared timer wheel.
//!
//! One facility schedules every retransmission and expiry task in the
//! stack. Entries are identified by an opaque id: `cancel` is a constant
//! time map removal, and an already-fired or canceled id is a no-op. The
//! wheel stores plain values (keys and dialog ids), never references into
//! the object graph, so a firing whose target is gone resolves to nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct TimerInner<T> {
    // (deadline, id) keeps the map ordered by due time with unique keys.
    queue: BTreeMap<(Instant, u64), u64>,
    entries: HashMap<u64, T>,
}

pub struct Timer<T> {
    inner: Mutex<TimerInner<T>>,
    next_id: AtomicU64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TimerInner {
                queue: BTreeMap::new(),
                entries: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Schedule `value` to fire after `duration`. Returns the cancellation id.
    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, deadline: Instant, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        inner.queue.insert((deadline, id), id);
        inner.entries.insert(id, value);
        id
    }

    /// Cancel by id. Safe to call with a stale id.
    pub fn cancel(&self, id: u64) {
        self.inner.lock().unwrap().entries.remove(&id);
    }

    /// Drain every entry due at `now`. Canceled entries are skipped and
    /// their queue slots reclaimed.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut inner = self.inner.lock().unwrap();
        let mut due = Vec::new();
        while let Some((&(deadline, id), _)) = inner.queue.iter().next() {
            if deadline > now {
                break;
            }
            inner.queue.remove(&(deadline, id));
            if let Some(value) = inner.entries.remove(&id) {
                due.push(value);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().entries.is_empty()
    }
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}
