//! Absolute-deadline timers on the monotonic clock.
//!
//! Timers live in the owning loop's state: a map of timer records plus a
//! min-heap of `(deadline, id)` pairs. Records are the source of truth;
//! stale heap entries (from resets and stops) are skipped lazily.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::io::Io;

use super::evloop::{EventLoop, TIMEOUT_INF};

/// Fire forever until stopped or removed.
pub const FIRECOUNT_INF: u64 = u64::MAX;

pub(crate) enum TimerCb {
    /// A user task callback.
    Task(Box<dyn FnMut(&EventLoop) + Send>),
    /// Dispatch to a layer's `timer_fired`.
    Layer { io: Weak<Io>, layer: usize },
}

pub(crate) struct TimerEntry {
    /// `None` while stopped.
    deadline: Option<Instant>,
    interval_ms: u64,
    firecount: u64,
    autoremove: bool,
    /// Taken while the callback runs so the record can be mutated from
    /// within it.
    cb: Option<TimerCb>,
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    next_id: u64,
    entries: HashMap<u64, TimerEntry>,
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
}

impl TimerQueue {
    pub fn add(&mut self, cb: TimerCb) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            TimerEntry {
                deadline: None,
                interval_ms: 0,
                firecount: FIRECOUNT_INF,
                autoremove: false,
                cb: Some(cb),
            },
        );
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn set_firecount(&mut self, id: u64, count: u64) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.firecount = count;
                true
            }
            None => false,
        }
    }

    pub fn set_autoremove(&mut self, id: u64, autoremove: bool) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.autoremove = autoremove;
                true
            }
            None => false,
        }
    }

    /// Arm (or re-arm) to fire `ms` from now, and every `ms` thereafter
    /// while the firecount lasts. Delays are capped at ten years so an
    /// "infinite" request cannot overflow the clock arithmetic.
    pub fn reset(&mut self, id: u64, ms: u64) -> bool {
        const MAX_DELAY_MS: u64 = 10 * 365 * 86_400 * 1_000;
        let deadline = Instant::now() + Duration::from_millis(ms.min(MAX_DELAY_MS));
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.deadline = Some(deadline);
                entry.interval_ms = ms;
                self.heap.push(Reverse((deadline, id)));
                true
            }
            None => false,
        }
    }

    pub fn stop(&mut self, id: u64) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.deadline = None;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Milliseconds until the next armed timer fires; `TIMEOUT_INF` when
    /// none are armed.
    pub fn minimum_ms(&mut self) -> u64 {
        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            let live = self
                .entries
                .get(&id)
                .map(|e| e.deadline == Some(deadline))
                .unwrap_or(false);
            if !live {
                self.heap.pop();
                continue;
            }
            return deadline.saturating_duration_since(now).as_millis() as u64;
        }
        TIMEOUT_INF
    }

    /// Pop the next due timer, detaching its callback for dispatch. The
    /// caller invokes the callback with the loop lock released and then
    /// calls [`TimerQueue::finish_fire`].
    pub fn take_due(&mut self, now: Instant) -> Option<(u64, TimerCb)> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            self.heap.pop();

            let entry = match self.entries.get_mut(&id) {
                Some(e) => e,
                None => continue,
            };
            if entry.deadline != Some(deadline) {
                continue;
            }

            entry.deadline = None;
            if entry.firecount != FIRECOUNT_INF && entry.firecount > 0 {
                entry.firecount -= 1;
            }
            match entry.cb.take() {
                Some(cb) => return Some((id, cb)),
                None => continue,
            }
        }
        None
    }

    /// Restore a callback after it ran and re-arm or retire the record.
    pub fn finish_fire(&mut self, id: u64, cb: TimerCb) {
        let entry = match self.entries.get_mut(&id) {
            Some(e) => e,
            None => return,
        };
        entry.cb = Some(cb);

        // The callback may have re-armed the timer itself.
        if let Some(deadline) = entry.deadline {
            self.heap.push(Reverse((deadline, id)));
            return;
        }

        if entry.firecount > 0 && entry.interval_ms > 0 {
            let deadline = Instant::now() + Duration::from_millis(entry.interval_ms);
            entry.deadline = Some(deadline);
            self.heap.push(Reverse((deadline, id)));
        } else if entry.firecount == 0 && entry.autoremove {
            self.entries.remove(&id);
        }
    }
}

/// Handle to a timer owned by an event loop.
///
/// Dropping the handle does not remove the timer; call [`Timer::remove`].
#[derive(Clone)]
pub struct Timer {
    pub(crate) ev: EventLoop,
    pub(crate) id: u64,
}

impl Timer {
    /// Arm the timer to fire `ms` from now.
    pub fn reset(&self, ms: u64) -> bool {
        self.ev.with_timers(|t| t.reset(self.id, ms))
    }

    /// Limit the number of firings; [`FIRECOUNT_INF`] means periodic.
    pub fn set_firecount(&self, count: u64) -> bool {
        self.ev.with_timers(|t| t.set_firecount(self.id, count))
    }

    /// Disarm without removing.
    pub fn stop(&self) -> bool {
        self.ev.with_timers(|t| t.stop(self.id))
    }

    /// Remove the timer entirely.
    pub fn remove(&self) -> bool {
        self.ev.with_timers(|t| t.remove(self.id))
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("id", &self.id).finish()
    }
}

pub(crate) fn layer_timer(ev: &EventLoop, io: &Arc<Io>, layer: usize) -> Timer {
    let id = ev.with_timers(|t| {
        t.add(TimerCb::Layer { io: Arc::downgrade(io), layer })
    });
    Timer { ev: ev.clone(), id }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TimerCb {
        TimerCb::Task(Box::new(|_| {}))
    }

    #[test]
    fn minimum_skips_stale_heap_entries() {
        let mut q = TimerQueue::default();
        let id = q.add(task());
        assert_eq!(q.minimum_ms(), TIMEOUT_INF);

        q.reset(id, 5_000);
        q.reset(id, 50);
        let min = q.minimum_ms();
        assert!(min <= 50, "minimum {}", min);

        q.stop(id);
        assert_eq!(q.minimum_ms(), TIMEOUT_INF);
        assert_eq!(q.len(), 1);
        q.remove(id);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn due_timer_fires_and_rearms_on_interval() {
        let mut q = TimerQueue::default();
        let id = q.add(task());
        q.reset(id, 0);

        let now = Instant::now() + Duration::from_millis(1);
        let (fired, cb) = q.take_due(now).expect("due");
        assert_eq!(fired, id);
        assert!(q.take_due(now).is_none());

        // Infinite firecount plus a zero interval: no automatic re-arm.
        q.finish_fire(id, cb);
        assert_eq!(q.minimum_ms(), TIMEOUT_INF);

        q.reset(id, 10);
        q.set_firecount(id, 1);
        let now = Instant::now() + Duration::from_millis(20);
        let (_, cb) = q.take_due(now).expect("due again");
        q.finish_fire(id, cb);
        // Firecount exhausted; the 10ms interval must not re-arm it.
        assert_eq!(q.minimum_ms(), TIMEOUT_INF);
    }

    #[test]
    fn autoremove_retires_expired_oneshots() {
        let mut q = TimerQueue::default();
        let id = q.add(task());
        q.set_firecount(id, 1);
        q.set_autoremove(id, true);
        q.reset(id, 0);

        let now = Instant::now() + Duration::from_millis(1);
        let (_, cb) = q.take_due(now).unwrap();
        q.finish_fire(id, cb);
        assert_eq!(q.len(), 0);
    }
}
