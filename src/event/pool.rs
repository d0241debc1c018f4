//! Per-core event loop pools.

use std::sync::Arc;
use std::thread;

use log::trace;

use super::evloop::{Event, EventLoop, RunResult, Statistic};
use super::{EventFlags, Status};

pub(crate) struct PoolInner {
    pub(crate) loops: Vec<EventLoop>,
}

/// N event loops, one dispatcher thread per CPU core. New objects are
/// routed to the least-loaded loop.
#[derive(Clone)]
pub struct EventPool {
    pub(crate) inner: Arc<PoolInner>,
}

impl std::fmt::Debug for EventPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPool")
            .field("loops", &self.inner.loops.len())
            .finish()
    }
}

impl EventPool {
    /// `min(cores, max_threads)` loops; one core degenerates to a plain
    /// loop. `max_threads` of 0 means "no limit".
    pub(crate) fn create(max_threads: usize) -> std::io::Result<Event> {
        let max_threads = if max_threads == 0 { usize::MAX } else { max_threads };
        let num_threads = num_cpus::get().clamp(1, max_threads);

        if num_threads == 1 {
            return EventLoop::create(EventFlags::NONE).map(Event::Loop);
        }

        let mut loops = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            loops.push(EventLoop::create(EventFlags::NONE)?);
        }

        let inner = Arc::new(PoolInner { loops });
        for l in &inner.loops {
            l.set_parent(&inner);
        }
        Ok(Event::Pool(EventPool { inner }))
    }

    /// The least-loaded child loop: a loop with no objects wins outright;
    /// otherwise lowest processing time, ties broken by lowest object
    /// count, then lowest index.
    pub fn distribute(&self) -> EventLoop {
        let mut best: Option<(&EventLoop, u64, usize)> = None;

        for l in &self.inner.loops {
            let count = l.num_objects();
            if count == 0 {
                return l.clone();
            }
            let time = l.statistic(Statistic::ProcessTimeMs);

            let better = match best {
                None => true,
                Some((_, best_time, best_count)) => {
                    time < best_time || (time == best_time && count < best_count)
                }
            };
            if better {
                best = Some((l, time, count));
            }
        }

        match best {
            Some((l, _, _)) => l.clone(),
            // Unreachable with a non-empty pool; fall back defensively.
            None => self.inner.loops[0].clone(),
        }
    }

    /// Run every child loop, one thread per loop pinned to its core index.
    /// The calling thread drives loop 0.
    pub fn run(&self, timeout_ms: u64) -> RunResult {
        let mut handles = Vec::new();
        for (i, l) in self.inner.loops.iter().enumerate().skip(1) {
            let l = l.clone();
            let handle = thread::Builder::new()
                .name(format!("evio-pool-{}", i))
                .spawn(move || {
                    pin_to_core(i);
                    l.run(timeout_ms)
                });
            match handle {
                Ok(h) => handles.push(h),
                Err(err) => trace!("failed to spawn pool thread {}: {}", i, err),
            }
        }

        pin_to_core(0);
        let rv = self.inner.loops[0].run(timeout_ms);
        unpin();

        for h in handles {
            let _ = h.join();
        }

        // All child results should match; the first loop's stands in for
        // the pool.
        rv
    }

    pub fn done(&self) {
        for l in &self.inner.loops {
            l.status_change_direct(Status::Done);
        }
    }

    pub fn return_(&self) {
        for l in &self.inner.loops {
            l.status_change_direct(Status::Return);
        }
    }

    pub fn done_with_disconnect(&self, grace_ms: u64, disconnect_timeout_ms: u64) {
        for l in &self.inner.loops {
            l.done_with_disconnect_int(grace_ms, disconnect_timeout_ms);
        }
    }

    /// Status of the pool; every child transitions together so the first
    /// child stands in for all.
    pub fn status(&self) -> Status {
        self.inner.loops[0].status()
    }

    pub fn num_objects(&self) -> usize {
        self.inner.loops.iter().map(|l| l.num_objects()).sum()
    }

    pub fn statistic(&self, which: Statistic) -> u64 {
        self.inner.loops.iter().map(|l| l.statistic(which)).sum()
    }
}

#[cfg(any(target_os = "android", target_os = "linux"))]
fn pin_to_core(core: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core % num_cpus::get(), &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(any(target_os = "android", target_os = "linux"))]
fn unpin() {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        for core in 0..num_cpus::get() {
            libc::CPU_SET(core, &mut set);
        }
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
fn pin_to_core(_core: usize) {}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
fn unpin() {}
