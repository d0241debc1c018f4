//! The event loop driver and the user-facing `Event` handle.

use std::collections::HashMap;
use std::os::unix::io::{OwnedFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::trace;

use crate::error::IoError;
use crate::io::{self, Io};
use crate::sys::{HandleSnapshot, ReadyEvent, Selector};

use super::pool::{EventPool, PoolInner};
use super::softevent::{io_id, IoId, PendingQueue, SoftQueue};
use super::timer::{layer_timer, Timer, TimerCb, TimerQueue};
use super::{CapsMask, EventFlags, EventType, Status, WaitMask};

/// Wait forever.
pub const TIMEOUT_INF: u64 = u64::MAX;

/// Per-I/O-object user callback.
pub type IoEventCallback = Box<dyn FnMut(&EventLoop, EventType, &Arc<Io>) + Send>;

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    /// The requested wait time elapsed.
    Timeout,
    /// `done()` was requested or the loop ran out of objects.
    Done,
    /// `return_()` was requested.
    Return,
    /// The loop was already running, or is unusable.
    Misuse,
}

/// Loop counters, aggregated across a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    WakeCount,
    OseventCount,
    SofteventCount,
    TimerCount,
    ProcessTimeMs,
}

/// Handle-table mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModOp {
    AddHandle,
    AddWait,
    DelWait,
    DelHandle,
}

struct EvHandle {
    waittype: WaitMask,
    io: Weak<Io>,
}

struct RegIo {
    io: Arc<Io>,
    /// Taken while the callback runs; `edit_cb` during the callback wins
    /// over the put-back.
    callback: Option<IoEventCallback>,
}

#[derive(Default)]
struct Stats {
    wake_cnt: u64,
    osevent_cnt: u64,
    softevent_cnt: u64,
    timer_cnt: u64,
    process_time_ms: u64,
}

pub(crate) struct LoopState {
    flags: EventFlags,
    status: Status,
    status_change: Option<Status>,
    /// Current run's total timeout; `done_with_disconnect` shrinks it.
    timeout_ms: u64,
    start: Option<Instant>,
    /// Blocked in the OS wait right now.
    waiting: bool,
    evhandles: HashMap<RawFd, EvHandle>,
    reg_ios: HashMap<IoId, RegIo>,
    soft_queue: SoftQueue,
    pending: PendingQueue,
    pub(crate) timers: TimerQueue,
    /// Internal self-wake object (its read side); the write side lives
    /// here so waking never needs the object's own lock.
    parent_wake: Option<Arc<Io>>,
    wake_tx: Option<OwnedFd>,
    parent: Option<Weak<PoolInner>>,
    stats: Stats,
}

pub(crate) struct LoopInner {
    selector: Selector,
    state: Mutex<LoopState>,
}

/// One event loop. Clones share the same loop; the loop lives as long as
/// any clone (or registered object) does.
#[derive(Clone)]
pub struct EventLoop {
    pub(crate) inner: Arc<LoopInner>,
}

impl PartialEq for EventLoop {
    fn eq(&self, other: &EventLoop) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop").finish_non_exhaustive()
    }
}

impl EventLoop {
    pub(crate) fn create(flags: EventFlags) -> std::io::Result<EventLoop> {
        let selector = if flags.contains(EventFlags::NON_SCALABLE) {
            Selector::new_poll()
        } else {
            Selector::new_scalable()?
        };

        let ev = EventLoop {
            inner: Arc::new(LoopInner {
                selector,
                state: Mutex::new(LoopState {
                    flags,
                    status: Status::Paused,
                    status_change: None,
                    timeout_ms: TIMEOUT_INF,
                    start: None,
                    waiting: false,
                    evhandles: HashMap::new(),
                    reg_ios: HashMap::new(),
                    soft_queue: SoftQueue::default(),
                    pending: PendingQueue::default(),
                    timers: TimerQueue::default(),
                    parent_wake: None,
                    wake_tx: None,
                    parent: None,
                    stats: Stats::default(),
                }),
            }),
        };

        if !flags.contains(EventFlags::NOWAKE) {
            let (wake_io, wake_tx) = io::osevent::create_wake(&ev)?;
            let mut st = ev.state();
            st.parent_wake = Some(wake_io);
            st.wake_tx = Some(wake_tx);
        }

        Ok(ev)
    }

    pub(crate) fn set_parent(&self, parent: &Arc<PoolInner>) {
        self.state().parent = Some(Arc::downgrade(parent));
    }

    fn pool_parent(&self) -> Option<EventPool> {
        self.state()
            .parent
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(|inner| EventPool { inner })
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, LoopState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn with_timers<R>(&self, f: impl FnOnce(&mut TimerQueue) -> R) -> R {
        f(&mut self.state().timers)
    }

    /* - - - - - registration - - - - - */

    /// Attach an I/O object with a user callback. Fails when the object is
    /// already attached to a loop.
    pub fn add(
        &self,
        io: &Arc<Io>,
        callback: impl FnMut(&EventLoop, EventType, &Arc<Io>) + Send + 'static,
    ) -> bool {
        self.add_internal(io, Some(Box::new(callback)))
    }

    pub(crate) fn add_internal(&self, io: &Arc<Io>, callback: Option<IoEventCallback>) -> bool {
        if !io.bind_event(self) {
            return false;
        }

        {
            let mut st = self.state();
            st.reg_ios.insert(io_id(io), RegIo { io: Arc::clone(io), callback });
        }

        if !io::run_init(self, io) {
            self.remove(io);
            return false;
        }
        true
    }

    /// Detach an I/O object. Synchronous: on return, queued events for the
    /// object are cleared and no further callbacks fire for it.
    pub fn remove(&self, io: &Arc<Io>) {
        if !io.is_bound_to(self) {
            return;
        }
        io::run_unregister(self, io);
        io.unbind_event();

        let mut st = self.state();
        let id = io_id(io);
        st.reg_ios.remove(&id);
        st.soft_queue.clear_io(id, false);
        st.pending.clear_io(id);
    }

    /// Replace the user callback for an attached object.
    pub fn edit_cb(
        &self,
        io: &Arc<Io>,
        callback: impl FnMut(&EventLoop, EventType, &Arc<Io>) + Send + 'static,
    ) -> bool {
        let mut st = self.state();
        match st.reg_ios.get_mut(&io_id(io)) {
            Some(reg) => {
                reg.callback = Some(Box::new(callback));
                true
            }
            None => false,
        }
    }

    /// Number of objects owned by the loop, excluding the internal wake
    /// object, plus registered timers.
    pub fn num_objects(&self) -> usize {
        let mut st = self.state();
        let mut num = st.reg_ios.len() + st.timers.len();
        if num > 0 && st.parent_wake.is_some() {
            num -= 1;
        }
        num
    }

    pub fn statistic(&self, which: Statistic) -> u64 {
        let st = self.state();
        match which {
            Statistic::WakeCount => st.stats.wake_cnt,
            Statistic::OseventCount => st.stats.osevent_cnt,
            Statistic::SofteventCount => st.stats.softevent_cnt,
            Statistic::TimerCount => st.stats.timer_cnt,
            Statistic::ProcessTimeMs => st.stats.process_time_ms,
        }
    }

    pub fn status(&self) -> Status {
        self.state().status
    }

    /* - - - - - handle table - - - - - */

    pub(crate) fn handle_modify(
        &self,
        op: ModOp,
        io: Option<&Arc<Io>>,
        fd: RawFd,
        waittype: WaitMask,
        caps: CapsMask,
    ) -> bool {
        let mut st = self.state();
        let exists = st.evhandles.contains_key(&fd);

        match op {
            ModOp::AddHandle => {
                if exists {
                    return false;
                }
                let io = match io {
                    Some(io) => io,
                    None => return false,
                };
                // The capability mask is consumed here: it decides which
                // kernel filters the handle gets for its lifetime.
                st.evhandles.insert(fd, EvHandle { waittype, io: Arc::downgrade(io) });
                let _ = self.inner.selector.add(fd, caps);
            }
            ModOp::AddWait => {
                let handle = match st.evhandles.get_mut(&fd) {
                    Some(h) => h,
                    None => return false,
                };
                if handle.waittype.contains(waittype) {
                    return true;
                }
                handle.waittype.insert(waittype);
            }
            ModOp::DelWait => {
                let handle = match st.evhandles.get_mut(&fd) {
                    Some(h) => h,
                    None => return false,
                };
                if !handle.waittype.contains(waittype) {
                    return true;
                }
                handle.waittype.remove(waittype);
            }
            ModOp::DelHandle => {
                if st.evhandles.remove(&fd).is_none() {
                    return false;
                }
                let _ = self.inner.selector.del(fd);
            }
        }

        // epoll/kqueue mutate the kernel set directly; the poll backend only
        // sees changes on its next rebuild, so a blocked wait must be woken.
        if self.inner.selector.needs_wake_on_modify() {
            wake_locked(&st);
        }
        true
    }

    /* - - - - - soft events - - - - - */

    pub(crate) fn softevent_add(&self, io: &Arc<Io>, layer_id: usize, ty: EventType, err: IoError) {
        io.set_error(err);

        let mut st = self.state();
        if !st.reg_ios.contains_key(&io_id(io)) {
            trace!("soft event for unregistered io dropped; type={}", ty.as_str());
            return;
        }
        st.soft_queue.add(io, layer_id, ty);
        wake_locked(&st);
    }

    pub(crate) fn softevent_del(&self, io: &Arc<Io>, layer_id: usize, ty: EventType) {
        self.state().soft_queue.del(io, layer_id, ty);
    }

    pub(crate) fn pending_mark_delivered(&self, id: IoId, ty: EventType, layer_id: usize) {
        self.state().pending.mark_delivered(id, ty, layer_id);
    }

    /* - - - - - timers & tasks - - - - - */

    /// Create a stopped timer with a callback; arm it with
    /// [`Timer::reset`].
    pub fn timer_add(&self, cb: impl FnMut(&EventLoop) + Send + 'static) -> Timer {
        let id = self.with_timers(|t| t.add(TimerCb::Task(Box::new(cb))));
        Timer { ev: self.clone(), id }
    }

    /// One-shot timer firing `delay_ms` from now.
    pub fn timer_oneshot(
        &self,
        delay_ms: u64,
        autoremove: bool,
        cb: impl FnMut(&EventLoop) + Send + 'static,
    ) -> Timer {
        let timer = self.timer_add(cb);
        timer.set_firecount(1);
        self.with_timers(|t| {
            t.set_autoremove(timer.id, autoremove);
            t.reset(timer.id, delay_ms)
        });
        // A zero-delay task enqueued from another thread must interrupt the
        // dispatcher's wait.
        wake_locked(&self.state());
        timer
    }

    pub(crate) fn layer_timer(&self, io: &Arc<Io>, layer: usize) -> Timer {
        layer_timer(self, io, layer)
    }

    /// Run `cb` on the dispatcher as soon as possible.
    pub fn queue_task(&self, cb: impl FnMut(&EventLoop) + Send + 'static) -> bool {
        self.timer_oneshot(0, true, cb);
        true
    }

    /* - - - - - status - - - - - */

    fn status_change(&self, status: Status) {
        let mut st = self.state();
        st.status_change = Some(status);
        wake_locked(&st);
    }

    /// Set a child's status without relaying through the pool.
    pub(crate) fn status_change_direct(&self, status: Status) {
        self.status_change(status);
    }

    pub fn done(&self) {
        match self.pool_parent() {
            Some(pool) => pool.done(),
            None => self.status_change(Status::Done),
        }
    }

    pub fn return_(&self) {
        match self.pool_parent() {
            Some(pool) => pool.return_(),
            None => self.status_change(Status::Return),
        }
    }

    /// Wake the dispatcher if it is blocked in the OS wait.
    pub fn wake(&self) {
        wake_locked(&self.state());
    }

    /// Arrange for the loop to exit once all objects are gone: after
    /// `grace_ms`, every owned object gets a graceful disconnect, bounded
    /// by `disconnect_timeout_ms`.
    pub fn done_with_disconnect(&self, grace_ms: u64, disconnect_timeout_ms: u64) {
        if let Some(pool) = self.pool_parent() {
            pool.done_with_disconnect(grace_ms, disconnect_timeout_ms);
            return;
        }
        self.done_with_disconnect_int(grace_ms, disconnect_timeout_ms);
    }

    pub(crate) fn done_with_disconnect_int(&self, grace_ms: u64, disconnect_timeout_ms: u64) {
        {
            let mut st = self.state();
            st.flags
                .insert(EventFlags::EXIT_ON_EMPTY | EventFlags::EXIT_ON_EMPTY_NO_TIMERS);
        }

        self.timer_oneshot(grace_ms, true, move |ev| {
            let ios: Vec<Arc<Io>> = {
                let mut st = ev.state();

                // Cap the remaining run time so a stuck peer cannot hold
                // the loop open past the disconnect budget.
                if let Some(start) = st.start {
                    let elapsed = crate::time::elapsed_ms(&start);
                    if disconnect_timeout_ms == TIMEOUT_INF
                        || elapsed.saturating_add(disconnect_timeout_ms) < st.timeout_ms
                    {
                        st.timeout_ms = elapsed.saturating_add(disconnect_timeout_ms);
                    }
                }

                let wake_id = st.parent_wake.as_ref().map(io_id);
                st.reg_ios
                    .values()
                    .filter(|reg| Some(io_id(&reg.io)) != wake_id)
                    .map(|reg| Arc::clone(&reg.io))
                    .collect()
            };

            for io in ios {
                // The object may already be gone by the time we get here.
                if ev.state().reg_ios.contains_key(&io_id(&io)) {
                    io.disconnect();
                }
            }
        });
    }

    /* - - - - - the loop - - - - - */

    /// Dispatch events until done, returned, or `timeout_ms` elapses.
    pub fn run(&self, timeout_ms: u64) -> RunResult {
        {
            let mut st = self.state();
            if st.status == Status::Running {
                return RunResult::Misuse;
            }
            st.status = Status::Running;
            st.status_change = None;
            st.timeout_ms = timeout_ms;
            st.start = Some(Instant::now());
        }

        let mut retval = RunResult::Timeout;
        let mut events: Vec<ReadyEvent> = Vec::with_capacity(64);
        let mut elapsed: u64 = 0;

        loop {
            let (snapshot, wait);
            {
                let mut st = self.state();

                if st.status_change.is_some() {
                    break;
                }

                if st.flags.contains(EventFlags::EXIT_ON_EMPTY) && effective_io_count(&mut st) == 0 {
                    retval = RunResult::Done;
                    break;
                }

                let min_timer = st.timers.minimum_ms();
                let user_remaining = if st.timeout_ms == TIMEOUT_INF {
                    TIMEOUT_INF
                } else {
                    st.timeout_ms.saturating_sub(elapsed)
                };
                let mut wait_ms = user_remaining.min(min_timer);
                if !st.soft_queue.is_empty() {
                    wait_ms = 0;
                }
                wait = if wait_ms == TIMEOUT_INF {
                    None
                } else {
                    Some(Duration::from_millis(wait_ms))
                };

                snapshot = if self.inner.selector.needs_wake_on_modify() {
                    st.evhandles
                        .iter()
                        .map(|(&fd, h)| HandleSnapshot { fd, waittype: h.waittype })
                        .collect()
                } else {
                    Vec::new()
                };
                st.waiting = true;
            }

            let has_events = self
                .inner
                .selector
                .select(&snapshot, &mut events, wait)
                .unwrap_or(false);

            let process_start = Instant::now();
            {
                let mut st = self.state();
                st.waiting = false;
                st.stats.wake_cnt += 1;

                // Soft events first: a CONNECTED queued by a layer must beat
                // an OS read event queued in the same pass.
                let state = &mut *st;
                let moved = state.soft_queue.drain_into(&mut state.pending);
                state.stats.softevent_cnt += moved;

                if has_events {
                    queue_os_events(state, &events);
                }
            }

            self.deliver_pending();
            self.timer_process();

            // Second soft-event pass: callbacks above may have chained new
            // events, and waiting a whole OS poll cycle for them would add
            // real latency. The OS drain is deliberately not repeated.
            {
                let mut st = self.state();
                let state = &mut *st;
                let moved = state.soft_queue.drain_into(&mut state.pending);
                state.stats.softevent_cnt += moved;
            }
            self.deliver_pending();

            let mut st = self.state();
            st.stats.process_time_ms += crate::time::elapsed_ms(&process_start);

            elapsed = st
                .start
                .map(|s| crate::time::elapsed_ms(&s))
                .unwrap_or(0);
            if st.timeout_ms != TIMEOUT_INF && elapsed >= st.timeout_ms {
                break;
            }
        }

        let mut st = self.state();
        if st.status == Status::Running {
            st.status = Status::Paused;
        }
        match st.status_change.take() {
            Some(Status::Done) => {
                st.status = Status::Done;
                retval = RunResult::Done;
            }
            Some(Status::Return) => {
                st.status = Status::Return;
                retval = RunResult::Return;
            }
            _ => {}
        }
        retval
    }

    fn deliver_pending(&self) {
        loop {
            let next = self.state().pending.first_deliverable();
            let (io, layer_idx, ty) = match next {
                Some(n) => n,
                None => break,
            };
            self.deliver_one(&io, layer_idx, ty);
        }
        self.state().pending.clear_all();
    }

    fn deliver_one(&self, io: &Arc<Io>, layer_idx: usize, ty: EventType) {
        let id = io_id(io);
        {
            let mut st = self.state();
            if !st.reg_ios.contains_key(&id) {
                st.pending.clear_io(id);
                return;
            }
        }

        let mut ty = ty;
        let consumed = io::process_event_chain(self, io, layer_idx, &mut ty);
        if consumed {
            return;
        }
        self.pending_mark_delivered(id, ty, io.layer_count());

        let cb = self
            .state()
            .reg_ios
            .get_mut(&id)
            .and_then(|reg| reg.callback.take());
        if let Some(mut cb) = cb {
            trace!("deliver {} to user", ty.as_str());
            cb(self, ty, io);

            let mut st = self.state();
            if let Some(reg) = st.reg_ios.get_mut(&id) {
                if reg.callback.is_none() {
                    reg.callback = Some(cb);
                }
            }
        }
    }

    fn timer_process(&self) {
        let now = Instant::now();
        loop {
            let due = self.state().timers.take_due(now);
            let (id, cb) = match due {
                Some(d) => d,
                None => break,
            };
            self.state().stats.timer_cnt += 1;

            let cb = match cb {
                TimerCb::Task(mut f) => {
                    f(self);
                    TimerCb::Task(f)
                }
                TimerCb::Layer { io, layer } => {
                    if let Some(strong) = io.upgrade() {
                        io::run_timer_fired(self, &strong, layer);
                    }
                    TimerCb::Layer { io, layer }
                }
            };
            self.state().timers.finish_fire(id, cb);
        }
    }
}

fn effective_io_count(st: &mut LoopState) -> usize {
    let mut num = st.reg_ios.len();
    if st.timers.minimum_ms() != TIMEOUT_INF
        && !st.flags.contains(EventFlags::EXIT_ON_EMPTY_NO_TIMERS)
    {
        num += st.timers.len();
    }
    if num > 0 && st.parent_wake.is_some() {
        num -= 1;
    }
    num
}

fn queue_os_events(st: &mut LoopState, events: &[ReadyEvent]) {
    for ev in events {
        let (io, waittype) = match st.evhandles.get(&ev.fd) {
            Some(h) => match h.io.upgrade() {
                Some(io) => (io, h.waittype),
                None => continue,
            },
            None => continue,
        };

        // On error or hangup a read event goes first so buffered bytes can
        // still be drained by the layers above.
        if ev.error {
            if waittype.is_read() {
                st.pending.queue(&io, 0, EventType::Read);
                st.stats.osevent_cnt += 1;
            }
            st.pending.queue(&io, 0, EventType::Error);
            st.stats.osevent_cnt += 1;
        }
        if ev.readable {
            st.pending.queue(&io, 0, EventType::Read);
            st.stats.osevent_cnt += 1;
        }
        if ev.hup {
            if waittype.is_read() {
                st.pending.queue(&io, 0, EventType::Read);
                st.stats.osevent_cnt += 1;
            }
            st.pending.queue(&io, 0, EventType::Disconnected);
            st.stats.osevent_cnt += 1;
        }
        if ev.writable {
            st.pending.queue(&io, 0, EventType::Write);
            st.stats.osevent_cnt += 1;
        }
    }
}

/// Write one byte to the wake pipe if the dispatcher is blocked. A full
/// pipe means a wake is already queued.
fn wake_locked(st: &LoopState) {
    if !st.waiting {
        return;
    }
    if let Some(fd) = &st.wake_tx {
        use std::os::fd::AsRawFd;
        let buf = [1u8];
        unsafe {
            libc::write(fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/* - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - - */

/// A single event loop or a pool of per-core loops, behind one interface.
#[derive(Clone, Debug)]
pub enum Event {
    Loop(EventLoop),
    Pool(EventPool),
}

impl Event {
    /// Create a single event loop.
    pub fn create(flags: EventFlags) -> std::io::Result<Event> {
        EventLoop::create(flags).map(Event::Loop)
    }

    /// Create a pool of `min(cores, max_threads)` loops; a single-core
    /// machine gets a plain loop.
    pub fn pool_create(max_threads: usize) -> std::io::Result<Event> {
        EventPool::create(max_threads)
    }

    /// Pick the least-loaded loop: an empty loop wins outright, then lowest
    /// processing time, then lowest object count, then lowest index.
    pub fn distribute(&self) -> EventLoop {
        match self {
            Event::Loop(l) => l.clone(),
            Event::Pool(p) => p.distribute(),
        }
    }

    pub fn add(
        &self,
        io: &Arc<Io>,
        callback: impl FnMut(&EventLoop, EventType, &Arc<Io>) + Send + 'static,
    ) -> bool {
        self.distribute().add(io, callback)
    }

    pub fn run(&self, timeout_ms: u64) -> RunResult {
        match self {
            Event::Loop(l) => l.run(timeout_ms),
            Event::Pool(p) => p.run(timeout_ms),
        }
    }

    pub fn queue_task(&self, cb: impl FnMut(&EventLoop) + Send + 'static) -> bool {
        self.distribute().queue_task(cb)
    }

    pub fn timer_oneshot(
        &self,
        delay_ms: u64,
        autoremove: bool,
        cb: impl FnMut(&EventLoop) + Send + 'static,
    ) -> Timer {
        self.distribute().timer_oneshot(delay_ms, autoremove, cb)
    }

    pub fn done(&self) {
        match self {
            Event::Loop(l) => l.done(),
            Event::Pool(p) => p.done(),
        }
    }

    pub fn return_(&self) {
        match self {
            Event::Loop(l) => l.return_(),
            Event::Pool(p) => p.return_(),
        }
    }

    pub fn done_with_disconnect(&self, grace_ms: u64, disconnect_timeout_ms: u64) {
        match self {
            Event::Loop(l) => l.done_with_disconnect(grace_ms, disconnect_timeout_ms),
            Event::Pool(p) => p.done_with_disconnect(grace_ms, disconnect_timeout_ms),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Event::Loop(l) => l.status(),
            Event::Pool(p) => p.status(),
        }
    }

    pub fn num_objects(&self) -> usize {
        match self {
            Event::Loop(l) => l.num_objects(),
            Event::Pool(p) => p.num_objects(),
        }
    }

    pub fn statistic(&self, which: Statistic) -> u64 {
        match self {
            Event::Loop(l) => l.statistic(which),
            Event::Pool(p) => p.statistic(which),
        }
    }
}
