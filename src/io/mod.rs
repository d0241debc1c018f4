//! I/O objects and the composable layer stack.
//!
//! An [`Io`] is an ordered stack of [`Layer`]s: index 0 is the OS
//! primitive, higher layers wrap it. Events dispatch bottom-up through
//! [`Layer::process_event`]; reads and writes resolve top-down to the first
//! layer that implements them. Every trait method has a transparent
//! pass-through default so a layer only implements what it intercepts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::IoError;
use crate::event::{CapsMask, EventLoop, EventType, ModOp, Timer, WaitMask};

pub mod hid;
pub mod net;
pub mod netdns;
pub mod osevent;
pub mod pipe;
pub(crate) mod posix;

use std::os::unix::io::RawFd;

/// What kind of endpoint an [`Io`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    /// Bidirectional data stream.
    Stream,
    /// Accepts incoming connections.
    Listener,
    /// Internal event-delivery object (e.g. the loop's wake handle).
    Event,
}

/// Connection state as reported by [`Io::state`]. Transitions only move
/// forward (Init → Connecting → Connected → Disconnecting →
/// Disconnected), with Error reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoState {
    Init,
    Listening,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

/// Loop-facing operations available to a layer during a callback.
///
/// A context borrows the object's core state, so no additional locking is
/// needed; operations that touch the owning event loop take its lock
/// briefly.
pub struct LayerCtx<'a> {
    core: &'a mut IoCore,
    idx: usize,
}

impl std::fmt::Debug for LayerCtx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerCtx").field("idx", &self.idx).finish()
    }
}

impl<'a> LayerCtx<'a> {
    /// This layer's index within the stack.
    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn kind(&self) -> IoKind {
        self.core.kind
    }

    /// The owning object.
    pub fn io(&self) -> Option<Arc<Io>> {
        self.core.this.upgrade()
    }

    /// The loop the object is attached to, if any.
    pub fn event(&self) -> Option<EventLoop> {
        self.core.event.clone()
    }

    /// Queue a soft event for this layer, or for the next layer up when
    /// `sibling_only`.
    pub fn softevent_add(&self, sibling_only: bool, ty: EventType, err: IoError) {
        let (ev, io) = match (self.event(), self.io()) {
            (Some(ev), Some(io)) => (ev, io),
            _ => return,
        };
        let id = if sibling_only { self.idx + 1 } else { self.idx };
        ev.softevent_add(&io, id, ty, err);
    }

    pub fn softevent_del(&self, sibling_only: bool, ty: EventType) {
        let (ev, io) = match (self.event(), self.io()) {
            (Some(ev), Some(io)) => (ev, io),
            _ => return,
        };
        let id = if sibling_only { self.idx + 1 } else { self.idx };
        ev.softevent_del(&io, id, ty);
    }

    /// Register an OS handle for this object. Capabilities are fixed here.
    pub fn handle_add(&self, fd: RawFd, waittype: WaitMask, caps: CapsMask) -> bool {
        match (self.event(), self.io()) {
            (Some(ev), Some(io)) => {
                ev.handle_modify(ModOp::AddHandle, Some(&io), fd, waittype, caps)
            }
            _ => false,
        }
    }

    pub fn handle_del(&self, fd: RawFd) -> bool {
        match self.event() {
            Some(ev) => ev.handle_modify(ModOp::DelHandle, None, fd, WaitMask::NONE, CapsMask::default()),
            None => false,
        }
    }

    pub fn waittype_add(&self, fd: RawFd, waittype: WaitMask) -> bool {
        match self.event() {
            Some(ev) => ev.handle_modify(ModOp::AddWait, None, fd, waittype, CapsMask::default()),
            None => false,
        }
    }

    pub fn waittype_del(&self, fd: RawFd) -> bool {
        self.waittype_del_mask(fd, WaitMask::READ | WaitMask::WRITE)
    }

    pub fn waittype_del_mask(&self, fd: RawFd, waittype: WaitMask) -> bool {
        match self.event() {
            Some(ev) => ev.handle_modify(ModOp::DelWait, None, fd, waittype, CapsMask::default()),
            None => false,
        }
    }

    /// Create a stopped timer that dispatches to this layer's
    /// [`Layer::timer_fired`].
    pub fn timer_create(&self) -> Option<Timer> {
        match (self.event(), self.io()) {
            (Some(ev), Some(io)) => Some(ev.layer_timer(&io, self.idx)),
            _ => None,
        }
    }

    /// Record an error on the owning object (monotonic; see
    /// [`Io::last_error`]).
    pub fn set_error(&self, err: IoError) {
        if let Some(io) = self.io() {
            io.set_error(err);
        }
    }
}

/// One composable element of an I/O stack.
///
/// Every method defaults to transparent pass-through; a concrete layer
/// implements only the concerns it intercepts.
#[allow(unused_variables)]
pub trait Layer: Send + 'static {
    /// Short identifying name, e.g. `"NET"`.
    fn name(&self) -> &'static str;

    /// Concrete-type access for accessor functions that reach into a known
    /// layer (e.g. the TCP settings setters).
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    /// Called when the owning object is attached to a loop. Returning
    /// false aborts the attach and detaches the object.
    fn init(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        true
    }

    /// On a listener's bottom layer: accept the pending connection into
    /// `new_io` (pushing a fresh layer onto it). Non-listening layers
    /// refuse.
    fn accept(&mut self, new_io: &Arc<Io>, ctx: &mut LayerCtx<'_>) -> Result<(), IoError> {
        Err(IoError::NotConnected)
    }

    /// Non-blocking read. `None` means "not handled here, ask the layer
    /// below".
    fn read(&mut self, ctx: &mut LayerCtx<'_>, buf: &mut [u8]) -> Option<Result<usize, IoError>> {
        None
    }

    /// Non-blocking write; partial writes return the accepted length.
    fn write(&mut self, ctx: &mut LayerCtx<'_>, buf: &[u8]) -> Option<Result<usize, IoError>> {
        None
    }

    /// Bottom-up event dispatch. The layer may rewrite `ty`; returning
    /// true consumes the event.
    fn process_event(&mut self, ctx: &mut LayerCtx<'_>, ty: &mut EventType) -> bool {
        false
    }

    /// The object is being detached from its loop.
    fn unregister(&mut self, ctx: &mut LayerCtx<'_>) {}

    /// Begin a graceful disconnect. True means this layer is done and the
    /// next layer down may proceed; false means "still draining, a
    /// Disconnected soft event will follow".
    fn disconnect(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        true
    }

    /// Release layer resources ahead of drop. Must tolerate partial init.
    fn reset(&mut self) {}

    /// This layer's view of the connection state.
    fn state(&self) -> IoState {
        IoState::Init
    }

    /// A human-readable error message, or `None` to defer to the layer
    /// below.
    fn error_msg(&self) -> Option<String> {
        None
    }

    /// A timer created through [`LayerCtx::timer_create`] fired.
    fn timer_fired(&mut self, ctx: &mut LayerCtx<'_>) {}
}

pub(crate) struct IoCore {
    kind: IoKind,
    event: Option<EventLoop>,
    this: Weak<Io>,
}

pub(crate) struct IoInner {
    core: IoCore,
    layers: Vec<Box<dyn Layer>>,
}

/// A layered I/O object. Create via the constructors in [`net`], [`pipe`],
/// [`hid`] or [`osevent`], attach to a loop with `Event::add`, and drive it
/// from the delivered events.
pub struct Io {
    inner: Mutex<IoInner>,
    /// Cached so loop-locked code can size bitsets without taking the
    /// object lock.
    layer_count: AtomicUsize,
    last_error: Mutex<IoError>,
}

impl std::fmt::Debug for Io {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Io")
            .field("state", &self.state())
            .field("layers", &self.layer_count())
            .finish()
    }
}

impl Io {
    pub(crate) fn new(kind: IoKind) -> Arc<Io> {
        Arc::new_cyclic(|this| Io {
            inner: Mutex::new(IoInner {
                core: IoCore { kind, event: None, this: this.clone() },
                layers: Vec::new(),
            }),
            layer_count: AtomicUsize::new(0),
            last_error: Mutex::new(IoError::Success),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, IoInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn add_layer(&self, layer: Box<dyn Layer>) -> usize {
        let mut inner = self.lock();
        inner.layers.push(layer);
        let idx = inner.layers.len() - 1;
        self.layer_count.store(inner.layers.len(), Ordering::Release);
        idx
    }

    /// Strong handle to self, via the back-reference every object carries.
    fn this(&self) -> Option<Arc<Io>> {
        self.lock().core.this.upgrade()
    }

    pub fn kind(&self) -> IoKind {
        self.lock().core.kind
    }

    pub(crate) fn layer_count(&self) -> usize {
        self.layer_count.load(Ordering::Acquire)
    }

    /// The loop this object is attached to.
    pub fn event(&self) -> Option<EventLoop> {
        self.lock().core.event.clone()
    }

    pub(crate) fn bind_event(&self, ev: &EventLoop) -> bool {
        let mut inner = self.lock();
        if inner.core.event.is_some() {
            return false;
        }
        inner.core.event = Some(ev.clone());
        true
    }

    pub(crate) fn unbind_event(&self) {
        self.lock().core.event = None;
    }

    pub(crate) fn is_bound_to(&self, ev: &EventLoop) -> bool {
        match &self.lock().core.event {
            Some(bound) => bound == ev,
            None => false,
        }
    }

    /// First error recorded on the object. Once set to something more
    /// specific than `Success`/`Error`, later codes do not overwrite it.
    pub fn last_error(&self) -> IoError {
        match self.last_error.lock() {
            Ok(g) => *g,
            Err(p) => *p.into_inner(),
        }
    }

    pub(crate) fn set_error(&self, err: IoError) {
        if err == IoError::Success {
            return;
        }
        let mut guard = match self.last_error.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if *guard == IoError::Success || *guard == IoError::Error {
            *guard = err;
        }
    }

    /// The object's state: the bottom-most layer that has left `Init`
    /// decides.
    pub fn state(&self) -> IoState {
        let inner = self.lock();
        for layer in &inner.layers {
            let s = layer.state();
            if s != IoState::Init {
                return s;
            }
        }
        IoState::Init
    }

    /// A human-readable error string, top layer first.
    pub fn error_string(&self) -> String {
        let inner = self.lock();
        for layer in inner.layers.iter().rev() {
            if let Some(msg) = layer.error_msg() {
                return msg;
            }
        }
        self.last_error().to_string()
    }

    /// Non-blocking read through the stack.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        if buf.is_empty() {
            return Err(IoError::Invalid);
        }
        let mut inner = self.lock();
        let inner = &mut *inner;
        for idx in (0..inner.layers.len()).rev() {
            let mut ctx = LayerCtx { core: &mut inner.core, idx };
            if let Some(res) = inner.layers[idx].read(&mut ctx, buf) {
                if let Err(err) = &res {
                    if !err.is_transient() {
                        drop_set_error(&inner.core, *err);
                    }
                }
                return res;
            }
        }
        Err(IoError::Error)
    }

    /// Non-blocking write through the stack.
    pub fn write(&self, buf: &[u8]) -> Result<usize, IoError> {
        if buf.is_empty() {
            return Err(IoError::Invalid);
        }
        let mut inner = self.lock();
        let inner = &mut *inner;
        for idx in (0..inner.layers.len()).rev() {
            let mut ctx = LayerCtx { core: &mut inner.core, idx };
            if let Some(res) = inner.layers[idx].write(&mut ctx, buf) {
                if let Err(err) = &res {
                    if !err.is_transient() {
                        drop_set_error(&inner.core, *err);
                    }
                }
                return res;
            }
        }
        Err(IoError::Error)
    }

    /// Begin a graceful disconnect, top layer first. When every layer
    /// reports immediate completion a `Disconnected` event is queued for
    /// the user; otherwise the draining layer emits it later.
    pub fn disconnect(&self) {
        let all_done = {
            let mut inner = self.lock();
            let inner = &mut *inner;
            let mut all_done = true;
            for idx in (0..inner.layers.len()).rev() {
                let mut ctx = LayerCtx { core: &mut inner.core, idx };
                if !inner.layers[idx].disconnect(&mut ctx) {
                    all_done = false;
                    break;
                }
            }
            all_done
        };

        if all_done {
            if let (Some(ev), Some(me)) = (self.event(), self.this()) {
                ev.softevent_add(&me, self.layer_count(), EventType::Disconnected, IoError::Disconnect);
            }
        }
    }

    /// Accept a pending connection on a listener, producing a fresh,
    /// unattached stream object.
    pub fn accept(&self) -> Result<Arc<Io>, IoError> {
        if self.kind() != IoKind::Listener {
            return Err(IoError::Invalid);
        }
        let new_io = Io::new(IoKind::Stream);

        let mut inner = self.lock();
        let inner = &mut *inner;
        if inner.layers.is_empty() {
            return Err(IoError::Invalid);
        }
        let mut ctx = LayerCtx { core: &mut inner.core, idx: 0 };
        match inner.layers[0].accept(&new_io, &mut ctx) {
            Ok(()) => {
                // The kernel coalesces edge notifications, so another
                // connection may already be queued behind this one; a
                // synthetic Accept keeps draining until accept itself
                // reports WouldBlock.
                ctx.softevent_add(false, EventType::Accept, IoError::Success);
                Ok(new_io)
            }
            Err(err) => {
                if !err.is_transient() {
                    drop_set_error(&inner.core, err);
                }
                Err(err)
            }
        }
    }

    /// Detach from any loop and tear the stack down, top layer first.
    pub fn destroy(&self) {
        if let (Some(ev), Some(me)) = (self.event(), self.this()) {
            ev.remove(&me);
        }
        let mut inner = self.lock();
        while let Some(mut layer) = inner.layers.pop() {
            layer.reset();
        }
        self.layer_count.store(0, Ordering::Release);
    }
}

fn drop_set_error(core: &IoCore, err: IoError) {
    if let Some(io) = core.this.upgrade() {
        io.set_error(err);
    }
}

/* - - - - - loop-side dispatch helpers - - - - - */

/// Walk every layer's `init` bottom-up; false on the first failure.
pub(crate) fn run_init(ev: &EventLoop, io: &Arc<Io>) -> bool {
    let _ = ev;
    let mut inner = io.lock();
    let inner = &mut *inner;
    for idx in 0..inner.layers.len() {
        let mut ctx = LayerCtx { core: &mut inner.core, idx };
        if !inner.layers[idx].init(&mut ctx) {
            return false;
        }
    }
    true
}

pub(crate) fn run_unregister(ev: &EventLoop, io: &Arc<Io>) {
    let _ = ev;
    let mut inner = io.lock();
    let inner = &mut *inner;
    for idx in 0..inner.layers.len() {
        let mut ctx = LayerCtx { core: &mut inner.core, idx };
        inner.layers[idx].unregister(&mut ctx);
    }
}

/// Dispatch an event from `start` upward until a layer consumes it. The
/// loop's pending bookkeeping is updated for each visited layer with the
/// (possibly rewritten) type presented to it.
pub(crate) fn process_event_chain(
    ev: &EventLoop,
    io: &Arc<Io>,
    start: usize,
    ty: &mut EventType,
) -> bool {
    let id = Arc::as_ptr(io) as usize;
    let mut inner = io.lock();
    let inner = &mut *inner;
    for idx in start..inner.layers.len() {
        ev.pending_mark_delivered(id, *ty, idx);
        let mut ctx = LayerCtx { core: &mut inner.core, idx };
        if inner.layers[idx].process_event(&mut ctx, ty) {
            return true;
        }
    }
    false
}

pub(crate) fn run_timer_fired(ev: &EventLoop, io: &Arc<Io>, layer: usize) {
    let _ = ev;
    let mut inner = io.lock();
    let inner = &mut *inner;
    if layer >= inner.layers.len() {
        return;
    }
    let mut ctx = LayerCtx { core: &mut inner.core, idx: layer };
    inner.layers[layer].timer_fired(&mut ctx);
}

/// Acquire an object's stack and run `f` against the named layer. Used by
/// helper callbacks (child-object relays) that need a specific layer.
pub(crate) fn with_layer<R>(
    io: &Arc<Io>,
    idx: usize,
    expected_name: &str,
    f: impl FnOnce(&mut dyn Layer, &mut LayerCtx<'_>) -> R,
) -> Option<R> {
    let mut inner = io.lock();
    let inner = &mut *inner;
    let layer = inner.layers.get_mut(idx)?;
    if !expected_name.is_empty() && layer.name() != expected_name {
        return None;
    }
    let mut ctx = LayerCtx { core: &mut inner.core, idx };
    Some(f(layer.as_mut(), &mut ctx))
}
