//! OS readiness backends.
//!
//! Every backend reports readiness through the same [`ReadyEvent`] shape and
//! leaves edge-to-level adaptation to the soft-event queue. epoll and kqueue
//! register file descriptors in edge-triggered mode at handle-add time and
//! ignore per-iteration waittype changes; the poll backend is level-triggered
//! and instead rebuilds its descriptor array from the handle table every
//! iteration, which is why cross-thread modifications must wake it.

/// Helper macro to execute a system call that returns an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

#[cfg(any(target_os = "android", target_os = "illumos", target_os = "linux"))]
mod epoll;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
mod poll;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::event::{CapsMask, WaitMask};

/// One readiness report from the OS, in raw terms. The event loop applies
/// the delivery-ordering contract (read before disconnect/error) when
/// translating these into queued events.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadyEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hup: bool,
}

/// Snapshot of a registered handle, fed to the poll backend each iteration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HandleSnapshot {
    pub fd: RawFd,
    pub waittype: WaitMask,
}

pub(crate) enum Selector {
    #[cfg(any(target_os = "android", target_os = "illumos", target_os = "linux"))]
    Epoll(epoll::Selector),
    #[cfg(any(
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "ios",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    Kqueue(kqueue::Selector),
    Poll(poll::Selector),
}

impl Selector {
    /// The platform's scalable backend.
    pub fn new_scalable() -> io::Result<Selector> {
        #[cfg(any(target_os = "android", target_os = "illumos", target_os = "linux"))]
        {
            epoll::Selector::new().map(Selector::Epoll)
        }
        #[cfg(any(
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        {
            kqueue::Selector::new().map(Selector::Kqueue)
        }
        #[cfg(not(any(
            target_os = "android",
            target_os = "illumos",
            target_os = "linux",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "openbsd"
        )))]
        {
            Ok(Selector::Poll(poll::Selector::new()))
        }
    }

    /// The poll(2) backend, for `NON_SCALABLE` loops.
    pub fn new_poll() -> Selector {
        Selector::Poll(poll::Selector::new())
    }

    /// Register a descriptor. Capabilities are fixed at registration.
    pub fn add(&self, fd: RawFd, caps: CapsMask) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "android", target_os = "illumos", target_os = "linux"))]
            Selector::Epoll(s) => s.add(fd, caps),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Selector::Kqueue(s) => s.add(fd, caps),
            Selector::Poll(_) => Ok(()),
        }
    }

    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "android", target_os = "illumos", target_os = "linux"))]
            Selector::Epoll(s) => s.del(fd),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Selector::Kqueue(s) => s.del(fd),
            Selector::Poll(_) => Ok(()),
        }
    }

    /// Whether cross-thread handle mutations require waking a blocked wait.
    pub fn needs_wake_on_modify(&self) -> bool {
        matches!(self, Selector::Poll(_))
    }

    /// Block for readiness up to `timeout` (`None` = forever). `snapshot`
    /// is consulted only by the poll backend.
    pub fn select(
        &self,
        snapshot: &[HandleSnapshot],
        events: &mut Vec<ReadyEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<bool> {
        events.clear();
        match self {
            #[cfg(any(target_os = "android", target_os = "illumos", target_os = "linux"))]
            Selector::Epoll(s) => s.select(events, timeout),
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Selector::Kqueue(s) => s.select(events, timeout),
            Selector::Poll(s) => s.select(snapshot, events, timeout),
        }
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            #[cfg(any(target_os = "android", target_os = "illumos", target_os = "linux"))]
            Selector::Epoll(_) => "epoll",
            #[cfg(any(
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "ios",
                target_os = "macos",
                target_os = "netbsd",
                target_os = "openbsd"
            ))]
            Selector::Kqueue(_) => "kqueue",
            Selector::Poll(_) => "poll",
        };
        f.debug_tuple("Selector").field(&name).finish()
    }
}

/// Round a timeout up to whole milliseconds so sub-millisecond waits do not
/// turn into busy loops; `None` maps to an infinite wait (-1).
pub(crate) fn timeout_to_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(to) => to
            .checked_add(Duration::from_nanos(999_999))
            .unwrap_or(to)
            .as_millis()
            .min(libc::c_int::MAX as u128) as libc::c_int,
    }
}
