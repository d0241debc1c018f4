//! OS-event objects: a pipe whose read side lives on an event loop and
//! whose write side triggers an `Other` event from any thread. The loop's
//! internal self-wake object is one of these with the write side held by
//! the loop itself.

use std::io;
use std::os::fd::FromRawFd;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::error::IoError;
use crate::event::{CapsMask, Event, EventLoop, EventType, WaitMask};
use crate::sys::syscall;

use super::{posix, Io, IoKind, IoState, Layer, LayerCtx};

const NAME: &str = "PIPEEVENT";

struct OseventLayer {
    rx: OwnedFd,
}

impl Layer for OseventLayer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn init(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        ctx.handle_add(self.rx.as_raw_fd(), WaitMask::READ, CapsMask::READ)
    }

    fn process_event(&mut self, ctx: &mut LayerCtx<'_>, ty: &mut EventType) -> bool {
        let _ = ctx;
        match *ty {
            EventType::Read => {
                // Drain everything queued; any number of trigger bytes
                // collapses into one delivery.
                let mut tmp = [0u8; 32];
                let mut total = 0usize;
                loop {
                    let n = unsafe {
                        libc::read(
                            self.rx.as_raw_fd(),
                            tmp.as_mut_ptr() as *mut libc::c_void,
                            tmp.len(),
                        )
                    };
                    if n <= 0 {
                        break;
                    }
                    total += n as usize;
                    if (n as usize) < tmp.len() {
                        break;
                    }
                }

                if total == 0 {
                    // Spurious; wait for the next one.
                    return true;
                }
                *ty = EventType::Other;
                false
            }
            // Nothing else makes sense for a wakeup pipe.
            _ => true,
        }
    }

    fn unregister(&mut self, ctx: &mut LayerCtx<'_>) {
        ctx.handle_del(self.rx.as_raw_fd());
    }

    fn state(&self) -> IoState {
        IoState::Connected
    }
}

fn make_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    #[cfg(any(target_os = "android", target_os = "linux"))]
    {
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC))?;
    }
    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    {
        syscall!(pipe(fds.as_mut_ptr()))?;
        posix::set_cloexec(fds[0]);
        posix::set_cloexec(fds[1]);
    }

    if !posix::set_nonblock(fds[0]) || !posix::set_nonblock(fds[1]) {
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        return Err(io::Error::last_os_error());
    }

    // SAFETY: pipe(2) returned two valid descriptors we own.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

fn build_io(rx: OwnedFd) -> Arc<Io> {
    let io = Io::new(IoKind::Event);
    io.add_layer(Box::new(OseventLayer { rx }));
    io
}

/// The loop's internal wake object: the read side becomes a registered
/// event object, the write side goes to the loop for lock-free waking.
pub(crate) fn create_wake(ev: &EventLoop) -> io::Result<(Arc<Io>, OwnedFd)> {
    let (rx, tx) = make_pipe()?;
    let io = build_io(rx);
    ev.add_internal(&io, None);
    Ok((io, tx))
}

/// A user-visible OS-event object with a trigger handle. The object
/// delivers one `Other` event per burst of triggers.
pub struct OseventTrigger {
    tx: OwnedFd,
}

impl OseventTrigger {
    /// Signal the object from any thread. A full pipe means a delivery is
    /// already queued, which is all a trigger can ask for.
    pub fn trigger(&self) {
        let buf = [1u8];
        unsafe {
            libc::write(self.tx.as_raw_fd(), buf.as_ptr() as *const libc::c_void, 1);
        }
    }
}

impl std::fmt::Debug for OseventTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OseventTrigger").finish_non_exhaustive()
    }
}

/// Create an OS-event object attached to `event`, delivering `Other`
/// events to `callback` whenever the returned trigger fires.
pub fn create(
    event: &Event,
    callback: impl FnMut(&EventLoop, EventType, &Arc<Io>) + Send + 'static,
) -> Result<(Arc<Io>, OseventTrigger), IoError> {
    let (rx, tx) = make_pipe().map_err(|e| IoError::from_io_error(&e))?;
    let io = build_io(rx);
    if !event.distribute().add(&io, callback) {
        return Err(IoError::Error);
    }
    Ok((io, OseventTrigger { tx }))
}
