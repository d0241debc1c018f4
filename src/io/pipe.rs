//! Anonymous pipes as stream objects: one read-side `Io` and one
//! write-side `Io`, each a single layer over its descriptor.

use std::os::fd::FromRawFd;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use crate::error::IoError;
use crate::event::{CapsMask, EventType, WaitMask};
use crate::sys::syscall;

use super::{posix, Io, IoKind, IoState, Layer, LayerCtx};

const NAME: &str = "PIPE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Read,
    Write,
}

struct PipeLayer {
    fd: Option<OwnedFd>,
    dir: Dir,
    state: IoState,
    last_error_sys: i32,
}

impl PipeLayer {
    fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1)
    }

    fn close(&mut self, ctx: &mut LayerCtx<'_>) {
        if let Some(fd) = self.fd.take() {
            ctx.handle_del(fd.as_raw_fd());
        }
    }
}

impl Layer for PipeLayer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn init(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        let fd = self.raw_fd();
        if fd == -1 {
            return false;
        }
        let (wait, caps) = match self.dir {
            Dir::Read => (WaitMask::READ, CapsMask::READ),
            // Write-only ends still learn about peer closure through read
            // readiness, which the backend always arms.
            Dir::Write => (WaitMask::NONE, CapsMask::WRITE),
        };
        if !ctx.handle_add(fd, wait, caps) {
            return false;
        }
        self.state = IoState::Connected;
        ctx.softevent_add(false, EventType::Connected, IoError::Success);
        true
    }

    fn read(&mut self, ctx: &mut LayerCtx<'_>, buf: &mut [u8]) -> Option<Result<usize, IoError>> {
        if self.dir != Dir::Read {
            return Some(Err(IoError::Invalid));
        }
        if self.state == IoState::Disconnected {
            return Some(Err(IoError::Disconnect));
        }
        if self.state != IoState::Connected {
            return Some(Err(IoError::NotConnected));
        }

        let res = posix::fd_read(ctx, self.raw_fd(), buf, &mut self.last_error_sys);
        if let Err(err) = &res {
            if !err.is_transient() {
                self.state = if *err == IoError::Disconnect {
                    IoState::Disconnected
                } else {
                    IoState::Error
                };
            }
        }
        Some(res)
    }

    fn write(&mut self, ctx: &mut LayerCtx<'_>, buf: &[u8]) -> Option<Result<usize, IoError>> {
        if self.dir != Dir::Write {
            return Some(Err(IoError::Invalid));
        }
        if self.state == IoState::Disconnected {
            return Some(Err(IoError::Disconnect));
        }
        if self.state != IoState::Connected {
            return Some(Err(IoError::NotConnected));
        }

        let res = posix::fd_write(ctx, self.raw_fd(), buf, &mut self.last_error_sys);
        if let Err(err) = &res {
            if !err.is_transient() {
                self.state = if *err == IoError::Disconnect {
                    IoState::Disconnected
                } else {
                    IoState::Error
                };
            }
        }
        Some(res)
    }

    fn process_event(&mut self, ctx: &mut LayerCtx<'_>, ty: &mut EventType) -> bool {
        match *ty {
            EventType::Read => {
                if self.dir == Dir::Write {
                    // Readability on a write end means the far side closed.
                    *ty = EventType::Disconnected;
                    self.state = IoState::Disconnected;
                    return false;
                }
                ctx.waittype_del_mask(self.raw_fd(), WaitMask::READ);
                false
            }
            EventType::Write => {
                ctx.waittype_del_mask(self.raw_fd(), WaitMask::WRITE);
                false
            }
            EventType::Disconnected => {
                self.state = IoState::Disconnected;
                false
            }
            EventType::Error => {
                if self.state == IoState::Connected {
                    self.state = IoState::Error;
                }
                false
            }
            _ => false,
        }
    }

    fn unregister(&mut self, ctx: &mut LayerCtx<'_>) {
        let fd = self.raw_fd();
        if fd != -1 {
            ctx.handle_del(fd);
        }
    }

    fn disconnect(&mut self, ctx: &mut LayerCtx<'_>) -> bool {
        // Pipes have no shutdown handshake: closing is the disconnect.
        self.close(ctx);
        if self.state == IoState::Connected {
            self.state = IoState::Disconnected;
        }
        true
    }

    fn reset(&mut self) {
        self.fd = None;
        self.state = IoState::Init;
        self.last_error_sys = 0;
    }

    fn state(&self) -> IoState {
        self.state
    }

    fn error_msg(&self) -> Option<String> {
        if self.state == IoState::Disconnected {
            return Some("Gracefully Closed Connection".to_string());
        }
        posix::errormsg(self.last_error_sys)
    }
}

/// Create a connected pipe pair: `(reader, writer)`, both unattached.
pub fn create() -> Result<(Arc<Io>, Arc<Io>), IoError> {
    let mut fds = [0 as RawFd; 2];
    #[cfg(any(target_os = "android", target_os = "linux"))]
    {
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC))
            .map_err(|e| IoError::from_io_error(&e))?;
    }
    #[cfg(not(any(target_os = "android", target_os = "linux")))]
    {
        syscall!(pipe(fds.as_mut_ptr())).map_err(|e| IoError::from_io_error(&e))?;
        posix::set_cloexec(fds[0]);
        posix::set_cloexec(fds[1]);
    }

    if !posix::set_nonblock(fds[0]) || !posix::set_nonblock(fds[1]) {
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        return Err(IoError::Error);
    }

    // SAFETY: pipe(2) returned two valid descriptors we own.
    let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    let reader = Io::new(IoKind::Stream);
    reader.add_layer(Box::new(PipeLayer {
        fd: Some(rx),
        dir: Dir::Read,
        state: IoState::Init,
        last_error_sys: 0,
    }));

    let writer = Io::new(IoKind::Stream);
    writer.add_layer(Box::new(PipeLayer {
        fd: Some(tx),
        dir: Dir::Write,
        state: IoState::Init,
        last_error_sys: 0,
    }));

    Ok((reader, writer))
}
