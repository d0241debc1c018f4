//! Shared POSIX descriptor plumbing for the concrete layers: non-blocking
//! reads/writes with waittype re-arm, SIGPIPE suppression, and fd flag
//! helpers.

use std::os::unix::io::RawFd;

use crate::error::IoError;
use crate::event::WaitMask;
use crate::sys::syscall;

use super::LayerCtx;

pub(crate) fn set_nonblock(fd: RawFd) -> bool {
    let flags = match syscall!(fcntl(fd, libc::F_GETFL, 0)) {
        Ok(f) => f,
        Err(_) => return false,
    };
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).is_ok()
}

pub(crate) fn set_cloexec(fd: RawFd) {
    if let Ok(flags) = syscall!(fcntl(fd, libc::F_GETFD)) {
        let _ = syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC));
    }
}

/// Read from a descriptor, adjusting the read waittype for edge-triggered
/// delivery: re-arm on `WouldBlock` or a complete read, disarm once a read
/// came up short (the kernel will not signal again until more arrives).
pub(crate) fn fd_read(
    ctx: &LayerCtx<'_>,
    fd: RawFd,
    buf: &mut [u8],
    sys_error: &mut i32,
) -> Result<usize, IoError> {
    if fd == -1 {
        return Err(IoError::Error);
    }

    *sys_error = 0;
    let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };

    let err = if res == 0 {
        Err(IoError::Disconnect)
    } else if res < 0 {
        *sys_error = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Err(IoError::from_errno(*sys_error))
    } else {
        Ok(res as usize)
    };

    match &err {
        Err(IoError::WouldBlock) => {
            ctx.waittype_add(fd, WaitMask::READ);
        }
        Ok(n) if *n >= buf.len() => {
            ctx.waittype_add(fd, WaitMask::READ);
        }
        Ok(_) => {
            ctx.waittype_del_mask(fd, WaitMask::READ);
        }
        Err(_) => {}
    }

    err
}

/// Write to a descriptor with SIGPIPE suppressed, re-arming the write
/// waittype on `WouldBlock` or a partial write.
pub(crate) fn fd_write(
    ctx: &LayerCtx<'_>,
    fd: RawFd,
    buf: &[u8],
    sys_error: &mut i32,
) -> Result<usize, IoError> {
    if fd == -1 {
        return Err(IoError::Error);
    }

    let sigpipe = SigpipeGuard::block();

    *sys_error = 0;
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };

    let err = if res <= 0 {
        *sys_error = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Err(IoError::from_errno(*sys_error))
    } else {
        Ok(res as usize)
    };

    drop(sigpipe);

    match &err {
        Err(IoError::WouldBlock) => {
            ctx.waittype_add(fd, WaitMask::WRITE);
        }
        Ok(n) if *n < buf.len() => {
            ctx.waittype_add(fd, WaitMask::WRITE);
        }
        Ok(_) => {
            ctx.waittype_del_mask(fd, WaitMask::WRITE);
        }
        Err(_) => {}
    }

    err
}

/// Block SIGPIPE on this thread for the duration of a write and consume
/// any instance the write generated. Not needed where the socket itself is
/// protected (`MSG_NOSIGNAL`, `SO_NOSIGPIPE`) but descriptor writes (pipes)
/// have no per-call flag.
pub(crate) struct SigpipeGuard {
    blocked: bool,
    already_pending: bool,
}

impl SigpipeGuard {
    pub fn block() -> SigpipeGuard {
        let mut guard = SigpipeGuard { blocked: false, already_pending: false };

        unsafe {
            let mut pending: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut pending);
            libc::sigpending(&mut pending);
            if libc::sigismember(&pending, libc::SIGPIPE) == 1 {
                // Already pending before us; leave it alone.
                guard.already_pending = true;
                return guard;
            }

            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, libc::SIGPIPE);

            let mut old: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut old);
            libc::pthread_sigmask(libc::SIG_BLOCK, &mask, &mut old);
            if libc::sigismember(&old, libc::SIGPIPE) != 1 {
                guard.blocked = true;
            }
        }
        guard
    }
}

impl Drop for SigpipeGuard {
    fn drop(&mut self) {
        if self.already_pending {
            return;
        }

        unsafe {
            let mut pending: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut pending);
            libc::sigpending(&mut pending);

            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, libc::SIGPIPE);

            if libc::sigismember(&pending, libc::SIGPIPE) == 1 {
                consume_sigpipe(&mask);
            }

            if self.blocked {
                libc::pthread_sigmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut());
            }
        }
    }
}

/// Consume one pending SIGPIPE; EINTR from other signals just retries.
#[cfg(any(
    target_os = "android",
    target_os = "freebsd",
    target_os = "illumos",
    target_os = "linux",
    target_os = "netbsd"
))]
unsafe fn consume_sigpipe(mask: &libc::sigset_t) {
    let timeout = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    while libc::sigtimedwait(mask, std::ptr::null_mut(), &timeout) == -1
        && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
    {}
}

/// No `sigtimedwait` here; the signal is known pending so `sigwait` cannot
/// block.
#[cfg(not(any(
    target_os = "android",
    target_os = "freebsd",
    target_os = "illumos",
    target_os = "linux",
    target_os = "netbsd"
)))]
unsafe fn consume_sigpipe(mask: &libc::sigset_t) {
    let mut sig: libc::c_int = 0;
    while libc::sigwait(mask, &mut sig) == -1
        && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR)
    {}
}

/// Human-readable message for a raw OS error.
pub(crate) fn errormsg(sys_error: i32) -> Option<String> {
    if sys_error == 0 {
        return None;
    }
    Some(std::io::Error::from_raw_os_error(sys_error).to_string())
}
