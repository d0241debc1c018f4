use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::event::CapsMask;

use super::{syscall, timeout_to_ms, ReadyEvent};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub fn add(&self, fd: RawFd, caps: CapsMask) -> io::Result<()> {
        // Registrations are edge-triggered and permanent; a read interest is
        // always armed because write-only pipes report remote closure via
        // EPOLLIN|EPOLLHUP.
        let mut kind = EPOLLET | EPOLLIN | EPOLLRDHUP;
        if caps.is_write() {
            kind |= EPOLLOUT;
        }

        let mut event = libc::epoll_event {
            events: kind as u32,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut(),
        ))
        .map(|_| ())
    }

    pub fn select(&self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> io::Result<bool> {
        let mut raw: [libc::epoll_event; EVENT_CAPACITY] = unsafe { std::mem::zeroed() };

        let n = match syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            raw.as_mut_ptr(),
            EVENT_CAPACITY as i32,
            timeout_to_ms(timeout),
        )) {
            Ok(n) => n as usize,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };

        for ev in raw.iter().take(n) {
            let kind = ev.events as libc::c_int;
            events.push(ReadyEvent {
                fd: ev.u64 as RawFd,
                readable: kind & EPOLLIN != 0,
                writable: kind & EPOLLOUT != 0,
                error: kind & EPOLLERR != 0,
                hup: kind & (EPOLLHUP | EPOLLRDHUP) != 0,
            });
        }

        Ok(n > 0)
    }
}
