use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::event::CapsMask;

use super::{syscall, ReadyEvent};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
pub(crate) struct Selector {
    kq: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: `kqueue(2)` ensures the fd is valid.
        let kq = unsafe { OwnedFd::from_raw_fd(syscall!(kqueue())?) };
        syscall!(fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    // Filter/flag widths differ across the BSDs, hence the `as _` casts.
    fn change(&self, fd: RawFd, filter: i64, flags: u64) -> io::Result<()> {
        let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
        ev.ident = fd as libc::uintptr_t;
        ev.filter = filter as _;
        ev.flags = flags as _;
        syscall!(kevent(
            self.kq.as_raw_fd(),
            &ev,
            1,
            std::ptr::null_mut(),
            0,
            std::ptr::null(),
        ))
        .map(|_| ())
    }

    pub fn add(&self, fd: RawFd, caps: CapsMask) -> io::Result<()> {
        // Edge-triggered (EV_CLEAR); read is always armed, matching the
        // epoll backend's rationale.
        self.change(
            fd,
            libc::EVFILT_READ as i64,
            (libc::EV_ADD | libc::EV_CLEAR) as u64,
        )?;
        if caps.is_write() {
            self.change(
                fd,
                libc::EVFILT_WRITE as i64,
                (libc::EV_ADD | libc::EV_CLEAR) as u64,
            )?;
        }
        Ok(())
    }

    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        let _ = self.change(fd, libc::EVFILT_READ as i64, libc::EV_DELETE as u64);
        // The write filter may never have been registered.
        let _ = self.change(fd, libc::EVFILT_WRITE as i64, libc::EV_DELETE as u64);
        Ok(())
    }

    pub fn select(&self, events: &mut Vec<ReadyEvent>, timeout: Option<Duration>) -> io::Result<bool> {
        let mut raw: [libc::kevent; EVENT_CAPACITY] = unsafe { std::mem::zeroed() };

        let ts;
        let ts_ptr = match timeout {
            Some(to) => {
                ts = libc::timespec {
                    tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                    tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
                };
                &ts as *const libc::timespec
            }
            None => std::ptr::null(),
        };

        let n = match syscall!(kevent(
            self.kq.as_raw_fd(),
            std::ptr::null(),
            0,
            raw.as_mut_ptr(),
            EVENT_CAPACITY as i32,
            ts_ptr,
        )) {
            Ok(n) => n as usize,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };

        for ev in raw.iter().take(n) {
            events.push(ReadyEvent {
                fd: ev.ident as RawFd,
                readable: ev.filter == libc::EVFILT_READ,
                writable: ev.filter == libc::EVFILT_WRITE,
                error: ev.flags & libc::EV_ERROR != 0,
                hup: ev.flags & libc::EV_EOF != 0,
            });
        }

        Ok(n > 0)
    }
}
