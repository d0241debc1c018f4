use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use super::{syscall, timeout_to_ms, HandleSnapshot, ReadyEvent};

/// Level-triggered `poll(2)` backend. There is no kernel object to mutate;
/// the descriptor set is rebuilt from the handle-table snapshot on every
/// wait, so a modification made while the dispatcher is blocked must wake
/// it to take effect.
#[derive(Debug, Default)]
pub(crate) struct Selector {
    _priv: (),
}

impl Selector {
    pub fn new() -> Selector {
        Selector::default()
    }

    pub fn select(
        &self,
        snapshot: &[HandleSnapshot],
        events: &mut Vec<ReadyEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<bool> {
        let mut fds: Vec<libc::pollfd> = snapshot
            .iter()
            .map(|h| {
                let mut ev: libc::c_short = 0;
                if h.waittype.is_read() {
                    ev |= libc::POLLIN;
                }
                if h.waittype.is_write() {
                    ev |= libc::POLLOUT;
                }
                libc::pollfd { fd: h.fd, events: ev, revents: 0 }
            })
            .collect();

        let n = match syscall!(poll(
            fds.as_mut_ptr(),
            fds.len() as libc::nfds_t,
            timeout_to_ms(timeout),
        )) {
            Ok(n) => n as usize,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => return Err(err),
        };

        if n == 0 {
            return Ok(false);
        }

        for fd in fds.iter().filter(|fd| fd.revents != 0) {
            events.push(ReadyEvent {
                fd: fd.fd,
                readable: fd.revents & libc::POLLIN != 0,
                writable: fd.revents & libc::POLLOUT != 0,
                error: fd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                hup: fd.revents & libc::POLLHUP != 0,
            });
        }

        Ok(true)
    }
}
