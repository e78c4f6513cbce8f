use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{cmp, i32};

use libc::{c_int, c_short, POLLERR, POLLHUP, POLLIN, POLLOUT};

use super::{Backend, RawEvent};
use crate::ready::Ready;

/// Portable fallback over `poll(2)`. Unlike `mio`'s thread-safe version
/// (which needs a `Mutex`/`Condvar` pair to let registration and an
/// in-flight `wait` interleave across threads), the reactor this backs is
/// single-threaded and cooperative, so a plain `Vec` + index map suffices.
#[derive(Debug)]
pub(super) struct Poll {
    fds: Vec<libc::pollfd>,
    index: HashMap<RawFd, usize>,
}

impl Poll {
    pub fn new() -> io::Result<Poll> {
        Ok(Poll {
            fds: Vec::new(),
            index: HashMap::new(),
        })
    }
}

impl Backend for Poll {
    fn register(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        if self.index.contains_key(&fd) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "fd already registered"));
        }

        let idx = self.fds.len();
        self.fds.push(libc::pollfd {
            fd,
            events: ioready_to_poll(interest),
            revents: 0,
        });
        self.index.insert(fd, idx);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        let idx = *self
            .index
            .get(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "fd not registered"))?;
        self.fds[idx].events = ioready_to_poll(interest);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        let idx = self
            .index
            .remove(&fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "fd not registered"))?;

        self.fds.swap_remove(idx);
        if idx < self.fds.len() {
            // swap_remove moved the last element into `idx`; fix its index.
            let moved_fd = self.fds[idx].fd;
            self.index.insert(moved_fd, idx);
        }
        Ok(())
    }

    fn wait(&mut self, max_events: usize, timeout: Option<Duration>) -> io::Result<Vec<RawEvent>> {
        let timeout_ms = timeout
            .map(|d| cmp::min(d.as_millis(), i32::MAX as u128) as c_int)
            .unwrap_or(-1);

        for pfd in &mut self.fds {
            pfd.revents = 0;
        }

        loop {
            match syscall!(poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms)) {
                Ok(_) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut out = Vec::new();
        for pfd in &self.fds {
            if pfd.revents != 0 {
                out.push(RawEvent {
                    fd: pfd.fd,
                    ready: poll_to_ioready(pfd.revents),
                });
                if out.len() >= max_events {
                    break;
                }
            }
        }
        Ok(out)
    }
}

fn ioready_to_poll(interest: Ready) -> c_short {
    let mut events = 0;
    if interest.is_readable() {
        events |= POLLIN;
    }
    if interest.is_writable() {
        events |= POLLOUT;
    }
    events as c_short
}

fn poll_to_ioready(revents: c_short) -> Ready {
    let revents = revents as c_int;
    let mut ready = Ready::empty();

    if (revents & POLLIN) != 0 {
        ready.insert(Ready::readable());
    }
    if (revents & POLLOUT) != 0 {
        ready.insert(Ready::writable());
    }
    if (revents & POLLERR) != 0 {
        ready.insert(Ready::error());
    }
    if (revents & POLLHUP) != 0 {
        ready.insert(Ready::hup());
    }

    ready
}
