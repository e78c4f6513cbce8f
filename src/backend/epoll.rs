use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, mem};

use libc::{c_int, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use super::{Backend, RawEvent};
use crate::ready::Ready;

#[derive(Debug)]
pub(super) struct Epoll {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll {
            epfd,
            events: Vec::with_capacity(256),
        })
    }

    fn ctl(&self, op: c_int, fd: RawFd, interest: Ready) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: ioevent_to_epoll(interest),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.epfd, op, fd, &mut event))?;
        Ok(())
    }
}

impl Backend for Epoll {
    fn register(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
    }

    fn modify(&mut self, fd: RawFd, interest: Ready) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        // EPOLL_CTL_DEL ignores the event argument, but the kernel still
        // requires a valid pointer on pre-2.6.9 kernels. Passing a zeroed
        // struct (rather than the connection's last-known interest mask)
        // avoids stale bits from ever reaching epoll_ctl on delete.
        let mut event: libc::epoll_event = unsafe { mem::zeroed() };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut event))?;
        Ok(())
    }

    fn wait(&mut self, max_events: usize, timeout: Option<Duration>) -> io::Result<Vec<RawEvent>> {
        if self.events.capacity() < max_events {
            self.events.reserve(max_events - self.events.capacity());
        }

        let timeout_ms = timeout
            .map(|d| cmp::min(d.as_millis(), c_int::MAX as u128) as c_int)
            .unwrap_or(-1);

        let n = loop {
            match syscall!(epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.capacity().min(max_events) as c_int,
                timeout_ms
            )) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };

        unsafe { self.events.set_len(n as usize) };

        Ok(self
            .events
            .iter()
            .map(|event| RawEvent {
                fd: event.u64 as RawFd,
                ready: epoll_to_ioready(event.events as c_int),
            })
            .collect())
    }
}

fn ioevent_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;
    if interest.is_readable() {
        kind |= EPOLLIN;
    }
    if interest.is_writable() {
        kind |= EPOLLOUT;
    }
    // ERR/HUP are implicit in epoll and always reported; no bit to request.
    kind as u32
}

fn epoll_to_ioready(epoll: c_int) -> Ready {
    let mut ready = Ready::empty();

    if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
        ready.insert(Ready::readable());
    }
    if (epoll & EPOLLOUT) != 0 {
        ready.insert(Ready::writable());
    }
    if (epoll & EPOLLERR) != 0 {
        ready.insert(Ready::error());
    }
    if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
        ready.insert(Ready::hup());
    }

    ready
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

