//! A self-pipe (backed by `eventfd(2)`) used to break the event loop out of
//! an indefinite `wait` from outside the loop itself.
//!
//! The source this crate generalizes has no clean shutdown path — its event
//! loop calls `epoll_wait` with an infinite timeout and the process just
//! `exit()`s. `Waker` plugs that gap: it is registered like any other
//! foreign fd, and a `wakeup()` call from anywhere (a signal handler, a
//! timer thread, a drop guard) makes the next `wait` return promptly.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use crate::sys::eventfd::EventFd;

#[derive(Debug, Clone)]
pub struct Waker {
    inner: Rc<EventFd>,
}

impl Waker {
    pub fn new() -> io::Result<Waker> {
        Ok(Waker {
            inner: Rc::new(EventFd::new()?),
        })
    }

    /// Make the next (or in-progress) `wait` return. Idempotent: calling it
    /// several times before the loop drains the eventfd coalesces into one
    /// wakeup, since the counter just accumulates.
    pub fn wakeup(&self) -> io::Result<()> {
        match self.inner.write(1) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drain the counter after observing the wakeup, so the fd goes back to
    /// not-readable until the next `wakeup()`.
    pub fn drain(&self) -> io::Result<()> {
        match self.inner.read() {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use super::Waker;

    #[test]
    fn wakeup_then_drain() {
        let waker = Waker::new().unwrap();
        waker.wakeup().unwrap();
        waker.wakeup().unwrap();
        waker.drain().unwrap();
    }
}
