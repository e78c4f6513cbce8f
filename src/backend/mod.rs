//! The readiness backend: the one piece of the reactor that differs between
//! a scalable, edge-capable kernel facility (`epoll`) and a portable
//! fallback (`poll`). Both expose the same four-operation contract so the
//! rest of the crate never has to know which one is live.

mod epoll;
mod poll;

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::OnceLock;
use std::time::Duration;

use crate::ready::Ready;

/// One `(fd, readiness)` pair out of a `wait` batch.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct RawEvent {
    pub fd: RawFd,
    pub ready: Ready,
}

/// Register/modify/unregister-an-fd-with-an-interest-mask, and
/// wait-for-ready-events. Implemented by [`epoll::Epoll`] and
/// [`poll::Poll`]; level-triggered in both, per spec.
pub(crate) trait Backend: fmt::Debug {
    /// Begin tracking `fd` with `interest`. Errors if `fd` is already
    /// registered.
    fn register(&mut self, fd: RawFd, interest: Ready) -> io::Result<()>;

    /// Change the interest mask for an already-registered `fd`.
    fn modify(&mut self, fd: RawFd, interest: Ready) -> io::Result<()>;

    /// Stop tracking `fd`.
    fn unregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block until at least one fd is ready or `timeout` elapses (`None`
    /// blocks forever). Returns the ready batch; partial batches are
    /// normal, not every ready fd is guaranteed to appear in one call.
    fn wait(&mut self, max_events: usize, timeout: Option<Duration>) -> io::Result<Vec<RawEvent>>;
}

/// Which backend this process ended up using. Chosen once, lazily, at the
/// first `Reactor`/`Connection` construction, and never revisited.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BackendKind {
    Epoll,
    Poll,
}

static SELECTED: OnceLock<BackendKind> = OnceLock::new();

/// Which backend is in use for this process. Answers spec's `HaveEpoll()`.
pub fn have_epoll() -> bool {
    SELECTED.get().copied().unwrap_or(BackendKind::Epoll) == BackendKind::Epoll
}

/// Build the process's one readiness backend: try `epoll_create1` first,
/// fall back to `poll(2)` if the kernel doesn't have it (or any other
/// reason `epoll::Epoll::new` fails). The selection sticks for the life of
/// the process.
pub(crate) fn detect() -> io::Result<Box<dyn Backend>> {
    match epoll::Epoll::new() {
        Ok(backend) => {
            let _ = SELECTED.set(BackendKind::Epoll);
            Ok(Box::new(backend))
        }
        Err(e) => {
            log::warn!("epoll unavailable ({e}), falling back to poll(2)");
            let backend = poll::Poll::new()?;
            let _ = SELECTED.set(BackendKind::Poll);
            Ok(Box::new(backend))
        }
    }
}

/// Force the portable fallback regardless of epoll availability — used by
/// tests exercising spec scenario 6 ("backend fallback").
#[cfg(test)]
pub(crate) fn force_poll_backend() -> io::Result<Box<dyn Backend>> {
    Ok(Box::new(poll::Poll::new()?))
}

#[cfg(test)]
mod contract_tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn exercise(mut backend: Box<dyn Backend>) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();

        backend.register(a.as_raw_fd(), Ready::readable()).unwrap();

        // Nothing written yet: a short wait should time out with no events.
        let batch = backend.wait(16, Some(Duration::from_millis(20))).unwrap();
        assert!(batch.iter().all(|e| e.fd != a.as_raw_fd()));

        use std::io::Write;
        let mut b = b;
        b.write_all(b"x").unwrap();

        let batch = backend.wait(16, Some(Duration::from_secs(5))).unwrap();
        assert!(batch.iter().any(|e| e.fd == a.as_raw_fd() && e.ready.is_readable()));

        backend.modify(a.as_raw_fd(), Ready::writable()).unwrap();
        backend.unregister(a.as_raw_fd()).unwrap();
    }

    #[test]
    fn epoll_satisfies_contract() {
        exercise(Box::new(epoll::Epoll::new().unwrap()));
    }

    #[test]
    fn poll_fallback_satisfies_contract() {
        exercise(force_poll_backend().unwrap());
    }
}
