//! The event loop: owns the backend, the descriptor registry, and the
//! deferred-close list, and drives readiness batches into handler calls.

use std::cell::RefCell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use crate::backend::{self, Backend};
use crate::connection::Socket;
use crate::ready::Ready;
use crate::registry::{ConnectionObject, Registry};
use crate::waker::Waker;

static DEBUG_LEVEL: AtomicI32 = AtomicI32::new(0);

/// Get the current global verbosity gate. Unexpected-but-survivable I/O
/// errors only get a `warn!` once this is at least `1`; below that they're
/// logged at `debug!`. Mirrors a class-level knob rather than a per-reactor
/// one, since it's meant to be flipped once for a whole process (e.g. from
/// an env var at startup).
pub fn debug_level() -> i32 {
    DEBUG_LEVEL.load(Ordering::Relaxed)
}

pub fn set_debug_level(level: i32) {
    DEBUG_LEVEL.store(level, Ordering::Relaxed);
}

/// Tuning knobs for a [`Reactor`], applied once at construction.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    max_events: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig { max_events: 1024 }
    }
}

impl ReactorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap on how many ready fds a single `wait` call returns. Hitting the
    /// cap just means the remainder show up on the next `wait`; this bounds
    /// per-iteration latency, not throughput.
    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn build(self) -> std::io::Result<Reactor> {
        Reactor::with_config(self)
    }
}

struct Inner {
    backend: Box<dyn Backend>,
    registry: Registry,
    deferred_close: Vec<Box<dyn Socket>>,
    waker: Waker,
    max_events: usize,
    shutdown: bool,
}

/// The event loop handle. Cheap to clone (an `Rc` bump) — every
/// [`Connection`](crate::connection::Connection) holds one so it can
/// re-arm its own interest mask and hand off its socket for deferred
/// closing.
///
/// Not `Send`/`Sync`: the whole design leans on `Rc`/`RefCell` instead of
/// `Arc`/`Mutex`, so a `Reactor` (and everything registered with it) is
/// pinned to the thread that created it by construction, not convention.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<Inner>>,
}

impl Reactor {
    pub fn new() -> std::io::Result<Reactor> {
        ReactorConfig::default().build()
    }

    fn with_config(config: ReactorConfig) -> std::io::Result<Reactor> {
        let backend = backend::detect()?;
        let waker = Waker::new()?;

        let mut inner = Inner {
            backend,
            registry: Registry::new(),
            deferred_close: Vec::new(),
            waker: waker.clone(),
            max_events: config.max_events,
            shutdown: false,
        };

        let waker_fd = waker.as_raw_fd();
        inner.backend.register(waker_fd, Ready::readable())?;
        inner.registry.foreign_insert(
            waker_fd,
            Box::new(move |_ready| {
                let _ = waker.drain();
            }),
        );

        Ok(Reactor {
            inner: Rc::new(RefCell::new(inner)),
        })
    }

    /// Answers spec's `HaveEpoll()`.
    pub fn have_epoll(&self) -> bool {
        backend::have_epoll()
    }

    /// `DescriptorMap()`: the fds of all live connections, in registration
    /// order.
    pub fn watched_sockets(&self) -> Vec<RawFd> {
        self.inner.borrow().registry.descriptor_map()
    }

    /// The fds currently sitting in the deferred-close list, waiting for
    /// the dispatch batch that's closing them to finish.
    pub fn to_close(&self) -> Vec<RawFd> {
        self.inner
            .borrow()
            .deferred_close
            .iter()
            .map(|s| s.as_raw_fd())
            .collect()
    }

    /// `OtherFds()`: the foreign (non-`Connection`) fds currently watched.
    pub fn other_fds(&self) -> Vec<RawFd> {
        self.inner.borrow().registry.foreign_fds().collect()
    }

    /// `WatchedSockets()`'s count: the number of live connections, without
    /// allocating the full `descriptor_map()` snapshot.
    pub fn watched_sockets_count(&self) -> usize {
        self.inner.borrow().registry.len()
    }

    /// Watch `fd` directly, outside the `Connection`/`Handler` machinery,
    /// invoking `callback` with its readiness on every batch it appears in.
    pub fn watch_other_fd<F>(&self, fd: RawFd, interest: Ready, callback: F) -> std::io::Result<()>
    where
        F: FnMut(Ready) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        inner.backend.register(fd, interest)?;
        inner.registry.foreign_insert(fd, Box::new(callback));
        Ok(())
    }

    pub fn unwatch_other_fd(&self, fd: RawFd) -> std::io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.registry.foreign_remove(fd);
        inner.backend.unregister(fd)
    }

    pub(crate) fn register(&self, fd: RawFd, interest: Ready) -> std::io::Result<()> {
        self.inner.borrow_mut().backend.register(fd, interest)
    }

    pub(crate) fn modify(&self, fd: RawFd, interest: Ready) -> std::io::Result<()> {
        self.inner.borrow_mut().backend.modify(fd, interest)
    }

    pub(crate) fn unregister(&self, fd: RawFd) -> std::io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.registry.remove(fd);
        inner.backend.unregister(fd)
    }

    pub(crate) fn insert_connection(&self, fd: RawFd, conn: Rc<dyn ConnectionObject>) {
        self.inner.borrow_mut().registry.insert(fd, conn);
    }

    pub(crate) fn defer_close(&self, sock: Box<dyn Socket>) {
        self.inner.borrow_mut().deferred_close.push(sock);
    }

    /// Request that [`Reactor::run`] return after finishing the batch
    /// currently in flight (or immediately, if it's blocked in `wait`).
    pub fn shutdown(&self) -> std::io::Result<()> {
        self.inner.borrow_mut().shutdown = true;
        self.inner.borrow().waker.wakeup()
    }

    /// Run until [`Reactor::shutdown`] is called.
    pub fn run(&self) -> std::io::Result<()> {
        loop {
            self.run_once(None)?;
            if self.inner.borrow().shutdown {
                return Ok(());
            }
        }
    }

    /// Block for up to `timeout` (or forever, if `None`), dispatch whatever
    /// readiness batch that produces, and return the number of fds that
    /// were ready. A return of `0` just means the timeout elapsed.
    pub fn run_once(&self, timeout: Option<Duration>) -> std::io::Result<usize> {
        let max_events = self.inner.borrow().max_events;
        let batch = self.inner.borrow_mut().backend.wait(max_events, timeout)?;

        for event in &batch {
            self.dispatch_one(event.fd, event.ready);
        }

        let mut inner = self.inner.borrow_mut();
        inner.deferred_close.clear();

        Ok(batch.len())
    }

    fn dispatch_one(&self, fd: RawFd, ready: Ready) {
        let conn = self.inner.borrow().registry.get(fd).cloned();

        if let Some(conn) = conn {
            // Fixed order within one event entry: readable, writable, error,
            // hangup — each gated by a fresh staleness check, since an
            // earlier dispatch in this list may have closed the connection.
            if ready.is_readable() && !conn.is_closed() {
                conn.dispatch_read();
            }
            if ready.is_writable() && !conn.is_closed() {
                conn.dispatch_write();
            }
            if ready.is_error() && !conn.is_closed() {
                conn.dispatch_err();
            }
            if ready.is_hup() && !conn.is_closed() {
                conn.dispatch_hup();
            }
            return;
        }

        let mut inner = self.inner.borrow_mut();
        if let Some(callback) = inner.registry.foreign_get_mut(fd) {
            callback(ready);
            return;
        }
        drop(inner);

        log::warn!("fd {fd} reported ready but is not registered with this reactor");
    }

    /// `OtherFds(map)`'s replace half: swap out every foreign fd currently
    /// watched for `new_entries`, unregistering the old ones from the
    /// backend and registering the new ones with their given interest.
    /// Returns the fds that were being watched before the swap.
    pub fn replace_other_fds<I>(&self, new_entries: I) -> Vec<RawFd>
    where
        I: IntoIterator<Item = (RawFd, Ready, Box<dyn FnMut(Ready)>)>,
    {
        let mut inner = self.inner.borrow_mut();

        let old_fds: Vec<RawFd> = inner.registry.foreign_fds().collect();
        for fd in &old_fds {
            let _ = inner.backend.unregister(*fd);
        }
        let _ = inner.registry.replace_foreign(indexmap::IndexMap::new());

        for (fd, interest, callback) in new_entries {
            if let Err(e) = inner.backend.register(fd, interest) {
                log::warn!("fd {fd}: failed to register foreign fd ({e})");
                continue;
            }
            inner.registry.foreign_insert(fd, callback);
        }

        old_fds
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::Connection;
    use crate::handler::Handler;
    use std::cell::RefCell as StdRefCell;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc as StdRc;

    struct Collect(StdRc<StdRefCell<Vec<u8>>>);

    impl Handler for Collect {
        fn on_readable(conn: &mut Connection<Self>) {
            let mut buf = [0u8; 256];
            if let Ok(n) = conn.read(&mut buf) {
                conn.handler().0.borrow_mut().extend_from_slice(&buf[..n]);
            }
        }
    }

    #[test]
    fn run_once_dispatches_a_readable_connection() {
        let reactor = Reactor::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let received = StdRc::new(StdRefCell::new(Vec::new()));
        let conn = Connection::new(reactor.clone(), a, Collect(received.clone())).unwrap();
        conn.borrow_mut().watch_read(true).unwrap();

        b.write_all(b"ping").unwrap();

        let n = reactor.run_once(Some(Duration::from_secs(2))).unwrap();
        assert!(n >= 1);
        assert_eq!(&received.borrow()[..], b"ping");
    }

    #[test]
    fn shutdown_wakes_a_blocked_run() {
        let reactor = Reactor::new().unwrap();
        reactor.shutdown().unwrap();
        reactor.run().unwrap();
    }
}
