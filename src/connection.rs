//! Per-socket state: write queue, partial-write bookkeeping, and the
//! interest mask currently registered with the backend.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use crate::handler::Handler;
use crate::reactor::{self, Reactor};
use crate::ready::Ready;
use crate::registry::ConnectionObject;
use crate::sys::socket::SocketExt;

/// Anything a [`Connection`] can own as its transport. Blanket-implemented
/// for every concrete socket type (`TcpStream`, `UnixStream`, ...) so the
/// reactor never has to know which one it's holding once it's boxed.
pub trait Socket: Read + Write + AsRawFd + fmt::Debug {}
impl<T: Read + Write + AsRawFd + fmt::Debug + ?Sized> Socket for T {}

/// One entry in a connection's write queue.
pub(crate) enum WriteItem<H> {
    Owned(Vec<u8>),
    Shared(Rc<[u8]>),
    Callback(Box<dyn FnOnce(&mut Connection<H>)>),
}

impl<H> WriteItem<H> {
    fn bytes(&self) -> Option<&[u8]> {
        match self {
            WriteItem::Owned(v) => Some(v.as_slice()),
            WriteItem::Shared(s) => Some(s.as_ref()),
            WriteItem::Callback(_) => None,
        }
    }

    /// What this item counts for against `write_buf_size`: its byte length
    /// for the two byte-carrying variants, or a flat `1` for a callback, so
    /// "is the queue empty" stays a single `== 0` comparison regardless of
    /// what's queued.
    fn queue_weight(&self) -> usize {
        match self {
            WriteItem::Callback(_) => 1,
            _ => self.bytes().map_or(0, |b| b.len()),
        }
    }
}

/// One write attempt's outcome, used to share the "what do I do with this
/// result" logic between the fast path and the queue drain loop.
enum WriteOutcome {
    Full,
    Partial(usize),
    WouldBlock,
    /// The connection closed itself in response to a hard error (or was
    /// already closed out from under us by a reentrant callback).
    Closed,
}

/// A registered, non-blocking socket plus its write queue and the handler
/// that reacts to its readiness events.
///
/// `H` is the only type parameter: the underlying socket is erased to
/// `Box<dyn Socket>` on construction. That costs one vtable indirection per
/// read/write syscall, but it keeps `Handler` (and the registry's
/// [`ConnectionObject`] dispatch) from having to thread a second type
/// parameter everywhere for what is, in the end, a handful of calls per
/// event.
pub struct Connection<H> {
    reactor: Reactor,
    sock: Option<Box<dyn Socket>>,
    fd: RawFd,
    handler: H,
    write_buf: VecDeque<WriteItem<H>>,
    write_buf_offset: usize,
    write_buf_size: usize,
    /// Byte chunks queued for protocol-level splicing via
    /// [`Connection::drain_read_buf_to`]; the core never populates this
    /// itself, only [`Connection::queue_read_ahead`] does.
    read_ahead: VecDeque<Vec<u8>>,
    closed: bool,
    watch: Ready,
}

impl<H: Handler> Connection<H> {
    /// Wrap `sock` (already connected/accepted), set it non-blocking, and
    /// register it with the backend for `ERR|HUP` only — hand the result to
    /// [`Connection::watch_read`] if the handler should start reading right
    /// away. Also inserts into the reactor's registry, under the type-erased
    /// [`crate::registry::ConnectionObject`] vtable the event loop dispatches
    /// through.
    pub fn new<S>(reactor: Reactor, sock: S, handler: H) -> io::Result<Rc<RefCell<Connection<H>>>>
    where
        S: Socket + 'static,
    {
        sock.set_nonblocking(true)?;
        let fd = sock.as_raw_fd();
        let watch = Ready::error() | Ready::hup();

        let conn = Connection {
            reactor: reactor.clone(),
            sock: Some(Box::new(sock)),
            fd,
            handler,
            write_buf: VecDeque::new(),
            write_buf_offset: 0,
            write_buf_size: 0,
            read_ahead: VecDeque::new(),
            closed: false,
            watch,
        };

        let rc = Rc::new(RefCell::new(conn));
        reactor.register(fd, watch)?;
        reactor.insert_connection(fd, rc.clone() as Rc<dyn ConnectionObject>);
        Ok(rc)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queue-pressure metric: the byte length of every byte item not yet
    /// transmitted, plus `1` per pending callback. Zero iff the queue is
    /// empty. The fast path never touches this counter for a write that
    /// fully succeeds without ever occupying a queue slot.
    pub fn write_buf_size(&self) -> usize {
        self.write_buf_size
    }

    pub fn sock(&self) -> Option<&dyn Socket> {
        self.sock.as_deref()
    }

    pub fn peer_addr_string(&self) -> Option<String> {
        self.sock.as_ref().and_then(|s| s.peer_addr_string())
    }

    pub fn set_tcp_cork(&self, cork: bool) -> io::Result<()> {
        match &self.sock {
            Some(sock) => sock.tcp_cork(cork),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "connection is closed")),
        }
    }

    /// Read directly from the socket, with the usual `std::io::Read`
    /// contract: `Ok(0)` means the peer has done an orderly shutdown,
    /// `Err(WouldBlock)` means nothing is available right now. The two are
    /// never conflated — a handler reacting to one where it meant the other
    /// is exactly the peer-reset bug this distinction exists to avoid.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let sock = self
            .sock
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))?;

        match sock.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::trace!("fd {}: read would block", self.fd);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Queue a byte chunk for later protocol-level splicing — the core
    /// never calls this itself, it's a building block for a handler that
    /// wants to buffer parsed frames ahead of relaying them elsewhere.
    pub fn queue_read_ahead(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.read_ahead.push_back(data);
        }
    }

    /// Move every queued read-ahead chunk onto `dest`'s write queue, in
    /// order, clearing this connection's read-ahead buffer as it goes.
    pub fn drain_read_buf_to<H2: Handler>(&mut self, dest: &mut Connection<H2>) -> io::Result<()> {
        while let Some(chunk) = self.read_ahead.pop_front() {
            dest.write(Some(&chunk))?;
        }
        Ok(())
    }

    /// Queue `data` (or flush the queue, when called with `None` — this is
    /// what the default `on_writable` does) and try to make progress
    /// immediately.
    ///
    /// Returns `true` if the queue is empty once this call returns (the
    /// write, or the whole backlog, is fully out the door), `false` if
    /// bytes are still pending and writable interest is now armed. A
    /// closed connection always answers `true` without touching the
    /// socket — the "lie" a caller that re-enters from a nested close is
    /// entitled to.
    ///
    /// With `Some(data)` on an empty queue, this takes the fast path: one
    /// direct `write` attempt, never occupying a queue slot if it fully
    /// succeeds. A hard write error (anything but `WouldBlock`) closes the
    /// connection and this call returns `false`, matching `close`'s own
    /// sentinel.
    pub fn write(&mut self, data: Option<&[u8]>) -> io::Result<bool> {
        if self.closed {
            return Ok(true);
        }

        if let Some(data) = data {
            if !data.is_empty() {
                if self.write_buf_size > 0 {
                    // Queue already has bytes ahead of this one: preserve
                    // order, don't attempt to write yet.
                    self.write_buf_size += data.len();
                    self.write_buf.push_back(WriteItem::Owned(data.to_vec()));
                    self.watch_write(true)?;
                } else {
                    return Ok(self.write_fast_path(data)?);
                }
            }
        } else {
            self.drain_queue()?;
        }

        Ok(self.write_buf_size == 0)
    }

    /// Queue a zero-copy write of an `Rc`-shared buffer, e.g. broadcasting
    /// the same payload to many connections without cloning it per-fd.
    pub fn write_shared(&mut self, data: Rc<[u8]>) -> io::Result<()> {
        if self.closed || data.is_empty() {
            return Ok(());
        }
        self.write_buf_size += data.len();
        self.write_buf.push_back(WriteItem::Shared(data));
        self.watch_write(true)
    }

    /// Queue a callback to run inline, in write order, once every write
    /// ahead of it in the queue has drained. Invoked synchronously exactly
    /// once, the moment it reaches the head of the queue. Counts as `1`
    /// against `write_buf_size`, the same as a byte item counts its length.
    pub fn write_callback<F>(&mut self, callback: F) -> io::Result<()>
    where
        F: FnOnce(&mut Connection<H>) + 'static,
    {
        if self.closed {
            return Ok(());
        }
        self.write_buf_size += 1;
        self.write_buf.push_back(WriteItem::Callback(Box::new(callback)));
        self.watch_write(true)
    }

    /// Attempt one write, with nothing queued yet. A full write returns
    /// immediately without ever touching the queue. Anything else — a
    /// partial write, `WouldBlock`, or a hard error — falls through to the
    /// same bookkeeping the queue drain loop uses for its head item.
    fn write_fast_path(&mut self, data: &[u8]) -> io::Result<bool> {
        match self.try_write_once(data) {
            WriteOutcome::Full => Ok(true),
            WriteOutcome::WouldBlock => {
                self.write_buf_size += data.len();
                self.write_buf.push_back(WriteItem::Owned(data.to_vec()));
                self.watch_write(true)?;
                Ok(false)
            }
            WriteOutcome::Partial(written) => {
                let remainder = data[written..].to_vec();
                self.write_buf_size += remainder.len();
                self.write_buf.push_back(WriteItem::Owned(remainder));
                self.watch_write(true)?;
                Ok(false)
            }
            WriteOutcome::Closed => Ok(false),
        }
    }

    /// One non-blocking write attempt against the live socket. A hard error
    /// (anything but `WouldBlock`) closes the connection itself, logging at
    /// `debug!` for an ordinary peer-termination error and `warn!` (gated by
    /// [`crate::reactor::debug_level`]) for anything else, matching the
    /// "unexpected socket errors" tier.
    fn try_write_once(&mut self, buf: &[u8]) -> WriteOutcome {
        let sock = match self.sock.as_mut() {
            Some(sock) => sock,
            None => return WriteOutcome::Closed,
        };

        match sock.write(buf) {
            Ok(n) if n == buf.len() => WriteOutcome::Full,
            Ok(n) => WriteOutcome::Partial(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => WriteOutcome::WouldBlock,
            Err(e) if matches!(e.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset) => {
                log::debug!("fd {}: peer reset during write ({e})", self.fd);
                self.close("peer_reset");
                WriteOutcome::Closed
            }
            Err(e) => {
                if reactor::debug_level() >= 1 {
                    log::warn!("fd {}: write error ({e})", self.fd);
                }
                self.close("write_error");
                WriteOutcome::Closed
            }
        }
    }

    /// Drain as much of the queue as the socket will currently accept.
    /// Stops at the first `WouldBlock` (leaving the offset where it is, to
    /// resume on the next writable event) or when the queue empties.
    /// Callback items are popped and invoked the instant they reach the
    /// head, regardless of socket writability; a callback may reentrantly
    /// call `write`, whose new data lands behind whatever is still queued.
    fn drain_queue(&mut self) -> io::Result<()> {
        loop {
            let item = match self.write_buf.front() {
                Some(item) => item,
                None => break,
            };

            if let WriteItem::Callback(_) = item {
                let item = self.write_buf.pop_front().unwrap();
                self.write_buf_size = self.write_buf_size.saturating_sub(1);
                if let WriteItem::Callback(cb) = item {
                    cb(self);
                }
                if self.closed {
                    break;
                }
                continue;
            }

            let full_len = item.queue_weight();
            let offset = self.write_buf_offset;

            // full_len/offset are copied out above so this reborrow of
            // write_buf doesn't overlap the mutable borrow of sock inside
            // try_write_once.
            let outcome = {
                let item = self.write_buf.front().expect("checked above");
                let bytes = item.bytes().expect("non-callback item has bytes");
                let chunk = bytes[offset..].to_vec();
                self.try_write_once(&chunk)
            };

            match outcome {
                WriteOutcome::Full => {
                    // Only `full_len - offset` is still outstanding here:
                    // any prior partial write on this same item already
                    // subtracted its share.
                    self.write_buf.pop_front();
                    self.write_buf_offset = 0;
                    self.write_buf_size = self.write_buf_size.saturating_sub(full_len - offset);
                }
                WriteOutcome::Partial(n) => {
                    self.write_buf_offset += n;
                    self.write_buf_size = self.write_buf_size.saturating_sub(n);
                    break;
                }
                WriteOutcome::WouldBlock => break,
                WriteOutcome::Closed => break,
            }
        }

        if self.closed {
            return Ok(());
        }
        self.watch_write(!self.write_buf.is_empty())
    }

    /// Enable or disable readable interest, leaving every other bit of the
    /// mask untouched — `watch_read(true)` then `watch_read(false)` always
    /// returns the mask to exactly what it was before.
    pub fn watch_read(&mut self, enable: bool) -> io::Result<()> {
        if enable {
            self.watch.insert(Ready::readable());
        } else {
            self.watch.remove(Ready::readable());
        }
        self.update_interest()
    }

    pub fn watch_write(&mut self, enable: bool) -> io::Result<()> {
        if enable {
            self.watch.insert(Ready::writable());
        } else {
            self.watch.remove(Ready::writable());
        }
        self.update_interest()
    }

    fn update_interest(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        if let Err(e) = self.reactor.modify(self.fd, self.watch) {
            log::warn!("fd {}: failed to update interest mask ({e})", self.fd);
        }
        Ok(())
    }

    /// Mark the connection closed and hand the live socket off to the
    /// reactor's deferred-close list. The fd is unregistered from the
    /// backend and the registry right away (no further events will be
    /// dispatched for it), but the socket itself — and the OS-level close
    /// that dropping it performs — is kept alive until the reactor finishes
    /// the current dispatch batch, so a fresh `accept()` in the same batch
    /// can't be handed the same fd number. The write queue is cleared here
    /// too, breaking any reference cycle a queued callback held back into
    /// this connection.
    ///
    /// Idempotent, and always returns `false`, so callers can write
    /// `return conn.close("reason")` from inside a function returning
    /// `bool`.
    pub fn close(&mut self, reason: &str) -> bool {
        if self.closed {
            return false;
        }
        log::debug!("fd {}: closing ({reason})", self.fd);
        self.closed = true;
        self.write_buf.clear();
        self.write_buf_offset = 0;
        self.write_buf_size = 0;

        let _ = self.reactor.unregister(self.fd);
        if let Some(sock) = self.sock.take() {
            self.reactor.defer_close(sock);
        }
        false
    }
}

impl<H: Handler> ConnectionObject for RefCell<Connection<H>> {
    fn fd(&self) -> RawFd {
        self.borrow().fd
    }

    fn is_closed(&self) -> bool {
        self.borrow().closed
    }

    fn dispatch_read(&self) {
        if self.borrow().closed {
            return;
        }
        let mut this = self.borrow_mut();
        H::on_readable(&mut this);
    }

    fn dispatch_write(&self) {
        if self.borrow().closed {
            return;
        }
        let mut this = self.borrow_mut();
        H::on_writable(&mut this);
    }

    fn dispatch_err(&self) {
        if self.borrow().closed {
            return;
        }
        let mut this = self.borrow_mut();
        H::on_error(&mut this);
    }

    fn dispatch_hup(&self) {
        if self.borrow().closed {
            return;
        }
        let mut this = self.borrow_mut();
        H::on_hangup(&mut this);
    }
}

impl<H> fmt::Debug for Connection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("closed", &self.closed)
            .field("write_buf_size", &self.write_buf_size)
            .field("watch", &self.watch)
            .finish()
    }
}

impl<H> fmt::Display for Connection<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.closed { "closed" } else { "open" };
        match self.sock.as_ref().and_then(|s| s.peer_addr_string()) {
            Some(addr) => write!(f, "Connection: ({state}) to {addr}"),
            None => write!(f, "Connection: ({state})"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reactor::Reactor;
    use std::os::unix::net::UnixStream;

    struct Echo;

    impl Handler for Echo {
        fn on_readable(conn: &mut Connection<Self>) {
            let mut buf = [0u8; 64];
            match conn.read(&mut buf) {
                Ok(0) => {
                    conn.close("eof");
                }
                Ok(n) => {
                    let _ = conn.write(Some(&buf[..n]));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => {
                    conn.close("read_error");
                }
            }
        }
    }

    fn new_pair(reactor: Reactor) -> (Rc<RefCell<Connection<Echo>>>, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let conn = Connection::new(reactor, a, Echo).unwrap();
        (conn, b)
    }

    #[test]
    fn fast_path_write_does_not_touch_queue_pressure() {
        let reactor = Reactor::new().unwrap();
        let (conn, _peer) = new_pair(reactor);

        let drained = conn.borrow_mut().write(Some(b"hello")).unwrap();
        assert!(drained);
        assert_eq!(conn.borrow().write_buf_size(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let reactor = Reactor::new().unwrap();
        let (conn, _peer) = new_pair(reactor);

        assert!(!conn.borrow_mut().close("test"));
        assert!(!conn.borrow_mut().close("test again"));
        assert!(conn.borrow().is_closed());
    }

    #[test]
    fn write_on_closed_connection_lies() {
        let reactor = Reactor::new().unwrap();
        let (conn, _peer) = new_pair(reactor);

        conn.borrow_mut().close("test");
        let result = conn.borrow_mut().write(Some(b"too late")).unwrap();
        assert!(result);
    }

    #[test]
    fn callback_counts_one_against_queue_pressure() {
        let reactor = Reactor::new().unwrap();
        let (conn, _peer) = new_pair(reactor);

        // Force the queue non-empty first so the callback doesn't take the
        // fast path and run immediately.
        conn.borrow_mut().write_buf_size = 1;
        conn.borrow_mut().write_buf.push_back(WriteItem::Owned(vec![0u8; 1]));

        conn.borrow_mut().write_callback(|_c| {}).unwrap();
        assert_eq!(conn.borrow().write_buf_size(), 2);
    }
}
