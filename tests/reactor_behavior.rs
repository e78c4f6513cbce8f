//! End-to-end scenarios exercising the reactor against real socketpairs.
//! Backend fallback (poll vs. epoll) isn't re-run here since it has no
//! public switch; it's covered in-crate by `backend::contract_tests`.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use reactor_io::{Connection, Handler, Reactor, Ready};

struct NoOp;
impl Handler for NoOp {
    fn on_readable(_conn: &mut Connection<Self>) {}
}

#[test]
fn single_small_write_drains_immediately() {
    let reactor = Reactor::new().unwrap();
    let (a, mut b) = UnixStream::pair().unwrap();
    let conn = Connection::new(reactor, a, NoOp).unwrap();

    let drained = conn.borrow_mut().write(Some(b"hello")).unwrap();
    assert!(drained);
    assert_eq!(conn.borrow().write_buf_size(), 0);

    let mut buf = [0u8; 5];
    b.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");
}

#[test]
fn queued_write_under_pressure_drains_over_multiple_pumps() {
    let reactor = Reactor::new().unwrap();
    let (a, b) = UnixStream::pair().unwrap();
    let conn = Connection::new(reactor.clone(), a, NoOp).unwrap();

    let payload = vec![0xABu8; 1024 * 1024];
    let drained = conn.borrow_mut().write(Some(&payload)).unwrap();

    // A unix socketpair's default buffer is nowhere near 1 MiB, so this
    // should queue rather than complete on the first attempt.
    assert!(!drained);
    assert!(conn.borrow().write_buf_size() > 0);

    let received = Rc::new(RefCell::new(Vec::new()));
    let peer_handle = {
        let received = received.clone();
        std::thread::spawn(move || {
            let mut b = b;
            let mut buf = [0u8; 64 * 1024];
            let mut total = Vec::new();
            loop {
                match b.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => total.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
                if total.len() >= 1024 * 1024 {
                    break;
                }
            }
            *received.borrow_mut() = total;
        })
    };

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while conn.borrow().write_buf_size() > 0 && std::time::Instant::now() < deadline {
        reactor.run_once(Some(Duration::from_millis(100))).unwrap();
    }

    assert_eq!(conn.borrow().write_buf_size(), 0);
    drop(conn);
    peer_handle.join().unwrap();
    assert_eq!(received.borrow().len(), payload.len());
    assert!(received.borrow().iter().all(|&b| b == 0xAB));
}

#[test]
fn callback_fires_once_between_surrounding_writes() {
    let reactor = Reactor::new().unwrap();
    let (a, mut b) = UnixStream::pair().unwrap();
    let conn = Connection::new(reactor, a, NoOp).unwrap();

    let fired = Rc::new(RefCell::new(0u32));
    {
        let fired = fired.clone();
        let mut c = conn.borrow_mut();
        // Force queueing so the callback doesn't run inline on the fast
        // path before "B" is appended behind it.
        c.write(Some(b"A")).unwrap();
        c.write_callback(move |_conn| {
            *fired.borrow_mut() += 1;
        })
        .unwrap();
        c.write(Some(b"B")).unwrap();
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while conn.borrow().write_buf_size() > 0 && std::time::Instant::now() < deadline {
        conn.borrow_mut().write(None).unwrap();
    }

    assert_eq!(*fired.borrow(), 1);

    let mut buf = [0u8; 2];
    b.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"AB");
}

#[test]
fn close_is_idempotent_and_later_write_returns_the_lie() {
    let reactor = Reactor::new().unwrap();
    let (a, _b) = UnixStream::pair().unwrap();
    let conn = Connection::new(reactor, a, NoOp).unwrap();

    assert!(!conn.borrow_mut().close("test"));
    assert!(!conn.borrow_mut().close("test"));
    assert!(conn.borrow().is_closed());

    let result = conn.borrow_mut().write(Some(b"too late")).unwrap();
    assert!(result);
    assert_eq!(conn.borrow().write_buf_size(), 0);
}

#[test]
fn deferred_close_keeps_fd_alive_for_rest_of_batch() {
    struct CloseOnRead {
        other_fd: Rc<RefCell<Option<i32>>>,
        closed_fd_still_open: Rc<RefCell<bool>>,
    }

    impl Handler for CloseOnRead {
        fn on_readable(conn: &mut Connection<Self>) {
            let mut buf = [0u8; 16];
            let _ = conn.read(&mut buf);
            let fd = conn.fd();
            conn.close("batch_test");

            // Still a valid fd at the OS level: fcntl(F_GETFD) succeeds.
            let still_open = unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1;
            *conn.handler().closed_fd_still_open.borrow_mut() = still_open;
            let _ = conn.handler().other_fd;
        }
    }

    let reactor = Reactor::new().unwrap();
    let (a1, mut b1) = UnixStream::pair().unwrap();
    let (a2, _b2) = UnixStream::pair().unwrap();

    let closed_fd_still_open = Rc::new(RefCell::new(false));
    let other_fd = Rc::new(RefCell::new(None));

    let c1 = Connection::new(
        reactor.clone(),
        a1,
        CloseOnRead {
            other_fd: other_fd.clone(),
            closed_fd_still_open: closed_fd_still_open.clone(),
        },
    )
    .unwrap();
    c1.borrow_mut().watch_read(true).unwrap();
    let c1_fd = c1.borrow().fd();

    let c2 = Connection::new(reactor.clone(), a2, NoOp).unwrap();
    c2.borrow_mut().watch_read(true).unwrap();

    b1.write_all(b"x").unwrap();

    reactor.run_once(Some(Duration::from_secs(2))).unwrap();

    assert!(*closed_fd_still_open.borrow());
    assert!(!reactor.watched_sockets().contains(&c1_fd));
    assert!(!reactor.to_close().contains(&c1_fd));
    assert!(c1.borrow().is_closed());
    let _ = c2.borrow().fd();
}

#[test]
fn byte_ordering_survives_a_partial_write_with_a_trailing_item() {
    // Regression test: write_buf_size must only reach 0 once every queued
    // item, including one that straddled a partial write, is fully out.
    // If it reaches 0 early, a write() issued right after would take the
    // fast path and land ahead of bytes still sitting in the queue.
    let reactor = Reactor::new().unwrap();
    let (a, b) = UnixStream::pair().unwrap();
    let conn = Connection::new(reactor.clone(), a, NoOp).unwrap();

    let a_payload = vec![0xAAu8; 1024 * 1024];
    conn.borrow_mut().write(Some(&a_payload)).unwrap();
    conn.borrow_mut().write(Some(b"BBBBBBBBBB")).unwrap();
    assert!(conn.borrow().write_buf_size() > 0);

    let received = Rc::new(RefCell::new(Vec::new()));
    let peer_handle = {
        let received = received.clone();
        std::thread::spawn(move || {
            let mut b = b;
            let mut buf = [0u8; 64 * 1024];
            let mut total = Vec::new();
            loop {
                match b.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => total.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
                if total.len() >= 1024 * 1024 + 20 {
                    break;
                }
            }
            *received.borrow_mut() = total;
        })
    };

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while conn.borrow().write_buf_size() > 0 && std::time::Instant::now() < deadline {
        reactor.run_once(Some(Duration::from_millis(100))).unwrap();
    }
    assert_eq!(conn.borrow().write_buf_size(), 0);

    // Issued the instant the queue reports empty: must land strictly after
    // "B", never spliced in ahead of it.
    conn.borrow_mut().write(Some(b"CCCCCCCCCC")).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while conn.borrow().write_buf_size() > 0 && std::time::Instant::now() < deadline {
        reactor.run_once(Some(Duration::from_millis(100))).unwrap();
    }

    drop(conn);
    peer_handle.join().unwrap();

    let total = received.borrow();
    assert_eq!(total.len(), 1024 * 1024 + 20);
    assert_eq!(&total[1024 * 1024..], b"BBBBBBBBBBCCCCCCCCCC");
}

#[test]
fn watched_sockets_count_tracks_live_connections() {
    let reactor = Reactor::new().unwrap();
    assert_eq!(reactor.watched_sockets_count(), 0);

    let (a, _b) = UnixStream::pair().unwrap();
    let conn = Connection::new(reactor.clone(), a, NoOp).unwrap();
    assert_eq!(reactor.watched_sockets_count(), 1);
    assert_eq!(reactor.watched_sockets_count(), reactor.watched_sockets().len());

    conn.borrow_mut().close("test");
    assert_eq!(reactor.watched_sockets_count(), 0);
}

#[test]
fn replace_other_fds_swaps_the_foreign_fd_map() {
    let reactor = Reactor::new().unwrap();
    let (a1, mut b1) = UnixStream::pair().unwrap();
    let (a2, mut b2) = UnixStream::pair().unwrap();

    let fired = Rc::new(RefCell::new(Vec::new()));
    let fired_for_first = fired.clone();
    reactor
        .watch_other_fd(a1.as_raw_fd(), Ready::readable(), move |_ready| {
            fired_for_first.borrow_mut().push(1);
        })
        .unwrap();
    assert_eq!(reactor.other_fds(), vec![a1.as_raw_fd()]);

    let fired_for_second = fired.clone();
    let old = reactor.replace_other_fds(vec![(
        a2.as_raw_fd(),
        Ready::readable(),
        Box::new(move |_ready: Ready| {
            fired_for_second.borrow_mut().push(2);
        }) as Box<dyn FnMut(Ready)>,
    )]);
    assert_eq!(old, vec![a1.as_raw_fd()]);
    assert_eq!(reactor.other_fds(), vec![a2.as_raw_fd()]);

    b1.write_all(b"x").unwrap();
    b2.write_all(b"y").unwrap();
    reactor.run_once(Some(Duration::from_secs(2))).unwrap();

    // Only the fd that survived the swap should have fired.
    assert_eq!(*fired.borrow(), vec![2]);
}

#[test]
fn peer_reset_surfaces_as_eof_then_write_lies() {
    let reactor = Reactor::new().unwrap();
    let (a, b) = UnixStream::pair().unwrap();
    let conn = Connection::new(reactor, a, NoOp).unwrap();
    conn.borrow_mut().watch_read(true).unwrap();

    drop(b);

    let mut buf = [0u8; 16];
    let n = conn.borrow_mut().read(&mut buf).unwrap();
    assert_eq!(n, 0);

    assert!(!conn.borrow_mut().close("peer"));
    assert!(conn.borrow_mut().write(Some(b"late")).unwrap());
}
