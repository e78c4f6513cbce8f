//! A single-threaded, non-blocking socket reactor: a readiness-based event
//! loop (`epoll`, falling back to `poll(2)`) over a registry of
//! [`Connection`]s, each with its own write queue and partial-write
//! bookkeeping.
//!
//! ## Usage
//!
//! ```no_run
//! use reactor_io::{Connection, Handler, Reactor};
//! use std::os::unix::net::UnixStream;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_readable(conn: &mut Connection<Self>) {
//!         let mut buf = [0u8; 4096];
//!         if let Ok(n) = conn.read(&mut buf) {
//!             if n == 0 {
//!                 conn.close("eof");
//!             } else {
//!                 let _ = conn.write(Some(&buf[..n]));
//!             }
//!         }
//!     }
//! }
//!
//! let reactor = Reactor::new().unwrap();
//! let (sock, _peer) = UnixStream::pair().unwrap();
//! let conn = Connection::new(reactor.clone(), sock, Echo).unwrap();
//! conn.borrow_mut().watch_read(true).unwrap();
//!
//! reactor.run().unwrap();
//! ```

#[macro_use]
mod sys;

mod backend;
mod connection;
mod handler;
mod reactor;
mod ready;
mod registry;
mod waker;

pub use connection::{Connection, Socket};
pub use handler::Handler;
pub use reactor::{debug_level, set_debug_level, Reactor, ReactorConfig};
pub use ready::Ready;
pub use waker::Waker;

pub use sys::socket::SocketExt;
