use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use libc::{c_int, c_void, socklen_t};

/// `setsockopt(2)` for any descriptor that knows its own fd.
pub fn setsockopt<S: AsRawFd + ?Sized, T>(sock: &S, level: c_int, name: c_int, value: T) -> io::Result<()> {
    let payload = &value as *const T as *const c_void;
    syscall!(setsockopt(
        sock.as_raw_fd(),
        level,
        name,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

/// `getsockopt(2)` for any descriptor that knows its own fd.
pub fn getsockopt<S: AsRawFd + ?Sized, T: Copy>(sock: &S, level: c_int, name: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        sock.as_raw_fd(),
        level,
        name,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

pub fn take_error<S: AsRawFd + ?Sized>(sock: &S) -> io::Result<Option<io::Error>> {
    let raw: c_int = getsockopt(sock, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if raw == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(raw)))
    }
}

pub fn set_nonblocking<S: AsRawFd + ?Sized>(sock: &S, nonblocking: bool) -> io::Result<()> {
    let mut flag = nonblocking as c_int;
    syscall!(ioctl(sock.as_raw_fd(), libc::FIONBIO, &mut flag)).map(|_| ())
}

/// Set or clear `TCP_CORK`: while corked, the kernel withholds partial
/// segments so several small writes can be coalesced into one, at the cost
/// of added latency until the cork is cleared.
pub fn set_tcp_cork<S: AsRawFd + ?Sized>(sock: &S, cork: bool) -> io::Result<()> {
    setsockopt(sock, libc::IPPROTO_TCP, libc::TCP_CORK, cork as c_int)
}

/// `getpeername(2)`, formatted as `"a.b.c.d:port"`. Returns `None` rather
/// than erroring for address families this isn't meaningful for (e.g. a
/// Unix-domain socket), matching `peer_addr_string`'s "or absent" contract.
pub fn peer_addr_string<S: AsRawFd + ?Sized>(sock: &S) -> Option<String> {
    peer_addr(sock).ok().map(|addr| addr.to_string())
}

fn peer_addr<S: AsRawFd + ?Sized>(sock: &S) -> io::Result<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getpeername(
            sock.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ))?;
        sockaddr_to_addr(&storage)
    }
}

unsafe fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let addr = *(storage as *const _ as *const libc::sockaddr_in);
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let addr = *(storage as *const _ as *const libc::sockaddr_in6);
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::from((ip, port)))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "unsupported address family")),
    }
}

/// Extension methods shared by every socket type the reactor can hold,
/// implemented for anything that can hand over its raw descriptor.
pub trait SocketExt: AsRawFd {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self::set_nonblocking(self, nonblocking)
    }

    fn tcp_cork(&self, cork: bool) -> io::Result<()> {
        self::set_tcp_cork(self, cork)
    }

    fn take_socket_error(&self) -> io::Result<Option<io::Error>> {
        self::take_error(self)
    }

    fn peer_addr_string(&self) -> Option<String> {
        self::peer_addr_string(self)
    }
}

impl<T: AsRawFd + ?Sized> SocketExt for T {}
