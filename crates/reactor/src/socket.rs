//! Thin wrappers over the raw socket syscalls the reactor needs. These
//! just give the raw syscalls a safe, non-blocking-by-default calling
//! convention; none of the option semantics are reimplemented.

use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::RawFd;

use crate::error::ReactorError;

pub(crate) fn create_nonblocking() -> Result<RawFd, ReactorError> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, libc::IPPROTO_TCP) };
    if fd < 0 {
        return Err(ReactorError::Socket(std::io::Error::last_os_error()));
    }
    Ok(fd)
}

fn sockaddr_in_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr.ip().octets()) },
        sin_zero: [0; 8],
    }
}

fn sockaddr_v4_from(raw: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());
    SocketAddrV4::new(ip, u16::from_be(raw.sin_port))
}

pub(crate) fn bind(fd: RawFd, addr: SocketAddr) -> Result<(), ReactorError> {
    let SocketAddr::V4(addr) = addr else {
        return Err(ReactorError::Bind {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "only IPv4 addresses are supported"),
        });
    };
    let sockaddr = sockaddr_in_from(addr);
    let ret = unsafe {
        libc::bind(fd, (&sockaddr as *const libc::sockaddr_in).cast(), mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
    };
    if ret < 0 {
        return Err(ReactorError::Bind { addr: SocketAddr::V4(addr), source: std::io::Error::last_os_error() });
    }
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> Result<(), ReactorError> {
    if unsafe { libc::listen(fd, backlog) } < 0 {
        return Err(ReactorError::Listen(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Accepts one connection, returning the new fd and the peer's address.
/// Returns `Err` on any `accept4` failure; callers inspect `raw_os_error()`
/// to distinguish `EMFILE`/`EAGAIN` from other failures.
pub(crate) fn accept(listen_fd: RawFd) -> std::io::Result<(RawFd, SocketAddr)> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let fd = unsafe {
        libc::accept4(listen_fd, (&mut raw as *mut libc::sockaddr_in).cast(), &mut len, libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC)
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((fd, SocketAddr::V4(sockaddr_v4_from(&raw))))
}

pub(crate) fn local_addr(fd: RawFd) -> std::io::Result<SocketAddr> {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    if unsafe { libc::getsockname(fd, (&mut raw as *mut libc::sockaddr_in).cast(), &mut len) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(SocketAddr::V4(sockaddr_v4_from(&raw)))
}

fn setsockopt_bool(fd: RawFd, level: i32, name: i32, opt_name: &'static str, on: bool) -> Result<(), ReactorError> {
    let value: libc::c_int = i32::from(on);
    let ret = unsafe {
        libc::setsockopt(fd, level, name, (&value as *const libc::c_int).cast(), mem::size_of::<libc::c_int>() as libc::socklen_t)
    };
    if ret < 0 {
        return Err(ReactorError::SetSockOpt { name: opt_name, source: std::io::Error::last_os_error() });
    }
    Ok(())
}

pub(crate) fn set_reuse_addr(fd: RawFd, on: bool) -> Result<(), ReactorError> {
    setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, "SO_REUSEADDR", on)
}

pub(crate) fn set_reuse_port(fd: RawFd, on: bool) -> Result<(), ReactorError> {
    setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, "SO_REUSEPORT", on)
}

pub(crate) fn set_keep_alive(fd: RawFd, on: bool) {
    let _ = setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, "SO_KEEPALIVE", on);
}

pub fn set_tcp_nodelay(fd: RawFd, on: bool) {
    let _ = setsockopt_bool(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, "TCP_NODELAY", on);
}

pub(crate) fn shutdown_write(fd: RawFd) {
    unsafe { libc::shutdown(fd, libc::SHUT_WR) };
}

/// Diagnostic read of the pending socket error, used from the error
/// callback path via `getsockopt(SOL_SOCKET, SO_ERROR)`.
pub(crate) fn so_error(fd: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, (&mut optval as *mut libc::c_int).cast(), &mut optlen)
    };
    if ret < 0 { std::io::Error::last_os_error().raw_os_error().unwrap_or(0) } else { optval }
}

pub(crate) fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}
