//! Socket helpers for the relay listener.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};

use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrIn,
    SockaddrIn6,
};

/// Bind a non-blocking TCP listener with `SO_REUSEADDR`, so a restarted
/// relay can rebind while old client sockets sit in `TIME_WAIT`. IPv6
/// listeners are IPv6-only.
pub fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket::socket(
        domain,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        SockProtocol::Tcp,
    )
    .map_err(io::Error::from)?;

    socket::setsockopt(&fd, sockopt::ReuseAddr, &true).map_err(io::Error::from)?;

    match addr {
        SocketAddr::V4(v4) => {
            let sockaddr = SockaddrIn::from(v4);
            socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)?;
        }
        SocketAddr::V6(v6) => {
            socket::setsockopt(&fd, sockopt::Ipv6V6Only, &true).map_err(io::Error::from)?;
            let sockaddr = SockaddrIn6::from(v6);
            socket::bind(fd.as_raw_fd(), &sockaddr).map_err(io::Error::from)?;
        }
    }
    socket::listen(&fd, Backlog::MAXCONN).map_err(io::Error::from)?;

    let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}
