//! TCP sockets whose blocking calls go through the hook layer.
//!
//! Inside a fiber of an [`IoManager`](crate::io::IoManager) these types only
//! park the calling fiber; elsewhere they behave like plain blocking sockets.

use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};

use crate::fd::TimeoutKind;
use crate::hook;

const LISTEN_BACKLOG: i32 = 1024;

fn resolve<A: ToSocketAddrs>(addr: A) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "could not resolve address")
    })
}

fn domain_of(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

/// Borrow `fd` as a socket2 socket without taking ownership.
fn with_socket<T>(fd: RawFd, f: impl FnOnce(&Socket) -> io::Result<T>) -> io::Result<T> {
    let socket = ManuallyDrop::new(unsafe { Socket::from_raw_fd(fd) });
    f(&socket)
}

fn into_socket_addr(addr: SockAddr) -> io::Result<SocketAddr> {
    addr.as_socket().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "not an internet address")
    })
}

/// A listening TCP socket.
#[derive(Debug)]
pub struct TcpListener {
    fd: RawFd,
}

impl TcpListener {
    /// Bind with `SO_REUSEADDR` and start listening.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let addr = resolve(addr)?;
        let socket = Socket::new(domain_of(&addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(Self {
            fd: socket.into_raw_fd(),
        })
    }

    /// Wait for a connection.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let fd = hook::accept(self.fd)?;
        let stream = TcpStream { fd };
        let peer = stream.peer_addr()?;
        Ok((stream, peer))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        with_socket(self.fd, |socket| into_socket_addr(socket.local_addr()?))
    }
}

impl AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        if let Err(e) = hook::close(self.fd) {
            tracing::debug!(target: "fiberio::hook", fd = self.fd, "close failed: {e}");
        }
    }
}

/// A connected TCP stream.
#[derive(Debug)]
pub struct TcpStream {
    fd: RawFd,
}

impl TcpStream {
    /// Connect using the hook layer's default connect timeout.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::connect_timeout(addr, hook::connect_timeout_ms())
    }

    pub fn connect_timeout<A: ToSocketAddrs>(addr: A, timeout_ms: u64) -> io::Result<Self> {
        let addr = resolve(addr)?;
        let family = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let fd = hook::socket(family, libc::SOCK_STREAM, libc::IPPROTO_TCP)?;
        // Owned from here so an error path closes the fd.
        let stream = TcpStream { fd };
        hook::connect_with_timeout(fd, &SockAddr::from(addr), timeout_ms)?;
        Ok(stream)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        into_socket_addr(SockRef::from(self).peer_addr()?)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        into_socket_addr(SockRef::from(self).local_addr()?)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        SockRef::from(self).set_nodelay(nodelay)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        hook::setsockopt_timeout(self.fd, TimeoutKind::Recv, timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        hook::setsockopt_timeout(self.fd, TimeoutKind::Send, timeout)
    }

    pub fn read_timeout(&self) -> io::Result<Option<Duration>> {
        hook::socket_timeout(self.fd, TimeoutKind::Recv)
    }

    pub fn write_timeout(&self) -> io::Result<Option<Duration>> {
        hook::socket_timeout(self.fd, TimeoutKind::Send)
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()> {
        SockRef::from(self).shutdown(how)
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        hook::recv(self.fd, buf, 0)
    }

    fn read_vectored(&mut self, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
        hook::readv(self.fd, bufs)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        hook::send(self.fd, buf, libc::MSG_NOSIGNAL)
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        hook::writev(self.fd, bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl std::os::unix::io::AsFd for TcpStream {
    fn as_fd(&self) -> std::os::unix::io::BorrowedFd<'_> {
        unsafe { std::os::unix::io::BorrowedFd::borrow_raw(self.fd) }
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        if let Err(e) = hook::close(self.fd) {
            tracing::debug!(target: "fiberio::hook", fd = self.fd, "close failed: {e}");
        }
    }
}
