//! Socket ownership and the raw fd helpers the reactor core consumes.

use std::io;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Type};

use crate::addr::InetAddress;

/// An owned TCP socket fd. Closed on drop.
pub(crate) struct Socket {
    inner: socket2::Socket,
}

impl Socket {
    /// Create a non-blocking, close-on-exec IPv4 stream socket.
    pub(crate) fn new_nonblocking() -> io::Result<Self> {
        let inner = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        inner.set_nonblocking(true)?;
        inner.set_cloexec(true)?;
        Ok(Self { inner })
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub(crate) fn bind(&self, addr: &InetAddress) -> io::Result<()> {
        self.inner.bind(&addr.socket_addr().into())
    }

    pub(crate) fn listen(&self, backlog: i32) -> io::Result<()> {
        self.inner.listen(backlog)
    }

    /// Accept one pending connection; the returned socket is non-blocking
    /// and close-on-exec.
    pub(crate) fn accept(&self) -> io::Result<(Socket, InetAddress)> {
        let (conn, peer) = self.inner.accept()?;
        conn.set_nonblocking(true)?;
        conn.set_cloexec(true)?;
        let peer = peer
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP peer address"))?;
        Ok((Socket { inner: conn }, InetAddress::try_from(peer)?))
    }

    /// Close the write half, leaving the read half open.
    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Write)
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_address(on)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.inner.set_reuse_port(on)
    }

    pub(crate) fn set_keepalive(&self, on: bool) -> io::Result<()> {
        self.inner.set_keepalive(on)
    }

    pub(crate) fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.inner.set_nodelay(on)
    }

    pub(crate) fn local_addr(&self) -> io::Result<InetAddress> {
        let addr = self
            .inner
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP local address"))?;
        InetAddress::try_from(addr)
    }
}

/// Single write syscall on a raw fd.
pub(crate) fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Pending SO_ERROR on a connection fd, or the getsockopt errno itself.
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut _ as *mut libc::c_void,
            &mut optlen,
        )
    };
    if rc < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        optval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_local_addr() {
        let sock = Socket::new_nonblocking().unwrap();
        sock.set_reuse_addr(true).unwrap();
        sock.bind(&InetAddress::loopback(0)).unwrap();
        let local = sock.local_addr().unwrap();
        assert_eq!(local.to_ip(), "127.0.0.1");
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn no_pending_socket_error() {
        let sock = Socket::new_nonblocking().unwrap();
        assert_eq!(socket_error(sock.fd()), 0);
    }
}
