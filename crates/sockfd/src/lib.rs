//! Owned stream socket descriptors and the raw syscalls used to set them up.
//!
//! `SocketFd` owns a single socket handle and closes it exactly once, either
//! explicitly via [`SocketFd::close`] (which reports the result of
//! `close(2)`) or implicitly when dropped.  The setup calls (`bind`,
//! `listen`, `connect`, `getsockname`) are direct pass-throughs that surface
//! the OS error unchanged as the `source` of a per-call [`Error`] variant.
//!
//! Addresses are described by the [`SocketAddress`] trait, implemented here
//! for vsock ([`VsockAddr`]) and for IPv4 ([`std::net::SocketAddrV4`]).
//!
//! ```
//! use sockfd::{AcceptFlags, SocketAddress, SocketFd};
//! use std::io::{Read, Write};
//! use std::net::{Ipv4Addr, SocketAddrV4};
//!
//! let listener = SocketFd::new(SocketAddrV4::FAMILY)?;
//! listener.bind(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
//! listener.listen(1)?;
//! let addr: SocketAddrV4 = listener.local_addr()?;
//!
//! let client = SocketFd::new(SocketAddrV4::FAMILY)?;
//! client.connect(&addr)?;
//! client.write(b"hello")?;
//!
//! let (conn, _peer) = listener.accept::<SocketAddrV4>(AcceptFlags::CLOEXEC)?;
//! let mut buf = [0u8; 5];
//! let n = conn.read(&mut buf)?;
//! assert_eq!(&buf[..n], b"hello");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use thiserror::Error;

mod addr;

pub use crate::addr::*;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to create a socket")]
    Socket(#[source] io::Error),
    #[error("failed to bind a socket")]
    Bind(#[source] io::Error),
    #[error("failed to fetch socket name")]
    Getsockname(#[source] io::Error),
    #[error("failed to set socket to listen mode")]
    Listen(#[source] io::Error),
    #[error("failed to connect socket")]
    Connect(#[source] io::Error),
    #[error("fcntl read failed")]
    Fcntl(#[source] io::Error),
    #[error("failed to change non-blocking mode")]
    FionBio(#[source] io::Error),
    #[error("failed to close socket")]
    Close(#[source] io::Error),
}

impl Error {
    /// The OS error underneath this failure.
    pub fn io_error(&self) -> &io::Error {
        match self {
            Self::Socket(err)
            | Self::Bind(err)
            | Self::Getsockname(err)
            | Self::Listen(err)
            | Self::Connect(err)
            | Self::Fcntl(err)
            | Self::FionBio(err)
            | Self::Close(err) => err,
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        self.io_error().raw_os_error()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A reasonable default for `listen(2)`; the kernel clamps larger values.
pub const DEFAULT_BACKLOG: i32 = libc::SOMAXCONN;

bitflags::bitflags! {
    /// Flags for the descriptor created by `accept4(2)`.
    pub struct AcceptFlags: libc::c_int {
        const NONBLOCK = libc::SOCK_NONBLOCK;
        const CLOEXEC = libc::SOCK_CLOEXEC;
    }
}

impl Default for AcceptFlags {
    fn default() -> Self {
        Self::NONBLOCK | Self::CLOEXEC
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: libc::ssize_t) -> io::Result<usize> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// An owned `SOCK_STREAM` socket descriptor.
#[derive(Debug)]
pub struct SocketFd {
    fd: OwnedFd,
}

impl SocketFd {
    /// Open a new stream socket in the given address family.  The socket
    /// starts out in blocking mode, with close-on-exec set.
    pub fn new(family: libc::c_int) -> Result<Self> {
        // SAFETY: socket(2) has no memory safety preconditions.
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        let fd = cvt(fd).map_err(Error::Socket)?;
        // SAFETY: socket(2) just handed us this descriptor; nobody else owns it.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn bind<A: SocketAddress>(&self, addr: &A) -> Result<()> {
        let raw = addr.to_raw();
        // SAFETY: raw points to an initialized sockaddr of raw.len() bytes.
        cvt(unsafe { libc::bind(self.as_raw_fd(), raw.as_ptr(), raw.len()) })
            .map_err(Error::Bind)?;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        // SAFETY: listen(2) only takes integers.
        cvt(unsafe { libc::listen(self.as_raw_fd(), backlog) }).map_err(Error::Listen)?;
        Ok(())
    }

    pub fn connect<A: SocketAddress>(&self, addr: &A) -> Result<()> {
        let raw = addr.to_raw();
        // SAFETY: raw points to an initialized sockaddr of raw.len() bytes.
        cvt(unsafe { libc::connect(self.as_raw_fd(), raw.as_ptr(), raw.len()) })
            .map_err(Error::Connect)?;
        Ok(())
    }

    /// The address the socket is bound to.
    pub fn local_addr<A: SocketAddress>(&self) -> Result<A> {
        let mut raw = RawSockAddr::empty();
        let (addr, len) = raw.as_mut_parts();
        // SAFETY: addr/len describe a sockaddr_storage sized buffer.
        cvt(unsafe { libc::getsockname(self.as_raw_fd(), addr, len) })
            .map_err(Error::Getsockname)?;
        A::from_raw(&raw).map_err(Error::Getsockname)
    }

    /// Accept one pending connection.
    ///
    /// The error is returned as a plain `io::Error` so that callers can
    /// tell `WouldBlock` and `ConnectionAborted` apart from hard failures.
    pub fn accept<A: SocketAddress>(&self, flags: AcceptFlags) -> io::Result<(Self, A)> {
        let mut raw = RawSockAddr::empty();
        let (addr, len) = raw.as_mut_parts();
        // SAFETY: addr/len describe a sockaddr_storage sized buffer.
        let fd = cvt(unsafe { libc::accept4(self.as_raw_fd(), addr, len, flags.bits()) })?;
        // SAFETY: accept4(2) just handed us this descriptor.
        let conn = Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };
        let peer = A::from_raw(&raw)?;
        Ok((conn, peer))
    }

    /// Attempt to change the non-blocking IO mode of the socket.
    pub fn set_non_blocking(&mut self, non_blocking: bool) -> Result<()> {
        let mut on = libc::c_int::from(non_blocking);
        // SAFETY: FIONBIO reads a single c_int through the pointer.
        cvt(unsafe { libc::ioctl(self.as_raw_fd(), libc::FIONBIO, &mut on) })
            .map_err(Error::FionBio)?;
        Ok(())
    }

    pub fn is_non_blocking(&self) -> Result<bool> {
        // SAFETY: F_GETFL takes no pointer argument.
        let flags =
            cvt(unsafe { libc::fcntl(self.as_raw_fd(), libc::F_GETFL) }).map_err(Error::Fcntl)?;
        Ok(flags & libc::O_NONBLOCK != 0)
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        cvt_size(unsafe { libc::recv(self.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) })
    }

    /// Send bytes without raising SIGPIPE when the peer has gone away.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for reads of buf.len() bytes.
        cvt_size(unsafe {
            libc::send(
                self.as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        })
    }

    /// Close the descriptor and report what `close(2)` said about it.
    pub fn close(self) -> Result<()> {
        let fd = self.fd.into_raw_fd();
        // SAFETY: we owned fd and gave up that ownership just above.
        cvt(unsafe { libc::close(fd) }).map_err(Error::Close)?;
        Ok(())
    }
}

impl AsFd for SocketFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for SocketFd {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl From<OwnedFd> for SocketFd {
    fn from(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

#[cfg(feature = "async-io")]
unsafe impl async_io::IoSafe for SocketFd {}
