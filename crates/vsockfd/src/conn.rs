use crate::descriptor::{Blocking, Mode, NonBlocking, PromoteError, Registered, promote};
use crate::error::{Error, Result};
use crate::retry::{Interest, Step, classify_io};
use sockfd::{AcceptFlags, SocketAddress, SocketFd};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::time::Instant;

/// A connected stream socket.
///
/// Client connections are opened and connected while [`Blocking`], then
/// promoted.  Server-side connections come out of
/// [`ListenerDescriptor::accept`](crate::ListenerDescriptor::accept) already
/// [`NonBlocking`].
pub struct ConnectionDescriptor<A, M: Mode = NonBlocking> {
    state: M::State,
    _addr: PhantomData<fn() -> A>,
}

impl<A: SocketAddress> ConnectionDescriptor<A, Blocking> {
    /// Open a new blocking socket in `A`'s address family.
    pub fn open() -> Result<Self> {
        Ok(Self::from_fd(SocketFd::new(A::FAMILY)?))
    }

    fn from_fd(fd: SocketFd) -> Self {
        Self {
            state: fd,
            _addr: PhantomData,
        }
    }

    /// Connect to `addr`, blocking until the connection is established or
    /// refused.
    pub fn connect(&self, addr: &A) -> Result<()> {
        Ok(self.state.connect(addr)?)
    }

    pub fn local_address(&self) -> Result<A> {
        Ok(self.state.local_addr()?)
    }

    /// Switch to non-blocking mode and register with the reactor, so that
    /// deadlines work and a pending read or write can be interrupted by
    /// closing the connection.
    pub fn promote_to_non_blocking(
        self,
        name: &str,
    ) -> std::result::Result<ConnectionDescriptor<A, NonBlocking>, PromoteError<Self>> {
        let state = promote(self.state, name, Self::from_fd)?;
        Ok(ConnectionDescriptor {
            state,
            _addr: PhantomData,
        })
    }

    /// Close a connection that never made it to non-blocking mode.
    pub fn early_close(self) -> Result<()> {
        Ok(self.state.close()?)
    }
}

impl<A: SocketAddress> ConnectionDescriptor<A, NonBlocking> {
    /// Wrap a handle fresh out of `accept4`.  If it wasn't created
    /// non-blocking, it is made so before registration.
    pub(crate) fn from_accepted(mut fd: SocketFd, flags: AcceptFlags, name: &str) -> Result<Self> {
        if !flags.contains(AcceptFlags::NONBLOCK) {
            fd.set_non_blocking(true)?;
        }
        let state = Registered::new(fd, name).map_err(Error::Register)?;
        Ok(Self {
            state,
            _addr: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Read into `buf`, waiting for data if necessary.
    ///
    /// `Ok(0)` means end of stream, including the case where the peer has
    /// torn the connection down so far that the socket reports it is no
    /// longer connected.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.state
            .run(Interest::Read, |fd| fd.read(&mut *buf), classify_read)
            .await
    }

    /// Write from `buf`, waiting for buffer space if necessary.  Returns how
    /// many bytes were written, which may be fewer than `buf.len()`.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.state
            .run(Interest::Write, |fd| fd.write(buf), classify_io)
            .await
    }

    /// Write the whole of `buf`.
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// Set both the read and write deadlines.  `None` clears them.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.state.update_deadlines(|d| {
            d.read = deadline;
            d.write = deadline;
        })
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.state.update_deadlines(|d| d.read = deadline)
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.state.update_deadlines(|d| d.write = deadline)
    }

    /// Close the connection, waking any pending read or write.
    pub fn close(&self) -> Result<()> {
        self.state.close()
    }

    #[cfg(test)]
    pub(crate) fn is_non_blocking(&self) -> Result<bool> {
        Ok(self.state.handle()?.get_ref().is_non_blocking()?)
    }
}

fn classify_read(res: io::Result<usize>) -> Step<usize> {
    match res {
        Err(err) if err.kind() == io::ErrorKind::NotConnected => Step::Done(0),
        res => classify_io(res),
    }
}

impl<A, M: Mode> fmt::Debug for ConnectionDescriptor<A, M>
where
    M::State: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("state", &self.state)
            .finish()
    }
}
