//! The two modes a descriptor passes through, and the registered state it
//! lives in once non-blocking.

use crate::error::{Error, Result};
use crate::retry::{Interest, ReadinessWait, Step, suspend_and_retry};
use async_io::{Async, Timer};
use futures::FutureExt;
use parking_lot::Mutex;
use sockfd::SocketFd;
use std::fmt;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

mod private {
    pub trait Sealed {}
}

/// The mode of a descriptor, as a type parameter.
///
/// A `Blocking` descriptor only offers the setup calls; promoting it
/// consumes it and yields the `NonBlocking` descriptor, which only offers
/// the readiness-driven calls.  There is no way back.
pub trait Mode: private::Sealed {
    #[doc(hidden)]
    type State: Send + Sync;
}

/// Setup mode: plain synchronous syscalls on an unregistered handle.
#[derive(Debug)]
pub enum Blocking {}

/// Operating mode: the handle is registered with the reactor.
#[derive(Debug)]
pub enum NonBlocking {}

impl private::Sealed for Blocking {}
impl private::Sealed for NonBlocking {}

impl Mode for Blocking {
    type State = SocketFd;
}

impl Mode for NonBlocking {
    type State = Registered;
}

/// Promotion failed.
#[derive(Error)]
pub enum PromoteError<D> {
    /// The handle couldn't be made non-blocking.  The descriptor is handed
    /// back unchanged; it is still blocking and should be early-closed.
    #[error("failed to switch the descriptor to non-blocking mode")]
    NonBlocking {
        descriptor: D,
        #[source]
        source: sockfd::Error,
    },
    /// The reactor refused the handle.  The handle has been released.
    #[error("failed to register the descriptor with the reactor")]
    Register(#[source] io::Error),
}

impl<D> PromoteError<D> {
    /// The still-blocking descriptor, if the failure left one behind.
    pub fn into_descriptor(self) -> Option<D> {
        match self {
            Self::NonBlocking { descriptor, .. } => Some(descriptor),
            Self::Register(_) => None,
        }
    }

    /// Drop the descriptor (if any) and keep only the cause, as an [`Error`].
    pub fn into_error(self) -> Error {
        match self {
            Self::NonBlocking { source, .. } => Error::Sys(source),
            Self::Register(err) => Error::Register(err),
        }
    }
}

impl<D> fmt::Debug for PromoteError<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonBlocking { source, .. } => f
                .debug_struct("NonBlocking")
                .field("source", source)
                .finish_non_exhaustive(),
            Self::Register(err) => f.debug_tuple("Register").field(err).finish(),
        }
    }
}

/// Set the non-blocking flag on `fd` and register it with the reactor.
/// `rebuild` turns the handle back into the caller's blocking descriptor
/// when the flag can't be set.
pub(crate) fn promote<D>(
    mut fd: SocketFd,
    name: &str,
    rebuild: impl FnOnce(SocketFd) -> D,
) -> std::result::Result<Registered, PromoteError<D>> {
    if let Err(source) = fd.set_non_blocking(true) {
        return Err(PromoteError::NonBlocking {
            descriptor: rebuild(fd),
            source,
        });
    }
    log::trace!("{name}: fd {} is now non-blocking", fd.as_raw_fd());
    Registered::new(fd, name).map_err(PromoteError::Register)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Deadlines {
    pub read: Option<Instant>,
    pub write: Option<Instant>,
}

impl Deadlines {
    fn get(&self, interest: Interest) -> Option<Instant> {
        match interest {
            Interest::Read => self.read,
            Interest::Write => self.write,
        }
    }
}

struct Live {
    io: Arc<Async<SocketFd>>,
    // Nothing is ever sent on this; dropping it disconnects the receiver
    // that every waiter is racing against.
    closer: flume::Sender<()>,
}

/// A non-blocking handle registered with the reactor, plus the state that
/// governs waiting on it.
pub struct Registered {
    name: String,
    live: Mutex<Option<Live>>,
    closed: flume::Receiver<()>,
    deadlines: Mutex<Deadlines>,
}

impl Registered {
    /// Register an already non-blocking handle.  On failure the handle is
    /// closed.
    pub(crate) fn new(fd: SocketFd, name: &str) -> io::Result<Self> {
        let raw = fd.as_raw_fd();
        let io = Async::new_nonblocking(fd)?;
        log::trace!("{name}: registered fd {raw} with the reactor");
        let (closer, closed) = flume::bounded(0);
        Ok(Self {
            name: name.to_string(),
            live: Mutex::new(Some(Live {
                io: Arc::new(io),
                closer,
            })),
            closed,
            deadlines: Mutex::new(Deadlines::default()),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.live.lock().is_none()
    }

    pub(crate) fn handle(&self) -> Result<Arc<Async<SocketFd>>> {
        self.live
            .lock()
            .as_ref()
            .map(|live| Arc::clone(&live.io))
            .ok_or(Error::Closed)
    }

    pub(crate) fn update_deadlines(&self, update: impl FnOnce(&mut Deadlines)) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        update(&mut *self.deadlines.lock());
        Ok(())
    }

    /// Perform one readiness-driven operation on the handle.
    pub(crate) async fn run<T, F, C>(
        &self,
        interest: Interest,
        mut attempt: F,
        classify: C,
    ) -> Result<T>
    where
        F: FnMut(&SocketFd) -> io::Result<T>,
        C: Fn(io::Result<T>) -> Step<T>,
    {
        let io = self.handle()?;
        let waiter = Waiter {
            io: &io,
            closed: &self.closed,
            deadlines: &self.deadlines,
        };
        suspend_and_retry(&waiter, interest, || attempt(io.get_ref()), classify).await
    }

    /// Mark the descriptor closed, wake everything waiting on it and
    /// release the handle.
    ///
    /// If an operation still holds the handle, it is deregistered and
    /// closed when that operation lets go of it.  The result of that
    /// later `close(2)` is not reported; `Ok(())` is returned here.
    pub(crate) fn close(&self) -> Result<()> {
        let Live { io, closer } = self.live.lock().take().ok_or(Error::Closed)?;
        drop(closer);
        match Arc::try_unwrap(io) {
            Ok(io) => {
                let fd = io.into_inner()?;
                fd.close()?;
                Ok(())
            }
            Err(io) => {
                log::trace!(
                    "{}: fd {} still in use; closing once released",
                    self.name,
                    io.as_raw_fd()
                );
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Registered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registered")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("deadlines", &*self.deadlines.lock())
            .finish()
    }
}

/// The reactor-backed side of [`ReadinessWait`].
struct Waiter<'a> {
    io: &'a Async<SocketFd>,
    closed: &'a flume::Receiver<()>,
    deadlines: &'a Mutex<Deadlines>,
}

impl ReadinessWait for Waiter<'_> {
    fn check(&self, interest: Interest) -> Result<()> {
        if self.closed.is_disconnected() {
            return Err(Error::Closed);
        }
        match self.deadlines.lock().get(interest) {
            Some(deadline) if deadline <= Instant::now() => Err(Error::Timeout),
            _ => Ok(()),
        }
    }

    async fn wait(&self, interest: Interest) -> Result<()> {
        let deadline = self.deadlines.lock().get(interest);

        let ready = async {
            match interest {
                Interest::Read => self.io.readable().await,
                Interest::Write => self.io.writable().await,
            }
        }
        .fuse();
        let closed = self.closed.recv_async().fuse();
        let expired = async {
            match deadline {
                Some(deadline) => {
                    Timer::at(deadline).await;
                }
                None => futures::future::pending::<()>().await,
            }
        }
        .fuse();
        futures::pin_mut!(ready, closed, expired);

        futures::select_biased! {
            _ = closed => Err(Error::Closed),
            () = expired => Err(Error::Timeout),
            res = ready => res.map_err(Error::Io),
        }
    }
}
