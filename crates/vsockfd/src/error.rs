use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A blocking-mode setup call failed.
    #[error(transparent)]
    Sys(#[from] sockfd::Error),
    #[error("failed to accept a connection")]
    Accept(#[source] io::Error),
    #[error("failed to register the descriptor with the reactor")]
    Register(#[source] io::Error),
    /// The read, write or accept deadline passed before the socket became
    /// ready.  The descriptor remains usable.
    #[error("i/o deadline exceeded")]
    Timeout,
    /// The descriptor was closed before or during the operation.
    #[error("use of closed socket descriptor")]
    Closed,
    #[error("socket i/o failed")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Sys(err) => err.raw_os_error(),
            Self::Accept(err) | Self::Register(err) | Self::Io(err) => err.raw_os_error(),
            Self::Timeout | Self::Closed => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, err),
            err => io::Error::other(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
