//! The full blocking setup sequences for listeners and client connections.

use crate::conn::ConnectionDescriptor;
use crate::descriptor::{Blocking, PromoteError};
use crate::error::{Error, Result};
use crate::listener::ListenerDescriptor;
use sockfd::SocketAddress;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenConfig {
    /// Passed to `listen(2)`.
    pub backlog: i32,
    /// Diagnostic name for the promoted listener.
    pub name: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            backlog: sockfd::DEFAULT_BACKLOG,
            name: "vsock-listen".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialConfig {
    /// Diagnostic name for the promoted connection.
    pub name: String,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            name: "vsock-dial".to_string(),
        }
    }
}

/// Open a listener bound to `addr`, put it in listening state and promote
/// it.  Returns the listener along with the address it actually bound to
/// (which differs from `addr` when a wildcard port was requested).
pub fn listen<A: SocketAddress>(
    addr: &A,
    config: &ListenConfig,
) -> Result<(ListenerDescriptor<A>, A)> {
    let listener = ListenerDescriptor::<A, Blocking>::open()?;

    let setup = listener
        .bind(addr)
        .and_then(|()| listener.listen(config.backlog))
        .and_then(|()| listener.local_address());
    let local = match setup {
        Ok(local) => local,
        Err(err) => return Err(discard(listener.early_close(), err)),
    };

    match listener.promote_to_non_blocking(&config.name) {
        Ok(listener) => Ok((listener, local)),
        Err(err) => Err(abandon(err, ListenerDescriptor::<A, Blocking>::early_close)),
    }
}

/// Connect a new socket to `addr` and promote it.  Connecting blocks the
/// calling thread.  Returns the connection along with its local address.
pub fn dial<A: SocketAddress>(
    addr: &A,
    config: &DialConfig,
) -> Result<(ConnectionDescriptor<A>, A)> {
    let conn = ConnectionDescriptor::<A, Blocking>::open()?;

    let setup = conn.connect(addr).and_then(|()| conn.local_address());
    let local = match setup {
        Ok(local) => local,
        Err(err) => return Err(discard(conn.early_close(), err)),
    };

    match conn.promote_to_non_blocking(&config.name) {
        Ok(conn) => Ok((conn, local)),
        Err(err) => Err(abandon(err, ConnectionDescriptor::<A, Blocking>::early_close)),
    }
}

/// Keep the setup error; the early close result only gets logged.
fn discard(closed: Result<()>, err: Error) -> Error {
    if let Err(close_err) = closed {
        log::debug!("early close after failed setup: {close_err:#}");
    }
    err
}

fn abandon<D>(err: PromoteError<D>, early_close: impl FnOnce(D) -> Result<()>) -> Error {
    match err {
        PromoteError::NonBlocking { descriptor, source } => {
            discard(early_close(descriptor), Error::Sys(source))
        }
        err => err.into_error(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn defaults() {
        let config = ListenConfig::default();
        assert_eq!(config.backlog, sockfd::DEFAULT_BACKLOG);
        assert_eq!(config.name, "vsock-listen");
        assert_eq!(DialConfig::default().name, "vsock-dial");
    }

    #[test]
    fn listen_reports_bound_address() {
        let (listener, local) =
            listen(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), &ListenConfig::default()).unwrap();
        assert_ne!(local.port(), 0);
        assert_eq!(listener.name(), "vsock-listen");
    }

    #[test]
    fn listen_on_busy_address_fails_with_bind_error() {
        let (_listener, local) =
            listen(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), &ListenConfig::default()).unwrap();
        let err = listen(&local, &ListenConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Sys(sockfd::Error::Bind(_))));
        assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
    }

    #[test]
    fn dial_refused_fails_with_connect_error() {
        let local = {
            let (listener, local) =
                listen(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), &ListenConfig::default())
                    .unwrap();
            listener.close().unwrap();
            local
        };
        let err = dial(&local, &DialConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Sys(sockfd::Error::Connect(_))));
        assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
    }

    #[test]
    fn abandon_early_closes_the_descriptor() {
        let conn = ConnectionDescriptor::<SocketAddrV4, Blocking>::open().unwrap();
        let err = PromoteError::NonBlocking {
            descriptor: conn,
            source: sockfd::Error::FionBio(std::io::Error::from_raw_os_error(libc::EINVAL)),
        };
        let mut closed = false;
        let err = abandon(err, |conn| {
            closed = true;
            conn.early_close()
        });
        assert!(closed);
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }
}
