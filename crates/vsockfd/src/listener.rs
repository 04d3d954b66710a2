use crate::conn::ConnectionDescriptor;
use crate::descriptor::{Blocking, Mode, NonBlocking, PromoteError, promote};
use crate::error::{Error, Result};
use crate::retry::{Interest, Step, is_transient};
use sockfd::{AcceptFlags, SocketAddress, SocketFd};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::time::Instant;

/// A listening socket.
///
/// Opened, bound and put into listening state while [`Blocking`]; then
/// promoted to [`NonBlocking`], where [`accept`](Self::accept) waits for
/// connections on the reactor and can be interrupted by
/// [`close`](Self::close) from another task.
pub struct ListenerDescriptor<A, M: Mode = NonBlocking> {
    state: M::State,
    _addr: PhantomData<fn() -> A>,
}

impl<A: SocketAddress> ListenerDescriptor<A, Blocking> {
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

    pub fn bind(&self, addr: &A) -> Result<()> {
        Ok(self.state.bind(addr)?)
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        Ok(self.state.listen(backlog)?)
    }

    pub fn local_address(&self) -> Result<A> {
        Ok(self.state.local_addr()?)
    }

    /// Switch to non-blocking mode and register with the reactor, so that
    /// accept can be interrupted by closing the listener.
    pub fn promote_to_non_blocking(
        self,
        name: &str,
    ) -> std::result::Result<ListenerDescriptor<A, NonBlocking>, PromoteError<Self>> {
        let state = promote(self.state, name, Self::from_fd)?;
        Ok(ListenerDescriptor {
            state,
            _addr: PhantomData,
        })
    }

    /// Close a listener that never made it to non-blocking mode.
    pub fn early_close(self) -> Result<()> {
        Ok(self.state.close()?)
    }
}

impl<A: SocketAddress> ListenerDescriptor<A, NonBlocking> {
    /// The diagnostic name given at promotion.
    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Wait for and accept one incoming connection.
    ///
    /// The connection comes back already non-blocking and registered;
    /// `AcceptFlags::NONBLOCK` is applied to it even if `flags` leaves it
    /// out.  Fails with [`Error::Closed`] if the listener is closed, and
    /// with [`Error::Timeout`] if the listener's deadline passes first.
    pub async fn accept(&self, flags: AcceptFlags) -> Result<(ConnectionDescriptor<A>, A)> {
        let name = self.name();
        let (fd, peer) = self
            .state
            .run(
                Interest::Read,
                |fd| fd.accept::<A>(flags),
                |res| classify_accept(name, res),
            )
            .await?;
        let conn = ConnectionDescriptor::from_accepted(fd, flags, name)?;
        Ok((conn, peer))
    }

    /// Bound how long accept may wait.  `None` clears the deadline.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<()> {
        self.state.update_deadlines(|d| d.read = deadline)
    }

    /// Close the listener, waking any pending accept.
    pub fn close(&self) -> Result<()> {
        self.state.close()
    }
}

/// Would-block means nothing is queued yet.  A connection that was aborted
/// by its peer while still in the queue is treated the same way: another
/// connection may be right behind it, and the listener itself is fine.
fn classify_accept<T>(name: &str, res: io::Result<T>) -> Step<T> {
    match res {
        Ok(value) => Step::Done(value),
        Err(err) if is_transient(&err) => Step::Retry,
        Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => {
            log::debug!("{name}: pending connection aborted before accept; retrying");
            Step::Retry
        }
        Err(err) => Step::Fail(Error::Accept(err)),
    }
}

impl<A, M: Mode> fmt::Debug for ListenerDescriptor<A, M>
where
    M::State: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerDescriptor")
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::suspend_and_retry;
    use crate::retry::tests::{ScriptedWaiter, scripted};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Arc;
    use std::time::Duration;

    fn aborted<T>() -> io::Result<T> {
        Err(io::Error::from_raw_os_error(libc::ECONNABORTED))
    }

    fn would_block<T>() -> io::Result<T> {
        Err(io::Error::from_raw_os_error(libc::EAGAIN))
    }

    fn bound_listener() -> (ListenerDescriptor<SocketAddrV4, Blocking>, SocketAddrV4) {
        let listener = ListenerDescriptor::<SocketAddrV4, Blocking>::open().unwrap();
        listener.bind(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.listen(4).unwrap();
        let addr = listener.local_address().unwrap();
        (listener, addr)
    }

    #[test]
    fn accept_retries_twice_then_succeeds() {
        let waiter = ScriptedWaiter::default();
        let (attempt, calls) = scripted(vec![would_block(), would_block(), Ok("conn")]);
        let conn = async_io::block_on(suspend_and_retry(
            &waiter,
            Interest::Read,
            attempt,
            |res| classify_accept("test", res),
        ))
        .unwrap();
        assert_eq!(conn, "conn");
        assert_eq!(calls.get(), 3);
        assert_eq!(waiter.waits.get(), 2);
    }

    #[test]
    fn aborted_connection_is_retried() {
        let _ = env_logger::builder().is_test(true).try_init();
        let waiter = ScriptedWaiter::default();
        let (attempt, calls) = scripted(vec![aborted(), Ok(42)]);
        let value = async_io::block_on(suspend_and_retry(
            &waiter,
            Interest::Read,
            attempt,
            |res| classify_accept("test", res),
        ))
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn other_accept_errors_propagate() {
        match classify_accept::<()>("test", Err(io::Error::from_raw_os_error(libc::EMFILE))) {
            Step::Fail(Error::Accept(err)) => assert_eq!(err.raw_os_error(), Some(libc::EMFILE)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn early_close_before_promotion() {
        let (listener, _) = bound_listener();
        listener.early_close().unwrap();
    }

    #[test]
    fn promoted_listener_keeps_its_name() {
        let (listener, _) = bound_listener();
        let listener = listener.promote_to_non_blocking("vsock-listen").unwrap();
        assert_eq!(listener.name(), "vsock-listen");
        assert!(format!("{listener:?}").contains("vsock-listen"));
        listener.close().unwrap();
    }

    #[test]
    fn accept_deadline_expires() {
        let (listener, _) = bound_listener();
        let listener = listener.promote_to_non_blocking("deadline").unwrap();
        listener
            .set_deadline(Some(Instant::now() + Duration::from_millis(30)))
            .unwrap();
        let err = async_io::block_on(listener.accept(AcceptFlags::default())).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn accept_yields_registered_connection() {
        let (listener, addr) = bound_listener();
        let listener = listener.promote_to_non_blocking("accept").unwrap();

        let client = SocketFd::new(SocketAddrV4::FAMILY).unwrap();
        client.connect(&addr).unwrap();

        // Leave NONBLOCK out: the connection must still end up non-blocking.
        let (conn, peer) = async_io::block_on(listener.accept(AcceptFlags::CLOEXEC)).unwrap();
        assert_eq!(peer, client.local_addr::<SocketAddrV4>().unwrap());
        assert!(conn.is_non_blocking().unwrap());
        assert_eq!(conn.name(), "accept");
    }

    #[test]
    fn accept_after_close_fails_fast() {
        let (listener, _) = bound_listener();
        let listener = listener.promote_to_non_blocking("closed").unwrap();
        listener.close().unwrap();
        let err = async_io::block_on(listener.accept(AcceptFlags::default())).unwrap_err();
        assert!(err.is_closed());
        assert!(listener.set_deadline(None).unwrap_err().is_closed());
    }

    #[test]
    fn close_wakes_pending_accept() {
        let (listener, _) = bound_listener();
        let listener = Arc::new(listener.promote_to_non_blocking("wake").unwrap());

        let (tx, rx) = flume::bounded(1);
        let accepting = Arc::clone(&listener);
        std::thread::spawn(move || {
            let res = async_io::block_on(accepting.accept(AcceptFlags::default()));
            let _ = tx.send(res.map(|_| ()));
        });

        std::thread::sleep(Duration::from_millis(50));
        listener.close().unwrap();

        let res = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("accept did not return after close");
        assert!(res.unwrap_err().is_closed());
    }
}
