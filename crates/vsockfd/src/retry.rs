//! The attempt / suspend / retry loop shared by accept, read and write.

use crate::error::{Error, Result};
use std::future::Future;
use std::io;

/// Which kind of readiness an operation waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// What to do with the result of one attempt.
#[derive(Debug)]
pub enum Step<T> {
    /// The operation completed; hand this back to the caller.
    Done(T),
    /// The socket wasn't ready; wait for readiness and try again.
    Retry,
    /// The operation failed for good.
    Fail(Error),
}

/// The readiness-waiting half of the protocol.
///
/// `check` runs before every attempt and must fail without blocking when
/// the descriptor is closed or its deadline has already passed.  `wait`
/// suspends until readiness may have changed, and fails with
/// [`Error::Closed`] or [`Error::Timeout`] instead if the descriptor is
/// closed or the deadline passes first.
pub trait ReadinessWait {
    fn check(&self, interest: Interest) -> Result<()>;
    fn wait(&self, interest: Interest) -> impl Future<Output = Result<()>>;
}

/// Run `attempt` until `classify` says it is done or has failed, waiting on
/// `waiter` for readiness between inconclusive attempts.
pub async fn suspend_and_retry<W, T, F, C>(
    waiter: &W,
    interest: Interest,
    mut attempt: F,
    classify: C,
) -> Result<T>
where
    W: ReadinessWait,
    F: FnMut() -> io::Result<T>,
    C: Fn(io::Result<T>) -> Step<T>,
{
    loop {
        waiter.check(interest)?;
        match classify(attempt()) {
            Step::Done(value) => return Ok(value),
            Step::Fail(err) => return Err(err),
            Step::Retry => waiter.wait(interest).await?,
        }
    }
}

/// `EAGAIN` and `EINTR` mean "try again"; everything else is final.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// The classifier for plain reads and writes.
pub fn classify_io<T>(result: io::Result<T>) -> Step<T> {
    match result {
        Ok(value) => Step::Done(value),
        Err(err) if is_transient(&err) => Step::Retry,
        Err(err) => Step::Fail(Error::Io(err)),
    }
}
