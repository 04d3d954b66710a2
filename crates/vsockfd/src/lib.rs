//! Socket descriptors for vsock listeners and connections that are set up
//! with plain blocking syscalls and then used asynchronously.
//!
//! A descriptor starts out [`Blocking`]: it can be bound, put into listening
//! state, connected and asked for its local address, and nothing else.
//! Promoting it consumes the blocking descriptor and yields a
//! [`NonBlocking`] one whose handle is registered with the `async-io`
//! reactor.  From then on `accept`, `read` and `write` wait for readiness
//! instead of blocking a thread, honor per-direction deadlines, and are
//! woken with [`Error::Closed`] when another task closes the descriptor.
//!
//! The [`listen`] and [`dial`] helpers run the whole setup sequence.  They
//! work for any [`SocketAddress`]; vsock is the intended family, IPv4 works
//! the same way:
//!
//! ```
//! use std::net::{Ipv4Addr, SocketAddrV4};
//! use vsockfd::{AcceptFlags, DialConfig, ListenConfig};
//!
//! let any = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
//! let (listener, addr) = vsockfd::listen(&any, &ListenConfig::default())?;
//! let (client, _) = vsockfd::dial(&addr, &DialConfig::default())?;
//!
//! async_io::block_on(async {
//!     let (server, _peer) = listener.accept(AcceptFlags::default()).await?;
//!     client.write_all(b"ping").await?;
//!     let mut buf = [0u8; 4];
//!     let n = server.read(&mut buf).await?;
//!     assert_eq!(&buf[..n], &b"ping"[..n]);
//!     Ok::<(), vsockfd::Error>(())
//! })?;
//! # Ok::<(), vsockfd::Error>(())
//! ```
//!
//! Readiness-driven calls don't exist on a blocking descriptor:
//!
//! ```compile_fail
//! use std::net::SocketAddrV4;
//! use vsockfd::{Blocking, ConnectionDescriptor};
//!
//! let conn = ConnectionDescriptor::<SocketAddrV4, Blocking>::open().unwrap();
//! let mut buf = [0u8; 4];
//! let _ = async_io::block_on(conn.read(&mut buf));
//! ```
//!
//! and a descriptor can't be promoted twice:
//!
//! ```compile_fail
//! use std::net::SocketAddrV4;
//! use vsockfd::{Blocking, ListenerDescriptor};
//!
//! let listener = ListenerDescriptor::<SocketAddrV4, Blocking>::open().unwrap();
//! let listener = listener.promote_to_non_blocking("a").unwrap();
//! let _ = listener.promote_to_non_blocking("b");
//! ```

mod conn;
mod descriptor;
mod error;
mod listener;
mod retry;
mod setup;

pub use crate::conn::ConnectionDescriptor;
pub use crate::descriptor::{Blocking, Mode, NonBlocking, PromoteError, Registered};
pub use crate::error::{Error, Result};
pub use crate::listener::ListenerDescriptor;
pub use crate::retry::{
    Interest, ReadinessWait, Step, classify_io, is_transient, suspend_and_retry,
};
pub use crate::setup::{DialConfig, ListenConfig, dial, listen};
pub use sockfd::{
    AcceptFlags, RawSockAddr, SocketAddress, VMADDR_CID_ANY, VMADDR_CID_HOST,
    VMADDR_CID_HYPERVISOR, VMADDR_CID_LOCAL, VMADDR_PORT_ANY, VsockAddr,
};
