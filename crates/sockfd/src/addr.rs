use std::fmt;
use std::hash::Hash;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};

/// The hypervisor's context ID.
pub const VMADDR_CID_HYPERVISOR: u32 = 0;
/// The local loopback context ID.
pub const VMADDR_CID_LOCAL: u32 = 1;
/// The context ID of the host, as seen from a guest.
pub const VMADDR_CID_HOST: u32 = 2;
/// Wildcard context ID; bind to any local context.
pub const VMADDR_CID_ANY: u32 = u32::MAX;
/// Wildcard port; let the kernel pick one when binding.
pub const VMADDR_PORT_ANY: u32 = u32::MAX;

/// An address that a stream socket of a particular family can be bound or
/// connected to.
///
/// Implementations convert to and from the kernel's `sockaddr` layout; the
/// descriptor types treat the value as opaque otherwise.
pub trait SocketAddress:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// The `AF_*` constant passed to `socket(2)`.
    const FAMILY: libc::c_int;

    fn to_raw(&self) -> RawSockAddr;

    /// Decode an address filled in by the kernel.  Fails with
    /// `ErrorKind::InvalidInput` when the family doesn't match or the
    /// address is truncated.
    fn from_raw(raw: &RawSockAddr) -> io::Result<Self>;
}

/// Kernel `sockaddr` types that are plain integers all the way down, and
/// so can be copied in and out of a `sockaddr_storage`.
trait PlainSockAddr: Copy {}
impl PlainSockAddr for libc::sockaddr_vm {}
impl PlainSockAddr for libc::sockaddr_in {}

/// A `sockaddr_storage` plus the length the kernel reported for it.
pub struct RawSockAddr {
    storage: libc::sockaddr_storage,
    len: libc::socklen_t,
}

impl RawSockAddr {
    /// An all-zero buffer sized for any address, ready to be filled in by
    /// `accept4(2)` or `getsockname(2)`.
    pub fn empty() -> Self {
        Self {
            // SAFETY: sockaddr_storage is plain data; all zeroes is valid.
            storage: unsafe { mem::zeroed() },
            len: mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }

    fn from_value<T: PlainSockAddr>(value: T) -> Self {
        let mut raw = Self::empty();
        debug_assert!(mem::size_of::<T>() <= mem::size_of::<libc::sockaddr_storage>());
        // SAFETY: T is no larger than sockaddr_storage and has no padding
        // invariants; write_unaligned tolerates any alignment.
        unsafe {
            std::ptr::write_unaligned((&raw mut raw.storage).cast::<T>(), value);
        }
        raw.len = mem::size_of::<T>() as libc::socklen_t;
        raw
    }

    fn read_as<T: PlainSockAddr>(&self, family: libc::c_int) -> io::Result<T> {
        if self.family() != family {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "unexpected address family {} (wanted {})",
                    self.family(),
                    family
                ),
            ));
        }
        if (self.len as usize) < mem::size_of::<T>() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("address of {} bytes is truncated", self.len),
            ));
        }
        // SAFETY: the family and length checks above mean the kernel wrote
        // a complete T; every bit pattern is a valid T.
        Ok(unsafe { std::ptr::read_unaligned((&raw const self.storage).cast::<T>()) })
    }

    pub fn family(&self) -> libc::c_int {
        libc::c_int::from(self.storage.ss_family)
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        (&raw const self.storage).cast()
    }

    pub(crate) fn as_mut_parts(&mut self) -> (*mut libc::sockaddr, *mut libc::socklen_t) {
        ((&raw mut self.storage).cast(), &raw mut self.len)
    }
}

impl fmt::Debug for RawSockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSockAddr")
            .field("family", &self.family())
            .field("len", &self.len)
            .finish()
    }
}

/// A vsock address: a context ID naming the machine and a port on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VsockAddr {
    cid: u32,
    port: u32,
}

impl VsockAddr {
    pub const fn new(cid: u32, port: u32) -> Self {
        Self { cid, port }
    }

    pub const fn cid(&self) -> u32 {
        self.cid
    }

    pub const fn port(&self) -> u32 {
        self.port
    }
}

impl fmt::Display for VsockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cid {
            VMADDR_CID_HYPERVISOR => write!(f, "hypervisor({})", self.cid)?,
            VMADDR_CID_LOCAL => write!(f, "local({})", self.cid)?,
            VMADDR_CID_HOST => write!(f, "host({})", self.cid)?,
            cid => write!(f, "vm({cid})")?,
        }
        write!(f, ":{}", self.port)
    }
}

impl SocketAddress for VsockAddr {
    const FAMILY: libc::c_int = libc::AF_VSOCK;

    fn to_raw(&self) -> RawSockAddr {
        // SAFETY: sockaddr_vm is plain data; all zeroes is valid.
        let mut sa: libc::sockaddr_vm = unsafe { mem::zeroed() };
        sa.svm_family = Self::FAMILY as libc::sa_family_t;
        sa.svm_cid = self.cid;
        sa.svm_port = self.port;
        RawSockAddr::from_value(sa)
    }

    fn from_raw(raw: &RawSockAddr) -> io::Result<Self> {
        let sa: libc::sockaddr_vm = raw.read_as(Self::FAMILY)?;
        Ok(Self::new(sa.svm_cid, sa.svm_port))
    }
}

impl SocketAddress for SocketAddrV4 {
    const FAMILY: libc::c_int = libc::AF_INET;

    fn to_raw(&self) -> RawSockAddr {
        // SAFETY: sockaddr_in is plain data; all zeroes is valid.
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        sa.sin_family = Self::FAMILY as libc::sa_family_t;
        sa.sin_port = self.port().to_be();
        sa.sin_addr = libc::in_addr {
            s_addr: u32::from_ne_bytes(self.ip().octets()),
        };
        RawSockAddr::from_value(sa)
    }

    fn from_raw(raw: &RawSockAddr) -> io::Result<Self> {
        let sa: libc::sockaddr_in = raw.read_as(Self::FAMILY)?;
        Ok(SocketAddrV4::new(
            Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes()),
            u16::from_be(sa.sin_port),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsock_display_names_well_known_cids() {
        assert_eq!(
            VsockAddr::new(VMADDR_CID_HYPERVISOR, 1024).to_string(),
            "hypervisor(0):1024"
        );
        assert_eq!(VsockAddr::new(VMADDR_CID_LOCAL, 5).to_string(), "local(1):5");
        assert_eq!(VsockAddr::new(VMADDR_CID_HOST, 80).to_string(), "host(2):80");
        assert_eq!(VsockAddr::new(3, 9999).to_string(), "vm(3):9999");
    }

    #[test]
    fn vsock_raw_encoding() {
        let addr = VsockAddr::new(42, 1234);
        let raw = addr.to_raw();
        assert_eq!(raw.family(), libc::AF_VSOCK);
        assert_eq!(raw.len() as usize, mem::size_of::<libc::sockaddr_vm>());
        assert_eq!(VsockAddr::from_raw(&raw).unwrap(), addr);
    }

    #[test]
    fn inet_port_is_network_order() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 0x1234);
        let raw = addr.to_raw();
        let sa: libc::sockaddr_in = raw.read_as(libc::AF_INET).unwrap();
        assert_eq!(sa.sin_port.to_ne_bytes(), [0x12, 0x34]);
        assert_eq!(sa.sin_addr.s_addr.to_ne_bytes(), [10, 1, 2, 3]);
        assert_eq!(SocketAddrV4::from_raw(&raw).unwrap(), addr);
    }

    #[test]
    fn family_mismatch_is_rejected() {
        let raw = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 80).to_raw();
        let err = VsockAddr::from_raw(&raw).unwrap_err();
        k9::assert_equal!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn truncated_address_is_rejected() {
        let mut raw = VsockAddr::new(3, 3).to_raw();
        raw.len = 4;
        let err = VsockAddr::from_raw(&raw).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn empty_raw_address_reports_full_capacity() {
        let raw = RawSockAddr::empty();
        assert!(!raw.is_empty());
        assert_eq!(
            raw.len() as usize,
            mem::size_of::<libc::sockaddr_storage>()
        );
        assert!(format!("{raw:?}").contains("RawSockAddr"));
    }
}
