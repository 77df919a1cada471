//! Peer endpoints: the remote address of a UDP conversation plus the cached
//! local source binding (source address + egress interface) used to reach it.
//!
//! Every endpoint carries a prebuilt PKTINFO control message referencing its
//! source binding; the send pipeline attaches it to each outgoing datagram so
//! the OS keeps using the interface the resolver picked, even across
//! asymmetric routes and multi-homed hosts. Control messages use the native
//! cmsg wire layout so received control blobs can be parsed back with the
//! same arithmetic.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::Error;
use crate::routing::{Family, RoutingGenerations};

// Native cmsg alignment: payloads and successive headers are padded to the
// platform word size.
const WORD: usize = size_of::<usize>();

const fn cmsg_align(len: usize) -> usize {
    (len + WORD - 1) & !(WORD - 1)
}

// cmsghdr: size_t cmsg_len; int cmsg_level; int cmsg_type;
const HDR_LEN: usize = cmsg_align(WORD + 8);
// in_pktinfo: int ipi_ifindex; in_addr ipi_spec_dst; in_addr ipi_addr;
const PKTINFO4_LEN: usize = 12;
// in6_pktinfo: in6_addr ipi6_addr; unsigned int ipi6_ifindex;
const PKTINFO6_LEN: usize = 20;

const CONTROL_CAPACITY: usize = HDR_LEN + cmsg_align(PKTINFO6_LEN);

/// Prebuilt control-message bytes pinning the source address and egress
/// interface of outgoing datagrams.
#[derive(Debug, Clone, Copy)]
pub struct ControlTemplate {
    buf: [u8; CONTROL_CAPACITY],
    len: usize,
}

impl ControlTemplate {
    pub const fn empty() -> Self {
        Self {
            buf: [0; CONTROL_CAPACITY],
            len: 0,
        }
    }

    /// An `IP_PKTINFO` message for a v4 source binding.
    pub fn pktinfo_v4(src: Ipv4Addr, interface_index: u32) -> Self {
        let mut data = [0u8; PKTINFO4_LEN];
        data[..4].copy_from_slice(&(interface_index as i32).to_ne_bytes());
        // ipi_spec_dst stays zero; the source is carried in ipi_addr.
        data[8..12].copy_from_slice(&src.octets());
        Self::build(libc::IPPROTO_IP, libc::IP_PKTINFO, &data)
    }

    /// An `IPV6_PKTINFO` message for a v6 source binding.
    pub fn pktinfo_v6(src: Ipv6Addr, interface_index: u32) -> Self {
        let mut data = [0u8; PKTINFO6_LEN];
        data[..16].copy_from_slice(&src.octets());
        data[16..20].copy_from_slice(&interface_index.to_ne_bytes());
        Self::build(libc::IPPROTO_IPV6, libc::IPV6_PKTINFO, &data)
    }

    fn build(level: i32, ty: i32, data: &[u8]) -> Self {
        let cmsg_len = HDR_LEN + data.len();
        debug_assert!(cmsg_align(cmsg_len) <= CONTROL_CAPACITY);
        let mut buf = [0u8; CONTROL_CAPACITY];
        buf[..WORD].copy_from_slice(&cmsg_len.to_ne_bytes());
        buf[WORD..WORD + 4].copy_from_slice(&level.to_ne_bytes());
        buf[WORD + 4..WORD + 8].copy_from_slice(&ty.to_ne_bytes());
        buf[HDR_LEN..cmsg_len].copy_from_slice(data);
        Self {
            buf,
            // Hand the provider the padded length, as sendmsg expects.
            len: cmsg_align(cmsg_len),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for ControlTemplate {
    fn default() -> Self {
        Self::empty()
    }
}

/// Walk a received control blob and return the payload of the first message
/// matching `(level, ty)`.
pub(crate) fn find_cmsg(control: &[u8], level: i32, ty: i32) -> Option<&[u8]> {
    let mut rest = control;
    loop {
        if rest.len() < HDR_LEN {
            return None;
        }
        let cmsg_len = usize::from_ne_bytes(rest[..WORD].try_into().unwrap());
        if cmsg_len < HDR_LEN || cmsg_len > rest.len() {
            return None;
        }
        let msg_level = i32::from_ne_bytes(rest[WORD..WORD + 4].try_into().unwrap());
        let msg_ty = i32::from_ne_bytes(rest[WORD + 4..WORD + 8].try_into().unwrap());
        if msg_level == level && msg_ty == ty {
            return Some(&rest[HDR_LEN..cmsg_len]);
        }
        let advance = cmsg_align(cmsg_len);
        if advance >= rest.len() {
            return None;
        }
        rest = &rest[advance..];
    }
}

/// Remote address of an endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub enum EndpointAddr {
    #[default]
    None,
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

impl EndpointAddr {
    pub fn family(&self) -> Option<Family> {
        match self {
            EndpointAddr::None => None,
            EndpointAddr::V4(_) => Some(Family::V4),
            EndpointAddr::V6(_) => Some(Family::V6),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match *self {
            EndpointAddr::None => None,
            EndpointAddr::V4(sa) => Some(SocketAddr::V4(sa)),
            EndpointAddr::V6(sa) => Some(SocketAddr::V6(sa)),
        }
    }
}

impl From<SocketAddr> for EndpointAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(sa) => EndpointAddr::V4(sa),
            SocketAddr::V6(sa) => EndpointAddr::V6(sa),
        }
    }
}

/// Cached local source binding: the address and interface the OS should use
/// for the next datagram to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceBinding {
    #[default]
    None,
    V4 {
        addr: Ipv4Addr,
        interface_index: u32,
    },
    V6 {
        addr: Ipv6Addr,
        interface_index: u32,
    },
}

impl SourceBinding {
    pub fn interface_index(&self) -> u32 {
        match *self {
            SourceBinding::None => 0,
            SourceBinding::V4 {
                interface_index, ..
            }
            | SourceBinding::V6 {
                interface_index, ..
            } => interface_index,
        }
    }
}

/// One direction of the UDP conversation with a peer.
///
/// The source binding is live only while its routing-generation stamp equals
/// the family-wide counter and the interface index is non-zero; otherwise the
/// next send re-resolves it.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub(crate) addr: EndpointAddr,
    pub(crate) src: SourceBinding,
    pub(crate) control: ControlTemplate,
    pub(crate) routing_generation: u32,
    pub(crate) update_generation: u32,
}

impl Endpoint {
    /// An endpoint for a configured remote address, with no source binding
    /// yet.
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            addr: remote.into(),
            ..Self::default()
        }
    }

    pub fn family(&self) -> Option<Family> {
        self.addr.family()
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.addr.socket_addr()
    }

    pub fn source(&self) -> SourceBinding {
        self.src
    }

    /// The prebuilt PKTINFO control message for the current source binding.
    pub fn control_bytes(&self) -> &[u8] {
        self.control.as_bytes()
    }

    pub fn routing_generation(&self) -> u32 {
        self.routing_generation
    }

    pub fn update_generation(&self) -> u32 {
        self.update_generation
    }

    pub(crate) fn set_source_v4(&mut self, addr: Ipv4Addr, interface_index: u32, generation: u32) {
        self.src = SourceBinding::V4 {
            addr,
            interface_index,
        };
        self.control = ControlTemplate::pktinfo_v4(addr, interface_index);
        self.routing_generation = generation;
    }

    pub(crate) fn set_source_v6(&mut self, addr: Ipv6Addr, interface_index: u32, generation: u32) {
        self.src = SourceBinding::V6 {
            addr,
            interface_index,
        };
        self.control = ControlTemplate::pktinfo_v6(addr, interface_index);
        self.routing_generation = generation;
    }

    pub(crate) fn clear_source(&mut self) {
        self.src = SourceBinding::None;
        self.control = ControlTemplate::empty();
        self.routing_generation = 0;
    }

    /// Source binding viewed as v4 fields, treating an absent binding as
    /// zeroed.
    pub(crate) fn src_v4(&self) -> (Ipv4Addr, u32) {
        match self.src {
            SourceBinding::V4 {
                addr,
                interface_index,
            } => (addr, interface_index),
            _ => (Ipv4Addr::UNSPECIFIED, 0),
        }
    }

    pub(crate) fn src_v6(&self) -> (Ipv6Addr, u32) {
        match self.src {
            SourceBinding::V6 {
                addr,
                interface_index,
            } => (addr, interface_index),
            _ => (Ipv6Addr::UNSPECIFIED, 0),
        }
    }
}

/// Endpoint identity: same remote (address, port, and v6 scope) and same
/// source binding, or both empty. Generations and the control template are
/// derived bookkeeping and do not participate.
impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        match (&self.addr, &other.addr) {
            (EndpointAddr::None, EndpointAddr::None) => true,
            (EndpointAddr::V4(a), EndpointAddr::V4(b)) => {
                a.ip() == b.ip() && a.port() == b.port() && self.src_v4() == other.src_v4()
            }
            (EndpointAddr::V6(a), EndpointAddr::V6(b)) => {
                a.ip() == b.ip()
                    && a.port() == b.port()
                    && a.scope_id() == b.scope_id()
                    && self.src_v6() == other.src_v6()
            }
            _ => false,
        }
    }
}

impl Eq for Endpoint {}

/// Build an endpoint from a received datagram's source address and PKTINFO
/// control message, stamped with the current routing generation.
pub(crate) fn endpoint_from_datagram(
    remote: SocketAddr,
    control: &[u8],
    generations: &RoutingGenerations,
) -> Result<Endpoint, Error> {
    let mut endpoint = Endpoint::new(remote);
    match remote {
        SocketAddr::V4(_) => {
            let data = find_cmsg(control, libc::IPPROTO_IP, libc::IP_PKTINFO)
                .filter(|d| d.len() >= PKTINFO4_LEN)
                .ok_or(Error::InvalidAddress)?;
            let interface_index =
                i32::from_ne_bytes(data[..4].try_into().unwrap()) as u32;
            let addr = Ipv4Addr::from(<[u8; 4]>::try_from(&data[8..12]).unwrap());
            endpoint.set_source_v4(addr, interface_index, generations.current(Family::V4));
        }
        SocketAddr::V6(_) => {
            let data = find_cmsg(control, libc::IPPROTO_IPV6, libc::IPV6_PKTINFO)
                .filter(|d| d.len() >= PKTINFO6_LEN)
                .ok_or(Error::InvalidAddress)?;
            let addr = Ipv6Addr::from(<[u8; 16]>::try_from(&data[..16]).unwrap());
            let interface_index = u32::from_ne_bytes(data[16..20].try_into().unwrap());
            endpoint.set_source_v6(addr, interface_index, generations.current(Family::V6));
        }
    }
    Ok(endpoint)
}
