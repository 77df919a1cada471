//! Routing-stack contract and the family-wide routing generations.
//!
//! The socket layer never walks OS routing structures directly; it asks a
//! [`RouteProvider`] for forwarding-table rows, interface metadata, and
//! best-source queries, and it subscribes to route-change notifications.
//! Every notification bumps a per-family generation counter; cached source
//! bindings stamped with an older generation are considered stale and get
//! re-resolved on the next send.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::Error;
use crate::metrics;

/// Address family of tunnel traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

/// Locally-unique identifier of a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Luid(pub u64);

/// Destination prefix of a forwarding-table row, in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPrefix {
    pub addr: IpAddr,
    pub len: u8,
}

impl IpPrefix {
    /// Whether `addr` falls inside this prefix.
    ///
    /// A zero-length prefix matches every address of its family; otherwise the
    /// top `len` bits of `addr` must equal the top `len` bits of the prefix in
    /// network byte order. Addresses of the other family never match.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        if self.len == 0 {
            return matches!(
                (self.addr, addr),
                (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
            );
        }
        match (&self.addr, addr) {
            (IpAddr::V4(p), IpAddr::V4(a)) if self.len <= 32 => {
                prefix_bits_eq(&p.octets(), &a.octets(), self.len as usize)
            }
            (IpAddr::V6(p), IpAddr::V6(a)) if self.len <= 128 => {
                prefix_bits_eq(&p.octets(), &a.octets(), self.len as usize)
            }
            _ => false,
        }
    }
}

fn prefix_bits_eq(prefix: &[u8], addr: &[u8], bits: usize) -> bool {
    let whole = bits / 8;
    let leftover = bits % 8;
    if prefix[..whole] != addr[..whole] {
        return false;
    }
    if leftover == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - leftover);
    (prefix[whole] ^ addr[whole]) & mask == 0
}

/// One row of the OS forwarding table.
#[derive(Debug, Clone)]
pub struct RouteRow {
    pub prefix: IpPrefix,
    pub luid: Luid,
    pub interface_index: u32,
    pub metric: u32,
}

/// Physical-interface metadata.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceRow {
    /// Operational status: only interfaces that are up carry traffic.
    pub up: bool,
}

/// Per-family interface metadata.
#[derive(Debug, Clone, Copy)]
pub struct IpInterfaceRow {
    /// Interface metric, added to the route metric when scoring candidates.
    pub metric: u32,
}

/// Routing-stack queries and notifications the resolver depends on.
///
/// All query methods may block; the resolver only calls them at passive level
/// with no endpoint lock held.
pub trait RouteProvider: Send + Sync {
    /// Full forwarding table for one family.
    fn forward_table(&self, family: Family) -> Result<Vec<RouteRow>, Error>;
    /// Physical-interface row by LUID.
    fn interface_row(&self, luid: Luid) -> Result<InterfaceRow, Error>;
    /// Per-family interface row by LUID.
    fn ip_interface_row(&self, family: Family, luid: Luid) -> Result<IpInterfaceRow, Error>;
    /// Best local source address for reaching `remote` out of the interface
    /// with index `interface_index`.
    fn best_source(&self, interface_index: u32, remote: &SocketAddr) -> Result<IpAddr, Error>;
    /// Register for route-change notifications. The provider must call
    /// [`RouteWatcher::notify`] on every change to the family's routing
    /// table, until the returned subscription is dropped.
    fn watch_routes(
        &self,
        family: Family,
        watcher: RouteWatcher,
    ) -> Result<Box<dyn RouteSubscription>, Error>;
}

/// Handle for an active route-change subscription; dropping it cancels the
/// notification callback.
pub trait RouteSubscription: Send + Sync {}

/// Callback handed to the route provider at subscription time.
pub struct RouteWatcher {
    generations: Arc<RoutingGenerations>,
    family: Family,
}

impl RouteWatcher {
    pub(crate) fn new(generations: Arc<RoutingGenerations>, family: Family) -> Self {
        Self {
            generations,
            family,
        }
    }

    /// Record one routing-table change.
    pub fn notify(&self) {
        self.generations.bump(self.family);
        metrics::ROUTE_INVALIDATIONS.increment();
    }
}

/// Two process-wide counters, one per family, bumped on every routing-table
/// change.
///
/// Counters start at 1 and advance by 2, so a zeroed (or cleared) endpoint
/// stamp can never compare equal to the live value and always forces a
/// re-resolution. Readers use relaxed loads: exact currency is unnecessary,
/// a stale miss just triggers one cheap, idempotent extra resolution.
pub struct RoutingGenerations {
    v4: AtomicU32,
    v6: AtomicU32,
}

impl RoutingGenerations {
    pub fn new() -> Self {
        Self {
            v4: AtomicU32::new(1),
            v6: AtomicU32::new(1),
        }
    }

    #[inline]
    pub fn current(&self, family: Family) -> u32 {
        match family {
            Family::V4 => self.v4.load(Ordering::Relaxed),
            Family::V6 => self.v6.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(&self, family: Family) {
        match family {
            Family::V4 => self.v4.fetch_add(2, Ordering::Relaxed),
            Family::V6 => self.v6.fetch_add(2, Ordering::Relaxed),
        };
    }
}

impl Default for RoutingGenerations {
    fn default() -> Self {
        Self::new()
    }
}
