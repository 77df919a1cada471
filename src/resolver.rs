//! Source-address resolution against the live forwarding table.
//!
//! Each send needs a source binding (source address + egress interface) that
//! matches what the routing stack would pick for the peer's remote address,
//! pinned into the datagram's PKTINFO control message. The binding is cached
//! on the endpoint and re-resolved only when the family-wide routing
//! generation has moved on or the cache was cleared.

use spin::RwLockReadGuard;

use crate::endpoint::{Endpoint, SourceBinding};
use crate::error::Error;
use crate::metrics;
use crate::peer::Peer;
use crate::routing::Family;

struct Candidate {
    prefix_len: u8,
    metric: u32,
    interface_index: u32,
}

/// Ensure the peer's endpoint carries a live source binding, returning with
/// the endpoint lock held shared so the caller can snapshot the endpoint
/// before the next writer gets in.
///
/// Runs at passive level: the forwarding-table scan and best-source query may
/// block, and both happen with the endpoint lock released. The commit
/// re-checks the endpoint's update generation and restarts if a writer got
/// in between, so a stale lookup is never written over fresher state.
///
/// Errors are returned with the lock released: [`Error::UnreachableAddress`]
/// when no forwarding entry covers the remote (or no remote is configured),
/// [`Error::NetworkPath`] when the OS cannot produce a source address on the
/// chosen interface, and forwarding-table enumeration failures verbatim.
///
/// TODO: cache negative results; a flood of spoofed-source packets that roam
/// the endpoint can force a forwarding-table scan per pong.
pub(crate) fn resolve_source<'a>(peer: &'a Peer) -> Result<RwLockReadGuard<'a, Endpoint>, Error> {
    let stack = peer.device().stack();
    let routes = stack.routes();
    let generations = stack.generations();
    let own_luid = peer.device().luid();

    loop {
        let guard = peer.endpoint.read();
        let snapshot = guard.update_generation();
        let Some(family) = guard.family() else {
            return Err(Error::UnreachableAddress);
        };
        if cache_is_live(&guard, family, generations.current(family)) {
            return Ok(guard);
        }
        let remote = guard.remote().ok_or(Error::UnreachableAddress)?;
        drop(guard);

        // Passive-level work, no lock held.
        let table = routes.forward_table(family)?;
        metrics::ROUTE_RESOLVES.increment();

        let mut best: Option<Candidate> = None;
        for row in &table {
            // Never route tunnel traffic back through the tunnel itself.
            if row.luid == own_luid {
                continue;
            }
            if let Some(b) = &best
                && row.prefix.len < b.prefix_len
            {
                continue;
            }
            if !row.prefix.contains(&remote.ip()) {
                continue;
            }
            // Interfaces that are down or whose metadata cannot be read are
            // not candidates.
            let Ok(interface) = routes.interface_row(row.luid) else {
                continue;
            };
            if !interface.up {
                continue;
            }
            let Ok(ip_interface) = routes.ip_interface_row(family, row.luid) else {
                continue;
            };
            let metric = row.metric.saturating_add(ip_interface.metric);
            if let Some(b) = &best
                && row.prefix.len == b.prefix_len
                && metric > b.metric
            {
                continue;
            }
            best = Some(Candidate {
                prefix_len: row.prefix.len,
                metric,
                interface_index: row.interface_index,
            });
        }
        let Some(best) = best else {
            return Err(Error::UnreachableAddress);
        };
        let source = routes
            .best_source(best.interface_index, &remote)
            .map_err(|_| Error::NetworkPath)?;

        let mut ep = peer.endpoint.write();
        if ep.update_generation() != snapshot {
            // Another writer mutated the endpoint; our lookup may be stale.
            drop(ep);
            continue;
        }
        match (family, source) {
            (Family::V4, std::net::IpAddr::V4(addr)) => {
                ep.set_source_v4(addr, best.interface_index, generations.current(family));
            }
            (Family::V6, std::net::IpAddr::V6(addr)) => {
                ep.set_source_v6(addr, best.interface_index, generations.current(family));
            }
            _ => {
                drop(ep);
                return Err(Error::NetworkPath);
            }
        }
        ep.update_generation = ep.update_generation.wrapping_add(1);
        let committed = ep.update_generation;
        drop(ep);

        let guard = peer.endpoint.read();
        if guard.update_generation() != committed {
            drop(guard);
            continue;
        }
        return Ok(guard);
    }
}

fn cache_is_live(endpoint: &Endpoint, family: Family, current_generation: u32) -> bool {
    if endpoint.routing_generation() != current_generation {
        return false;
    }
    match (family, endpoint.source()) {
        (
            Family::V4,
            SourceBinding::V4 {
                interface_index, ..
            },
        )
        | (
            Family::V6,
            SourceBinding::V6 {
                interface_index, ..
            },
        ) => interface_index != 0,
        _ => false,
    }
}
