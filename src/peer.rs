//! The remote peer as seen by the socket layer: its endpoint, the endpoint
//! lock, and the transmit-byte counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use crate::device::Device;
use crate::endpoint::{Endpoint, EndpointAddr};
use crate::recv::RxPacket;

pub struct Peer {
    device: Arc<Device>,
    /// Reader-preferring lock: the send hot path takes it shared, endpoint
    /// writers (resolver commit, roaming updates) take it exclusive.
    pub(crate) endpoint: RwLock<Endpoint>,
    tx_bytes: AtomicU64,
}

impl Peer {
    /// Create a peer with an empty endpoint.
    pub fn new(device: Arc<Device>) -> Arc<Self> {
        Arc::new(Self {
            device,
            endpoint: RwLock::new(Endpoint::default()),
            tx_bytes: AtomicU64::new(0),
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Payload bytes successfully submitted toward this peer.
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn add_tx_bytes(&self, bytes: u64) {
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Copy of the current endpoint.
    pub fn endpoint_snapshot(&self) -> Endpoint {
        (*self.endpoint.read()).clone()
    }

    /// Adopt a new endpoint, typically learned from an authenticated
    /// handshake or a roamed data packet.
    ///
    /// The unlocked equality probe first is deliberate: endpoints change
    /// rarely, and two racing writers carrying the same value are both
    /// correct. Divergent racing writers resolve last-writer-wins; the peer
    /// self-corrects on its next authenticated packet.
    pub fn set_endpoint(&self, endpoint: &Endpoint) {
        if let Some(current) = self.endpoint.try_read()
            && *current == *endpoint
        {
            return;
        }
        let mut ep = self.endpoint.write();
        match endpoint.addr {
            EndpointAddr::V4(sa) => {
                let (addr, interface_index) = endpoint.src_v4();
                ep.addr = EndpointAddr::V4(sa);
                ep.set_source_v4(addr, interface_index, endpoint.routing_generation);
            }
            EndpointAddr::V6(sa) => {
                let (addr, interface_index) = endpoint.src_v6();
                ep.addr = EndpointAddr::V6(sa);
                ep.set_source_v6(addr, interface_index, endpoint.routing_generation);
            }
            EndpointAddr::None => return,
        }
        ep.update_generation = ep.update_generation.wrapping_add(1);
    }

    /// Adopt the endpoint a received packet arrived from. Packets without a
    /// supported family or PKTINFO control message are ignored.
    pub fn set_endpoint_from_packet(&self, packet: &RxPacket) {
        if let Ok(endpoint) = packet.endpoint(self.device.stack().generations()) {
            self.set_endpoint(&endpoint);
        }
    }

    /// Drop the cached source binding so the next send re-resolves against
    /// the live forwarding table.
    pub fn clear_endpoint_src(&self) {
        let mut ep = self.endpoint.write();
        ep.clear_source();
        ep.update_generation = ep.update_generation.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::SourceBinding;
    use std::net::Ipv4Addr;

    // Peer construction needs a device and stack; endpoint-store behavior
    // that does not touch them is covered here through a bare lock, and the
    // full paths through `Peer` are exercised in the integration tests.

    fn sample_endpoint() -> Endpoint {
        let mut ep = Endpoint::new("192.0.2.10:51820".parse().unwrap());
        ep.set_source_v4(Ipv4Addr::new(10, 0, 0, 1), 3, 5);
        ep
    }

    fn store(current: &RwLock<Endpoint>, new: &Endpoint) {
        // Mirrors Peer::set_endpoint without the device plumbing.
        if let Some(cur) = current.try_read()
            && *cur == *new
        {
            return;
        }
        let mut ep = current.write();
        if let EndpointAddr::V4(sa) = new.addr {
            let (addr, interface_index) = new.src_v4();
            ep.addr = EndpointAddr::V4(sa);
            ep.set_source_v4(addr, interface_index, new.routing_generation);
            ep.update_generation = ep.update_generation.wrapping_add(1);
        }
    }

    #[test]
    fn identical_update_leaves_generation_alone() {
        let lock = RwLock::new(Endpoint::default());
        let target = sample_endpoint();

        store(&lock, &target);
        let first = lock.read().update_generation();
        assert_eq!(*lock.read(), target);

        // Second store of the same endpoint takes the optimistic exit.
        store(&lock, &target);
        assert_eq!(lock.read().update_generation(), first);
    }

    #[test]
    fn divergent_update_bumps_generation() {
        let lock = RwLock::new(Endpoint::default());
        store(&lock, &sample_endpoint());
        let before = lock.read().update_generation();

        let mut moved = sample_endpoint();
        moved.set_source_v4(Ipv4Addr::new(10, 0, 0, 2), 4, 5);
        store(&lock, &moved);
        assert_eq!(lock.read().update_generation(), before.wrapping_add(1));
        assert_eq!(
            lock.read().source(),
            SourceBinding::V4 {
                addr: Ipv4Addr::new(10, 0, 0, 2),
                interface_index: 4
            }
        );
    }
}
