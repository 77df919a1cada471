//! The tunnel device as seen by the socket layer, and the collaborator
//! interface packets are handed to.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use spin::Mutex;

use crate::buffer::TxDatagram;
use crate::counter::CounterGroup;
use crate::provider::OwnerHandle;
use crate::recv::RxPacket;
use crate::registry::RcuPair;
use crate::routing::Luid;
use crate::socket::Socket;
use crate::stack::Stack;

/// Packet-plane collaborator: the crypto/demultiplex layer above the sockets.
pub trait PacketHandler: Send + Sync {
    /// Take ownership of a batch of received packets for decryption and
    /// dispatch. Dropping a packet releases its indication to the provider.
    fn packet_receive(&self, device: &Arc<Device>, packets: Vec<RxPacket>);

    /// Return send buffers to their owner, after completion or on a
    /// synchronous send failure.
    fn free_send_list(&self, device: &Arc<Device>, datagrams: Vec<TxDatagram>);
}

/// Per-device traffic statistics, shard-counted so hot-path updates from
/// concurrent senders and receivers do not contend.
pub struct DeviceStats {
    group: CounterGroup,
}

const OUT_OCTETS: usize = 0;
const OUT_UNICAST_OCTETS: usize = 1;
const OUT_UNICAST_PACKETS: usize = 2;
const IN_DISCARDS: usize = 3;

impl DeviceStats {
    fn new() -> Self {
        Self {
            group: CounterGroup::new(),
        }
    }

    pub(crate) fn add_tx(&self, bytes: u64, packets: u64) {
        self.group.add(OUT_OCTETS, bytes);
        self.group.add(OUT_UNICAST_OCTETS, bytes);
        self.group.add(OUT_UNICAST_PACKETS, packets);
    }

    pub(crate) fn inc_in_discards(&self) {
        self.group.increment(IN_DISCARDS);
    }

    /// Total payload bytes handed to the provider.
    pub fn out_octets(&self) -> u64 {
        self.group.value(OUT_OCTETS)
    }

    pub fn out_unicast_octets(&self) -> u64 {
        self.group.value(OUT_UNICAST_OCTETS)
    }

    pub fn out_unicast_packets(&self) -> u64 {
        self.group.value(OUT_UNICAST_PACKETS)
    }

    /// Received indications released without delivery.
    pub fn in_discards(&self) -> u64 {
        self.group.value(IN_DISCARDS)
    }
}

/// One tunnel device and its pair of published sockets.
pub struct Device {
    stack: Arc<Stack>,
    luid: Luid,
    owner: OwnerHandle,
    handler: Arc<dyn PacketHandler>,
    is_up: AtomicBool,
    incoming_port: AtomicU16,
    /// Serializes socket publication; readers go through `sockets` unlocked.
    pub(crate) update_lock: Mutex<()>,
    pub(crate) sockets: RcuPair<Socket>,
    stats: DeviceStats,
}

impl Device {
    pub fn new(
        stack: Arc<Stack>,
        luid: Luid,
        owner: OwnerHandle,
        handler: Arc<dyn PacketHandler>,
    ) -> Arc<Self> {
        let sockets = RcuPair::new(stack.config().reader_shards);
        Arc::new(Self {
            stack,
            luid,
            owner,
            handler,
            is_up: AtomicBool::new(false),
            incoming_port: AtomicU16::new(0),
            update_lock: Mutex::new(()),
            sockets,
            stats: DeviceStats::new(),
        })
    }

    /// LUID of the tunnel's own interface; forwarding-table entries pointing
    /// back at it are never used to reach a peer.
    pub fn luid(&self) -> Luid {
        self.luid
    }

    pub fn is_up(&self) -> bool {
        self.is_up.load(Ordering::Relaxed)
    }

    /// Flip the device's up state. Receive-side traffic is discarded while
    /// the device is down.
    pub fn set_up(&self, up: bool) {
        self.is_up.store(up, Ordering::Relaxed);
    }

    /// The local UDP port the device is listening on; learned from the OS
    /// when binding requested port 0.
    pub fn incoming_port(&self) -> u16 {
        self.incoming_port.load(Ordering::Relaxed)
    }

    pub(crate) fn set_incoming_port(&self, port: u16) {
        self.incoming_port.store(port, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }

    pub(crate) fn stack(&self) -> &Arc<Stack> {
        &self.stack
    }

    pub(crate) fn owner(&self) -> OwnerHandle {
        self.owner
    }

    pub(crate) fn handler(&self) -> &Arc<dyn PacketHandler> {
        &self.handler
    }
}
