//! The receive dispatcher: provider-invoked delivery of datagram indications.
//!
//! Indications arrive in provider context at dispatch level. The dispatcher
//! wraps each accepted indication in an [`RxPacket`] carrying a back-pointer
//! to its originating socket and a rundown acquisition, then hands the batch
//! to the packet handler. Indications are discarded (released straight back
//! to the provider, counted in device statistics) when the device is down,
//! the socket is tearing down, or the payload cannot be length-checked.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::device::Device;
use crate::endpoint::{Endpoint, endpoint_from_datagram};
use crate::error::Error;
use crate::metrics;
use crate::provider::{DatagramIndication, RecvDisposition};
use crate::routing::RoutingGenerations;
use crate::socket::Socket;

/// One received datagram retained by the socket layer.
///
/// Holds the provider's indication, the originating socket, and one rundown
/// acquisition on that socket; dropping the packet releases both, so the
/// provider gets its buffers back exactly when the packet handler is done.
pub struct RxPacket {
    datagram: DatagramIndication,
    origin: Arc<Socket>,
}

impl RxPacket {
    pub fn datagram(&self) -> &DatagramIndication {
        &self.datagram
    }

    pub fn remote(&self) -> std::net::SocketAddr {
        self.datagram.remote()
    }

    pub fn payload(&self) -> &bytes::Bytes {
        self.datagram.payload()
    }

    /// The socket this packet arrived on.
    pub fn socket(&self) -> &Arc<Socket> {
        &self.origin
    }

    /// The endpoint the datagram arrived from, for reply routing and
    /// roaming updates.
    pub(crate) fn endpoint(&self, generations: &RoutingGenerations) -> Result<Endpoint, Error> {
        endpoint_from_datagram(self.datagram.remote(), self.datagram.control(), generations)
    }
}

impl fmt::Debug for RxPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxPacket")
            .field("datagram", &self.datagram)
            .finish()
    }
}

impl Drop for RxPacket {
    fn drop(&mut self) {
        self.origin.rundown.release();
    }
}

/// Receive callback bound to one socket at creation time; the provider
/// invokes [`deliver`](Self::deliver) with each batch of indications.
pub struct ReceiveFromEvent {
    socket: Weak<Socket>,
}

impl ReceiveFromEvent {
    pub(crate) fn new(socket: Weak<Socket>) -> Self {
        Self { socket }
    }

    /// Dispatch a batch of received indications.
    ///
    /// Returns [`RecvDisposition::Pending`] when at least one indication was
    /// retained and handed to the packet handler; the provider gets each
    /// retained indication back when its wrapper is dropped. Indications the
    /// dispatcher cannot accept are released before this returns.
    pub fn deliver(&self, indications: Vec<DatagramIndication>) -> RecvDisposition {
        let Some(socket) = self.socket.upgrade() else {
            return RecvDisposition::Complete;
        };
        let Some(device) = socket.device() else {
            return RecvDisposition::Complete;
        };

        let mut accepted = Vec::new();
        for indication in indications {
            if u32::try_from(indication.payload().len()).is_err() {
                discard(&device, indication);
                continue;
            }
            if !device.is_up() || !socket.rundown.acquire() {
                discard(&device, indication);
                continue;
            }
            metrics::RECV_DATAGRAMS.increment();
            accepted.push(RxPacket {
                datagram: indication,
                origin: Arc::clone(&socket),
            });
        }

        if accepted.is_empty() {
            RecvDisposition::Complete
        } else {
            device.handler().packet_receive(&device, accepted);
            RecvDisposition::Pending
        }
    }
}

fn discard(device: &Arc<Device>, indication: DatagramIndication) {
    device.stats().inc_in_discards();
    metrics::RECV_DISCARDED.increment();
    drop(indication);
}
