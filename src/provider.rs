//! Contracts between the socket layer and the kernel socket provider.
//!
//! The provider owns the actual datagram sockets. This layer only requires
//! the operations below: socket construction and teardown, option setting,
//! bind, asynchronous sends completed through the request objects in
//! [`crate::send`], and delivery of received datagrams through a
//! [`ReceiveFromEvent`](crate::recv::ReceiveFromEvent). Sends must never
//! block; lifecycle operations (create, bind, set-option, close) may.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Error;
use crate::recv::ReceiveFromEvent;
use crate::routing::Family;
use crate::send::{DatagramSend, SendRequest};

/// Opaque token identifying the process that owns sockets created for a
/// device. The provider decides what, if anything, it means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerHandle(pub u64);

/// Address family of a provider transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFamily {
    /// Transport serves both families.
    Unspecified,
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Datagram,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

/// One transport the provider supports, as reported by enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportEntry {
    pub family: TransportFamily,
    pub kind: TransportKind,
    pub protocol: TransportProtocol,
}

/// Socket options the layer sets during construction, before bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// Skip UDP checksums on outgoing v4 datagrams; the tunnel payload is
    /// already authenticated.
    UdpNoChecksum,
    /// Restrict a v6 socket to v6 traffic.
    V6Only,
    /// Deliver a per-datagram PKTINFO control message for the family.
    PktInfo(Family),
}

/// The kernel socket provider.
pub trait SocketProvider: Send + Sync {
    /// Bind to the provider, capturing whatever dispatch state later calls
    /// need. Called once by lifecycle init.
    fn register(&self) -> Result<(), Error>;

    /// Undo [`register`](Self::register).
    fn deregister(&self);

    /// Enumerate supported transports.
    fn transports(&self) -> Result<Vec<TransportEntry>, Error>;

    /// Enable receive-event delivery for datagram sockets created after this
    /// call.
    fn enable_receive_events(&self) -> Result<(), Error>;

    /// Whether the provider offers the batched datagram-send primitive. When
    /// false, batched submissions fan out to per-datagram sends.
    fn supports_batched_send(&self) -> bool;

    /// Create an unbound datagram socket owned by `owner`. Received datagrams
    /// must be handed to `receiver`.
    fn create_socket(
        &self,
        family: Family,
        owner: OwnerHandle,
        receiver: ReceiveFromEvent,
    ) -> Result<Arc<dyn ProviderSocket>, Error>;
}

/// One provider-owned datagram socket.
pub trait ProviderSocket: Send + Sync {
    fn set_option(&self, option: SocketOption) -> Result<(), Error>;

    fn bind(&self, addr: SocketAddr) -> Result<(), Error>;

    /// Local address after bind; reports the OS-assigned port when the bind
    /// requested port 0.
    fn local_addr(&self) -> Result<SocketAddr, Error>;

    /// Submit a batched datagram send. The provider may alias the request's
    /// buffers until it invokes `request.complete`, which it must do exactly
    /// once; submission errors are reported the same way.
    fn send_messages(&self, request: SendRequest);

    /// Submit a single datagram. Same completion contract as
    /// [`send_messages`](Self::send_messages).
    fn send_to(&self, send: DatagramSend);

    /// Close the socket. Only called after the socket's rundown protection
    /// has drained and a publication grace period has elapsed.
    fn close(&self);
}

/// One received datagram, on loan from the provider.
///
/// Dropping the indication releases the underlying buffers back to the
/// provider via the release hook, whether or not the datagram was accepted.
pub struct DatagramIndication {
    remote: SocketAddr,
    payload: Bytes,
    control: Bytes,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl DatagramIndication {
    pub fn new(remote: SocketAddr, payload: Bytes, control: Bytes) -> Self {
        Self {
            remote,
            payload,
            control,
            release: None,
        }
    }

    /// Attach a hook run when the indication is released.
    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    /// Source address of the datagram.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Raw control-message bytes delivered with the datagram.
    pub fn control(&self) -> &Bytes {
        &self.control
    }
}

impl fmt::Debug for DatagramIndication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramIndication")
            .field("remote", &self.remote)
            .field("payload_len", &self.payload.len())
            .field("control_len", &self.control.len())
            .finish()
    }
}

impl Drop for DatagramIndication {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Outcome of a receive-event delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvDisposition {
    /// At least one indication was retained; the provider gets each one back
    /// when its wrapper is dropped.
    Pending,
    /// Every indication was released; the provider may reuse the buffers
    /// immediately.
    Complete,
}
