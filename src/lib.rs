//! tunsock — the UDP socket layer of a WireGuard-style tunnel data plane.
//!
//! The crate owns the pair of datagram sockets (one per address family) that
//! all encrypted tunnel traffic flows through, and it maintains, for every
//! remote peer, an endpoint binding recording both the peer's remote address
//! and the local source address/interface the OS will use to reach it.
//!
//! Three concerns carry the weight:
//!
//! - **Source-address resolution and caching.** Every outbound datagram gets
//!   a PKTINFO control message pinning its egress interface and source IP, so
//!   asymmetric routing, multi-homing, and roaming do not break the tunnel.
//!   Cached bindings are stamped with a family-wide routing generation and
//!   re-resolved when the OS routing table changes.
//! - **Read-mostly publication.** Senders and the receive dispatcher find the
//!   current sockets through lock-free read sections; socket replacement
//!   swaps pointers under an exclusive lock and waits out a grace period plus
//!   a rundown drain before closing what it displaced.
//! - **Asynchronous sends.** Each submission draws a context from a fixed
//!   lookaside pool, snapshots the peer's endpoint by value, and completes
//!   through a consume-once request object that frees the buffers. Providers
//!   without a batched send get a fan-out fallback that still delivers
//!   exactly one completion.
//!
//! The OS surface is expressed as contracts: [`SocketProvider`] /
//! [`ProviderSocket`] stand in for the kernel socket provider and
//! [`RouteProvider`] for the routing stack, so the layer runs identically
//! over a real kernel binding or an in-process test double. The crypto
//! transform, peer queues, and handshake machinery live above, behind
//! [`PacketHandler`].

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod buffer;
pub(crate) mod counter;
pub(crate) mod device;
pub(crate) mod endpoint;
pub(crate) mod metrics;
pub(crate) mod peer;
pub(crate) mod pool;
pub(crate) mod provider;
pub(crate) mod recv;
pub(crate) mod registry;
pub(crate) mod resolver;
pub(crate) mod routing;
pub(crate) mod rundown;
pub(crate) mod send;
pub(crate) mod socket;
pub(crate) mod stack;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;

// ── Re-exports: data plane ──────────────────────────────────────────────

/// A chain of immutable payload segments (one datagram's data).
pub use buffer::DataChain;
/// One encrypted datagram queued for transmission.
pub use buffer::TxDatagram;
/// Runtime configuration.
pub use config::Config;
/// Pin the current thread to a statistics shard.
pub use counter::set_thread_shard;
/// The tunnel device as seen by the socket layer.
pub use device::Device;
/// Per-device traffic statistics.
pub use device::DeviceStats;
/// Packet-plane collaborator receiving inbound packets and reclaiming
/// send buffers.
pub use device::PacketHandler;
/// Prebuilt PKTINFO control-message bytes.
pub use endpoint::ControlTemplate;
/// A peer's remote address plus cached source binding.
pub use endpoint::Endpoint;
/// Remote address of an endpoint.
pub use endpoint::EndpointAddr;
/// Cached source address + egress interface of an endpoint.
pub use endpoint::SourceBinding;
/// Socket-layer errors.
pub use error::Error;
/// A remote peer's endpoint state and transmit counter.
pub use peer::Peer;
/// Wire length of a keepalive datagram.
pub use send::KEEPALIVE_WIRE_LEN;

// ── Re-exports: provider contracts ──────────────────────────────────────

/// One received datagram on loan from the provider.
pub use provider::DatagramIndication;
/// Opaque owning-process token for socket creation.
pub use provider::OwnerHandle;
/// One provider-owned datagram socket.
pub use provider::ProviderSocket;
/// Outcome of a receive-event delivery.
pub use provider::RecvDisposition;
/// Socket options set during construction.
pub use provider::SocketOption;
/// The kernel socket provider.
pub use provider::SocketProvider;
/// One transport the provider supports.
pub use provider::TransportEntry;
/// Address family of a provider transport.
pub use provider::TransportFamily;
/// Socket kind of a provider transport.
pub use provider::TransportKind;
/// Protocol of a provider transport.
pub use provider::TransportProtocol;
/// Per-socket receive callback invoked by the provider.
pub use recv::ReceiveFromEvent;
/// One received datagram retained by the socket layer.
pub use recv::RxPacket;
/// A single-datagram submission and its completion.
pub use send::DatagramSend;
/// A batched submission and its completion.
pub use send::SendRequest;
/// A bound tunnel socket.
pub use socket::Socket;
/// Process-wide lifecycle state shared by every device.
pub use stack::Stack;

// ── Re-exports: routing contracts ───────────────────────────────────────

/// Address family of tunnel traffic.
pub use routing::Family;
/// Physical-interface metadata.
pub use routing::InterfaceRow;
/// Per-family interface metadata.
pub use routing::IpInterfaceRow;
/// Destination prefix of a forwarding-table row.
pub use routing::IpPrefix;
/// Locally-unique interface identifier.
pub use routing::Luid;
/// Routing-stack queries and notifications.
pub use routing::RouteProvider;
/// One row of the OS forwarding table.
pub use routing::RouteRow;
/// Active route-change subscription handle.
pub use routing::RouteSubscription;
/// Route-change callback handed to the provider.
pub use routing::RouteWatcher;
/// Family-wide routing-change counters.
pub use routing::RoutingGenerations;
