use thiserror::Error;

/// Errors produced by the socket layer.
///
/// The enum is `Clone + Eq` so the lifecycle controller can latch a failing
/// init status and hand the same value back to every later caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Send-context pool exhaustion or a failed provider allocation.
    #[error("insufficient resources")]
    InsufficientResources,
    /// No socket exists for the required address family at send time.
    #[error("network unreachable")]
    NetworkUnreachable,
    /// No forwarding-table entry covers the peer's remote address.
    #[error("no route to remote address")]
    UnreachableAddress,
    /// The OS could not produce a source address on the chosen interface.
    #[error("bad network path")]
    NetworkPath,
    /// A received datagram has an unsupported address family or no PKTINFO
    /// control message.
    #[error("invalid address")]
    InvalidAddress,
    /// The datagram list was empty; there is nothing to submit.
    #[error("already complete")]
    AlreadyComplete,
    /// The requested port is taken on one of the address families.
    #[error("address already in use")]
    AddressInUse,
    /// The socket layer has not been initialized, or init failed and the
    /// failure was latched.
    #[error("socket layer not initialized")]
    NotInitialized,
    /// Configuration value out of range.
    #[error("configuration: {0}")]
    Config(&'static str),
    /// Any other status surfaced verbatim from the socket or route provider.
    #[error("provider status {0:#x}")]
    Os(i32),
}
