//! Socket objects and the bind/publish lifecycle.
//!
//! A [`Socket`] pairs a provider handle with rundown protection over
//! in-flight received indications. Construction happens off to the side;
//! publication into the device's socket table is what makes a socket visible
//! to senders, and displacement from the table plus a grace period plus a
//! rundown drain is what makes it closable.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};

use crate::device::Device;
use crate::error::Error;
use crate::provider::{ProviderSocket, SocketOption};
use crate::recv::ReceiveFromEvent;
use crate::routing::Family;
use crate::rundown::Rundown;

/// One bound tunnel socket.
pub struct Socket {
    /// Non-owning: the device outlives its sockets by construction
    /// ([`Device::shutdown`] unpublishes both sockets and waits out the
    /// grace period before the device can go away).
    device: Weak<Device>,
    /// Set once creation succeeds; empty only mid-construction.
    handle: OnceLock<Arc<dyn ProviderSocket>>,
    /// Tracks received indications still held by the packet handler.
    pub(crate) rundown: Rundown,
}

impl Socket {
    pub(crate) fn device(&self) -> Option<Arc<Device>> {
        self.device.upgrade()
    }

    pub(crate) fn provider_handle(&self) -> Option<Arc<dyn ProviderSocket>> {
        self.handle.get().cloned()
    }

    /// Drain in-flight receive indications, then close the provider socket.
    /// Callers guarantee the socket is no longer published.
    pub(crate) fn close(&self) {
        self.rundown.wait_for_release();
        if let Some(handle) = self.handle.get() {
            handle.close();
        }
    }
}

/// Create a datagram socket for `addr`'s family, configure it, bind it, and
/// report the local address the OS chose (which reveals the assigned port
/// when `addr` requested port 0).
pub(crate) fn create_and_bind(
    device: &Arc<Device>,
    addr: SocketAddr,
) -> Result<(Arc<Socket>, SocketAddr), Error> {
    let family = Family::of(&addr);
    let socket = Arc::new(Socket {
        device: Arc::downgrade(device),
        handle: OnceLock::new(),
        rundown: Rundown::new(),
    });
    let receiver = ReceiveFromEvent::new(Arc::downgrade(&socket));
    let handle = device
        .stack()
        .provider()
        .create_socket(family, device.owner(), receiver)?;
    let _ = socket.handle.set(Arc::clone(&handle));

    let configure = || -> Result<SocketAddr, Error> {
        match family {
            Family::V4 => handle.set_option(SocketOption::UdpNoChecksum)?,
            Family::V6 => handle.set_option(SocketOption::V6Only)?,
        }
        handle.set_option(SocketOption::PktInfo(family))?;
        handle.bind(addr).map_err(|error| {
            tracing::warn!(%addr, %error, "could not bind socket");
            error
        })?;
        handle.local_addr()
    };
    match configure() {
        Ok(local) => Ok((socket, local)),
        Err(error) => {
            socket.close();
            Err(error)
        }
    }
}

impl Device {
    /// Create and publish the device's socket pair on `port`, where 0 means
    /// "any port free on both families".
    ///
    /// The v4 socket binds first; the v6 socket then reuses whatever port v4
    /// got. If the v6 bind loses that port to a racing process and the
    /// original request was a wildcard, the whole pair is rebound on a fresh
    /// port, up to the configured retry budget.
    pub fn socket_init(self: &Arc<Self>, port: u16) -> Result<(), Error> {
        let stack = self.stack();
        let mut retries = 0u32;
        loop {
            let mut new4 = None;
            let mut chosen = port;
            if stack.has_v4() {
                let (socket, local) =
                    create_and_bind(self, SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
                chosen = local.port();
                new4 = Some(socket);
            }

            let mut new6 = None;
            if stack.has_v6() {
                match create_and_bind(self, SocketAddr::from((Ipv6Addr::UNSPECIFIED, chosen))) {
                    Ok((socket, local)) => {
                        chosen = local.port();
                        new6 = Some(socket);
                    }
                    Err(error) => {
                        if let Some(socket) = new4.take() {
                            socket.close();
                        }
                        if error == Error::AddressInUse
                            && port == 0
                            && retries < stack.config().bind_retries
                        {
                            retries += 1;
                            continue;
                        }
                        return Err(error);
                    }
                }
            }

            let port = if new4.is_some() || new6.is_some() {
                chosen
            } else {
                port
            };
            self.socket_reinit(new4, new6, port);
            return Ok(());
        }
    }

    /// Publish a new socket pair, retiring the old one.
    ///
    /// The swap happens under the exclusive update lock; the displaced
    /// sockets are closed only after a grace period in which every reader
    /// that could still hold them has left its read section. Closing earlier
    /// would hand freed sockets to concurrent senders.
    pub fn socket_reinit(
        &self,
        new4: Option<Arc<Socket>>,
        new6: Option<Arc<Socket>>,
        port: u16,
    ) {
        let guard = self.update_lock.lock();
        let any_new = new4.is_some() || new6.is_some();
        let old4 = self.sockets.swap_v4(new4);
        let old6 = self.sockets.swap_v6(new6);
        if any_new {
            self.set_incoming_port(port);
        }
        drop(guard);

        self.sockets.synchronize();
        if let Some(socket) = old4 {
            socket.close();
        }
        if let Some(socket) = old6 {
            socket.close();
        }
        tracing::debug!(port, "socket pair republished");
    }

    /// Unpublish both sockets and wait until nothing references them. Part
    /// of device teardown.
    pub fn shutdown(&self) {
        self.socket_reinit(None, None, 0);
    }
}
