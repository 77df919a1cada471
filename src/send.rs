//! The asynchronous send pipeline.
//!
//! Every send draws a context from the stack's lookaside pool, snapshots the
//! peer's endpoint by value (so a concurrent endpoint update cannot retarget
//! an in-flight send), picks the published socket matching the remote's
//! family inside a read section, and submits to the provider. Submission
//! returns immediately; the provider reports the outcome by consuming the
//! request object, which frees the buffers and returns the context to the
//! pool. Asynchronous failures are absorbed — the tunnel layer above owns
//! retransmission.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::buffer::{DataChain, TxDatagram};
use crate::device::Device;
use crate::endpoint::{ControlTemplate, Endpoint};
use crate::error::Error;
use crate::metrics;
use crate::peer::Peer;
use crate::provider::ProviderSocket;
use crate::recv::RxPacket;
use crate::resolver::resolve_source;
use crate::routing::Family;
use crate::socket::Socket;

/// Wire length of a keepalive datagram: a 16-byte data-message header plus a
/// 16-byte authentication tag over an empty payload.
pub const KEEPALIVE_WIRE_LEN: usize = 32;

/// Per-send scratch state, pooled for the lifetime of one submission.
pub(crate) struct SendCtx {
    /// By-value endpoint snapshot; the peer's endpoint may change while this
    /// send is in flight.
    pub(crate) endpoint: Endpoint,
    pub(crate) payload: SendPayload,
}

#[derive(Default)]
pub(crate) enum SendPayload {
    #[default]
    Idle,
    /// A caller-owned datagram list, returned through the packet handler.
    Batch(Vec<TxDatagram>),
    /// A layer-owned copy, dropped on completion.
    Single(DataChain),
}

impl Default for SendCtx {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            payload: SendPayload::Idle,
        }
    }
}

/// Free a context's buffers and return it to the pool. Shared by the
/// completion path and every synchronous failure path.
fn reclaim(device: &Arc<Device>, mut ctx: Box<SendCtx>) {
    match std::mem::take(&mut ctx.payload) {
        SendPayload::Batch(datagrams) => device.handler().free_send_list(device, datagrams),
        SendPayload::Single(_) | SendPayload::Idle => {}
    }
    device.stack().release_ctx(ctx);
}

/// A batched send on its way through the provider.
///
/// The provider may alias the request's buffers until it calls
/// [`complete`](Self::complete), which must happen exactly once. Dropping an
/// uncompleted request performs the same cleanup, so buffers cannot leak
/// across a misbehaving provider.
pub struct SendRequest {
    device: Arc<Device>,
    remote: std::net::SocketAddr,
    ctx: Option<Box<SendCtx>>,
}

impl SendRequest {
    fn new(device: Arc<Device>, remote: std::net::SocketAddr, ctx: Box<SendCtx>) -> Self {
        Self {
            device,
            remote,
            ctx: Some(ctx),
        }
    }

    /// Destination of every datagram in the request.
    pub fn remote(&self) -> std::net::SocketAddr {
        self.remote
    }

    /// PKTINFO control bytes pinning source address and egress interface.
    pub fn control(&self) -> &[u8] {
        match &self.ctx {
            Some(ctx) => ctx.endpoint.control_bytes(),
            None => &[],
        }
    }

    pub(crate) fn control_template(&self) -> ControlTemplate {
        match &self.ctx {
            Some(ctx) => ctx.endpoint.control,
            None => ControlTemplate::empty(),
        }
    }

    /// The datagrams to submit, in list order.
    pub fn datagrams(&self) -> &[TxDatagram] {
        match &self.ctx {
            Some(ctx) => match &ctx.payload {
                SendPayload::Batch(datagrams) => datagrams,
                _ => &[],
            },
            None => &[],
        }
    }

    /// Report the submission outcome. Failures are absorbed after the
    /// buffers are freed; liveness is the upper layer's problem.
    pub fn complete(mut self, result: Result<(), Error>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<(), Error>) {
        if let Some(ctx) = self.ctx.take() {
            if let Err(error) = result {
                tracing::trace!(%error, "asynchronous send failed");
            }
            reclaim(&self.device, ctx);
        }
    }
}

impl Drop for SendRequest {
    fn drop(&mut self) {
        self.finish(Ok(()));
    }
}

/// A single datagram submission: either a whole single-buffer send or one
/// fan-out slice of a batched request on providers without the batched
/// primitive.
pub struct DatagramSend {
    chain: DataChain,
    remote: std::net::SocketAddr,
    control: ControlTemplate,
    completion: Option<SendCompletion>,
}

impl DatagramSend {
    pub fn chain(&self) -> &DataChain {
        &self.chain
    }

    pub fn remote(&self) -> std::net::SocketAddr {
        self.remote
    }

    pub fn control(&self) -> &[u8] {
        self.control.as_bytes()
    }

    /// Report the submission outcome. Must be called exactly once; dropping
    /// the send uncompleted counts as an absorbed completion.
    pub fn complete(mut self, result: Result<(), Error>) {
        if let Some(completion) = self.completion.take() {
            completion.finish(result);
        }
    }
}

impl Drop for DatagramSend {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.finish(Ok(()));
        }
    }
}

enum SendCompletion {
    /// Completes the owning request directly.
    Request(SendRequest),
    /// One slice of a fanned-out batch.
    Fanout(Arc<FanoutState>),
}

impl SendCompletion {
    fn finish(self, result: Result<(), Error>) {
        match self {
            SendCompletion::Request(request) => request.complete(result),
            SendCompletion::Fanout(state) => state.finish_one(),
        }
    }
}

/// Shared countdown for a fanned-out batch: one reference per sub-send plus
/// one for the submitting thread. Whichever decrement reaches zero delivers
/// the original request's single completion.
struct FanoutState {
    remaining: AtomicUsize,
    original: Mutex<Option<SendRequest>>,
}

impl FanoutState {
    fn finish_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
            && let Some(request) = self.original.lock().take()
        {
            request.complete(Ok(()));
        }
    }
}

/// Fan a batched request out to per-datagram sends, preserving the single
/// completion the caller expects. Wire order across the fan-out is not
/// preserved; the tunnel's anti-replay window absorbs that.
fn fanout(handle: &dyn ProviderSocket, request: SendRequest) {
    let remote = request.remote();
    let control = request.control_template();
    let chains: Vec<DataChain> = request
        .datagrams()
        .iter()
        .map(|datagram| datagram.chain().clone())
        .collect();
    let state = Arc::new(FanoutState {
        remaining: AtomicUsize::new(1),
        original: Mutex::new(Some(request)),
    });
    for chain in chains {
        state.remaining.fetch_add(1, Ordering::AcqRel);
        metrics::SEND_FANOUT_SENDS.increment();
        handle.send_to(DatagramSend {
            chain,
            remote,
            control,
            completion: Some(SendCompletion::Fanout(Arc::clone(&state))),
        });
    }
    state.finish_one();
}

/// Pick the socket for the context's family inside a read section and hand
/// the context to the provider. Consumes the context either way: on a
/// synchronous failure the buffers are freed and the context returned to the
/// pool before the error is returned. `Ok` only means the submission was
/// accepted — the send may still fail asynchronously.
pub(crate) fn submit(device: &Arc<Device>, ctx: Box<SendCtx>) -> Result<(), Error> {
    let Some(remote) = ctx.endpoint.remote() else {
        reclaim(device, ctx);
        return Err(Error::NetworkUnreachable);
    };
    let family = Family::of(&remote);
    let single = match &ctx.payload {
        SendPayload::Batch(_) => None,
        SendPayload::Single(chain) => Some(chain.clone()),
        SendPayload::Idle => {
            reclaim(device, ctx);
            return Err(Error::AlreadyComplete);
        }
    };

    let section = device.sockets.read();
    let handle = section
        .for_family(family)
        .and_then(Socket::provider_handle);
    let Some(handle) = handle else {
        drop(section);
        reclaim(device, ctx);
        return Err(Error::NetworkUnreachable);
    };
    let control = ctx.endpoint.control;
    let request = SendRequest::new(Arc::clone(device), remote, ctx);

    match single {
        None => {
            if device.stack().batched_send_supported() {
                handle.send_messages(request);
            } else {
                fanout(handle.as_ref(), request);
            }
        }
        Some(chain) => handle.send_to(DatagramSend {
            chain,
            remote,
            control,
            completion: Some(SendCompletion::Request(request)),
        }),
    }
    drop(section);
    Ok(())
}

impl Peer {
    /// Submit a list of already-encrypted datagrams to this peer as one
    /// batched send.
    ///
    /// Returns whether every datagram had the keepalive-canonical length.
    /// On failure the list is returned to the packet handler and no counter
    /// moves. Callers must be at passive level: a stale source binding
    /// triggers a blocking re-resolution.
    pub fn send_datagrams(&self, datagrams: Vec<TxDatagram>) -> Result<bool, Error> {
        if datagrams.is_empty() {
            return Err(Error::AlreadyComplete);
        }
        let device = Arc::clone(self.device());
        let Some(mut ctx) = device.stack().acquire_ctx() else {
            metrics::SEND_POOL_EXHAUSTED.increment();
            device.handler().free_send_list(&device, datagrams);
            return Err(Error::InsufficientResources);
        };
        let endpoint = match resolve_source(self) {
            Ok(guard) => {
                let snapshot = (*guard).clone();
                drop(guard);
                snapshot
            }
            Err(error) => {
                reclaim(&device, ctx);
                device.handler().free_send_list(&device, datagrams);
                return Err(error);
            }
        };
        ctx.endpoint = endpoint;

        let mut all_keepalive = true;
        let mut bytes = 0u64;
        let mut packets = 0u64;
        for datagram in &datagrams {
            bytes += datagram.len() as u64;
            packets += 1;
            if datagram.len() != KEEPALIVE_WIRE_LEN {
                all_keepalive = false;
            }
        }
        ctx.payload = SendPayload::Batch(datagrams);

        submit(&device, ctx)?;
        self.add_tx_bytes(bytes);
        device.stats().add_tx(bytes, packets);
        metrics::SEND_DATAGRAMS.add(packets);
        metrics::SEND_BYTES.add(bytes);
        Ok(all_keepalive)
    }

    /// Copy `data` into a fresh chain and send it to this peer. Used for
    /// handshake and control traffic, which is small and infrequent enough
    /// that the copy is irrelevant.
    pub fn send_buffer(&self, data: &[u8]) -> Result<(), Error> {
        let device = Arc::clone(self.device());
        let Some(mut ctx) = device.stack().acquire_ctx() else {
            metrics::SEND_POOL_EXHAUSTED.increment();
            return Err(Error::InsufficientResources);
        };
        ctx.payload = SendPayload::Single(DataChain::copy_from(data));
        let endpoint = match resolve_source(self) {
            Ok(guard) => {
                let snapshot = (*guard).clone();
                drop(guard);
                snapshot
            }
            Err(error) => {
                reclaim(&device, ctx);
                return Err(error);
            }
        };
        ctx.endpoint = endpoint;

        let bytes = data.len() as u64;
        submit(&device, ctx)?;
        self.add_tx_bytes(bytes);
        metrics::SEND_DATAGRAMS.increment();
        metrics::SEND_BYTES.add(bytes);
        Ok(())
    }
}

impl Device {
    /// Send `data` straight back to wherever `packet` came from, without
    /// touching any peer's endpoint. Used for cookie replies to unauthenticated
    /// senders.
    pub fn send_reply(self: &Arc<Self>, packet: &RxPacket, data: &[u8]) -> Result<(), Error> {
        let Some(mut ctx) = self.stack().acquire_ctx() else {
            metrics::SEND_POOL_EXHAUSTED.increment();
            return Err(Error::InsufficientResources);
        };
        ctx.payload = SendPayload::Single(DataChain::copy_from(data));
        ctx.endpoint = match packet.endpoint(self.stack().generations()) {
            Ok(endpoint) => endpoint,
            Err(error) => {
                reclaim(self, ctx);
                return Err(error);
            }
        };

        let bytes = data.len() as u64;
        submit(self, ctx)?;
        metrics::SEND_DATAGRAMS.increment();
        metrics::SEND_BYTES.add(bytes);
        Ok(())
    }
}
