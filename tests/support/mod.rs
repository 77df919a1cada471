//! In-process socket and route providers backing the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tunsock::{
    Config, DatagramIndication, DatagramSend, Device, Error, Family, InterfaceRow,
    IpInterfaceRow, IpPrefix, Luid, OwnerHandle, PacketHandler, ProviderSocket, ReceiveFromEvent,
    RouteProvider, RouteRow, RouteSubscription, RouteWatcher, RxPacket, SendRequest,
    SocketOption, SocketProvider, Stack, TransportEntry, TransportFamily, TransportKind,
    TransportProtocol, TxDatagram,
};

/// One send observed by a mock socket.
pub struct RecordedSend {
    pub remote: SocketAddr,
    pub control: Vec<u8>,
    pub payloads: Vec<Vec<u8>>,
    pub batched: bool,
}

/// Rendezvous used to park a batched send inside the provider while the test
/// replaces the socket pair underneath it.
pub struct SendBlocker {
    pub entered: Sender<()>,
    pub release: Mutex<Receiver<()>>,
}

pub struct ProviderState {
    pub batched: bool,
    pub next_port: AtomicU16,
    /// Remaining v6 binds to fail with `AddressInUse`.
    pub fail_v6_bind: AtomicU32,
    pub v6_bind_attempts: AtomicU32,
    pub register_calls: AtomicUsize,
    pub deregister_calls: AtomicUsize,
    pub sockets: Mutex<Vec<Arc<MockSocket>>>,
    pub block_batched_send: Mutex<Option<SendBlocker>>,
}

impl ProviderState {
    fn new(batched: bool) -> Arc<Self> {
        Arc::new(Self {
            batched,
            next_port: AtomicU16::new(40000),
            fail_v6_bind: AtomicU32::new(0),
            v6_bind_attempts: AtomicU32::new(0),
            register_calls: AtomicUsize::new(0),
            deregister_calls: AtomicUsize::new(0),
            sockets: Mutex::new(Vec::new()),
            block_batched_send: Mutex::new(None),
        })
    }

    /// The most recent live (bound, unclosed) socket for a family.
    pub fn live_socket(&self, family: Family) -> Arc<MockSocket> {
        self.sockets
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| {
                s.family == family
                    && !s.closed.load(Ordering::SeqCst)
                    && s.local.lock().unwrap().is_some()
            })
            .cloned()
            .expect("no live socket for family")
    }

    pub fn sends(&self, family: Family) -> Vec<RecordedSend> {
        let socket = self.live_socket(family);
        let mut sent = socket.sent.lock().unwrap();
        std::mem::take(&mut *sent)
    }
}

pub struct MockProvider {
    pub state: Arc<ProviderState>,
}

impl SocketProvider for MockProvider {
    fn register(&self) -> Result<(), Error> {
        self.state.register_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deregister(&self) {
        self.state.deregister_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn transports(&self) -> Result<Vec<TransportEntry>, Error> {
        Ok(vec![
            TransportEntry {
                family: TransportFamily::V4,
                kind: TransportKind::Datagram,
                protocol: TransportProtocol::Udp,
            },
            TransportEntry {
                family: TransportFamily::V6,
                kind: TransportKind::Datagram,
                protocol: TransportProtocol::Udp,
            },
            // A TCP transport the layer must ignore.
            TransportEntry {
                family: TransportFamily::Unspecified,
                kind: TransportKind::Stream,
                protocol: TransportProtocol::Tcp,
            },
        ])
    }

    fn enable_receive_events(&self) -> Result<(), Error> {
        Ok(())
    }

    fn supports_batched_send(&self) -> bool {
        self.state.batched
    }

    fn create_socket(
        &self,
        family: Family,
        _owner: OwnerHandle,
        receiver: ReceiveFromEvent,
    ) -> Result<Arc<dyn ProviderSocket>, Error> {
        let socket = Arc::new(MockSocket {
            state: Arc::clone(&self.state),
            family,
            receiver,
            local: Mutex::new(None),
            options: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.state.sockets.lock().unwrap().push(Arc::clone(&socket));
        Ok(socket)
    }
}

pub struct MockSocket {
    state: Arc<ProviderState>,
    pub family: Family,
    pub receiver: ReceiveFromEvent,
    pub local: Mutex<Option<SocketAddr>>,
    pub options: Mutex<Vec<SocketOption>>,
    pub sent: Mutex<Vec<RecordedSend>>,
    pub closed: AtomicBool,
}

impl ProviderSocket for MockSocket {
    fn set_option(&self, option: SocketOption) -> Result<(), Error> {
        self.options.lock().unwrap().push(option);
        Ok(())
    }

    fn bind(&self, addr: SocketAddr) -> Result<(), Error> {
        if self.family == Family::V6 {
            self.state.v6_bind_attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.state.fail_v6_bind.load(Ordering::SeqCst);
            if remaining > 0 {
                if remaining != u32::MAX {
                    self.state.fail_v6_bind.store(remaining - 1, Ordering::SeqCst);
                }
                return Err(Error::AddressInUse);
            }
        }
        let port = if addr.port() == 0 {
            self.state.next_port.fetch_add(1, Ordering::SeqCst)
        } else {
            addr.port()
        };
        let mut local = addr;
        local.set_port(port);
        *self.local.lock().unwrap() = Some(local);
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr, Error> {
        (*self.local.lock().unwrap()).ok_or(Error::Os(0xC000_0141u32 as i32))
    }

    fn send_messages(&self, request: SendRequest) {
        // One-shot: taken out before parking so the test thread can keep
        // using the provider state.
        let blocker = self.state.block_batched_send.lock().unwrap().take();
        if let Some(blocker) = blocker {
            blocker.entered.send(()).unwrap();
            blocker.release.lock().unwrap().recv().unwrap();
        }
        self.sent.lock().unwrap().push(RecordedSend {
            remote: request.remote(),
            control: request.control().to_vec(),
            payloads: request
                .datagrams()
                .iter()
                .map(|d| d.chain().to_vec())
                .collect(),
            batched: true,
        });
        request.complete(Ok(()));
    }

    fn send_to(&self, send: DatagramSend) {
        self.sent.lock().unwrap().push(RecordedSend {
            remote: send.remote(),
            control: send.control().to_vec(),
            payloads: vec![send.chain().to_vec()],
            batched: false,
        });
        send.complete(Ok(()));
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct RoutesState {
    pub table4: Mutex<Vec<RouteRow>>,
    pub table6: Mutex<Vec<RouteRow>>,
    pub table_error: Mutex<Option<Error>>,
    /// luid -> (oper up, interface metric)
    pub interfaces: Mutex<HashMap<u64, (bool, u32)>>,
    /// interface index -> best source address
    pub best_source: Mutex<HashMap<u32, IpAddr>>,
    pub fail_best_source: AtomicBool,
    pub watchers: Mutex<Vec<(Family, RouteWatcher)>>,
}

impl RoutesState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            table4: Mutex::new(Vec::new()),
            table6: Mutex::new(Vec::new()),
            table_error: Mutex::new(None),
            interfaces: Mutex::new(HashMap::new()),
            best_source: Mutex::new(HashMap::new()),
            fail_best_source: AtomicBool::new(false),
            watchers: Mutex::new(Vec::new()),
        })
    }

    /// Install a v4 route: `prefix` via interface (`luid`, `index`), with the
    /// interface up and the given source address answering best-source
    /// queries.
    pub fn add_route_v4(
        &self,
        prefix: IpPrefix,
        luid: u64,
        index: u32,
        metric: u32,
        source: Ipv4Addr,
    ) {
        self.table4.lock().unwrap().push(RouteRow {
            prefix,
            luid: Luid(luid),
            interface_index: index,
            metric,
        });
        self.interfaces.lock().unwrap().entry(luid).or_insert((true, 0));
        self.best_source
            .lock()
            .unwrap()
            .insert(index, IpAddr::V4(source));
    }

    pub fn default_route_v4(&self, luid: u64, index: u32, metric: u32, source: Ipv4Addr) {
        self.add_route_v4(
            IpPrefix {
                addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                len: 0,
            },
            luid,
            index,
            metric,
            source,
        );
    }

    pub fn clear_routes(&self) {
        self.table4.lock().unwrap().clear();
        self.table6.lock().unwrap().clear();
    }

    /// Simulate an OS routing-table change notification.
    pub fn fire_route_change(&self, family: Family) {
        for (watched, watcher) in self.watchers.lock().unwrap().iter() {
            if *watched == family {
                watcher.notify();
            }
        }
    }
}

pub struct MockRoutes {
    pub state: Arc<RoutesState>,
}

struct Subscription;
impl RouteSubscription for Subscription {}

impl RouteProvider for MockRoutes {
    fn forward_table(&self, family: Family) -> Result<Vec<RouteRow>, Error> {
        if let Some(error) = self.state.table_error.lock().unwrap().clone() {
            return Err(error);
        }
        let table = match family {
            Family::V4 => &self.state.table4,
            Family::V6 => &self.state.table6,
        };
        Ok(table.lock().unwrap().clone())
    }

    fn interface_row(&self, luid: Luid) -> Result<InterfaceRow, Error> {
        let interfaces = self.state.interfaces.lock().unwrap();
        let (up, _) = interfaces
            .get(&luid.0)
            .ok_or(Error::Os(0xC000_0225u32 as i32))?;
        Ok(InterfaceRow { up: *up })
    }

    fn ip_interface_row(&self, _family: Family, luid: Luid) -> Result<IpInterfaceRow, Error> {
        let interfaces = self.state.interfaces.lock().unwrap();
        let (_, metric) = interfaces
            .get(&luid.0)
            .ok_or(Error::Os(0xC000_0225u32 as i32))?;
        Ok(IpInterfaceRow { metric: *metric })
    }

    fn best_source(&self, interface_index: u32, _remote: &SocketAddr) -> Result<IpAddr, Error> {
        if self.state.fail_best_source.load(Ordering::SeqCst) {
            return Err(Error::Os(0xC000_023Cu32 as i32));
        }
        self.state
            .best_source
            .lock()
            .unwrap()
            .get(&interface_index)
            .copied()
            .ok_or(Error::Os(0xC000_023Cu32 as i32))
    }

    fn watch_routes(
        &self,
        family: Family,
        watcher: RouteWatcher,
    ) -> Result<Box<dyn RouteSubscription>, Error> {
        self.state.watchers.lock().unwrap().push((family, watcher));
        Ok(Box::new(Subscription))
    }
}

#[derive(Default)]
pub struct TestHandler {
    /// Payloads of packets that were received and immediately released.
    pub received: Mutex<Vec<Vec<u8>>>,
    /// When set, packets are parked in `held` instead of being released.
    pub hold_packets: AtomicBool,
    pub held: Mutex<Vec<RxPacket>>,
    /// Sizes of send lists returned through `free_send_list`.
    pub freed_lists: Mutex<Vec<usize>>,
}

impl PacketHandler for TestHandler {
    fn packet_receive(&self, _device: &Arc<Device>, packets: Vec<RxPacket>) {
        if self.hold_packets.load(Ordering::SeqCst) {
            self.held.lock().unwrap().extend(packets);
        } else {
            let mut received = self.received.lock().unwrap();
            for packet in packets {
                received.push(packet.payload().to_vec());
            }
        }
    }

    fn free_send_list(&self, _device: &Arc<Device>, datagrams: Vec<TxDatagram>) {
        self.freed_lists.lock().unwrap().push(datagrams.len());
    }
}

pub struct Harness {
    pub stack: Arc<Stack>,
    pub provider: Arc<ProviderState>,
    pub routes: Arc<RoutesState>,
    pub handler: Arc<TestHandler>,
    pub device: Arc<Device>,
}

/// Device LUID used by every harness; route rows must point elsewhere to be
/// usable.
pub const DEVICE_LUID: u64 = 1;

pub fn harness(batched: bool) -> Harness {
    let provider = ProviderState::new(batched);
    let routes = RoutesState::new();
    let stack = Stack::new(
        Arc::new(MockProvider {
            state: Arc::clone(&provider),
        }),
        Arc::new(MockRoutes {
            state: Arc::clone(&routes),
        }),
        Config::default(),
    )
    .unwrap();
    stack.init().unwrap();

    let handler = Arc::new(TestHandler::default());
    let device = Device::new(
        Arc::clone(&stack),
        Luid(DEVICE_LUID),
        OwnerHandle(4),
        Arc::clone(&handler) as Arc<dyn PacketHandler>,
    );
    device.set_up(true);
    Harness {
        stack,
        provider,
        routes,
        handler,
        device,
    }
}

/// An indication whose release back to the provider is observable.
pub fn tracked_indication(
    remote: SocketAddr,
    payload: &[u8],
    control: &[u8],
    released: &Arc<AtomicUsize>,
) -> DatagramIndication {
    let released = Arc::clone(released);
    DatagramIndication::new(
        remote,
        Bytes::copy_from_slice(payload),
        Bytes::copy_from_slice(control),
    )
    .with_release(move || {
        released.fetch_add(1, Ordering::SeqCst);
    })
}

pub fn datagram(len: usize) -> TxDatagram {
    TxDatagram::from_bytes(Bytes::from(vec![0xEAu8; len]))
}
