//! Lifecycle controller: one binding to the socket provider per driver load.
//!
//! [`Stack::init`] probes the provider, creates the send-context pool, and
//! subscribes to route-change notifications; [`Stack::unload`] tears it back
//! down. Init is idempotent and serialized: the first terminal outcome
//! (success or hard failure) is latched, and every later call gets the same
//! answer without re-running any step.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use spin::Mutex;

use crate::config::Config;
use crate::error::Error;
use crate::pool::Lookaside;
use crate::provider::{SocketProvider, TransportFamily, TransportKind, TransportProtocol};
use crate::routing::{Family, RouteProvider, RouteSubscription, RouteWatcher, RoutingGenerations};
use crate::send::SendCtx;

const NOT_ATTEMPTED: u8 = 0;
const READY: u8 = 1;
const FAILED: u8 = 2;

/// Process-wide socket-layer state shared by every device.
pub struct Stack {
    provider: Arc<dyn SocketProvider>,
    routes: Arc<dyn RouteProvider>,
    config: Config,
    generations: Arc<RoutingGenerations>,
    init_lock: Mutex<()>,
    phase: AtomicU8,
    failure: Mutex<Option<Error>>,
    ctx_pool: OnceLock<Lookaside<SendCtx>>,
    has_v4: AtomicBool,
    has_v6: AtomicBool,
    batched_send: AtomicBool,
    subscriptions: Mutex<Vec<Box<dyn RouteSubscription>>>,
}

impl Stack {
    pub fn new(
        provider: Arc<dyn SocketProvider>,
        routes: Arc<dyn RouteProvider>,
        config: Config,
    ) -> Result<Arc<Self>, Error> {
        config.validate()?;
        Ok(Arc::new(Self {
            provider,
            routes,
            config,
            generations: Arc::new(RoutingGenerations::new()),
            init_lock: Mutex::new(()),
            phase: AtomicU8::new(NOT_ATTEMPTED),
            failure: Mutex::new(None),
            ctx_pool: OnceLock::new(),
            has_v4: AtomicBool::new(false),
            has_v6: AtomicBool::new(false),
            batched_send: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        }))
    }

    /// Bind to the providers. Safe to call repeatedly; the first terminal
    /// outcome is sticky.
    pub fn init(&self) -> Result<(), Error> {
        match self.phase.load(Ordering::Acquire) {
            READY => return Ok(()),
            FAILED => return Err(self.latched_failure()),
            _ => {}
        }
        let _serialize = self.init_lock.lock();
        match self.phase.load(Ordering::Acquire) {
            READY => return Ok(()),
            FAILED => return Err(self.latched_failure()),
            _ => {}
        }

        let result = self.run_init();
        match &result {
            Ok(()) => {
                self.phase.store(READY, Ordering::Release);
                tracing::info!("socket layer initialized");
            }
            Err(error) => {
                *self.failure.lock() = Some(error.clone());
                self.phase.store(FAILED, Ordering::Release);
                tracing::warn!(%error, "socket layer init failed");
            }
        }
        result
    }

    fn run_init(&self) -> Result<(), Error> {
        self.batched_send
            .store(self.provider.supports_batched_send(), Ordering::Relaxed);
        let _ = self
            .ctx_pool
            .set(Lookaside::new(self.config.send_ctx_capacity));
        self.provider.register()?;
        let result = self.init_registered();
        if result.is_err() {
            self.provider.deregister();
        }
        result
    }

    fn init_registered(&self) -> Result<(), Error> {
        for transport in self.provider.transports()? {
            if transport.kind != TransportKind::Datagram
                || transport.protocol != TransportProtocol::Udp
            {
                continue;
            }
            match transport.family {
                TransportFamily::Unspecified => {
                    self.has_v4.store(true, Ordering::Relaxed);
                    self.has_v6.store(true, Ordering::Relaxed);
                }
                TransportFamily::V4 => self.has_v4.store(true, Ordering::Relaxed),
                TransportFamily::V6 => self.has_v6.store(true, Ordering::Relaxed),
            }
        }
        self.provider.enable_receive_events()?;

        let sub4 = self.routes.watch_routes(
            Family::V4,
            RouteWatcher::new(Arc::clone(&self.generations), Family::V4),
        )?;
        let sub6 = match self.routes.watch_routes(
            Family::V6,
            RouteWatcher::new(Arc::clone(&self.generations), Family::V6),
        ) {
            Ok(sub) => sub,
            Err(error) => {
                drop(sub4);
                return Err(error);
            }
        };
        self.subscriptions.lock().extend([sub4, sub6]);
        Ok(())
    }

    fn latched_failure(&self) -> Error {
        self.failure
            .lock()
            .clone()
            .unwrap_or(Error::NotInitialized)
    }

    /// Latched init outcome without side effects: `Ok` after a successful
    /// init, the original error after a failed one, and
    /// [`Error::NotInitialized`] when init was never attempted.
    pub fn init_status(&self) -> Result<(), Error> {
        match self.phase.load(Ordering::Acquire) {
            READY => Ok(()),
            FAILED => Err(self.latched_failure()),
            _ => Err(Error::NotInitialized),
        }
    }

    /// Cancel subscriptions and release the provider binding. A no-op unless
    /// init succeeded.
    pub fn unload(&self) {
        let _serialize = self.init_lock.lock();
        if self.phase.load(Ordering::Acquire) != READY {
            return;
        }
        self.subscriptions.lock().clear();
        self.provider.deregister();
        tracing::info!("socket layer unloaded");
    }

    pub(crate) fn provider(&self) -> &Arc<dyn SocketProvider> {
        &self.provider
    }

    pub(crate) fn routes(&self) -> &Arc<dyn RouteProvider> {
        &self.routes
    }

    pub(crate) fn generations(&self) -> &RoutingGenerations {
        &self.generations
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the provider listed a UDP datagram transport for v4.
    pub fn has_v4(&self) -> bool {
        self.has_v4.load(Ordering::Relaxed)
    }

    pub fn has_v6(&self) -> bool {
        self.has_v6.load(Ordering::Relaxed)
    }

    pub(crate) fn batched_send_supported(&self) -> bool {
        self.batched_send.load(Ordering::Relaxed)
    }

    pub(crate) fn acquire_ctx(&self) -> Option<Box<SendCtx>> {
        self.ctx_pool.get()?.acquire()
    }

    pub(crate) fn release_ctx(&self, ctx: Box<SendCtx>) {
        if let Some(pool) = self.ctx_pool.get() {
            pool.release(ctx);
        }
    }

    #[cfg(test)]
    pub(crate) fn ctx_in_use(&self) -> usize {
        self.ctx_pool.get().map(Lookaside::in_use).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{OwnerHandle, ProviderSocket, TransportEntry};
    use crate::recv::ReceiveFromEvent;
    use std::sync::atomic::AtomicUsize;

    struct FlakyProvider {
        registers: AtomicUsize,
        fail_register: bool,
    }

    impl SocketProvider for FlakyProvider {
        fn register(&self) -> Result<(), Error> {
            self.registers.fetch_add(1, Ordering::SeqCst);
            if self.fail_register {
                Err(Error::Os(0xC000_0001u32 as i32))
            } else {
                Ok(())
            }
        }

        fn deregister(&self) {}

        fn transports(&self) -> Result<Vec<TransportEntry>, Error> {
            Ok(vec![TransportEntry {
                family: TransportFamily::Unspecified,
                kind: TransportKind::Datagram,
                protocol: TransportProtocol::Udp,
            }])
        }

        fn enable_receive_events(&self) -> Result<(), Error> {
            Ok(())
        }

        fn supports_batched_send(&self) -> bool {
            true
        }

        fn create_socket(
            &self,
            _family: Family,
            _owner: OwnerHandle,
            _receiver: ReceiveFromEvent,
        ) -> Result<Arc<dyn ProviderSocket>, Error> {
            Err(Error::InsufficientResources)
        }
    }

    struct NullRoutes;

    struct NullSubscription;
    impl RouteSubscription for NullSubscription {}

    impl RouteProvider for NullRoutes {
        fn forward_table(&self, _family: Family) -> Result<Vec<crate::routing::RouteRow>, Error> {
            Ok(Vec::new())
        }

        fn interface_row(
            &self,
            _luid: crate::routing::Luid,
        ) -> Result<crate::routing::InterfaceRow, Error> {
            Ok(crate::routing::InterfaceRow { up: true })
        }

        fn ip_interface_row(
            &self,
            _family: Family,
            _luid: crate::routing::Luid,
        ) -> Result<crate::routing::IpInterfaceRow, Error> {
            Ok(crate::routing::IpInterfaceRow { metric: 0 })
        }

        fn best_source(
            &self,
            _interface_index: u32,
            _remote: &std::net::SocketAddr,
        ) -> Result<std::net::IpAddr, Error> {
            Err(Error::NetworkPath)
        }

        fn watch_routes(
            &self,
            _family: Family,
            _watcher: RouteWatcher,
        ) -> Result<Box<dyn RouteSubscription>, Error> {
            Ok(Box::new(NullSubscription))
        }
    }

    fn stack_with(fail_register: bool) -> (Arc<Stack>, Arc<FlakyProvider>) {
        let provider = Arc::new(FlakyProvider {
            registers: AtomicUsize::new(0),
            fail_register,
        });
        let stack = Stack::new(provider.clone(), Arc::new(NullRoutes), Config::default()).unwrap();
        (stack, provider)
    }

    #[test]
    fn init_is_idempotent_after_success() {
        let (stack, provider) = stack_with(false);
        assert_eq!(stack.init_status(), Err(Error::NotInitialized));
        assert!(stack.init().is_ok());
        assert!(stack.init().is_ok());
        assert_eq!(provider.registers.load(Ordering::SeqCst), 1);
        assert!(stack.has_v4() && stack.has_v6());
        assert_eq!(stack.init_status(), Ok(()));

        // The context pool exists and is empty of in-flight sends.
        let ctx = stack.acquire_ctx().unwrap();
        assert_eq!(stack.ctx_in_use(), 1);
        stack.release_ctx(ctx);
        assert_eq!(stack.ctx_in_use(), 0);
    }

    #[test]
    fn failed_init_is_latched() {
        let (stack, provider) = stack_with(true);
        let first = stack.init().unwrap_err();
        let second = stack.init().unwrap_err();
        assert_eq!(first, second);
        assert_eq!(stack.init_status(), Err(first));
        // The failing step ran once; later calls short-circuit.
        assert_eq!(provider.registers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unload_without_init_is_a_noop() {
        let (stack, _provider) = stack_with(false);
        stack.unload();
        assert_eq!(stack.init_status(), Err(Error::NotInitialized));
    }
}
