//! Process-wide socket-layer metrics.
//!
//! Counters for submitted and received datagrams, receive-path discards,
//! pool exhaustion, and routing-table churn. Registered with metriken for
//! Prometheus exposition by whoever hosts the driver.

use crate::counter::{Counter, CounterGroup};
use metriken::metric;

static SEND: CounterGroup = CounterGroup::new();
static RECV: CounterGroup = CounterGroup::new();
static ROUTE: CounterGroup = CounterGroup::new();

/// Counter slot indices for send-path metrics.
pub mod send {
    pub const DATAGRAMS: usize = 0;
    pub const BYTES: usize = 1;
    pub const POOL_EXHAUSTED: usize = 2;
    pub const FANOUT_SENDS: usize = 3;
}

/// Counter slot indices for receive-path metrics.
pub mod recv {
    pub const DATAGRAMS: usize = 0;
    pub const DISCARDED: usize = 1;
}

/// Counter slot indices for routing metrics.
pub mod route {
    pub const INVALIDATIONS: usize = 0;
    pub const RESOLVES: usize = 1;
}

#[metric(
    name = "tunsock/send/datagrams",
    description = "Datagrams submitted to the provider"
)]
pub static SEND_DATAGRAMS: Counter = Counter::new(&SEND, send::DATAGRAMS);

#[metric(name = "tunsock/send/bytes", description = "Payload bytes submitted")]
pub static SEND_BYTES: Counter = Counter::new(&SEND, send::BYTES);

#[metric(
    name = "tunsock/send/pool_exhausted",
    description = "Send-context pool exhaustion events"
)]
pub static SEND_POOL_EXHAUSTED: Counter = Counter::new(&SEND, send::POOL_EXHAUSTED);

#[metric(
    name = "tunsock/send/fanout_sends",
    description = "Per-datagram sends issued by the batched-send fallback"
)]
pub static SEND_FANOUT_SENDS: Counter = Counter::new(&SEND, send::FANOUT_SENDS);

#[metric(
    name = "tunsock/recv/datagrams",
    description = "Datagram indications accepted from the provider"
)]
pub static RECV_DATAGRAMS: Counter = Counter::new(&RECV, recv::DATAGRAMS);

#[metric(
    name = "tunsock/recv/discarded",
    description = "Datagram indications released without delivery"
)]
pub static RECV_DISCARDED: Counter = Counter::new(&RECV, recv::DISCARDED);

#[metric(
    name = "tunsock/route/invalidations",
    description = "Routing-table change notifications observed"
)]
pub static ROUTE_INVALIDATIONS: Counter = Counter::new(&ROUTE, route::INVALIDATIONS);

#[metric(
    name = "tunsock/route/resolves",
    description = "Forwarding-table scans performed by the source resolver"
)]
pub static ROUTE_RESOLVES: Counter = Counter::new(&ROUTE, route::RESOLVES);
