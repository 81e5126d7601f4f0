//! # NAT Port Mapping
//!
//! [`NatTransport`] wraps any transport and keeps UDP port mappings on a
//! home gateway alive, so the externally reachable addresses can be
//! advertised alongside the local ones. Gateway discovery and the
//! mapping protocol itself are behind the [`NatGateway`] and
//! [`NatDiscoverer`] traits; tests drive the mapper with stub gateways.
//!
//! One background task runs a two-mode state machine:
//!
//! ```text
//! ┌──────────────┐  discovery succeeds   ┌──────────────┐
//! │ discover     │ ────────────────────► │ mapping      │
//! │ 5s addr poll │                       │ 5s reconcile │
//! │ 10m retry    │ ◄──────────────────── │ 50m refresh  │
//! └──────────────┘   any gateway error   └──────────────┘
//! ```
//!
//! - *Discover*: sample local addresses every 5 s and attempt discovery
//!   when they change; retry unconditionally every 10 min.
//! - *Mapping*: reconcile mappings against current local addresses every
//!   5 s (mark-sweep: new NATable addresses get mappings, unchanged ones
//!   are re-marked fresh, stale ones are deleted), and refresh every
//!   50 min, safely inside the commonly advertised 60 min lease. A
//!   reconcile runs eagerly on entry so a fresh gateway is used at once.
//!
//! Any failure to query the gateway drops the device reference, clears
//! the table, and returns to discover mode.
//!
//! The mapping table sits behind an `RwLock` because `local_addresses`
//! is called from several tasks; only the mapper task ever writes it.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::transport::{Addr, Proto, Transport};

/// Local-address poll and mapping reconcile period.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Unconditional gateway discovery retry period.
pub const DISCOVER_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Mapping refresh period, below the usual 60 min lease.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(50 * 60);

/// Lease duration requested for every mapping.
pub const MAPPING_LEASE: Duration = Duration::from_secs(60 * 60);

/// Description attached to mappings on the gateway.
const MAPPING_NAME: &str = "hashline";

/// A NAT device that can create and delete port mappings.
#[async_trait]
pub trait NatGateway: Send + Sync + 'static {
    async fn external_ip(&self) -> io::Result<IpAddr>;

    async fn internal_ip(&self) -> io::Result<IpAddr>;

    /// Map `internal_port`; returns the externally visible port.
    async fn add_port_mapping(
        &self,
        proto: Proto,
        internal_port: u16,
        name: &str,
        lease: Duration,
    ) -> io::Result<u16>;

    async fn delete_port_mapping(&self, proto: Proto, internal_port: u16) -> io::Result<()>;
}

/// Locates a NAT device on the local network.
#[async_trait]
pub trait NatDiscoverer: Send + Sync + 'static {
    async fn discover(&self) -> io::Result<Arc<dyn NatGateway>>;
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct MappingKey {
    proto: Proto,
    ip: IpAddr,
    port: u16,
}

#[derive(Clone)]
struct Mapping {
    external: Addr,
    internal: Addr,
    stale: bool,
}

/// Transport wrapper advertising NAT-mapped external addresses.
pub struct NatTransport {
    inner: Arc<dyn Transport>,
    mappings: StdRwLock<HashMap<MappingKey, Mapping>>,
    done_tx: watch::Sender<bool>,
}

impl NatTransport {
    /// Wrap `inner` and start the mapper task.
    pub fn wrap(inner: Arc<dyn Transport>, discoverer: Arc<dyn NatDiscoverer>) -> Arc<NatTransport> {
        let (done_tx, done_rx) = watch::channel(false);
        let nat = Arc::new(NatTransport {
            inner,
            mappings: StdRwLock::new(HashMap::new()),
            done_tx,
        });
        tokio::spawn(run_mapper(Arc::clone(&nat), discoverer, done_rx));
        nat
    }

    /// Currently mapped external addresses.
    pub fn external_addresses(&self) -> Vec<Addr> {
        self.mappings
            .read()
            .unwrap()
            .values()
            .map(|m| m.external.clone())
            .collect()
    }

    fn swap_mappings(&self, next: HashMap<MappingKey, Mapping>) {
        *self.mappings.write().unwrap() = next;
    }

    fn snapshot_marked_stale(&self) -> HashMap<MappingKey, Mapping> {
        let mut table = self.mappings.read().unwrap().clone();
        for mapping in table.values_mut() {
            mapping.stale = true;
        }
        table
    }
}

#[async_trait]
impl Transport for NatTransport {
    fn local_addresses(&self) -> Vec<Addr> {
        let mut addrs = self.inner.local_addresses();
        let table = self.mappings.read().unwrap();
        for mapping in table.values() {
            if !addrs.contains(&mapping.external) {
                addrs.push(mapping.external.clone());
            }
        }
        addrs
    }

    async fn read_message(&self, buf: &mut [u8]) -> io::Result<(usize, Addr)> {
        self.inner.read_message(buf).await
    }

    async fn write_message(&self, msg: &[u8], to: &Addr) -> io::Result<()> {
        self.inner.write_message(msg, to).await
    }

    async fn close(&self) -> io::Result<()> {
        let _ = self.done_tx.send(true);
        self.inner.close().await
    }
}

async fn run_mapper(
    nat: Arc<NatTransport>,
    discoverer: Arc<dyn NatDiscoverer>,
    mut done_rx: watch::Receiver<bool>,
) {
    let mut gateway: Option<Arc<dyn NatGateway>> = None;
    loop {
        let closed = match gateway.clone() {
            None => run_discover_mode(&nat, &discoverer, &mut gateway, &mut done_rx).await,
            Some(gw) => run_mapping_mode(&nat, gw, &mut gateway, &mut done_rx).await,
        };
        if closed {
            nat.swap_mappings(HashMap::new());
            return;
        }
    }
}

/// Returns true when the transport closed.
async fn run_discover_mode(
    nat: &NatTransport,
    discoverer: &Arc<dyn NatDiscoverer>,
    gateway: &mut Option<Arc<dyn NatGateway>>,
    done_rx: &mut watch::Receiver<bool>,
) -> bool {
    let mut update = tokio::time::interval(UPDATE_INTERVAL);
    let mut discover = tokio::time::interval(DISCOVER_INTERVAL);
    discover.tick().await; // consume the immediate tick

    let mut known: HashMap<MappingKey, bool> = HashMap::new();

    loop {
        tokio::select! {
            _ = done_rx.changed() => return true,
            _ = update.tick() => {
                if update_known_addresses(nat, &mut known) {
                    try_discover(discoverer, gateway).await;
                }
            }
            _ = discover.tick() => {
                try_discover(discoverer, gateway).await;
            }
        }

        if gateway.is_some() {
            return false;
        }
    }
}

/// Returns true when the transport closed.
async fn run_mapping_mode(
    nat: &NatTransport,
    gw: Arc<dyn NatGateway>,
    gateway: &mut Option<Arc<dyn NatGateway>>,
    done_rx: &mut watch::Receiver<bool>,
) -> bool {
    let mut update = tokio::time::interval(UPDATE_INTERVAL);
    let mut refresh = tokio::time::interval(REFRESH_INTERVAL);
    refresh.tick().await; // consume the immediate tick

    // Reconcile eagerly so a freshly discovered gateway is used without
    // waiting out the first tick.
    if update_mappings(nat, &gw).await.is_err() {
        *gateway = None;
        nat.swap_mappings(HashMap::new());
        return false;
    }

    loop {
        let result = tokio::select! {
            _ = done_rx.changed() => return true,
            _ = update.tick() => update_mappings(nat, &gw).await,
            _ = refresh.tick() => refresh_mappings(nat, &gw).await,
        };

        if result.is_err() {
            warn!("gateway lost, returning to discovery");
            *gateway = None;
            nat.swap_mappings(HashMap::new());
            return false;
        }
    }
}

async fn try_discover(
    discoverer: &Arc<dyn NatDiscoverer>,
    gateway: &mut Option<Arc<dyn NatGateway>>,
) {
    match discoverer.discover().await {
        Ok(gw) => {
            // A gateway that cannot report its address is no use.
            if gw.external_ip().await.is_ok() {
                debug!("NAT gateway discovered");
                *gateway = Some(gw);
            }
        }
        Err(e) => trace!(error = %e, "NAT discovery failed"),
    }
}

/// Re-sample NATable local addresses; true when the set changed.
fn update_known_addresses(nat: &NatTransport, known: &mut HashMap<MappingKey, bool>) -> bool {
    let mut changed = false;

    for flag in known.values_mut() {
        *flag = false;
    }

    for addr in nat.inner.local_addresses() {
        let Some((proto, ip, port)) = addr.natable() else {
            continue;
        };
        let key = MappingKey { proto, ip, port };
        if !known.contains_key(&key) {
            changed = true;
        }
        known.insert(key, true);
    }

    known.retain(|_, seen| {
        if !*seen {
            changed = true;
        }
        *seen
    });

    changed
}

/// One reconcile pass: map new addresses, freshen unchanged ones, delete
/// mappings whose internal address disappeared.
async fn update_mappings(nat: &NatTransport, gw: &Arc<dyn NatGateway>) -> io::Result<()> {
    let mut table = nat.snapshot_marked_stale();

    let external_ip = gw.external_ip().await?;
    let internal_ip = gw.internal_ip().await?;

    for addr in nat.inner.local_addresses() {
        let Some((proto, ip, port)) = addr.natable() else {
            continue;
        };
        if ip != internal_ip && !ip.is_loopback() {
            continue;
        }
        let key = MappingKey { proto, ip, port };
        if let Some(mapping) = table.get_mut(&key) {
            mapping.stale = false;
            continue;
        }

        let external_port = match gw.add_port_mapping(proto, port, MAPPING_NAME, MAPPING_LEASE).await {
            Ok(p) => p,
            Err(e) => {
                trace!(addr = %addr, error = %e, "port mapping failed");
                continue;
            }
        };
        let Some(external) = addr.make_global(external_ip, external_port) else {
            continue;
        };
        debug!(internal = %addr, external = %external, "port mapping added");
        table.insert(
            key,
            Mapping {
                external,
                internal: addr,
                stale: false,
            },
        );
    }

    let mut stale_keys = Vec::new();
    for (key, mapping) in &table {
        if mapping.stale {
            stale_keys.push((key.clone(), mapping.internal.clone()));
        }
    }
    for (key, internal) in stale_keys {
        let _ = gw.delete_port_mapping(key.proto, key.port).await;
        debug!(internal = %internal, "stale port mapping removed");
        table.remove(&key);
    }

    nat.swap_mappings(table);
    Ok(())
}

/// Re-add every mapping before the gateway lease expires; drop mappings
/// the gateway no longer accepts.
async fn refresh_mappings(nat: &NatTransport, gw: &Arc<dyn NatGateway>) -> io::Result<()> {
    let mut table = nat.snapshot_marked_stale();

    let external_ip = gw.external_ip().await?;
    let internal_ip = gw.internal_ip().await?;

    let mut droplist = Vec::new();
    for (key, mapping) in table.iter_mut() {
        if key.ip != internal_ip && !key.ip.is_loopback() {
            droplist.push(key.clone());
            continue;
        }
        match gw.add_port_mapping(key.proto, key.port, MAPPING_NAME, MAPPING_LEASE).await {
            Ok(external_port) => {
                match mapping.internal.make_global(external_ip, external_port) {
                    Some(external) => {
                        mapping.external = external;
                        mapping.stale = false;
                    }
                    None => droplist.push(key.clone()),
                }
            }
            Err(_) => droplist.push(key.clone()),
        }
    }

    for key in droplist {
        debug!(port = key.port, "mapping dropped on refresh");
        table.remove(&key);
    }

    nat.swap_mappings(table);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::inproc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Stub gateway that hands out external ports and counts calls.
    pub struct StubGateway {
        pub external: IpAddr,
        pub internal: IpAddr,
        pub add_calls: AtomicU32,
        pub delete_calls: AtomicU32,
        pub fail: AtomicBool,
    }

    impl StubGateway {
        pub fn new(external: &str, internal: &str) -> Arc<StubGateway> {
            Arc::new(StubGateway {
                external: external.parse().unwrap(),
                internal: internal.parse().unwrap(),
                add_calls: AtomicU32::new(0),
                delete_calls: AtomicU32::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl NatGateway for StubGateway {
        async fn external_ip(&self) -> io::Result<IpAddr> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(io::Error::new(io::ErrorKind::Other, "gateway gone"));
            }
            Ok(self.external)
        }

        async fn internal_ip(&self) -> io::Result<IpAddr> {
            Ok(self.internal)
        }

        async fn add_port_mapping(
            &self,
            _proto: Proto,
            internal_port: u16,
            _name: &str,
            _lease: Duration,
        ) -> io::Result<u16> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(io::Error::new(io::ErrorKind::Other, "gateway gone"));
            }
            self.add_calls.fetch_add(1, Ordering::SeqCst);
            Ok(internal_port + 10_000)
        }

        async fn delete_port_mapping(&self, _proto: Proto, _port: u16) -> io::Result<()> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct StubDiscoverer(pub Arc<StubGateway>);

    #[async_trait]
    impl NatDiscoverer for StubDiscoverer {
        async fn discover(&self) -> io::Result<Arc<dyn NatGateway>> {
            Ok(self.0.clone() as Arc<dyn NatGateway>)
        }
    }

    fn nat_over_inproc(gw: &Arc<StubGateway>) -> Arc<NatTransport> {
        let net = inproc::Network::new();
        let transport = Arc::new(net.endpoint());
        NatTransport::wrap(transport, Arc::new(StubDiscoverer(gw.clone())))
    }

    #[tokio::test(start_paused = true)]
    async fn discovers_and_advertises_external_address() {
        let gw = StubGateway::new("1.2.3.4", "127.0.0.1");
        let nat = nat_over_inproc(&gw);

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        let externals = nat.external_addresses();
        assert_eq!(externals.len(), 1, "one mapping expected: {externals:?}");
        let external = externals[0].socket_addr().unwrap();
        assert_eq!(external.ip().to_string(), "1.2.3.4");
        assert!(nat.local_addresses().contains(&externals[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_is_idempotent() {
        let gw = StubGateway::new("1.2.3.4", "127.0.0.1");
        let _nat = nat_over_inproc(&gw);

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        let after_first = gw.add_calls.load(Ordering::SeqCst);
        assert_eq!(after_first, 1);

        // Two further ticks with no address change add nothing.
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(gw.add_calls.load(Ordering::SeqCst), after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_renews_on_schedule() {
        let gw = StubGateway::new("1.2.3.4", "127.0.0.1");
        let _nat = nat_over_inproc(&gw);

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert_eq!(gw.add_calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(REFRESH_INTERVAL).await;
        tokio::task::yield_now().await;
        assert!(
            gw.add_calls.load(Ordering::SeqCst) >= 2,
            "refresh should re-add the mapping"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_failure_clears_table() {
        let gw = StubGateway::new("1.2.3.4", "127.0.0.1");
        let nat = nat_over_inproc(&gw);

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert_eq!(nat.external_addresses().len(), 1);

        gw.fail.store(true, Ordering::Relaxed);
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(nat.external_addresses().is_empty());
    }
}
