//! # Transport Abstraction
//!
//! A transport moves opaque datagrams between addresses. The switch core
//! never inspects addresses beyond equality and their canonical string
//! form, so transports are pluggable behind one async trait:
//!
//! ```text
//! ┌────────────┐   read_message / write_message   ┌───────────┐
//! │ switch core│ ◄──────────────────────────────► │ transport │
//! └────────────┘                                  └───────────┘
//! ```
//!
//! Three transports live here:
//!
//! - [`UdpTransport`] — one UDP socket carrying `udp4`/`udp6` addresses.
//! - [`FwTransport`] — wraps any transport with an allow predicate on
//!   source addresses; packets from disallowed sources are dropped
//!   before the core ever sees them.
//! - [`inproc`] — an in-process datagram mesh with injectable packet
//!   loss, used by tests and demos that need a deterministic network.
//!
//! Addresses that map to a local UDP port additionally expose their
//! NATable form `(proto, internal ip, internal port)` so the NAT mapper
//! can request port mappings and advertise globals (see [`crate::nat`]).

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::hashname::Hashname;

/// Largest datagram the switch will read or write.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Transport-level protocol label used by NAT port mappings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Proto {
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Udp => f.write_str("udp"),
        }
    }
}

/// A candidate address for a peer.
///
/// `Peer` addresses are relay indirections: they name a via hashname
/// rather than a socket, and are resolved by the bridge module.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Addr {
    Udp4(SocketAddr),
    Udp6(SocketAddr),
    Peer(Hashname),
}

impl Addr {
    /// Wrap a socket address in its `udp4`/`udp6` form.
    pub fn udp(addr: SocketAddr) -> Addr {
        if addr.is_ipv4() {
            Addr::Udp4(addr)
        } else {
            Addr::Udp6(addr)
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Addr::Udp4(sa) | Addr::Udp6(sa) => Some(*sa),
            Addr::Peer(_) => None,
        }
    }

    /// The via hashname when this is a relay indirection.
    pub fn via(&self) -> Option<&Hashname> {
        match self {
            Addr::Peer(h) => Some(h),
            _ => None,
        }
    }

    /// NATable capability: the internal tuple a gateway can map.
    pub fn natable(&self) -> Option<(Proto, IpAddr, u16)> {
        match self {
            Addr::Udp4(sa) | Addr::Udp6(sa) => Some((Proto::Udp, sa.ip(), sa.port())),
            Addr::Peer(_) => None,
        }
    }

    /// Rebuild this address with an externally visible ip and port.
    pub fn make_global(&self, ip: IpAddr, port: u16) -> Option<Addr> {
        match self {
            Addr::Udp4(_) | Addr::Udp6(_) => Some(Addr::udp(SocketAddr::new(ip, port))),
            Addr::Peer(_) => None,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Udp4(sa) => write!(f, "udp4:{sa}"),
            Addr::Udp6(sa) => write!(f, "udp6:{sa}"),
            Addr::Peer(h) => write!(f, "peer:{h}"),
        }
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Addr {
    type Err = io::Error;

    fn from_str(s: &str) -> io::Result<Self> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing address scheme"))?;
        match scheme {
            "udp4" | "udp6" => {
                let sa: SocketAddr = rest
                    .parse()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                Ok(Addr::udp(sa))
            }
            "peer" => {
                let hashname: Hashname = rest
                    .parse()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                Ok(Addr::Peer(hashname))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown address scheme {other:?}"),
            )),
        }
    }
}

/// Datagram transport capability set.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Locally reachable addresses, used when advertising paths.
    fn local_addresses(&self) -> Vec<Addr>;

    /// Receive one datagram. Blocks until a datagram arrives or the
    /// transport closes.
    async fn read_message(&self, buf: &mut [u8]) -> io::Result<(usize, Addr)>;

    /// Send one datagram.
    async fn write_message(&self, msg: &[u8], to: &Addr) -> io::Result<()>;

    /// Close the transport; pending and future reads fail.
    async fn close(&self) -> io::Result<()>;
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

// ============================================================================
// UDP
// ============================================================================

/// UDP datagram transport bound to a single socket.
pub struct UdpTransport {
    socket: tokio::net::UdpSocket,
    local: SocketAddr,
    closed_tx: watch::Sender<bool>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<UdpTransport> {
        let socket = tokio::net::UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        let (closed_tx, _) = watch::channel(false);
        Ok(UdpTransport {
            socket,
            local,
            closed_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_addresses(&self) -> Vec<Addr> {
        vec![Addr::udp(self.local)]
    }

    async fn read_message(&self, buf: &mut [u8]) -> io::Result<(usize, Addr)> {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow() {
            return Err(closed_err());
        }
        tokio::select! {
            _ = closed_rx.changed() => Err(closed_err()),
            res = self.socket.recv_from(buf) => {
                let (n, from) = res?;
                Ok((n, Addr::udp(from)))
            }
        }
    }

    async fn write_message(&self, msg: &[u8], to: &Addr) -> io::Result<()> {
        if *self.closed_tx.subscribe().borrow() {
            return Err(closed_err());
        }
        match to {
            Addr::Udp4(sa) | Addr::Udp6(sa) => {
                self.socket.send_to(msg, sa).await?;
                Ok(())
            }
            Addr::Peer(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "relay address requires a bridge",
            )),
        }
    }

    async fn close(&self) -> io::Result<()> {
        let _ = self.closed_tx.send(true);
        Ok(())
    }
}

// ============================================================================
// Firewall filter
// ============================================================================

/// Allow predicate over source addresses.
pub type AllowRule = Arc<dyn Fn(&Addr) -> bool + Send + Sync>;

/// Wraps a transport and silently drops inbound datagrams whose source
/// fails the allow rule. Outbound traffic is unaffected.
pub struct FwTransport {
    inner: Arc<dyn Transport>,
    allow: AllowRule,
}

impl FwTransport {
    pub fn wrap(inner: Arc<dyn Transport>, allow: AllowRule) -> FwTransport {
        FwTransport { inner, allow }
    }
}

#[async_trait]
impl Transport for FwTransport {
    fn local_addresses(&self) -> Vec<Addr> {
        self.inner.local_addresses()
    }

    async fn read_message(&self, buf: &mut [u8]) -> io::Result<(usize, Addr)> {
        loop {
            let (n, from) = self.inner.read_message(buf).await?;
            if (self.allow)(&from) {
                return Ok((n, from));
            }
            tracing::trace!(from = %from, "firewall dropped datagram");
        }
    }

    async fn write_message(&self, msg: &[u8], to: &Addr) -> io::Result<()> {
        self.inner.write_message(msg, to).await
    }

    async fn close(&self) -> io::Result<()> {
        self.inner.close().await
    }
}

// ============================================================================
// In-process mesh
// ============================================================================

pub mod inproc {
    //! In-process datagram mesh.
    //!
    //! Endpoints share a [`Network`] and address each other as
    //! `udp4:127.0.0.1:<port>`, so they compose with the firewall and
    //! NAT wrappers exactly like real sockets. Percentage packet loss
    //! can be injected per network.

    use std::collections::HashMap;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use async_trait::async_trait;
    use rand::Rng;
    use tokio::sync::{mpsc, watch};

    use super::{closed_err, Addr, Transport};

    const QUEUE_DEPTH: usize = 1024;

    /// Shared in-process datagram fabric.
    pub struct Network {
        endpoints: StdMutex<HashMap<u16, mpsc::Sender<(Vec<u8>, Addr)>>>,
        next_port: AtomicU16,
        /// Percentage of datagrams to drop, 0–100.
        loss_pct: AtomicU32,
    }

    impl Network {
        pub fn new() -> Arc<Network> {
            Arc::new(Network {
                endpoints: StdMutex::new(HashMap::new()),
                next_port: AtomicU16::new(1000),
                loss_pct: AtomicU32::new(0),
            })
        }

        /// Set the injected loss percentage for subsequent datagrams.
        pub fn set_loss(&self, pct: u32) {
            self.loss_pct.store(pct.min(100), Ordering::Relaxed);
        }

        /// Open an endpoint on an automatically assigned port.
        pub fn endpoint(self: &Arc<Self>) -> InprocTransport {
            let port = self.next_port.fetch_add(1, Ordering::SeqCst);
            self.endpoint_on(port)
        }

        /// Open an endpoint on a specific port, replacing any previous
        /// occupant.
        pub fn endpoint_on(self: &Arc<Self>, port: u16) -> InprocTransport {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            self.endpoints.lock().unwrap().insert(port, tx);
            let (closed_tx, _) = watch::channel(false);
            InprocTransport {
                net: Arc::clone(self),
                port,
                rx: tokio::sync::Mutex::new(rx),
                closed_tx,
            }
        }

        fn deliver(&self, to_port: u16, msg: Vec<u8>, from: Addr) -> io::Result<()> {
            let loss = self.loss_pct.load(Ordering::Relaxed);
            if loss > 0 && rand::thread_rng().gen_range(0..100) < loss {
                return Ok(());
            }
            let sender = self.endpoints.lock().unwrap().get(&to_port).cloned();
            if let Some(tx) = sender {
                // Queue overflow behaves like the network dropping.
                let _ = tx.try_send((msg, from));
            }
            Ok(())
        }

        fn remove(&self, port: u16) {
            self.endpoints.lock().unwrap().remove(&port);
        }
    }

    /// One endpoint on an in-process [`Network`].
    pub struct InprocTransport {
        net: Arc<Network>,
        port: u16,
        rx: tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, Addr)>>,
        closed_tx: watch::Sender<bool>,
    }

    impl InprocTransport {
        pub fn addr(&self) -> Addr {
            Addr::Udp4(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.port,
            ))
        }
    }

    #[async_trait]
    impl Transport for InprocTransport {
        fn local_addresses(&self) -> Vec<Addr> {
            vec![self.addr()]
        }

        async fn read_message(&self, buf: &mut [u8]) -> io::Result<(usize, Addr)> {
            let mut closed_rx = self.closed_tx.subscribe();
            if *closed_rx.borrow() {
                return Err(closed_err());
            }
            let mut rx = self.rx.lock().await;
            tokio::select! {
                _ = closed_rx.changed() => Err(closed_err()),
                msg = rx.recv() => match msg {
                    Some((data, from)) => {
                        let n = data.len().min(buf.len());
                        buf[..n].copy_from_slice(&data[..n]);
                        Ok((n, from))
                    }
                    None => Err(closed_err()),
                },
            }
        }

        async fn write_message(&self, msg: &[u8], to: &Addr) -> io::Result<()> {
            if *self.closed_tx.subscribe().borrow() {
                return Err(closed_err());
            }
            match to {
                Addr::Udp4(sa) => self.net.deliver(sa.port(), msg.to_vec(), self.addr()),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("in-process mesh cannot reach {to}"),
                )),
            }
        }

        async fn close(&self) -> io::Result<()> {
            let _ = self.closed_tx.send(true);
            self.net.remove(self.port);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_string_round_trip() {
        for s in [
            "udp4:127.0.0.1:4242".to_string(),
            "udp6:[::1]:4242".to_string(),
            format!("peer:{}", "ab".repeat(32)),
        ] {
            let addr: Addr = s.parse().unwrap();
            assert_eq!(addr.to_string(), s);
        }
    }

    #[test]
    fn addr_rejects_garbage() {
        assert!("".parse::<Addr>().is_err());
        assert!("tcp:127.0.0.1:1".parse::<Addr>().is_err());
        assert!("peer:nothex".parse::<Addr>().is_err());
    }

    #[test]
    fn natable_capability() {
        let addr: Addr = "udp4:10.0.0.5:9000".parse().unwrap();
        let (proto, ip, port) = addr.natable().unwrap();
        assert_eq!(proto, Proto::Udp);
        assert_eq!(ip.to_string(), "10.0.0.5");
        assert_eq!(port, 9000);

        let global = addr.make_global("1.2.3.4".parse().unwrap(), 9001).unwrap();
        assert_eq!(global.to_string(), "udp4:1.2.3.4:9001");

        let relay: Addr = format!("peer:{}", "cd".repeat(32)).parse().unwrap();
        assert!(relay.natable().is_none());
        assert!(relay.make_global("1.2.3.4".parse().unwrap(), 1).is_none());
    }

    #[tokio::test]
    async fn inproc_delivers_between_endpoints() {
        let net = inproc::Network::new();
        let a = net.endpoint();
        let b = net.endpoint();

        a.write_message(b"hello", &b.addr()).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = b.read_message(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.addr());
    }

    #[tokio::test]
    async fn inproc_close_unblocks_reader() {
        let net = inproc::Network::new();
        let a = std::sync::Arc::new(net.endpoint());

        let reader = {
            let a = a.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                a.read_message(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        a.close().await.unwrap();
        assert!(reader.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn firewall_drops_disallowed_sources() {
        let net = inproc::Network::new();
        let allowed = net.endpoint();
        let blocked = net.endpoint();
        let target = net.endpoint();
        let target_addr = target.addr();
        let blocked_addr = blocked.addr();

        let fw = FwTransport::wrap(
            Arc::new(target),
            Arc::new(move |from: &Addr| *from != blocked_addr),
        );

        blocked.write_message(b"nope", &target_addr).await.unwrap();
        allowed.write_message(b"yes", &target_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = fw.read_message(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"yes");
        assert_eq!(from, allowed.addr());
    }
}
