//! # Peer Table
//!
//! Known peers keyed by hashname, organized into 256 k-buckets by XOR
//! distance to the local hashname: bucket *i* holds peers whose distance
//! has its highest set bit at position *i*. The table is owned by the
//! controller task; `Peer` records are shared read-mostly handles whose
//! mutable pieces sit behind their own small locks.
//!
//! A peer record is created on first evidence of existence — an inbound
//! handshake, gossip, or a manual dial — and merged on every later
//! sighting: paths are unioned by equality and keys adopted when the
//! record had none.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Instant;

use tracing::debug;

use crate::cipherset::Keys;
use crate::hashname::{distance_cmp, Hashname};
use crate::transport::Addr;

/// Maximum peers retained per bucket before down peers are evicted.
pub const BUCKET_SIZE: usize = 128;

/// Dial information for a peer: its hashname plus whatever keys and
/// candidate paths are currently known.
#[derive(Clone, Debug)]
pub struct PeerAddr {
    pub hashname: Hashname,
    pub keys: Option<Keys>,
    pub paths: Vec<Addr>,
}

impl PeerAddr {
    pub fn new(hashname: Hashname) -> PeerAddr {
        PeerAddr {
            hashname,
            keys: None,
            paths: Vec::new(),
        }
    }

    pub fn with_keys(mut self, keys: Keys) -> PeerAddr {
        self.keys = Some(keys);
        self
    }

    pub fn with_path(mut self, path: Addr) -> PeerAddr {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
        self
    }
}

#[derive(Clone)]
struct PathInfo {
    addr: Addr,
    last_seen: Option<Instant>,
}

struct PeerInner {
    keys: Option<Keys>,
    paths: Vec<PathInfo>,
}

/// A known remote endpoint.
///
/// The controller owns the table entry; lines hold a read-only `Arc`.
/// The peer never references its line.
pub struct Peer {
    hashname: Hashname,
    inner: StdRwLock<PeerInner>,
    is_down: AtomicBool,
}

impl Peer {
    fn new(addr: &PeerAddr) -> Arc<Peer> {
        Arc::new(Peer {
            hashname: addr.hashname,
            inner: StdRwLock::new(PeerInner {
                keys: addr.keys.clone(),
                paths: addr
                    .paths
                    .iter()
                    .map(|a| PathInfo {
                        addr: a.clone(),
                        last_seen: None,
                    })
                    .collect(),
            }),
            is_down: AtomicBool::new(false),
        })
    }

    pub fn hashname(&self) -> Hashname {
        self.hashname
    }

    pub fn is_down(&self) -> bool {
        self.is_down.load(Ordering::SeqCst)
    }

    pub fn set_down(&self, down: bool) {
        self.is_down.store(down, Ordering::SeqCst);
    }

    /// Candidate paths, most recently seen first.
    pub fn paths(&self) -> Vec<Addr> {
        let inner = self.inner.read().unwrap();
        let mut paths = inner.paths.clone();
        paths.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        paths.into_iter().map(|p| p.addr).collect()
    }

    pub fn keys(&self) -> Option<Keys> {
        self.inner.read().unwrap().keys.clone()
    }

    pub fn has_keys(&self) -> bool {
        self.inner.read().unwrap().keys.is_some()
    }

    /// Whether any candidate path is a relay indirection.
    pub fn has_via(&self) -> bool {
        self.inner
            .read()
            .unwrap()
            .paths
            .iter()
            .any(|p| p.addr.via().is_some())
    }

    pub fn has_paths(&self) -> bool {
        !self.inner.read().unwrap().paths.is_empty()
    }

    /// Union in new paths and adopt keys if the record had none.
    pub fn merge(&self, addr: &PeerAddr) {
        let mut inner = self.inner.write().unwrap();
        if inner.keys.is_none() {
            inner.keys = addr.keys.clone();
        } else if let (Some(existing), Some(new)) = (&mut inner.keys, &addr.keys) {
            existing.merge(new);
        }
        for path in &addr.paths {
            if !inner.paths.iter().any(|p| p.addr == *path) {
                inner.paths.push(PathInfo {
                    addr: path.clone(),
                    last_seen: None,
                });
            }
        }
    }

    /// Record traffic from `addr`, adding it as a path when new. Any
    /// inbound evidence also clears a down marker.
    pub fn mark_seen(&self, addr: &Addr) {
        let mut inner = self.inner.write().unwrap();
        match inner.paths.iter_mut().find(|p| p.addr == *addr) {
            Some(path) => path.last_seen = Some(Instant::now()),
            None => inner.paths.push(PathInfo {
                addr: addr.clone(),
                last_seen: Some(Instant::now()),
            }),
        }
        drop(inner);
        self.is_down.store(false, Ordering::SeqCst);
    }

    /// Drop a path that failed beyond its retry budget.
    pub fn remove_path(&self, addr: &Addr) {
        self.inner.write().unwrap().paths.retain(|p| p.addr != *addr);
    }

    /// Drop every direct path that never carried inbound traffic. Relay
    /// indirections are kept so the peer stays reachable by bridge.
    pub fn prune_unseen_paths(&self) {
        self.inner
            .write()
            .unwrap()
            .paths
            .retain(|p| p.last_seen.is_some() || p.addr.via().is_some());
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer({})", self.hashname.short())
    }
}

/// Hashname-keyed k-bucket table.
pub struct PeerTable {
    local: Hashname,
    buckets: Vec<Vec<Arc<Peer>>>,
    num_peers: Arc<AtomicUsize>,
}

impl PeerTable {
    pub fn new(local: Hashname, num_peers: Arc<AtomicUsize>) -> PeerTable {
        PeerTable {
            local,
            buckets: (0..256).map(|_| Vec::new()).collect(),
            num_peers,
        }
    }

    fn bucket_index(&self, hashname: &Hashname) -> usize {
        let dist = self.local.xor_distance(hashname);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        255
    }

    pub fn get_peer(&self, hashname: &Hashname) -> Option<Arc<Peer>> {
        let idx = self.bucket_index(hashname);
        self.buckets[idx]
            .iter()
            .find(|p| p.hashname == *hashname)
            .cloned()
    }

    /// Insert or merge; `discovered` is true iff this call created the
    /// record.
    pub fn add_peer(&mut self, addr: &PeerAddr) -> (Arc<Peer>, bool) {
        if let Some(peer) = self.get_peer(&addr.hashname) {
            peer.merge(addr);
            return (peer, false);
        }

        let peer = Peer::new(addr);
        let idx = self.bucket_index(&addr.hashname);
        let bucket = &mut self.buckets[idx];
        if bucket.len() >= BUCKET_SIZE {
            if let Some(pos) = bucket.iter().position(|p| p.is_down()) {
                let evicted = bucket.remove(pos);
                debug!(peer = %evicted.hashname().short(), "evicted down peer from full bucket");
                self.num_peers.fetch_sub(1, Ordering::SeqCst);
            }
        }
        bucket.push(Arc::clone(&peer));
        self.num_peers.fetch_add(1, Ordering::SeqCst);
        (peer, true)
    }

    /// The `n` known peers closest to `target` by XOR distance,
    /// non-decreasing; buckets are scanned outward from the target's
    /// bucket until enough candidates are collected.
    pub fn closest_peers(&self, target: &Hashname, n: usize) -> Vec<Arc<Peer>> {
        if n == 0 {
            return Vec::new();
        }

        let start = self.bucket_index(target);
        let mut collected: Vec<Arc<Peer>> = Vec::new();
        let mut offset = 0usize;
        loop {
            let mut visited_any = false;
            if offset <= start {
                collected.extend(self.buckets[start - offset].iter().cloned());
                visited_any = true;
            }
            if offset > 0 && start + offset < 256 {
                collected.extend(self.buckets[start + offset].iter().cloned());
                visited_any = true;
            }
            if collected.len() >= n && offset > 0 {
                break;
            }
            if !visited_any && offset > 0 {
                break;
            }
            offset += 1;
            if offset >= 256 {
                break;
            }
        }

        collected.sort_by(|a, b| {
            let da = a.hashname().xor_distance(target);
            let db = b.hashname().xor_distance(target);
            distance_cmp(&da, &db)
        });
        collected.truncate(n);
        collected
    }

    pub fn len(&self) -> usize {
        self.num_peers.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PeerTable {
        PeerTable::new(Hashname::from_bytes([0u8; 32]), Arc::new(AtomicUsize::new(0)))
    }

    fn hashname(seed: u8) -> Hashname {
        let mut bytes = [0u8; 32];
        bytes[31] = seed;
        Hashname::from_bytes(bytes)
    }

    fn udp(port: u16) -> Addr {
        format!("udp4:127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn add_peer_reports_discovery_once() {
        let mut table = table();
        let addr = PeerAddr::new(hashname(1)).with_path(udp(1));

        let (_, discovered) = table.add_peer(&addr);
        assert!(discovered);
        let (_, discovered) = table.add_peer(&addr);
        assert!(!discovered);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn merge_unions_paths_and_adopts_keys() {
        let mut table = table();
        let (peer, _) = table.add_peer(&PeerAddr::new(hashname(1)).with_path(udp(1)));
        assert!(!peer.has_keys());

        let keys = crate::cipherset::PrivateKeys::generate().public_keys();
        let (same, discovered) = table.add_peer(
            &PeerAddr::new(hashname(1))
                .with_keys(keys)
                .with_path(udp(1))
                .with_path(udp(2)),
        );
        assert!(!discovered);
        assert!(Arc::ptr_eq(&peer, &same));
        assert!(peer.has_keys());
        assert_eq!(peer.paths().len(), 2);
    }

    #[test]
    fn closest_peers_sorted_by_distance() {
        let mut table = table();
        for seed in 1..=30u8 {
            table.add_peer(&PeerAddr::new(hashname(seed)));
        }

        let target = hashname(7);
        let closest = table.closest_peers(&target, 10);
        assert_eq!(closest.len(), 10);
        assert_eq!(closest[0].hashname(), target);

        let mut prev = [0u8; 32];
        for peer in &closest {
            let dist = peer.hashname().xor_distance(&target);
            assert!(distance_cmp(&prev, &dist) != std::cmp::Ordering::Greater);
            prev = dist;
        }
    }

    #[test]
    fn closest_peers_exhausts_small_tables() {
        let mut table = table();
        for seed in 1..=3u8 {
            table.add_peer(&PeerAddr::new(hashname(seed)));
        }
        assert_eq!(table.closest_peers(&hashname(9), 10).len(), 3);
        assert!(table.closest_peers(&hashname(9), 0).is_empty());
    }

    #[test]
    fn mark_seen_clears_down_flag() {
        let mut table = table();
        let (peer, _) = table.add_peer(&PeerAddr::new(hashname(1)));
        peer.set_down(true);
        assert!(peer.is_down());

        peer.mark_seen(&udp(5));
        assert!(!peer.is_down());
        assert_eq!(peer.paths(), vec![udp(5)]);
    }
}
