//! # Switch
//!
//! The switch is the single-process controller that owns the peer table,
//! the `lines` map (at most one line per remote hashname), and the
//! active-line index keyed by local token. All mutation of those three
//! tables happens on one actor task; every other task talks to it
//! through a [`Command`] mailbox with oneshot replies, and statistics
//! counters are atomics so readers never enter the mailbox.
//!
//! ```text
//!              ┌──────────────┐
//!   datagrams  │ reader task  │── handshake ──► AddPeer / GetLine
//! ────────────►│              │── line pkt ───► GetActiveLine ─► line
//!              └──────────────┘
//!              ┌──────────────┐    Command mailbox + 5 s stats tick
//!              │ controller   │  peers ▪ lines ▪ active_lines
//!              └──────────────┘
//! ```
//!
//! Shutdown flips the controller into a terminating loop: it broadcasts
//! shutdown to every line, then keeps draining deactivate/unregister
//! messages until the `lines` map is empty. Activations or registrations
//! arriving during termination are immediately shut down; queries answer
//! `None`. Closing the switch is idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, Listener};
use crate::cipherset::{self, Keys, Parts, PrivateKeys, Token};
use crate::error::{Error, Result};
use crate::hashname::Hashname;
use crate::line::{self, LineHandle};
use crate::packet::Packet;
use crate::peers::{Peer, PeerAddr, PeerTable};
use crate::transport::{Addr, Transport, MAX_MESSAGE_SIZE};

/// Statistics log cadence in both controller loops.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Listener accept queue depth per channel type.
const LISTENER_QUEUE: usize = 64;

/// Switch construction parameters.
pub struct SwitchConfig {
    /// Long-term private keys, one per supported CSID.
    pub keys: PrivateKeys,
    /// Rekey a line after this age.
    pub rekey_after: Duration,
    /// Rekey a line after this many payload bytes.
    pub rekey_bytes: u64,
    /// Dial attempts per line before the peer is marked down.
    pub open_retries: u32,
    /// First dial retry delay; doubles per attempt up to a 30 s cap.
    pub open_backoff: Duration,
    /// Run a DHT seek for every newly discovered peer.
    pub seek_on_discovery: bool,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        SwitchConfig {
            keys: PrivateKeys::generate(),
            rekey_after: Duration::from_secs(55 * 60),
            rekey_bytes: 1 << 30,
            open_retries: crate::line::OPEN_RETRY_BUDGET,
            open_backoff: crate::line::OPEN_BACKOFF_BASE,
            seek_on_discovery: false,
        }
    }
}

/// Runtime knobs shared with line runners.
pub(crate) struct RuntimeConfig {
    pub(crate) rekey_after: Duration,
    pub(crate) rekey_bytes: u64,
    pub(crate) open_retries: u32,
    pub(crate) open_backoff: Duration,
    pub(crate) seek_on_discovery: bool,
}

#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) num_open_lines: AtomicI64,
    pub(crate) num_running_lines: AtomicI64,
    pub(crate) num_peers: Arc<AtomicUsize>,
    pub(crate) invalid_packets: AtomicU64,
}

/// Point-in-time statistics snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwitchStats {
    pub num_open_lines: i64,
    pub num_running_lines: i64,
    pub known_peers: usize,
    pub invalid_packets: u64,
}

const STATE_RUNNING: u8 = 0;
const STATE_TERMINATING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// State shared between the façade, the controller, line runners, and
/// the helper modules.
pub(crate) struct SwitchShared {
    pub(crate) hashname: Hashname,
    pub(crate) keys: PrivateKeys,
    pub(crate) parts: Parts,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) ctrl: ControllerHandle,
    pub(crate) config: RuntimeConfig,
    pub(crate) bridge: crate::bridge::BridgeTable,
    pub(crate) stats: Stats,
    listeners: StdRwLock<HashMap<String, mpsc::Sender<Channel>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    state: AtomicU8,
}

impl SwitchShared {
    pub(crate) fn listener_for(&self, typ: &str) -> Option<mpsc::Sender<Channel>> {
        self.listeners.read().unwrap().get(typ).cloned()
    }

    /// Create the accept queue for inbound channels of `typ`, replacing
    /// any previous listener.
    pub(crate) fn register_listener(&self, typ: &str) -> Listener {
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE);
        self.listeners.write().unwrap().insert(typ.to_string(), tx);
        Listener::new(typ.to_string(), rx)
    }

    pub(crate) fn count_invalid_packet(&self) {
        self.stats.invalid_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn track_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(task);
    }

    fn snapshot_stats(&self) -> SwitchStats {
        SwitchStats {
            num_open_lines: self.stats.num_open_lines.load(Ordering::SeqCst),
            num_running_lines: self.stats.num_running_lines.load(Ordering::SeqCst),
            known_peers: self.stats.num_peers.load(Ordering::SeqCst),
            invalid_packets: self.stats.invalid_packets.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Controller mailbox
// ============================================================================

pub(crate) enum Command {
    GetPeer(Hashname, oneshot::Sender<Option<Arc<Peer>>>),
    AddPeer(PeerAddr, oneshot::Sender<Option<(Arc<Peer>, bool)>>),
    ClosestPeers(Hashname, usize, oneshot::Sender<Vec<Arc<Peer>>>),
    GetLine {
        hashname: Hashname,
        path: Option<Addr>,
        keys: Option<Keys>,
        reply: oneshot::Sender<Option<LineHandle>>,
    },
    RegisterLine(LineHandle),
    UnregisterLine {
        hashname: Hashname,
        peer_down: bool,
    },
    ActivateLine(Token, LineHandle),
    DeactivateLine(Token),
    GetActiveLine(Token, oneshot::Sender<Option<LineHandle>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable mailbox sender for the controller actor.
#[derive(Clone)]
pub(crate) struct ControllerHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub(crate) async fn get_peer(&self, hashname: Hashname) -> Option<Arc<Peer>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::GetPeer(hashname, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub(crate) async fn add_peer(&self, addr: PeerAddr) -> Option<(Arc<Peer>, bool)> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::AddPeer(addr, tx)).await.ok()?;
        rx.await.ok().flatten()
    }

    pub(crate) async fn closest_peers(&self, hashname: Hashname, n: usize) -> Vec<Arc<Peer>> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ClosestPeers(hashname, n, tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub(crate) async fn get_line(
        &self,
        hashname: Hashname,
        path: Option<Addr>,
        keys: Option<Keys>,
    ) -> Option<LineHandle> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetLine {
                hashname,
                path,
                keys,
                reply: tx,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub(crate) async fn get_active_line(&self, token: Token) -> Option<LineHandle> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::GetActiveLine(token, tx))
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub(crate) async fn activate_line(&self, token: Token, line: LineHandle) {
        let _ = self.cmd_tx.send(Command::ActivateLine(token, line)).await;
    }

    pub(crate) async fn deactivate_line(&self, token: Token) {
        let _ = self.cmd_tx.send(Command::DeactivateLine(token)).await;
    }

    pub(crate) async fn unregister_line(&self, hashname: Hashname, peer_down: bool) {
        let _ = self
            .cmd_tx
            .send(Command::UnregisterLine {
                hashname,
                peer_down,
            })
            .await;
    }

    async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct Controller {
    shared: Arc<SwitchShared>,
    cmd_rx: mpsc::Receiver<Command>,
    peers: PeerTable,
    lines: HashMap<Hashname, LineHandle>,
    active: HashMap<Token, LineHandle>,
}

impl Controller {
    async fn run(mut self) {
        let mut stats = tokio::time::interval(STATS_INTERVAL);
        stats.tick().await;

        loop {
            tokio::select! {
                _ = stats.tick() => {
                    debug!(stats = ?self.shared.snapshot_stats(), "switch stats");
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return,
                    Some(Command::Shutdown(reply)) => {
                        self.run_terminating(vec![reply]).await;
                        return;
                    }
                    Some(cmd) => self.handle(cmd),
                },
            }
        }
    }

    async fn run_terminating(mut self, mut replies: Vec<oneshot::Sender<()>>) {
        self.shared.state.store(STATE_TERMINATING, Ordering::SeqCst);
        info!(lines = self.lines.len(), "switch shutting down");

        for line in self.lines.values() {
            line.shutdown();
        }

        let mut stats = tokio::time::interval(STATS_INTERVAL);
        stats.tick().await;

        while !self.lines.is_empty() {
            tokio::select! {
                _ = stats.tick() => {
                    debug!(stats = ?self.shared.snapshot_stats(), "switch stats (terminating)");
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None => break,
                    Some(cmd) => self.handle_terminating(cmd, &mut replies),
                },
            }
        }

        for reply in replies {
            let _ = reply.send(());
        }
        debug!("controller drained");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::GetPeer(h, reply) => {
                let _ = reply.send(self.peers.get_peer(&h));
            }
            Command::AddPeer(addr, reply) => {
                let result = self.add_peer(addr);
                let _ = reply.send(Some(result));
            }
            Command::ClosestPeers(h, n, reply) => {
                let _ = reply.send(self.peers.closest_peers(&h, n));
            }
            Command::GetLine {
                hashname,
                path,
                keys,
                reply,
            } => {
                let line = self.get_line(hashname, path, keys);
                let _ = reply.send(line);
            }
            Command::RegisterLine(line) => {
                self.register_line(line);
            }
            Command::UnregisterLine {
                hashname,
                peer_down,
            } => self.unregister_line(hashname, peer_down),
            Command::ActivateLine(token, line) => {
                if !self.lines.contains_key(&line.hashname()) {
                    // Unreachable by construction; a mismatch here means
                    // the ownership discipline is broken.
                    error!(peer = %line.hashname().short(), "active line without registered line");
                    panic!("active line without registered line");
                }
                self.active.insert(token, line);
                self.shared.stats.num_open_lines.fetch_add(1, Ordering::SeqCst);
            }
            Command::DeactivateLine(token) => {
                if self.active.remove(&token).is_some() {
                    self.shared.stats.num_open_lines.fetch_sub(1, Ordering::SeqCst);
                }
            }
            Command::GetActiveLine(token, reply) => {
                let _ = reply.send(self.active.get(&token).cloned());
            }
            Command::Shutdown(_) => unreachable!("handled by the run loop"),
        }
    }

    fn handle_terminating(&mut self, cmd: Command, replies: &mut Vec<oneshot::Sender<()>>) {
        match cmd {
            Command::GetPeer(_, reply) => {
                let _ = reply.send(None);
            }
            Command::AddPeer(_, reply) => {
                let _ = reply.send(None);
            }
            Command::ClosestPeers(_, _, reply) => {
                let _ = reply.send(Vec::new());
            }
            Command::GetLine { reply, .. } => {
                let _ = reply.send(None);
            }
            Command::RegisterLine(line) => line.shutdown(),
            Command::UnregisterLine {
                hashname,
                peer_down,
            } => self.unregister_line(hashname, peer_down),
            Command::ActivateLine(_, line) => line.shutdown(),
            Command::DeactivateLine(token) => {
                if self.active.remove(&token).is_some() {
                    self.shared.stats.num_open_lines.fetch_sub(1, Ordering::SeqCst);
                }
            }
            Command::GetActiveLine(_, reply) => {
                let _ = reply.send(None);
            }
            Command::Shutdown(reply) => replies.push(reply),
        }
    }

    fn add_peer(&mut self, addr: PeerAddr) -> (Arc<Peer>, bool) {
        let hashname = addr.hashname;
        let (peer, discovered) = self.peers.add_peer(&addr);
        if discovered {
            debug!(peer = %hashname.short(), "discovered peer");
            self.get_line(hashname, None, None);
            if self.shared.config.seek_on_discovery {
                crate::seek::spawn_seek(&self.shared, hashname);
            }
        }
        (peer, discovered)
    }

    fn get_line(
        &mut self,
        hashname: Hashname,
        path: Option<Addr>,
        keys: Option<Keys>,
    ) -> Option<LineHandle> {
        if hashname == self.shared.hashname {
            return None;
        }
        if let Some(line) = self.lines.get(&hashname) {
            return Some(line.clone());
        }

        let mut addr = PeerAddr::new(hashname);
        addr.keys = keys;
        if let Some(path) = path {
            addr.paths.push(path);
        }
        let (peer, discovered) = self.peers.add_peer(&addr);
        if discovered {
            debug!(peer = %hashname.short(), "discovered peer (get_line)");
        }
        if peer.is_down() {
            return None;
        }
        if !(peer.has_keys() || peer.has_via()) || !peer.has_paths() {
            return None;
        }

        let line = line::spawn(Arc::clone(&self.shared), peer);
        self.register_line(line.clone());
        Some(line)
    }

    fn register_line(&mut self, line: LineHandle) {
        self.lines.insert(line.hashname(), line);
        self.shared
            .stats
            .num_running_lines
            .fetch_add(1, Ordering::SeqCst);
    }

    fn unregister_line(&mut self, hashname: Hashname, peer_down: bool) {
        if let Some(line) = self.lines.remove(&hashname) {
            if peer_down {
                line.peer().set_down(true);
                info!(peer = %hashname.short(), "peer marked down");
            }
            self.shared
                .stats
                .num_running_lines
                .fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// Transport reader
// ============================================================================

async fn run_reader(shared: Arc<SwitchShared>) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let (n, from) = match shared.transport.read_message(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, "reader stopping");
                return;
            }
        };
        let data = &buf[..n];
        let pkt = match Packet::decode(data) {
            Ok(pkt) => pkt,
            Err(_) => {
                shared.count_invalid_packet();
                continue;
            }
        };

        if let Some(csid) = pkt.csid {
            handle_handshake(&shared, csid, pkt, data, &from).await;
        } else if pkt.header.get_str("type") == Some("line") {
            handle_line_packet(&shared, pkt, data, &from).await;
        } else {
            shared.count_invalid_packet();
        }
    }
}

async fn handle_line_packet(shared: &Arc<SwitchShared>, pkt: Packet, raw: &[u8], from: &Addr) {
    let token: Option<Token> = pkt
        .header
        .get_str("line")
        .and_then(|s| hex::decode(s).ok())
        .and_then(|b| b.try_into().ok());
    let Some(token) = token else {
        shared.count_invalid_packet();
        return;
    };

    if let Some(line) = shared.ctrl.get_active_line(token).await {
        line.deliver(pkt, from.clone()).await;
        return;
    }
    // Not ours: a bridge route may know where it goes.
    if !crate::bridge::route_line_packet(shared, token, raw).await {
        shared.count_invalid_packet();
        trace!(token = %hex::encode(token), "line packet with unknown token dropped");
    }
}

async fn handle_handshake(
    shared: &Arc<SwitchShared>,
    csid: u8,
    pkt: Packet,
    raw: &[u8],
    from: &Addr,
) {
    let Some(local_key) = shared.keys.get(csid) else {
        if !crate::bridge::route_handshake(shared, raw, from).await {
            shared.count_invalid_packet();
        }
        return;
    };

    let envelope = match cipherset::open_open(csid, local_key, &pkt.body) {
        Ok(env) => env,
        Err(_) => {
            // Possibly a handshake relayed through us for someone else.
            if !crate::bridge::route_handshake(shared, raw, from).await {
                shared.count_invalid_packet();
            }
            return;
        }
    };

    if envelope.inner.header.get_str("type") != Some("open") {
        shared.count_invalid_packet();
        return;
    }
    let to = envelope
        .inner
        .header
        .get_str("to")
        .and_then(|s| s.parse::<Hashname>().ok());
    if to != Some(shared.hashname) {
        shared.count_invalid_packet();
        return;
    }
    let Some(parts_obj) = envelope.inner.header.get_object("from") else {
        shared.count_invalid_packet();
        return;
    };
    let parts = match Parts::from_header(parts_obj) {
        Ok(parts) => parts,
        Err(_) => {
            shared.count_invalid_packet();
            return;
        }
    };
    // The conveyed key must be the one the parts claim for this CSID.
    if parts.get(csid) != Some(&envelope.sender_key.fingerprint()) {
        shared.count_invalid_packet();
        return;
    }
    let hashname = match Hashname::from_parts(&parts) {
        Ok(h) => h,
        Err(_) => {
            shared.count_invalid_packet();
            return;
        }
    };
    if hashname == shared.hashname {
        return;
    }

    let mut keys = Keys::new();
    keys.insert(csid, envelope.sender_key.clone());
    let addr = PeerAddr {
        hashname,
        keys: Some(keys),
        paths: vec![from.clone()],
    };
    let Some((peer, _)) = shared.ctrl.add_peer(addr).await else {
        return;
    };
    // Inbound evidence of liveness clears any down marker.
    peer.mark_seen(from);

    if let Some(line) = shared.ctrl.get_line(hashname, Some(from.clone()), None).await {
        line.handshake(envelope, from.clone()).await;
    }
}

// ============================================================================
// Public façade
// ============================================================================

/// A running switch endpoint.
pub struct Switch {
    shared: Arc<SwitchShared>,
    joined: AtomicBool,
}

impl Switch {
    /// Bring up a switch over `transport`.
    pub async fn open(config: SwitchConfig, transport: Arc<dyn Transport>) -> Result<Switch> {
        if config.keys.is_empty() {
            return Err(Error::InvalidKeys("no private keys supplied".into()));
        }
        let parts = config.keys.public_keys().to_parts();
        let hashname = Hashname::from_parts(&parts)?;

        let (cmd_tx, cmd_rx) = mpsc::channel(128);
        let ctrl = ControllerHandle { cmd_tx };

        let shared = Arc::new(SwitchShared {
            hashname,
            keys: config.keys,
            parts,
            transport,
            ctrl,
            config: RuntimeConfig {
                rekey_after: config.rekey_after,
                rekey_bytes: config.rekey_bytes,
                open_retries: config.open_retries,
                open_backoff: config.open_backoff,
                seek_on_discovery: config.seek_on_discovery,
            },
            bridge: crate::bridge::BridgeTable::new(),
            stats: Stats::default(),
            listeners: StdRwLock::new(HashMap::new()),
            tasks: StdMutex::new(Vec::new()),
            state: AtomicU8::new(STATE_RUNNING),
        });

        // The peer table publishes its count through the shared stats.
        let controller = Controller {
            shared: Arc::clone(&shared),
            cmd_rx,
            peers: PeerTable::new(hashname, Arc::clone(&shared.stats.num_peers)),
            lines: HashMap::new(),
            active: HashMap::new(),
        };

        shared.track_task(tokio::spawn(controller.run()));
        shared.track_task(tokio::spawn(run_reader(Arc::clone(&shared))));
        crate::bridge::serve(&shared);
        crate::seek::serve(&shared);

        info!(hashname = %hashname, "switch open");
        Ok(Switch {
            shared,
            joined: AtomicBool::new(false),
        })
    }

    pub fn hashname(&self) -> Hashname {
        self.shared.hashname
    }

    pub fn parts(&self) -> Parts {
        self.shared.parts.clone()
    }

    pub fn public_keys(&self) -> Keys {
        self.shared.keys.public_keys()
    }

    /// This endpoint's identity as shared out of band: hashname, public
    /// keys, and the transport's current addresses.
    pub fn local_peer_addr(&self) -> PeerAddr {
        let mut addr = PeerAddr::new(self.shared.hashname).with_keys(self.public_keys());
        for path in self.shared.transport.local_addresses() {
            addr = addr.with_path(path);
        }
        addr
    }

    /// Insert or merge a peer record; `discovered` is true on first
    /// sight, which also triggers a dial attempt.
    pub async fn add_peer(&self, addr: PeerAddr) -> Result<(Arc<Peer>, bool)> {
        self.shared
            .ctrl
            .add_peer(addr)
            .await
            .ok_or_else(|| Error::Closed("switch closed".into()))
    }

    pub async fn get_peer(&self, hashname: Hashname) -> Option<Arc<Peer>> {
        self.shared.ctrl.get_peer(hashname).await
    }

    /// Known peers closest to `target` by XOR distance.
    pub async fn closest_peers(&self, target: Hashname, n: usize) -> Vec<Arc<Peer>> {
        self.shared.ctrl.closest_peers(target, n).await
    }

    /// Open a channel of `typ` to `to`, dialing a line if needed.
    pub async fn open_channel(&self, to: Hashname, typ: &str, reliable: bool) -> Result<Channel> {
        let line = self
            .shared
            .ctrl
            .get_line(to, None, None)
            .await
            .ok_or_else(|| Error::UnknownPeer(to.short()))?;
        line.open_channel(typ, reliable).await
    }

    /// Register the accept queue for inbound channels of `typ`,
    /// replacing any previous listener.
    pub fn listen(&self, typ: &str) -> Listener {
        self.shared.register_listener(typ)
    }

    /// Run one seek for `target`, merging answers into the peer table.
    pub async fn seek(&self, target: Hashname) -> Result<Vec<Arc<Peer>>> {
        crate::seek::seek(&self.shared, target).await
    }

    pub fn stats(&self) -> SwitchStats {
        self.shared.snapshot_stats()
    }

    /// Shut the switch down: every line closes, every task is joined.
    /// Idempotent; re-closing returns success.
    pub async fn close(&self) -> Result<()> {
        self.shared.ctrl.shutdown().await;

        if self.joined.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.listeners.write().unwrap().clear();
        if let Err(e) = self.shared.transport.close().await {
            warn!(error = %e, "transport close failed");
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        self.shared.state.store(STATE_CLOSED, Ordering::SeqCst);
        info!(hashname = %self.shared.hashname, "switch closed");
        Ok(())
    }
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("hashname", &self.shared.hashname)
            .finish_non_exhaustive()
    }
}
