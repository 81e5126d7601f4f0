//! # Lines
//!
//! A line is the encrypted session to one peer. The controller owns the
//! `lines` map and guarantees at most one line per hashname; each line
//! runs its own task (the *runner*) that drives the handshake, the
//! channel state machines, retransmit timers, and rekeying.
//!
//! ```text
//! idle → opening → open ⇄ rekeying
//!                    │
//!                 closing → closed        (peer_down is orthogonal)
//! ```
//!
//! Opening seals an `open` packet toward every candidate path and
//! retries on an exponential backoff; when every path has failed beyond
//! the budget the peer is marked down and the line unregisters. Inbound
//! opens complete the handshake and register the line in the
//! active-line index under its local token. In a dial race each side
//! answers the other's open; session tokens derive from the ephemeral
//! publics, so the smaller hashname's pending open converges onto the
//! same key pair instead of fighting it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::channel::{new_channel_id, Channel, ChannelId, ChannelState, RecvOutcome};
use crate::cipherset::{self, select_csid, LineHalf, LineKeys, OpenEnvelope, Token};
use crate::error::{Error, Result};
use crate::hashname::Hashname;
use crate::packet::Packet;
use crate::peers::Peer;
use crate::switch::SwitchShared;
use crate::transport::Addr;

/// Default dial attempts before a peer is marked down.
pub const OPEN_RETRY_BUDGET: u32 = 4;

/// Default first retry delay; doubles per attempt.
pub const OPEN_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Retry delay ceiling.
pub const OPEN_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Runner housekeeping granularity (retransmits, rekey, retry timers).
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Depth of the per-channel delivery queue to the application.
const DELIVERY_QUEUE: usize = 256;

/// Line finite state, readable without entering the runner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LineState {
    Idle = 0,
    Opening = 1,
    Open = 2,
    Rekeying = 3,
    Closing = 4,
    Closed = 5,
}

impl LineState {
    fn from_u8(v: u8) -> LineState {
        match v {
            1 => LineState::Opening,
            2 => LineState::Open,
            3 => LineState::Rekeying,
            4 => LineState::Closing,
            5 => LineState::Closed,
            _ => LineState::Idle,
        }
    }
}

/// Requests handled by a line runner.
pub enum LineCmd {
    /// A decoded inbound open for this peer.
    Handshake { envelope: OpenEnvelope, from: Addr },
    /// An inbound line packet matched to this line by token.
    Inbound { pkt: Packet, from: Addr },
    /// Open a channel once the line is up.
    OpenChannel {
        typ: String,
        reliable: bool,
        reply: oneshot::Sender<Result<Channel>>,
    },
    ChannelSend {
        id: ChannelId,
        pkt: Packet,
        reply: oneshot::Sender<Result<()>>,
    },
    ChannelClose {
        id: ChannelId,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle to a line runner.
#[derive(Clone)]
pub struct LineHandle {
    hashname: Hashname,
    peer: Arc<Peer>,
    cmd_tx: mpsc::Sender<LineCmd>,
    shutdown: Arc<Notify>,
    shutdown_flag: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    active_path: Arc<StdRwLock<Option<Addr>>>,
}

impl LineHandle {
    pub fn hashname(&self) -> Hashname {
        self.hashname
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn state(&self) -> LineState {
        LineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The path line packets currently flow over, once open.
    pub fn active_path(&self) -> Option<Addr> {
        self.active_path.read().unwrap().clone()
    }

    /// Ask the runner to close. Idempotent and non-blocking.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub(crate) async fn handshake(&self, envelope: OpenEnvelope, from: Addr) {
        let _ = self.cmd_tx.send(LineCmd::Handshake { envelope, from }).await;
    }

    pub(crate) async fn deliver(&self, pkt: Packet, from: Addr) {
        let _ = self.cmd_tx.send(LineCmd::Inbound { pkt, from }).await;
    }

    pub async fn open_channel(&self, typ: &str, reliable: bool) -> Result<Channel> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(LineCmd::OpenChannel {
                typ: typ.to_string(),
                reliable,
                reply: tx,
            })
            .await
            .map_err(|_| Error::Closed("line closed".into()))?;
        rx.await.map_err(|_| Error::Closed("line closed".into()))?
    }
}

impl std::fmt::Debug for LineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Line({}, {:?})", self.hashname.short(), self.state())
    }
}

/// Spawn the runner for a new line to `peer`.
pub(crate) fn spawn(shared: Arc<SwitchShared>, peer: Arc<Peer>) -> LineHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(128);
    let handle = LineHandle {
        hashname: peer.hashname(),
        peer: Arc::clone(&peer),
        cmd_tx: cmd_tx.clone(),
        shutdown: Arc::new(Notify::new()),
        shutdown_flag: Arc::new(AtomicBool::new(false)),
        state: Arc::new(AtomicU8::new(LineState::Idle as u8)),
        active_path: Arc::new(StdRwLock::new(None)),
    };

    let runner = LineRunner {
        shared: Arc::clone(&shared),
        peer,
        hashname: handle.hashname,
        handle: handle.clone(),
        cmd_rx,
        cmd_tx,
        state: LineState::Idle,
        half: LineHalf::generate(),
        keys: None,
        prev_keys: None,
        remote_eph: None,
        activated: None,
        their_at: 0,
        sent_open: false,
        open_attempts: 0,
        next_open_at: None,
        opened_via: None,
        established: None,
        bytes_moved: 0,
        channels: HashMap::new(),
        pending_channels: Vec::new(),
        send_failures: 0,
    };

    let task = tokio::spawn(runner.run());
    shared.track_task(task);
    handle
}

struct PendingChannel {
    typ: String,
    reliable: bool,
    reply: oneshot::Sender<Result<Channel>>,
}

struct LineRunner {
    shared: Arc<SwitchShared>,
    peer: Arc<Peer>,
    hashname: Hashname,
    handle: LineHandle,
    cmd_rx: mpsc::Receiver<LineCmd>,
    cmd_tx: mpsc::Sender<LineCmd>,
    state: LineState,
    half: LineHalf,
    keys: Option<LineKeys>,
    /// Previous generation of keys, kept so packets in flight across a
    /// rekey still decrypt.
    prev_keys: Option<LineKeys>,
    remote_eph: Option<[u8; 32]>,
    /// Token currently registered in the active-line index.
    activated: Option<Token>,
    their_at: u64,
    sent_open: bool,
    open_attempts: u32,
    next_open_at: Option<Instant>,
    /// Relay this line's handshake traveled through, if any.
    opened_via: Option<Hashname>,
    established: Option<Instant>,
    bytes_moved: u64,
    channels: HashMap<ChannelId, ChannelState>,
    pending_channels: Vec<PendingChannel>,
    send_failures: u32,
}

impl LineRunner {
    async fn run(mut self) {
        self.set_state(LineState::Opening);
        self.send_open().await;

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.state == LineState::Closed {
                return;
            }
            if self.handle.shutdown_flag.load(Ordering::SeqCst) {
                self.close("line closed", false).await;
                return;
            }
            tokio::select! {
                _ = self.handle.shutdown.notified() => {
                    self.close("line closed", false).await;
                    return;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_cmd(cmd).await || self.state == LineState::Closed {
                            return;
                        }
                    }
                    None => {
                        self.close("line closed", false).await;
                        return;
                    }
                },
                _ = tick.tick() => {
                    if self.on_tick().await || self.state == LineState::Closed {
                        return;
                    }
                }
            }
        }
    }

    fn set_state(&mut self, state: LineState) {
        self.state = state;
        self.handle.state.store(state as u8, Ordering::SeqCst);
    }

    /// Returns true when the runner should exit.
    async fn handle_cmd(&mut self, cmd: LineCmd) -> bool {
        match cmd {
            LineCmd::Handshake { envelope, from } => self.on_handshake(envelope, from).await,
            LineCmd::Inbound { pkt, from } => self.on_line_packet(pkt, from).await,
            LineCmd::OpenChannel {
                typ,
                reliable,
                reply,
            } => {
                if self.state == LineState::Open || self.state == LineState::Rekeying {
                    let channel = self.create_channel(&typ, reliable);
                    let _ = reply.send(Ok(channel));
                } else {
                    self.pending_channels.push(PendingChannel {
                        typ,
                        reliable,
                        reply,
                    });
                }
                false
            }
            LineCmd::ChannelSend { id, pkt, reply } => {
                self.on_channel_send(id, pkt, reply).await;
                false
            }
            LineCmd::ChannelClose { id, reply } => {
                match self.channels.get_mut(&id) {
                    Some(state) => {
                        let packets = state.close().unwrap_or_default();
                        let _ = reply.send(Ok(()));
                        self.send_channel_packets(packets).await;
                        self.reap_finished().await;
                    }
                    None => {
                        let _ = reply.send(Ok(()));
                    }
                }
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    async fn send_open(&mut self) {
        if self.open_attempts >= self.shared.config.open_retries {
            self.peer_down().await;
            return;
        }
        let attempt = self.open_attempts;
        self.open_attempts += 1;
        let backoff = (self.shared.config.open_backoff * 2u32.saturating_pow(attempt))
            .min(OPEN_BACKOFF_CAP);
        self.next_open_at = Some(Instant::now() + backoff);

        let Some(wire) = self.build_open() else {
            // No shared key: fall back to asking a relay for an
            // introduction, or give up if there is none.
            if !self.request_introduction().await {
                self.fail_pending(Error::InvalidKeys(format!(
                    "no shared cipher set with {}",
                    self.hashname.short()
                )));
                self.unregister(false).await;
                self.set_state(LineState::Closed);
            }
            return;
        };

        let paths = self.peer.paths();
        if paths.is_empty() {
            self.peer_down().await;
            return;
        }
        for path in paths {
            match path.via() {
                Some(via) => {
                    crate::bridge::forward_open_via(&self.shared, *via, self.hashname, wire.clone());
                }
                None => {
                    if let Err(e) = self.shared.transport.write_message(&wire, &path).await {
                        trace!(peer = %self.hashname.short(), path = %path, error = %e, "open send failed");
                    }
                }
            }
        }
        self.sent_open = true;
        debug!(peer = %self.hashname.short(), attempt, "open sent");
    }

    fn build_open(&mut self) -> Option<Vec<u8>> {
        let peer_keys = self.peer.keys()?;
        let local_public = self.shared.keys.public_keys();
        let csid = select_csid(&local_public, &peer_keys)?;
        let local_static = self.shared.keys.get(csid)?;
        let remote_static = peer_keys.get(csid)?;

        let mut inner = Packet::new();
        inner.header.set("type", "open");
        inner.header.set("at", now_ms());
        inner.header.set("line", hex::encode(self.half.token()));
        inner.header.set("to", self.hashname.to_string());
        inner.header.set_object("from", self.shared.parts.to_header());

        let body = match self.half.seal_open(local_static, remote_static, inner) {
            Ok(body) => body,
            Err(e) => {
                warn!(peer = %self.hashname.short(), error = %e, "open seal failed");
                return None;
            }
        };
        Packet::handshake(csid, body).encode().ok()
    }

    /// Ask a relay to introduce us when we lack the peer's keys. Returns
    /// false when no relay path exists either.
    async fn request_introduction(&mut self) -> bool {
        let vias: Vec<Hashname> = self
            .peer
            .paths()
            .iter()
            .filter_map(|p| p.via().copied())
            .collect();
        if vias.is_empty() {
            return false;
        }
        for via in vias {
            crate::bridge::request_introduction_via(&self.shared, via, self.hashname);
        }
        self.sent_open = true;
        true
    }

    async fn on_handshake(&mut self, envelope: OpenEnvelope, from: Addr) -> bool {
        let at = envelope.inner.header.get_uint("at").unwrap_or(0);
        let declared: Option<Token> = envelope
            .inner
            .header
            .get_str("line")
            .and_then(|s| hex::decode(s).ok())
            .and_then(|b| b.try_into().ok());
        if declared != Some(cipherset::derive_token(&envelope.sender_ephemeral)) {
            self.shared.count_invalid_packet();
            trace!(peer = %self.hashname.short(), "open with mismatched token dropped");
            return false;
        }

        self.peer.mark_seen(&from);

        match self.state {
            LineState::Idle | LineState::Opening => {
                // Both sides of a dial race answer; tokens derive from
                // the ephemerals, so the two handshakes converge on the
                // same key pair and the smaller hashname's open simply
                // ends up answered rather than argued with.
                self.adopt(&envelope, at, &from).await;
                self.answer_open(&from).await;
                self.become_open(from).await;
            }
            LineState::Open | LineState::Rekeying => {
                if Some(envelope.sender_ephemeral) == self.remote_eph {
                    // Duplicate of the current open: only a peer still
                    // retrying on its backoff schedule moves `at` by a
                    // full step, and only those retries deserve a fresh
                    // answer. Echo-triggered duplicates sit milliseconds
                    // apart and are dropped here.
                    if at >= self.their_at + 900 {
                        self.their_at = at;
                        self.answer_open(&from).await;
                    }
                } else if at >= self.their_at {
                    debug!(peer = %self.hashname.short(), "rekey adopted from peer");
                    self.adopt(&envelope, at, &from).await;
                    self.answer_open(&from).await;
                    self.activate_current().await;
                    self.set_state(LineState::Open);
                } else {
                    trace!(peer = %self.hashname.short(), "stale open dropped");
                }
            }
            LineState::Closing | LineState::Closed => {}
        }
        false
    }

    async fn adopt(&mut self, envelope: &OpenEnvelope, at: u64, from: &Addr) {
        self.remote_eph = Some(envelope.sender_ephemeral);
        self.prev_keys = self.keys.take();
        self.keys = Some(self.half.derive(&envelope.sender_ephemeral));
        self.their_at = at;
        if from.socket_addr().is_some() {
            *self.handle.active_path.write().unwrap() = Some(from.clone());
        }
    }

    async fn answer_open(&mut self, from: &Addr) {
        if let Some(wire) = self.build_open() {
            if let Err(e) = self.shared.transport.write_message(&wire, from).await {
                trace!(peer = %self.hashname.short(), error = %e, "open answer failed");
            }
            self.sent_open = true;
        }
    }

    async fn become_open(&mut self, from: Addr) {
        self.activate_current().await;
        self.set_state(LineState::Open);
        self.established = Some(Instant::now());
        self.bytes_moved = 0;
        self.open_attempts = 0;
        self.next_open_at = None;
        self.send_failures = 0;

        // Remember the relay when the handshake did not come from a
        // known direct path of the peer, so token routes can be set up.
        if let Some(via) = self.detect_via(&from) {
            self.opened_via = Some(via);
            if let Some(keys) = &self.keys {
                crate::bridge::install_token_routes(
                    &self.shared,
                    via,
                    self.hashname,
                    keys.remote_token,
                    keys.local_token,
                );
            }
        }

        debug!(peer = %self.hashname.short(), "line open");
        for pending in self.pending_channels.drain(..).collect::<Vec<_>>() {
            let channel = self.create_channel(&pending.typ, pending.reliable);
            let _ = pending.reply.send(Ok(channel));
        }
    }

    /// A handshake that arrived from an address belonging to another
    /// peer's line points at the relay in the middle.
    fn detect_via(&self, _from: &Addr) -> Option<Hashname> {
        self.peer
            .paths()
            .iter()
            .filter_map(|p| p.via().copied())
            .next()
            .filter(|_| self.opened_via.is_none())
            .or(self.opened_via)
    }

    async fn activate_current(&mut self) {
        let Some(keys) = &self.keys else { return };
        let token = keys.local_token;
        if self.activated == Some(token) {
            return;
        }
        if let Some(old) = self.activated.take() {
            self.shared.ctrl.deactivate_line(old).await;
        }
        self.shared
            .ctrl
            .activate_line(token, self.handle.clone())
            .await;
        self.activated = Some(token);
    }

    /// Begin a locally initiated rekey: fresh ephemeral, fresh tokens,
    /// channels carry on.
    async fn start_rekey(&mut self) {
        let Some(remote_eph) = self.remote_eph else { return };
        self.set_state(LineState::Rekeying);
        debug!(peer = %self.hashname.short(), "rekeying line");
        self.half = LineHalf::generate();
        self.prev_keys = self.keys.take();
        self.keys = Some(self.half.derive(&remote_eph));
        self.activate_current().await;
        self.established = Some(Instant::now());
        self.bytes_moved = 0;
        if let Some(path) = self.handle.active_path() {
            self.answer_open(&path).await;
        }
        self.set_state(LineState::Open);
    }

    // ------------------------------------------------------------------
    // Line packets and channels
    // ------------------------------------------------------------------

    async fn on_line_packet(&mut self, pkt: Packet, from: Addr) -> bool {
        let Some(keys) = &self.keys else {
            self.shared.count_invalid_packet();
            return false;
        };
        let plain = match keys
            .decrypt(&pkt.body)
            .or_else(|e| match &self.prev_keys {
                Some(prev) => prev.decrypt(&pkt.body),
                None => Err(e),
            }) {
            Ok(plain) => plain,
            Err(_) => {
                // Authenticated decryption failed on an established
                // line: tear down, but the peer is not at fault for
                // certain (corruption or an attacker), so it is not
                // marked down.
                self.shared.count_invalid_packet();
                warn!(peer = %self.hashname.short(), "line packet failed authentication, closing");
                self.close("line closed", false).await;
                return true;
            }
        };
        self.bytes_moved += plain.len() as u64;
        self.peer.mark_seen(&from);

        let inner = match Packet::decode(&plain) {
            Ok(inner) => inner,
            Err(_) => {
                self.shared.count_invalid_packet();
                return false;
            }
        };
        let Some(channel_id) = inner.header.get_str("c").map(str::to_owned) else {
            self.shared.count_invalid_packet();
            return false;
        };

        if !self.channels.contains_key(&channel_id) {
            let Some(typ) = inner.header.get_str("type").map(str::to_owned) else {
                // Out-of-order first packet; the opener retransmits.
                trace!(channel = %channel_id, "packet for unknown channel dropped");
                return false;
            };
            let reliable = inner.header.get_uint("seq").is_some();
            if !self.accept_channel(&channel_id, &typ, reliable).await {
                let mut err = Packet::new();
                err.header.set("c", channel_id);
                err.header.set("err", "unknown type");
                self.send_channel_packets(vec![err]).await;
                return false;
            }
        }

        let outcome = match self.channels.get_mut(&channel_id) {
            Some(state) => state.receive(inner),
            None => return false,
        };
        self.apply_recv_outcome(&channel_id, outcome).await;
        self.reap_finished().await;
        false
    }

    async fn apply_recv_outcome(&mut self, channel_id: &str, outcome: RecvOutcome) {
        if let Some(reason) = &outcome.terminate {
            if let Some(state) = self.channels.get_mut(channel_id) {
                let errored_locally = reason == "overload";
                let _ = state
                    .user_tx()
                    .try_send(Err(Error::Closed(reason.clone())));
                if errored_locally {
                    let pkt = state.fail(reason);
                    self.send_channel_packets(vec![pkt]).await;
                }
            }
            return;
        }
        if let Some(state) = self.channels.get(channel_id) {
            for pkt in outcome.deliver {
                if state.user_tx().try_send(Ok(pkt)).is_err() {
                    trace!(channel = %channel_id, "delivery queue full, packet dropped");
                }
            }
        }
        let mut wire = outcome.send;
        if let Some(ack) = outcome.ack {
            wire.push(ack);
        }
        self.send_channel_packets(wire).await;
    }

    async fn on_channel_send(
        &mut self,
        id: ChannelId,
        pkt: Packet,
        reply: oneshot::Sender<Result<()>>,
    ) {
        match self.channels.get_mut(&id) {
            Some(state) => {
                if let Ok(packets) = state.send(pkt, false, Some(reply)) {
                    self.send_channel_packets(packets).await;
                }
            }
            None => {
                let _ = reply.send(Err(Error::Closed("channel closed".into())));
            }
        }
    }

    fn create_channel(&mut self, typ: &str, reliable: bool) -> Channel {
        let id = new_channel_id();
        let (user_tx, user_rx) = mpsc::channel(DELIVERY_QUEUE);
        self.channels.insert(
            id.clone(),
            ChannelState::new(id.clone(), typ.to_string(), reliable, user_tx),
        );
        Channel::new(
            id,
            typ.to_string(),
            reliable,
            self.hashname,
            self.cmd_tx.clone(),
            user_rx,
        )
    }

    /// Create state for a remotely opened channel and hand the accept
    /// half to the registered listener. False when no listener exists.
    async fn accept_channel(&mut self, id: &str, typ: &str, reliable: bool) -> bool {
        let Some(listener_tx) = self.shared.listener_for(typ) else {
            return false;
        };
        let (user_tx, user_rx) = mpsc::channel(DELIVERY_QUEUE);
        self.channels.insert(
            id.to_string(),
            ChannelState::new(id.to_string(), typ.to_string(), reliable, user_tx),
        );
        let channel = Channel::new(
            id.to_string(),
            typ.to_string(),
            reliable,
            self.hashname,
            self.cmd_tx.clone(),
            user_rx,
        );
        if listener_tx.try_send(channel).is_err() {
            self.channels.remove(id);
            return false;
        }
        true
    }

    async fn send_channel_packets(&mut self, packets: Vec<Packet>) {
        if packets.is_empty() {
            return;
        }
        let Some(keys) = self.keys.clone() else { return };
        let Some(path) = self.pick_path() else {
            self.send_failures += 1;
            return;
        };
        for pkt in packets {
            let Ok(inner) = pkt.encode() else { continue };
            self.bytes_moved += inner.len() as u64;
            let Ok(body) = keys.encrypt(&inner) else { continue };
            let mut outer = Packet::new();
            outer.header.set("type", "line");
            outer.header.set("line", hex::encode(keys.remote_token));
            outer.body = body;
            let Ok(wire) = outer.encode() else { continue };
            if let Err(e) = self.shared.transport.write_message(&wire, &path).await {
                trace!(peer = %self.hashname.short(), path = %path, error = %e, "line send failed");
                self.send_failures += 1;
                return;
            }
        }
        self.send_failures = 0;
    }

    fn pick_path(&self) -> Option<Addr> {
        if let Some(path) = self.handle.active_path() {
            return Some(path);
        }
        self.peer
            .paths()
            .into_iter()
            .find(|p| p.socket_addr().is_some())
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Returns true when the runner should exit.
    async fn on_tick(&mut self) -> bool {
        if self.state == LineState::Opening {
            if let Some(due) = self.next_open_at {
                if Instant::now() >= due {
                    if self.open_attempts >= self.shared.config.open_retries {
                        self.peer_down().await;
                        return true;
                    }
                    self.send_open().await;
                    if self.state == LineState::Closed {
                        return true;
                    }
                }
            }
            return false;
        }

        if self.state != LineState::Open {
            return false;
        }

        // Sustained send failure across every known path closes the
        // line and marks the peer down.
        if self.send_failures >= self.shared.config.open_retries {
            warn!(peer = %self.hashname.short(), "sustained send failure, closing line");
            self.close("line closed", true).await;
            return true;
        }

        let now = Instant::now();
        let mut to_send = Vec::new();
        let mut failed: Vec<(ChannelId, String)> = Vec::new();
        for (id, state) in self.channels.iter_mut() {
            let outcome = state.tick(now);
            to_send.extend(outcome.send);
            if let Some(reason) = outcome.terminate {
                failed.push((id.clone(), reason));
            }
        }
        for (id, reason) in failed {
            if let Some(state) = self.channels.get_mut(&id) {
                let _ = state.user_tx().try_send(Err(Error::Timeout(reason.clone())));
                let pkt = state.fail(&reason);
                to_send.push(pkt);
            }
        }
        self.send_channel_packets(to_send).await;
        self.reap_finished().await;

        let age = self.established.map(|t| t.elapsed()).unwrap_or_default();
        if age >= self.shared.config.rekey_after || self.bytes_moved >= self.shared.config.rekey_bytes
        {
            self.start_rekey().await;
        }
        false
    }

    async fn reap_finished(&mut self) {
        let finished: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, state)| state.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        for id in finished {
            trace!(channel = %id, "channel finished");
            self.channels.remove(&id);
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    async fn peer_down(&mut self) {
        debug!(peer = %self.hashname.short(), "open retry budget exhausted, peer down");
        self.peer.prune_unseen_paths();
        self.peer.set_down(true);
        self.fail_pending(Error::Timeout(format!(
            "no path to {} answered",
            self.hashname.short()
        )));
        self.unregister(true).await;
        self.set_state(LineState::Closed);
    }

    fn fail_pending(&mut self, err: Error) {
        for pending in self.pending_channels.drain(..) {
            let _ = pending.reply.send(Err(err.clone()));
        }
    }

    async fn close(&mut self, reason: &str, peer_down: bool) {
        if self.state == LineState::Closed {
            return;
        }
        self.set_state(LineState::Closing);

        // Best-effort shutdown notification on every live channel, then
        // unblock all readers.
        let mut notices = Vec::new();
        for (_, state) in self.channels.iter_mut() {
            if state.error().is_none() {
                notices.push(state.fail(reason));
            }
            let _ = state.user_tx().try_send(Err(Error::Closed(reason.to_string())));
        }
        self.send_channel_packets(notices).await;
        self.channels.clear();
        self.fail_pending(Error::Closed(reason.to_string()));

        self.unregister(peer_down).await;
        self.set_state(LineState::Closed);
        debug!(peer = %self.hashname.short(), reason, "line closed");
    }

    async fn unregister(&mut self, peer_down: bool) {
        if let Some(token) = self.activated.take() {
            self.shared.ctrl.deactivate_line(token).await;
        }
        self.shared
            .ctrl
            .unregister_line(self.hashname, peer_down)
            .await;
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
