//! # Channel Multiplexer
//!
//! Channels are typed sub-conversations multiplexed inside a line. Every
//! channel packet carries the `c` (channel id) header; the first packet
//! additionally carries `type`. An *unreliable* channel forwards packets
//! as-is. A *reliable* channel layers delivery state on top:
//!
//! | header | meaning |
//! |--------|---------|
//! | `seq`  | strictly increasing per sender, from 0 |
//! | `ack`  | highest contiguous seq received |
//! | `miss` | seqs above `ack` not yet received (selective NACK, ≤ 100) |
//! | `end`  | no further seqs will originate from this side |
//! | `err`  | terminal failure with diagnostic |
//!
//! Retransmit intervals come from an RTT estimator (initial 1 s, EWMA
//! α = 0.25, clamped to [100 ms, 10 s]). At most [`SEND_WINDOW`] packets
//! are outstanding; receive-side reordering buffers at most
//! [`REORDER_CAP`] packets before the channel dies with `err="overload"`.
//! Duplicate seqs refresh the ack state but are never redelivered.
//!
//! The state machines here are pure: the line runner owns them and does
//! all the I/O, which keeps them directly unit-testable.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use rand::RngCore;
use tokio::time::Instant;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::line::LineCmd;
use crate::packet::Packet;

/// Maximum outstanding (unacked) packets per reliable channel.
pub const SEND_WINDOW: usize = 100;

/// Maximum buffered out-of-order packets before `err="overload"`.
pub const REORDER_CAP: usize = 100;

/// Maximum entries in a `miss` list.
pub const MISS_CAP: usize = 100;

/// Transmission attempts per packet before the channel times out.
pub const MAX_SENDS: u32 = 8;

/// Channel id: 32 hex characters, unique within its line.
pub type ChannelId = String;

/// Mint a fresh random channel id.
pub fn new_channel_id() -> ChannelId {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Retransmit interval estimator: EWMA of observed ack delays.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_ms: f64,
}

impl RttEstimator {
    const ALPHA: f64 = 0.25;
    const INITIAL_MS: f64 = 1000.0;
    const MIN_MS: f64 = 100.0;
    const MAX_MS: f64 = 10_000.0;

    pub fn new() -> RttEstimator {
        RttEstimator {
            srtt_ms: Self::INITIAL_MS,
        }
    }

    pub fn observe(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        self.srtt_ms = self.srtt_ms * (1.0 - Self::ALPHA) + sample_ms * Self::ALPHA;
    }

    /// Current retransmit interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.srtt_ms.clamp(Self::MIN_MS, Self::MAX_MS) as u64)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

struct Outstanding {
    seq: u64,
    pkt: Packet,
    first_sent: Instant,
    last_sent: Instant,
    sends: u32,
}

/// Sender/receiver state for one reliable channel.
struct ReliableState {
    next_seq: u64,
    window: VecDeque<Outstanding>,
    /// Sends admitted while the window was full.
    backlog: VecDeque<(Packet, Option<oneshot::Sender<Result<()>>>)>,
    recv_next: u64,
    received_any: bool,
    reorder: BTreeMap<u64, Packet>,
    rtt: RttEstimator,
}

impl ReliableState {
    fn new() -> ReliableState {
        ReliableState {
            next_seq: 0,
            window: VecDeque::new(),
            backlog: VecDeque::new(),
            recv_next: 0,
            received_any: false,
            reorder: BTreeMap::new(),
            rtt: RttEstimator::new(),
        }
    }

    /// Highest contiguous seq received, once anything has arrived.
    fn ack_value(&self) -> Option<u64> {
        if self.received_any {
            Some(self.recv_next.saturating_sub(1))
        } else {
            None
        }
    }

    /// Gaps above the contiguous point, bounded by [`MISS_CAP`].
    fn miss_list(&self) -> Vec<u64> {
        let Some(&highest) = self.reorder.keys().next_back() else {
            return Vec::new();
        };
        let mut miss = Vec::new();
        for seq in self.recv_next..highest {
            if !self.reorder.contains_key(&seq) {
                miss.push(seq);
                if miss.len() >= MISS_CAP {
                    break;
                }
            }
        }
        miss
    }

    fn stamp_ack(&self, header: &mut crate::packet::Header) {
        if let Some(ack) = self.ack_value() {
            header.set("ack", ack);
        }
        let miss = self.miss_list();
        if !miss.is_empty() {
            header.set("miss", miss);
        }
    }
}

/// Result of admitting one inbound packet.
#[derive(Default)]
pub struct RecvOutcome {
    /// Packets now deliverable to the application, in order.
    pub deliver: Vec<Packet>,
    /// Standalone ack to transmit, if any.
    pub ack: Option<Packet>,
    /// Backlogged sends released by acks on this packet.
    pub send: Vec<Packet>,
    /// Terminal error raised by this packet (overload, remote err).
    pub terminate: Option<String>,
}

/// Result of one timer pass.
#[derive(Default)]
pub struct TickOutcome {
    /// Packets to (re)transmit.
    pub send: Vec<Packet>,
    /// Terminal error (retry budget exhausted).
    pub terminate: Option<String>,
}

/// Per-channel state owned by the line runner.
pub struct ChannelState {
    id: ChannelId,
    typ: String,
    reliable: bool,
    user_tx: mpsc::Sender<Result<Packet>>,
    rel: Option<ReliableState>,
    sent_type: bool,
    local_end: bool,
    remote_end: bool,
    errored: Option<String>,
}

impl ChannelState {
    pub fn new(
        id: ChannelId,
        typ: String,
        reliable: bool,
        user_tx: mpsc::Sender<Result<Packet>>,
    ) -> ChannelState {
        ChannelState {
            id,
            typ,
            reliable,
            user_tx,
            rel: if reliable { Some(ReliableState::new()) } else { None },
            sent_type: false,
            local_end: false,
            remote_end: false,
            errored: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn typ(&self) -> &str {
        &self.typ
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn user_tx(&self) -> &mpsc::Sender<Result<Packet>> {
        &self.user_tx
    }

    /// True once both directions have ended (or an error fired) and all
    /// reliable state has drained; the runner then drops the channel.
    pub fn is_finished(&self) -> bool {
        if self.errored.is_some() {
            return true;
        }
        let drained = self
            .rel
            .as_ref()
            .map(|r| r.window.is_empty() && r.backlog.is_empty())
            .unwrap_or(true);
        self.local_end && self.remote_end && drained
    }

    pub fn error(&self) -> Option<&str> {
        self.errored.as_deref()
    }

    /// Admit an outbound application packet. Returns wire-ready packets
    /// (possibly none when the send window is full; the packet is then
    /// queued and released by later acks).
    pub fn send(
        &mut self,
        mut pkt: Packet,
        end: bool,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<Vec<Packet>> {
        if let Some(err) = &self.errored {
            let e = Error::Closed(err.clone());
            if let Some(reply) = reply {
                let _ = reply.send(Err(e.clone()));
            }
            return Err(e);
        }
        if self.local_end {
            let e = Error::Closed("channel ended".into());
            if let Some(reply) = reply {
                let _ = reply.send(Err(e.clone()));
            }
            return Err(e);
        }

        self.stamp_common(&mut pkt);
        if end {
            pkt.header.set("end", true);
            self.local_end = true;
        }

        match &mut self.rel {
            None => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                Ok(vec![pkt])
            }
            Some(rel) => {
                if rel.window.len() + rel.backlog.len() >= SEND_WINDOW * 2 {
                    let e = Error::Timeout("send window exhausted".into());
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e.clone()));
                    }
                    return Err(e);
                }
                rel.backlog.push_back((pkt, reply));
                Ok(self.drain_backlog())
            }
        }
    }

    /// Close the sending side: emits an `end` packet unless one was
    /// already sent.
    pub fn close(&mut self) -> Result<Vec<Packet>> {
        if self.local_end || self.errored.is_some() {
            return Ok(Vec::new());
        }
        self.send(Packet::new(), true, None)
    }

    /// Build the terminal `err` packet and poison the channel. The
    /// caller transmits it best-effort and notifies the reader.
    pub fn fail(&mut self, reason: &str) -> Packet {
        self.errored = Some(reason.to_string());
        let mut pkt = Packet::new();
        pkt.header.set("c", self.id.clone());
        pkt.header.set("err", reason);
        pkt
    }

    /// Mark the channel failed without emitting anything (remote err).
    pub fn fail_silent(&mut self, reason: &str) {
        self.errored = Some(reason.to_string());
    }

    /// Admit one inbound channel packet.
    pub fn receive(&mut self, pkt: Packet) -> RecvOutcome {
        let mut outcome = RecvOutcome::default();

        if let Some(err) = pkt.header.get_str("err") {
            self.errored = Some(err.to_string());
            outcome.terminate = Some(err.to_string());
            return outcome;
        }
        if self.errored.is_some() {
            return outcome;
        }

        let mut remote_ended = false;
        let mut overflowed = false;
        {
            let Some(rel) = &mut self.rel else {
                if pkt.header.get_bool("end") == Some(true) {
                    self.remote_end = true;
                }
                if Self::has_payload(&pkt) {
                    outcome.deliver.push(pkt);
                }
                return outcome;
            };

            // Acks may ride on any packet, data or not.
            let ack = pkt.header.get_uint("ack");
            let miss = pkt.header.get_uint_list("miss").unwrap_or_default();
            if ack.is_some() || !miss.is_empty() {
                Self::apply_ack(rel, ack, &miss);
            }

            if let Some(seq) = pkt.header.get_uint("seq") {
                let duplicate = seq < rel.recv_next || rel.reorder.contains_key(&seq);
                if !duplicate {
                    rel.reorder.insert(seq, pkt);
                    if rel.reorder.len() > REORDER_CAP {
                        overflowed = true;
                    } else {
                        while let Some(next) = rel.reorder.remove(&rel.recv_next) {
                            rel.recv_next += 1;
                            rel.received_any = true;
                            if next.header.get_bool("end") == Some(true) {
                                remote_ended = true;
                            }
                            if Self::has_payload(&next) {
                                outcome.deliver.push(next);
                            }
                        }
                    }
                }
                if !overflowed {
                    // Every seq-bearing packet, duplicate or not, earns an
                    // ack so the sender can retire its window.
                    let mut ack_pkt = Packet::new();
                    ack_pkt.header.set("c", self.id.clone());
                    rel.stamp_ack(&mut ack_pkt.header);
                    outcome.ack = Some(ack_pkt);
                }
            }
        }

        if overflowed {
            let reason = "overload";
            self.errored = Some(reason.to_string());
            outcome.deliver.clear();
            outcome.terminate = Some(reason.to_string());
            return outcome;
        }
        if remote_ended {
            self.remote_end = true;
        }
        outcome.send = self.drain_backlog();
        outcome
    }

    /// Timer pass: retransmit overdue packets, release backlog, raise
    /// the retry-budget error.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if self.errored.is_some() {
            return outcome;
        }
        let Some(rel) = &mut self.rel else {
            return outcome;
        };

        let interval = rel.rtt.interval();
        let mut exhausted = false;
        let ack = rel.ack_value();
        let miss = rel.miss_list();
        for out in rel.window.iter_mut() {
            if now.duration_since(out.last_sent) < interval {
                continue;
            }
            if out.sends >= MAX_SENDS {
                exhausted = true;
                break;
            }
            let mut pkt = out.pkt.clone();
            if let Some(ack) = ack {
                pkt.header.set("ack", ack);
                if !miss.is_empty() {
                    pkt.header.set("miss", miss.clone());
                }
            }
            out.last_sent = now;
            out.sends += 1;
            outcome.send.push(pkt);
        }

        if exhausted {
            let reason = "timeout";
            self.errored = Some(reason.to_string());
            outcome.send.clear();
            outcome.terminate = Some(reason.to_string());
            return outcome;
        }

        outcome.send.extend(self.drain_backlog());
        outcome
    }

    /// Everything reaches the application except bare `end` markers;
    /// pure acks never carry a seq and so never get here.
    fn has_payload(pkt: &Packet) -> bool {
        !(pkt.header.get_bool("end") == Some(true) && pkt.body.is_empty())
    }

    fn stamp_common(&mut self, pkt: &mut Packet) {
        pkt.header.set("c", self.id.clone());
        if !self.sent_type {
            pkt.header.set("type", self.typ.clone());
            self.sent_type = true;
        }
    }

    /// Retire acked packets from the window. A seq is delivered when it
    /// is at or below the contiguous ack, or when it sits below the miss
    /// horizon without being listed as missing. Missed seqs stay in the
    /// window and go out again on the next timer pass.
    fn apply_ack(rel: &mut ReliableState, ack: Option<u64>, miss: &[u64]) {
        let horizon = miss.iter().copied().max();
        let mut sampled = false;
        let mut samples: Vec<Duration> = Vec::new();
        rel.window.retain(|out| {
            let delivered = ack.map(|a| out.seq <= a).unwrap_or(false)
                || match horizon {
                    Some(h) => out.seq < h && !miss.contains(&out.seq),
                    None => false,
                };
            if delivered && out.sends == 1 && !sampled {
                // Karn's rule: only unambiguous (single-send) samples.
                sampled = true;
                samples.push(out.first_sent.elapsed());
            }
            !delivered
        });
        for sample in samples {
            rel.rtt.observe(sample);
        }
    }

    fn drain_backlog(&mut self) -> Vec<Packet> {
        let Some(rel) = &mut self.rel else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        while rel.window.len() < SEND_WINDOW {
            let Some((mut pkt, reply)) = rel.backlog.pop_front() else {
                break;
            };
            let seq = rel.next_seq;
            rel.next_seq += 1;
            pkt.header.set("seq", seq);
            rel.stamp_ack(&mut pkt.header);
            let now = Instant::now();
            rel.window.push_back(Outstanding {
                seq,
                pkt: pkt.clone(),
                first_sent: now,
                last_sent: now,
                sends: 1,
            });
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            ready.push(pkt);
        }
        ready
    }
}

// ============================================================================
// User-facing handles
// ============================================================================

/// Application handle to one channel.
///
/// Reads block on the per-channel delivery queue; writes round-trip
/// through the owning line runner so all channel state stays on one
/// task.
pub struct Channel {
    id: ChannelId,
    typ: String,
    reliable: bool,
    remote: crate::hashname::Hashname,
    line_tx: mpsc::Sender<LineCmd>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Result<Packet>>>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        typ: String,
        reliable: bool,
        remote: crate::hashname::Hashname,
        line_tx: mpsc::Sender<LineCmd>,
        incoming: mpsc::Receiver<Result<Packet>>,
    ) -> Channel {
        Channel {
            id,
            typ,
            reliable,
            remote,
            line_tx,
            incoming: tokio::sync::Mutex::new(incoming),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn typ(&self) -> &str {
        &self.typ
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    /// The hashname on the other end of this channel's line.
    pub fn hashname(&self) -> crate::hashname::Hashname {
        self.remote
    }

    /// Next in-order packet from the peer.
    pub async fn read_packet(&self) -> Result<Packet> {
        let mut rx = self.incoming.lock().await;
        match rx.recv().await {
            Some(result) => result,
            None => Err(Error::Closed("channel closed".into())),
        }
    }

    /// Send one packet to the peer.
    pub async fn write_packet(&self, pkt: Packet) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.line_tx
            .send(LineCmd::ChannelSend {
                id: self.id.clone(),
                pkt,
                reply: tx,
            })
            .await
            .map_err(|_| Error::Closed("line closed".into()))?;
        rx.await.map_err(|_| Error::Closed("line closed".into()))?
    }

    /// End the sending side of the channel.
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.line_tx
            .send(LineCmd::ChannelClose {
                id: self.id.clone(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::Closed("line closed".into()))?;
        rx.await.map_err(|_| Error::Closed("line closed".into()))?
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("type", &self.typ)
            .field("reliable", &self.reliable)
            .finish()
    }
}

/// Accept queue for channels of one registered type.
pub struct Listener {
    typ: String,
    rx: tokio::sync::Mutex<mpsc::Receiver<Channel>>,
}

impl Listener {
    pub(crate) fn new(typ: String, rx: mpsc::Receiver<Channel>) -> Listener {
        Listener {
            typ,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    pub fn typ(&self) -> &str {
        &self.typ
    }

    /// Wait for the next inbound channel of this type.
    pub async fn accept(&self) -> Result<Channel> {
        let mut rx = self.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| Error::Closed("switch closed".into()))
    }
}
