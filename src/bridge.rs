//! # Bridge
//!
//! Relay routing for peers that cannot reach each other directly. A
//! `peer:<via>` path on a peer record means handshakes travel through
//! the via endpoint instead of a socket:
//!
//! ```text
//!   A ── peer channel {"peer": B} ──► R ── raw open ──► B
//!   A ◄─────── raw open (forwarded by handshake route) ◄── B
//! ```
//!
//! The via learns two kinds of routes:
//!
//! - **Handshake routes** map a source address to the opposite side of a
//!   forwarded open, so answers (which the via cannot decrypt) flow back
//!   for a short window.
//! - **Token routes**, installed by a `bridge` channel request after the
//!   line opens, map the 16-byte line tokens of the bridged session to
//!   the endpoint hashnames. Line packets whose token is not in the
//!   via's own active index are forwarded verbatim.
//!
//! A `peer` request whose body is a `key` packet instead of an open is
//! an introduction: the via relays the requester's key and observed
//! paths to the target on a `connect` channel, and the target dials
//! back. That covers dialing a peer whose keys are not yet known.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::cipherset::{Parts, Token};
use crate::error::{Error, Result};
use crate::hashname::Hashname;
use crate::packet::Packet;
use crate::peers::PeerAddr;
use crate::switch::SwitchShared;
use crate::transport::Addr;

/// Bound on installed token routes.
const MAX_TOKEN_ROUTES: usize = 4096;

/// Handshake routes expire this long after their last use.
const HANDSHAKE_ROUTE_TTL: Duration = Duration::from_secs(60);

/// Per-switch relay routing state, read on the packet hot path.
pub(crate) struct BridgeTable {
    token_routes: StdRwLock<HashMap<Token, Hashname>>,
    handshake_routes: StdRwLock<HashMap<Addr, (Addr, Instant)>>,
}

impl BridgeTable {
    pub(crate) fn new() -> BridgeTable {
        BridgeTable {
            token_routes: StdRwLock::new(HashMap::new()),
            handshake_routes: StdRwLock::new(HashMap::new()),
        }
    }

    fn install_token(&self, token: Token, target: Hashname) -> bool {
        let mut routes = self.token_routes.write().unwrap();
        if routes.len() >= MAX_TOKEN_ROUTES && !routes.contains_key(&token) {
            warn!(limit = MAX_TOKEN_ROUTES, "token route table full, request refused");
            return false;
        }
        routes.insert(token, target);
        true
    }

    fn token_target(&self, token: &Token) -> Option<Hashname> {
        self.token_routes.read().unwrap().get(token).copied()
    }

    fn install_handshake(&self, from: Addr, to: Addr) {
        let mut routes = self.handshake_routes.write().unwrap();
        let now = Instant::now();
        routes.retain(|_, (_, used)| now.duration_since(*used) < HANDSHAKE_ROUTE_TTL);
        routes.insert(from, (to, now));
    }

    fn handshake_target(&self, from: &Addr) -> Option<Addr> {
        let mut routes = self.handshake_routes.write().unwrap();
        let (to, used) = routes.get_mut(from)?;
        if used.elapsed() >= HANDSHAKE_ROUTE_TTL {
            return None;
        }
        *used = Instant::now();
        Some(to.clone())
    }
}

/// Register the relay listeners and their accept loops.
pub(crate) fn serve(shared: &Arc<SwitchShared>) {
    let peer_listener = shared.register_listener("peer");
    let bridge_listener = shared.register_listener("bridge");
    let connect_listener = shared.register_listener("connect");

    {
        let shared = Arc::clone(shared);
        shared.clone().track_task(tokio::spawn(async move {
            while let Ok(channel) = peer_listener.accept().await {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = handle_peer_channel(&shared, channel).await {
                        trace!(error = %e, "peer channel failed");
                    }
                });
            }
        }));
    }
    {
        let shared = Arc::clone(shared);
        shared.clone().track_task(tokio::spawn(async move {
            while let Ok(channel) = bridge_listener.accept().await {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = handle_bridge_channel(&shared, channel).await {
                        trace!(error = %e, "bridge channel failed");
                    }
                });
            }
        }));
    }
    {
        let shared = Arc::clone(shared);
        shared.clone().track_task(tokio::spawn(async move {
            while let Ok(channel) = connect_listener.accept().await {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = handle_connect_channel(&shared, channel).await {
                        trace!(error = %e, "connect channel failed");
                    }
                });
            }
        }));
    }
}

/// Serve one `peer` request: forward a sealed open, or relay an
/// introduction when the body is a key packet.
async fn handle_peer_channel(shared: &Arc<SwitchShared>, channel: crate::channel::Channel) -> Result<()> {
    let pkt = channel.read_packet().await?;
    let target: Hashname = pkt
        .header
        .get_str("peer")
        .ok_or_else(|| Error::InvalidPacket("peer request without target".into()))?
        .parse()?;
    let requester = channel.hashname();
    let _ = channel.close().await;

    let requester_line = shared.ctrl.get_line(requester, None, None).await;
    let target_line = shared
        .ctrl
        .get_line(target, None, None)
        .await
        .ok_or_else(|| Error::UnknownPeer(target.short()))?;
    let Some(target_path) = target_line.active_path() else {
        return Err(Error::UnknownPeer(format!("{} has no active path", target.short())));
    };

    let inner = Packet::decode(&pkt.body)?;
    if inner.csid.is_some() {
        // A sealed open we cannot read: pass it along verbatim and keep
        // a return route for the answer.
        shared
            .transport
            .write_message(&pkt.body, &target_path)
            .await
            .map_err(|e| Error::Closed(format!("relay send failed: {e}")))?;
        if let Some(requester_path) = requester_line.and_then(|l| l.active_path()) {
            shared
                .bridge
                .install_handshake(target_path.clone(), requester_path.clone());
            shared.bridge.install_handshake(requester_path, target_path);
        }
        debug!(
            requester = %requester.short(),
            target = %target.short(),
            "relayed open"
        );
    } else {
        // Introduction: hand the requester's key packet to the target
        // over a connect channel, adding the path we observe.
        let mut intro = inner;
        if let Some(requester_path) = requester_line.and_then(|l| l.active_path()) {
            let mut paths = intro
                .header
                .get_str_list("paths")
                .unwrap_or_default();
            let observed = requester_path.to_string();
            if !paths.contains(&observed) {
                paths.push(observed);
            }
            intro.header.set("paths", paths);
        }
        let connect = target_line.open_channel("connect", false).await?;
        connect.write_packet(intro).await?;
        let _ = connect.close().await;
        debug!(
            requester = %requester.short(),
            target = %target.short(),
            "relayed introduction"
        );
    }
    Ok(())
}

/// Serve one `bridge` request: install token routes for a session
/// relayed through us.
async fn handle_bridge_channel(shared: &Arc<SwitchShared>, channel: crate::channel::Channel) -> Result<()> {
    let pkt = channel.read_packet().await?;
    let requester = channel.hashname();
    let _ = channel.close().await;

    let target: Hashname = pkt
        .header
        .get_str("peer")
        .ok_or_else(|| Error::InvalidPacket("bridge request without peer".into()))?
        .parse()?;
    let to_token = parse_token(pkt.header.get_str("to"))?;
    let back_token = parse_token(pkt.header.get_str("back"))?;

    if !shared.bridge.install_token(to_token, target) {
        return Err(Error::Closed("token route table full".into()));
    }
    shared.bridge.install_token(back_token, requester);
    debug!(
        requester = %requester.short(),
        target = %target.short(),
        "token routes installed"
    );
    Ok(())
}

/// Serve one `connect` channel: adopt the introduced peer and let
/// discovery dial it back.
async fn handle_connect_channel(shared: &Arc<SwitchShared>, channel: crate::channel::Channel) -> Result<()> {
    let pkt = channel.read_packet().await?;
    let via = channel.hashname();
    let _ = channel.close().await;

    if pkt.header.get_str("type") != Some("key") {
        return Err(Error::InvalidPacket("connect without key packet".into()));
    }
    let Some(parts_obj) = pkt.header.get_object("from") else {
        return Err(Error::InvalidParts("connect without parts".into()));
    };
    let parts = Parts::from_header(parts_obj)?;
    let hashname = Hashname::from_parts(&parts)?;
    let csid = pkt
        .header
        .get_str("cs")
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or_else(|| Error::InvalidKeys("connect without csid".into()))?;
    let key = crate::cipherset::Key::from_public(pkt.body.clone());
    if parts.get(csid) != Some(&key.fingerprint()) {
        return Err(Error::InvalidParts("connect key does not match parts".into()));
    }

    let mut keys = crate::cipherset::Keys::new();
    keys.insert(csid, key);
    let mut addr = PeerAddr::new(hashname).with_keys(keys);
    for path in pkt.header.get_str_list("paths").unwrap_or_default() {
        if let Ok(parsed) = path.parse::<Addr>() {
            addr = addr.with_path(parsed);
        }
    }
    addr = addr.with_path(Addr::Peer(via));
    debug!(peer = %hashname.short(), via = %via.short(), "introduced peer");
    shared.ctrl.add_peer(addr).await;
    Ok(())
}

/// Forward a sealed open for `target` through `via`. Fire-and-forget;
/// the line's retry schedule covers losses.
pub(crate) fn forward_open_via(
    shared: &Arc<SwitchShared>,
    via: Hashname,
    target: Hashname,
    wire: Vec<u8>,
) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let Some(line) = shared.ctrl.get_line(via, None, None).await else {
            trace!(via = %via.short(), "no line to relay");
            return;
        };
        let result = async {
            let channel = line.open_channel("peer", false).await?;
            let mut pkt = Packet::with_body(wire);
            pkt.header.set("peer", target.to_string());
            channel.write_packet(pkt).await?;
            channel.close().await
        }
        .await;
        if let Err(e) = result {
            trace!(via = %via.short(), error = %e, "open relay failed");
        }
    });
}

/// Ask `via` to introduce us to `target` (we lack the target's keys).
pub(crate) fn request_introduction_via(shared: &Arc<SwitchShared>, via: Hashname, target: Hashname) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let Some(csid) = shared.keys.public_keys().iter().map(|(c, _)| *c).max() else {
            return;
        };
        let Some(key) = shared.keys.get(csid) else { return };

        let mut intro = Packet::with_body(key.public().to_vec());
        intro.header.set("type", "key");
        intro.header.set("cs", hex::encode([csid]));
        intro.header.set_object("from", shared.parts.to_header());
        let paths: Vec<String> = shared
            .transport
            .local_addresses()
            .iter()
            .map(|a| a.to_string())
            .collect();
        intro.header.set("paths", paths);

        let Ok(body) = intro.encode() else { return };
        let Some(line) = shared.ctrl.get_line(via, None, None).await else {
            return;
        };
        let result = async {
            let channel = line.open_channel("peer", false).await?;
            let mut pkt = Packet::with_body(body);
            pkt.header.set("peer", target.to_string());
            channel.write_packet(pkt).await?;
            channel.close().await
        }
        .await;
        if let Err(e) = result {
            trace!(via = %via.short(), error = %e, "introduction request failed");
        }
    });
}

/// After opening a line through `via`, ask it to route both session
/// tokens so line packets flow.
pub(crate) fn install_token_routes(
    shared: &Arc<SwitchShared>,
    via: Hashname,
    target: Hashname,
    out_token: Token,
    back_token: Token,
) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let Some(line) = shared.ctrl.get_line(via, None, None).await else {
            return;
        };
        let result = async {
            let channel = line.open_channel("bridge", false).await?;
            let mut pkt = Packet::new();
            pkt.header.set("peer", target.to_string());
            pkt.header.set("to", hex::encode(out_token));
            pkt.header.set("back", hex::encode(back_token));
            channel.write_packet(pkt).await?;
            channel.close().await
        }
        .await;
        match result {
            Ok(()) => debug!(via = %via.short(), target = %target.short(), "requested token routes"),
            Err(e) => trace!(via = %via.short(), error = %e, "bridge request failed"),
        }
    });
}

/// Forward a line packet by token route. True when routed.
pub(crate) async fn route_line_packet(shared: &Arc<SwitchShared>, token: Token, raw: &[u8]) -> bool {
    let Some(target) = shared.bridge.token_target(&token) else {
        return false;
    };
    let Some(line) = shared.ctrl.get_line(target, None, None).await else {
        return false;
    };
    let Some(path) = line.active_path() else {
        return false;
    };
    match shared.transport.write_message(raw, &path).await {
        Ok(()) => {
            trace!(target = %target.short(), "line packet bridged");
            true
        }
        Err(e) => {
            trace!(target = %target.short(), error = %e, "bridge forward failed");
            false
        }
    }
}

/// Forward a handshake we cannot decrypt along a recorded route. True
/// when routed.
pub(crate) async fn route_handshake(shared: &Arc<SwitchShared>, raw: &[u8], from: &Addr) -> bool {
    let Some(to) = shared.bridge.handshake_target(from) else {
        return false;
    };
    match shared.transport.write_message(raw, &to).await {
        Ok(()) => {
            trace!(from = %from, to = %to, "handshake bridged");
            true
        }
        Err(e) => {
            trace!(error = %e, "handshake bridge failed");
            false
        }
    }
}

fn parse_token(value: Option<&str>) -> Result<Token> {
    value
        .and_then(|s| hex::decode(s).ok())
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::InvalidPacket("malformed token".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashname(seed: u8) -> Hashname {
        Hashname::from_bytes([seed; 32])
    }

    #[test]
    fn token_routes_install_and_resolve() {
        let table = BridgeTable::new();
        let token = [7u8; 16];
        assert!(table.token_target(&token).is_none());
        assert!(table.install_token(token, hashname(1)));
        assert_eq!(table.token_target(&token), Some(hashname(1)));
    }

    #[test]
    fn handshake_routes_expire() {
        let table = BridgeTable::new();
        let a: Addr = "udp4:10.0.0.1:1".parse().unwrap();
        let b: Addr = "udp4:10.0.0.2:2".parse().unwrap();
        table.install_handshake(a.clone(), b.clone());
        assert_eq!(table.handshake_target(&a), Some(b.clone()));
        assert!(table.handshake_target(&b).is_none());
    }

    #[test]
    fn token_parse_rejects_garbage() {
        assert!(parse_token(None).is_err());
        assert!(parse_token(Some("zz")).is_err());
        assert!(parse_token(Some("abcd")).is_err());
        assert!(parse_token(Some(&"ab".repeat(16))).is_ok());
    }
}
