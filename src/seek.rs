//! # Seek
//!
//! DHT-style neighbor discovery over `seek` channels. A seek request
//! names a hashname; the answer is a `see` list of the closest known
//! peers by XOR distance, each entry `csid,hashname,host,port`. The
//! seeking side merges every answer into its peer table — with a
//! `peer:<responder>` relay path, so introduced peers are dialable even
//! before their keys are learned — and iterates toward the target.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::hashname::Hashname;
use crate::packet::Packet;
use crate::peers::{Peer, PeerAddr};
use crate::switch::SwitchShared;
use crate::transport::Addr;

/// Peers returned per seek answer.
const SEE_WIDTH: usize = 9;

/// Peers queried per seek round.
const QUERY_WIDTH: usize = 3;

/// Iterative deepening bound.
const MAX_ROUNDS: usize = 3;

/// Per-query answer deadline.
const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Register the `seek` listener and its accept loop.
pub(crate) fn serve(shared: &Arc<SwitchShared>) {
    let listener = shared.register_listener("seek");
    let shared = Arc::clone(shared);
    shared.clone().track_task(tokio::spawn(async move {
        while let Ok(channel) = listener.accept().await {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                if let Err(e) = answer(&shared, channel).await {
                    trace!(error = %e, "seek answer failed");
                }
            });
        }
    }));
}

/// Serve one inbound seek request.
async fn answer(shared: &Arc<SwitchShared>, channel: crate::channel::Channel) -> Result<()> {
    let pkt = channel.read_packet().await?;
    let target: Hashname = pkt
        .header
        .get_str("seek")
        .ok_or_else(|| Error::InvalidPacket("seek without target".into()))?
        .parse()?;

    let mut see = Vec::new();
    for peer in shared.ctrl.closest_peers(target, SEE_WIDTH).await {
        if let Some(entry) = see_entry(&peer) {
            see.push(entry);
        }
    }
    debug!(target = %target.short(), entries = see.len(), "answering seek");

    let mut reply = Packet::new();
    reply.header.set("see", see);
    reply.header.set("end", true);
    channel.write_packet(reply).await?;
    let _ = channel.close().await;
    Ok(())
}

/// `csid,hashname,host,port` for a peer with keys and a direct path.
fn see_entry(peer: &Arc<Peer>) -> Option<String> {
    let keys = peer.keys()?;
    let csid = keys.iter().map(|(c, _)| *c).max()?;
    let addr = peer
        .paths()
        .into_iter()
        .find_map(|p| p.socket_addr())?;
    Some(format!(
        "{},{},{},{}",
        hex::encode([csid]),
        peer.hashname(),
        addr.ip(),
        addr.port()
    ))
}

/// Iteratively seek `target`, merging answers into the peer table.
/// Returns the closest known peers afterwards.
pub(crate) async fn seek(shared: &Arc<SwitchShared>, target: Hashname) -> Result<Vec<Arc<Peer>>> {
    let mut queried: HashSet<Hashname> = HashSet::new();
    queried.insert(shared.hashname);

    for round in 0..MAX_ROUNDS {
        let candidates: Vec<Hashname> = shared
            .ctrl
            .closest_peers(target, SEE_WIDTH)
            .await
            .into_iter()
            .map(|p| p.hashname())
            .filter(|h| !queried.contains(h) && *h != target)
            .take(QUERY_WIDTH)
            .collect();
        if candidates.is_empty() {
            break;
        }

        let mut learned_any = false;
        for via in candidates {
            queried.insert(via);
            match query(shared, via, target).await {
                Ok(count) if count > 0 => learned_any = true,
                Ok(_) => {}
                Err(e) => trace!(via = %via.short(), error = %e, "seek query failed"),
            }
        }
        trace!(target = %target.short(), round, learned = learned_any, "seek round");
        if !learned_any {
            break;
        }
    }

    Ok(shared.ctrl.closest_peers(target, SEE_WIDTH).await)
}

/// Launch a background seek, used when discovery is configured to
/// populate neighbors for every new peer.
pub(crate) fn spawn_seek(shared: &Arc<SwitchShared>, target: Hashname) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        if let Err(e) = seek(&shared, target).await {
            trace!(target = %target.short(), error = %e, "background seek failed");
        }
    });
}

/// One seek query against `via`; returns how many new peers it taught
/// us.
async fn query(shared: &Arc<SwitchShared>, via: Hashname, target: Hashname) -> Result<usize> {
    let line = shared
        .ctrl
        .get_line(via, None, None)
        .await
        .ok_or_else(|| Error::UnknownPeer(via.short()))?;
    let channel = line.open_channel("seek", false).await?;

    let mut request = Packet::new();
    request.header.set("seek", target.to_string());
    channel.write_packet(request).await?;

    let reply = tokio::time::timeout(QUERY_TIMEOUT, channel.read_packet())
        .await
        .map_err(|_| Error::Timeout(format!("seek to {}", via.short())))??;
    let _ = channel.close().await;

    let mut learned = 0;
    for entry in reply.header.get_str_list("see").unwrap_or_default() {
        let Some((hashname, path)) = parse_see_entry(&entry) else {
            continue;
        };
        if hashname == shared.hashname {
            continue;
        }
        let addr = PeerAddr::new(hashname)
            .with_path(path)
            .with_path(Addr::Peer(via));
        if let Some((_, discovered)) = shared.ctrl.add_peer(addr).await {
            if discovered {
                learned += 1;
            }
        }
    }
    Ok(learned)
}

fn parse_see_entry(entry: &str) -> Option<(Hashname, Addr)> {
    let mut fields = entry.splitn(4, ',');
    let _csid = fields.next()?;
    let hashname: Hashname = fields.next()?.parse().ok()?;
    let host = fields.next()?;
    let port: u16 = fields.next()?.parse().ok()?;
    let addr: Addr = format!("udp4:{host}:{port}").parse().ok().or_else(|| {
        format!("udp6:[{host}]:{port}").parse().ok()
    })?;
    Some((hashname, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn see_entries_parse() {
        let h = Hashname::from_bytes([9u8; 32]);
        let entry = format!("3a,{h},10.1.2.3,4242");
        let (parsed, addr) = parse_see_entry(&entry).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(addr.to_string(), "udp4:10.1.2.3:4242");
    }

    #[test]
    fn see_entries_parse_v6() {
        let h = Hashname::from_bytes([9u8; 32]);
        let entry = format!("3a,{h},::1,4242");
        let (_, addr) = parse_see_entry(&entry).unwrap();
        assert_eq!(addr.to_string(), "udp6:[::1]:4242");
    }

    #[test]
    fn malformed_see_entries_rejected() {
        assert!(parse_see_entry("").is_none());
        assert!(parse_see_entry("3a,nothex,1.2.3.4,1").is_none());
        assert!(parse_see_entry("3a,onlythree,1.2.3.4").is_none());
    }
}
