//! End-to-end channel delivery tests over the in-process mesh: the
//! two-node ping/pong exchange, reliable delivery under injected loss,
//! and channel failure when the link goes fully dark.

use std::sync::Arc;
use std::time::Duration;

use hashline::transport::inproc;
use hashline::{Packet, Switch, SwitchConfig};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(120);

async fn open_switch(net: &Arc<inproc::Network>) -> Switch {
    let transport = Arc::new(net.endpoint());
    Switch::open(SwitchConfig::default(), transport)
        .await
        .expect("switch open failed")
}

async fn connected_pair(net: &Arc<inproc::Network>) -> (Switch, Switch) {
    let a = open_switch(net).await;
    let b = open_switch(net).await;
    a.add_peer(b.local_peer_addr()).await.expect("add_peer failed");
    (a, b)
}

#[tokio::test(start_paused = true)]
async fn two_node_ping_pong() {
    let net = inproc::Network::new();
    let (a, b) = connected_pair(&net).await;
    let listener = b.listen("ping");

    // Echo side: first packet says how many rounds to serve.
    let echo = tokio::spawn(async move {
        let ch = listener.accept().await.expect("accept failed");
        let mut remaining = 1i64;
        let mut first = true;
        while remaining > 0 {
            let pkt = ch.read_packet().await.expect("ping read failed");
            if first {
                remaining = pkt.header.get_int("n").unwrap_or(1);
                first = false;
            }
            remaining -= 1;
            ch.write_packet(Packet::new()).await.expect("pong write failed");
        }
        ch.close().await.expect("echo close failed");
    });

    let ch = timeout(TEST_TIMEOUT, a.open_channel(b.hashname(), "ping", true))
        .await
        .expect("open timed out")
        .expect("open failed");

    for n in (1..=10i64).rev() {
        let mut pkt = Packet::new();
        pkt.header.set("n", n);
        timeout(TEST_TIMEOUT, ch.write_packet(pkt))
            .await
            .expect("write timed out")
            .expect("write failed");

        let pong = timeout(TEST_TIMEOUT, ch.read_packet())
            .await
            .expect("pong timed out")
            .expect("pong read failed");
        assert!(pong.body.is_empty());
    }

    ch.close().await.expect("close failed");
    timeout(TEST_TIMEOUT, echo).await.expect("echo task hung").unwrap();

    a.close().await.unwrap();
    b.close().await.unwrap();
    assert_eq!(a.stats().num_open_lines, 0);
    assert_eq!(b.stats().num_open_lines, 0);
}

#[tokio::test(start_paused = true)]
async fn reliable_channel_survives_packet_loss() {
    const ROUNDS: u64 = 40;

    let net = inproc::Network::new();
    let (a, b) = connected_pair(&net).await;
    let listener = b.listen("count");

    let sink = tokio::spawn(async move {
        let ch = listener.accept().await.expect("accept failed");
        let mut received = Vec::new();
        for _ in 0..ROUNDS {
            let pkt = ch.read_packet().await.expect("read failed");
            received.push(pkt.header.get_uint("k").expect("k header missing"));
        }
        received
    });

    let ch = timeout(TEST_TIMEOUT, a.open_channel(b.hashname(), "count", true))
        .await
        .expect("open timed out")
        .expect("open failed");

    // Lossy from here on; the handshake above ran clean.
    net.set_loss(30);
    for k in 0..ROUNDS {
        let mut pkt = Packet::new();
        pkt.header.set("k", k);
        timeout(TEST_TIMEOUT, ch.write_packet(pkt))
            .await
            .expect("write timed out")
            .expect("write failed");
    }

    let received = timeout(TEST_TIMEOUT, sink)
        .await
        .expect("sink timed out")
        .unwrap();
    // Exactly once, in order, despite the loss.
    assert_eq!(received, (0..ROUNDS).collect::<Vec<_>>());

    net.set_loss(0);
    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dead_link_times_the_channel_out() {
    let net = inproc::Network::new();
    let (a, b) = connected_pair(&net).await;
    let listener = b.listen("void");

    let ch = timeout(TEST_TIMEOUT, a.open_channel(b.hashname(), "void", true))
        .await
        .expect("open timed out")
        .expect("open failed");
    let accepted = timeout(TEST_TIMEOUT, async {
        // Make sure the channel exists on both sides before the link dies.
        let mut probe = Packet::new();
        probe.header.set("k", 0u64);
        ch.write_packet(probe).await.unwrap();
        listener.accept().await
    })
    .await
    .expect("accept timed out")
    .expect("accept failed");

    net.set_loss(100);
    let mut pkt = Packet::new();
    pkt.header.set("k", 1u64);
    let _ = ch.write_packet(pkt).await;

    // The sender exhausts its retry budget and surfaces the failure on
    // the next read.
    let err = timeout(TEST_TIMEOUT, ch.read_packet())
        .await
        .expect("read should resolve within the retry budget")
        .expect_err("channel should fail on a dead link");
    let text = err.to_string();
    assert!(text.contains("timeout") || text.contains("closed"), "got {text}");

    drop(accepted);
    net.set_loss(0);
    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn rekey_preserves_channel_traffic() {
    let net = inproc::Network::new();
    let config = SwitchConfig {
        rekey_after: Duration::from_secs(2),
        ..SwitchConfig::default()
    };
    let a = Switch::open(config, Arc::new(net.endpoint())).await.unwrap();
    let b = Switch::open(SwitchConfig::default(), Arc::new(net.endpoint()))
        .await
        .unwrap();
    let listener = b.listen("echo");
    a.add_peer(b.local_peer_addr()).await.unwrap();

    let echo = tokio::spawn(async move {
        let ch = listener.accept().await.expect("accept failed");
        while let Ok(pkt) = ch.read_packet().await {
            if ch.write_packet(pkt).await.is_err() {
                break;
            }
        }
    });

    let ch = timeout(TEST_TIMEOUT, a.open_channel(b.hashname(), "echo", true))
        .await
        .unwrap()
        .unwrap();

    for round in 0..4u64 {
        let mut pkt = Packet::with_body(vec![round as u8]);
        pkt.header.set("round", round);
        timeout(TEST_TIMEOUT, ch.write_packet(pkt))
            .await
            .expect("write timed out")
            .expect("write failed");
        let back = timeout(TEST_TIMEOUT, ch.read_packet())
            .await
            .expect("echo timed out")
            .expect("echo read failed");
        assert_eq!(back.body, vec![round as u8]);

        // Cross at least one rekey boundary between rounds.
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
    }

    let _ = ch.close().await;
    a.close().await.unwrap();
    b.close().await.unwrap();
    drop(echo);
}

#[tokio::test(start_paused = true)]
async fn unreliable_channels_pass_packets_through() {
    let net = inproc::Network::new();
    let (a, b) = connected_pair(&net).await;
    let listener = b.listen("blast");

    let ch = timeout(TEST_TIMEOUT, a.open_channel(b.hashname(), "blast", false))
        .await
        .expect("open timed out")
        .expect("open failed");

    for k in 0..5u64 {
        let mut pkt = Packet::with_body(vec![k as u8]);
        pkt.header.set("k", k);
        ch.write_packet(pkt).await.expect("write failed");
    }

    let accepted = timeout(TEST_TIMEOUT, listener.accept())
        .await
        .expect("accept timed out")
        .expect("accept failed");
    assert!(!accepted.is_reliable());
    let first = timeout(TEST_TIMEOUT, accepted.read_packet())
        .await
        .expect("read timed out")
        .expect("read failed");
    assert!(first.header.get_uint("k").is_some());
    assert!(first.header.get_uint("seq").is_none());

    a.close().await.unwrap();
    b.close().await.unwrap();
}
