//! Integration tests for the Switch public API.
//!
//! These tests exercise the public interface exposed through the Switch
//! facade over the in-process transport, validating identity handling,
//! dial behavior, statistics, and shutdown semantics.

use std::sync::Arc;
use std::time::Duration;

use hashline::transport::inproc;
use hashline::{
    Error, Hashname, Key, Keys, Packet, PeerAddr, PrivateKeys, Switch, SwitchConfig, CSID_3A,
};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

async fn open_switch(net: &Arc<inproc::Network>) -> Switch {
    let transport = Arc::new(net.endpoint());
    Switch::open(SwitchConfig::default(), transport)
        .await
        .expect("switch open failed")
}

/// Teach `a` about `b` so a dial can proceed.
async fn introduce(a: &Switch, b: &Switch) {
    a.add_peer(b.local_peer_addr()).await.expect("add_peer failed");
}

#[tokio::test(start_paused = true)]
async fn switch_identity_is_self_certifying() {
    let net = inproc::Network::new();
    let switch = open_switch(&net).await;

    let hashname = switch.hashname();
    assert_eq!(hashname.to_string().len(), 64);

    // The hashname must re-derive from the advertised parts.
    let derived = Hashname::from_parts(&switch.parts()).unwrap();
    assert_eq!(derived, hashname);

    let identity = switch.local_peer_addr();
    assert_eq!(identity.hashname, hashname);
    assert!(identity.keys.is_some());
    assert!(!identity.paths.is_empty());

    switch.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn open_channel_to_unknown_peer_fails() {
    let net = inproc::Network::new();
    let switch = open_switch(&net).await;

    let nobody = Hashname::from_bytes([0x42; 32]);
    let err = switch
        .open_channel(nobody, "ping", true)
        .await
        .expect_err("channel to unknown peer should fail");
    assert!(matches!(err, Error::UnknownPeer(_)), "got {err:?}");

    switch.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn concurrent_dials_share_one_line() {
    let net = inproc::Network::new();
    let a = Arc::new(open_switch(&net).await);
    let b = open_switch(&net).await;
    let _listener = b.listen("probe");

    introduce(&a, &b).await;
    let b_hashname = b.hashname();

    let mut dials = Vec::new();
    for _ in 0..8 {
        let a = Arc::clone(&a);
        dials.push(tokio::spawn(async move {
            a.open_channel(b_hashname, "probe", true).await
        }));
    }
    for dial in dials {
        dial.await.unwrap().expect("concurrent open failed");
    }

    assert_eq!(a.stats().num_running_lines, 1, "dial race must share a line");
    assert_eq!(a.stats().num_open_lines, 1);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent() {
    let net = inproc::Network::new();
    let switch = open_switch(&net).await;

    timeout(TEST_TIMEOUT, switch.close()).await.unwrap().unwrap();
    timeout(TEST_TIMEOUT, switch.close()).await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_while_busy_terminates_all_channels() {
    let net = inproc::Network::new();
    let hub = open_switch(&net).await;
    let _listener = hub.listen("work");

    // 10 lines with 5 channels each, all with traffic in flight.
    let mut spokes = Vec::new();
    let mut channels = Vec::new();
    for _ in 0..10 {
        let spoke = open_switch(&net).await;
        introduce(&spoke, &hub).await;
        for _ in 0..5 {
            let ch = timeout(TEST_TIMEOUT, spoke.open_channel(hub.hashname(), "work", true))
                .await
                .expect("open timed out")
                .expect("open failed");
            ch.write_packet(Packet::with_body(b"busy".to_vec()))
                .await
                .expect("write failed");
            channels.push(ch);
        }
        spokes.push(spoke);
    }
    assert_eq!(hub.stats().num_running_lines, 10);
    // Let the hub ingest the first packets so every channel exists on
    // both sides.
    tokio::time::advance(Duration::from_millis(200)).await;
    tokio::task::yield_now().await;

    let begun = tokio::time::Instant::now();
    timeout(TEST_TIMEOUT, hub.close()).await.unwrap().unwrap();
    assert!(
        begun.elapsed() <= Duration::from_secs(2),
        "close took {:?}",
        begun.elapsed()
    );
    assert_eq!(hub.stats().num_running_lines, 0);
    assert_eq!(hub.stats().num_open_lines, 0);

    // Every spoke-side channel terminates once its line notices.
    for ch in &channels {
        let result = timeout(TEST_TIMEOUT, ch.read_packet())
            .await
            .expect("read should terminate");
        assert!(result.is_err(), "channel should be dead after shutdown");
    }

    for spoke in spokes {
        spoke.close().await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn peer_goes_down_and_recovers_on_inbound_evidence() {
    let net = inproc::Network::new();
    let a = open_switch(&net).await;
    let _listener = a.listen("probe");

    // A future b will live on this port, but nothing answers yet.
    let b_keys = PrivateKeys::generate();
    let b_public = b_keys.public_keys();
    let b_hashname = Hashname::from_parts(&b_public.to_parts()).unwrap();
    let dead_addr = "udp4:127.0.0.1:9".parse().unwrap();

    a.add_peer(
        PeerAddr::new(b_hashname)
            .with_keys(b_public.clone())
            .with_path(dead_addr),
    )
    .await
    .unwrap();

    // The dial exhausts its retry budget (1+2+4+8 s of backoff).
    let err = timeout(
        Duration::from_secs(60),
        a.open_channel(b_hashname, "probe", true),
    )
    .await
    .expect("dial should resolve")
    .expect_err("dial to silent peer should fail");
    assert!(matches!(err, Error::Timeout(_) | Error::Closed(_)), "got {err:?}");

    let peer = a.get_peer(b_hashname).await.expect("peer record retained");
    assert!(peer.is_down(), "peer should be marked down");
    let err = a
        .open_channel(b_hashname, "probe", true)
        .await
        .expect_err("down peer should be undialable");
    assert!(matches!(err, Error::UnknownPeer(_)), "got {err:?}");

    // Bring b up on the same port; its dial is the inbound evidence.
    let b_transport = Arc::new(net.endpoint_on(9));
    let b = Switch::open(
        SwitchConfig {
            keys: b_keys,
            ..SwitchConfig::default()
        },
        b_transport,
    )
    .await
    .unwrap();
    let _b_listener = b.listen("probe");
    b.add_peer(a.local_peer_addr()).await.unwrap();

    let ch = timeout(TEST_TIMEOUT, b.open_channel(a.hashname(), "probe", true))
        .await
        .expect("open timed out")
        .expect("open failed");
    drop(ch);

    assert!(!peer.is_down(), "inbound traffic should clear the down flag");
    let ch = timeout(TEST_TIMEOUT, a.open_channel(b_hashname, "probe", true))
        .await
        .expect("redial timed out")
        .expect("redial failed");
    drop(ch);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn csid_negotiation_selects_highest_common_set() {
    let net = inproc::Network::new();

    // {1a, 2a, 3a} vs {2a, 3a}: 3a wins and the dial works, because 3a
    // is the cipher set with real keys on both sides.
    let mut a_keys = PrivateKeys::generate();
    a_keys.insert(0x1a, Key::from_pair(vec![1; 32], vec![2; 32]));
    a_keys.insert(0x2a, Key::from_pair(vec![3; 32], vec![4; 32]));
    let a = Switch::open(
        SwitchConfig {
            keys: a_keys,
            ..SwitchConfig::default()
        },
        Arc::new(net.endpoint()),
    )
    .await
    .unwrap();

    let mut b_keys = PrivateKeys::generate();
    b_keys.insert(0x2a, Key::from_pair(vec![5; 32], vec![6; 32]));
    let b = Switch::open(
        SwitchConfig {
            keys: b_keys,
            ..SwitchConfig::default()
        },
        Arc::new(net.endpoint()),
    )
    .await
    .unwrap();
    let _listener = b.listen("probe");

    introduce(&a, &b).await;
    let ch = timeout(TEST_TIMEOUT, a.open_channel(b.hashname(), "probe", true))
        .await
        .expect("open timed out")
        .expect("negotiated dial failed");
    drop(ch);

    assert_eq!(
        hashline::select_csid(&a.public_keys(), &b.public_keys()),
        Some(CSID_3A)
    );

    // Disjoint sets: negotiation fails outright.
    let mut only_1a = Keys::new();
    only_1a.insert(0x1a, Key::from_public(vec![7; 32]));
    let mut only_2a = Keys::new();
    only_2a.insert(0x2a, Key::from_public(vec![8; 32]));
    assert_eq!(hashline::select_csid(&only_1a, &only_2a), None);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn disjoint_cipher_sets_fail_with_invalid_keys() {
    let net = inproc::Network::new();
    let a = open_switch(&net).await; // 3a only

    let mut b_keys = Keys::new();
    b_keys.insert(0x2a, Key::from_public(vec![9; 32]));
    let b_hashname = Hashname::from_parts(&b_keys.to_parts()).unwrap();

    a.add_peer(
        PeerAddr::new(b_hashname)
            .with_keys(b_keys)
            .with_path("udp4:127.0.0.1:9".parse().unwrap()),
    )
    .await
    .unwrap();

    let err = timeout(TEST_TIMEOUT, a.open_channel(b_hashname, "probe", true))
        .await
        .expect("dial should resolve")
        .expect_err("dial without a shared cipher set should fail");
    assert!(
        matches!(err, Error::InvalidKeys(_) | Error::Closed(_)),
        "got {err:?}"
    );

    a.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stats_track_lines_and_peers() {
    let net = inproc::Network::new();
    let a = open_switch(&net).await;
    let b = open_switch(&net).await;
    let _listener = b.listen("probe");

    assert_eq!(a.stats().known_peers, 0);
    introduce(&a, &b).await;
    assert_eq!(a.stats().known_peers, 1);

    let ch = timeout(TEST_TIMEOUT, a.open_channel(b.hashname(), "probe", true))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.stats().num_running_lines, 1);
    assert_eq!(a.stats().num_open_lines, 1);
    drop(ch);

    a.close().await.unwrap();
    assert_eq!(a.stats().num_running_lines, 0);
    assert_eq!(a.stats().num_open_lines, 0);
    b.close().await.unwrap();
}
