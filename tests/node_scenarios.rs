//! End-to-end scenarios over loopback TCP.
//!
//! Every node binds `127.0.0.1:0`; waits are bounded with `tokio::time::timeout`
//! so a broken exchange fails the test instead of hanging it.

use std::cmp::Ordering;
use std::time::Duration;

use kadmesh::{
    Address, BucketDiff, BucketUpdateError, FindValueReply, Keypair, Node, NodeConfig, Opcode,
    Value, bucket_index, distance, distance_cmp,
};
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHORT_TIMEOUT: Duration = Duration::from_secs(2);

async fn node() -> Node {
    Node::bind("127.0.0.1:0").await.expect("bind failed")
}

async fn node_with(config: NodeConfig) -> Node {
    Node::bind_with("127.0.0.1:0", Keypair::generate(), config)
        .await
        .expect("bind failed")
}

/// Re-evaluate `check` until it holds or `TEST_TIMEOUT` expires.
macro_rules! eventually {
    ($what:expr, $check:expr) => {{
        let reached = timeout(TEST_TIMEOUT, async {
            while !$check {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out waiting for {}", $what);
    }};
}

#[tokio::test]
async fn ping_is_acknowledged() {
    let a = node().await;
    let b = node().await;

    let peer = timeout(TEST_TIMEOUT, a.connect(&b.endpoint()))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    assert_eq!(peer, b.address());

    timeout(SHORT_TIMEOUT, a.ping(&peer))
        .await
        .expect("ping timed out")
        .expect("ping failed");
    eventually!("b to see a", b.is_connected(&a.address()));
}

#[tokio::test]
async fn stored_value_is_found_by_a_third_node() {
    let a = node().await;
    let b = node().await;
    let c = node().await;
    let b_addr = a.connect(&b.endpoint()).await.expect("a -> b");
    c.connect(&b.endpoint()).await.expect("c -> b");

    timeout(SHORT_TIMEOUT, a.store_at(&b_addr, "k1", Value::Text("v1".into())))
        .await
        .expect("store timed out")
        .expect("store rejected");

    let reply = timeout(SHORT_TIMEOUT, c.find_value(&b_addr, "k1"))
        .await
        .expect("find_value timed out")
        .expect("find_value failed");
    match reply {
        FindValueReply::Found { value, metadata } => {
            assert_eq!(value, Value::Text("v1".into()));
            assert_eq!(metadata.owner, a.address());
            assert!(metadata.timestamp_ms > 0);
        }
        FindValueReply::Closer(nodes) => panic!("expected value, got {} contacts", nodes.len()),
    }
}

#[tokio::test]
async fn subnet_mismatch_refuses_connection() {
    let a = node().await;
    let mut config = NodeConfig::default();
    config.subnet.tau = 128;
    let b = node_with(config).await;

    let result = timeout(TEST_TIMEOUT, a.connect(&b.endpoint()))
        .await
        .expect("connect timed out");
    assert!(result.is_err(), "mismatched subnets must not connect");

    sleep(Duration::from_millis(200)).await;
    assert!(a.peers().is_empty());
    assert!(b.peers().is_empty());
    assert_eq!(a.routing_snapshot().await.peers, 0);
    assert_eq!(b.routing_snapshot().await.peers, 0);
}

#[tokio::test]
async fn shout_is_delivered_once_per_node() {
    let a = node().await;
    let b = node().await;
    let c = node().await;
    a.connect(&b.endpoint()).await.expect("a -> b");
    a.connect(&c.endpoint()).await.expect("a -> c");
    b.connect(&c.endpoint()).await.expect("b -> c");
    eventually!("c to see both peers", c.peers().len() == 2);

    let mut b_rx = b.messages().await.expect("b receiver");
    let mut c_rx = c.messages().await.expect("c receiver");

    let sent = a.shout(Value::Text("hello mesh".into())).await.expect("shout");
    assert_eq!(sent, 2);

    for rx in [&mut b_rx, &mut c_rx] {
        let delivery = timeout(SHORT_TIMEOUT, rx.recv())
            .await
            .expect("shout not delivered")
            .expect("receiver closed");
        assert_eq!(delivery.opcode, Opcode::Shout);
        assert_eq!(delivery.from, a.address());
        assert_eq!(delivery.body, Value::Text("hello mesh".into()));
    }

    // The relayed copies must be recognized as duplicates.
    sleep(Duration::from_millis(300)).await;
    assert!(b_rx.try_recv().is_err());
    assert!(c_rx.try_recv().is_err());
}

#[tokio::test]
async fn whisper_reaches_a_node_we_are_not_connected_to() {
    let a = node().await;
    let b = node().await;
    let c = node().await;
    let b_addr = a.connect(&b.endpoint()).await.expect("a -> b");
    c.connect(&b.endpoint()).await.expect("c -> b");
    let c_addr = c.address();

    // b learns c's endpoint from c's ANNOUNCE.
    eventually!(
        "b to know c's endpoint",
        a.find_node(&b_addr, &c_addr)
            .await
            .map(|nodes| nodes.iter().any(|n| n.address == c_addr && n.endpoint.is_some()))
            .unwrap_or(false)
    );

    let mut c_rx = c.messages().await.expect("c receiver");
    timeout(TEST_TIMEOUT, a.whisper(&c_addr, Value::Text("secret".into())))
        .await
        .expect("whisper timed out")
        .expect("whisper failed");

    let delivery = timeout(TEST_TIMEOUT, c_rx.recv())
        .await
        .expect("whisper not delivered")
        .expect("receiver closed");
    assert_eq!(delivery.opcode, Opcode::Whisper);
    assert_eq!(delivery.from, a.address());
    assert_eq!(delivery.body, Value::Text("secret".into()));
}

#[tokio::test]
async fn custom_handler_replies() {
    let a = node().await;
    let b = node().await;
    b.register_custom(42, |from: &Address, body: &Value| {
        Some(Value::Array(vec![
            from.to_value(),
            Value::Text(format!("echo:{}", body.as_text().unwrap_or_default())),
        ]))
    });
    let b_addr = a.connect(&b.endpoint()).await.expect("a -> b");

    let reply = a
        .send_custom(&b_addr, 42, Value::Text("hi".into()))
        .await
        .expect("custom request failed")
        .expect("handler returned a body");
    assert_eq!(
        reply,
        Value::Array(vec![a.address().to_value(), Value::Text("echo:hi".into())])
    );

    let err = a
        .send_custom(&b_addr, 43, Value::Null)
        .await
        .expect_err("no handler for 43");
    assert!(err.to_string().contains("no handler"));

    assert!(b.unregister_custom(42));
    assert!(a.send_custom(&b_addr, 42, Value::Null).await.is_err());
}

#[tokio::test]
async fn change_key_rebinds_the_session() {
    let a = node().await;
    let b = node().await;
    a.connect(&b.endpoint()).await.expect("a -> b");
    let old = a.address();
    eventually!("b to see a", b.is_connected(&old));

    let new_keypair = Keypair::generate();
    let new = new_keypair.address();
    a.change_key(new_keypair).await.expect("change_key");
    assert_eq!(a.address(), new);

    eventually!("b to rebind a", b.is_connected(&new));
    assert!(!b.is_connected(&old));

    timeout(SHORT_TIMEOUT, b.ping(&new))
        .await
        .expect("ping timed out")
        .expect("ping under new key failed");
}

#[tokio::test]
async fn find_node_returns_k_closest_sorted() {
    let hub = node().await;
    let mut peers = Vec::new();
    for _ in 0..20 {
        let peer = node().await;
        peer.connect(&hub.endpoint()).await.expect("peer -> hub");
        peers.push(peer);
    }
    eventually!(
        "hub routing table to fill",
        hub.routing_snapshot().await.peers == 20
    );

    let target = Keypair::generate().address();
    let tau = hub.config().subnet.tau as usize;
    let k = hub.config().subnet.k as usize;
    let nodes = peers[0]
        .find_node(&hub.address(), &target)
        .await
        .expect("find_node failed");

    assert_eq!(nodes.len(), k.min(20));
    let distances: Vec<_> = nodes
        .iter()
        .map(|n| distance(&n.address.routing_key(), &target.routing_key(), tau))
        .collect();
    assert!(
        distances
            .windows(2)
            .all(|w| distance_cmp(&w[0], &w[1]) != Ordering::Greater),
        "contacts must be sorted by distance to the target"
    );
}

#[tokio::test]
async fn put_then_get_across_nodes() {
    let a = node().await;
    let b = node().await;
    let c = node().await;
    a.connect(&b.endpoint()).await.expect("a -> b");
    c.connect(&b.endpoint()).await.expect("c -> b");

    let replicas = timeout(TEST_TIMEOUT, a.put("shared", Value::from(7u8)))
        .await
        .expect("put timed out")
        .expect("put failed");
    assert!(replicas >= 1);

    let (value, metadata) = timeout(TEST_TIMEOUT, c.get("shared"))
        .await
        .expect("get timed out")
        .expect("get failed")
        .expect("value present");
    assert_eq!(value, Value::from(7u8));
    assert_eq!(metadata.owner, a.address());
}

#[tokio::test]
async fn disconnect_removes_peer_on_both_sides() {
    let a = node().await;
    let b = node().await;
    let b_addr = a.connect(&b.endpoint()).await.expect("a -> b");
    eventually!("b to see a", b.is_connected(&a.address()));

    assert!(a.disconnect(&b_addr));
    eventually!("a to drop b", a.peers().is_empty());
    eventually!("b to drop a", b.peers().is_empty());
    eventually!(
        "routing tables to empty",
        a.routing_snapshot().await.peers == 0 && b.routing_snapshot().await.peers == 0
    );
}

#[tokio::test]
async fn routing_buckets_swap_and_diff_through_the_node() {
    let a = node().await;
    let b = node().await;
    let b_addr = a.connect(&b.endpoint()).await.expect("a -> b");
    eventually!("b to see a", b.routing_snapshot().await.peers == 1);
    eventually!("a to route b", a.routing_snapshot().await.peers == 1);

    let tau = a.config().subnet.tau as usize;
    let idx = bucket_index(&a.address().routing_key(), &b_addr.routing_key(), tau);
    let bucket = a.bucket(idx).await.expect("bucket");
    assert_eq!(bucket.len(), 1);
    assert_eq!(bucket[0].address, b_addr);
    let contact = bucket[0].clone();

    a.replace_bucket(idx, vec![b_addr], Vec::new())
        .await
        .expect("swap matching bucket");
    assert!(a.bucket(idx).await.expect("bucket").is_empty());

    let err = a
        .replace_bucket(idx, vec![b_addr], Vec::new())
        .await
        .expect_err("bucket no longer matches");
    assert_eq!(
        err.downcast_ref::<BucketUpdateError>(),
        Some(&BucketUpdateError::Conflict)
    );

    let rejected = a
        .apply_bucket_diff(BucketDiff {
            evict: Vec::new(),
            insert: vec![contact.clone()],
        })
        .await
        .expect("diff");
    assert!(rejected.is_empty());
    assert_eq!(a.bucket(idx).await.expect("bucket"), vec![contact]);

    assert!(a.bucket(tau).await.is_err());
}
