//! End-to-end cluster tests over real sockets.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cluster::{ClusterConfig, ClusterError, ClusterNode};

/// Get an available port for testing.
fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `condition` until it holds or `timeout` elapses.
fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    condition()
}

fn node_config(port: u16) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.local_port = port;
    config.bind_all = false;
    config.connect_retries = 3;
    config.cache.shards = 8;
    config
}

fn joining_config(port: u16, seed: u16) -> ClusterConfig {
    let mut config = node_config(port);
    config.join = true;
    config.join_ip = format!("127.0.0.1:{seed}");
    config
}

const GET_TIMEOUT: Duration = Duration::from_millis(200);
const LINK_TIMEOUT: Duration = Duration::from_secs(5);

fn connected(a: &Arc<ClusterNode>, b: &Arc<ClusterNode>) -> bool {
    a.peer_count() >= 1 && b.peer_count() >= 1
}

#[test]
fn test_two_node_put_get_delete() {
    let port1 = get_available_port();
    let port2 = get_available_port();
    let node1 = ClusterNode::new(node_config(port1));
    let node2 = ClusterNode::new(joining_config(port2, port1));

    node1.start().unwrap();
    node2.start().unwrap();
    assert!(
        wait_for(|| connected(&node1, &node2), LINK_TIMEOUT),
        "nodes never linked up"
    );

    node1
        .put("key_1", b"data_1", Duration::from_secs(60))
        .unwrap();
    thread::sleep(Duration::from_millis(200));
    let value = node2.get("key_1", GET_TIMEOUT).unwrap();
    assert_eq!(value, b"data_1", "data placed in node1 differs on node2");

    node2.delete("key_1").unwrap();
    thread::sleep(Duration::from_millis(200));
    assert!(
        node1.get("key_1", GET_TIMEOUT).is_err(),
        "key must be gone after delete on the other node"
    );

    node1.shut_down();
    node2.shut_down();
}

#[test]
fn test_cross_peer_read_through() {
    let port1 = get_available_port();
    let port2 = get_available_port();
    let node1 = ClusterNode::new(node_config(port1));

    node1.start().unwrap();
    // Stored before node2 exists, so node2 can only see it via a
    // peer-assisted GET.
    node1
        .put("warm_key", b"warm_data", Duration::from_secs(60))
        .unwrap();

    let node2 = ClusterNode::new(joining_config(port2, port1));
    node2.start().unwrap();
    assert!(wait_for(|| connected(&node1, &node2), LINK_TIMEOUT));

    let value = node2.get("warm_key", Duration::from_secs(2)).unwrap();
    assert_eq!(value, b"warm_data");

    // A key nobody holds times out into NotFound.
    assert!(matches!(
        node2.get("no_such_key", GET_TIMEOUT),
        Err(ClusterError::NotFound)
    ));

    node1.shut_down();
    node2.shut_down();
}

#[test]
fn test_sync_topology_and_first_reply_wins() {
    let port1 = get_available_port();
    let port2 = get_available_port();
    let port3 = get_available_port();

    let node1 = ClusterNode::new(node_config(port1));
    let node2 = ClusterNode::new(joining_config(port2, port1));
    node1.start().unwrap();
    node2.start().unwrap();
    assert!(wait_for(|| connected(&node1, &node2), LINK_TIMEOUT));

    // Both existing nodes hold the key before the third appears.
    node1
        .put("shared", b"shared_data", Duration::from_secs(60))
        .unwrap();
    thread::sleep(Duration::from_millis(200));

    // The third node joins node1 and learns about node2 from the topology
    // sync, ending up linked to both.
    let node3 = ClusterNode::new(joining_config(port3, port1));
    node3.start().unwrap();
    assert!(
        wait_for(|| node3.peer_count() == 2, LINK_TIMEOUT),
        "topology sync should link node3 to both peers"
    );

    // Both peers answer the fan-out; the first non-empty reply resolves
    // the read and the other is discarded.
    let value = node3.get("shared", Duration::from_secs(2)).unwrap();
    assert_eq!(value, b"shared_data");

    node1.shut_down();
    node2.shut_down();
    node3.shut_down();
}

#[test]
fn test_passive_client_replication() {
    let port1 = get_available_port();
    let port2 = get_available_port();
    let node1 = ClusterNode::new(node_config(port1));
    let client = ClusterNode::passive_client(
        "testMachine",
        &format!("127.0.0.1:{port1}"),
        port2,
        5,
        3,
        10,
    );

    node1.start().unwrap();
    client.start().unwrap();
    assert!(wait_for(|| connected(&node1, &client), LINK_TIMEOUT));

    node1
        .put("key_1", b"data_1", Duration::from_secs(60))
        .unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(client.get("key_1", GET_TIMEOUT).unwrap(), b"data_1");

    client.delete("key_1").unwrap();
    thread::sleep(Duration::from_millis(200));
    assert!(node1.get("key_1", GET_TIMEOUT).is_err());

    // Writes on the passive client replicate to the active node too.
    client
        .put("key_2", b"data_2", Duration::from_secs(60))
        .unwrap();
    client.put("key_4", b"data_4", Duration::ZERO).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(node1.get("key_2", GET_TIMEOUT).unwrap(), b"data_2");
    assert_eq!(node1.get("key_4", GET_TIMEOUT).unwrap(), b"data_4");

    node1.shut_down();
    client.shut_down();
}

#[test]
fn test_passive_nodes_refuse_each_other() {
    let port1 = get_available_port();
    let port2 = get_available_port();
    let port3 = get_available_port();

    let node1 = ClusterNode::new(node_config(port1));
    let client1 = ClusterNode::passive_client(
        "testMachine_1",
        &format!("127.0.0.1:{port1}"),
        port2,
        5,
        3,
        10,
    );
    let client2 = ClusterNode::passive_client(
        "testMachine_2",
        &format!("127.0.0.1:{port2}"),
        port3,
        5,
        3,
        10,
    );

    node1.start().unwrap();
    client1.start().unwrap();
    client2.start().unwrap();

    assert!(wait_for(|| client1.peer_count() == 1, LINK_TIMEOUT));
    // Give client2's rejected handshake time to play out, then confirm it
    // never linked to the other passive node.
    thread::sleep(Duration::from_millis(500));
    assert_eq!(client1.peer_count(), 1);
    assert_eq!(client2.peer_count(), 0);

    node1.shut_down();
    client1.shut_down();
    client2.shut_down();
}

#[test]
fn test_join_without_join_ip_fails() {
    let mut config = node_config(get_available_port());
    config.join = true;
    config.join_ip = String::new();
    let node = ClusterNode::new(config);
    assert!(matches!(
        node.start(),
        Err(ClusterError::ConfigInvalid(_))
    ));
}

#[test]
fn test_bad_shard_config_fails_start() {
    let mut config = node_config(get_available_port());
    config.cache.shards = 19;
    let node = ClusterNode::new(config);
    assert!(node.start().is_err());
}

#[test]
fn test_same_port_second_node_fails() {
    let port = get_available_port();
    let node1 = ClusterNode::new(node_config(port));
    let node2 = ClusterNode::new(node_config(port));

    node1.start().unwrap();
    assert!(node2.start().is_err(), "second bind of the same port must fail");

    node1.shut_down();
    node2.shut_down();
}

#[test]
fn test_ttl_expires_entry() {
    let node = ClusterNode::new(node_config(get_available_port()));
    node.start().unwrap();

    node.put("k", b"v", Duration::from_secs(2)).unwrap();
    assert_eq!(node.get("k", GET_TIMEOUT).unwrap(), b"v");

    thread::sleep(Duration::from_secs(3));
    assert!(
        node.get("k", GET_TIMEOUT).is_err(),
        "entry must expire after its ttl"
    );

    node.shut_down();
}

#[test]
fn test_statistics() {
    let port1 = get_available_port();
    let node = ClusterNode::new(node_config(port1));
    let client = ClusterNode::passive_client(
        "statsMachine",
        &format!("127.0.0.1:{port1}"),
        get_available_port(),
        5,
        3,
        10,
    );

    node.start().unwrap();
    client.start().unwrap();

    node.put("key", b"value", Duration::from_secs(60)).unwrap();
    let _ = node.get("key", GET_TIMEOUT).unwrap();
    let _ = node.get("missing", GET_TIMEOUT);

    let stats = node.statistics().expect("active node reports statistics");
    assert_eq!(stats.total.hits, 1);
    assert!(stats.total.misses >= 1);

    assert!(
        client.statistics().is_none(),
        "passive client has no statistics"
    );

    node.shut_down();
    client.shut_down();
}

#[test]
fn test_shut_down_is_idempotent() {
    let node = ClusterNode::new(node_config(get_available_port()));
    node.start().unwrap();
    node.put("key", b"value", Duration::ZERO).unwrap();
    node.shut_down();
    node.shut_down();
}
