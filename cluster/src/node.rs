//! Cluster node: listener, peer registry, replication, cross-peer reads.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, info, warn};

use bytecache::{Cache, Statistics};
use protocol_peer::{MODE_ACTIVE, MODE_PASSIVE, Message, ProposedPeer};

use crate::comms::Connection;
use crate::config::{ClusterConfig, ReplicationMode};
use crate::error::ClusterError;
use crate::peer::{PeerConfig, PeerState, RemotePeer};

const QUEUE_SIZE: usize = 512;
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// One process's membership in the cache cluster.
///
/// The node owns the local [`Cache`], a TCP listener for inbound peers, a
/// join queue feeding outbound connects, and a replication worker fanning
/// local writes out to connected peers. Local reads that miss fall back to
/// a parallel cross-peer lookup where the first non-empty reply wins.
pub struct ClusterNode {
    config: ClusterConfig,
    mode: u8,
    cache: OnceLock<Cache>,
    peers: RwLock<HashMap<String, Arc<RemotePeer>>>,
    // Outbound connects currently in flight, by proposed peer id.
    pending_conn: Mutex<HashSet<String>>,
    join_tx: Mutex<Option<Sender<ProposedPeer>>>,
    join_rx: Receiver<ProposedPeer>,
    replication_tx: Mutex<Option<Sender<Message>>>,
    replication_rx: Receiver<Message>,
    replication_factor: AtomicU8,
    shutdown: AtomicBool,
    started: AtomicBool,
}

impl ClusterNode {
    /// Create an active cluster member. Call [`start`](Self::start) to bind
    /// the listener and begin peering.
    pub fn new(config: ClusterConfig) -> Arc<ClusterNode> {
        Self::with_mode(config, MODE_ACTIVE)
    }

    /// Create a passive, client-style node: it joins `seed_addr` and caches
    /// replicated data, but refuses to peer with other passive nodes and
    /// reports no statistics.
    pub fn passive_client(
        id: &str,
        seed_addr: &str,
        local_port: u16,
        ping_interval: u64,
        ping_timeout: u64,
        ping_failure_threshold: u32,
    ) -> Arc<ClusterNode> {
        let mut config = ClusterConfig::default();
        config.id = id.to_owned();
        config.join = true;
        config.join_ip = seed_addr.to_owned();
        config.local_port = local_port;
        config.ping_interval = ping_interval;
        config.ping_timeout = ping_timeout;
        config.ping_failure_threshold = ping_failure_threshold;
        Self::with_mode(config, MODE_PASSIVE)
    }

    fn with_mode(mut config: ClusterConfig, mode: u8) -> Arc<ClusterNode> {
        if config.id.is_empty() {
            config.id = random_token(8);
        }
        let (join_tx, join_rx) = bounded(QUEUE_SIZE);
        let (replication_tx, replication_rx) = bounded(QUEUE_SIZE);
        let replication_factor = config.replication_factor.max(1);
        Arc::new(ClusterNode {
            config,
            mode,
            cache: OnceLock::new(),
            peers: RwLock::new(HashMap::new()),
            pending_conn: Mutex::new(HashSet::new()),
            join_tx: Mutex::new(Some(join_tx)),
            join_rx,
            replication_tx: Mutex::new(Some(replication_tx)),
            replication_rx,
            replication_factor: AtomicU8::new(replication_factor),
            shutdown: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    /// This node's id.
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Number of admitted peers.
    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Validate configuration, bind the listener, and spawn the accept,
    /// join, and replication workers. When `join` is configured, the seed
    /// peer is enqueued for connection.
    pub fn start(self: &Arc<Self>) -> Result<(), ClusterError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.try_start() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.started.store(false, Ordering::SeqCst);
                Err(error)
            }
        }
    }

    fn try_start(self: &Arc<Self>) -> Result<(), ClusterError> {
        self.config.validate()?;
        let cache = Cache::builder()
            .config(self.config.cache.clone())
            .build()
            .map_err(|e| ClusterError::ConfigInvalid(e.to_string()))?;
        let _ = self.cache.set(cache);

        let host = if self.config.bind_all {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        };
        let bind_addr = format!("{host}:{}", self.config.local_port);
        let listener = TcpListener::bind(&bind_addr)?;
        listener.set_nonblocking(true)?;
        info!(id = %self.config.id, addr = %bind_addr, "cluster node listening");

        {
            let node = Arc::downgrade(self);
            thread::Builder::new()
                .name("node-accept".to_owned())
                .spawn(move || accept_loop(node, listener))
                .expect("failed to spawn accept thread");
        }
        {
            let node = Arc::downgrade(self);
            let join_rx = self.join_rx.clone();
            thread::Builder::new()
                .name("node-join".to_owned())
                .spawn(move || {
                    while let Ok(proposed) = join_rx.recv() {
                        let Some(node) = node.upgrade() else { break };
                        node.connect_to_peer(proposed);
                    }
                })
                .expect("failed to spawn join thread");
        }
        {
            let node = Arc::downgrade(self);
            let replication_rx = self.replication_rx.clone();
            thread::Builder::new()
                .name("node-replicate".to_owned())
                .spawn(move || {
                    while let Ok(message) = replication_rx.recv() {
                        let Some(node) = node.upgrade() else { break };
                        node.fan_out(message);
                    }
                })
                .expect("failed to spawn replication thread");
        }

        if self.config.join {
            self.enqueue_join(ProposedPeer {
                id: String::new(),
                ip_address: self.config.join_ip.clone(),
            });
        }
        Ok(())
    }

    /// Tear down every peer and stop the workers. Idempotent.
    pub fn shut_down(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(id = %self.config.id, "cluster node shutting down");
        self.join_tx.lock().take();
        self.replication_tx.lock().take();
        let peers: Vec<Arc<RemotePeer>> =
            self.peers.write().drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            peer.trigger_shutdown();
        }
        if let Some(cache) = self.cache.get() {
            cache.shut_down();
        }
    }

    /// Store `key` → `value` locally and replicate the write to peers.
    /// A zero `ttl` means no expiry (subject to the cache's `life_window`).
    pub fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), ClusterError> {
        let cache = self.cache.get().ok_or(ClusterError::NotStarted)?;
        let expiry = cache.set(key, value, ttl)?;
        self.replicate(Message::Put {
            key: key.to_owned(),
            expiry,
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Look `key` up locally; on a miss, fan a GET out to every connected
    /// peer and wait up to `timeout` for the first non-empty reply.
    pub fn get(&self, key: &str, timeout: Duration) -> Result<Vec<u8>, ClusterError> {
        let cache = self.cache.get().ok_or(ClusterError::NotStarted)?;
        if let Ok(value) = cache.get(key) {
            return Ok(value);
        }

        let peers: Vec<Arc<RemotePeer>> = self
            .peers
            .read()
            .values()
            .filter(|peer| peer.is_connected())
            .cloned()
            .collect();
        if peers.is_empty() {
            return Err(ClusterError::NotFound);
        }

        let (reply_tx, reply_rx) = bounded::<Vec<u8>>(1);
        let pending_key = format!("{key}{}", random_token(8));
        for peer in &peers {
            peer.get_data(key, &pending_key, reply_tx.clone());
        }
        drop(reply_tx);

        let result = reply_rx.recv_timeout(timeout);
        for peer in &peers {
            peer.forget_pending(&pending_key);
        }
        result.map_err(|_| ClusterError::NotFound)
    }

    /// Remove `key` locally and replicate the delete. Succeeds even when
    /// the key is absent locally, since a peer may still hold it.
    pub fn delete(&self, key: &str) -> Result<(), ClusterError> {
        let cache = self.cache.get().ok_or(ClusterError::NotStarted)?;
        let _ = cache.delete(key);
        self.replicate(Message::Del {
            key: key.to_owned(),
        });
        Ok(())
    }

    /// Cache statistics, or `None` for a passive node.
    pub fn statistics(&self) -> Option<Statistics> {
        if self.mode == MODE_PASSIVE {
            return None;
        }
        self.cache.get().map(|cache| cache.statistics())
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn cache(&self) -> Option<&Cache> {
        self.cache.get()
    }

    pub(crate) fn mode_byte(&self) -> u8 {
        self.mode
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.config.local_port
    }

    pub(crate) fn replication_factor(&self) -> u8 {
        self.replication_factor.load(Ordering::Relaxed)
    }

    pub(crate) fn set_replication_factor(&self, factor: u8) {
        self.replication_factor
            .store(factor.max(1), Ordering::Relaxed);
    }

    /// Admit a peer that completed VERIFY. Duplicate ids are rejected; a
    /// re-admission of the same id after a disconnect is allowed.
    pub(crate) fn verify_peer(&self, peer: &Arc<RemotePeer>) -> bool {
        let id = peer.id();
        if id.is_empty() || id == self.config.id {
            return false;
        }
        {
            let mut peers = self.peers.write();
            if peers.contains_key(&id) {
                return false;
            }
            peers.insert(id.clone(), Arc::clone(peer));
        }
        self.pending_conn.lock().remove(&id);
        info!(peer = %id, "admitted remote peer");
        true
    }

    /// A peer's connection fully shut down; unregister it if it is still
    /// the one on record for its id.
    pub(crate) fn peer_disconnected(&self, peer: &RemotePeer) {
        let id = peer.id();
        if id.is_empty() {
            return;
        }
        {
            let mut peers = self.peers.write();
            if let Some(existing) = peers.get(&id) {
                if std::ptr::eq(existing.as_ref(), peer) {
                    peers.remove(&id);
                    info!(peer = %id, "removed disconnected peer");
                }
            }
        }
        self.pending_conn.lock().remove(&id);
    }

    /// An outbound connect exhausted its retries.
    pub(crate) fn unable_to_connect(&self, id: &str) {
        if !id.is_empty() {
            self.pending_conn.lock().remove(id);
        }
    }

    /// Queue a peer for an outbound connection attempt.
    pub(crate) fn enqueue_join(&self, proposed: ProposedPeer) {
        if let Some(tx) = self.join_tx.lock().as_ref() {
            if tx.try_send(proposed).is_err() {
                warn!("join queue full, dropping proposed peer");
            }
        }
    }

    /// Peers advertised to `requester`: everyone but the asker, minus
    /// passive peers when the asker is itself passive.
    pub(crate) fn peer_list(&self, exclude_id: &str, requester_mode: u8) -> Vec<ProposedPeer> {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.id() != exclude_id)
            .filter(|peer| !(requester_mode == MODE_PASSIVE && peer.peer_mode() == MODE_PASSIVE))
            .map(|peer| ProposedPeer {
                id: peer.id(),
                ip_address: peer.ip_address(),
            })
            .collect()
    }

    fn connect_to_peer(self: &Arc<Self>, proposed: ProposedPeer) {
        if proposed.ip_address.is_empty() || proposed.id == self.config.id {
            return;
        }
        if !proposed.id.is_empty() {
            if self.peers.read().contains_key(&proposed.id) {
                debug!(peer = %proposed.id, "already connected, skipping join");
                return;
            }
            if !self.pending_conn.lock().insert(proposed.id.clone()) {
                debug!(peer = %proposed.id, "connect already in flight");
                return;
            }
        }
        let peer_config = PeerConfig {
            id: proposed.id,
            ip_address: proposed.ip_address,
            ping_interval: self.config.ping_interval,
            ping_timeout: self.config.ping_timeout,
            ping_failure_threshold: self.config.ping_failure_threshold,
            connect_retries: self.config.connect_retries,
            service_port: String::new(),
            sync: true,
            reconnect_on_disconnect: self.config.reconnect_on_disconnect,
        };
        let peer = RemotePeer::new(peer_config, Arc::downgrade(self), PeerState::Connecting);
        peer.join();
    }

    fn handle_accept(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let Ok(conn) = Connection::from_stream(stream) else {
            return;
        };
        info!(remote = %addr, "accepted peer connection");
        let peer_config = PeerConfig {
            id: String::new(),
            ip_address: addr.to_string(),
            ping_interval: self.config.ping_interval,
            ping_timeout: self.config.ping_timeout,
            ping_failure_threshold: self.config.ping_failure_threshold,
            connect_retries: self.config.connect_retries,
            service_port: String::new(),
            sync: false,
            reconnect_on_disconnect: self.config.reconnect_on_disconnect,
        };
        let peer = RemotePeer::new(peer_config, Arc::downgrade(self), PeerState::Handshake);
        peer.set_connection(conn);
        peer.start();
    }

    fn replicate(&self, message: Message) {
        if let Some(tx) = self.replication_tx.lock().as_ref() {
            if tx.try_send(message).is_err() {
                warn!("replication queue full, dropping write fan-out");
            }
        }
    }

    /// Push a replicated write onto the outbound queue of each target peer.
    fn fan_out(&self, message: Message) {
        let peers: Vec<Arc<RemotePeer>> = self
            .peers
            .read()
            .values()
            .filter(|peer| peer.is_connected())
            .cloned()
            .collect();
        let targets: &[Arc<RemotePeer>] = match self.config.replication_mode {
            ReplicationMode::Full => &peers,
            ReplicationMode::Subset => {
                let count = (self.replication_factor() as usize).min(peers.len());
                &peers[..count]
            }
        };
        for peer in targets {
            peer.send_message(message.clone());
        }
    }
}

impl Drop for ClusterNode {
    fn drop(&mut self) {
        self.shut_down();
    }
}

fn accept_loop(node: Weak<ClusterNode>, listener: TcpListener) {
    loop {
        let Some(node) = node.upgrade() else { break };
        if node.is_shut_down() {
            break;
        }
        match listener.accept() {
            Ok((stream, addr)) => node.handle_accept(stream, addr),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                drop(node);
                thread::sleep(ACCEPT_POLL);
            }
            Err(error) => {
                warn!(%error, "accept error");
                drop(node);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("accept loop terminated");
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer(node: &Arc<ClusterNode>, id: &str) -> Arc<RemotePeer> {
        RemotePeer::new(
            PeerConfig {
                id: id.to_owned(),
                ip_address: "127.0.0.1:9092".to_owned(),
                ping_interval: 0,
                ping_timeout: 0,
                ping_failure_threshold: 1,
                connect_retries: 0,
                service_port: "9092".to_owned(),
                sync: false,
                reconnect_on_disconnect: false,
            },
            Arc::downgrade(node),
            PeerState::Handshake,
        )
    }

    #[test]
    fn test_verify_peer_admission() {
        let node = ClusterNode::new(ClusterConfig::default());
        let peer = test_peer(&node, "remote-a");

        assert!(node.verify_peer(&peer), "first admission succeeds");
        assert!(
            !node.verify_peer(&peer),
            "duplicate id must not be admitted twice"
        );

        node.peer_disconnected(&peer);
        assert!(
            node.verify_peer(&peer),
            "re-admission after disconnect succeeds"
        );
        node.shut_down();
    }

    #[test]
    fn test_verify_peer_rejects_own_id() {
        let node = ClusterNode::new(ClusterConfig::default());
        let peer = test_peer(&node, node.id());
        assert!(!node.verify_peer(&peer));
        node.shut_down();
    }

    #[test]
    fn test_peer_disconnected_keeps_newer_registration() {
        let node = ClusterNode::new(ClusterConfig::default());
        let first = test_peer(&node, "remote-a");
        let second = test_peer(&node, "remote-a");

        assert!(node.verify_peer(&first));
        assert!(!node.verify_peer(&second));

        // The rejected duplicate tearing down must not unregister the
        // admitted connection.
        node.peer_disconnected(&second);
        assert_eq!(node.peer_count(), 1);

        node.peer_disconnected(&first);
        assert_eq!(node.peer_count(), 0);
        node.shut_down();
    }

    #[test]
    fn test_peer_list_filters_passive_for_passive() {
        let node = ClusterNode::new(ClusterConfig::default());
        let active = test_peer(&node, "active-peer");
        let passive = test_peer(&node, "passive-peer");
        passive.set_peer_mode(MODE_PASSIVE);
        assert!(node.verify_peer(&active));
        assert!(node.verify_peer(&passive));

        let listed = node.peer_list("asker", MODE_PASSIVE);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "active-peer");

        let listed = node.peer_list("asker", MODE_ACTIVE);
        assert_eq!(listed.len(), 2);

        // The asker itself is excluded.
        let listed = node.peer_list("active-peer", MODE_ACTIVE);
        assert_eq!(listed.len(), 1);
        node.shut_down();
    }

    #[test]
    fn test_replication_factor_floor() {
        let node = ClusterNode::new(ClusterConfig::default());
        node.set_replication_factor(0);
        assert_eq!(node.replication_factor(), 1);
        node.set_replication_factor(3);
        assert_eq!(node.replication_factor(), 3);
        node.shut_down();
    }

    #[test]
    fn test_ops_before_start_fail() {
        let node = ClusterNode::new(ClusterConfig::default());
        assert!(matches!(
            node.put("k", b"v", Duration::ZERO),
            Err(ClusterError::NotStarted)
        ));
        assert!(matches!(
            node.get("k", Duration::from_millis(10)),
            Err(ClusterError::NotStarted)
        ));
        node.shut_down();
    }
}
