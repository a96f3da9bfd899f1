//! Remote peer state machine.
//!
//! One `RemotePeer` drives one TCP connection from connect/accept through
//! handshake, steady-state message exchange, liveness probing, and
//! teardown. Five worker threads cooperate per peer:
//!
//! - reader: blocking socket reads, framing, inbound queueing
//! - writer: drains the outbound queue onto the socket
//! - dispatcher: consumes the inbound queue and runs message handlers
//! - ping ticker: emits PING every interval and arms the watcher
//! - ping watcher: races each armed window against PONG receipt
//!
//! Shutdown is broadcast by dropping the shutdown channel's sender; every
//! worker's `select!` wakes with a disconnect error and exits. A supervisor
//! thread joins all workers and then runs `tear_down` exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender, after, bounded, select, tick};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use protocol_peer::{HEADER_SIZE, MAX_BODY_SIZE, MODE_PASSIVE, Message, ParseError, ProposedPeer};

use crate::comms::Connection;
use crate::node::ClusterNode;

const CHANNEL_SIZE: usize = 512;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BACKOFF: Duration = Duration::from_secs(3);
const HANDSHAKE_WAIT_SECS: u32 = 5;

/// Connection lifecycle state. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PeerState {
    Connecting = 0,
    Handshake = 1,
    Connected = 2,
    Disconnected = 3,
}

impl PeerState {
    fn from_u8(value: u8) -> PeerState {
        match value {
            0 => PeerState::Connecting,
            1 => PeerState::Handshake,
            2 => PeerState::Connected,
            _ => PeerState::Disconnected,
        }
    }
}

/// Per-peer settings, partly adopted from the remote side at VERIFY.
#[derive(Debug, Clone)]
pub(crate) struct PeerConfig {
    pub(crate) id: String,
    pub(crate) ip_address: String,
    pub(crate) ping_interval: u64,
    pub(crate) ping_timeout: u64,
    pub(crate) ping_failure_threshold: u32,
    pub(crate) connect_retries: u32,
    #[allow(dead_code)]
    pub(crate) service_port: String,
    pub(crate) sync: bool,
    pub(crate) reconnect_on_disconnect: bool,
}

impl PeerConfig {
    /// Fill in sensible defaults for liveness settings.
    fn check(&mut self) {
        if self.ping_interval < 1 {
            self.ping_interval = 5;
        }
        if self.ping_timeout < 1 {
            self.ping_timeout = 3;
        }
        if self.ping_timeout > self.ping_interval {
            warn!(
                ping_timeout = self.ping_timeout,
                ping_interval = self.ping_interval,
                "ping timeout is greater than ping interval, pings will NEVER time out"
            );
        }
        if self.ping_failure_threshold == 0 {
            self.ping_failure_threshold = 5;
        }
    }
}

/// Liveness and drop counters for one peer.
#[derive(Default)]
pub(crate) struct PeerMetrics {
    pub(crate) ping_sent: AtomicU64,
    pub(crate) ping_received: AtomicU64,
    pub(crate) pong_sent: AtomicU64,
    pub(crate) pong_received: AtomicU64,
    pub(crate) dropped_messages: AtomicU64,
}

pub(crate) struct RemotePeer {
    config: Mutex<PeerConfig>,
    node: Weak<ClusterNode>,
    conn: Mutex<Option<Connection>>,
    state: AtomicU8,
    // Transitions go through this lock; reads are plain atomic loads.
    state_lock: Mutex<()>,
    inbound_tx: Sender<Message>,
    inbound_rx: Receiver<Message>,
    outbound_tx: Sender<Message>,
    outbound_rx: Receiver<Message>,
    // Dropping the sender broadcasts shutdown to every select!.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    arm_tx: Sender<()>,
    arm_rx: Receiver<()>,
    pong_tx: Sender<()>,
    pong_rx: Receiver<()>,
    ping_failures: AtomicU32,
    pending_get: Mutex<HashMap<String, Sender<Vec<u8>>>>,
    mode: AtomicU8,
    pub(crate) metrics: PeerMetrics,
    started: AtomicBool,
}

impl RemotePeer {
    pub(crate) fn new(
        mut config: PeerConfig,
        node: Weak<ClusterNode>,
        initial_state: PeerState,
    ) -> Arc<RemotePeer> {
        config.check();
        let (inbound_tx, inbound_rx) = bounded(CHANNEL_SIZE);
        let (outbound_tx, outbound_rx) = bounded(CHANNEL_SIZE);
        let (shutdown_tx, shutdown_rx) = bounded(0);
        let (arm_tx, arm_rx) = bounded(1);
        let (pong_tx, pong_rx) = bounded(1);
        Arc::new(RemotePeer {
            config: Mutex::new(config),
            node,
            conn: Mutex::new(None),
            state: AtomicU8::new(initial_state as u8),
            state_lock: Mutex::new(()),
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            arm_tx,
            arm_rx,
            pong_tx,
            pong_rx,
            ping_failures: AtomicU32::new(0),
            pending_get: Mutex::new(HashMap::new()),
            mode: AtomicU8::new(0),
            metrics: PeerMetrics::default(),
            started: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> String {
        self.config.lock().id.clone()
    }

    pub(crate) fn ip_address(&self) -> String {
        self.config.lock().ip_address.clone()
    }

    pub(crate) fn peer_mode(&self) -> u8 {
        self.mode.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn set_peer_mode(&self, mode: u8) {
        self.mode.store(mode, Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    fn set_state(&self, state: PeerState) {
        let _guard = self.state_lock.lock();
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn set_connection(&self, conn: Connection) {
        *self.conn.lock() = Some(conn);
    }

    /// Dial the peer in the background, with retry backoff, then run the
    /// connection. Used for outbound peers taken off the join queue.
    pub(crate) fn join(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        let addr = self.config.lock().ip_address.clone();
        info!(%addr, "joining remote peer");
        thread::Builder::new()
            .name("peer-join".to_owned())
            .spawn(move || {
                peer.set_state(PeerState::Connecting);
                let retries = peer.config.lock().connect_retries;
                let mut tries = 0u32;
                loop {
                    if peer.node_is_gone() {
                        return;
                    }
                    match Connection::connect(&addr, CONNECT_TIMEOUT) {
                        Ok(conn) => {
                            info!(%addr, "connected to peer");
                            peer.set_connection(conn);
                            peer.set_state(PeerState::Handshake);
                            peer.start();
                            return;
                        }
                        Err(error) => warn!(%addr, %error, "connect failed"),
                    }
                    thread::sleep(RETRY_BACKOFF);
                    if retries > 0 {
                        tries += 1;
                        if tries >= retries {
                            warn!(%addr, "unable to connect to peer after max retries");
                            if let Some(node) = peer.node.upgrade() {
                                node.unable_to_connect(&peer.id());
                            }
                            return;
                        }
                    }
                }
            })
            .expect("failed to spawn peer join thread");
    }

    /// Spawn the worker threads and open the handshake.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = Vec::with_capacity(5);
        for (name, entry) in [
            ("peer-reader", Self::reader_loop as fn(&RemotePeer)),
            ("peer-writer", Self::writer_loop),
            ("peer-ping", Self::ping_ticker_loop),
            ("peer-watch", Self::ping_watcher_loop),
        ] {
            let peer = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(name.to_owned())
                .spawn(move || entry(&peer))
                .expect("failed to spawn peer worker thread");
            handles.push(handle);
        }
        {
            // The dispatcher needs the Arc itself for handshake admission.
            let peer = Arc::clone(self);
            let handle = thread::Builder::new()
                .name("peer-dispatch".to_owned())
                .spawn(move || peer.dispatch_loop())
                .expect("failed to spawn peer worker thread");
            handles.push(handle);
        }

        let peer = Arc::clone(self);
        thread::Builder::new()
            .name("peer-super".to_owned())
            .spawn(move || {
                for handle in handles {
                    let _ = handle.join();
                }
                peer.tear_down();
            })
            .expect("failed to spawn peer supervisor thread");

        self.send_verify();
    }

    /// Request teardown: close the socket to interrupt the blocked reader
    /// and drop the shutdown sender to wake every worker. Idempotent.
    pub(crate) fn trigger_shutdown(&self) {
        self.set_state(PeerState::Disconnected);
        if let Some(conn) = self.conn.lock().as_ref() {
            conn.close();
        }
        let _ = self.shutdown_tx.lock().take();
    }

    /// Queue a message for the writer. No-op once disconnected; never
    /// blocks past shutdown.
    pub(crate) fn send_message(&self, message: Message) {
        if self.state() == PeerState::Disconnected {
            return;
        }
        select! {
            send(self.outbound_tx, message) -> _ => {}
            recv(self.shutdown_rx) -> _ => {}
        }
    }

    /// Register a pending cross-peer GET and send the request.
    pub(crate) fn get_data(&self, key: &str, pending_key: &str, reply: Sender<Vec<u8>>) {
        if self.state() == PeerState::Disconnected {
            return;
        }
        self.pending_get
            .lock()
            .insert(pending_key.to_owned(), reply);
        self.send_message(Message::GetReq {
            key: key.to_owned(),
            pending_key: pending_key.to_owned(),
        });
    }

    /// Drop a pending GET entry once the caller stops waiting.
    pub(crate) fn forget_pending(&self, pending_key: &str) {
        self.pending_get.lock().remove(pending_key);
    }

    fn node_is_gone(&self) -> bool {
        match self.node.upgrade() {
            Some(node) => node.is_shut_down(),
            None => true,
        }
    }

    fn send_verify(&self) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        self.send_message(Message::Verify {
            id: node.id().to_owned(),
            service_port: node.local_port().to_string(),
            mode: node.mode_byte(),
        });
    }

    // Blocking socket reads: 6-byte header, then the body, then framing
    // into the inbound queue. Any read error ends the connection.
    fn reader_loop(&self) {
        let Some(conn) = self.conn.lock().clone() else {
            return;
        };
        let mut header = [0u8; HEADER_SIZE];
        loop {
            match self.state() {
                PeerState::Connected | PeerState::Handshake => {}
                _ => break,
            }
            if conn.read_exact(&mut header).is_err() {
                info!(peer = %self.id(), "remote peer has disconnected");
                break;
            }
            let payload = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
            let code = u16::from_le_bytes(header[4..6].try_into().unwrap());
            if payload < 2 || payload - 2 > MAX_BODY_SIZE {
                warn!(peer = %self.id(), payload, "malformed frame length");
                break;
            }
            let mut body = vec![0u8; payload - 2];
            if !body.is_empty() && conn.read_exact(&mut body).is_err() {
                info!(peer = %self.id(), "remote peer has disconnected");
                break;
            }
            match Message::decode_body(code, &body) {
                Ok(message) => self.queue_inbound(message),
                Err(ParseError::UnknownCode(code)) => {
                    self.metrics.dropped_messages.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %self.id(), code, "dropped message with unknown code");
                }
                Err(error) => {
                    warn!(peer = %self.id(), %error, code = Message::code_name(code), "protocol error");
                    break;
                }
            }
        }
        debug!(peer = %self.id(), "reader loop terminated");
        self.trigger_shutdown();
    }

    // While in handshake only VERIFY and VERIFY_OK are accepted; everything
    // else is dropped and counted.
    fn queue_inbound(&self, message: Message) {
        if self.state() == PeerState::Handshake
            && !matches!(message, Message::Verify { .. } | Message::VerifyOk)
        {
            self.metrics.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.state() == PeerState::Disconnected {
            return;
        }
        select! {
            send(self.inbound_tx, message) -> _ => {}
            recv(self.shutdown_rx) -> _ => {}
        }
    }

    fn writer_loop(&self) {
        let Some(conn) = self.conn.lock().clone() else {
            return;
        };
        let mut buf = BytesMut::new();
        loop {
            select! {
                recv(self.shutdown_rx) -> _ => break,
                recv(self.outbound_rx) -> message => {
                    let Ok(message) = message else { break };
                    if self.state() == PeerState::Disconnected {
                        continue;
                    }
                    buf.clear();
                    message.encode(&mut buf);
                    if let Err(error) = conn.send_all(&buf) {
                        warn!(peer = %self.id(), %error, "send failed");
                        break;
                    }
                }
            }
        }
        debug!(peer = %self.id(), "writer loop terminated");
        self.trigger_shutdown();
    }

    fn dispatch_loop(self: Arc<Self>) {
        loop {
            select! {
                recv(self.shutdown_rx) -> _ => break,
                recv(self.inbound_rx) -> message => {
                    let Ok(message) = message else { break };
                    if self.state() == PeerState::Disconnected {
                        continue;
                    }
                    if !self.handle_message(message) {
                        break;
                    }
                }
            }
        }
        debug!(peer = %self.id(), "dispatch loop terminated");
        self.trigger_shutdown();
    }

    fn ping_ticker_loop(&self) {
        let interval = Duration::from_secs(self.config.lock().ping_interval);
        let ticker = tick(interval);
        self.arm_watcher();
        self.send_message(Message::Ping);
        loop {
            select! {
                recv(self.shutdown_rx) -> _ => break,
                recv(ticker) -> _ => {
                    self.metrics.ping_sent.fetch_add(1, Ordering::Relaxed);
                    self.arm_watcher();
                    self.send_message(Message::Ping);
                }
            }
        }
        debug!(peer = %self.id(), "ping ticker terminated");
    }

    fn arm_watcher(&self) {
        let _ = self.arm_tx.try_send(());
    }

    fn ping_watcher_loop(&self) {
        let timeout = Duration::from_secs(self.config.lock().ping_timeout);
        let threshold = self.config.lock().ping_failure_threshold;
        'outer: loop {
            select! {
                recv(self.shutdown_rx) -> _ => break 'outer,
                recv(self.arm_rx) -> armed => {
                    if armed.is_err() {
                        break 'outer;
                    }
                    select! {
                        recv(self.shutdown_rx) -> _ => break 'outer,
                        recv(self.pong_rx) -> _ => {}
                        recv(after(timeout)) -> _ => {
                            if self.state() == PeerState::Handshake {
                                warn!(peer = %self.id(), "remote peer not verified, therefore ping failing");
                            } else {
                                warn!(peer = %self.id(), "no ping response within configured time frame");
                            }
                            let failures = self.ping_failures.fetch_add(1, Ordering::Relaxed) + 1;
                            if failures >= threshold {
                                warn!(peer = %self.id(), failures, "shutting down connection, no ping response");
                                self.trigger_shutdown();
                                break 'outer;
                            }
                        }
                    }
                }
            }
        }
        debug!(peer = %self.id(), "ping watcher terminated");
    }

    /// Runs after every worker has exited; exactly once per connection.
    fn tear_down(&self) {
        self.set_state(PeerState::Disconnected);
        let config = self.config.lock().clone();
        if let Some(node) = self.node.upgrade() {
            node.peer_disconnected(self);
            if config.reconnect_on_disconnect {
                node.enqueue_join(ProposedPeer {
                    id: config.id.clone(),
                    ip_address: config.ip_address.clone(),
                });
            }
        }
        self.pending_get.lock().clear();
        info!(peer = %config.id, "remote peer completely shut down");
    }

    /// Returns false when the connection must be torn down (handshake
    /// rejection or a vanished parent node).
    fn handle_message(self: &Arc<Self>, message: Message) -> bool {
        match message {
            Message::Verify {
                id,
                service_port,
                mode,
            } => self.handle_verify(id, service_port, mode),
            Message::VerifyOk => {
                self.handle_verify_ok();
                true
            }
            Message::Ping => {
                self.metrics.ping_received.fetch_add(1, Ordering::Relaxed);
                self.send_message(Message::Pong);
                self.metrics.pong_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Message::Pong => {
                self.metrics.pong_received.fetch_add(1, Ordering::Relaxed);
                self.ping_failures.store(0, Ordering::Relaxed);
                let _ = self.pong_tx.try_send(());
                true
            }
            Message::SyncReq { mode } => {
                self.send_sync_response(mode);
                true
            }
            Message::SyncRsp {
                replication_factor,
                peers,
            } => {
                let Some(node) = self.node.upgrade() else {
                    return false;
                };
                node.set_replication_factor(replication_factor);
                for peer in peers {
                    node.enqueue_join(peer);
                }
                true
            }
            Message::Put { key, expiry, value } => {
                let Some(node) = self.node.upgrade() else {
                    return false;
                };
                if let Some(cache) = node.cache() {
                    if let Err(error) = cache.set_absolute(&key, &value, expiry) {
                        warn!(peer = %self.id(), %key, %error, "replicated put failed");
                    }
                }
                true
            }
            Message::Del { key } => {
                let Some(node) = self.node.upgrade() else {
                    return false;
                };
                if let Some(cache) = node.cache() {
                    let _ = cache.delete(&key);
                }
                true
            }
            Message::GetReq { key, pending_key } => {
                let Some(node) = self.node.upgrade() else {
                    return false;
                };
                let value = node
                    .cache()
                    .and_then(|cache| cache.get(&key).ok())
                    .unwrap_or_default();
                self.send_message(Message::GetRsp { pending_key, value });
                true
            }
            Message::GetRsp { pending_key, value } => {
                self.handle_get_response(pending_key, value);
                true
            }
        }
    }

    /// Adopt the remote side's identity and seek the node's admission.
    fn handle_verify(self: &Arc<Self>, id: String, service_port: String, mode: u8) -> bool {
        let Some(node) = self.node.upgrade() else {
            return false;
        };

        {
            let mut config = self.config.lock();
            config.id = id.clone();
            config.service_port = service_port.clone();
            // Recompose the dial-back address from the socket's remote host
            // and the advertised listener port, so reconnects target the
            // listener rather than an ephemeral port.
            if let (Some(conn), Ok(port)) =
                (self.conn.lock().as_ref(), service_port.parse::<u16>())
            {
                if let Ok(addr) = conn.peer_addr() {
                    config.ip_address = std::net::SocketAddr::new(addr.ip(), port).to_string();
                }
            }
        }
        self.mode.store(mode, Ordering::Relaxed);

        if mode == MODE_PASSIVE && node.mode_byte() == MODE_PASSIVE {
            warn!(
                local = node.id(),
                remote = %id,
                "both nodes are passive, shutting down the connection"
            );
            return false;
        }

        if !node.verify_peer(self) {
            warn!(peer = %id, "node already has this remote peer, shutting down new connection");
            return false;
        }

        if mode == MODE_PASSIVE {
            // Passive peers pick their own reconnects; do not chase them.
            self.config.lock().reconnect_on_disconnect = false;
        }

        self.set_state(PeerState::Connected);
        self.send_message(Message::VerifyOk);
        true
    }

    /// The remote side acknowledged our VERIFY. Wait (bounded) for our own
    /// admission of the remote to land, then request a topology sync if
    /// this peer was joined with sync enabled.
    fn handle_verify_ok(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        thread::Builder::new()
            .name("peer-sync".to_owned())
            .spawn(move || {
                let mut waited = 0u32;
                while peer.state() == PeerState::Handshake {
                    thread::sleep(Duration::from_secs(1));
                    waited += 1;
                    if waited >= HANDSHAKE_WAIT_SECS {
                        warn!(
                            peer = %peer.id(),
                            "peer state refused to change out of handshake"
                        );
                        break;
                    }
                }
                if waited < HANDSHAKE_WAIT_SECS && peer.config.lock().sync {
                    if let Some(node) = peer.node.upgrade() {
                        peer.send_message(Message::SyncReq {
                            mode: node.mode_byte(),
                        });
                    }
                }
            })
            .expect("failed to spawn peer sync thread");
    }

    fn send_sync_response(&self, requester_mode: u8) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let peers = node.peer_list(&self.id(), requester_mode);
        if !peers.is_empty() {
            self.send_message(Message::SyncRsp {
                replication_factor: node.replication_factor(),
                peers,
            });
        }
    }

    fn handle_get_response(&self, pending_key: String, value: Vec<u8>) {
        let Some(reply) = self.pending_get.lock().remove(&pending_key) else {
            debug!(
                peer = %self.id(),
                %pending_key, "get response without a pending request"
            );
            return;
        };
        if value.is_empty() {
            // Peer miss; some other peer may still resolve the waiter.
            return;
        }
        // First reply wins: the reply channel holds one slot and later
        // sends simply fail.
        let _ = reply.try_send(value);
    }
}
