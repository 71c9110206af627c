//! # Connection and RPC Manager
//!
//! This module owns every live peer session and turns inbound transmissions
//! into calls on the DHT, the broadcast engine and the application.
//!
//! ## Architecture
//!
//! - [`RpcNode`]: cheap-to-clone handle over the session table, pending
//!   requests and the local keypair. Implements [`DhtRpc`].
//! - [`Dispatcher`]: bundles the RPC handle with the DHT, broadcast engine,
//!   CUSTOM handlers and the delivery channel.
//! - [`handle_connection`]: one task per connection running the state machine
//!   below; its writer half is a [`PeerLink`].
//!
//! ## Connection State Machine
//!
//! ```text
//! Connecting ──► OptionNegotiation ──► Established ──► Disconnected
//!                       │                                  ▲
//!                       └────────── subnet mismatch ───────┘
//! ```
//!
//! Both sides open with SET_CONNECTION_OPT for Subnet, Compression and, if
//! configured, Preferred Compression. A matching Subnet binds the sender as
//! the link peer and establishes the session. A mismatch is answered with a
//! NACK and the connection is dropped.
//!
//! ## Inbound Pipeline
//!
//! | Step | Failure |
//! |------|---------|
//! | decode transmission | drop transmission |
//! | verify signature | silent drop |
//! | known opcode | NACK `[op, "unknown opcode"]` |
//! | state gate | drop |
//! | decrypt | silent drop |
//! | decode payload | drop |
//! | dispatch | NACK where the opcode defines one |
//!
//! ## Requests
//!
//! ACK/NACK payloads echo the request opcode but carry no request id, so
//! outstanding requests are matched first-in first-out per `(peer, opcode)`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::broadcast::{BroadcastDecision, BroadcastEngine};
use crate::compression::CompressionRegistry;
use crate::config::{NodeConfig, OptionError, Subnet, WhisperRouting};
use crate::crypto::{decrypt_if_needed, key_change_proof, verify, verify_key_change};
use crate::dht::{DhtConfig, DhtNode, EntryMetadata, distance};
use crate::identity::{Address, Contact, Keypair, RoutingKey, SIGNATURE_LEN, distance_cmp};
use crate::messages::{
    ConnectionOption, Delivery, Opcode, Reply, UnknownOpcode, Value, arg_address, arg_bytes,
    arg_text, arg_u64, args, decode_payload, fresh_nonce, reply_payload,
};
use crate::protocols::{CustomHandler, DhtRpc, FindValueReply};
use crate::transport::{PeerLink, read_transmission};
use crate::wire::{RawMessage, decode_transmission, encode_message, encode_transmission};

/// Contacts accepted from a single FIND_NODE or FIND_VALUE reply.
const MAX_CONTACTS_PER_RESPONSE: usize = 100;

/// Deliveries buffered for the application before new ones are dropped.
const DELIVERY_CHANNEL_CAPACITY: usize = 1024;

const DIAL_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Sessions
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    /// Dialed by this node; counts against the outward limit ℓ.
    Outward,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    OptionNegotiation,
    Established,
    Disconnected,
}

#[derive(Clone, Debug, Default)]
struct PeerOptions {
    send_compression: u8,
    /// Set by Preferred Compression; wins over the Compression list.
    remote_preferred: Option<u8>,
}

#[derive(Clone)]
struct PeerHandle {
    link: PeerLink,
    options: Arc<Mutex<PeerOptions>>,
    direction: Direction,
    endpoint: Option<String>,
}

/// A snapshot of one established session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: Address,
    pub direction: Direction,
    pub endpoint: Option<String>,
    pub send_compression: u8,
}

/// Asks the dial service to open an outward connection.
pub struct DialRequest {
    pub endpoint: String,
    pub reply: oneshot::Sender<Result<Address>>,
}

type PendingReplies = HashMap<(Address, u8), VecDeque<oneshot::Sender<Reply>>>;

struct RpcShared {
    keypair: RwLock<Keypair>,
    config: NodeConfig,
    registry: CompressionRegistry,
    sessions: RwLock<HashMap<Address, PeerHandle>>,
    pending: Mutex<PendingReplies>,
    dialing: Mutex<usize>,
    dial_tx: mpsc::Sender<DialRequest>,
    local_endpoint: RwLock<Option<String>>,
    shutdown: watch::Sender<bool>,
}

/// Handle over sessions, pending requests and the local identity.
#[derive(Clone)]
pub struct RpcNode {
    shared: Arc<RpcShared>,
}

impl RpcNode {
    pub fn new(keypair: Keypair, config: NodeConfig) -> (Self, mpsc::Receiver<DialRequest>) {
        Self::with_registry(keypair, config, CompressionRegistry::default())
    }

    pub fn with_registry(
        keypair: Keypair,
        config: NodeConfig,
        registry: CompressionRegistry,
    ) -> (Self, mpsc::Receiver<DialRequest>) {
        let (dial_tx, dial_rx) = mpsc::channel(DIAL_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let local_endpoint = config.advertised_endpoint.clone();
        let node = Self {
            shared: Arc::new(RpcShared {
                keypair: RwLock::new(keypair),
                config,
                registry,
                sessions: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                dialing: Mutex::new(0),
                dial_tx,
                local_endpoint: RwLock::new(local_endpoint),
                shutdown,
            }),
        };
        (node, dial_rx)
    }

    pub fn address(&self) -> Address {
        self.shared.keypair.read().address()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &CompressionRegistry {
        &self.shared.registry
    }

    pub fn local_endpoint(&self) -> Option<String> {
        self.shared.local_endpoint.read().clone()
    }

    pub fn set_local_endpoint(&self, endpoint: String) {
        let mut current = self.shared.local_endpoint.write();
        if current.is_none() {
            *current = Some(endpoint);
        }
    }

    /// Sign (and optionally seal) a message with the current keypair.
    pub fn encode(
        &self,
        to: &Address,
        opcode: Opcode,
        payload: &Value,
        encrypted: bool,
    ) -> Result<Vec<u8>> {
        let keypair = self.shared.keypair.read();
        Ok(encode_message(to, opcode, payload, &keypair, encrypted)?)
    }

    fn replace_keypair(&self, keypair: Keypair) {
        *self.shared.keypair.write() = keypair;
    }

    fn decrypt(&self, raw: &RawMessage) -> Result<Vec<u8>, crate::crypto::AuthError> {
        let keypair = self.shared.keypair.read();
        decrypt_if_needed(raw, &keypair)
    }

    // ------------------------------------------------------------------------
    // Session table
    // ------------------------------------------------------------------------

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared
            .sessions
            .read()
            .iter()
            .map(|(address, handle)| PeerInfo {
                address: *address,
                direction: handle.direction,
                endpoint: handle.endpoint.clone(),
                send_compression: handle.options.lock().send_compression,
            })
            .collect()
    }

    pub fn connected_peers(&self) -> Vec<Address> {
        self.shared.sessions.read().keys().copied().collect()
    }

    pub fn is_connected(&self, peer: &Address) -> bool {
        self.shared.sessions.read().contains_key(peer)
    }

    pub fn outward_count(&self) -> usize {
        self.shared
            .sessions
            .read()
            .values()
            .filter(|h| h.direction == Direction::Outward)
            .count()
    }

    /// Returns false if `address` already has a live session that wins.
    ///
    /// When both sides dial each other at once, the connection dialed by the
    /// lower address survives on both ends.
    fn register_session(&self, address: Address, handle: PeerHandle) -> bool {
        let preferred = if self.address() < address {
            Direction::Outward
        } else {
            Direction::Inbound
        };
        let mut sessions = self.shared.sessions.write();
        if let Some(existing) = sessions.get(&address)
            && !existing.link.is_closed()
        {
            if handle.direction != preferred || existing.direction == preferred {
                return false;
            }
            existing.link.close();
        }
        sessions.insert(address, handle);
        true
    }

    fn unregister_session(&self, link_id: u64) -> Option<Address> {
        let mut sessions = self.shared.sessions.write();
        let address = sessions
            .iter()
            .find(|(_, h)| h.link.id() == link_id)
            .map(|(a, _)| *a)?;
        sessions.remove(&address);
        Some(address)
    }

    /// Current address bound to a connection, following key changes.
    fn address_of_session(&self, link_id: u64) -> Option<Address> {
        self.shared
            .sessions
            .read()
            .iter()
            .find(|(_, h)| h.link.id() == link_id)
            .map(|(a, _)| *a)
    }

    /// Move a session to a new address after CHANGE_KEY.
    fn rebind(&self, old: &Address, new: Address) -> bool {
        let mut sessions = self.shared.sessions.write();
        if sessions.contains_key(&new) {
            return false;
        }
        match sessions.remove(old) {
            Some(handle) => {
                sessions.insert(new, handle);
                true
            }
            None => false,
        }
    }

    /// Close the session with `peer`. Queued transmissions are flushed first.
    pub fn disconnect(&self, peer: &Address) -> bool {
        match self.shared.sessions.read().get(peer) {
            Some(handle) => {
                handle.link.close();
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        for handle in self.shared.sessions.read().values() {
            handle.link.close();
        }
    }

    fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send an already encoded message over the session with `peer`.
    pub async fn forward_encoded(&self, peer: &Address, message: &[u8]) -> Result<()> {
        let handle = self
            .shared
            .sessions
            .read()
            .get(peer)
            .cloned()
            .ok_or_else(|| anyhow!("peer {peer} not connected"))?;
        let compression = handle.options.lock().send_compression;
        let transmission = encode_transmission(&self.shared.registry, compression, &[message])?;
        handle
            .link
            .send(transmission)
            .await
            .with_context(|| format!("link to {peer} closed"))
    }

    /// Send an unencrypted message addressed to `peer`.
    pub async fn send(&self, peer: &Address, opcode: Opcode, items: Vec<Value>) -> Result<()> {
        let message = self.encode(peer, opcode, &Value::Array(items), false)?;
        self.forward_encoded(peer, &message).await
    }

    /// Send a request and wait for the matching ACK or NACK.
    pub async fn request(
        &self,
        peer: &Address,
        opcode: Opcode,
        items: Vec<Value>,
    ) -> Result<Reply> {
        let message = self.encode(peer, opcode, &Value::Array(items), false)?;
        self.request_encoded(peer, opcode, &message).await
    }

    /// Like [`RpcNode::request`] for a message that is already signed.
    pub async fn request_encoded(
        &self,
        peer: &Address,
        opcode: Opcode,
        message: &[u8],
    ) -> Result<Reply> {
        let key = (*peer, opcode.code());
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().entry(key).or_default().push_back(tx);

        if let Err(e) = self.forward_encoded(peer, message).await {
            self.prune_pending(&key);
            return Err(e);
        }

        match tokio::time::timeout(self.shared.config.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => bail!("peer {peer} disconnected before replying"),
            Err(_) => {
                self.prune_pending(&key);
                bail!("request {opcode:?} to {peer} timed out")
            }
        }
    }

    fn prune_pending(&self, key: &(Address, u8)) {
        let mut pending = self.shared.pending.lock();
        if let Some(queue) = pending.get_mut(key) {
            queue.retain(|waiter| !waiter.is_closed());
            if queue.is_empty() {
                pending.remove(key);
            }
        }
    }

    /// Hand a reply to the oldest waiting request. Returns false if nobody waits.
    pub fn resolve(&self, from: &Address, reply: Reply) -> bool {
        let Some(echo) = reply.echoed_opcode() else {
            return false;
        };
        let key = (*from, echo);
        let mut pending = self.shared.pending.lock();
        let Some(queue) = pending.get_mut(&key) else {
            return false;
        };
        let mut reply = reply;
        let delivered = loop {
            match queue.pop_front() {
                Some(waiter) => match waiter.send(reply) {
                    Ok(()) => break true,
                    Err(returned) => reply = returned,
                },
                None => break false,
            }
        };
        if queue.is_empty() {
            pending.remove(&key);
        }
        delivered
    }

    /// Cancel every request waiting on `peer`.
    pub fn fail_pending(&self, peer: &Address) {
        self.shared.pending.lock().retain(|(address, _), _| address != peer);
    }

    // ------------------------------------------------------------------------
    // Dialing
    // ------------------------------------------------------------------------

    /// Open an outward connection, honoring the outward limit ℓ.
    pub async fn dial_outward(&self, endpoint: &str) -> Result<Address> {
        let ell = self.shared.config.subnet.ell as usize;
        {
            let mut dialing = self.shared.dialing.lock();
            if self.outward_count() + *dialing >= ell {
                bail!("outward connection limit of {ell} reached");
            }
            *dialing += 1;
        }

        let (reply, rx) = oneshot::channel();
        let request = DialRequest {
            endpoint: endpoint.to_string(),
            reply,
        };
        let result = match self.shared.dial_tx.send(request).await {
            Ok(()) => rx.await.unwrap_or_else(|_| Err(anyhow!("dial service stopped"))),
            Err(_) => Err(anyhow!("dial service stopped")),
        };

        *self.shared.dialing.lock() -= 1;
        result
    }

    /// Make sure a session with `contact` exists, dialing it if needed.
    pub async fn ensure_connected(&self, contact: &Contact) -> Result<()> {
        if self.is_connected(&contact.address) {
            return Ok(());
        }
        if contact.address == self.address() {
            bail!("refusing to connect to self");
        }
        let endpoint = contact
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("no endpoint known for {}", contact.address))?;
        let address = self.dial_outward(endpoint).await?;
        if address != contact.address {
            bail!("{endpoint} answered as {address}, expected {}", contact.address);
        }
        Ok(())
    }
}

fn parse_contacts(value: Option<&Value>) -> Result<Vec<Contact>> {
    let entries = value
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("reply carries no contact list"))?;
    Ok(entries
        .iter()
        .filter_map(Contact::from_value)
        .take(MAX_CONTACTS_PER_RESPONSE)
        .collect())
}

#[async_trait]
impl DhtRpc for RpcNode {
    async fn ping(&self, to: &Contact) -> Result<()> {
        self.ensure_connected(to).await?;
        self.request(&to.address, Opcode::Ping, Vec::new())
            .await?
            .into_ack()
            .map(|_| ())
    }

    async fn find_node(&self, to: &Contact, target: RoutingKey) -> Result<Vec<Contact>> {
        self.ensure_connected(to).await?;
        let items = self
            .request(
                &to.address,
                Opcode::FindNode,
                vec![Value::Bytes(target.as_bytes().to_vec())],
            )
            .await?
            .into_ack()?;
        parse_contacts(items.get(2))
    }

    async fn find_value(&self, to: &Contact, key: &str) -> Result<FindValueReply> {
        self.ensure_connected(to).await?;
        let items = self
            .request(&to.address, Opcode::FindValue, vec![Value::Text(key.to_string())])
            .await?
            .into_ack()?;
        match items.get(3) {
            Some(Value::Map(_)) => {
                let metadata = items
                    .get(3)
                    .and_then(EntryMetadata::from_value)
                    .ok_or_else(|| anyhow!("malformed entry metadata"))?;
                let value = items.get(2).cloned().unwrap_or(Value::Null);
                Ok(FindValueReply::Found { value, metadata })
            }
            other => Ok(FindValueReply::Closer(parse_contacts(other)?)),
        }
    }

    async fn store(&self, to: &Contact, key: &str, value: Value) -> Result<()> {
        self.ensure_connected(to).await?;
        let owner = self.address();
        self.request(
            &to.address,
            Opcode::Store,
            vec![owner.to_value(), Value::Text(key.to_string()), value],
        )
        .await?
        .into_ack()
        .map(|_| ())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// CUSTOM handlers keyed by sub-opcode.
#[derive(Clone, Default)]
pub struct CustomHandlers {
    handlers: Arc<RwLock<HashMap<u64, Arc<dyn CustomHandler>>>>,
}

impl CustomHandlers {
    /// Register a handler, replacing any previous one for `sub_opcode`.
    pub fn register(&self, sub_opcode: u64, handler: Arc<dyn CustomHandler>) -> bool {
        self.handlers.write().insert(sub_opcode, handler).is_some()
    }

    pub fn unregister(&self, sub_opcode: u64) -> bool {
        self.handlers.write().remove(&sub_opcode).is_some()
    }

    pub fn get(&self, sub_opcode: u64) -> Option<Arc<dyn CustomHandler>> {
        self.handlers.read().get(&sub_opcode).cloned()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    rpc: RpcNode,
    dht: DhtNode<RpcNode>,
    broadcast: Arc<BroadcastEngine>,
    custom: CustomHandlers,
    deliveries: mpsc::Sender<Delivery>,
}

impl Dispatcher {
    /// Build the RPC handle, DHT and broadcast engine for one node.
    pub fn new(
        keypair: Keypair,
        config: NodeConfig,
    ) -> (Self, mpsc::Receiver<Delivery>, mpsc::Receiver<DialRequest>) {
        let broadcast = Arc::new(BroadcastEngine::from_config(&config));
        let dht_config = DhtConfig::from_node_config(&config);
        let address = keypair.address();
        let (rpc, dial_rx) = RpcNode::new(keypair, config);
        let dht = DhtNode::new(address, rpc.clone(), dht_config);
        let (deliveries, delivery_rx) = mpsc::channel(DELIVERY_CHANNEL_CAPACITY);
        let dispatcher = Self {
            rpc,
            dht,
            broadcast,
            custom: CustomHandlers::default(),
            deliveries,
        };
        (dispatcher, delivery_rx, dial_rx)
    }

    pub fn rpc(&self) -> &RpcNode {
        &self.rpc
    }

    pub fn dht(&self) -> &DhtNode<RpcNode> {
        &self.dht
    }

    pub fn custom(&self) -> &CustomHandlers {
        &self.custom
    }

    /// Connect over TCP and wait for option negotiation to finish.
    pub async fn dial(&self, endpoint: &str) -> Result<Address> {
        let timeout = self.rpc.config().request_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| anyhow!("connecting to {endpoint} timed out"))?
            .with_context(|| format!("failed to connect to {endpoint}"))?;
        let _ = stream.set_nodelay(true);

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(handle_connection(
            self.clone(),
            stream,
            Direction::Outward,
            Some(endpoint.to_string()),
            Some(ready_tx),
        ));

        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => bail!("connection to {endpoint} closed during negotiation"),
            Err(_) => bail!("option negotiation with {endpoint} timed out"),
        }
    }

    fn deliver(&self, delivery: Delivery) {
        if let Err(e) = self.deliveries.try_send(delivery) {
            warn!(error = %e, "delivery channel full, dropping message");
        }
    }

    /// Originate a broadcast. Returns the number of peers it was sent to.
    pub async fn originate(&self, opcode: Opcode, mut items: Vec<Value>) -> Result<usize> {
        items.push(fresh_nonce());
        let message = self
            .rpc
            .encode(&Address::BROADCAST, opcode, &Value::Array(items), false)?;
        let peers = self.rpc.connected_peers();
        let targets = self.broadcast.originate(&message[..SIGNATURE_LEN], &peers);
        Ok(self.relay(&message, &targets).await)
    }

    async fn relay(&self, message: &[u8], targets: &[Address]) -> usize {
        let mut sent = 0;
        for peer in targets {
            match self.rpc.forward_encoded(peer, message).await {
                Ok(()) => sent += 1,
                Err(e) => trace!(peer = %peer, error = %e, "relay failed"),
            }
        }
        sent
    }

    /// Announce our endpoint to the whole mesh.
    pub async fn announce(&self) -> Result<usize> {
        let items = announce_items(&self.rpc);
        self.originate(Opcode::Announce, items).await
    }

    /// Send a WHISPER to `to`, routing it if there is no direct session.
    pub async fn whisper(&self, to: &Address, body: Value) -> Result<()> {
        let encrypted = self.rpc.config().encrypt_whispers;
        let message = self
            .rpc
            .encode(to, Opcode::Whisper, &Value::Array(vec![body]), encrypted)?;

        if self.rpc.is_connected(to) {
            return self
                .rpc
                .request_encoded(to, Opcode::Whisper, &message)
                .await?
                .into_ack()
                .map(|_| ());
        }

        self.broadcast.should_forward_whisper(&message[..SIGNATURE_LEN]);
        self.route_whisper(*to, message, None).await
    }

    /// Move a WHISPER one hop closer to `to`.
    async fn route_whisper(
        &self,
        to: Address,
        message: Vec<u8>,
        link_peer: Option<Address>) -> Result<()> {
        if self.rpc.is_connected(&to) {
            return self.rpc.forward_encoded(&to, &message).await;
        }

        if self.rpc.config().whisper_routing == WhisperRouting::Iterative {
            let found = self
                .dht
                .iterative_find_node(to.routing_key())
                .await
                .unwrap_or_default();
            if let Some(contact) = found.iter().find(|c| c.address == to) {
                match self.rpc.ensure_connected(contact).await {
                    Ok(()) => return self.rpc.forward_encoded(&to, &message).await,
                    Err(e) => debug!(target = %to, error = %e, "could not dial whisper target"),
                }
            }
        }

        let next = self
            .closest_connected_towards(&to, link_peer.as_ref())
            .ok_or_else(|| anyhow!("no connected peer is closer to {to}"))?;
        trace!(target = %to, via = %next, "forwarding whisper");
        self.rpc.forward_encoded(&next, &message).await
    }

    /// The connected peer strictly closer to `target` than this node.
    fn closest_connected_towards(
        &self,
        target: &Address,
        exclude: Option<&Address>,
    ) -> Option<Address> {
        let tau = self.rpc.config().subnet.tau as usize;
        let target_key = target.routing_key();
        let own = distance(&self.rpc.address().routing_key(), &target_key, tau);
        self.rpc
            .connected_peers()
            .into_iter()
            .filter(|peer| Some(peer) != exclude)
            .map(|peer| (distance(&peer.routing_key(), &target_key, tau), peer))
            .filter(|(d, _)| distance_cmp(d, &own) == std::cmp::Ordering::Less)
            .min_by(|(a, _), (b, _)| distance_cmp(a, b))
            .map(|(_, peer)| peer)
    }

    /// Replace the local keypair and tell the mesh.
    pub async fn change_key(&self, new_keypair: Keypair) -> Result<usize> {
        let old = self.rpc.address();
        let new = new_keypair.address();
        let proof = key_change_proof(&new_keypair, &old);
        let sent = self
            .originate(
                Opcode::ChangeKey,
                vec![new.to_value(), Value::Bytes(proof.to_vec())],
            )
            .await?;

        self.rpc.replace_keypair(new_keypair);
        let dropped = self.dht.rekey(new).await?;
        info!(old = %old, new = %new, peers_notified = sent, "local key changed");
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "contacts no longer fit after rekey");
            self.dht.remember_nodes(dropped).await;
        }
        Ok(sent)
    }

    /// Dial cached contacts until one connects or the cache runs dry.
    fn spawn_refill(&self) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(contact) = dispatcher.dht.take_cached_node().await {
                match dispatcher.rpc.ensure_connected(&contact).await {
                    Ok(()) => {
                        debug!(peer = %contact.address, "refilled outward connection");
                        break;
                    }
                    Err(e) => trace!(peer = %contact.address, error = %e, "refill dial failed"),
                }
            }
        });
    }
}

fn announce_items(rpc: &RpcNode) -> Vec<Value> {
    vec![
        rpc.address().to_value(),
        match rpc.local_endpoint() {
            Some(endpoint) => Value::Text(endpoint),
            None => Value::Null,
        },
    ]
}

/// Serve dial requests from [`RpcNode::dial_outward`].
pub fn spawn_dial_service(
    dispatcher: Dispatcher,
    mut dial_rx: mpsc::Receiver<DialRequest>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = dial_rx.recv().await {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let result = dispatcher.dial(&request.endpoint).await;
                if let Err(ref e) = result {
                    debug!(endpoint = %request.endpoint, error = %e, "dial failed");
                }
                let _ = request.reply.send(result);
            });
        }
    })
}

// ============================================================================
// Connection Handling
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Disconnect,
}

struct Connection {
    state: ConnectionState,
    link: PeerLink,
    options: Arc<Mutex<PeerOptions>>,
    direction: Direction,
    endpoint: Option<String>,
    ready: Option<oneshot::Sender<Result<Address>>>,
}

/// Drive one connection from negotiation to teardown.
pub async fn handle_connection<S>(
    dispatcher: Dispatcher,
    stream: S,
    direction: Direction,
    endpoint: Option<String>,
    ready: Option<oneshot::Sender<Result<Address>>>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let link = PeerLink::spawn(writer);
    let mut conn = Connection {
        state: ConnectionState::Connecting,
        link: link.clone(),
        options: Arc::new(Mutex::new(PeerOptions::default())),
        direction,
        endpoint,
        ready,
    };
    let mut shutdown = dispatcher.rpc.subscribe_shutdown();
    let max_size = dispatcher.rpc.config().max_transmission_size;

    conn.state = ConnectionState::OptionNegotiation;
    if let Err(e) = conn.send_options(&dispatcher).await {
        debug!(error = %e, "failed to send connection options");
        conn.teardown(&dispatcher, Some(e)).await;
        return;
    }

    let mut failure = None;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = link.closed() => break,
            read = read_transmission(&mut reader, max_size) => match read {
                Ok(Some(bytes)) => {
                    if conn.handle_transmission(&dispatcher, &bytes).await == Flow::Disconnect {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(link = link.id(), error = %e, "connection read failed");
                    failure = Some(anyhow::Error::from(e));
                    break;
                }
            },
        }
    }

    conn.teardown(&dispatcher, failure).await;
}

impl Connection {
    async fn transmit(&self, dispatcher: &Dispatcher, messages: &[Vec<u8>]) -> Result<()> {
        let compression = self.options.lock().send_compression;
        let transmission = encode_transmission(dispatcher.rpc.registry(), compression, messages)?;
        self.link.send(transmission).await.context("link closed")
    }

    async fn reply(
        &self,
        dispatcher: &Dispatcher,
        to: &Address,
        opcode: Opcode,
        items: Vec<Value>,
    ) {
        let message = match dispatcher.rpc.encode(to, opcode, &Value::Array(items), false) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "failed to encode reply");
                return;
            }
        };
        if let Err(e) = self.transmit(dispatcher, &[message]).await {
            trace!(error = %e, "failed to send reply");
        }
    }

    async fn ack(&self, dispatcher: &Dispatcher, to: &Address, echo: Opcode, rest: Vec<Value>) {
        self.reply_raw(dispatcher, to, Opcode::Ack, echo.code(), rest).await;
    }

    async fn nack(
        &self,
        dispatcher: &Dispatcher,
        to: &Address,
        echo: u8,
        mut rest: Vec<Value>,
        reason: &str,
    ) {
        rest.push(Value::Text(reason.to_string()));
        self.reply_raw(dispatcher, to, Opcode::Nack, echo, rest).await;
    }

    async fn reply_raw(
        &self,
        dispatcher: &Dispatcher,
        to: &Address,
        opcode: Opcode,
        echo: u8,
        rest: Vec<Value>,
    ) {
        let items = match reply_payload(echo, rest) {
            Value::Array(items) => items,
            other => vec![other],
        };
        self.reply(dispatcher, to, opcode, items).await;
    }

    /// Subnet, Compression and (if set) Preferred Compression in one transmission.
    async fn send_options(&self, dispatcher: &Dispatcher) -> Result<()> {
        let config = dispatcher.rpc.config();
        let accepted: Vec<Value> = config
            .accepted_compression
            .iter()
            .filter(|id| dispatcher.rpc.registry().supports(**id))
            .map(|id| Value::from(*id))
            .collect();

        let mut options = vec![
            (ConnectionOption::Subnet, config.subnet.to_value()),
            (ConnectionOption::Compression, Value::Array(accepted)),
        ];
        if let Some(preferred) = config.preferred_compression {
            options.push((ConnectionOption::PreferredCompression, Value::from(preferred)));
        }

        let mut messages = Vec::with_capacity(options.len());
        for (option, setting) in options {
            let payload = Value::Array(vec![Value::from(option.code()), setting]);
            messages.push(dispatcher.rpc.encode(
                &Address::BROADCAST,
                Opcode::SetConnectionOpt,
                &payload,
                false,
            )?);
        }
        self.transmit(dispatcher, &messages).await
    }

    async fn handle_transmission(&mut self, dispatcher: &Dispatcher, bytes: &[u8]) -> Flow {
        let max_size = dispatcher.rpc.config().max_transmission_size;
        let frames = match decode_transmission(dispatcher.rpc.registry(), bytes, max_size) {
            Ok(frames) => frames,
            Err(e) => {
                debug!(link = self.link.id(), error = %e, "dropping transmission");
                return Flow::Continue;
            }
        };

        for record in frames {
            let raw = match record {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(link = self.link.id(), error = %e, "dropping rest of transmission");
                    break;
                }
            };
            if self.handle_message(dispatcher, raw).await == Flow::Disconnect {
                return Flow::Disconnect;
            }
        }
        Flow::Continue
    }

    fn link_peer(&self, dispatcher: &Dispatcher) -> Option<Address> {
        dispatcher.rpc.address_of_session(self.link.id())
    }

    async fn handle_message(&mut self, dispatcher: &Dispatcher, raw: RawMessage) -> Flow {
        if !verify(&raw) {
            trace!(link = self.link.id(), "dropping message with bad signature");
            return Flow::Continue;
        }

        let established = self.state == ConnectionState::Established;
        let opcode = match raw.opcode() {
            Ok(opcode) => opcode,
            Err(UnknownOpcode(code)) => {
                if established {
                    self.nack(dispatcher, &raw.from, code, Vec::new(), "unknown opcode")
                        .await;
                }
                return Flow::Continue;
            }
        };

        if !established && !opcode.allowed_during_negotiation() {
            trace!(opcode = ?opcode, "dropping message before negotiation finished");
            return Flow::Continue;
        }

        let own = dispatcher.rpc.address();
        if opcode == Opcode::Whisper && raw.to != own {
            self.forward_whisper(dispatcher, raw);
            return Flow::Continue;
        }

        let plaintext = match dispatcher.rpc.decrypt(&raw) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                trace!(opcode = ?opcode, error = %e, "dropping undecryptable message");
                return Flow::Continue;
            }
        };
        let payload = match decode_payload(&plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(opcode = ?opcode, error = %e, "dropping message with bad payload");
                return Flow::Continue;
            }
        };
        let Some(items) = args(&payload) else {
            debug!(opcode = ?opcode, "dropping message whose payload is not an array");
            return Flow::Continue;
        };

        match opcode {
            Opcode::SetConnectionOpt => self.handle_option(dispatcher, &raw, items).await,
            Opcode::Ack | Opcode::Nack => {
                self.handle_reply(dispatcher, &raw, opcode, payload.clone())
            }
            Opcode::Ping => {
                self.ack(dispatcher, &raw.from, Opcode::Ping, Vec::new()).await;
                Flow::Continue
            }
            Opcode::Shout | Opcode::Speak | Opcode::Announce | Opcode::ChangeKey => {
                self.handle_broadcast(dispatcher, &raw, opcode, items).await;
                Flow::Continue
            }
            Opcode::Whisper => {
                if dispatcher.broadcast.should_forward_whisper(&raw.signature) {
                    dispatcher.deliver(Delivery {
                        opcode,
                        from: raw.from,
                        body: items.first().cloned().unwrap_or(Value::Null),
                    });
                }
                if self.link_peer(dispatcher) == Some(raw.from) {
                    self.ack(dispatcher, &raw.from, Opcode::Whisper, Vec::new()).await;
                }
                Flow::Continue
            }
            Opcode::FindNode => {
                self.handle_find_node(dispatcher, &raw, items).await;
                Flow::Continue
            }
            Opcode::FindValue => {
                self.handle_find_value(dispatcher, &raw, items).await;
                Flow::Continue
            }
            Opcode::Store => {
                self.handle_store(dispatcher, &raw, items).await;
                Flow::Continue
            }
            Opcode::Custom => {
                self.handle_custom(dispatcher, &raw, items).await;
                Flow::Continue
            }
        }
    }

    // ------------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------------

    async fn handle_option(
        &mut self,
        dispatcher: &Dispatcher,
        raw: &RawMessage,
        items: &[Value],
    ) -> Flow {
        let Some(option_code) = items.first().and_then(arg_u64) else {
            self.nack(
                dispatcher,
                &raw.from,
                Opcode::SetConnectionOpt.code(),
                Vec::new(),
                &OptionError::Malformed("option id").to_string(),
            )
            .await;
            return Flow::Continue;
        };
        let Some(option) = ConnectionOption::from_code(option_code) else {
            self.nack_option(dispatcher, raw, option_code, OptionError::UnknownOption(option_code))
                .await;
            return Flow::Continue;
        };
        let setting = items.get(1).unwrap_or(&Value::Null);

        let result = match option {
            ConnectionOption::Subnet => return self.handle_subnet(dispatcher, raw, setting).await,
            ConnectionOption::Compression => self.apply_compression_list(dispatcher, setting),
            ConnectionOption::PreferredCompression => self.apply_preferred(dispatcher, setting),
        };
        match result {
            Ok(()) => {
                self.ack(
                    dispatcher,
                    &raw.from,
                    Opcode::SetConnectionOpt,
                    vec![Value::from(option_code)],
                )
                .await;
            }
            Err(e) => self.nack_option(dispatcher, raw, option_code, e).await,
        }
        Flow::Continue
    }

    async fn nack_option(
        &self,
        dispatcher: &Dispatcher,
        raw: &RawMessage,
        option_code: u64,
        error: OptionError,
    ) {
        debug!(peer = %raw.from, option = option_code, reason = %error, "refusing option");
        self.nack(
            dispatcher,
            &raw.from,
            Opcode::SetConnectionOpt.code(),
            vec![Value::from(option_code)],
            &error.to_string(),
        )
        .await;
    }

    fn apply_compression_list(
        &self,
        dispatcher: &Dispatcher,
        setting: &Value,
    ) -> Result<(), OptionError> {
        let ids: Vec<u8> = setting
            .as_array()
            .ok_or(OptionError::Malformed("compression list"))?
            .iter()
            .filter_map(arg_u64)
            .filter_map(|id| u8::try_from(id).ok())
            .collect();
        let id = self
            .choose_compression(dispatcher, &ids)
            .ok_or(OptionError::NoCommonCompression)?;
        let mut options = self.options.lock();
        if options.remote_preferred.is_none() {
            options.send_compression = id;
        }
        Ok(())
    }

    fn apply_preferred(&self, dispatcher: &Dispatcher, setting: &Value) -> Result<(), OptionError> {
        let id = arg_u64(setting)
            .and_then(|id| u8::try_from(id).ok())
            .ok_or(OptionError::Malformed("preferred compression"))?;
        if !dispatcher.rpc.registry().supports(id) {
            return Err(OptionError::UnsupportedCompression(id));
        }
        let mut options = self.options.lock();
        options.remote_preferred = Some(id);
        options.send_compression = id;
        Ok(())
    }

    /// First of our accepted ids, in our order, that the peer can decode.
    fn choose_compression(&self, dispatcher: &Dispatcher, remote: &[u8]) -> Option<u8> {
        dispatcher
            .rpc
            .config()
            .accepted_compression
            .iter()
            .copied()
            .filter(|id| dispatcher.rpc.registry().supports(*id))
            .find(|id| remote.contains(id))
    }

    async fn handle_subnet(
        &mut self,
        dispatcher: &Dispatcher,
        raw: &RawMessage,
        setting: &Value,
    ) -> Flow {
        let echo = Opcode::SetConnectionOpt.code();
        let option_value = Value::from(ConnectionOption::Subnet.code());
        let local = &dispatcher.rpc.config().subnet;
        if let Err(e) = Subnet::from_value(setting).and_then(|remote| local.check(&remote)) {
            warn!(peer = %raw.from, reason = %e, "subnet mismatch, disconnecting");
            self.nack(dispatcher, &raw.from, echo, vec![option_value], &e.to_string())
                .await;
            self.fail_ready(anyhow::Error::from(e));
            return Flow::Disconnect;
        }

        if self.state == ConnectionState::Established {
            self.ack(dispatcher, &raw.from, Opcode::SetConnectionOpt, vec![option_value])
                .await;
            return Flow::Continue;
        }

        let peer = raw.from;
        if peer == dispatcher.rpc.address() {
            debug!("connected to self, disconnecting");
            self.fail_ready(anyhow!("connected to self"));
            return Flow::Disconnect;
        }

        let handle = PeerHandle {
            link: self.link.clone(),
            options: self.options.clone(),
            direction: self.direction,
            endpoint: self.endpoint.clone(),
        };
        if !dispatcher.rpc.register_session(peer, handle) {
            debug!(peer = %peer, "already connected, closing duplicate connection");
            if let Some(ready) = self.ready.take() {
                let _ = ready.send(Ok(peer));
            }
            return Flow::Disconnect;
        }

        self.state = ConnectionState::Established;
        self.ack(dispatcher, &peer, Opcode::SetConnectionOpt, vec![option_value])
            .await;

        let contact = Contact {
            address: peer,
            endpoint: match self.direction {
                Direction::Outward => self.endpoint.clone(),
                Direction::Inbound => None,
            },
        };
        dispatcher.dht.observe_peer(contact).await;
        info!(peer = %peer, direction = ?self.direction, "peer connected");

        if self.direction == Direction::Outward {
            let mut items = announce_items(&dispatcher.rpc);
            items.push(fresh_nonce());
            match dispatcher
                .rpc
                .encode(&peer, Opcode::Announce, &Value::Array(items), false)
            {
                Ok(message) => {
                    dispatcher.broadcast.should_relay(&message[..SIGNATURE_LEN]);
                    if let Err(e) = self.transmit(dispatcher, &[message]).await {
                        trace!(error = %e, "failed to announce to new peer");
                    }
                }
                Err(e) => debug!(error = %e, "failed to encode announce"),
            }
        }

        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(peer));
        }
        Flow::Continue
    }

    fn fail_ready(&mut self, error: anyhow::Error) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(error));
        }
    }

    fn handle_reply(
        &mut self,
        dispatcher: &Dispatcher,
        raw: &RawMessage,
        opcode: Opcode,
        payload: Value,
    ) -> Flow {
        let Some(reply) = Reply::from_payload(opcode, payload) else {
            return Flow::Continue;
        };

        let subnet_code = Value::from(ConnectionOption::Subnet.code());
        if !reply.is_ack()
            && reply.echoed_opcode() == Some(Opcode::SetConnectionOpt.code())
            && reply.items().get(1) == Some(&subnet_code)
        {
            let reason = reply.reason().unwrap_or("subnet rejected").to_string();
            warn!(peer = %raw.from, reason = %reason, "peer rejected our subnet");
            self.fail_ready(anyhow!("subnet rejected by peer: {reason}"));
            return Flow::Disconnect;
        }

        if !dispatcher.rpc.resolve(&raw.from, reply) {
            trace!(peer = %raw.from, opcode = ?opcode, "reply without pending request");
        }
        Flow::Continue
    }

    // ------------------------------------------------------------------------
    // Broadcasts and whispers
    // ------------------------------------------------------------------------

    async fn handle_broadcast(
        &self,
        dispatcher: &Dispatcher,
        raw: &RawMessage,
        opcode: Opcode,
        items: &[Value],
    ) {
        let own = dispatcher.rpc.address();
        // Validate before relaying so malformed broadcasts die here.
        let announced = match opcode {
            Opcode::Announce => {
                let contact = items
                    .get(..2)
                    .and_then(|fields| Contact::from_value(&Value::Array(fields.to_vec())));
                match contact {
                    Some(contact) if contact.address == raw.from => Some(contact),
                    _ => {
                        debug!(from = %raw.from, "dropping malformed announce");
                        return;
                    }
                }
            }
            _ => None,
        };
        let new_key = match opcode {
            Opcode::ChangeKey => {
                let new_address = items.first().and_then(arg_address);
                let proof = items.get(1).and_then(arg_bytes);
                match (new_address, proof) {
                    (Some(new_address), Some(proof))
                        if verify_key_change(&raw.from, &new_address, proof).is_ok() =>
                    {
                        Some(new_address)
                    }
                    _ => {
                        debug!(from = %raw.from, "dropping key change with invalid proof");
                        return;
                    }
                }
            }
            _ => None,
        };

        let link_peer = self.link_peer(dispatcher);
        let peers = dispatcher.rpc.connected_peers();
        let decision = dispatcher
            .broadcast
            .decide(opcode, &raw.signature, link_peer.as_ref(), &peers);

        let (relay_to, ack) = match decision {
            BroadcastDecision::Duplicate { ack } => {
                if ack {
                    self.ack_speak(dispatcher, raw, link_peer.as_ref()).await;
                }
                return;
            }
            BroadcastDecision::Accept { relay_to, ack } => (relay_to, ack),
        };

        let encoded = raw.encoded();
        let relayed = dispatcher.relay(&encoded, &relay_to).await;
        trace!(opcode = ?opcode, from = %raw.from, relayed, "broadcast accepted");

        match opcode {
            Opcode::Shout | Opcode::Speak => {
                dispatcher.deliver(Delivery {
                    opcode,
                    from: raw.from,
                    body: items.first().cloned().unwrap_or(Value::Null),
                });
                if ack {
                    self.ack_speak(dispatcher, raw, link_peer.as_ref()).await;
                }
            }
            Opcode::Announce => {
                if let Some(contact) = announced
                    && contact.address != own
                {
                    learn_contact(dispatcher, contact).await;
                }
            }
            Opcode::ChangeKey => {
                if let Some(new_address) = new_key {
                    let old_contact = dispatcher.dht.remove_peer(&raw.from).await;
                    if dispatcher.rpc.rebind(&raw.from, new_address) {
                        dispatcher
                            .dht
                            .observe_peer(Contact {
                                address: new_address,
                                endpoint: old_contact.and_then(|c| c.endpoint),
                            })
                            .await;
                        info!(old = %raw.from, new = %new_address, "peer changed key");
                    }
                    dispatcher.dht.forget_node(&raw.from).await;
                }
            }
            _ => {}
        }
    }

    /// ACK a SPEAK to its originator: over this link when the originator is
    /// the link peer, otherwise through that peer's own session.
    async fn ack_speak(
        &self,
        dispatcher: &Dispatcher,
        raw: &RawMessage,
        link_peer: Option<&Address>,
    ) {
        if link_peer == Some(&raw.from) {
            self.ack(dispatcher, &raw.from, Opcode::Speak, Vec::new()).await;
            return;
        }
        let echo = vec![Value::from(Opcode::Speak.code())];
        if let Err(e) = dispatcher.rpc.send(&raw.from, Opcode::Ack, echo).await {
            trace!(from = %raw.from, error = %e, "could not acknowledge relayed speak");
        }
    }

    fn forward_whisper(&self, dispatcher: &Dispatcher, raw: RawMessage) {
        if !dispatcher.broadcast.should_forward_whisper(&raw.signature) {
            trace!(to = %raw.to, "dropping looping whisper");
            return;
        }
        let link_peer = self.link_peer(dispatcher);
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let to = raw.to;
            if let Err(e) = dispatcher.route_whisper(to, raw.encoded(), link_peer).await {
                debug!(to = %to, error = %e, "could not route whisper");
            }
        });
    }

    // ------------------------------------------------------------------------
    // DHT requests
    // ------------------------------------------------------------------------

    async fn handle_find_node(&self, dispatcher: &Dispatcher, raw: &RawMessage, items: &[Value]) {
        let target_value = items.first();
        let target = target_value
            .and_then(arg_bytes)
            .and_then(RoutingKey::from_target_bytes);
        let (Some(target_value), Some(target)) = (target_value, target) else {
            let echo = Opcode::FindNode.code();
            self.nack(dispatcher, &raw.from, echo, Vec::new(), "malformed target")
                .await;
            return;
        };
        let nodes = dispatcher.dht.handle_find_node(&target).await;
        let contacts = Value::Array(nodes.iter().map(Contact::to_value).collect());
        self.ack(dispatcher, &raw.from, Opcode::FindNode, vec![target_value.clone(), contacts])
            .await;
    }

    async fn handle_find_value(&self, dispatcher: &Dispatcher, raw: &RawMessage, items: &[Value]) {
        let Some(key) = items.first().and_then(arg_text) else {
            self.nack(dispatcher, &raw.from, Opcode::FindValue.code(), Vec::new(), "malformed key")
                .await;
            return;
        };
        let key_value = Value::Text(key.to_string());
        let rest = match dispatcher.dht.handle_find_value(key).await {
            FindValueReply::Found { value, metadata } => {
                vec![key_value, value, metadata.to_value()]
            }
            FindValueReply::Closer(nodes) => vec![
                key_value,
                Value::Null,
                Value::Array(nodes.iter().map(Contact::to_value).collect()),
            ],
        };
        self.ack(dispatcher, &raw.from, Opcode::FindValue, rest).await;
    }

    async fn handle_store(&self, dispatcher: &Dispatcher, raw: &RawMessage, items: &[Value]) {
        let echo = Opcode::Store.code();
        let owner = items.first().and_then(arg_address);
        let key = items.get(1).and_then(arg_text);
        let (Some(owner), Some(key), Some(value)) = (owner, key, items.get(2)) else {
            self.nack(dispatcher, &raw.from, echo, Vec::new(), "malformed store").await;
            return;
        };
        let key_value = Value::Text(key.to_string());
        if owner != raw.from {
            self.nack(dispatcher, &raw.from, echo, vec![key_value], "owner does not match sender")
                .await;
            return;
        }

        let enforce = dispatcher.rpc.config().enforce_store_owner;
        match dispatcher
            .dht
            .store_local(key, value.clone(), EntryMetadata::new(owner), enforce)
            .await
        {
            Ok(()) => {
                trace!(key = %key, owner = %owner, "stored value");
                self.ack(dispatcher, &raw.from, Opcode::Store, vec![key_value]).await;
            }
            Err(e) => {
                self.nack(dispatcher, &raw.from, echo, vec![key_value], &e.to_string())
                    .await;
            }
        }
    }

    async fn handle_custom(&self, dispatcher: &Dispatcher, raw: &RawMessage, items: &[Value]) {
        let echo = Opcode::Custom.code();
        let Some(sub_opcode) = items.first().and_then(arg_u64) else {
            self.nack(dispatcher, &raw.from, echo, Vec::new(), "malformed custom message")
                .await;
            return;
        };
        let sub_value = Value::from(sub_opcode);
        let Some(handler) = dispatcher.custom.get(sub_opcode) else {
            self.nack(dispatcher, &raw.from, echo, vec![sub_value], "no handler for sub-opcode")
                .await;
            return;
        };
        let body = items.get(1).unwrap_or(&Value::Null);
        let response = handler.handle(&raw.from, body).unwrap_or(Value::Null);
        self.ack(dispatcher, &raw.from, Opcode::Custom, vec![sub_value, response])
            .await;
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    async fn teardown(&mut self, dispatcher: &Dispatcher, failure: Option<anyhow::Error>) {
        self.state = ConnectionState::Disconnected;
        self.link.close();
        self.fail_ready(failure.unwrap_or_else(|| anyhow!("connection closed during negotiation")));

        let Some(peer) = dispatcher.rpc.unregister_session(self.link.id()) else {
            trace!(link = self.link.id(), "connection closed before establishment");
            return;
        };
        dispatcher.dht.remove_peer(&peer).await;
        dispatcher.rpc.fail_pending(&peer);
        info!(peer = %peer, direction = ?self.direction, "peer disconnected");

        let shutting_down = *dispatcher.rpc.subscribe_shutdown().borrow();
        if self.direction == Direction::Outward && !shutting_down {
            dispatcher.spawn_refill();
        }
    }
}

/// Learn a contact from ANNOUNCE: refresh it, dial it, or cache it.
async fn learn_contact(dispatcher: &Dispatcher, contact: Contact) {
    if dispatcher.rpc.is_connected(&contact.address) {
        dispatcher.dht.observe_peer(contact).await;
        return;
    }
    if contact.endpoint.is_none() {
        return;
    }
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move {
        if let Err(e) = dispatcher.rpc.ensure_connected(&contact).await {
            trace!(peer = %contact.address, error = %e, "keeping announced contact for later");
            dispatcher.dht.remember_nodes(vec![contact]).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TAU;
    use tokio::io::duplex;
    use tokio::time::{Duration, sleep, timeout};

    struct Harness {
        dispatcher: Dispatcher,
        deliveries: mpsc::Receiver<Delivery>,
        _dial_rx: mpsc::Receiver<DialRequest>,
    }

    fn harness(config: NodeConfig) -> Harness {
        let (dispatcher, deliveries, dial_rx) = Dispatcher::new(Keypair::generate(), config);
        Harness {
            dispatcher,
            deliveries,
            _dial_rx: dial_rx,
        }
    }

    /// Connect `a` (outward) to `b` (inbound) over an in-memory pipe.
    async fn link(a: &Dispatcher, b: &Dispatcher) -> Result<Address> {
        let (left, right) = duplex(256 * 1024);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(handle_connection(
            a.clone(),
            left,
            Direction::Outward,
            Some("memory:b".to_string()),
            Some(ready_tx),
        ));
        tokio::spawn(handle_connection(b.clone(), right, Direction::Inbound, None, None));
        timeout(Duration::from_secs(2), ready_rx)
            .await
            .expect("negotiation finishes")
            .expect("ready sent")
    }

    async fn wait_for_contact(dispatcher: &Dispatcher, address: &Address, present: bool) {
        timeout(Duration::from_secs(2), async {
            while dispatcher.dht().lookup_contact(address).await.is_some() != present {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("routing table updated");
    }

    async fn wait_for_peers(dispatcher: &Dispatcher, count: usize) {
        timeout(Duration::from_secs(2), async {
            while dispatcher.rpc().connected_peers().len() != count {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer count reached");
    }

    #[tokio::test]
    async fn negotiation_establishes_both_sides() {
        let a = harness(NodeConfig::default());
        let b = harness(NodeConfig::default());
        let peer = link(&a.dispatcher, &b.dispatcher).await.expect("established");
        assert_eq!(peer, b.dispatcher.rpc().address());
        wait_for_peers(&b.dispatcher, 1).await;

        let a_peers = a.dispatcher.rpc().peers();
        assert_eq!(a_peers.len(), 1);
        assert_eq!(a_peers[0].direction, Direction::Outward);
        assert_eq!(a_peers[0].send_compression, 4);
        assert_eq!(a.dispatcher.rpc().outward_count(), 1);
        assert_eq!(b.dispatcher.rpc().outward_count(), 0);
        wait_for_contact(&b.dispatcher, &a.dispatcher.rpc().address(), true).await;
    }

    #[tokio::test]
    async fn preferred_compression_overrides_list() {
        let a = harness(NodeConfig::default());
        let b = harness(NodeConfig {
            preferred_compression: Some(2),
            ..NodeConfig::default()
        });
        link(&a.dispatcher, &b.dispatcher).await.expect("established");
        sleep(Duration::from_millis(50)).await;
        assert_eq!(a.dispatcher.rpc().peers()[0].send_compression, 2);
    }

    #[tokio::test]
    async fn subnet_mismatch_disconnects_both_sides() {
        let a = harness(NodeConfig::default());
        let mut config = NodeConfig::default();
        config.subnet.tau = DEFAULT_TAU - 1;
        let b = harness(config);

        let err = link(&a.dispatcher, &b.dispatcher).await.expect_err("mismatch");
        assert!(err.to_string().contains("tau") || err.to_string().contains("subnet"));
        sleep(Duration::from_millis(50)).await;
        assert!(a.dispatcher.rpc().connected_peers().is_empty());
        assert!(b.dispatcher.rpc().connected_peers().is_empty());
    }

    #[tokio::test]
    async fn ping_and_unknown_custom_sub_opcode() {
        let a = harness(NodeConfig::default());
        let b = harness(NodeConfig::default());
        let peer = link(&a.dispatcher, &b.dispatcher).await.expect("established");

        let reply = a
            .dispatcher
            .rpc()
            .request(&peer, Opcode::Ping, Vec::new())
            .await
            .expect("pong");
        assert_eq!(reply, Reply::Ack(vec![Value::from(2u8)]));

        let reply = a
            .dispatcher
            .rpc()
            .request(&peer, Opcode::Custom, vec![Value::from(7u8), Value::Null])
            .await
            .expect("reply");
        assert!(!reply.is_ack());
        assert_eq!(reply.reason(), Some("no handler for sub-opcode"));
    }

    #[tokio::test]
    async fn custom_handler_answers() {
        let a = harness(NodeConfig::default());
        let b = harness(NodeConfig::default());
        b.dispatcher.custom().register(
            1,
            Arc::new(|_from: &Address, body: &Value| {
                Some(Value::Text(format!("echo:{}", body.as_text().unwrap_or(""))))
            }),
        );
        let peer = link(&a.dispatcher, &b.dispatcher).await.expect("established");

        let reply = a
            .dispatcher
            .rpc()
            .request(&peer, Opcode::Custom, vec![Value::from(1u8), Value::Text("hi".into())])
            .await
            .expect("reply");
        assert_eq!(
            reply,
            Reply::Ack(vec![Value::from(15u8), Value::from(1u8), Value::Text("echo:hi".into())])
        );
    }

    #[tokio::test]
    async fn store_then_find_value() {
        let a = harness(NodeConfig::default());
        let b = harness(NodeConfig::default());
        let peer = link(&a.dispatcher, &b.dispatcher).await.expect("established");
        let contact = Contact::unreachable(peer);

        a.dispatcher
            .rpc()
            .store(&contact, "k1", Value::Text("v1".into()))
            .await
            .expect("stored");
        match a.dispatcher.rpc().find_value(&contact, "k1").await.expect("found") {
            FindValueReply::Found { value, metadata } => {
                assert_eq!(value, Value::Text("v1".into()));
                assert_eq!(metadata.owner, a.dispatcher.rpc().address());
            }
            other => panic!("unexpected reply {other:?}"),
        }
        match a.dispatcher.rpc().find_value(&contact, "absent").await.expect("reply") {
            FindValueReply::Closer(nodes) => {
                assert!(nodes.iter().all(|c| c.address != peer));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn store_with_foreign_owner_is_rejected() {
        let a = harness(NodeConfig::default());
        let b = harness(NodeConfig::default());
        let peer = link(&a.dispatcher, &b.dispatcher).await.expect("established");

        let reply = a
            .dispatcher
            .rpc()
            .request(
                &peer,
                Opcode::Store,
                vec![
                    Keypair::generate().address().to_value(),
                    Value::Text("k".into()),
                    Value::Null,
                ],
            )
            .await
            .expect("reply");
        assert_eq!(reply.reason(), Some("owner does not match sender"));
    }

    #[tokio::test]
    async fn shout_is_delivered_and_not_echoed() {
        let a = harness(NodeConfig::default());
        let mut b = harness(NodeConfig::default());
        link(&a.dispatcher, &b.dispatcher).await.expect("established");
        wait_for_peers(&b.dispatcher, 1).await;

        let sent = a
            .dispatcher
            .originate(Opcode::Shout, vec![Value::Text("hello".into())])
            .await
            .expect("shout");
        assert_eq!(sent, 1);

        let delivery = timeout(Duration::from_secs(2), b.deliveries.recv())
            .await
            .expect("delivered")
            .expect("channel open");
        assert_eq!(delivery.opcode, Opcode::Shout);
        assert_eq!(delivery.from, a.dispatcher.rpc().address());
        assert_eq!(delivery.body, Value::Text("hello".into()));
    }

    #[tokio::test]
    async fn direct_whisper_is_acknowledged() {
        let a = harness(NodeConfig::default());
        let mut b = harness(NodeConfig::default());
        let peer = link(&a.dispatcher, &b.dispatcher).await.expect("established");
        wait_for_peers(&b.dispatcher, 1).await;

        a.dispatcher
            .whisper(&peer, Value::Text("psst".into()))
            .await
            .expect("acknowledged");
        let delivery = timeout(Duration::from_secs(2), b.deliveries.recv())
            .await
            .expect("delivered")
            .expect("channel open");
        assert_eq!(delivery.opcode, Opcode::Whisper);
        assert_eq!(delivery.body, Value::Text("psst".into()));
    }

    #[tokio::test]
    async fn disconnect_cleans_up_both_sides() {
        let a = harness(NodeConfig::default());
        let b = harness(NodeConfig::default());
        let peer = link(&a.dispatcher, &b.dispatcher).await.expect("established");
        wait_for_peers(&b.dispatcher, 1).await;

        assert!(a.dispatcher.rpc().disconnect(&peer));
        wait_for_peers(&a.dispatcher, 0).await;
        wait_for_peers(&b.dispatcher, 0).await;
        wait_for_contact(&a.dispatcher, &peer, false).await;
    }

    #[tokio::test]
    async fn change_key_rebinds_session() {
        let a = harness(NodeConfig::default());
        let b = harness(NodeConfig::default());
        link(&a.dispatcher, &b.dispatcher).await.expect("established");
        wait_for_peers(&b.dispatcher, 1).await;

        let old = a.dispatcher.rpc().address();
        let new_keypair = Keypair::generate();
        let new = new_keypair.address();
        a.dispatcher.change_key(new_keypair).await.expect("changed");
        assert_eq!(a.dispatcher.rpc().address(), new);

        wait_for_contact(&b.dispatcher, &new, true).await;
        assert!(b.dispatcher.rpc().is_connected(&new));
        assert!(!b.dispatcher.rpc().is_connected(&old));
    }

    #[test]
    fn resolve_matches_oldest_waiter() {
        let (rpc, _dial_rx) = RpcNode::new(Keypair::generate(), NodeConfig::default());
        let peer = Keypair::generate().address();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        {
            let mut pending = rpc.shared.pending.lock();
            let queue = pending.entry((peer, Opcode::Ping.code())).or_default();
            queue.push_back(first_tx);
            queue.push_back(second_tx);
        }

        assert!(rpc.resolve(&peer, Reply::Ack(vec![Value::from(2u8)])));
        assert_eq!(first_rx.try_recv().expect("first"), Reply::Ack(vec![Value::from(2u8)]));
        assert!(second_rx.try_recv().is_err());

        rpc.fail_pending(&peer);
        assert!(!rpc.resolve(&peer, Reply::Ack(vec![Value::from(2u8)])));
    }

    // ------------------------------------------------------------------------
    // Hand-built frames against a single dispatcher
    // ------------------------------------------------------------------------

    /// The far end of a pipe whose near end is served by a dispatcher.
    struct ScriptedPeer {
        keypair: Keypair,
        remote: Address,
        registry: CompressionRegistry,
        reader: tokio::io::ReadHalf<tokio::io::DuplexStream>,
        writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    }

    impl ScriptedPeer {
        fn attach(dispatcher: &Dispatcher) -> Self {
            let (near, far) = duplex(256 * 1024);
            tokio::spawn(handle_connection(
                dispatcher.clone(),
                near,
                Direction::Inbound,
                None,
                None,
            ));
            let (reader, writer) = tokio::io::split(far);
            Self {
                keypair: Keypair::generate(),
                remote: dispatcher.rpc().address(),
                registry: CompressionRegistry::default(),
                reader,
                writer,
            }
        }

        fn message(&self, opcode: Opcode, items: Vec<Value>) -> Vec<u8> {
            encode_message(&self.remote, opcode, &Value::Array(items), &self.keypair, false)
                .expect("encode")
        }

        fn option(&self, option: ConnectionOption, setting: Value) -> Vec<u8> {
            self.message(
                Opcode::SetConnectionOpt,
                vec![Value::from(option.code()), setting],
            )
        }

        async fn send(&mut self, messages: &[Vec<u8>]) {
            use tokio::io::AsyncWriteExt;
            let transmission =
                encode_transmission(&self.registry, 0, messages).expect("transmission");
            self.writer.write_all(&transmission).await.expect("write");
        }

        /// Messages of the next transmission, or `None` on timeout or EOF.
        async fn recv(&mut self, wait: Duration) -> Option<Vec<RawMessage>> {
            let bytes = timeout(wait, read_transmission(&mut self.reader, 1 << 20))
                .await
                .ok()?
                .expect("read")?;
            let frames = decode_transmission(&self.registry, &bytes, 1 << 20).expect("decode");
            Some(frames.collect::<Result<_, _>>().expect("records"))
        }

        /// Everything received until a reply to `echo` shows up.
        async fn until_reply(&mut self, reply: Opcode, echo: u8) -> Vec<RawMessage> {
            let mut seen = Vec::new();
            loop {
                let batch = self
                    .recv(Duration::from_secs(2))
                    .await
                    .expect("reply before timeout");
                let done = batch
                    .iter()
                    .any(|m| m.opcode == reply.code() && echo_of(m) == Some(echo));
                seen.extend(batch);
                if done {
                    return seen;
                }
            }
        }

        /// Send our options with `subnet` and collect traffic up to the
        /// compression ACK.
        async fn negotiate(&mut self, subnet: &Subnet) -> Vec<RawMessage> {
            let options = vec![
                self.option(ConnectionOption::Subnet, subnet.to_value()),
                self.option(ConnectionOption::Compression, Value::Array(vec![Value::from(0u8)])),
            ];
            self.send(&options).await;
            let mut seen = Vec::new();
            loop {
                let batch = self.until_reply(Opcode::Ack, Opcode::SetConnectionOpt.code()).await;
                let compression = Value::from(ConnectionOption::Compression.code());
                let done = batch.iter().any(|m| {
                    m.opcode == Opcode::Ack.code() && items_of(m).get(1) == Some(&compression)
                });
                seen.extend(batch);
                if done {
                    return seen;
                }
            }
        }
    }

    fn items_of(message: &RawMessage) -> Vec<Value> {
        decode_payload(&message.payload)
            .expect("payload")
            .into_array()
            .expect("array")
    }

    fn echo_of(message: &RawMessage) -> Option<u8> {
        items_of(message)
            .first()
            .and_then(arg_u64)
            .and_then(|code| u8::try_from(code).ok())
    }

    fn is_reply_to(message: &RawMessage, reply: Opcode, echo: Opcode) -> bool {
        message.opcode == reply.code() && echo_of(message) == Some(echo.code())
    }

    /// Rewrite the opcode nibble and sign again.
    fn with_opcode(mut message: Vec<u8>, code: u8, signer: &Keypair) -> Vec<u8> {
        let flags = SIGNATURE_LEN + 4;
        message[flags] = (message[flags] & 0x0f) | (code << 4);
        let signature = signer.sign(&message[SIGNATURE_LEN..]);
        message[..SIGNATURE_LEN].copy_from_slice(&signature);
        message
    }

    #[tokio::test]
    async fn unknown_opcode_is_nacked_with_its_code() {
        let h = harness(NodeConfig::default());
        let mut peer = ScriptedPeer::attach(&h.dispatcher);
        peer.negotiate(&h.dispatcher.rpc().config().subnet).await;

        for code in 12..=14u8 {
            let ping = peer.message(Opcode::Ping, Vec::new());
            let unknown = with_opcode(ping, code, &peer.keypair);
            peer.send(&[unknown]).await;

            let replies = peer.until_reply(Opcode::Nack, code).await;
            let nack = replies.last().expect("nack");
            assert_eq!(nack.to, peer.keypair.address());
            assert_eq!(
                items_of(nack),
                vec![Value::from(code), Value::Text("unknown opcode".into())]
            );
        }
    }

    #[tokio::test]
    async fn bad_signature_is_dropped_silently() {
        let h = harness(NodeConfig::default());
        let mut peer = ScriptedPeer::attach(&h.dispatcher);
        peer.negotiate(&h.dispatcher.rpc().config().subnet).await;

        let mut forged = peer.message(Opcode::Ping, vec![Value::from(1u8)]);
        forged[0] ^= 0x01;
        let genuine = peer.message(Opcode::Ping, Vec::new());
        peer.send(&[forged, genuine]).await;

        let replies = peer.until_reply(Opcode::Ack, Opcode::Ping.code()).await;
        assert!(replies.iter().all(|m| m.opcode != Opcode::Nack.code()));
        assert_eq!(
            replies
                .iter()
                .filter(|m| is_reply_to(m, Opcode::Ack, Opcode::Ping))
                .count(),
            1
        );
        assert!(peer.recv(Duration::from_millis(200)).await.is_none());
    }

    #[tokio::test]
    async fn requests_before_negotiation_are_dropped() {
        let h = harness(NodeConfig::default());
        let mut peer = ScriptedPeer::attach(&h.dispatcher);

        let early = vec![
            peer.message(Opcode::Ping, Vec::new()),
            peer.message(Opcode::FindValue, vec![Value::Text("k".into())]),
        ];
        peer.send(&early).await;
        let seen = peer.negotiate(&h.dispatcher.rpc().config().subnet).await;

        assert!(!seen.iter().any(|m| is_reply_to(m, Opcode::Ack, Opcode::Ping)));
        assert!(!seen.iter().any(|m| echo_of(m) == Some(Opcode::FindValue.code())));
        assert!(peer.recv(Duration::from_millis(200)).await.is_none());

        let ping = peer.message(Opcode::Ping, Vec::new());
        peer.send(&[ping]).await;
        peer.until_reply(Opcode::Ack, Opcode::Ping.code()).await;
    }

    #[tokio::test]
    async fn mismatched_subnet_is_nacked_then_closed() {
        let h = harness(NodeConfig::default());
        let mut peer = ScriptedPeer::attach(&h.dispatcher);
        let mut subnet = h.dispatcher.rpc().config().subnet.clone();
        subnet.tau = DEFAULT_TAU - 1;

        let option = peer.option(ConnectionOption::Subnet, subnet.to_value());
        peer.send(&[option]).await;
        let replies = peer.until_reply(Opcode::Nack, Opcode::SetConnectionOpt.code()).await;
        let nack = replies.last().expect("nack");
        let items = items_of(nack);
        assert_eq!(items[1], Value::from(ConnectionOption::Subnet.code()));
        assert_eq!(
            items[2],
            Value::Text(OptionError::SubnetMismatch { field: "tau" }.to_string())
        );

        while peer.recv(Duration::from_secs(2)).await.is_some() {}
        assert!(h.dispatcher.rpc().connected_peers().is_empty());
    }

    #[tokio::test]
    async fn nack_of_our_subnet_aborts_negotiation() {
        let h = harness(NodeConfig::default());
        let mut peer = ScriptedPeer::attach(&h.dispatcher);

        let options = peer.recv(Duration::from_secs(2)).await.expect("options");
        assert!(options.iter().all(|m| m.opcode == Opcode::SetConnectionOpt.code()));
        let nack = peer.message(
            Opcode::Nack,
            vec![
                Value::from(Opcode::SetConnectionOpt.code()),
                Value::from(ConnectionOption::Subnet.code()),
                Value::Text("subnet mismatch on tau".into()),
            ],
        );
        peer.send(&[nack]).await;

        while peer.recv(Duration::from_secs(2)).await.is_some() {}
        assert!(h.dispatcher.rpc().connected_peers().is_empty());
    }

    #[tokio::test]
    async fn unsupported_preferred_compression_is_nacked() {
        let h = harness(NodeConfig::default());
        let mut peer = ScriptedPeer::attach(&h.dispatcher);
        peer.negotiate(&h.dispatcher.rpc().config().subnet).await;

        let preferred = peer.option(ConnectionOption::PreferredCompression, Value::from(5u8));
        peer.send(&[preferred]).await;
        let replies = peer.until_reply(Opcode::Nack, Opcode::SetConnectionOpt.code()).await;
        let nack = replies.last().expect("nack");
        assert_eq!(
            items_of(nack)[2],
            Value::Text(OptionError::UnsupportedCompression(5).to_string())
        );

        let unknown = peer.message(
            Opcode::SetConnectionOpt,
            vec![Value::from(9u8), Value::Null],
        );
        peer.send(&[unknown]).await;
        let replies = peer.until_reply(Opcode::Nack, Opcode::SetConnectionOpt.code()).await;
        assert_eq!(
            items_of(replies.last().expect("nack"))[2],
            Value::Text(OptionError::UnknownOption(9).to_string())
        );
    }

    #[tokio::test]
    async fn duplicate_speak_is_acked_to_its_originator_only() {
        let h = harness(NodeConfig {
            ack_speak: true,
            ..NodeConfig::default()
        });
        let mut peer = ScriptedPeer::attach(&h.dispatcher);
        peer.negotiate(&h.dispatcher.rpc().config().subnet).await;

        // Relayed copies of a SPEAK by a node we have no session with.
        let origin = Keypair::generate();
        let speak = encode_message(
            &Address::BROADCAST,
            Opcode::Speak,
            &Value::Array(vec![Value::Text("hi".into()), fresh_nonce()]),
            &origin,
            false,
        )
        .expect("encode");
        peer.send(&[speak.clone()]).await;
        peer.send(&[speak]).await;
        assert!(peer.recv(Duration::from_millis(300)).await.is_none());

        // The link peer's own SPEAK is acknowledged on every copy.
        let own = encode_message(
            &Address::BROADCAST,
            Opcode::Speak,
            &Value::Array(vec![Value::Text("me".into()), fresh_nonce()]),
            &peer.keypair,
            false,
        )
        .expect("encode");
        peer.send(&[own.clone(), own]).await;
        let mut acks = 0;
        while acks < 2 {
            let batch = peer.recv(Duration::from_secs(2)).await.expect("ack");
            for message in batch {
                assert!(is_reply_to(&message, Opcode::Ack, Opcode::Speak));
                assert_eq!(message.to, peer.keypair.address());
                acks += 1;
            }
        }
    }
}
