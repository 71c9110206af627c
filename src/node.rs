//! # High-Level Node API
//!
//! A [`Node`] binds a TCP listener and wires the RPC manager, the DHT and the
//! broadcast engine into one interface.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("127.0.0.1:0").await?;
//! node.connect("127.0.0.1:4000").await?;
//!
//! node.put("greeting", Value::Text("hello".into())).await?;
//! node.shout(Value::Text("hello, mesh".into())).await?;
//!
//! let mut rx = node.messages().await?;
//! while let Some(delivery) = rx.recv().await {
//!     println!("{:?} from {}: {:?}", delivery.opcode, delivery.from, delivery.body);
//! }
//! ```
//!
//! ## Component Integration
//!
//! - **Listener**: accepts inbound TCP connections and hands each to
//!   [`rpc::handle_connection`].
//! - **Dial service**: serves outward connection requests, enforcing ℓ.
//! - **DhtNode**: routing table, value store and iterative lookups.
//! - **BroadcastEngine**: SHOUT/SPEAK/ANNOUNCE/CHANGE_KEY deduplication.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::dht::{BucketDiff, EntryMetadata, RoutingSnapshot};
use crate::identity::{Address, Contact, Keypair};
use crate::messages::{Delivery, Opcode, Value};
use crate::protocols::{CustomHandler, DhtRpc, FindValueReply};
use crate::rpc::{self, Dispatcher, Direction, PeerInfo};

/// A receiver that can be taken exactly once.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

pub struct Node {
    dispatcher: Dispatcher,
    local_addr: SocketAddr,
    deliveries: TakeOnce<Delivery>,
    listener: JoinHandle<()>,
    dial_service: JoinHandle<()>,
}

impl Node {
    /// Create a node with a fresh keypair and default configuration.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with(addr, Keypair::generate(), NodeConfig::default()).await
    }

    pub async fn bind_with_keypair(addr: &str, keypair: Keypair) -> Result<Self> {
        Self::bind_with(addr, keypair, NodeConfig::default()).await
    }

    pub async fn bind_with(addr: &str, keypair: Keypair, config: NodeConfig) -> Result<Self> {
        config
            .subnet
            .validate()
            .context("invalid subnet configuration")?;
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;

        let (dispatcher, delivery_rx, dial_rx) = Dispatcher::new(keypair, config);
        if local_addr.ip().is_unspecified() && dispatcher.rpc().local_endpoint().is_none() {
            warn!(
                addr = %local_addr,
                "announcing an unroutable endpoint; set advertised_endpoint"
            );
        }
        dispatcher.rpc().set_local_endpoint(local_addr.to_string());

        let dial_service = rpc::spawn_dial_service(dispatcher.clone(), dial_rx);
        let listener = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, remote)) => {
                            let _ = stream.set_nodelay(true);
                            debug!(remote = %remote, "accepted connection");
                            tokio::spawn(rpc::handle_connection(
                                dispatcher.clone(),
                                stream,
                                Direction::Inbound,
                                None,
                                None,
                            ));
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            })
        };

        info!(address = %dispatcher.rpc().address(), addr = %local_addr, "node listening");

        Ok(Self {
            dispatcher,
            local_addr,
            deliveries: tokio::sync::Mutex::new(Some(delivery_rx)),
            listener,
            dial_service,
        })
    }

    /// Current address. Changes after [`Node::change_key`].
    pub fn address(&self) -> Address {
        self.dispatcher.rpc().address()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The endpoint announced to peers.
    pub fn endpoint(&self) -> String {
        self.dispatcher
            .rpc()
            .local_endpoint()
            .unwrap_or_else(|| self.local_addr.to_string())
    }

    pub fn config(&self) -> &NodeConfig {
        self.dispatcher.rpc().config()
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Dial `endpoint` and finish option negotiation. Returns the peer address.
    pub async fn connect(&self, endpoint: &str) -> Result<Address> {
        let peer = self
            .dispatcher
            .rpc()
            .dial_outward(endpoint)
            .await
            .with_context(|| format!("failed to connect to {endpoint}"))?;
        info!(peer = %peer, endpoint, "connected");
        Ok(peer)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.dispatcher.rpc().peers()
    }

    pub fn is_connected(&self, peer: &Address) -> bool {
        self.dispatcher.rpc().is_connected(peer)
    }

    pub fn disconnect(&self, peer: &Address) -> bool {
        self.dispatcher.rpc().disconnect(peer)
    }

    /// A contact we can hand to the RPC layer: connected, or dialable.
    async fn contact_for(&self, peer: &Address) -> Result<Contact> {
        if self.is_connected(peer) {
            return Ok(Contact::unreachable(*peer));
        }
        self.dispatcher
            .dht()
            .lookup_contact(peer)
            .await
            .filter(|c| c.endpoint.is_some())
            .ok_or_else(|| anyhow!("peer {peer} is neither connected nor known"))
    }

    // =========================================================================
    // Direct Requests
    // =========================================================================

    pub async fn ping(&self, peer: &Address) -> Result<()> {
        let contact = self.contact_for(peer).await?;
        self.dispatcher.rpc().ping(&contact).await
    }

    /// STORE `key` at one specific peer, owned by this node.
    pub async fn store_at(&self, peer: &Address, key: &str, value: Value) -> Result<()> {
        let contact = self.contact_for(peer).await?;
        self.dispatcher.rpc().store(&contact, key, value).await
    }

    pub async fn find_value(&self, peer: &Address, key: &str) -> Result<FindValueReply> {
        let contact = self.contact_for(peer).await?;
        self.dispatcher.rpc().find_value(&contact, key).await
    }

    pub async fn find_node(&self, peer: &Address, target: &Address) -> Result<Vec<Contact>> {
        let contact = self.contact_for(peer).await?;
        self.dispatcher
            .rpc()
            .find_node(&contact, target.routing_key())
            .await
    }

    /// Send a CUSTOM request and return the handler's reply body.
    pub async fn send_custom(
        &self,
        peer: &Address,
        sub_opcode: u64,
        body: Value,
    ) -> Result<Option<Value>> {
        let contact = self.contact_for(peer).await?;
        let rpc = self.dispatcher.rpc();
        rpc.ensure_connected(&contact).await?;
        let items = rpc
            .request(peer, Opcode::Custom, vec![Value::from(sub_opcode), body])
            .await?
            .into_ack()?;
        Ok(match items.get(2) {
            None | Some(Value::Null) => None,
            Some(reply) => Some(reply.clone()),
        })
    }

    /// Register the handler for a CUSTOM sub-opcode. Returns true if it
    /// replaced an earlier handler.
    pub fn register_custom<H: CustomHandler>(&self, sub_opcode: u64, handler: H) -> bool {
        self.dispatcher.custom().register(sub_opcode, Arc::new(handler))
    }

    pub fn unregister_custom(&self, sub_opcode: u64) -> bool {
        self.dispatcher.custom().unregister(sub_opcode)
    }

    // =========================================================================
    // DHT
    // =========================================================================

    /// Iterative FIND_NODE across the network.
    pub async fn lookup(&self, target: &Address) -> Result<Vec<Contact>> {
        self.dispatcher
            .dht()
            .iterative_find_node(target.routing_key())
            .await
    }

    /// Store locally and at the k closest nodes. Returns the replica count.
    pub async fn put(&self, key: &str, value: Value) -> Result<usize> {
        self.dispatcher.dht().put(key, value, self.address()).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<(Value, EntryMetadata)>> {
        self.dispatcher.dht().get(key).await
    }

    pub async fn routing_snapshot(&self) -> RoutingSnapshot {
        self.dispatcher.dht().snapshot().await
    }

    /// Contacts in routing bucket `idx`, oldest first.
    pub async fn bucket(&self, idx: usize) -> Result<Vec<Contact>> {
        self.dispatcher
            .dht()
            .bucket(idx)
            .await?
            .with_context(|| format!("bucket {idx} does not exist"))
    }

    /// Swap bucket `idx` for `replacement` if it still holds exactly
    /// `expected`. Fails with [`crate::BucketUpdateError`] otherwise.
    pub async fn replace_bucket(
        &self,
        idx: usize,
        expected: Vec<Address>,
        replacement: Vec<Contact>,
    ) -> Result<()> {
        self.dispatcher
            .dht()
            .replace_bucket(idx, expected, replacement)
            .await
    }

    /// Evict then insert in one step. Returns the inserts that did not fit.
    pub async fn apply_bucket_diff(&self, diff: BucketDiff) -> Result<Vec<Contact>> {
        self.dispatcher.dht().apply_bucket_diff(diff).await
    }

    // =========================================================================
    // Broadcast and Whisper
    // =========================================================================

    /// Flood `body` to every node. Returns how many peers it was sent to.
    pub async fn shout(&self, body: Value) -> Result<usize> {
        self.dispatcher.originate(Opcode::Shout, vec![body]).await
    }

    /// Send `body` to connected peers; relaying is up to each receiver.
    pub async fn speak(&self, body: Value) -> Result<usize> {
        self.dispatcher.originate(Opcode::Speak, vec![body]).await
    }

    pub async fn whisper(&self, to: &Address, body: Value) -> Result<()> {
        self.dispatcher.whisper(to, body).await
    }

    pub async fn announce(&self) -> Result<usize> {
        self.dispatcher.announce().await
    }

    /// Switch to `keypair`, telling the mesh with a CHANGE_KEY broadcast.
    pub async fn change_key(&self, keypair: Keypair) -> Result<usize> {
        self.dispatcher.change_key(keypair).await
    }

    /// Deliveries of SHOUT, SPEAK and WHISPER bodies. Can be taken once.
    pub async fn messages(&self) -> Result<mpsc::Receiver<Delivery>> {
        let mut guard = self.deliveries.lock().await;
        guard.take().context("message receiver already taken")
    }

    pub async fn shutdown(&self) {
        self.listener.abort();
        self.dial_service.abort();
        self.dispatcher.rpc().shutdown();
        self.dispatcher.dht().quit().await;
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.listener.abort();
        self.dial_service.abort();
        self.dispatcher.rpc().shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Duration, timeout};

    #[tokio::test]
    async fn bind_reports_loopback_endpoint() {
        let node = Node::bind("127.0.0.1:0").await.expect("bind");
        assert_eq!(node.endpoint(), node.local_addr().to_string());
        assert!(node.peers().is_empty());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_bind_address_is_rejected() {
        assert!(Node::bind("not an address").await.is_err());
    }

    #[tokio::test]
    async fn messages_can_be_taken_once() {
        let node = Node::bind("127.0.0.1:0").await.expect("bind");
        assert!(node.messages().await.is_ok());
        assert!(node.messages().await.is_err());
    }

    #[tokio::test]
    async fn ping_unknown_peer_fails_fast() {
        let node = Node::bind("127.0.0.1:0").await.expect("bind");
        let stranger = Keypair::generate().address();
        let result = timeout(Duration::from_secs(1), node.ping(&stranger))
            .await
            .expect("no stall");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn outward_limit_is_enforced() {
        let mut config = NodeConfig::default();
        config.subnet.ell = 1;
        let hub = Node::bind_with("127.0.0.1:0", Keypair::generate(), config.clone())
            .await
            .expect("bind");
        let other = Node::bind_with("127.0.0.1:0", Keypair::generate(), config.clone())
            .await
            .expect("bind");
        let dialer = Node::bind_with("127.0.0.1:0", Keypair::generate(), config)
            .await
            .expect("bind");

        dialer.connect(&hub.endpoint()).await.expect("first dial");
        let err = dialer
            .connect(&other.endpoint())
            .await
            .expect_err("limit reached");
        assert!(format!("{err:#}").contains("outward connection limit"));
    }
}
