//! Protocol trait definitions for kadmesh's networking layer.
//!
//! These traits abstract over the RPC manager so that the DHT can be driven
//! by the real wire protocol or by an in-memory network in tests.
//!
//! ## Protocol Traits
//!
//! | Protocol | Trait | Purpose |
//! |----------|-------|---------|
//! | DHT | [`DhtRpc`] | FIND_NODE, FIND_VALUE, STORE and PING against a contact |
//! | CUSTOM | [`CustomHandler`] | Application extension hook per sub-opcode |

use anyhow::Result;
use async_trait::async_trait;

use crate::dht::EntryMetadata;
use crate::identity::{Address, Contact, RoutingKey};
use crate::messages::Value;

/// Answer to FIND_VALUE: the value itself, or contacts closer to the key.
#[derive(Clone, Debug, PartialEq)]
pub enum FindValueReply {
    Found { value: Value, metadata: EntryMetadata },
    Closer(Vec<Contact>),
}

/// DHT node operations for distributed routing and storage.
#[async_trait]
pub trait DhtRpc: Send + Sync + 'static {
    /// Ping a node to check liveness.
    async fn ping(&self, to: &Contact) -> Result<()>;

    /// Find the k closest nodes to a routing key.
    async fn find_node(&self, to: &Contact, target: RoutingKey) -> Result<Vec<Contact>>;

    async fn find_value(&self, to: &Contact, key: &str) -> Result<FindValueReply>;

    /// Store a value on a remote node, owned by the local address.
    async fn store(&self, to: &Contact, key: &str, value: Value) -> Result<()>;
}

/// Handler for one CUSTOM sub-opcode. Returning `None` sends an ACK with a
/// nil reply body.
pub trait CustomHandler: Send + Sync + 'static {
    fn handle(&self, from: &Address, body: &Value) -> Option<Value>;
}

impl<F> CustomHandler for F
where
    F: Fn(&Address, &Value) -> Option<Value> + Send + Sync + 'static,
{
    fn handle(&self, from: &Address, body: &Value) -> Option<Value> {
        self(from, body)
    }
}
