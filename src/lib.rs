//! # Kadmesh - Peer-to-Peer Node Core
//!
//! Kadmesh is the networking core of a peer-to-peer node:
//!
//! - **Wire**: signed messages packed into compressed transmissions
//! - **Identity**: Ed25519 keypairs; the address is the DER-encoded public key
//! - **DHT**: Kademlia routing table, value store and iterative lookups
//! - **Broadcast**: SHOUT/SPEAK/ANNOUNCE/CHANGE_KEY flooding with dedup by signature
//! - **RPC**: per-connection state machine, option negotiation and dispatch
//!
//! ## Architecture
//!
//! The DHT follows the **Actor Pattern**: a cheap-to-clone handle talks to a
//! private actor that owns the routing table and value store and applies
//! mutations one command at a time. Each connection runs its own reader task
//! plus a writer task, so a slow peer never stalls the others.
//!
//! ## Security Model
//!
//! - Every message is signed by its `from` address; bad signatures are dropped silently
//! - WHISPER payloads can be sealed to the recipient's key
//! - Peers must agree on every subnet parameter before anything else is accepted
//! - Bounded caches and size limits keep memory use in check
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `config` | Subnet parameters and local node settings |
//! | `identity` | Keypairs, addresses, routing keys, contacts |
//! | `crypto` | Signature checks, key-change proofs, payload sealing |
//! | `compression` | Compression codec registry |
//! | `wire` | Transmission and message framing |
//! | `messages` | Opcodes, connection options and payload model |
//! | `dht` | Kademlia routing table, value store and lookups |
//! | `broadcast` | Flood deduplication and relay decisions |
//! | `transport` | Stream framing and per-link writer tasks |
//! | `protocols` | Protocol trait definitions (DhtRpc, CustomHandler) |
//! | `rpc` | Connection state machine and request dispatch |

mod broadcast;
mod compression;
mod config;
mod crypto;
mod dht;
mod identity;
mod messages;
mod node;
mod protocols;
mod rpc;
mod transport;
mod wire;

pub use broadcast::{BroadcastDecision, BroadcastEngine};
pub use compression::{CompressionCodec, CompressionId, CompressionRegistry};
pub use config::{NodeConfig, OptionError, Subnet, TransportKind, WhisperRouting};
pub use crypto::AuthError;
pub use dht::{
    BucketDiff, BucketUpdateError, Distance, EntryMetadata, RoutingSnapshot, StoreRejection,
    bucket_index, distance,
};
pub use identity::{Address, Contact, Keypair, RoutingKey, distance_cmp};
pub use messages::{ConnectionOption, Delivery, Opcode, Reply, Value};
pub use node::Node;
pub use protocols::{CustomHandler, FindValueReply};
pub use rpc::{Direction, PeerInfo};
pub use wire::{RawMessage, WireError, decode_transmission, encode_message, encode_transmission};
