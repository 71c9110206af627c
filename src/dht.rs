//! # Kademlia-style Distributed Hash Table
//!
//! This module implements the routing and storage half of the node:
//!
//! - **Routing Table**: τ k-buckets indexed by shared-prefix length, with
//!   ping-oldest-first replacement for full buckets
//! - **Value Store**: text keys mapped to payload values plus owner/timestamp
//!   metadata
//! - **Node Info Cache**: contacts learned while the outward connection limit
//!   was saturated, kept for refilling after disconnects
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `put(key, value)` | Store locally and at the k closest nodes |
//! | `get(key)` | Local lookup, then iterative FIND_VALUE |
//! | `iterative_find_node(target)` | Find contacts closest to a routing key |
//! | `replace_bucket(..)` | Compare-and-swap a whole bucket |
//! | `apply_bucket_diff(..)` | Evict and insert contacts in one step |
//!
//! ## Distance
//!
//! Distance is `XOR(a, b) mod 2^τ` over the 256 bits of key material. With
//! τ < 256 the high-order bits are masked off, so only the trailing τ bits of
//! an address take part in routing.
//!
//! ## Actor Architecture
//!
//! - `DhtNode`: Public handle for DHT operations
//! - `DhtNodeActor`: Internal actor owning routing table and storage
//! - Every mutation is a command on one channel, so bucket replacement, diff
//!   application and ping results are serialized against each other

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::config::NodeConfig;
use crate::identity::{distance_cmp, now_ms, Address, Contact, RoutingKey, ROUTING_KEY_LEN};
use crate::messages::Value;
use crate::protocols::{DhtRpc, FindValueReply};

/// XOR distance between two routing keys, masked to the τ window.
pub type Distance = [u8; ROUTING_KEY_LEN];

const ROUTING_KEY_BITS: usize = ROUTING_KEY_LEN * 8;

/// How often stale buckets are looked for.
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// A bucket with no activity for this long gets a refresh lookup.
const BUCKET_STALE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Upper bound on distinct keys held by the value store.
pub const MAX_STORE_ENTRIES: usize = 100_000;

/// Longest storage key accepted.
pub const MAX_KEY_LEN: usize = 1024;

/// Default capacity of the node info cache.
pub const DEFAULT_NODE_INFO_CAPACITY: usize = 1_024;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Distance Helpers
// ============================================================================

fn mask_to_window(distance: &mut Distance, tau: usize) {
    let cleared = ROUTING_KEY_BITS - tau;
    let full = cleared / 8;
    for byte in distance.iter_mut().take(full) {
        *byte = 0;
    }
    let partial = cleared % 8;
    if partial > 0 {
        distance[full] &= 0xff >> partial;
    }
}

fn clamp_tau(tau: usize) -> usize {
    tau.clamp(1, ROUTING_KEY_BITS)
}

pub fn distance(a: &RoutingKey, b: &RoutingKey, tau: usize) -> Distance {
    let mut dist = a.xor(b);
    mask_to_window(&mut dist, clamp_tau(tau));
    dist
}

fn leading_zeros(distance: &Distance) -> usize {
    for (byte_idx, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    ROUTING_KEY_BITS
}

/// Shared-prefix length within the τ window, clamped to `[0, τ-1]`.
pub fn bucket_index(self_key: &RoutingKey, other: &RoutingKey, tau: usize) -> usize {
    let tau = clamp_tau(tau);
    let dist = distance(self_key, other, tau);
    let shared = leading_zeros(&dist) - (ROUTING_KEY_BITS - tau);
    shared.min(tau - 1)
}

fn random_key_for_bucket(self_key: &RoutingKey, bucket_idx: usize, tau: usize) -> RoutingKey {
    let tau = clamp_tau(tau);
    let self_bytes = self_key.as_bytes();
    let mut distance: Distance = rand::random();

    let bit = (ROUTING_KEY_BITS - tau) + bucket_idx.min(tau - 1);
    let byte_idx = bit / 8;
    let bit_pos = bit % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; ROUTING_KEY_LEN];
    for i in 0..ROUTING_KEY_LEN {
        target[i] = self_bytes[i] ^ distance[i];
    }
    RoutingKey::from_bytes(target)
}

// ============================================================================
// Routing Table
// ============================================================================

#[derive(Debug, Clone)]
struct RoutingBucket {
    contacts: Vec<Contact>,
    last_refresh: Instant,
}

#[derive(Debug)]
enum BucketTouchOutcome {
    Inserted,
    Refreshed,
    Full {
        new_contact: Box<Contact>,
        oldest: Box<Contact>,
    },
}

/// A full bucket waiting on a liveness check of its oldest entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingBucketUpdate {
    pub bucket_index: usize,
    pub oldest: Contact,
    pub new_contact: Contact,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Refreshed,
    /// Self or an address that is not a public key.
    Ignored,
    /// The bucket is full; ping `oldest` and report via `apply_ping_result`.
    Pending(PendingBucketUpdate),
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn position(&self, address: &Address) -> Option<usize> {
        self.contacts.iter().position(|c| &c.address == address)
    }

    fn touch(&mut self, contact: Contact, k: usize) -> BucketTouchOutcome {
        if let Some(pos) = self.position(&contact.address) {
            let existing = self.contacts.remove(pos);
            // Keep a known endpoint if the new sighting carries none.
            let updated = if contact.endpoint.is_some() {
                contact
            } else {
                existing
            };
            self.contacts.push(updated);
            self.mark_refreshed();
            return BucketTouchOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push(contact);
            self.mark_refreshed();
            BucketTouchOutcome::Inserted
        } else {
            debug_assert!(!self.contacts.is_empty(), "bucket len >= k but contacts empty");
            let oldest = self
                .contacts
                .first()
                .cloned()
                .unwrap_or_else(|| contact.clone());
            BucketTouchOutcome::Full {
                new_contact: Box::new(contact),
                oldest: Box::new(oldest),
            }
        }
    }

    fn refresh(&mut self, address: &Address) -> bool {
        if let Some(pos) = self.position(address) {
            let existing = self.contacts.remove(pos);
            self.contacts.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, address: &Address) -> Option<Contact> {
        self.position(address).map(|pos| self.contacts.remove(pos))
    }
}

/// Why a bucket replacement was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketUpdateError {
    IndexOutOfRange(usize),
    /// The bucket no longer holds the expected contacts.
    Conflict,
    TooManyContacts { len: usize, k: usize },
    Misplaced(Address),
    Duplicate(Address),
    SelfContact,
}

impl std::fmt::Display for BucketUpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketUpdateError::IndexOutOfRange(idx) => write!(f, "bucket {idx} does not exist"),
            BucketUpdateError::Conflict => write!(f, "bucket changed since it was read"),
            BucketUpdateError::TooManyContacts { len, k } => {
                write!(f, "{len} contacts exceed bucket size {k}")
            }
            BucketUpdateError::Misplaced(addr) => {
                write!(f, "contact {addr} belongs to another bucket")
            }
            BucketUpdateError::Duplicate(addr) => write!(f, "contact {addr} listed twice"),
            BucketUpdateError::SelfContact => write!(f, "routing table cannot contain itself"),
        }
    }
}

impl std::error::Error for BucketUpdateError {}

/// Entries to evict and insert in one exclusive step.
#[derive(Clone, Debug, Default)]
pub struct BucketDiff {
    pub evict: Vec<Address>,
    pub insert: Vec<Contact>,
}

#[derive(Debug)]
pub struct RoutingTable {
    self_address: Address,
    self_key: RoutingKey,
    k: usize,
    tau: usize,
    buckets: Vec<RoutingBucket>,
}

impl RoutingTable {
    pub fn new(self_address: Address, k: usize, tau: usize) -> Self {
        let tau = clamp_tau(tau);
        let mut buckets = Vec::with_capacity(tau);
        for _ in 0..tau {
            buckets.push(RoutingBucket::new());
        }
        Self {
            self_address,
            self_key: self_address.routing_key(),
            k: k.max(1),
            tau,
            buckets,
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn tau(&self) -> usize {
        self.tau
    }

    pub fn self_address(&self) -> Address {
        self.self_address
    }

    pub fn bucket_index_of(&self, address: &Address) -> usize {
        bucket_index(&self.self_key, &address.routing_key(), self.tau)
    }

    pub fn insert_or_refresh(&mut self, contact: Contact) -> InsertOutcome {
        if contact.address == self.self_address || !contact.address.is_valid() {
            return InsertOutcome::Ignored;
        }
        let idx = self.bucket_index_of(&contact.address);
        match self.buckets[idx].touch(contact, self.k) {
            BucketTouchOutcome::Inserted => InsertOutcome::Inserted,
            BucketTouchOutcome::Refreshed => InsertOutcome::Refreshed,
            BucketTouchOutcome::Full {
                new_contact,
                oldest,
            } => InsertOutcome::Pending(PendingBucketUpdate {
                bucket_index: idx,
                oldest: *oldest,
                new_contact: *new_contact,
            }),
        }
    }

    pub fn apply_ping_result(&mut self, pending: PendingBucketUpdate, oldest_alive: bool) {
        let Some(bucket) = self.buckets.get_mut(pending.bucket_index) else {
            return;
        };
        if oldest_alive {
            bucket.refresh(&pending.oldest.address);
            return;
        }

        let _ = self.apply_bucket_diff(BucketDiff {
            evict: vec![pending.oldest.address],
            insert: vec![pending.new_contact],
        });
    }

    pub fn remove(&mut self, address: &Address) -> Option<Contact> {
        if *address == self.self_address {
            return None;
        }
        let idx = self.bucket_index_of(address);
        self.buckets[idx].remove(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.lookup_contact(address).is_some()
    }

    pub fn lookup_contact(&self, address: &Address) -> Option<Contact> {
        if *address == self.self_address {
            return None;
        }
        let idx = self.bucket_index_of(address);
        self.buckets[idx]
            .contacts
            .iter()
            .find(|c| c.address == *address)
            .cloned()
    }

    /// Up to `count` contacts in ascending distance from `target`.
    pub fn closest(&self, target: &RoutingKey, count: usize) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct DistContact {
            dist: Distance,
            contact: Contact,
        }

        impl Ord for DistContact {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for DistContact {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<DistContact> = BinaryHeap::with_capacity(count + 1);

        for bucket in &self.buckets {
            for contact in &bucket.contacts {
                let dist = distance(&contact.address.routing_key(), target, self.tau);

                if heap.len() < count {
                    heap.push(DistContact {
                        dist,
                        contact: contact.clone(),
                    });
                } else if let Some(max_entry) = heap.peek()
                    && distance_cmp(&dist, &max_entry.dist) == std::cmp::Ordering::Less
                {
                    heap.push(DistContact {
                        dist,
                        contact: contact.clone(),
                    });
                    heap.pop();
                }
            }
        }

        heap.into_sorted_vec().into_iter().map(|dc| dc.contact).collect()
    }

    pub fn bucket(&self, idx: usize) -> Option<&[Contact]> {
        self.buckets.get(idx).map(|b| b.contacts.as_slice())
    }

    /// Replace bucket `idx` wholesale if it still holds exactly `expected`.
    pub fn replace_bucket(
        &mut self,
        idx: usize,
        expected: &[Address],
        replacement: Vec<Contact>,
    ) -> Result<(), BucketUpdateError> {
        if idx >= self.buckets.len() {
            return Err(BucketUpdateError::IndexOutOfRange(idx));
        }
        let current: Vec<Address> = self.buckets[idx].contacts.iter().map(|c| c.address).collect();
        if current != expected {
            return Err(BucketUpdateError::Conflict);
        }
        if replacement.len() > self.k {
            return Err(BucketUpdateError::TooManyContacts {
                len: replacement.len(),
                k: self.k,
            });
        }
        let mut seen = HashSet::with_capacity(replacement.len());
        for contact in &replacement {
            if contact.address == self.self_address {
                return Err(BucketUpdateError::SelfContact);
            }
            if !contact.address.is_valid() || self.bucket_index_of(&contact.address) != idx {
                return Err(BucketUpdateError::Misplaced(contact.address));
            }
            if !seen.insert(contact.address) {
                return Err(BucketUpdateError::Duplicate(contact.address));
            }
        }

        let bucket = &mut self.buckets[idx];
        bucket.contacts = replacement;
        bucket.mark_refreshed();
        Ok(())
    }

    /// Evict then insert. Inserts that find their bucket full are returned.
    pub fn apply_bucket_diff(&mut self, diff: BucketDiff) -> Vec<Contact> {
        for address in &diff.evict {
            let _ = self.remove(address);
        }
        let mut rejected = Vec::new();
        for contact in diff.insert {
            match self.insert_or_refresh(contact.clone()) {
                InsertOutcome::Inserted | InsertOutcome::Refreshed => {}
                InsertOutcome::Ignored | InsertOutcome::Pending(_) => rejected.push(contact),
            }
        }
        rejected
    }

    /// Re-index every contact around a new local address. Contacts that no
    /// longer fit are returned.
    pub fn rekey(&mut self, new_address: Address) -> Vec<Contact> {
        let contacts: Vec<Contact> = self
            .buckets
            .iter_mut()
            .flat_map(|b| std::mem::take(&mut b.contacts))
            .collect();
        self.self_address = new_address;
        self.self_key = new_address.routing_key();

        let mut dropped = Vec::new();
        for contact in contacts {
            match self.insert_or_refresh(contact.clone()) {
                InsertOutcome::Inserted | InsertOutcome::Refreshed => {}
                InsertOutcome::Ignored | InsertOutcome::Pending(_) => dropped.push(contact),
            }
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(bucket index, occupancy)` for every non-empty bucket.
    pub fn bucket_sizes(&self) -> Vec<(usize, usize)> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.contacts.is_empty())
            .map(|(idx, b)| (idx, b.contacts.len()))
            .collect()
    }

    fn stale_bucket_indices(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| !bucket.contacts.is_empty() && bucket.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    fn mark_bucket_refreshed(&mut self, bucket_idx: usize) {
        if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
            bucket.mark_refreshed();
        }
    }
}

// ============================================================================
// Value Store
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct EntryMetadata {
    pub owner: Address,
    pub timestamp_ms: u64,
}

impl EntryMetadata {
    pub fn new(owner: Address) -> Self {
        Self {
            owner,
            timestamp_ms: now_ms(),
        }
    }

    /// Wire form: `{"owner": bytes, "timestamp": u64}`.
    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::Text("owner".into()), self.owner.to_value()),
            (Value::Text("timestamp".into()), Value::from(self.timestamp_ms)),
        ])
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let entries = value.as_map()?;
        let field = |name: &str| {
            entries
                .iter()
                .find(|(k, _)| k.as_text() == Some(name))
                .map(|(_, v)| v)
        };
        let owner = Address::from_value(field("owner")?)?;
        let timestamp_ms = field("timestamp")?
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())?;
        Some(Self {
            owner,
            timestamp_ms,
        })
    }
}

#[derive(Clone, Debug)]
struct StoredEntry {
    value: Value,
    metadata: EntryMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreRejection {
    /// The key is owned by another address and ownership is enforced.
    NotOwner,
    /// The store holds `MAX_STORE_ENTRIES` keys already.
    StoreFull,
    InvalidKey,
}

impl std::fmt::Display for StoreRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreRejection::NotOwner => write!(f, "key is owned by another address"),
            StoreRejection::StoreFull => write!(f, "store is full"),
            StoreRejection::InvalidKey => write!(f, "invalid key"),
        }
    }
}

impl std::error::Error for StoreRejection {}

#[derive(Debug)]
pub struct ValueStore {
    entries: HashMap<String, StoredEntry>,
    capacity: usize,
}

impl ValueStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    /// Upsert `key`. Entries are never expired implicitly.
    pub fn store(
        &mut self,
        key: &str,
        value: Value,
        metadata: EntryMetadata,
        enforce_owner: bool,
    ) -> Result<(), StoreRejection> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(StoreRejection::InvalidKey);
        }
        match self.entries.get_mut(key) {
            Some(existing) => {
                if enforce_owner && existing.metadata.owner != metadata.owner {
                    return Err(StoreRejection::NotOwner);
                }
                existing.value = value;
                existing.metadata = metadata;
            }
            None => {
                if self.entries.len() >= self.capacity {
                    return Err(StoreRejection::StoreFull);
                }
                self.entries
                    .insert(key.to_string(), StoredEntry { value, metadata });
            }
        }
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Option<(Value, EntryMetadata)> {
        self.entries
            .get(key)
            .map(|e| (e.value.clone(), e.metadata.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Node Info Cache
// ============================================================================

/// Dialable contacts we could not connect to because of the outward limit.
#[derive(Debug)]
pub struct NodeInfoCache {
    entries: LruCache<Address, Contact>,
}

impl NodeInfoCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Contacts without an endpoint cannot be dialed and are not kept.
    pub fn remember(&mut self, contact: Contact) -> bool {
        if contact.endpoint.is_none() {
            return false;
        }
        self.entries.put(contact.address, contact);
        true
    }

    /// Remove and return the most recently learned contact.
    pub fn take_freshest(&mut self) -> Option<Contact> {
        let address = self.entries.iter().next().map(|(addr, _)| *addr)?;
        self.entries.pop(&address)
    }

    pub fn forget(&mut self, address: &Address) {
        self.entries.pop(address);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// DHT Node (Actor Handle)
// ============================================================================

#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub k: usize,
    pub alpha: usize,
    pub tau: usize,
    pub store_capacity: usize,
    pub node_info_capacity: usize,
    pub lookup_round_timeout: Duration,
    pub lookup_total_timeout: Duration,
    pub max_lookup_iterations: usize,
    pub refresh_interval: Duration,
    pub stale_threshold: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self::from_node_config(&NodeConfig::default())
    }
}

impl DhtConfig {
    pub fn from_node_config(config: &NodeConfig) -> Self {
        Self {
            k: config.subnet.k as usize,
            alpha: config.subnet.alpha as usize,
            tau: config.subnet.tau as usize,
            store_capacity: MAX_STORE_ENTRIES,
            node_info_capacity: config.node_info_capacity,
            lookup_round_timeout: config.lookup_round_timeout,
            lookup_total_timeout: config.lookup_total_timeout,
            max_lookup_iterations: config.max_lookup_iterations,
            refresh_interval: BUCKET_REFRESH_INTERVAL,
            stale_threshold: BUCKET_STALE_THRESHOLD,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoutingSnapshot {
    pub self_address: Option<Address>,
    pub peers: usize,
    /// `(bucket index, occupancy)` for non-empty buckets.
    pub bucket_fill: Vec<(usize, usize)>,
    pub stored_keys: usize,
    pub cached_nodes: usize,
}

pub struct DhtNode<N: DhtRpc> {
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    config: Arc<DhtConfig>,
}

impl<N: DhtRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            network: self.network.clone(),
            config: self.config.clone(),
        }
    }
}

struct DhtNodeActor<N: DhtRpc> {
    routing: RoutingTable,
    store: ValueStore,
    node_info: NodeInfoCache,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
}

type LocalValue = Option<(Value, EntryMetadata)>;

enum Command {
    // State updates
    ObservePeer(Contact),
    RemovePeer(Address, oneshot::Sender<Option<Contact>>),
    RememberNodes(Vec<Contact>),
    TakeCachedNode(oneshot::Sender<Option<Contact>>),
    ForgetNode(Address),
    Rekey(Address, oneshot::Sender<Vec<Contact>>),

    // Queries
    LookupContact(Address, oneshot::Sender<Option<Contact>>),
    Closest(RoutingKey, usize, oneshot::Sender<Vec<Contact>>),
    GetLookupParams(RoutingKey, oneshot::Sender<(Address, Vec<Contact>)>),
    GetLocal(String, oneshot::Sender<LocalValue>),
    Snapshot(oneshot::Sender<RoutingSnapshot>),

    // RPC Handlers
    HandleFindValue(String, oneshot::Sender<FindValueReply>),
    StoreLocal(String, Value, EntryMetadata, bool, oneshot::Sender<Result<(), StoreRejection>>),

    // Bucket mutation
    ReplaceBucket(
        usize,
        Vec<Address>,
        Vec<Contact>,
        oneshot::Sender<Result<(), BucketUpdateError>>,
    ),
    ApplyBucketDiff(BucketDiff, oneshot::Sender<Vec<Contact>>),
    GetBucket(usize, oneshot::Sender<Option<Vec<Contact>>>),

    // Maintenance
    GetStaleBuckets(Duration, oneshot::Sender<Vec<(usize, RoutingKey)>>),
    MarkBucketRefreshed(usize),
    ApplyPingResult(PendingBucketUpdate, bool),

    Quit,
}

#[derive(Clone)]
enum LookupGoal {
    Node,
    Value(String),
}

enum QueryOutcome {
    Nodes(Vec<Contact>),
    Found(Value, EntryMetadata),
}

struct LookupOutcome {
    closest: Vec<Contact>,
    found: LocalValue,
}

fn actor_closed() -> anyhow::Error {
    anyhow!("Actor closed")
}

impl<N: DhtRpc> DhtNode<N> {
    pub fn new(self_address: Address, network: N, config: DhtConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let network = Arc::new(network);

        let actor = DhtNodeActor {
            routing: RoutingTable::new(self_address, config.k, config.tau),
            store: ValueStore::new(config.store_capacity),
            node_info: NodeInfoCache::new(config.node_info_capacity),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            network: network.clone(),
        };

        tokio::spawn(actor.run());

        let node = Self {
            cmd_tx,
            network,
            config: Arc::new(config),
        };

        node.spawn_periodic_bucket_refresh();
        node
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| actor_closed())?;
        rx.await.map_err(|_| actor_closed())
    }

    /// Record a connected peer. A full bucket triggers a ping of its oldest entry.
    pub async fn observe_peer(&self, contact: Contact) {
        let _ = self.cmd_tx.send(Command::ObservePeer(contact)).await;
    }

    pub async fn remove_peer(&self, address: &Address) -> Option<Contact> {
        self.request(|tx| Command::RemovePeer(*address, tx))
            .await
            .ok()
            .flatten()
    }

    pub async fn lookup_contact(&self, address: &Address) -> Option<Contact> {
        self.request(|tx| Command::LookupContact(*address, tx))
            .await
            .ok()
            .flatten()
    }

    pub async fn closest(&self, target: &RoutingKey, count: usize) -> Vec<Contact> {
        self.request(|tx| Command::Closest(*target, count, tx))
            .await
            .unwrap_or_default()
    }

    /// FIND_NODE: the k closest known contacts to `target`.
    pub async fn handle_find_node(&self, target: &RoutingKey) -> Vec<Contact> {
        self.closest(target, self.config.k).await
    }

    /// FIND_VALUE: the stored value, or the k closest contacts to the key.
    pub async fn handle_find_value(&self, key: &str) -> FindValueReply {
        self.request(|tx| Command::HandleFindValue(key.to_string(), tx))
            .await
            .unwrap_or(FindValueReply::Closer(Vec::new()))
    }

    pub async fn store_local(
        &self,
        key: &str,
        value: Value,
        metadata: EntryMetadata,
        enforce_owner: bool,
    ) -> Result<()> {
        self.request(|tx| Command::StoreLocal(key.to_string(), value, metadata, enforce_owner, tx))
            .await?
            .map_err(anyhow::Error::from)
    }

    pub async fn get_local(&self, key: &str) -> LocalValue {
        self.request(|tx| Command::GetLocal(key.to_string(), tx))
            .await
            .ok()
            .flatten()
    }

    pub async fn replace_bucket(
        &self,
        idx: usize,
        expected: Vec<Address>,
        replacement: Vec<Contact>,
    ) -> Result<()> {
        self.request(|tx| Command::ReplaceBucket(idx, expected, replacement, tx))
            .await?
            .map_err(anyhow::Error::from)
    }

    /// Contents of bucket `idx`, oldest first. `None` if it does not exist.
    pub async fn bucket(&self, idx: usize) -> Result<Option<Vec<Contact>>> {
        self.request(|tx| Command::GetBucket(idx, tx)).await
    }

    /// Returns the inserts that did not fit.
    pub async fn apply_bucket_diff(&self, diff: BucketDiff) -> Result<Vec<Contact>> {
        self.request(|tx| Command::ApplyBucketDiff(diff, tx)).await
    }

    /// Keep dialable contacts that are not in the routing table for later.
    pub async fn remember_nodes(&self, contacts: Vec<Contact>) {
        let _ = self.cmd_tx.send(Command::RememberNodes(contacts)).await;
    }

    pub async fn take_cached_node(&self) -> Option<Contact> {
        self.request(Command::TakeCachedNode).await.ok().flatten()
    }

    pub async fn forget_node(&self, address: &Address) {
        let _ = self.cmd_tx.send(Command::ForgetNode(*address)).await;
    }

    /// Rebuild the routing table around a new local address.
    pub async fn rekey(&self, new_address: Address) -> Result<Vec<Contact>> {
        self.request(|tx| Command::Rekey(new_address, tx)).await
    }

    pub async fn snapshot(&self) -> RoutingSnapshot {
        self.request(Command::Snapshot).await.unwrap_or_default()
    }

    fn spawn_periodic_bucket_refresh(&self) {
        let node = self.clone();
        let period = self.config.refresh_interval;
        let threshold = self.config.stale_threshold;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;

                let stale = node.request(|tx| Command::GetStaleBuckets(threshold, tx)).await;
                let stale_buckets = match stale {
                    Ok(buckets) => buckets,
                    Err(_) => break,
                };

                if stale_buckets.is_empty() {
                    continue;
                }

                debug!(count = stale_buckets.len(), "refreshing stale routing buckets");

                for (bucket_idx, target) in stale_buckets {
                    if let Err(e) = node.iterative_find_node(target).await {
                        debug!(bucket = bucket_idx, error = ?e, "bucket refresh lookup failed");
                    }
                    let _ = node.cmd_tx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
                }
            }
        });
    }

    pub async fn iterative_find_node(&self, target: RoutingKey) -> Result<Vec<Contact>> {
        let outcome = self.iterative_lookup(target, LookupGoal::Node).await?;
        Ok(outcome.closest)
    }

    pub async fn iterative_find_value(&self, key: &str) -> Result<LocalValue> {
        let outcome = self
            .iterative_lookup(RoutingKey::for_key(key), LookupGoal::Value(key.to_string()))
            .await?;
        Ok(outcome.found)
    }

    async fn iterative_lookup(
        &self,
        target: RoutingKey,
        goal: LookupGoal,
    ) -> Result<LookupOutcome> {
        let lookup_start = Instant::now();
        let k = self.config.k;
        let alpha = self.config.alpha.max(1);
        let tau = self.config.tau;
        let round_timeout = self.config.lookup_round_timeout;

        let (self_address, mut shortlist) = self
            .request(|tx| Command::GetLookupParams(target, tx))
            .await?;

        let mut seen: HashSet<Address> = shortlist.iter().map(|c| c.address).collect();
        let mut queried: HashSet<Address> = HashSet::new();
        let mut failed: HashSet<Address> = HashSet::new();
        let mut iteration = 0;
        let mut failures = 0usize;

        let mut best_distance = shortlist
            .first()
            .map(|c| distance(&c.address.routing_key(), &target, tau))
            .unwrap_or([0xff; ROUTING_KEY_LEN]);

        loop {
            iteration += 1;
            if iteration > self.config.max_lookup_iterations {
                warn!(
                    target = %hex::encode(&target.as_bytes()[..8]),
                    iterations = iteration,
                    "iterative lookup exceeded max iterations"
                );
                break;
            }

            if lookup_start.elapsed() > self.config.lookup_total_timeout {
                debug!(
                    target = %hex::encode(&target.as_bytes()[..8]),
                    elapsed_ms = lookup_start.elapsed().as_millis(),
                    found = shortlist.len(),
                    "iterative lookup timeout, returning current results"
                );
                break;
            }

            let candidates: Vec<Contact> = shortlist
                .iter()
                .filter(|c| !queried.contains(&c.address) && c.address != self_address)
                .take(alpha)
                .cloned()
                .collect();

            if candidates.is_empty() {
                break;
            }

            for c in &candidates {
                queried.insert(c.address);
            }

            let mut join_set = JoinSet::new();
            let candidates_len = candidates.len();
            for (idx, contact) in candidates.into_iter().enumerate() {
                let net = self.network.clone();
                let goal = goal.clone();
                join_set.spawn(async move {
                    let query = async {
                        match &goal {
                            LookupGoal::Node => {
                                net.find_node(&contact, target).await.map(QueryOutcome::Nodes)
                            }
                            LookupGoal::Value(key) => {
                                net.find_value(&contact, key).await.map(|reply| match reply {
                                    FindValueReply::Found { value, metadata } => {
                                        QueryOutcome::Found(value, metadata)
                                    }
                                    FindValueReply::Closer(nodes) => QueryOutcome::Nodes(nodes),
                                })
                            }
                        }
                    };
                    let result = match tokio::time::timeout(round_timeout, query).await {
                        Ok(r) => r,
                        Err(_) => Err(anyhow!("query timeout")),
                    };
                    (idx, contact, result)
                });
            }

            let mut results: Vec<Option<(Contact, Result<QueryOutcome>)>> =
                Vec::with_capacity(candidates_len);
            results.resize_with(candidates_len, || None);
            while let Some(joined) = join_set.join_next().await {
                if let Ok((idx, contact, result)) = joined {
                    results[idx] = Some((contact, result));
                }
            }

            let mut any_closer = false;

            for (contact, result) in results.into_iter().flatten() {
                match result {
                    Ok(QueryOutcome::Found(value, metadata)) => {
                        debug!(
                            target = %hex::encode(&target.as_bytes()[..8]),
                            from = %contact.address,
                            "iterative lookup found value"
                        );
                        join_set.abort_all();
                        shortlist.retain(|c| !failed.contains(&c.address));
                        return Ok(LookupOutcome {
                            closest: shortlist,
                            found: Some((value, metadata)),
                        });
                    }
                    Ok(QueryOutcome::Nodes(nodes)) => {
                        for n in nodes {
                            if n.address == self_address || !n.address.is_valid() {
                                continue;
                            }
                            if seen.insert(n.address) {
                                shortlist.push(n);
                            }
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        failed.insert(contact.address);
                        trace!(peer = %contact.address, error = %e, "lookup query failed");
                    }
                }
            }

            // Contacts that did not answer are not results.
            shortlist.retain(|c| !failed.contains(&c.address));

            shortlist.sort_by(|a, b| {
                let da = distance(&a.address.routing_key(), &target, tau);
                let db = distance(&b.address.routing_key(), &target, tau);
                distance_cmp(&da, &db)
            });

            if shortlist.len() > k {
                shortlist.truncate(k);
            }

            if let Some(first) = shortlist.first() {
                let new_best = distance(&first.address.routing_key(), &target, tau);
                if distance_cmp(&new_best, &best_distance) == std::cmp::Ordering::Less {
                    best_distance = new_best;
                    any_closer = true;
                }
            }

            if !any_closer {
                break;
            }
        }

        debug!(
            target = %hex::encode(&target.as_bytes()[..8]),
            found = shortlist.len(),
            queried = queried.len(),
            failures,
            "iterative lookup completed"
        );

        self.remember_nodes(shortlist.clone()).await;

        Ok(LookupOutcome {
            closest: shortlist,
            found: None,
        })
    }

    /// Store locally, then at the k closest nodes. Returns how many remote
    /// nodes accepted the value.
    pub async fn put(&self, key: &str, value: Value, owner: Address) -> Result<usize> {
        self.store_local(key, value.clone(), EntryMetadata::new(owner), false)
            .await?;

        let closest = self.iterative_find_node(RoutingKey::for_key(key)).await?;
        let mut join_set = JoinSet::new();
        for contact in closest.into_iter().take(self.config.k) {
            let net = self.network.clone();
            let key = key.to_string();
            let value = value.clone();
            join_set.spawn(async move { net.store(&contact, &key, value).await });
        }

        let mut stored = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => stored += 1,
                Ok(Err(e)) => trace!(error = %e, "replica store failed"),
                Err(e) => trace!(error = %e, "replica store task failed"),
            }
        }
        debug!(key, replicas = stored, "put completed");
        Ok(stored)
    }

    pub async fn get(&self, key: &str) -> Result<LocalValue> {
        if let Some(local) = self.get_local(key).await {
            return Ok(Some(local));
        }
        self.iterative_find_value(key).await
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl<N: DhtRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::ObservePeer(contact) => {
                    self.insert_contact_into_routing(contact);
                }
                Command::RemovePeer(address, reply) => {
                    let _ = reply.send(self.routing.remove(&address));
                }
                Command::RememberNodes(contacts) => {
                    for contact in contacts {
                        if !self.routing.contains(&contact.address)
                            && contact.address != self.routing.self_address()
                        {
                            self.node_info.remember(contact);
                        }
                    }
                }
                Command::TakeCachedNode(reply) => {
                    let _ = reply.send(self.node_info.take_freshest());
                }
                Command::ForgetNode(address) => {
                    self.node_info.forget(&address);
                }
                Command::Rekey(address, reply) => {
                    let dropped = self.routing.rekey(address);
                    let _ = reply.send(dropped);
                }
                Command::LookupContact(address, reply) => {
                    let _ = reply.send(self.routing.lookup_contact(&address));
                }
                Command::Closest(target, count, reply) => {
                    let _ = reply.send(self.routing.closest(&target, count));
                }
                Command::GetLookupParams(target, reply) => {
                    let k = self.routing.k();
                    let closest = self.routing.closest(&target, k);
                    let _ = reply.send((self.routing.self_address(), closest));
                }
                Command::GetLocal(key, reply) => {
                    let _ = reply.send(self.store.lookup(&key));
                }
                Command::Snapshot(reply) => {
                    let snapshot = RoutingSnapshot {
                        self_address: Some(self.routing.self_address()),
                        peers: self.routing.len(),
                        bucket_fill: self.routing.bucket_sizes(),
                        stored_keys: self.store.len(),
                        cached_nodes: self.node_info.len(),
                    };
                    let _ = reply.send(snapshot);
                }
                Command::HandleFindValue(key, reply) => {
                    let response = match self.store.lookup(&key) {
                        Some((value, metadata)) => FindValueReply::Found { value, metadata },
                        None => {
                            let k = self.routing.k();
                            FindValueReply::Closer(
                                self.routing.closest(&RoutingKey::for_key(&key), k),
                            )
                        }
                    };
                    let _ = reply.send(response);
                }
                Command::StoreLocal(key, value, metadata, enforce_owner, reply) => {
                    let result = self.store.store(&key, value, metadata, enforce_owner);
                    if let Err(ref e) = result {
                        debug!(key = %key, reason = %e, "store rejected");
                    }
                    let _ = reply.send(result);
                }
                Command::ReplaceBucket(idx, expected, replacement, reply) => {
                    let _ = reply.send(self.routing.replace_bucket(idx, &expected, replacement));
                }
                Command::ApplyBucketDiff(diff, reply) => {
                    let _ = reply.send(self.routing.apply_bucket_diff(diff));
                }
                Command::GetBucket(idx, reply) => {
                    let _ = reply.send(self.routing.bucket(idx).map(<[Contact]>::to_vec));
                }
                Command::GetStaleBuckets(threshold, reply) => {
                    let self_key = self.routing.self_address().routing_key();
                    let tau = self.routing.tau();
                    let buckets = self
                        .routing
                        .stale_bucket_indices(threshold)
                        .into_iter()
                        .map(|idx| (idx, random_key_for_bucket(&self_key, idx, tau)))
                        .collect();
                    let _ = reply.send(buckets);
                }
                Command::MarkBucketRefreshed(idx) => {
                    self.routing.mark_bucket_refreshed(idx);
                }
                Command::ApplyPingResult(pending, alive) => {
                    self.routing.apply_ping_result(pending, alive);
                }
                Command::Quit => {
                    break;
                }
            }
        }
    }

    fn insert_contact_into_routing(&mut self, contact: Contact) {
        self.node_info.forget(&contact.address);
        if let InsertOutcome::Pending(update) = self.routing.insert_or_refresh(contact) {
            let network = self.network.clone();
            let tx = self.cmd_tx.clone();
            tokio::spawn(async move {
                let alive = network.ping(&update.oldest).await.is_ok();
                trace!(
                    oldest = %update.oldest.address,
                    alive,
                    "bucket full, pinged oldest contact"
                );
                let _ = tx.send(Command::ApplyPingResult(update, alive)).await;
            });
        }
    }
}
