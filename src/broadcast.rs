//! # Flood Broadcast
//!
//! SHOUT, ANNOUNCE and CHANGE_KEY are flooded: every node relays a message to
//! all connected peers except the one it arrived from, exactly once per
//! signature. SPEAK uses the same deduplication but relaying is local policy.
//!
//! | Opcode | Relay | ACK |
//! |--------|-------|-----|
//! | SHOUT | always | never |
//! | ANNOUNCE | always | never |
//! | CHANGE_KEY | always | never |
//! | SPEAK | `relay_speak` | `ack_speak`, or always over unreliable transports |
//!
//! ## Cost
//!
//! With every node holding at most ℓ outward links, one broadcast in a network
//! of n nodes costs `(2ℓ-1)·n + 1` relay messages when n ≥ 2ℓ+1 and `(n-1)²`
//! otherwise, and reaches every node within `ceil(max((n-2)/ℓ, 1))` hops.
//!
//! Signatures are the dedup key. A bounded LRU set forgets the least recently
//! received signature once it is full.

use std::num::NonZeroUsize;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::config::NodeConfig;
use crate::identity::Address;
use crate::messages::Opcode;

/// Signatures remembered per set before the oldest is forgotten.
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

/// Bounded set of recently received signatures.
#[derive(Debug)]
pub struct SeenBroadcasts {
    entries: LruCache<Bytes, ()>,
}

impl SeenBroadcasts {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// True the first time `signature` is seen; records it either way.
    pub fn should_relay(&mut self, signature: &[u8]) -> bool {
        self.entries
            .put(Bytes::copy_from_slice(signature), ())
            .is_none()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BroadcastDecision {
    /// Already seen. Deliver nothing; `ack` still answers a retransmitted SPEAK.
    Duplicate { ack: bool },
    /// First sighting: deliver locally, send to `relay_to`, ACK if asked.
    Accept { relay_to: Vec<Address>, ack: bool },
}

#[derive(Debug)]
pub struct BroadcastEngine {
    seen: Mutex<SeenBroadcasts>,
    whisper_seen: Mutex<SeenBroadcasts>,
    relay_speak: bool,
    ack_speak: bool,
}

impl BroadcastEngine {
    pub fn new(capacity: usize, relay_speak: bool, ack_speak: bool) -> Self {
        Self {
            seen: Mutex::new(SeenBroadcasts::new(capacity)),
            whisper_seen: Mutex::new(SeenBroadcasts::new(capacity)),
            relay_speak,
            ack_speak,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(
            config.seen_capacity,
            config.relay_speak,
            config.speak_requires_ack(),
        )
    }

    pub fn should_relay(&self, signature: &[u8]) -> bool {
        self.seen.lock().should_relay(signature)
    }

    /// Decide what to do with an inbound broadcast. `arrived_from` is the link
    /// peer, `connected` every established peer.
    pub fn decide(
        &self,
        opcode: Opcode,
        signature: &[u8],
        arrived_from: Option<&Address>,
        connected: &[Address],
    ) -> BroadcastDecision {
        let ack = opcode == Opcode::Speak && self.ack_speak;
        if !self.should_relay(signature) {
            return BroadcastDecision::Duplicate { ack };
        }

        let relays = match opcode {
            Opcode::Shout | Opcode::Announce | Opcode::ChangeKey => true,
            Opcode::Speak => self.relay_speak,
            _ => false,
        };
        let relay_to = if relays {
            connected
                .iter()
                .filter(|peer| Some(*peer) != arrived_from)
                .copied()
                .collect()
        } else {
            Vec::new()
        };
        BroadcastDecision::Accept { relay_to, ack }
    }

    /// Record a locally originated broadcast so echoes are dropped, and return
    /// every connected peer as the first hop.
    pub fn originate(&self, signature: &[u8], connected: &[Address]) -> Vec<Address> {
        self.should_relay(signature);
        connected.to_vec()
    }

    /// Loop suppression for routed WHISPERs.
    pub fn should_forward_whisper(&self, signature: &[u8]) -> bool {
        self.whisper_seen.lock().should_relay(signature)
    }

    pub fn seen_len(&self) -> usize {
        self.seen.lock().len()
    }
}
