//! # Node Configuration
//!
//! Two layers of configuration live here:
//!
//! - [`Subnet`]: the network-wide parameters every peer in a mesh must agree
//!   on. It is exchanged during connection option negotiation and any field
//!   mismatch terminates the connection.
//! - [`NodeConfig`]: purely local knobs (timeouts, cache sizes, policy flags).
//!   Peers never see these.
//!
//! | Parameter | Meaning | Default |
//! |-----------|---------|---------|
//! | `k` | bucket size / replication factor | 20 |
//! | `alpha` | lookup concurrency | 3 |
//! | `tau` | bits of the address used for distance | 256 |
//! | `beta` | address width in bits | 352 |
//! | `ell` | outward connection limit | 4 |

use std::time::Duration;

use ciborium::Value;

use crate::compression::CompressionId;
use crate::identity::ADDRESS_LEN;

/// Default bucket size / replication factor.
pub const DEFAULT_K: u32 = 20;

/// Default lookup concurrency.
pub const DEFAULT_ALPHA: u32 = 3;

/// Default number of address bits used for XOR distance.
pub const DEFAULT_TAU: u32 = 256;

/// Address width in bits (44-byte DER Ed25519 public key).
pub const DEFAULT_BETA: u32 = (ADDRESS_LEN * 8) as u32;

/// Default outward connection limit.
pub const DEFAULT_ELL: u32 = 4;

/// Upper bound for tau: distances are computed over the 32 bytes of key material.
pub const MAX_TAU: u32 = 256;

/// Default network description carried in the subnet option.
pub const DEFAULT_NETWORK: &str = "kadmesh";

/// Longest network description accepted from a peer.
const MAX_NETWORK_DESCRIPTION_LEN: usize = 256;

/// Transport a subnet runs over. Only TCP is implemented by [`crate::Node`];
/// the other ids exist so that subnets can be described and compared.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp = 0,
    Udp = 1,
    Utp = 2,
}

impl TransportKind {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(TransportKind::Tcp),
            1 => Some(TransportKind::Udp),
            2 => Some(TransportKind::Utp),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Reliable transports guarantee delivery, so SPEAK acknowledgements are optional.
    pub fn is_reliable(self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::Utp)
    }
}

// ============================================================================
// Option Errors
// ============================================================================

/// Why a connection option was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    /// The setting is not of the expected shape.
    Malformed(&'static str),
    /// A subnet field differs between the two peers.
    SubnetMismatch { field: &'static str },
    /// The subnet describes impossible parameters.
    InvalidSubnet(&'static str),
    /// No compression method is shared with the peer.
    NoCommonCompression,
    /// The requested compression id has no registered codec.
    UnsupportedCompression(u8),
    /// Option id outside the known set.
    UnknownOption(u64),
}

impl std::fmt::Display for OptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionError::Malformed(what) => write!(f, "malformed option: {what}"),
            OptionError::SubnetMismatch { field } => write!(f, "subnet mismatch on {field}"),
            OptionError::InvalidSubnet(why) => write!(f, "invalid subnet: {why}"),
            OptionError::NoCommonCompression => write!(f, "no common compression method"),
            OptionError::UnsupportedCompression(id) => {
                write!(f, "unsupported compression id {id}")
            }
            OptionError::UnknownOption(id) => write!(f, "unknown option {id}"),
        }
    }
}

impl std::error::Error for OptionError {}

// ============================================================================
// Subnet
// ============================================================================

/// Network-wide parameters. Two peers may only talk if every field matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subnet {
    pub k: u32,
    pub alpha: u32,
    pub tau: u32,
    pub beta: u32,
    pub ell: u32,
    pub transport: TransportKind,
    pub network: String,
}

impl Default for Subnet {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            tau: DEFAULT_TAU,
            beta: DEFAULT_BETA,
            ell: DEFAULT_ELL,
            transport: TransportKind::Tcp,
            network: DEFAULT_NETWORK.to_string(),
        }
    }
}

impl Subnet {
    /// Reject parameter combinations the routing layer cannot work with.
    pub fn validate(&self) -> Result<(), OptionError> {
        if self.k == 0 {
            return Err(OptionError::InvalidSubnet("k must be positive"));
        }
        if self.alpha == 0 {
            return Err(OptionError::InvalidSubnet("alpha must be positive"));
        }
        if self.tau == 0 || self.tau > MAX_TAU {
            return Err(OptionError::InvalidSubnet("tau must be within 1..=256"));
        }
        if self.beta != DEFAULT_BETA {
            return Err(OptionError::InvalidSubnet("beta must match the address width"));
        }
        if self.ell == 0 {
            return Err(OptionError::InvalidSubnet("ell must be positive"));
        }
        if self.network.len() > MAX_NETWORK_DESCRIPTION_LEN {
            return Err(OptionError::InvalidSubnet("network description too long"));
        }
        Ok(())
    }

    /// Compare against a peer's subnet, naming the first differing field.
    pub fn check(&self, remote: &Subnet) -> Result<(), OptionError> {
        let field = if self.k != remote.k {
            "k"
        } else if self.alpha != remote.alpha {
            "alpha"
        } else if self.tau != remote.tau {
            "tau"
        } else if self.beta != remote.beta {
            "beta"
        } else if self.ell != remote.ell {
            "ell"
        } else if self.transport != remote.transport {
            "transport"
        } else if self.network != remote.network {
            "network"
        } else {
            return Ok(());
        };
        Err(OptionError::SubnetMismatch { field })
    }

    /// Wire form: `[k, alpha, tau, beta, ell, transport id, network]`.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.k),
            Value::from(self.alpha),
            Value::from(self.tau),
            Value::from(self.beta),
            Value::from(self.ell),
            Value::from(self.transport.code()),
            Value::Text(self.network.clone()),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, OptionError> {
        let fields = value
            .as_array()
            .ok_or(OptionError::Malformed("subnet must be an array"))?;
        if fields.len() != 7 {
            return Err(OptionError::Malformed("subnet must have 7 fields"));
        }
        let number = |idx: usize| -> Result<u32, OptionError> {
            fields[idx]
                .as_integer()
                .and_then(|i| u32::try_from(i).ok())
                .ok_or(OptionError::Malformed("subnet field must be an unsigned integer"))
        };
        let transport = fields[5]
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .and_then(TransportKind::from_code)
            .ok_or(OptionError::Malformed("unknown transport id"))?;
        let network = fields[6]
            .as_text()
            .ok_or(OptionError::Malformed("network description must be text"))?
            .to_string();

        Ok(Self {
            k: number(0)?,
            alpha: number(1)?,
            tau: number(2)?,
            beta: number(3)?,
            ell: number(4)?,
            transport,
            network,
        })
    }
}

// ============================================================================
// Local Node Configuration
// ============================================================================

/// How WHISPER messages for peers we are not connected to get routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WhisperRouting {
    /// Look the target up with FIND_NODE, then dial it or hand the message to
    /// the closest connected peer from the lookup result.
    #[default]
    Iterative,
    /// Hand the message to the connected peer strictly closest to the target.
    Recursive,
}

/// Local node settings.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub subnet: Subnet,
    /// Endpoint announced to peers. Defaults to the bound socket address.
    pub advertised_endpoint: Option<String>,
    /// Timeout for a single request/response exchange.
    pub request_timeout: Duration,
    /// Timeout for a single query inside an iterative lookup round.
    pub lookup_round_timeout: Duration,
    /// Budget for an entire iterative lookup.
    pub lookup_total_timeout: Duration,
    pub max_lookup_iterations: usize,
    /// Capacity of the seen-broadcast set.
    pub seen_capacity: usize,
    /// Capacity of the node info cache.
    pub node_info_capacity: usize,
    pub whisper_routing: WhisperRouting,
    /// Relay SPEAK messages like SHOUT.
    pub relay_speak: bool,
    /// Acknowledge SPEAK messages. Forced on for unreliable transports.
    pub ack_speak: bool,
    /// Encrypt WHISPER payloads to the recipient.
    pub encrypt_whispers: bool,
    /// Reject STOREs that overwrite a key owned by another address.
    pub enforce_store_owner: bool,
    /// Compression ids this node can decode, in order of preference.
    pub accepted_compression: Vec<u8>,
    /// Compression id the node asks peers to use when sending to it.
    pub preferred_compression: Option<u8>,
    /// Largest transmission accepted, both on the wire and decompressed.
    pub max_transmission_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            subnet: Subnet::default(),
            advertised_endpoint: None,
            request_timeout: Duration::from_secs(5),
            lookup_round_timeout: Duration::from_secs(3),
            lookup_total_timeout: Duration::from_secs(10),
            max_lookup_iterations: 20,
            seen_capacity: crate::broadcast::DEFAULT_SEEN_CAPACITY,
            node_info_capacity: crate::dht::DEFAULT_NODE_INFO_CAPACITY,
            whisper_routing: WhisperRouting::default(),
            relay_speak: false,
            ack_speak: false,
            encrypt_whispers: true,
            enforce_store_owner: false,
            accepted_compression: vec![
                CompressionId::Zlib.code(),
                CompressionId::Gzip.code(),
                CompressionId::None.code(),
            ],
            preferred_compression: None,
            max_transmission_size: crate::wire::MAX_TRANSMISSION_SIZE,
        }
    }
}

impl NodeConfig {
    /// SPEAK acknowledgements are mandatory over unreliable transports.
    pub fn speak_requires_ack(&self) -> bool {
        self.ack_speak || !self.subnet.transport.is_reliable()
    }
}
