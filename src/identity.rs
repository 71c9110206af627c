//! # Identity and Addresses
//!
//! This module defines the identity types used throughout the node:
//!
//! - [`Keypair`]: Ed25519 signing key with its cached network address
//! - [`Address`]: 44-byte DER (SubjectPublicKeyInfo) encoding of an Ed25519
//!   public key, which doubles as the peer's network address
//! - [`RoutingKey`]: 32-byte point in the XOR metric space
//! - [`Contact`]: address plus an optional dial endpoint
//!
//! ## Identity Model
//!
//! **Address = DER(Ed25519 public key)**. The DER prefix is identical for
//! every Ed25519 key, so distance is computed over the trailing 32 bytes of
//! key material only (see [`Address::routing_key`]). Arbitrary storage keys are
//! hashed into the same space with BLAKE3 (see [`RoutingKey::for_key`]).
//!
//! ## Invariants
//!
//! - `Address::from_slice(a.as_bytes()) == Some(a)`
//! - Only addresses whose DER decodes to a valid Ed25519 point carry a key
//! - The all-zero [`Address::BROADCAST`] never decodes to a key

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ciborium::Value;
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

/// Width of an address in bytes (β = 352 bits).
pub const ADDRESS_LEN: usize = 44;

/// Width of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Width of the key material used for XOR distance.
pub const ROUTING_KEY_LEN: usize = 32;

/// Longest dial endpoint (`host:port`) accepted from the wire.
pub const MAX_ENDPOINT_LEN: usize = 256;

/// SubjectPublicKeyInfo header shared by every Ed25519 public key:
/// SEQUENCE { SEQUENCE { OID 1.3.101.112 }, BIT STRING (32 bytes) }.
const ED25519_SPKI_PREFIX: [u8; ADDRESS_LEN - ROUTING_KEY_LEN] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Keypair
// ============================================================================

/// Local signing identity. The secret key never leaves this type: callers get
/// signatures and, for payload decryption, a derived X25519 scalar.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    address: Address,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_secret_key_bytes(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = Address::from_verifying_key(&signing_key.verifying_key());
        Self {
            signing_key,
            address,
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Scalar bytes of the Ed25519 key; a valid X25519 static secret for
    /// `verifying_key().to_montgomery()`.
    pub(crate) fn x25519_secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_scalar_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address)
            .field("secret", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Address
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Destination used by broadcast messages and pre-negotiation traffic.
    pub const BROADCAST: Address = Address([0u8; ADDRESS_LEN]);

    pub const fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; ADDRESS_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let mut bytes = [0u8; ADDRESS_LEN];
        bytes[..ED25519_SPKI_PREFIX.len()].copy_from_slice(&ED25519_SPKI_PREFIX);
        bytes[ED25519_SPKI_PREFIX.len()..].copy_from_slice(key.as_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    /// Parse the DER encoding back into a public key.
    /// Returns `None` for anything that is not a valid Ed25519 SPKI.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_public_key_der(&self.0).ok()
    }

    pub fn is_valid(&self) -> bool {
        self.verifying_key().is_some()
    }

    /// The trailing key material, used for XOR distance.
    pub fn routing_key(&self) -> RoutingKey {
        let mut key = [0u8; ROUTING_KEY_LEN];
        key.copy_from_slice(&self.0[ADDRESS_LEN - ROUTING_KEY_LEN..]);
        RoutingKey(key)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight bytes of key material in hex, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[ADDRESS_LEN - ROUTING_KEY_LEN..][..8])
    }

    pub fn to_value(&self) -> Value {
        Value::Bytes(self.0.to_vec())
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_bytes().and_then(|bytes| Self::from_slice(bytes))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.short())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

// ============================================================================
// Routing Keys
// ============================================================================

/// A point in the 256-bit XOR metric space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct RoutingKey([u8; ROUTING_KEY_LEN]);

impl RoutingKey {
    pub const fn from_bytes(bytes: [u8; ROUTING_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ROUTING_KEY_LEN] {
        &self.0
    }

    /// Map a storage key into the metric space.
    pub fn for_key(key: &str) -> Self {
        Self(*blake3::hash(key.as_bytes()).as_bytes())
    }

    pub fn xor(&self, other: &RoutingKey) -> [u8; ROUTING_KEY_LEN] {
        let mut out = [0u8; ROUTING_KEY_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// FIND_NODE targets arrive either as a full address or as bare key material.
    pub fn from_target_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            ADDRESS_LEN => Address::from_slice(bytes).map(|a| a.routing_key()),
            ROUTING_KEY_LEN => bytes.try_into().ok().map(Self),
            _ => None,
        }
    }
}

/// Compare two distances as big-endian integers.
#[inline]
pub fn distance_cmp(a: &[u8; ROUTING_KEY_LEN], b: &[u8; ROUTING_KEY_LEN]) -> std::cmp::Ordering {
    for i in 0..ROUTING_KEY_LEN {
        if a[i] < b[i] {
            return std::cmp::Ordering::Less;
        } else if a[i] > b[i] {
            return std::cmp::Ordering::Greater;
        }
    }
    std::cmp::Ordering::Equal
}

// ============================================================================
// Contact
// ============================================================================

/// A peer as the routing layer knows it: address and, if known, where to dial it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Contact {
    pub address: Address,
    pub endpoint: Option<String>,
}

impl Contact {
    pub fn new(address: Address, endpoint: impl Into<String>) -> Self {
        Self {
            address,
            endpoint: Some(endpoint.into()),
        }
    }

    pub fn unreachable(address: Address) -> Self {
        Self {
            address,
            endpoint: None,
        }
    }

    /// Wire form: `[address, endpoint | nil]`.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            self.address.to_value(),
            match &self.endpoint {
                Some(endpoint) => Value::Text(endpoint.clone()),
                None => Value::Null,
            },
        ])
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let fields = value.as_array()?;
        if fields.len() != 2 {
            return None;
        }
        let address = Address::from_value(&fields[0])?;
        if !address.is_valid() {
            return None;
        }
        let endpoint = match &fields[1] {
            Value::Null => None,
            Value::Text(endpoint) if !endpoint.is_empty() && endpoint.len() <= MAX_ENDPOINT_LEN => {
                Some(endpoint.clone())
            }
            _ => return None,
        };
        Some(Self { address, endpoint })
    }
}
