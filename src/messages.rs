//! # Wire Protocol Messages
//!
//! Opcodes, connection options and the payload object model.
//!
//! Every payload is an array encoded as CBOR. Replies (ACK/NACK) echo the
//! opcode they answer as their first element.
//!
//! | Opcode | Request payload | Reply |
//! |--------|-----------------|-------|
//! | PING | `[]` | `ACK [2]` |
//! | SET_CONNECTION_OPT | `[option, setting]` | `ACK [3, option]` / `NACK [3, option, reason]` |
//! | ANNOUNCE | `[address, endpoint, nonce]` | none |
//! | CHANGE_KEY | `[new address, proof, nonce]` | none |
//! | SHOUT | `[body, nonce]` | none |
//! | SPEAK | `[body, nonce]` | optional `ACK [7]` |
//! | WHISPER | `[body]` | `ACK [8]` from the final hop |
//! | FIND_NODE | `[target]` | `ACK [9, target, contacts]` |
//! | FIND_VALUE | `[key]` | `ACK [10, key, value, metadata]` / `ACK [10, key, nil, contacts]` |
//! | STORE | `[owner, key, value]` | `ACK [11, key]` / `NACK [11, key, reason]` |
//! | CUSTOM | `[sub-opcode, body]` | `ACK [15, sub, reply]` / `NACK [15, sub, reason]` |
//!
//! ## Payload Limits
//!
//! Payloads are restricted to nil, bool, double, 64-bit integers, byte and
//! text strings, arrays and text-keyed maps. Tags and out-of-range integers are
//! rejected, as is nesting beyond [`MAX_PAYLOAD_DEPTH`].

use std::io::Cursor;

pub use ciborium::Value;

use crate::identity::Address;
use crate::wire::WireError;

/// Deepest nesting accepted in a payload.
pub const MAX_PAYLOAD_DEPTH: usize = 64;

/// Strings, byte strings, arrays and maps must stay below 2^32 elements.
const MAX_COLLECTION_LEN: usize = u32::MAX as usize;

// ============================================================================
// Opcodes
// ============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Ack = 0,
    Nack = 1,
    Ping = 2,
    SetConnectionOpt = 3,
    Announce = 4,
    ChangeKey = 5,
    Shout = 6,
    Speak = 7,
    Whisper = 8,
    FindNode = 9,
    FindValue = 10,
    Store = 11,
    Custom = 15,
}

/// Opcode outside the assigned set (12-14, or anything wider than 4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownOpcode(pub u8);

impl std::fmt::Display for UnknownOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown opcode {}", self.0)
    }
}

impl std::error::Error for UnknownOpcode {}

impl TryFrom<u8> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Opcode::Ack,
            1 => Opcode::Nack,
            2 => Opcode::Ping,
            3 => Opcode::SetConnectionOpt,
            4 => Opcode::Announce,
            5 => Opcode::ChangeKey,
            6 => Opcode::Shout,
            7 => Opcode::Speak,
            8 => Opcode::Whisper,
            9 => Opcode::FindNode,
            10 => Opcode::FindValue,
            11 => Opcode::Store,
            15 => Opcode::Custom,
            other => return Err(UnknownOpcode(other)),
        })
    }
}

impl Opcode {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Opcodes accepted before the connection is established.
    pub fn allowed_during_negotiation(self) -> bool {
        matches!(self, Opcode::SetConnectionOpt | Opcode::Ack | Opcode::Nack)
    }
}

// ============================================================================
// Connection Options
// ============================================================================

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionOption {
    /// Setting: array of compression ids the sender can decode.
    Compression = 0,
    /// Setting: the single compression id the sender wants to receive.
    PreferredCompression = 1,
    /// Setting: `[k, alpha, tau, beta, ell, transport, network]`.
    Subnet = 2,
}

impl ConnectionOption {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(ConnectionOption::Compression),
            1 => Some(ConnectionOption::PreferredCompression),
            2 => Some(ConnectionOption::Subnet),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Payload Encoding
// ============================================================================

pub fn encode_payload(value: &Value) -> Result<Vec<u8>, WireError> {
    check_payload(value)?;
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| WireError::Payload(e.to_string()))?;
    Ok(out)
}

pub fn decode_payload(bytes: &[u8]) -> Result<Value, WireError> {
    let mut cursor = Cursor::new(bytes);
    let value: Value =
        ciborium::de::from_reader(&mut cursor).map_err(|e| WireError::Payload(e.to_string()))?;
    if cursor.position() as usize != bytes.len() {
        return Err(WireError::Payload("trailing bytes after payload".into()));
    }
    check_payload(&value)?;
    Ok(value)
}

/// Reject anything outside the restricted payload object graph.
pub fn check_payload(value: &Value) -> Result<(), WireError> {
    check_value(value, 0)
}

fn check_len(len: usize, what: &str) -> Result<(), WireError> {
    if len > MAX_COLLECTION_LEN {
        return Err(WireError::Payload(format!("{what} exceeds 2^32 elements")));
    }
    Ok(())
}

fn check_value(value: &Value, depth: usize) -> Result<(), WireError> {
    if depth > MAX_PAYLOAD_DEPTH {
        return Err(WireError::Payload("payload nested too deeply".into()));
    }
    match value {
        Value::Null | Value::Bool(_) | Value::Float(_) => Ok(()),
        Value::Integer(i) => {
            let n = i128::from(*i);
            if n < i64::MIN as i128 || n > u64::MAX as i128 {
                return Err(WireError::Payload("integer exceeds 64 bits".into()));
            }
            Ok(())
        }
        Value::Bytes(bytes) => check_len(bytes.len(), "byte string"),
        Value::Text(text) => check_len(text.len(), "text string"),
        Value::Array(items) => {
            check_len(items.len(), "array")?;
            items.iter().try_for_each(|item| check_value(item, depth + 1))
        }
        Value::Map(entries) => {
            check_len(entries.len(), "map")?;
            for (key, item) in entries {
                if !key.is_text() {
                    return Err(WireError::Payload("map keys must be text".into()));
                }
                check_value(item, depth + 1)?;
            }
            Ok(())
        }
        Value::Tag(..) => Err(WireError::Payload("tagged values are not allowed".into())),
        _ => Err(WireError::Payload("unsupported value type".into())),
    }
}

// ============================================================================
// Payload Accessors
// ============================================================================

/// Elements of an array payload.
pub fn args(payload: &Value) -> Option<&[Value]> {
    payload.as_array().map(Vec::as_slice)
}

pub fn arg_u64(value: &Value) -> Option<u64> {
    value.as_integer().and_then(|i| u64::try_from(i).ok())
}

pub fn arg_text(value: &Value) -> Option<&str> {
    value.as_text()
}

pub fn arg_bytes(value: &Value) -> Option<&[u8]> {
    value.as_bytes().map(Vec::as_slice)
}

pub fn arg_address(value: &Value) -> Option<Address> {
    Address::from_value(value)
}

/// Build a reply payload: the echoed opcode followed by `rest`.
pub fn reply_payload(echo: u8, rest: Vec<Value>) -> Value {
    let mut items = Vec::with_capacity(rest.len() + 1);
    items.push(Value::from(echo));
    items.extend(rest);
    Value::Array(items)
}

/// Random nonce so identical broadcast bodies still get distinct signatures.
pub(crate) fn fresh_nonce() -> Value {
    Value::from(rand::random::<u64>())
}

// ============================================================================
// Replies and Deliveries
// ============================================================================

/// A decoded ACK or NACK. The payload is kept whole, echoed opcode included.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Ack(Vec<Value>),
    Nack(Vec<Value>),
}

impl Reply {
    pub fn from_payload(opcode: Opcode, payload: Value) -> Option<Self> {
        let items = payload.into_array().ok()?;
        match opcode {
            Opcode::Ack => Some(Reply::Ack(items)),
            Opcode::Nack => Some(Reply::Nack(items)),
            _ => None,
        }
    }

    pub fn items(&self) -> &[Value] {
        match self {
            Reply::Ack(items) | Reply::Nack(items) => items,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Reply::Ack(_))
    }

    /// The opcode this reply answers.
    pub fn echoed_opcode(&self) -> Option<u8> {
        self.items()
            .first()
            .and_then(arg_u64)
            .and_then(|code| u8::try_from(code).ok())
    }

    /// The reason text of a NACK (its last text element).
    pub fn reason(&self) -> Option<&str> {
        match self {
            Reply::Nack(items) => items.iter().rev().find_map(|v| v.as_text()),
            Reply::Ack(_) => None,
        }
    }

    /// Unwrap an ACK into its items; a NACK becomes an error carrying the reason.
    pub fn into_ack(self) -> anyhow::Result<Vec<Value>> {
        match self {
            Reply::Ack(items) => Ok(items),
            nack @ Reply::Nack(_) => Err(anyhow::anyhow!(
                "request rejected: {}",
                nack.reason().unwrap_or("no reason given")
            )),
        }
    }
}

/// A message handed to the application.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub opcode: Opcode,
    pub from: Address,
    pub body: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_opcodes_are_unknown() {
        for code in 12u8..=14 {
            assert_eq!(Opcode::try_from(code), Err(UnknownOpcode(code)));
        }
        assert_eq!(Opcode::try_from(15), Ok(Opcode::Custom));
        assert_eq!(Opcode::Store.code(), 11);
    }

    #[test]
    fn payload_roundtrip_keeps_special_floats() {
        let value = Value::Array(vec![
            Value::Float(f64::INFINITY),
            Value::Float(f64::NEG_INFINITY),
            Value::from(-5i64),
            Value::from(u64::MAX),
            Value::Null,
            Value::Map(vec![(Value::Text("a".into()), Value::Bool(true))]),
        ]);
        let decoded = decode_payload(&encode_payload(&value).expect("encode")).expect("decode");
        assert_eq!(decoded, value);

        let nan = decode_payload(&encode_payload(&Value::Float(f64::NAN)).expect("encode"))
            .expect("decode");
        assert!(matches!(nan, Value::Float(f) if f.is_nan()));
    }

    #[test]
    fn restricted_graph_rejects_tags_and_int_keys() {
        let tagged = Value::Tag(1, Box::new(Value::from(0u8)));
        assert!(encode_payload(&tagged).is_err());

        let int_keyed = Value::Map(vec![(Value::from(1u8), Value::Null)]);
        assert!(check_payload(&int_keyed).is_err());
    }

    #[test]
    fn wide_negative_integers_rejected() {
        let wide = ciborium::value::Integer::try_from(i128::from(i64::MIN) - 1).expect("fits cbor");
        let too_small = Value::Integer(wide);
        assert!(check_payload(&too_small).is_err());
    }

    #[test]
    fn deep_nesting_rejected() {
        let mut value = Value::Null;
        for _ in 0..=MAX_PAYLOAD_DEPTH + 1 {
            value = Value::Array(vec![value]);
        }
        assert!(check_payload(&value).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode_payload(&Value::Array(vec![])).expect("encode");
        bytes.push(0x00);
        assert!(decode_payload(&bytes).is_err());
    }

    #[test]
    fn reply_helpers_expose_echo_and_reason() {
        let nack = Reply::Nack(vec![
            Value::from(11u8),
            Value::Text("k".into()),
            Value::Text("store full".into()),
        ]);
        assert_eq!(nack.echoed_opcode(), Some(11));
        assert_eq!(nack.reason(), Some("store full"));
        assert!(nack.into_ack().is_err());

        let ack = Reply::from_payload(Opcode::Ack, reply_payload(2, vec![])).expect("reply");
        assert_eq!(ack, Reply::Ack(vec![Value::from(2u8)]));
    }
}
