//! # Wire Codec
//!
//! Bit-exact framing of transmissions and messages.
//!
//! ## Transmission
//!
//! ```text
//! +----------------------+-------------------+----------------------+
//! | 13 reserved | 3 comp | length (u32 BE)   | compressed messages  |
//! +----------------------+-------------------+----------------------+
//!        2 bytes               4 bytes            length bytes
//! ```
//!
//! ## Message
//!
//! ```text
//! signature (64) | length (u32 BE) | opcode:4 reserved:11 encrypted:1 (u16 BE)
//!                | from (44) | to (44) | payload (length bytes)
//! ```
//!
//! The signature covers every byte after the signature field. Decoding never
//! verifies or decrypts; that is the caller's job (see [`crate::crypto`]).
//! Decoded messages borrow from one shared [`Bytes`] buffer, so relaying a
//! message re-sends the original bytes untouched.

use std::iter::FusedIterator;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::compression::{CompressionRegistry, MAX_COMPRESSION_ID};
use crate::crypto::{self, AuthError};
use crate::identity::{Address, Keypair, ADDRESS_LEN, SIGNATURE_LEN};
use crate::messages::{encode_payload, Opcode, Value};

/// Transmission header: 2 bytes of flags plus the 4-byte length.
pub const TRANSMISSION_HEADER_LEN: usize = 6;

/// Fixed part of every message.
pub const MESSAGE_HEADER_LEN: usize = SIGNATURE_LEN + 4 + 2 + 2 * ADDRESS_LEN;

/// Default cap on a transmission, compressed or not (16 MiB).
pub const MAX_TRANSMISSION_SIZE: usize = 16 * 1024 * 1024;

const OPCODE_SHIFT: u16 = 12;
const ENCRYPTED_FLAG: u16 = 0x0001;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum WireError {
    /// The transmission declares more bytes than were supplied.
    TruncatedTransmission { declared: usize, available: usize },
    /// Fewer bytes remain than a message header or its payload requires.
    TruncatedMessage { needed: usize, available: usize },
    /// No codec is registered for the compression id.
    UnsupportedCompression(u8),
    /// The codec failed, or the output exceeded the size limit.
    Compression(std::io::Error),
    /// Transmission larger than the configured limit.
    TooLarge { size: usize, limit: usize },
    /// Payload failed to serialize, deserialize, or left the restricted graph.
    Payload(String),
    /// Payload encryption failed.
    Encryption(AuthError),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::TruncatedTransmission { declared, available } => write!(
                f,
                "truncated transmission: declared {declared} bytes, {available} available"
            ),
            WireError::TruncatedMessage { needed, available } => write!(
                f,
                "truncated message: needed {needed} bytes, {available} available"
            ),
            WireError::UnsupportedCompression(id) => write!(f, "unsupported compression id {id}"),
            WireError::Compression(e) => write!(f, "compression failed: {e}"),
            WireError::TooLarge { size, limit } => {
                write!(f, "transmission of {size} bytes exceeds limit of {limit}")
            }
            WireError::Payload(e) => write!(f, "invalid payload: {e}"),
            WireError::Encryption(e) => write!(f, "payload encryption: {e}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Compression(e) => Some(e),
            WireError::Encryption(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// Raw Messages
// ============================================================================

/// One decoded message record. Signature and payload are unverified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub signature: Bytes,
    /// Everything after the signature: the bytes the signature covers.
    pub signed: Bytes,
    /// 4-bit opcode as found on the wire; may be unassigned.
    pub opcode: u8,
    pub encrypted: bool,
    pub from: Address,
    pub to: Address,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn opcode(&self) -> Result<Opcode, crate::messages::UnknownOpcode> {
        Opcode::try_from(self.opcode)
    }

    /// The original encoded record, for relaying.
    pub fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.signature.len() + self.signed.len());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.signed);
        out
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Serialize, optionally seal, and sign a message.
pub fn encode_message(
    to: &Address,
    opcode: Opcode,
    payload: &Value,
    signer: &Keypair,
    encrypted: bool,
) -> Result<Vec<u8>, WireError> {
    let mut body = encode_payload(payload)?;
    if encrypted {
        body = crypto::seal(to, &body).map_err(WireError::Encryption)?;
    }
    let body_len = u32::try_from(body.len()).map_err(|_| WireError::TooLarge {
        size: body.len(),
        limit: u32::MAX as usize,
    })?;

    let mut flags = (opcode.code() as u16) << OPCODE_SHIFT;
    if encrypted {
        flags |= ENCRYPTED_FLAG;
    }

    let mut signed = BytesMut::with_capacity(MESSAGE_HEADER_LEN - SIGNATURE_LEN + body.len());
    signed.put_u32(body_len);
    signed.put_u16(flags);
    signed.put_slice(signer.address().as_bytes());
    signed.put_slice(to.as_bytes());
    signed.put_slice(&body);

    let signature = signer.sign(&signed);
    let mut out = Vec::with_capacity(SIGNATURE_LEN + signed.len());
    out.extend_from_slice(&signature);
    out.extend_from_slice(&signed);
    Ok(out)
}

/// Concatenate encoded messages, compress them, and prefix the header.
pub fn encode_transmission<M: AsRef<[u8]>>(
    registry: &CompressionRegistry,
    compression_id: u8,
    messages: &[M],
) -> Result<Vec<u8>, WireError> {
    if compression_id > MAX_COMPRESSION_ID {
        return Err(WireError::UnsupportedCompression(compression_id));
    }
    let codec = registry
        .get(compression_id)
        .ok_or(WireError::UnsupportedCompression(compression_id))?;

    let total: usize = messages.iter().map(|m| m.as_ref().len()).sum();
    let mut plain = Vec::with_capacity(total);
    for message in messages {
        plain.extend_from_slice(message.as_ref());
    }
    let compressed = codec.compress(&plain).map_err(WireError::Compression)?;
    let length = u32::try_from(compressed.len()).map_err(|_| WireError::TooLarge {
        size: compressed.len(),
        limit: u32::MAX as usize,
    })?;

    let mut out = BytesMut::with_capacity(TRANSMISSION_HEADER_LEN + compressed.len());
    out.put_u16(compression_id as u16);
    out.put_u32(length);
    out.put_slice(&compressed);
    Ok(out.to_vec())
}

// ============================================================================
// Decoding
// ============================================================================

/// Parse a transmission header into `(compression id, declared length)`.
pub fn parse_transmission_header(header: &[u8; TRANSMISSION_HEADER_LEN]) -> (u8, usize) {
    let mut buf = &header[..];
    let flags = buf.get_u16();
    let length = buf.get_u32() as usize;
    ((flags & MAX_COMPRESSION_ID as u16) as u8, length)
}

/// Decode a transmission into a lazy sequence of message records.
///
/// A declared length beyond the supplied bytes is a truncation, whatever its
/// size. `limit` then bounds both the declared length and the decompressed
/// size. Bytes after the declared length are ignored.
pub fn decode_transmission(
    registry: &CompressionRegistry,
    bytes: &[u8],
    limit: usize,
) -> Result<Frames, WireError> {
    let header: &[u8; TRANSMISSION_HEADER_LEN] = bytes
        .get(..TRANSMISSION_HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or(WireError::TruncatedTransmission {
            declared: TRANSMISSION_HEADER_LEN,
            available: bytes.len(),
        })?;
    let (compression_id, declared) = parse_transmission_header(header);
    let available = bytes.len() - TRANSMISSION_HEADER_LEN;
    if declared > available {
        return Err(WireError::TruncatedTransmission {
            declared,
            available,
        });
    }
    if declared > limit {
        return Err(WireError::TooLarge {
            size: declared,
            limit,
        });
    }

    let codec = registry
        .get(compression_id)
        .ok_or(WireError::UnsupportedCompression(compression_id))?;
    let body = &bytes[TRANSMISSION_HEADER_LEN..TRANSMISSION_HEADER_LEN + declared];
    let plain = codec
        .decompress(body, limit)
        .map_err(WireError::Compression)?;
    Ok(Frames::new(Bytes::from(plain)))
}

/// Lazy, restartable iterator over the messages of one transmission.
///
/// Yields records in packing order. The first malformed record is reported
/// once, after which the iterator is exhausted.
#[derive(Clone, Debug)]
pub struct Frames {
    buffer: Bytes,
    cursor: usize,
    failed: bool,
}

impl Frames {
    fn new(buffer: Bytes) -> Self {
        Self {
            buffer,
            cursor: 0,
            failed: false,
        }
    }

    /// Start again from the first record.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.failed = false;
    }

    fn fail(&mut self, needed: usize, available: usize) -> Option<Result<RawMessage, WireError>> {
        self.failed = true;
        Some(Err(WireError::TruncatedMessage { needed, available }))
    }
}

fn read_address(bytes: &[u8]) -> Address {
    let mut raw = [0u8; ADDRESS_LEN];
    raw.copy_from_slice(&bytes[..ADDRESS_LEN]);
    Address::from_bytes(raw)
}

impl Iterator for Frames {
    type Item = Result<RawMessage, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.cursor >= self.buffer.len() {
            return None;
        }
        let start = self.cursor;
        let remaining = self.buffer.len() - start;
        if remaining < MESSAGE_HEADER_LEN {
            return self.fail(MESSAGE_HEADER_LEN, remaining);
        }

        let mut header = &self.buffer[start + SIGNATURE_LEN..start + MESSAGE_HEADER_LEN];
        let payload_len = header.get_u32() as usize;
        let flags = header.get_u16();
        let from = read_address(header);
        let to = read_address(&header[ADDRESS_LEN..]);

        let Some(total) = MESSAGE_HEADER_LEN.checked_add(payload_len) else {
            return self.fail(usize::MAX, remaining);
        };
        if remaining < total {
            return self.fail(total, remaining);
        }

        let end = start + total;
        self.cursor = end;
        Some(Ok(RawMessage {
            signature: self.buffer.slice(start..start + SIGNATURE_LEN),
            signed: self.buffer.slice(start + SIGNATURE_LEN..end),
            opcode: (flags >> OPCODE_SHIFT) as u8,
            encrypted: flags & ENCRYPTED_FLAG != 0,
            from,
            to,
            payload: self.buffer.slice(start + MESSAGE_HEADER_LEN..end),
        }))
    }
}

impl FusedIterator for Frames {}
