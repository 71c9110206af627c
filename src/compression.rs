//! # Compression Codecs
//!
//! Transmissions carry a 3-bit compression id. The codec for each id is looked
//! up in a [`CompressionRegistry`]; ids without a registered codec are
//! unsupported and rejected during negotiation and decoding.
//!
//! | Id | Method | Built in |
//! |----|--------|----------|
//! | 0 | none | yes |
//! | 1 | bz2 | no |
//! | 2 | gzip | yes |
//! | 3 | lzma | no |
//! | 4 | zlib | yes |
//! | 5 | snappy | no |
//! | 6-7 | reserved | no |
//!
//! Decompression is always bounded: a codec never returns more than the
//! caller's limit, so a small transmission cannot expand into an unbounded
//! allocation.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};

/// Largest id representable in the transmission header.
pub const MAX_COMPRESSION_ID: u8 = 0b111;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressionId {
    None = 0,
    Bz2 = 1,
    Gzip = 2,
    Lzma = 3,
    Zlib = 4,
    Snappy = 5,
}

impl CompressionId {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CompressionId::None),
            1 => Some(CompressionId::Bz2),
            2 => Some(CompressionId::Gzip),
            3 => Some(CompressionId::Lzma),
            4 => Some(CompressionId::Zlib),
            5 => Some(CompressionId::Snappy),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

pub trait CompressionCodec: Send + Sync {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;

    /// Decompress `data`, failing if the output would exceed `limit` bytes.
    fn decompress(&self, data: &[u8], limit: usize) -> io::Result<Vec<u8>>;
}

fn limit_exceeded(limit: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("decompressed data exceeds {limit} bytes"),
    )
}

fn read_bounded<R: Read>(reader: R, limit: usize) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(limit_exceeded(limit));
    }
    Ok(out)
}

struct Passthrough;

impl CompressionCodec for Passthrough {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], limit: usize) -> io::Result<Vec<u8>> {
        if data.len() > limit {
            return Err(limit_exceeded(limit));
        }
        Ok(data.to_vec())
    }
}

struct Gzip;

impl CompressionCodec for Gzip {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8], limit: usize) -> io::Result<Vec<u8>> {
        read_bounded(GzDecoder::new(data), limit)
    }
}

struct Zlib;

impl CompressionCodec for Zlib {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8], limit: usize) -> io::Result<Vec<u8>> {
        read_bounded(ZlibDecoder::new(data), limit)
    }
}

/// Maps compression ids to codecs. Id 0 (none) is always present.
#[derive(Clone)]
pub struct CompressionRegistry {
    codecs: HashMap<u8, Arc<dyn CompressionCodec>>,
}

impl Default for CompressionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .codecs
            .insert(CompressionId::Gzip.code(), Arc::new(Gzip));
        registry
            .codecs
            .insert(CompressionId::Zlib.code(), Arc::new(Zlib));
        registry
    }
}

impl std::fmt::Debug for CompressionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionRegistry")
            .field("ids", &self.ids())
            .finish()
    }
}

impl CompressionRegistry {
    /// A registry that only knows the identity codec.
    pub fn empty() -> Self {
        let mut codecs: HashMap<u8, Arc<dyn CompressionCodec>> = HashMap::new();
        codecs.insert(CompressionId::None.code(), Arc::new(Passthrough));
        Self { codecs }
    }

    /// Register (or replace) the codec for `id`. Returns false for ids the
    /// header cannot carry and for id 0.
    pub fn register(&mut self, id: u8, codec: Arc<dyn CompressionCodec>) -> bool {
        if id == CompressionId::None.code() || id > MAX_COMPRESSION_ID {
            return false;
        }
        self.codecs.insert(id, codec);
        true
    }

    pub fn get(&self, id: u8) -> Option<Arc<dyn CompressionCodec>> {
        self.codecs.get(&id).cloned()
    }

    pub fn supports(&self, id: u8) -> bool {
        self.codecs.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.codecs.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
