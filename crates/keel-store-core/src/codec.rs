//! Entity ↔ bytes conversion.
//!
//! The reference serializer is compact self-describing JSON text. With
//! compression enabled the output becomes `gzip:` followed by the base64 of
//! the gzip stream; the constant prefix lets decoders tell compressed and
//! plain payloads apart without guessing, so either form can be read back
//! regardless of the writer's setting.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{de::DeserializeOwned, Serialize};

use crate::{StoreError, StoreResult};

/// Marker prepended to compressed payloads. Plain JSON can never start with
/// it, so the two forms are mutually unambiguous.
pub const COMPRESSED_PREFIX: &[u8] = b"gzip:";

/// Converts values to and from their stored byte form.
pub trait Serializer<E>: Send + Sync {
    /// Encodes `value` into its stored byte form.
    fn serialize(&self, value: &E) -> StoreResult<Vec<u8>>;

    /// Decodes a value from its stored byte form.
    fn deserialize(&self, bytes: &[u8]) -> StoreResult<E>;
}

/// The reference JSON serializer, optionally gzip-compressing.
///
/// Primitive and nullable values pass straight through serde_json, so they
/// are never double-encoded. Deserialization sniffs the compression prefix
/// and accepts both forms independently of this instance's setting.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer {
    compress: bool,
}

impl JsonSerializer {
    /// A serializer producing plain JSON text.
    pub fn new() -> Self {
        Self { compress: false }
    }

    /// A serializer producing prefixed base64 gzip streams.
    pub fn compressed() -> Self {
        Self { compress: true }
    }

    /// Whether this instance compresses on serialize.
    pub fn is_compressing(&self) -> bool {
        self.compress
    }
}

impl<E> Serializer<E> for JsonSerializer
where
    E: Serialize + DeserializeOwned + Send + Sync,
{
    fn serialize(&self, value: &E) -> StoreResult<Vec<u8>> {
        let json = serde_json::to_vec(value).map_err(StoreError::serialization)?;
        if !self.compress {
            return Ok(json);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json).map_err(StoreError::serialization)?;
        let gz = encoder.finish().map_err(StoreError::serialization)?;
        let mut out = COMPRESSED_PREFIX.to_vec();
        out.extend_from_slice(BASE64.encode(gz).as_bytes());
        Ok(out)
    }

    fn deserialize(&self, bytes: &[u8]) -> StoreResult<E> {
        if let Some(encoded) = bytes.strip_prefix(COMPRESSED_PREFIX) {
            let gz = BASE64
                .decode(encoded)
                .map_err(StoreError::serialization)?;
            let mut json = Vec::new();
            GzDecoder::new(&gz[..])
                .read_to_end(&mut json)
                .map_err(StoreError::serialization)?;
            return serde_json::from_slice(&json).map_err(StoreError::serialization);
        }
        serde_json::from_slice(bytes).map_err(StoreError::serialization)
    }
}
