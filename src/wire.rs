//! Wire Codec
//!
//! Framing used on the message bus:
//!
//! ```text
//! +-------+----------------------+------------------------+
//! | 0x00  | schema id (u32, BE)  | Avro binary payload    |
//! +-------+----------------------+------------------------+
//!   1 B          4 B                   rest
//! ```
//!
//! The codec resolves the schema id through a `ReferenceResolver`, so a schema
//! registered as a graph of references encodes and decodes exactly like a
//! monolithic one.

use std::sync::Arc;

use apache_avro::types::Value;
use byteorder::{BigEndian, ByteOrder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::{Result, SchemaError};
use crate::resolver::{ReferenceResolver, ResolvedSchema};

/// Format marker in byte 0
pub const MAGIC_BYTE: u8 = 0;

/// Marker plus schema id
pub const HEADER_LEN: usize = 5;

/// A framed message, borrowed from the buffer it was parsed from.
///
/// The format marker is not stored: it is always `MAGIC_BYTE`, `parse`
/// rejects any other value and `to_bytes` always writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireEnvelope<'a> {
    pub schema_id: u32,
    pub payload: &'a [u8],
}

impl<'a> WireEnvelope<'a> {
    pub fn new(schema_id: u32, payload: &'a [u8]) -> Self {
        Self { schema_id, payload }
    }

    /// Split `bytes` into schema id and payload.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(SchemaError::MalformedEnvelope(format!(
                "{} byte(s) is shorter than the {} byte header",
                bytes.len(),
                HEADER_LEN
            )));
        }
        if bytes[0] != MAGIC_BYTE {
            return Err(SchemaError::MalformedEnvelope(format!(
                "unknown format marker {:#04x}",
                bytes[0]
            )));
        }
        Ok(Self {
            schema_id: BigEndian::read_u32(&bytes[1..HEADER_LEN]),
            payload: &bytes[HEADER_LEN..],
        })
    }

    pub fn header(schema_id: u32) -> [u8; HEADER_LEN] {
        let mut header = [MAGIC_BYTE; HEADER_LEN];
        BigEndian::write_u32(&mut header[1..], schema_id);
        header
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&Self::header(self.schema_id));
        bytes.extend_from_slice(self.payload);
        bytes
    }
}

/// Encode `value` against a compiled schema, without framing.
///
/// The value is first resolved against the schema, so plain values in union
/// positions and record fields left to their defaults are accepted.
pub fn encode_with(schema: &ResolvedSchema, value: Value) -> Result<Vec<u8>> {
    let resolved = value
        .resolve(&schema.schema)
        .map_err(|e| SchemaError::SchemaMismatch(format!("value does not fit schema {}: {}", schema.id, e)))?;
    apache_avro::to_avro_datum(&schema.schema, resolved)
        .map_err(|e| SchemaError::SchemaMismatch(format!("cannot encode with schema {}: {}", schema.id, e)))
}

/// Decode one unframed payload; every byte must be consumed.
pub fn decode_with(schema: &ResolvedSchema, payload: &[u8]) -> Result<Value> {
    let mut reader = payload;
    let value = apache_avro::from_avro_datum(&schema.schema, &mut reader, None)
        .map_err(|e| SchemaError::SchemaMismatch(format!("cannot decode with schema {}: {}", schema.id, e)))?;
    if !reader.is_empty() {
        return Err(SchemaError::SchemaMismatch(format!(
            "{} trailing byte(s) after decoding with schema {}",
            reader.len(),
            schema.id
        )));
    }
    Ok(value)
}

/// A decoded message
#[derive(Debug, Clone)]
pub struct Decoded {
    pub schema_id: u32,
    pub value: Value,
    pub schema: Arc<ResolvedSchema>,
}

/// Encodes and decodes framed Avro messages
#[derive(Clone)]
pub struct WireCodec {
    resolver: ReferenceResolver,
}

impl WireCodec {
    pub fn new(resolver: ReferenceResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &ReferenceResolver {
        &self.resolver
    }

    /// Frame `value` encoded with the schema registered under `schema_id`
    pub async fn encode(&self, schema_id: u32, value: Value) -> Result<Vec<u8>> {
        let schema = self.resolver.resolve(schema_id).await?;
        let payload = encode_with(&schema, value)?;
        trace!(schema_id, bytes = payload.len(), "Encoded message");
        Ok(WireEnvelope::new(schema_id, &payload).to_bytes())
    }

    pub async fn decode(&self, bytes: &[u8]) -> Result<Decoded> {
        let envelope = WireEnvelope::parse(bytes)?;
        let schema = self.resolver.resolve(envelope.schema_id).await?;
        let value = decode_with(&schema, envelope.payload)?;
        trace!(schema_id = envelope.schema_id, bytes = bytes.len(), "Decoded message");
        Ok(Decoded {
            schema_id: envelope.schema_id,
            value,
            schema,
        })
    }

    pub async fn encode_serde<T: Serialize>(&self, schema_id: u32, record: &T) -> Result<Vec<u8>> {
        let value = apache_avro::to_value(record)
            .map_err(|e| SchemaError::SchemaMismatch(format!("cannot convert record: {}", e)))?;
        self.encode(schema_id, value).await
    }

    /// Decode into a serde type; returns the schema id alongside
    pub async fn decode_serde<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<(u32, T)> {
        let decoded = self.decode(bytes).await?;
        let record = apache_avro::from_value::<T>(&decoded.value)
            .map_err(|e| SchemaError::SchemaMismatch(format!("cannot convert decoded record: {}", e)))?;
        Ok((decoded.schema_id, record))
    }
}
