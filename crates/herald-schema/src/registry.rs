use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use herald_frame::{encode_frame, Frame};
use serde_json::{json, Map, Value};

use crate::codec::RecordCodec;
use crate::config::RegistryConfig;
use crate::envelope::{Envelope, Record, SCHEMA_FIELD, SENDER_FIELD};
use crate::error::{Result, SchemaError};
use crate::field::{Field, FieldType};

/// Maximum number of schemas per table; indices must fit one byte.
pub const MAX_SCHEMAS: usize = 255;

/// Schema name → field spec, in declaration order.
///
/// Declaration order decides the wire index of each schema, so both ends of
/// a connection must declare the same schemas in the same order.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaMap {
    entries: Vec<(String, Value)>,
}

impl SchemaMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Builder form of [`SchemaMap::insert`].
    pub fn with(mut self, name: impl Into<String>, spec: Value) -> Self {
        self.insert(name, spec);
        self
    }

    /// Declare a schema. Redeclaring a name replaces its spec in place.
    pub fn insert(&mut self, name: impl Into<String>, spec: Value) {
        let name = name.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, existing)) => *existing = spec,
            None => self.entries.push((name, spec)),
        }
    }

    /// Parse from JSON text: an object of schema name → field spec.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Build from a JSON object of schema name → field spec.
    pub fn from_value(value: &Value) -> Result<Self> {
        let entries = value
            .as_object()
            .ok_or_else(|| SchemaError::InvalidFieldSpec {
                path: "$".to_string(),
                reason: "schema map must be an object".to_string(),
            })?;
        Ok(Self {
            entries: entries
                .iter()
                .map(|(name, spec)| (name.clone(), spec.clone()))
                .collect(),
        })
    }

    /// Iterate schemas in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SchemaMap {
    /// A single `message` schema with a string payload and a timestamp.
    fn default() -> Self {
        Self::new().with(
            "message",
            json!({ "payload": "string", "meta": { "timestamp": "varuint" } }),
        )
    }
}

/// One schema's name, wire index and codec. Immutable once built.
#[derive(Debug)]
pub struct SchemaDescriptor {
    name: String,
    index: u8,
    codec: RecordCodec,
}

impl SchemaDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire discriminator for this schema.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Codec including the reserved envelope fields.
    pub fn codec(&self) -> &RecordCodec {
        &self.codec
    }

    /// Application-declared fields (reserved fields excluded).
    pub fn user_fields(&self) -> &[Field] {
        &self.codec.fields()[2..]
    }

    /// Encode `record` with the reserved fields merged in.
    ///
    /// The caller's record is not modified; reserved keys it may carry are
    /// overridden by the real metadata.
    pub fn encode(&self, sender: &str, record: &Record) -> Result<Bytes> {
        let mut full = Map::with_capacity(record.len() + 2);
        full.insert(SCHEMA_FIELD.to_string(), Value::from(self.index));
        full.insert(SENDER_FIELD.to_string(), Value::from(sender));
        for (key, value) in record {
            if key != SCHEMA_FIELD && key != SENDER_FIELD {
                full.insert(key.clone(), value.clone());
            }
        }
        self.codec.encode(&Value::Object(full))
    }

    /// Encode `record` as a complete wire frame `[index][payload]`.
    pub fn encode_frame(&self, sender: &str, record: &Record) -> Result<Bytes> {
        let payload = self.encode(sender, record)?;
        let mut dst = BytesMut::with_capacity(1 + payload.len());
        encode_frame(self.index, &payload, &mut dst);
        Ok(dst.freeze())
    }

    /// Decode a payload into an envelope, checking its self-described index.
    pub fn decode(&self, payload: &[u8]) -> Result<Envelope> {
        let (found, sender, record) = split_reserved(self.codec.decode_record(payload)?);
        if found != Some(self.index) {
            return Err(SchemaError::IndexMismatch {
                expected: self.index,
                found: found.unwrap_or(u8::MAX),
            });
        }
        Ok(Envelope::new(self.index, sender, record))
    }

    /// Re-encode a payload produced under another table so it carries this
    /// schema's index. Returns the input unchanged when the index already
    /// matches.
    pub fn restamp(&self, payload: Bytes) -> Result<Bytes> {
        let (found, sender, record) = split_reserved(self.codec.decode_record(&payload)?);
        if found == Some(self.index) {
            return Ok(payload);
        }
        self.encode(sender.as_deref().unwrap_or_default(), &record)
    }
}

fn split_reserved(decoded: Map<String, Value>) -> (Option<u8>, Option<String>, Record) {
    let mut index = None;
    let mut sender = None;
    let mut record = Record::new();
    for (key, value) in decoded {
        match key.as_str() {
            SCHEMA_FIELD => index = value.as_u64().and_then(|v| u8::try_from(v).ok()),
            SENDER_FIELD => {
                if let Value::String(s) = value {
                    sender = Some(s);
                }
            }
            _ => {
                record.insert(key, value);
            }
        }
    }
    (index, sender, record)
}

/// Index-keyed table of schema codecs.
///
/// Built once from a [`SchemaMap`]; schema `i` in declaration order gets
/// wire index `i`.
#[derive(Debug)]
pub struct SchemaTable {
    descriptors: Vec<SchemaDescriptor>,
    by_name: HashMap<String, u8>,
    config: RegistryConfig,
}

impl SchemaTable {
    /// Build a table with default config.
    pub fn build(schemas: &SchemaMap) -> Result<Self> {
        Self::build_with_config(schemas, RegistryConfig::default())
    }

    /// Build a table with explicit config.
    pub fn build_with_config(schemas: &SchemaMap, config: RegistryConfig) -> Result<Self> {
        if schemas.len() > MAX_SCHEMAS {
            return Err(SchemaError::TooManySchemas {
                count: schemas.len(),
                max: MAX_SCHEMAS,
            });
        }

        let mut descriptors = Vec::with_capacity(schemas.len());
        let mut by_name = HashMap::with_capacity(schemas.len());

        for (i, (name, spec)) in schemas.iter().enumerate() {
            let index = u8::try_from(i).map_err(|_| SchemaError::TooManySchemas {
                count: schemas.len(),
                max: MAX_SCHEMAS,
            })?;

            let user_fields = FieldType::parse_object(spec)?;
            if let Some(field) = user_fields.iter().find(|f| f.name.starts_with("__")) {
                return Err(SchemaError::ReservedField {
                    schema: name.to_string(),
                    field: field.name.clone(),
                });
            }

            let mut fields = Vec::with_capacity(user_fields.len() + 2);
            fields.push(Field::new(SCHEMA_FIELD, FieldType::UInt8));
            fields.push(Field::new(SENDER_FIELD, FieldType::String));
            fields.extend(user_fields);

            let codec = RecordCodec::from_fields(name, fields, &config)?;
            tracing::debug!(schema = name, index, "registered schema");

            descriptors.push(SchemaDescriptor {
                name: name.to_string(),
                index,
                codec,
            });
            by_name.insert(name.to_string(), index);
        }

        Ok(Self {
            descriptors,
            by_name,
            config,
        })
    }

    /// Look up a schema by wire index.
    pub fn by_index(&self, index: u8) -> Option<&SchemaDescriptor> {
        self.descriptors.get(index as usize)
    }

    /// Look up a schema by name.
    pub fn by_name(&self, name: &str) -> Option<&SchemaDescriptor> {
        self.by_name
            .get(name)
            .and_then(|index| self.by_index(*index))
    }

    /// All schemas in index order.
    pub fn descriptors(&self) -> &[SchemaDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Demultiplex a received buffer: resolve its discriminator and decode.
    pub fn decode(&self, raw: Bytes) -> Result<(&SchemaDescriptor, Envelope)> {
        let frame = Frame::decode(raw)?;
        let descriptor = self
            .by_index(frame.schema)
            .ok_or(SchemaError::UnknownSchema(frame.schema))?;
        let envelope = descriptor.decode(&frame.payload)?;
        Ok((descriptor, envelope))
    }

    /// Get table configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}
