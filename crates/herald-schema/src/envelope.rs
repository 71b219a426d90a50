use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::Result;

/// Application-visible record: a JSON object of schema fields.
pub type Record = Map<String, Value>;

/// Reserved field carrying the schema index inside the payload.
pub const SCHEMA_FIELD: &str = "__schema";

/// Reserved field carrying the sender identity inside the payload.
pub const SENDER_FIELD: &str = "__uuid";

/// A decoded message: the application record plus its reserved metadata.
///
/// The reserved fields never appear in [`Envelope::record`]; they are
/// exposed through accessors instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    schema_index: u8,
    sender: Option<String>,
    record: Record,
}

impl Envelope {
    pub fn new(schema_index: u8, sender: Option<String>, record: Record) -> Self {
        Self {
            schema_index,
            sender,
            record,
        }
    }

    /// Index of the schema this message was encoded with.
    pub fn schema_index(&self) -> u8 {
        self.schema_index
    }

    /// Identity of the originating peer, when identity is tracked.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// The application fields.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Look up one application field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.record.get(field)
    }

    /// Deserialize the application fields into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.record.clone()))?)
    }

    /// Consume the envelope, keeping only the application fields.
    pub fn into_record(self) -> Record {
        self.record
    }

    /// Drop sender identity (single-peer delivery).
    pub fn without_sender(mut self) -> Self {
        self.sender = None;
        self
    }
}
