//! Binary record codecs and the schema index table.
//!
//! A schema is described by a JSON field spec such as
//! `{"text": "string", "meta": {"timestamp": "varuint"}}`. Each spec builds a
//! [`RecordCodec`], and a [`SchemaTable`] assigns every named schema the
//! 1-byte index used as the frame discriminator.

pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod field;
pub mod registry;
pub mod validator;

pub use codec::RecordCodec;
pub use config::RegistryConfig;
pub use envelope::{Envelope, Record, SCHEMA_FIELD, SENDER_FIELD};
pub use error::{Result, SchemaError};
pub use field::{Field, FieldType};
pub use registry::{SchemaDescriptor, SchemaMap, SchemaTable, MAX_SCHEMAS};
