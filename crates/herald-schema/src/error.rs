/// Errors that can occur while building or using schema codecs.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// A field spec is structurally invalid or uses an unknown type tag.
    #[error("invalid field spec at {path}: {reason}")]
    InvalidFieldSpec { path: String, reason: String },

    /// A schema declares a field that collides with a reserved envelope field.
    #[error("schema '{schema}' declares reserved field '{field}'")]
    ReservedField { schema: String, field: String },

    /// More schemas were supplied than fit in a 1-byte discriminator.
    #[error("too many schemas ({count}, max {max})")]
    TooManySchemas { count: usize, max: usize },

    /// The generated constraint schema could not be compiled.
    #[error("failed to compile schema: {0}")]
    CompileFailed(String),

    /// The record failed field-constraint validation.
    #[error("validation failed for schema '{schema}': {message}")]
    ValidationFailed { schema: String, message: String },

    /// The record could not be encoded.
    #[error("encode failed at {path}: {reason}")]
    Encode { path: String, reason: String },

    /// The payload could not be decoded.
    #[error("decode failed at {path}: {reason}")]
    Decode { path: String, reason: String },

    /// The payload's self-described schema index disagrees with its discriminator.
    #[error("schema index mismatch (discriminator {expected}, payload {found})")]
    IndexMismatch { expected: u8, found: u8 },

    /// No schema registered for the given discriminator.
    #[error("no schema registered for index {0}")]
    UnknownSchema(u8),

    /// No schema registered under the given name.
    #[error("no schema named '{0}'")]
    UnknownName(String),

    /// The frame carrying the payload was malformed.
    #[error("frame error: {0}")]
    Frame(#[from] herald_frame::FrameError),

    /// The input is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchemaError>;
