use herald_schema::SchemaError;
use herald_transport::TransportError;

/// Errors raised while constructing an endpoint. Fatal.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Both a remote and a server handle were supplied.
    #[error("remote and server cannot both be set")]
    BothRemoteAndServer,

    /// Neither a remote nor a server handle was supplied.
    #[error("either a remote or a server must be set")]
    NeitherRemoteNorServer,

    /// Server mode was requested outside a tokio runtime.
    #[error("server mode needs a running tokio runtime")]
    ServerUnavailable,

    /// More schemas than fit in a 1-byte discriminator.
    #[error("too many schemas ({count}, max {max})")]
    TooManySchemas { count: usize, max: usize },

    /// A schema declares a reserved envelope field.
    #[error("schema '{schema}' declares reserved field '{field}'")]
    ReservedField { schema: String, field: String },

    /// A field spec is malformed or uses an unknown type tag.
    #[error("invalid field spec at {path}: {reason}")]
    InvalidFieldSpec { path: String, reason: String },

    /// Any other failure building the schema table.
    #[error("failed to build schema table: {0}")]
    Schema(SchemaError),
}

impl From<SchemaError> for ConfigError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::TooManySchemas { count, max } => Self::TooManySchemas { count, max },
            SchemaError::ReservedField { schema, field } => Self::ReservedField { schema, field },
            SchemaError::InvalidFieldSpec { path, reason } => {
                Self::InvalidFieldSpec { path, reason }
            }
            other => Self::Schema(other),
        }
    }
}

/// Errors that can occur in endpoint, peer and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Endpoint construction failed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Record encoding or validation failed.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No schema with this name on the endpoint.
    #[error("no schema named '{0}'")]
    UnknownSchema(String),

    /// The operation is not available in this endpoint mode.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// The peer or endpoint is closed.
    #[error("closed")]
    Closed,

    /// The pub/sub backend failed.
    #[error("pubsub error: {0}")]
    PubSub(String),
}

pub type Result<T> = std::result::Result<T, PeerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_errors_map_to_config_variants() {
        let err = ConfigError::from(SchemaError::TooManySchemas {
            count: 300,
            max: 255,
        });
        assert!(matches!(
            err,
            ConfigError::TooManySchemas {
                count: 300,
                max: 255
            }
        ));

        let err = ConfigError::from(SchemaError::CompileFailed("x".to_string()));
        assert!(matches!(err, ConfigError::Schema(_)));
    }
}
