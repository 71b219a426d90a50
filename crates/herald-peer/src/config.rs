use std::fmt;
use std::sync::Arc;

use herald_schema::{RegistryConfig, SchemaMap, SchemaTable};
use herald_transport::{Query, Remote, ServerHandle, TransportConfig};

use crate::error::{ConfigError, Result};
use crate::peer::{PeerId, CLIENT_ID_PARAM};
use crate::pubsub::PubSub;

/// Endpoint construction parameters.
///
/// Exactly one of `remote` (client mode) or `server` (server mode) must be
/// set.
#[derive(Default)]
pub struct EndpointConfig {
    /// Schemas in declaration order; the order fixes the wire indices.
    pub schemas: SchemaMap,
    /// Where a client connects to.
    pub remote: Option<Remote>,
    /// Listening transport a server accepts from.
    pub server: Option<ServerHandle>,
    /// Extra query parameters a client sends with its connection request.
    pub query_params: Query,
    /// Backend relaying broadcasts between endpoints.
    pub pubsub: Option<Arc<dyn PubSub>>,
    /// Local identity; a random one is minted when unset.
    pub identity: Option<String>,
    /// Record codec settings.
    pub registry: RegistryConfig,
    /// Socket transport settings (client mode).
    pub transport: TransportConfig,
}

impl EndpointConfig {
    /// Config with the given schemas and nothing else.
    pub fn new(schemas: SchemaMap) -> Self {
        Self {
            schemas,
            ..Self::default()
        }
    }

    pub fn with_remote(mut self, remote: impl Into<Remote>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    pub fn with_server(mut self, server: ServerHandle) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_registry_config(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_transport_config(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Check the config and build everything that does not need I/O.
    pub(crate) fn into_plan(self) -> Result<Plan> {
        let role = match (self.remote, self.server) {
            (Some(_), Some(_)) => return Err(ConfigError::BothRemoteAndServer.into()),
            (None, None) => return Err(ConfigError::NeitherRemoteNorServer.into()),
            (Some(remote), None) => Role::Client(remote),
            (None, Some(server)) => {
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(ConfigError::ServerUnavailable.into());
                }
                Role::Server(server)
            }
        };

        let table =
            SchemaTable::build_with_config(&self.schemas, self.registry).map_err(ConfigError::from)?;
        let identity = self
            .identity
            .filter(|id| !id.is_empty())
            .map_or_else(PeerId::generate, PeerId::from);

        let mut query = self.query_params;
        if matches!(role, Role::Client(_)) {
            query.insert(CLIENT_ID_PARAM.to_string(), identity.to_string());
        }

        Ok(Plan {
            role,
            setup: Setup {
                table,
                identity,
                query,
                pubsub: self.pubsub,
                transport: self.transport,
            },
        })
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("schemas", &self.schemas)
            .field("remote", &self.remote)
            .field("server", &self.server.as_ref().map(ServerHandle::local_addr))
            .field("query_params", &self.query_params)
            .field("pubsub", &self.pubsub.is_some())
            .field("identity", &self.identity)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

pub(crate) enum Role {
    Client(Remote),
    Server(ServerHandle),
}

pub(crate) struct Setup {
    pub(crate) table: SchemaTable,
    pub(crate) identity: PeerId,
    pub(crate) query: Query,
    pub(crate) pubsub: Option<Arc<dyn PubSub>>,
    pub(crate) transport: TransportConfig,
}

pub(crate) struct Plan {
    pub(crate) role: Role,
    pub(crate) setup: Setup,
}

#[cfg(test)]
mod tests {
    use herald_transport::memory;
    use serde_json::json;

    use super::*;
    use crate::error::PeerError;

    fn config_error(result: Result<Plan>) -> ConfigError {
        match result {
            Err(PeerError::Config(err)) => err,
            Err(other) => panic!("expected config error, got {other}"),
            Ok(_) => panic!("expected config error, got a plan"),
        }
    }

    #[tokio::test]
    async fn both_remote_and_server_fails() {
        let (server, connector) = memory::server();
        let config = EndpointConfig::default()
            .with_server(server)
            .with_remote(connector);
        assert!(matches!(
            config_error(config.into_plan()),
            ConfigError::BothRemoteAndServer
        ));
    }

    #[test]
    fn neither_remote_nor_server_fails() {
        assert!(matches!(
            config_error(EndpointConfig::default().into_plan()),
            ConfigError::NeitherRemoteNorServer
        ));
    }

    #[test]
    fn server_without_runtime_fails() {
        let (server, _connector) = memory::server();
        let config = EndpointConfig::default().with_server(server);
        assert!(matches!(
            config_error(config.into_plan()),
            ConfigError::ServerUnavailable
        ));
    }

    #[test]
    fn reserved_field_fails() {
        let schemas = SchemaMap::new().with("bad", json!({ "__schema": "uint8" }));
        let config = EndpointConfig::new(schemas).with_remote("ws://127.0.0.1:1");
        assert!(matches!(
            config_error(config.into_plan()),
            ConfigError::ReservedField { .. }
        ));
    }

    #[test]
    fn too_many_schemas_fails() {
        let mut schemas = SchemaMap::new();
        for i in 0..256 {
            schemas.insert(format!("s{i}"), json!({ "v": "uint8" }));
        }
        let config = EndpointConfig::new(schemas).with_remote("ws://127.0.0.1:1");
        assert!(matches!(
            config_error(config.into_plan()),
            ConfigError::TooManySchemas { count: 256, .. }
        ));
    }

    #[test]
    fn client_plan_carries_identity_as_client_id() {
        let config = EndpointConfig::default()
            .with_remote("ws://127.0.0.1:1")
            .with_identity("me")
            .with_query_param("room", "lobby");
        let plan = config.into_plan().expect("config should be valid");

        assert_eq!(plan.setup.identity, "me");
        assert_eq!(plan.setup.query.get("clientId").map(String::as_str), Some("me"));
        assert_eq!(plan.setup.query.get("room").map(String::as_str), Some("lobby"));
        assert!(plan.setup.table.by_name("message").is_some());
    }

    #[test]
    fn identity_is_minted_when_absent() {
        let plan = EndpointConfig::default()
            .with_remote("ws://127.0.0.1:1")
            .into_plan()
            .unwrap();
        assert!(!plan.setup.identity.as_str().is_empty());
    }
}
