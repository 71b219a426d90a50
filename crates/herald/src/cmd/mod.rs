use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Subcommand};
use herald_peer::{ClientEndpoint, Endpoint, EndpointConfig};
use herald_schema::SchemaMap;

use crate::exit::{io_error, peer_error, schema_error, CliError, CliResult, INTERNAL, TIMEOUT, USAGE};
use crate::output::OutputFormat;

pub mod listen;
pub mod schemas;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a server endpoint and print received messages.
    Serve(ServeArgs),
    /// Send a single message.
    Send(SendArgs),
    /// Connect to a server and print received messages.
    Listen(ListenArgs),
    /// Print the schema table built from a schema file.
    Schemas(SchemasArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => block_on(serve::run(args, format)),
        Command::Send(args) => block_on(send::run(args, format)),
        Command::Listen(args) => block_on(listen::run(args, format)),
        Command::Schemas(args) => schemas::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

fn block_on(command: impl Future<Output = CliResult<i32>>) -> CliResult<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("runtime setup failed", err))?;
    runtime.block_on(command)
}

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// JSON file mapping schema names to field specs. Default: the built-in
    /// `message` schema.
    #[arg(long, value_name = "FILE")]
    pub schemas: Option<PathBuf>,
}

impl SchemaArgs {
    pub fn load(&self) -> CliResult<SchemaMap> {
        load_schemas(self.schemas.as_deref())
    }
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server address (`unix:///path/to.sock` or `ws://host:port/path`).
    pub url: String,
    /// Identity to connect as. Default: a random id.
    #[arg(long)]
    pub id: Option<String>,
    /// Extra query parameter sent with the connection request (repeatable).
    #[arg(long = "query", value_name = "KEY=VALUE", value_parser = parse_query_param)]
    pub query: Vec<(String, String)>,
    /// Connection timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

impl ClientArgs {
    /// Connect a client endpoint within the configured timeout.
    pub async fn connect(&self, schemas: SchemaMap) -> CliResult<ClientEndpoint> {
        let timeout = parse_duration(&self.timeout)?;
        let mut config = EndpointConfig::new(schemas).with_remote(self.url.as_str());
        if let Some(id) = &self.id {
            config = config.with_identity(id.as_str());
        }
        for (key, value) in &self.query {
            config = config.with_query_param(key.as_str(), value.as_str());
        }

        let endpoint = tokio::time::timeout(timeout, Endpoint::open(config))
            .await
            .map_err(|_| CliError::new(TIMEOUT, format!("connect timed out after {timeout:?}")))?
            .map_err(|err| peer_error("connect failed", err))?;
        endpoint
            .into_client()
            .ok_or_else(|| CliError::new(INTERNAL, "expected a client endpoint"))
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on (`unix:///path/to.sock` or `ws://host:port`).
    pub url: String,
    #[command(flatten)]
    pub schemas: SchemaArgs,
    /// Rebroadcast every received message to all other peers.
    #[arg(long)]
    pub relay: bool,
    /// Server identity carried in messages it sends. Default: a random id.
    #[arg(long)]
    pub id: Option<String>,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub client: ClientArgs,
    #[command(flatten)]
    pub schemas: SchemaArgs,
    /// Schema to send the record on.
    #[arg(long, default_value = "message")]
    pub schema: String,
    /// Record as a JSON object.
    #[arg(long, conflicts_with = "file")]
    pub json: Option<String>,
    /// Read the JSON record from a file.
    #[arg(long, conflicts_with = "json")]
    pub file: Option<PathBuf>,
    /// Wait for one message back and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for a response when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    #[command(flatten)]
    pub client: ClientArgs,
    #[command(flatten)]
    pub schemas: SchemaArgs,
    /// Only print messages of these schemas (comma-separated).
    #[arg(long = "only", value_delimiter = ',')]
    pub only: Option<Vec<String>>,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SchemasArgs {
    #[command(flatten)]
    pub schemas: SchemaArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn load_schemas(path: Option<&Path>) -> CliResult<SchemaMap> {
    let Some(path) = path else {
        return Ok(SchemaMap::default());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
    SchemaMap::from_json(&text)
        .map_err(|err| schema_error(&format!("invalid schema file {}", path.display()), err))
}

fn parse_query_param(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{input}'")),
    }
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
pub async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "signal handler setup failed");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn query_params_split_on_first_equals() {
        assert_eq!(
            parse_query_param("room=a=b"),
            Ok(("room".to_string(), "a=b".to_string()))
        );
        assert!(parse_query_param("novalue").is_err());
        assert!(parse_query_param("=x").is_err());
    }

    #[test]
    fn missing_schema_file_uses_default_map() {
        let schemas = load_schemas(None).expect("default schemas should load");
        assert_eq!(schemas.iter().next().map(|(name, _)| name), Some("message"));
    }

    #[test]
    fn unreadable_schema_file_fails() {
        let err = load_schemas(Some(Path::new("/nonexistent/herald-schemas.json")))
            .expect_err("missing file should fail");
        assert_eq!(err.code, crate::exit::FAILURE);
    }
}
