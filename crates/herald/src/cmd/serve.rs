use herald_peer::{Endpoint, EndpointConfig, ServerEndpoint};
use herald_transport::TransportConfig;
use tokio::sync::mpsc;

use crate::cmd::{interrupted, ServeArgs};
use crate::exit::{peer_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let schemas = args.schemas.load()?;
    let handle = herald_transport::bind(&args.url, TransportConfig::default())
        .map_err(|err| transport_error("bind failed", err))?;

    let mut config = EndpointConfig::new(schemas).with_server(handle);
    if let Some(id) = &args.id {
        config = config.with_identity(id.as_str());
    }
    let server = Endpoint::open(config)
        .await
        .map_err(|err| peer_error("server start failed", err))?
        .into_server()
        .ok_or_else(|| CliError::new(INTERNAL, "expected a server endpoint"))?;
    tracing::info!(addr = server.local_addr(), identity = %server.identity(), "serving");

    let mut received = install_handlers(&server, args.relay, format)?;
    let mut printed = 0usize;
    let interrupt = interrupted();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => break,
            message = received.recv() => {
                if message.is_none() {
                    break;
                }
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
        }
    }

    server.close();
    Ok(SUCCESS)
}

/// Print every message on every schema; returns a stream ticking once per
/// printed message.
fn install_handlers(
    server: &ServerEndpoint,
    relay: bool,
    format: OutputFormat,
) -> CliResult<mpsc::UnboundedReceiver<()>> {
    let (tx, rx) = mpsc::unbounded_channel();

    server.on_connection(|peer| {
        tracing::info!(peer = %peer.id(), remote = peer.info().remote(), "peer connected");
        let id = peer.id().clone();
        peer.on_close(move || tracing::info!(peer = %id, "peer disconnected"));
    });

    for descriptor in server.schemas().descriptors() {
        let channel = server
            .channel(descriptor.name())
            .map_err(|err| peer_error("channel setup failed", err))?;
        let relay_channel = channel.clone();
        let tx = tx.clone();
        channel.on_message(move |msg| {
            print_message(&msg, format);
            if relay {
                match relay_channel.broadcast(msg.record(), Some(msg.peer_id())) {
                    Ok(delivered) => tracing::debug!(delivered, "relayed"),
                    Err(err) => tracing::warn!(error = %err, "relay failed"),
                }
            }
            let _ = tx.send(());
        });
    }
    Ok(rx)
}
