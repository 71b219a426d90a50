use tokio::sync::mpsc;

use crate::cmd::{interrupted, ListenArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

enum Event {
    Printed,
    Closed,
}

pub async fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let client = args.client.connect(args.schemas.load()?).await?;

    let (tx, mut events) = mpsc::unbounded_channel();
    for descriptor in client.schemas().descriptors() {
        if let Some(only) = &args.only {
            if !only.iter().any(|name| name == descriptor.name()) {
                continue;
            }
        }
        let tx = tx.clone();
        client
            .channel(descriptor.name())
            .map_err(|err| peer_error("channel setup failed", err))?
            .on_message(move |msg| {
                print_message(&msg, format);
                let _ = tx.send(Event::Printed);
            });
    }
    client.on_close(move || {
        let _ = tx.send(Event::Closed);
    });
    tracing::info!(url = %args.client.url, identity = %client.identity(), "listening");

    let mut printed = 0usize;
    let interrupt = interrupted();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => break,
            event = events.recv() => match event {
                Some(Event::Printed) => {
                    printed = printed.saturating_add(1);
                    if args.count.is_some_and(|count| printed >= count) {
                        break;
                    }
                }
                Some(Event::Closed) | None => {
                    tracing::info!("server closed the connection");
                    break;
                }
            },
        }
    }

    client.close();
    Ok(SUCCESS)
}
