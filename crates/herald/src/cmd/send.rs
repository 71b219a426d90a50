use std::fs;
use std::time::Duration;

use herald_peer::{ClientEndpoint, Incoming};
use herald_schema::Record;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{io_error, peer_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_message, OutputFormat};

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let record = resolve_record(&args)?;
    let client = args.client.connect(args.schemas.load()?).await?;
    let channel = client
        .channel(&args.schema)
        .map_err(|err| peer_error("send failed", err))?;

    let responses = if args.wait {
        Some(collect_responses(&client)?)
    } else {
        None
    };

    channel
        .send(&record)
        .map_err(|err| peer_error("send failed", err))?;

    if let Some(mut responses) = responses {
        let msg = wait_for_response(&mut responses, wait_timeout).await?;
        print_message(&msg, format);
    }

    // Let queued frames reach the socket before the runtime goes away.
    if tokio::time::timeout(wait_timeout, client.shutdown()).await.is_err() {
        tracing::warn!("connection did not close cleanly");
    }
    Ok(SUCCESS)
}

fn resolve_record(args: &SendArgs) -> CliResult<Record> {
    let text = match (&args.json, &args.file) {
        (Some(json), _) => json.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?,
        (None, None) => return Err(CliError::new(USAGE, "one of --json or --file is required")),
    };
    parse_record(&text)
}

fn parse_record(text: &str) -> CliResult<Record> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(record)) => Ok(record),
        Ok(_) => Err(CliError::new(USAGE, "record must be a JSON object")),
        Err(err) => Err(CliError::new(USAGE, format!("record is not valid JSON: {err}"))),
    }
}

fn collect_responses(client: &ClientEndpoint) -> CliResult<mpsc::UnboundedReceiver<Incoming>> {
    let (tx, rx) = mpsc::unbounded_channel();
    for descriptor in client.schemas().descriptors() {
        let tx = tx.clone();
        client
            .channel(descriptor.name())
            .map_err(|err| peer_error("channel setup failed", err))?
            .on_message(move |msg| {
                let _ = tx.send(msg);
            });
    }
    Ok(rx)
}

async fn wait_for_response(
    responses: &mut mpsc::UnboundedReceiver<Incoming>,
    timeout: Duration,
) -> CliResult<Incoming> {
    match tokio::time::timeout(timeout, responses.recv()).await {
        Ok(Some(msg)) => Ok(msg),
        Ok(None) => Err(CliError::new(FAILURE, "connection closed before a response")),
        Err(_) => Err(CliError::new(
            TIMEOUT,
            format!("no response within {timeout:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_record_accepts_objects_only() {
        let record = parse_record(r#"{"text":"hi"}"#).expect("object should parse");
        assert_eq!(record.get("text"), Some(&Value::from("hi")));

        let err = parse_record("[1,2]").expect_err("array should be rejected");
        assert_eq!(err.code, USAGE);
        let err = parse_record("{oops").expect_err("bad json should be rejected");
        assert_eq!(err.code, USAGE);
    }

    #[tokio::test]
    async fn wait_for_response_times_out() {
        let (_tx, mut rx) = mpsc::unbounded_channel::<Incoming>();
        let err = wait_for_response(&mut rx, Duration::from_millis(20))
            .await
            .expect_err("nothing arrives");
        assert_eq!(err.code, TIMEOUT);
    }

    #[tokio::test]
    async fn wait_for_response_reports_closed_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel::<Incoming>();
        drop(tx);
        let err = wait_for_response(&mut rx, Duration::from_secs(1))
            .await
            .expect_err("closed channel yields no response");
        assert_eq!(err.code, FAILURE);
    }
}
