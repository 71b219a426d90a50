mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "herald", version, about = "Schema-typed binary messaging CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "herald",
            "send",
            "ws://127.0.0.1:9000",
            "--schema",
            "chat",
            "--json",
            "{\"text\":\"hi\"}",
            "--query",
            "room=lobby",
        ])
        .expect("send args should parse");

        let Command::Send(args) = cli.command else {
            panic!("expected send command");
        };
        assert_eq!(args.schema, "chat");
        assert_eq!(
            args.client.query,
            vec![("room".to_string(), "lobby".to_string())]
        );
    }

    #[test]
    fn rejects_conflicting_record_args() {
        let err = Cli::try_parse_from([
            "herald",
            "send",
            "unix:///tmp/h.sock",
            "--json",
            "{}",
            "--file",
            "record.json",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_serve_with_relay() {
        let cli = Cli::try_parse_from([
            "herald",
            "serve",
            "unix:///tmp/h.sock",
            "--schemas",
            "schemas.json",
            "--relay",
        ])
        .expect("serve args should parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        assert!(args.relay);
        assert_eq!(
            args.schemas.schemas.as_deref(),
            Some(std::path::Path::new("schemas.json"))
        );
    }

    #[test]
    fn rejects_malformed_query_param() {
        let err = Cli::try_parse_from(["herald", "listen", "ws://h:1", "--query", "nokey"])
            .expect_err("query without '=' should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
