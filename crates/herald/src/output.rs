use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use herald_peer::Incoming;
use herald_schema::{Record, SchemaTable};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    schema: &'a str,
    schema_index: u8,
    peer_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender: Option<&'a str>,
    record: &'a Record,
    timestamp: String,
}

pub fn print_message(msg: &Incoming, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                schema: msg.schema_name(),
                schema_index: msg.schema_index(),
                peer_id: msg.peer_id().as_str(),
                sender: msg.sender(),
                record: msg.record(),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SCHEMA", "INDEX", "PEER", "SENDER", "RECORD"])
                .add_row(vec![
                    msg.schema_name().to_string(),
                    msg.schema_index().to_string(),
                    msg.peer_id().to_string(),
                    msg.sender().unwrap_or("-").to_string(),
                    record_preview(msg.record()),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "schema={} ({}) peer={} sender={} record={}",
                msg.schema_name(),
                msg.schema_index(),
                msg.peer_id(),
                msg.sender().unwrap_or("-"),
                record_preview(msg.record())
            );
        }
    }
}

#[derive(Serialize)]
struct SchemaOutput<'a> {
    index: u8,
    name: &'a str,
    fields: Vec<FieldOutput<'a>>,
}

#[derive(Serialize)]
struct FieldOutput<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    ty: String,
}

pub fn print_schemas(table: &SchemaTable, format: OutputFormat) {
    let schemas: Vec<SchemaOutput<'_>> = table
        .descriptors()
        .iter()
        .map(|descriptor| SchemaOutput {
            index: descriptor.index(),
            name: descriptor.name(),
            fields: descriptor
                .user_fields()
                .iter()
                .map(|field| FieldOutput {
                    name: &field.name,
                    ty: field.ty.describe(),
                })
                .collect(),
        })
        .collect();

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&schemas).unwrap_or_else(|_| "[]".to_string())
            );
        }
        OutputFormat::Table => {
            let mut out = Table::new();
            out.load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["INDEX", "NAME", "FIELDS"]);
            for schema in &schemas {
                out.add_row(vec![
                    schema.index.to_string(),
                    schema.name.to_string(),
                    describe_fields(&schema.fields),
                ]);
            }
            println!("{out}");
        }
        OutputFormat::Pretty => {
            for schema in &schemas {
                println!(
                    "{:>3} {} {}",
                    schema.index,
                    schema.name,
                    describe_fields(&schema.fields)
                );
            }
        }
    }
}

fn describe_fields(fields: &[FieldOutput<'_>]) -> String {
    fields
        .iter()
        .map(|field| format!("{}: {}", field.name, field.ty))
        .collect::<Vec<_>>()
        .join(", ")
}

fn record_preview(record: &Record) -> String {
    serde_json::to_string(record).unwrap_or_else(|_| "<unprintable>".to_string())
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
