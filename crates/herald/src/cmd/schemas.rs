use herald_schema::SchemaTable;

use crate::cmd::SchemasArgs;
use crate::exit::{schema_error, CliResult, SUCCESS};
use crate::output::{print_schemas, OutputFormat};

pub fn run(args: SchemasArgs, format: OutputFormat) -> CliResult<i32> {
    let schemas = args.schemas.load()?;
    let table = SchemaTable::build(&schemas).map_err(|err| schema_error("invalid schemas", err))?;
    print_schemas(&table, format);
    Ok(SUCCESS)
}
