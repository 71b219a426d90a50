use jsonschema::Validator;
use serde_json::Value;

use crate::error::{Result, SchemaError};

pub(crate) fn compile(schema: &Value) -> Result<Validator> {
    jsonschema::validator_for(schema).map_err(|err| SchemaError::CompileFailed(err.to_string()))
}

pub(crate) fn validate_record(schema: &str, record: &Value, validator: &Validator) -> Result<()> {
    let mut errors = validator.iter_errors(record);
    if let Some(first) = errors.next() {
        let mut message = first.to_string();
        for err in errors.take(3) {
            message.push_str("; ");
            message.push_str(&err.to_string());
        }
        return Err(SchemaError::ValidationFailed {
            schema: schema.to_string(),
            message,
        });
    }

    Ok(())
}
