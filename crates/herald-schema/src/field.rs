use serde_json::{json, Map, Value};

use crate::error::{Result, SchemaError};

/// The wire type of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
    String,
    /// Zigzag LEB128 signed integer.
    VarInt,
    /// LEB128 unsigned integer.
    VarUInt,
    /// Length-prefixed raw bytes, represented as an array of `0..=255` integers.
    Buffer,
    /// Length-prefixed homogeneous list.
    Array(Box<FieldType>),
    /// Nested record; fields encode in declaration order.
    Object(Vec<Field>),
}

/// A named field inside an object layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

impl FieldType {
    /// Parse a field spec.
    ///
    /// Accepted shapes: a primitive type tag string, a one-element array
    /// `[spec]`, or an object mapping field names to specs.
    pub fn parse(spec: &Value) -> Result<Self> {
        parse_at(spec, "$")
    }

    /// Parse a top-level object spec into its field list.
    pub fn parse_object(spec: &Value) -> Result<Vec<Field>> {
        match parse_at(spec, "$")? {
            FieldType::Object(fields) => Ok(fields),
            _ => Err(SchemaError::InvalidFieldSpec {
                path: "$".to_string(),
                reason: "schema must be an object of field specs".to_string(),
            }),
        }
    }

    /// Primitive type tag, if this is a primitive.
    pub fn tag(&self) -> Option<&'static str> {
        let tag = match self {
            FieldType::Bool => "bool",
            FieldType::Int8 => "int8",
            FieldType::UInt8 => "uint8",
            FieldType::Int16 => "int16",
            FieldType::UInt16 => "uint16",
            FieldType::Int32 => "int32",
            FieldType::UInt32 => "uint32",
            FieldType::Float32 => "float32",
            FieldType::Float64 => "float64",
            FieldType::String => "string",
            FieldType::VarInt => "varint",
            FieldType::VarUInt => "varuint",
            FieldType::Buffer => "buffer",
            FieldType::Array(_) | FieldType::Object(_) => return None,
        };
        Some(tag)
    }

    /// Human-readable type description (`string`, `[varuint]`, `{a, b}`).
    pub fn describe(&self) -> String {
        match self {
            FieldType::Array(item) => format!("[{}]", item.describe()),
            FieldType::Object(fields) => {
                let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
                format!("{{{}}}", names.join(", "))
            }
            primitive => primitive.tag().unwrap_or("?").to_string(),
        }
    }

    /// JSON Schema describing values accepted for this field type.
    pub fn json_schema(&self, strict: bool) -> Value {
        match self {
            FieldType::Bool => json!({ "type": "boolean" }),
            FieldType::Int8 => int_range(i8::MIN as i64, i8::MAX as i64),
            FieldType::UInt8 => int_range(0, u8::MAX as i64),
            FieldType::Int16 => int_range(i16::MIN as i64, i16::MAX as i64),
            FieldType::UInt16 => int_range(0, u16::MAX as i64),
            FieldType::Int32 => int_range(i32::MIN as i64, i32::MAX as i64),
            FieldType::UInt32 => int_range(0, u32::MAX as i64),
            FieldType::Float32 | FieldType::Float64 => json!({ "type": "number" }),
            FieldType::String => json!({ "type": "string" }),
            FieldType::VarInt => json!({ "type": "integer" }),
            FieldType::VarUInt => json!({ "type": "integer", "minimum": 0 }),
            FieldType::Buffer => json!({
                "type": "array",
                "items": int_range(0, u8::MAX as i64),
            }),
            FieldType::Array(item) => json!({
                "type": "array",
                "items": item.json_schema(strict),
            }),
            FieldType::Object(fields) => {
                let mut properties = Map::new();
                let mut required = Vec::with_capacity(fields.len());
                for field in fields {
                    properties.insert(field.name.clone(), field.ty.json_schema(strict));
                    required.push(Value::String(field.name.clone()));
                }
                json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                    "additionalProperties": !strict,
                })
            }
        }
    }
}

fn int_range(min: i64, max: i64) -> Value {
    json!({ "type": "integer", "minimum": min, "maximum": max })
}

fn parse_at(spec: &Value, path: &str) -> Result<FieldType> {
    match spec {
        Value::String(tag) => parse_tag(tag).ok_or_else(|| SchemaError::InvalidFieldSpec {
            path: path.to_string(),
            reason: format!("unknown type tag '{tag}'"),
        }),
        Value::Array(items) => match items.as_slice() {
            [item] => Ok(FieldType::Array(Box::new(parse_at(
                item,
                &format!("{path}[]"),
            )?))),
            _ => Err(SchemaError::InvalidFieldSpec {
                path: path.to_string(),
                reason: format!("array spec needs exactly one item spec, got {}", items.len()),
            }),
        },
        Value::Object(entries) => {
            let mut fields = Vec::with_capacity(entries.len());
            for (name, item) in entries {
                fields.push(Field::new(name, parse_at(item, &format!("{path}.{name}"))?));
            }
            Ok(FieldType::Object(fields))
        }
        other => Err(SchemaError::InvalidFieldSpec {
            path: path.to_string(),
            reason: format!("expected type tag, array or object, got {other}"),
        }),
    }
}

fn parse_tag(tag: &str) -> Option<FieldType> {
    let ty = match tag {
        "bool" | "boolean" => FieldType::Bool,
        "int8" => FieldType::Int8,
        "uint8" => FieldType::UInt8,
        "int16" => FieldType::Int16,
        "uint16" => FieldType::UInt16,
        "int32" => FieldType::Int32,
        "uint32" => FieldType::UInt32,
        "float32" => FieldType::Float32,
        "float64" => FieldType::Float64,
        "string" => FieldType::String,
        "varint" => FieldType::VarInt,
        "varuint" => FieldType::VarUInt,
        "buffer" => FieldType::Buffer,
        _ => return None,
    };
    Some(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_spec_in_declaration_order() {
        let spec = json!({
            "payload": "string",
            "meta": { "timestamp": "varuint" },
            "tags": ["string"],
        });
        let fields = FieldType::parse_object(&spec).unwrap();

        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["payload", "meta", "tags"]);
        assert_eq!(
            fields[1].ty,
            FieldType::Object(vec![Field::new("timestamp", FieldType::VarUInt)])
        );
        assert_eq!(fields[2].ty, FieldType::Array(Box::new(FieldType::String)));
    }

    #[test]
    fn boolean_alias() {
        assert_eq!(FieldType::parse(&json!("boolean")).unwrap(), FieldType::Bool);
        assert_eq!(FieldType::parse(&json!("bool")).unwrap(), FieldType::Bool);
    }

    #[test]
    fn rejects_unknown_tag_with_path() {
        let err = FieldType::parse_object(&json!({ "meta": { "at": "timestamp" } })).unwrap_err();
        match err {
            SchemaError::InvalidFieldSpec { path, reason } => {
                assert_eq!(path, "$.meta.at");
                assert!(reason.contains("timestamp"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_multi_item_array_spec() {
        let err = FieldType::parse(&json!(["string", "uint8"])).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidFieldSpec { .. }));
    }

    #[test]
    fn rejects_non_object_top_level() {
        assert!(FieldType::parse_object(&json!("string")).is_err());
        assert!(FieldType::parse_object(&json!(42)).is_err());
    }

    #[test]
    fn describe_types() {
        let ty = FieldType::parse(&json!({ "a": ["varuint"], "b": "bool" })).unwrap();
        assert_eq!(ty.describe(), "{a, b}");
        assert_eq!(
            FieldType::Array(Box::new(FieldType::VarUInt)).describe(),
            "[varuint]"
        );
    }

    #[test]
    fn strict_object_schema_forbids_extra_properties() {
        let ty = FieldType::parse(&json!({ "n": "uint8" })).unwrap();
        let schema = ty.json_schema(true);
        assert_eq!(schema["additionalProperties"], json!(false));
        assert_eq!(schema["required"], json!(["n"]));
        assert_eq!(schema["properties"]["n"]["maximum"], json!(255));
    }
}
