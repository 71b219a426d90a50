use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use jsonschema::Validator;
use serde_json::{Map, Number, Value};

use crate::config::RegistryConfig;
use crate::error::{Result, SchemaError};
use crate::field::{Field, FieldType};
use crate::validator::{compile, validate_record};

/// Upper bound on decoded list length when items may occupy zero bytes.
const MAX_ZERO_SIZED_ITEMS: u64 = 64 * 1024;

/// Binary codec for one record layout.
///
/// Fields are written in declaration order with no tags or names on the
/// wire, so both ends must build the codec from the same spec.
pub struct RecordCodec {
    name: String,
    fields: Vec<Field>,
    validator: Validator,
}

impl RecordCodec {
    /// Build a codec from an object field spec with default configuration.
    pub fn build(name: &str, spec: &Value) -> Result<Self> {
        Self::build_with_config(name, spec, &RegistryConfig::default())
    }

    /// Build a codec from an object field spec with explicit configuration.
    pub fn build_with_config(name: &str, spec: &Value, config: &RegistryConfig) -> Result<Self> {
        let fields = FieldType::parse_object(spec)?;
        Self::from_fields(name, fields, config)
    }

    /// Build a codec from an already parsed field list.
    pub fn from_fields(name: &str, fields: Vec<Field>, config: &RegistryConfig) -> Result<Self> {
        let constraints = FieldType::Object(fields.clone()).json_schema(config.strict_mode);
        let validator = compile(&constraints)?;
        Ok(Self {
            name: name.to_string(),
            fields,
            validator,
        })
    }

    /// Schema name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Top-level fields in wire order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Check a record against the field constraints without encoding it.
    pub fn validate(&self, record: &Value) -> Result<()> {
        validate_record(&self.name, record, &self.validator)
    }

    /// Validate and encode a record.
    pub fn encode(&self, record: &Value) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.encode_into(record, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Validate and encode a record, appending to `dst`.
    pub fn encode_into(&self, record: &Value, dst: &mut BytesMut) -> Result<()> {
        self.validate(record)?;
        let map = record.as_object().ok_or_else(|| encode_err("$", "record must be an object"))?;
        encode_object(&self.fields, map, "$", dst)
    }

    /// Decode a payload produced by [`RecordCodec::encode`].
    ///
    /// The whole input must be consumed.
    pub fn decode(&self, payload: &[u8]) -> Result<Value> {
        Ok(Value::Object(self.decode_record(payload)?))
    }

    /// Decode a payload into its field map.
    pub fn decode_record(&self, payload: &[u8]) -> Result<Map<String, Value>> {
        let mut buf = payload;
        let record = decode_object(&self.fields, &mut buf, "$")?;
        if buf.has_remaining() {
            return Err(decode_err(
                "$",
                format!("{} trailing bytes", buf.remaining()),
            ));
        }
        Ok(record)
    }
}

impl fmt::Debug for RecordCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCodec")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .finish()
    }
}

fn encode_object(
    fields: &[Field],
    map: &Map<String, Value>,
    path: &str,
    dst: &mut BytesMut,
) -> Result<()> {
    for field in fields {
        let field_path = format!("{path}.{}", field.name);
        let value = map
            .get(&field.name)
            .ok_or_else(|| encode_err(&field_path, "missing field"))?;
        encode_value(&field.ty, value, &field_path, dst)?;
    }
    Ok(())
}

fn encode_value(ty: &FieldType, value: &Value, path: &str, dst: &mut BytesMut) -> Result<()> {
    match ty {
        FieldType::Bool => {
            let v = value.as_bool().ok_or_else(|| encode_err(path, "expected bool"))?;
            dst.put_u8(u8::from(v));
        }
        FieldType::Int8 => dst.put_i8(int_in(value, i8::MIN as i64, i8::MAX as i64, path)? as i8),
        FieldType::UInt8 => dst.put_u8(uint_in(value, u8::MAX as u64, path)? as u8),
        FieldType::Int16 => {
            dst.put_i16_le(int_in(value, i16::MIN as i64, i16::MAX as i64, path)? as i16)
        }
        FieldType::UInt16 => dst.put_u16_le(uint_in(value, u16::MAX as u64, path)? as u16),
        FieldType::Int32 => {
            dst.put_i32_le(int_in(value, i32::MIN as i64, i32::MAX as i64, path)? as i32)
        }
        FieldType::UInt32 => dst.put_u32_le(uint_in(value, u32::MAX as u64, path)? as u32),
        FieldType::Float32 => dst.put_f32_le(number(value, path)? as f32),
        FieldType::Float64 => dst.put_f64_le(number(value, path)?),
        FieldType::String => {
            let s = value.as_str().ok_or_else(|| encode_err(path, "expected string"))?;
            dst.put_u64_varint(s.len() as u64);
            dst.put_slice(s.as_bytes());
        }
        FieldType::VarInt => dst.put_i64_varint(int_in(value, i64::MIN, i64::MAX, path)?),
        FieldType::VarUInt => dst.put_u64_varint(uint_in(value, u64::MAX, path)?),
        FieldType::Buffer => {
            let items = value.as_array().ok_or_else(|| encode_err(path, "expected byte array"))?;
            dst.put_u64_varint(items.len() as u64);
            for (i, item) in items.iter().enumerate() {
                dst.put_u8(uint_in(item, u8::MAX as u64, &format!("{path}[{i}]"))? as u8);
            }
        }
        FieldType::Array(item_ty) => {
            let items = value.as_array().ok_or_else(|| encode_err(path, "expected array"))?;
            dst.put_u64_varint(items.len() as u64);
            for (i, item) in items.iter().enumerate() {
                encode_value(item_ty, item, &format!("{path}[{i}]"), dst)?;
            }
        }
        FieldType::Object(fields) => {
            let map = value.as_object().ok_or_else(|| encode_err(path, "expected object"))?;
            encode_object(fields, map, path, dst)?;
        }
    }
    Ok(())
}

fn decode_object(fields: &[Field], buf: &mut &[u8], path: &str) -> Result<Map<String, Value>> {
    let mut map = Map::with_capacity(fields.len());
    for field in fields {
        let field_path = format!("{path}.{}", field.name);
        let value = decode_value(&field.ty, buf, &field_path)?;
        map.insert(field.name.clone(), value);
    }
    Ok(map)
}

fn decode_value(ty: &FieldType, buf: &mut &[u8], path: &str) -> Result<Value> {
    let value = match ty {
        FieldType::Bool => {
            need(buf, 1, path)?;
            match buf.get_u8() {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(decode_err(path, format!("invalid bool byte {other}"))),
            }
        }
        FieldType::Int8 => {
            need(buf, 1, path)?;
            Value::from(buf.get_i8())
        }
        FieldType::UInt8 => {
            need(buf, 1, path)?;
            Value::from(buf.get_u8())
        }
        FieldType::Int16 => {
            need(buf, 2, path)?;
            Value::from(buf.get_i16_le())
        }
        FieldType::UInt16 => {
            need(buf, 2, path)?;
            Value::from(buf.get_u16_le())
        }
        FieldType::Int32 => {
            need(buf, 4, path)?;
            Value::from(buf.get_i32_le())
        }
        FieldType::UInt32 => {
            need(buf, 4, path)?;
            Value::from(buf.get_u32_le())
        }
        FieldType::Float32 => {
            need(buf, 4, path)?;
            float(f64::from(buf.get_f32_le()), path)?
        }
        FieldType::Float64 => {
            need(buf, 8, path)?;
            float(buf.get_f64_le(), path)?
        }
        FieldType::String => {
            let len = length(buf, 1, path)?;
            let text = std::str::from_utf8(&buf[..len])
                .map_err(|err| decode_err(path, format!("invalid utf-8: {err}")))?
                .to_string();
            buf.advance(len);
            Value::String(text)
        }
        FieldType::VarInt => {
            let v = buf
                .get_i64_varint()
                .map_err(|err| decode_err(path, format!("bad varint: {err:?}")))?;
            Value::from(v)
        }
        FieldType::VarUInt => {
            let v = buf
                .get_u64_varint()
                .map_err(|err| decode_err(path, format!("bad varuint: {err:?}")))?;
            Value::from(v)
        }
        FieldType::Buffer => {
            let len = length(buf, 1, path)?;
            let bytes = buf[..len].iter().map(|b| Value::from(*b)).collect();
            buf.advance(len);
            Value::Array(bytes)
        }
        FieldType::Array(item_ty) => {
            let len = length(buf, min_wire_size(item_ty), path)?;
            let mut items = Vec::with_capacity(len);
            for i in 0..len {
                items.push(decode_value(item_ty, buf, &format!("{path}[{i}]"))?);
            }
            Value::Array(items)
        }
        FieldType::Object(fields) => Value::Object(decode_object(fields, buf, path)?),
    };
    Ok(value)
}

/// Read a varuint length prefix and check it against the remaining input.
fn length(buf: &mut &[u8], item_size: usize, path: &str) -> Result<usize> {
    let len = buf
        .get_u64_varint()
        .map_err(|err| decode_err(path, format!("bad length prefix: {err:?}")))?;

    let fits = if item_size == 0 {
        len <= MAX_ZERO_SIZED_ITEMS
    } else {
        len.checked_mul(item_size as u64)
            .is_some_and(|total| total <= buf.remaining() as u64)
    };
    if !fits {
        return Err(decode_err(
            path,
            format!("length {len} exceeds remaining {} bytes", buf.remaining()),
        ));
    }
    Ok(len as usize)
}

fn min_wire_size(ty: &FieldType) -> usize {
    match ty {
        FieldType::Bool | FieldType::Int8 | FieldType::UInt8 => 1,
        FieldType::Int16 | FieldType::UInt16 => 2,
        FieldType::Int32 | FieldType::UInt32 | FieldType::Float32 => 4,
        FieldType::Float64 => 8,
        FieldType::String
        | FieldType::VarInt
        | FieldType::VarUInt
        | FieldType::Buffer
        | FieldType::Array(_) => 1,
        FieldType::Object(fields) => fields.iter().map(|f| min_wire_size(&f.ty)).sum(),
    }
}

fn need(buf: &&[u8], n: usize, path: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(decode_err(
            path,
            format!("truncated input (need {n} bytes, have {})", buf.remaining()),
        ));
    }
    Ok(())
}

/// Float bounds for integral conversion. The upper bounds are exclusive:
/// `i64::MAX as f64` rounds up to 2^63, which does not fit.
const I64_LOWER: f64 = -9_223_372_036_854_775_808.0;
const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;
const U64_UPPER: f64 = 18_446_744_073_709_551_616.0;

fn int_in(value: &Value, min: i64, max: i64, path: &str) -> Result<i64> {
    let v = value
        .as_i64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= I64_LOWER && *f < I64_UPPER)
                .map(|f| f as i64)
        })
        .ok_or_else(|| encode_err(path, "expected integer"))?;
    if v < min || v > max {
        return Err(encode_err(path, format!("{v} out of range {min}..={max}")));
    }
    Ok(v)
}

fn uint_in(value: &Value, max: u64, path: &str) -> Result<u64> {
    let v = value
        .as_u64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f < U64_UPPER)
                .map(|f| f as u64)
        })
        .ok_or_else(|| encode_err(path, "expected unsigned integer"))?;
    if v > max {
        return Err(encode_err(path, format!("{v} out of range 0..={max}")));
    }
    Ok(v)
}

fn number(value: &Value, path: &str) -> Result<f64> {
    value.as_f64().ok_or_else(|| encode_err(path, "expected number"))
}

fn float(v: f64, path: &str) -> Result<Value> {
    Number::from_f64(v)
        .map(Value::Number)
        .ok_or_else(|| decode_err(path, "non-finite float"))
}

fn encode_err(path: &str, reason: impl Into<String>) -> SchemaError {
    SchemaError::Encode {
        path: path.to_string(),
        reason: reason.into(),
    }
}

fn decode_err(path: &str, reason: impl Into<String>) -> SchemaError {
    SchemaError::Decode {
        path: path.to_string(),
        reason: reason.into(),
    }
}
