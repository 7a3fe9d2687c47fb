// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement schemas and typed values.
//!
//! A [`Schema`] is a named, ordered list of typed fields describing one
//! measurement stream. Schemas are immutable once registered with a
//! database; the value supplied for a column at insert time must have
//! exactly the declared type, mismatches are hard errors rather than
//! coercions.
//!
//! Schemas have a compact text rendering (`"<name> <field>:<type> ..."`)
//! that the server stores under the `table_<name>` key of the experiment
//! metadata table, and parses back when rediscovering tables on reopen.

use std::fmt;
use thiserror::Error;

/// The four implicit columns prepended to every persisted table.
pub const METADATA_COLUMNS: [(&str, ValueType); 4] = [
    ("oml_sender_id", ValueType::Int32),
    ("oml_seq", ValueType::Int32),
    ("oml_ts_client", ValueType::Double),
    ("oml_ts_server", ValueType::Double),
];

/// Semantic column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Bool,
    Text,
    Blob,
    /// 64-bit opaque identifier.
    Guid,
    VectorInt32,
    VectorUInt32,
    VectorInt64,
    VectorUInt64,
    VectorDouble,
    VectorBool,
    /// Auto-allocated tuple id; only valid as a schema's first field and
    /// never supplied as a runtime value.
    PrimaryKey,
}

impl ValueType {
    /// The token used in the schema text rendering.
    pub fn token(self) -> &'static str {
        match self {
            ValueType::Int32 => "int32",
            ValueType::UInt32 => "uint32",
            ValueType::Int64 => "int64",
            ValueType::UInt64 => "uint64",
            ValueType::Double => "double",
            ValueType::Bool => "bool",
            ValueType::Text => "string",
            ValueType::Blob => "blob",
            ValueType::Guid => "guid",
            ValueType::VectorInt32 => "[int32]",
            ValueType::VectorUInt32 => "[uint32]",
            ValueType::VectorInt64 => "[int64]",
            ValueType::VectorUInt64 => "[uint64]",
            ValueType::VectorDouble => "[double]",
            ValueType::VectorBool => "[bool]",
            ValueType::PrimaryKey => "serial",
        }
    }

    /// Parse a schema text token.
    pub fn from_token(token: &str) -> Option<ValueType> {
        Some(match token {
            "int32" => ValueType::Int32,
            "uint32" => ValueType::UInt32,
            "int64" => ValueType::Int64,
            "uint64" => ValueType::UInt64,
            "double" => ValueType::Double,
            "bool" => ValueType::Bool,
            "string" => ValueType::Text,
            "blob" => ValueType::Blob,
            "guid" => ValueType::Guid,
            "[int32]" => ValueType::VectorInt32,
            "[uint32]" => ValueType::VectorUInt32,
            "[int64]" => ValueType::VectorInt64,
            "[uint64]" => ValueType::VectorUInt64,
            "[double]" => ValueType::VectorDouble,
            "[bool]" => ValueType::VectorBool,
            "serial" => ValueType::PrimaryKey,
            _ => return None,
        })
    }

    /// True for the homogeneous vector types.
    pub fn is_vector(self) -> bool {
        matches!(
            self,
            ValueType::VectorInt32
                | ValueType::VectorUInt32
                | ValueType::VectorInt64
                | ValueType::VectorUInt64
                | ValueType::VectorDouble
                | ValueType::VectorBool
        )
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// A concrete measurement value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Bool(bool),
    Text(String),
    Blob(Vec<u8>),
    Guid(u64),
    VectorInt32(Vec<i32>),
    VectorUInt32(Vec<u32>),
    VectorInt64(Vec<i64>),
    VectorUInt64(Vec<u64>),
    VectorDouble(Vec<f64>),
    VectorBool(Vec<bool>),
}

impl Value {
    /// The semantic type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Int32(_) => ValueType::Int32,
            Value::UInt32(_) => ValueType::UInt32,
            Value::Int64(_) => ValueType::Int64,
            Value::UInt64(_) => ValueType::UInt64,
            Value::Double(_) => ValueType::Double,
            Value::Bool(_) => ValueType::Bool,
            Value::Text(_) => ValueType::Text,
            Value::Blob(_) => ValueType::Blob,
            Value::Guid(_) => ValueType::Guid,
            Value::VectorInt32(_) => ValueType::VectorInt32,
            Value::VectorUInt32(_) => ValueType::VectorUInt32,
            Value::VectorInt64(_) => ValueType::VectorInt64,
            Value::VectorUInt64(_) => ValueType::VectorUInt64,
            Value::VectorDouble(_) => ValueType::VectorDouble,
            Value::VectorBool(_) => ValueType::VectorBool,
        }
    }

    /// JSON array rendering for vector values; `None` for scalars.
    pub fn json_array(&self) -> Option<Result<String, serde_json::Error>> {
        match self {
            Value::VectorInt32(v) => Some(serde_json::to_string(v)),
            Value::VectorUInt32(v) => Some(serde_json::to_string(v)),
            Value::VectorInt64(v) => Some(serde_json::to_string(v)),
            Value::VectorUInt64(v) => Some(serde_json::to_string(v)),
            Value::VectorDouble(v) => Some(serde_json::to_string(v)),
            Value::VectorBool(v) => Some(serde_json::to_string(v)),
            _ => None,
        }
    }
}

/// Schema construction and parse failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("duplicate field '{field}' in schema '{schema}'")]
    DuplicateField { schema: String, field: String },
    #[error("invalid name '{0}' (names cannot be empty or contain whitespace or ':')")]
    InvalidName(String),
    #[error("'serial' is only valid as the first field (schema '{0}')")]
    MisplacedPrimaryKey(String),
    #[error("cannot parse schema text '{0}'")]
    Parse(String),
}

/// One named, typed column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: ValueType,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: ValueType) -> Field {
        Field {
            name: name.into(),
            ty,
        }
    }
}

/// A named, ordered list of fields describing one measurement stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    name: String,
    fields: Vec<Field>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(char::is_whitespace) && !name.contains(':')
}

impl Schema {
    /// Build a schema, enforcing unique, well-formed field names and the
    /// first-field-only rule for the primary-key sentinel.
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Result<Schema, SchemaError> {
        let name = name.into();
        if !valid_name(&name) {
            return Err(SchemaError::InvalidName(name));
        }
        for (i, field) in fields.iter().enumerate() {
            if !valid_name(&field.name) {
                return Err(SchemaError::InvalidName(field.name.clone()));
            }
            if field.ty == ValueType::PrimaryKey && i != 0 {
                return Err(SchemaError::MisplacedPrimaryKey(name));
            }
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(SchemaError::DuplicateField {
                    schema: name,
                    field: field.name.clone(),
                });
            }
        }
        Ok(Schema { name, fields })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All declared fields, including a leading primary-key sentinel.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The fields that carry runtime values (everything but a leading
    /// primary-key sentinel).
    pub fn payload_fields(&self) -> &[Field] {
        match self.fields.first() {
            Some(f) if f.ty == ValueType::PrimaryKey => &self.fields[1..],
            _ => &self.fields,
        }
    }

    /// True if the schema opens with the auto-id sentinel.
    pub fn has_primary_key(&self) -> bool {
        matches!(self.fields.first(), Some(f) if f.ty == ValueType::PrimaryKey)
    }

    /// Render the schema into its metadata text form.
    pub fn to_meta(&self) -> String {
        let mut out = self.name.clone();
        for field in &self.fields {
            out.push(' ');
            out.push_str(&field.name);
            out.push(':');
            out.push_str(field.ty.token());
        }
        out
    }

    /// Parse the metadata text form back into a schema.
    pub fn from_meta(text: &str) -> Result<Schema, SchemaError> {
        let mut tokens = text.split_whitespace();
        let name = tokens
            .next()
            .ok_or_else(|| SchemaError::Parse(text.to_string()))?;

        let mut fields = Vec::new();
        for token in tokens {
            let (fname, ftype) = token
                .split_once(':')
                .ok_or_else(|| SchemaError::Parse(text.to_string()))?;
            let ty = ValueType::from_token(ftype)
                .ok_or_else(|| SchemaError::Parse(text.to_string()))?;
            fields.push(Field::new(fname, ty));
        }
        Schema::new(name, fields)
    }
}
