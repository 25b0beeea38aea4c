//! Schemas and runtime values.
//!
//! A stream schema is an ordered list of `(name, type)` fields. Field names
//! are qualified with their logical source name (`source$field`) once a plan
//! is type-inferred, which is also the form sinks print in file headers.
//! Rows are laid out with a fixed slot per field; variable-length text
//! occupies a 4-byte child-buffer index slot.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Separator between the logical source qualifier and the field name.
pub const ATTRIBUTE_SEPARATOR: char = '$';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    UInt64,
    Float64,
    Text,
}

impl DataType {
    /// Width of the fixed row slot for this type in bytes.
    ///
    /// Text is stored out of line; its slot holds a `u32` child index.
    pub fn slot_size(self) -> usize {
        match self {
            DataType::Bool => 1,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::UInt64 => 8,
            DataType::Float64 => 8,
            DataType::Text => 4,
        }
    }

    pub fn parse(name: &str) -> CoreResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(DataType::Bool),
            "i32" | "int32" => Ok(DataType::Int32),
            "i64" | "int64" => Ok(DataType::Int64),
            "u64" | "uint64" => Ok(DataType::UInt64),
            "f64" | "float64" | "double" => Ok(DataType::Float64),
            "text" | "string" => Ok(DataType::Text),
            other => Err(CoreError::Validation(format!("unknown data type: {other}"))),
        }
    }
}

impl fmt::Display for DataType {
    /// Printable form used in sink file headers, e.g. `INTEGER(32 bits)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bool => write!(f, "BOOLEAN"),
            DataType::Int32 => write!(f, "INTEGER(32 bits)"),
            DataType::Int64 => write!(f, "INTEGER(64 bits)"),
            DataType::UInt64 => write!(f, "INTEGER(64 bits)"),
            DataType::Float64 => write!(f, "FLOAT(64 bits)"),
            DataType::Text => write!(f, "TEXT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }

    /// The name without its source qualifier.
    pub fn unqualified_name(&self) -> &str {
        match self.name.rfind(ATTRIBUTE_SEPARATOR) {
            Some(i) => &self.name[i + 1..],
            None => &self.name,
        }
    }
}

/// An ordered list of fields describing one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolve a field by exact name, falling back to the unqualified form.
    ///
    /// `value` matches `src$value` as long as only one source provides a
    /// field of that name; an ambiguous unqualified lookup resolves to the
    /// first match in field order, which is the order sources were listed.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        if let Some(i) = self.fields.iter().position(|f| f.name == name) {
            return Some(i);
        }
        self.fields.iter().position(|f| f.unqualified_name() == name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.field_index(name).map(|i| &self.fields[i])
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_index(name).is_some()
    }

    /// Byte offset of the field slot within a row.
    pub fn slot_offset(&self, index: usize) -> usize {
        self.fields[..index].iter().map(|f| f.data_type.slot_size()).sum()
    }

    /// Fixed row width in bytes.
    pub fn tuple_size(&self) -> usize {
        self.fields.iter().map(|f| f.data_type.slot_size()).sum()
    }

    /// Qualify every unqualified field with `source$`.
    pub fn qualified(&self, source: &str) -> Schema {
        Schema::new(
            self.fields
                .iter()
                .map(|f| {
                    let name = if f.name.contains(ATTRIBUTE_SEPARATOR) {
                        f.name.clone()
                    } else {
                        format!("{source}{ATTRIBUTE_SEPARATOR}{}", f.name)
                    };
                    Field::new(name, f.data_type)
                })
                .collect(),
        )
    }

    /// Append the fields of `other`, erroring on duplicate names.
    pub fn join(&self, other: &Schema) -> CoreResult<Schema> {
        let mut fields = self.fields.clone();
        for f in &other.fields {
            if fields.iter().any(|g| g.name == f.name) {
                return Err(CoreError::Validation(format!(
                    "duplicate field in joined schema: {}",
                    f.name
                )));
            }
            fields.push(f.clone());
        }
        Ok(Schema::new(fields))
    }

    /// Parse a `name:type,name:type` schema text as used by source registration.
    pub fn parse(text: &str) -> CoreResult<Schema> {
        let mut fields = Vec::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, ty) = part.split_once(':').ok_or_else(|| {
                CoreError::Validation(format!("malformed schema field: {part}"))
            })?;
            fields.push(Field::new(name.trim(), DataType::parse(ty.trim())?));
        }
        if fields.is_empty() {
            return Err(CoreError::Validation("empty schema text".into()));
        }
        Ok(Schema::new(fields))
    }
}

/// A single runtime value flowing through expression evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Text(String),
}

impl Value {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(DataType::Bool),
            Value::Int32(_) => Some(DataType::Int32),
            Value::Int64(_) => Some(DataType::Int64),
            Value::UInt64(_) => Some(DataType::UInt64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Text(_) => Some(DataType::Text),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> CoreResult<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(CoreError::RuntimeData(format!(
                "expected boolean, got {other:?}"
            ))),
        }
    }

    /// Numeric view used by arithmetic and comparisons.
    pub fn as_f64(&self) -> CoreResult<f64> {
        match self {
            Value::Int32(v) => Ok(*v as f64),
            Value::Int64(v) => Ok(*v as f64),
            Value::UInt64(v) => Ok(*v as f64),
            Value::Float64(v) => Ok(*v),
            Value::Bool(v) => Ok(*v as u8 as f64),
            other => Err(CoreError::RuntimeData(format!(
                "expected number, got {other:?}"
            ))),
        }
    }

    pub fn as_u64(&self) -> CoreResult<u64> {
        match self {
            Value::Int32(v) if *v >= 0 => Ok(*v as u64),
            Value::Int64(v) if *v >= 0 => Ok(*v as u64),
            Value::UInt64(v) => Ok(*v),
            other => Err(CoreError::RuntimeData(format!(
                "expected unsigned integer, got {other:?}"
            ))),
        }
    }

    /// Coerce into the slot type of a schema field.
    pub fn coerce(&self, to: DataType) -> CoreResult<Value> {
        match (self, to) {
            (Value::Null, _) => Ok(Value::Null),
            (v, t) if v.data_type() == Some(t) => Ok(v.clone()),
            (v, DataType::Int32) => Ok(Value::Int32(v.as_f64()? as i32)),
            (v, DataType::Int64) => Ok(Value::Int64(v.as_f64()? as i64)),
            (v, DataType::UInt64) => Ok(Value::UInt64(v.as_u64()?)),
            (v, DataType::Float64) => Ok(Value::Float64(v.as_f64()?)),
            (v, DataType::Bool) => v.as_bool().map(Value::Bool),
            (v, DataType::Text) => Ok(Value::Text(v.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
        }
    }
}
