//! Row-oriented access to tuple buffers.
//!
//! Rows use the fixed slot layout of their [`Schema`]: little-endian
//! integers and floats in place, text out of line in a child buffer with
//! the slot holding the child index. [`RowsBuilder`] is the write side used
//! by kernels and sources; [`RowView`] is the read side and doubles as the
//! [`FieldResolver`] expressions evaluate against.

use bytes::{BufMut, Bytes};

use crate::buffer::{BufferBuilder, TupleBuffer};
use crate::error::{CoreError, CoreResult};
use crate::expr::FieldResolver;
use crate::types::{DataType, Schema, Value};

/// Writes rows of one schema into a buffer under construction.
pub struct RowsBuilder {
    builder: BufferBuilder,
    schema: Schema,
    tuple_size: usize,
    count: u32,
}

impl RowsBuilder {
    pub fn new(builder: BufferBuilder, schema: Schema) -> Self {
        let tuple_size = schema.tuple_size();
        Self {
            builder,
            schema,
            tuple_size,
            count: 0,
        }
    }

    pub fn has_space(&self) -> bool {
        self.builder.remaining() >= self.tuple_size
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn builder_mut(&mut self) -> &mut BufferBuilder {
        &mut self.builder
    }

    /// Append one row; values must match the schema's field order.
    pub fn push_row(&mut self, values: &[Value]) -> CoreResult<()> {
        if values.len() != self.schema.len() {
            return Err(CoreError::RuntimeData(format!(
                "row has {} values, schema has {} fields",
                values.len(),
                self.schema.len()
            )));
        }
        if !self.has_space() {
            return Err(CoreError::RuntimeSystem("tuple buffer full".into()));
        }
        for (i, value) in values.iter().enumerate() {
            let data_type = self.schema.fields[i].data_type;
            let coerced = value.coerce(data_type)?;
            if let (Value::Text(s), DataType::Text) = (&coerced, data_type) {
                let child = self
                    .builder
                    .attach_child(Bytes::copy_from_slice(s.as_bytes()));
                self.builder.bytes_mut().put_u32_le(child);
                continue;
            }
            let out = self.builder.bytes_mut();
            match coerced {
                Value::Null => {
                    // Nulls encode as the zero pattern of their slot.
                    out.put_bytes(0, data_type.slot_size());
                }
                Value::Bool(b) => out.put_u8(b as u8),
                Value::Int32(v) => out.put_i32_le(v),
                Value::Int64(v) => out.put_i64_le(v),
                Value::UInt64(v) => out.put_u64_le(v),
                Value::Float64(v) => out.put_f64_le(v),
                Value::Text(_) => unreachable!("text handled above"),
            }
        }
        self.count += 1;
        Ok(())
    }

    /// Seal into an immutable buffer carrying the final tuple count.
    pub fn finish(self) -> TupleBuffer {
        self.builder.seal(self.count)
    }
}

/// A read-only view of one row inside a sealed buffer.
pub struct RowView<'a> {
    buffer: &'a TupleBuffer,
    schema: &'a Schema,
    base: usize,
}

impl<'a> RowView<'a> {
    pub fn new(buffer: &'a TupleBuffer, schema: &'a Schema, index: usize) -> Self {
        Self {
            buffer,
            schema,
            base: index * schema.tuple_size(),
        }
    }

    /// Decode the field at `index`.
    pub fn get(&self, index: usize) -> CoreResult<Value> {
        let field = self
            .schema
            .fields
            .get(index)
            .ok_or_else(|| CoreError::RuntimeData(format!("field index {index} out of range")))?;
        let offset = self.base + self.schema.slot_offset(index);
        let data = self.buffer.data();
        let slot = data
            .get(offset..offset + field.data_type.slot_size())
            .ok_or_else(|| CoreError::RuntimeData("row extends past buffer".into()))?;
        Ok(match field.data_type {
            DataType::Bool => Value::Bool(slot[0] != 0),
            DataType::Int32 => Value::Int32(i32::from_le_bytes(slot.try_into().unwrap())),
            DataType::Int64 => Value::Int64(i64::from_le_bytes(slot.try_into().unwrap())),
            DataType::UInt64 => Value::UInt64(u64::from_le_bytes(slot.try_into().unwrap())),
            DataType::Float64 => Value::Float64(f64::from_le_bytes(slot.try_into().unwrap())),
            DataType::Text => {
                let child = u32::from_le_bytes(slot.try_into().unwrap());
                let payload = self.buffer.child_at(child).ok_or_else(|| {
                    CoreError::RuntimeData(format!("dangling child index {child}"))
                })?;
                Value::Text(String::from_utf8_lossy(payload).into_owned())
            }
        })
    }

    /// Decode the whole row in field order.
    pub fn values(&self) -> CoreResult<Vec<Value>> {
        (0..self.schema.len()).map(|i| self.get(i)).collect()
    }
}

impl FieldResolver for RowView<'_> {
    fn resolve(&self, name: &str) -> Option<Value> {
        let index = self.schema.field_index(name)?;
        self.get(index).ok()
    }
}

/// Iterate the rows of a sealed buffer under a schema.
pub fn rows<'a>(
    buffer: &'a TupleBuffer,
    schema: &'a Schema,
) -> impl Iterator<Item = RowView<'a>> {
    (0..buffer.tuple_count() as usize).map(move |i| RowView::new(buffer, schema, i))
}
