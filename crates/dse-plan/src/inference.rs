//! Schema inference over a logical plan.
//!
//! Runs once after construction (and again after rewrites in debug
//! builds): walks the plan inputs-first, derives every operator's output
//! schema from its children and payload, and validates that referenced
//! fields exist. Source schemas come out of the coordinator's source
//! catalog; `attach_source_schemas` injects them before the walk.

use dse_core::types::{DataType, Field, Schema};
use dse_core::{CoreError, CoreResult, Expr};

use crate::operator::{AggregationType, OperatorKind, TimeCharacteristic};
use crate::plan::QueryPlan;

/// Window aggregate output fields shared by window and join schemas.
pub const WINDOW_START_FIELD: &str = "start";
pub const WINDOW_END_FIELD: &str = "end";
pub const WINDOW_KEY_FIELD: &str = "key";
pub const WINDOW_COUNT_FIELD: &str = "count";

/// Fill the schema of every logical source from a catalog lookup.
pub fn attach_source_schemas(
    plan: &mut QueryPlan,
    lookup: impl Fn(&str) -> Option<Schema>,
) -> CoreResult<()> {
    for id in plan.ids().collect::<Vec<_>>() {
        if let OperatorKind::Source(desc) = &plan.node(id).kind {
            if desc.schema.is_empty() {
                let name = desc.logical_name.clone();
                let schema = lookup(&name)
                    .ok_or_else(|| CoreError::NotFound(format!("logical source {name}")))?;
                if let OperatorKind::Source(desc) = &mut plan.node_mut(id).kind {
                    desc.schema = schema;
                }
            }
        }
    }
    Ok(())
}

/// Infer the static type of an expression against a schema.
pub fn expr_type(expr: &Expr, schema: &Schema) -> CoreResult<DataType> {
    use dse_core::expr::{BinaryOp, UnaryOp};
    match expr {
        Expr::Field(name) => schema
            .field(name)
            .map(|f| f.data_type)
            .ok_or_else(|| CoreError::Validation(format!("unknown field: {name}"))),
        Expr::Literal(v) => v
            .data_type()
            .ok_or_else(|| CoreError::Validation("null literal has no type".into())),
        Expr::Unary { op, expr } => match op {
            UnaryOp::Not => Ok(DataType::Bool),
            UnaryOp::Neg => expr_type(expr, schema),
        },
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::And
            | BinaryOp::Or
            | BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Less
            | BinaryOp::LessEq
            | BinaryOp::Greater
            | BinaryOp::GreaterEq => Ok(DataType::Bool),
            _ => {
                let l = expr_type(lhs, schema)?;
                let r = expr_type(rhs, schema)?;
                Ok(match (l, r) {
                    (DataType::Float64, _) | (_, DataType::Float64) => DataType::Float64,
                    (DataType::UInt64, DataType::UInt64) => DataType::UInt64,
                    (DataType::Int32, DataType::Int32) => DataType::Int32,
                    _ => DataType::Int64,
                })
            }
        },
    }
}

fn check_fields_exist(expr: &Expr, schema: &Schema) -> CoreResult<()> {
    for field in expr.referenced_fields() {
        if !schema.has_field(&field) {
            return Err(CoreError::Validation(format!(
                "predicate references unknown field: {field}"
            )));
        }
    }
    Ok(())
}

/// Infer and store the output schema of every operator, inputs first.
pub fn infer_schemas(plan: &mut QueryPlan) -> CoreResult<()> {
    for id in plan.topological()? {
        let node = plan.node(id).clone();
        let child_schema =
            |i: usize| -> Schema { plan.node(node.children[i]).output_schema.clone() };

        let schema = match &node.kind {
            OperatorKind::Source(desc) => {
                if desc.schema.is_empty() {
                    return Err(CoreError::Validation(format!(
                        "source {} has no schema attached",
                        desc.logical_name
                    )));
                }
                desc.schema.qualified(&desc.logical_name)
            }
            OperatorKind::NetworkSource(desc) => desc.schema.clone(),
            OperatorKind::Filter { predicate } => {
                let input = child_schema(0);
                check_fields_exist(predicate, &input)?;
                input
            }
            OperatorKind::Map { field, expr } => {
                let input = child_schema(0);
                let data_type = expr_type(expr, &input)?;
                let mut fields = input.fields.clone();
                match input.field_index(field) {
                    // assignment to an existing field keeps its position
                    Some(i) => fields[i] = Field::new(fields[i].name.clone(), data_type),
                    None => fields.push(Field::new(field.clone(), data_type)),
                }
                Schema::new(fields)
            }
            OperatorKind::Project { fields } => {
                let input = child_schema(0);
                let mut out = Vec::new();
                for (name, rename) in fields {
                    let field = input.field(name).ok_or_else(|| {
                        CoreError::Validation(format!("projected field not found: {name}"))
                    })?;
                    let out_name = match rename {
                        Some(new) if new.contains(dse_core::ATTRIBUTE_SEPARATOR) => new.clone(),
                        Some(new) => match field.name.rfind(dse_core::ATTRIBUTE_SEPARATOR) {
                            // a rename keeps the source qualifier
                            Some(sep) => format!("{}{}", &field.name[..sep + 1], new),
                            None => new.clone(),
                        },
                        None => field.name.clone(),
                    };
                    out.push(Field::new(out_name, field.data_type));
                }
                Schema::new(out)
            }
            OperatorKind::Union => {
                let left = child_schema(0);
                let right = child_schema(1);
                if left.len() != right.len()
                    || left
                        .fields
                        .iter()
                        .zip(&right.fields)
                        .any(|(l, r)| l.data_type != r.data_type)
                {
                    return Err(CoreError::Validation(
                        "union branches have incompatible schemas".into(),
                    ));
                }
                left
            }
            OperatorKind::Join(desc) => {
                let left = child_schema(0);
                let right = child_schema(1);
                let left_key = left.field(&desc.left_key).ok_or_else(|| {
                    CoreError::Validation(format!("join key not found: {}", desc.left_key))
                })?;
                if right.field(&desc.right_key).is_none() {
                    return Err(CoreError::Validation(format!(
                        "join key not found: {}",
                        desc.right_key
                    )));
                }
                let mut fields = vec![
                    Field::new(WINDOW_START_FIELD, DataType::UInt64),
                    Field::new(WINDOW_END_FIELD, DataType::UInt64),
                    Field::new(WINDOW_KEY_FIELD, left_key.data_type),
                ];
                let joined = left.join(&right)?;
                fields.extend(joined.fields);
                Schema::new(fields)
            }
            OperatorKind::Window(desc) => {
                let input = child_schema(0);
                if let Some(tf) = desc.time.field() {
                    if !input.has_field(tf) {
                        return Err(CoreError::Validation(format!(
                            "window time field not found: {tf}"
                        )));
                    }
                }
                let mut fields = vec![
                    Field::new(WINDOW_START_FIELD, DataType::UInt64),
                    Field::new(WINDOW_END_FIELD, DataType::UInt64),
                ];
                match &desc.key {
                    Some(key) => {
                        let key_field = input.field(key).ok_or_else(|| {
                            CoreError::Validation(format!("window key not found: {key}"))
                        })?;
                        fields.push(Field::new(key_field.name.clone(), key_field.data_type));
                        fields.push(aggregate_field(desc.aggregation, &input, &desc.on_field)?);
                    }
                    None => {
                        // unkeyed windows emit (start, end, aggregate, key=0)
                        fields.push(aggregate_field(desc.aggregation, &input, &desc.on_field)?);
                        fields.push(Field::new(WINDOW_KEY_FIELD, DataType::UInt64));
                    }
                }
                Schema::new(fields)
            }
            OperatorKind::WatermarkAssign(desc) => {
                let input = child_schema(0);
                if let Some(tf) = desc.time.field() {
                    if !input.has_field(tf) {
                        return Err(CoreError::Validation(format!(
                            "watermark time field not found: {tf}"
                        )));
                    }
                }
                input
            }
            OperatorKind::Sink(_) | OperatorKind::NetworkSink(_) => child_schema(0),
        };
        plan.node_mut(id).output_schema = schema;
    }
    Ok(())
}

fn aggregate_field(
    aggregation: AggregationType,
    input: &Schema,
    on_field: &str,
) -> CoreResult<Field> {
    match aggregation {
        AggregationType::Count => Ok(Field::new(WINDOW_COUNT_FIELD, DataType::UInt64)),
        AggregationType::Avg => {
            let f = require_field(input, on_field)?;
            Ok(Field::new(f.name.clone(), DataType::Float64))
        }
        _ => {
            let f = require_field(input, on_field)?;
            Ok(Field::new(f.name.clone(), f.data_type))
        }
    }
}

fn require_field<'a>(schema: &'a Schema, name: &str) -> CoreResult<&'a Field> {
    schema
        .field(name)
        .ok_or_else(|| CoreError::Validation(format!("aggregated field not found: {name}")))
}

/// The event-time field a windowed operator reads, resolved against its
/// input schema. Used by the merger's window compatibility check.
pub fn resolve_time_field(time: &TimeCharacteristic, schema: &Schema) -> Option<String> {
    time.field()
        .and_then(|f| schema.field(f))
        .map(|f| f.name.clone())
}
