//! Serializable expression trees.
//!
//! Expressions are the operator payloads of logical plans: filter predicates,
//! map assignments and join key accesses. The rewrite phases manipulate them
//! structurally (field renames, substitution of map expressions into pushed
//! predicates) and the merger compares their canonical forms, so every
//! constructor keeps the tree shape deterministic.
//!
//! Evaluation resolves field references against a [`FieldResolver`] (a row
//! view at runtime) and classifies every failure as a data error: a filter
//! that cannot evaluate a tuple skips that tuple, it never kills the
//! pipeline.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::Value;

/// Resolves a field reference to the value it has in the current tuple.
pub trait FieldResolver {
    fn resolve(&self, name: &str) -> Option<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEq => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEq => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Reference to a schema field, qualified or not.
    Field(String),
    Literal(Value),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn field(name: impl Into<String>) -> Expr {
        Expr::Field(name.into())
    }

    pub fn lit(value: impl Into<Value>) -> Expr {
        Expr::Literal(value.into())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn not(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }

    pub fn and(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::And, self, rhs)
    }

    pub fn or(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Or, self, rhs)
    }

    pub fn eq(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Eq, self, rhs)
    }

    pub fn not_eq(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::NotEq, self, rhs)
    }

    pub fn lt(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Less, self, rhs)
    }

    pub fn le(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::LessEq, self, rhs)
    }

    pub fn gt(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Greater, self, rhs)
    }

    pub fn ge(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::GreaterEq, self, rhs)
    }

    pub fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Add, self, rhs)
    }

    pub fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinaryOp::Mul, self, rhs)
    }

    /// Evaluate against one tuple.
    pub fn evaluate(&self, row: &dyn FieldResolver) -> CoreResult<Value> {
        match self {
            Expr::Field(name) => row
                .resolve(name)
                .ok_or_else(|| CoreError::RuntimeData(format!("unknown field: {name}"))),
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Unary { op, expr } => {
                let v = expr.evaluate(row)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!v.as_bool()?)),
                    UnaryOp::Neg => Ok(Value::Float64(-v.as_f64()?)),
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                // Logical connectives short-circuit; everything else is strict.
                match op {
                    BinaryOp::And => {
                        if !lhs.evaluate(row)?.as_bool()? {
                            return Ok(Value::Bool(false));
                        }
                        return Ok(Value::Bool(rhs.evaluate(row)?.as_bool()?));
                    }
                    BinaryOp::Or => {
                        if lhs.evaluate(row)?.as_bool()? {
                            return Ok(Value::Bool(true));
                        }
                        return Ok(Value::Bool(rhs.evaluate(row)?.as_bool()?));
                    }
                    _ => {}
                }
                let l = lhs.evaluate(row)?;
                let r = rhs.evaluate(row)?;
                if l.is_null() || r.is_null() {
                    return Ok(Value::Null);
                }
                match op {
                    BinaryOp::Eq => Ok(Value::Bool(values_equal(&l, &r)?)),
                    BinaryOp::NotEq => Ok(Value::Bool(!values_equal(&l, &r)?)),
                    BinaryOp::Less => Ok(Value::Bool(l.as_f64()? < r.as_f64()?)),
                    BinaryOp::LessEq => Ok(Value::Bool(l.as_f64()? <= r.as_f64()?)),
                    BinaryOp::Greater => Ok(Value::Bool(l.as_f64()? > r.as_f64()?)),
                    BinaryOp::GreaterEq => Ok(Value::Bool(l.as_f64()? >= r.as_f64()?)),
                    BinaryOp::Add => numeric(&l, &r, |a, b| a + b),
                    BinaryOp::Sub => numeric(&l, &r, |a, b| a - b),
                    BinaryOp::Mul => numeric(&l, &r, |a, b| a * b),
                    BinaryOp::Div => {
                        if r.as_f64()? == 0.0 {
                            return Err(CoreError::RuntimeData("division by zero".into()));
                        }
                        numeric(&l, &r, |a, b| a / b)
                    }
                    BinaryOp::Mod => {
                        if r.as_f64()? == 0.0 {
                            return Err(CoreError::RuntimeData("division by zero".into()));
                        }
                        numeric(&l, &r, |a, b| a % b)
                    }
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
                }
            }
        }
    }

    /// All field names the expression reads.
    pub fn referenced_fields(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Field(name) => {
                out.insert(name.clone());
            }
            Expr::Literal(_) => {}
            Expr::Unary { expr, .. } => expr.collect_fields(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_fields(out);
                rhs.collect_fields(out);
            }
        }
    }

    /// Rename every reference to `from` into `to`. Used when a predicate is
    /// pushed through a projection rename.
    pub fn rename_field(&mut self, from: &str, to: &str) {
        match self {
            Expr::Field(name) if name == from => *name = to.to_string(),
            Expr::Field(_) | Expr::Literal(_) => {}
            Expr::Unary { expr, .. } => expr.rename_field(from, to),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.rename_field(from, to);
                rhs.rename_field(from, to);
            }
        }
    }

    /// Replace every reference to `field` by `replacement`. Used to inline a
    /// map assignment into a predicate pushed below the map.
    pub fn substitute(&mut self, field: &str, replacement: &Expr) {
        match self {
            Expr::Field(name) if name == field => *self = replacement.clone(),
            Expr::Field(_) | Expr::Literal(_) => {}
            Expr::Unary { expr, .. } => expr.substitute(field, replacement),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.substitute(field, replacement);
                rhs.substitute(field, replacement);
            }
        }
    }

    /// Split a predicate into its top-level conjuncts.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        let mut out = Vec::new();
        self.collect_conjuncts(&mut out);
        out
    }

    fn collect_conjuncts<'a>(&'a self, out: &mut Vec<&'a Expr>) {
        match self {
            Expr::Binary {
                op: BinaryOp::And,
                lhs,
                rhs,
            } => {
                lhs.collect_conjuncts(out);
                rhs.collect_conjuncts(out);
            }
            other => out.push(other),
        }
    }

    /// Conjoin a list of predicates back into one expression.
    pub fn conjoin(mut parts: Vec<Expr>) -> Option<Expr> {
        let first = if parts.is_empty() {
            return None;
        } else {
            parts.remove(0)
        };
        Some(parts.into_iter().fold(first, |acc, p| acc.and(p)))
    }

    /// Deterministic textual form used by operator signatures.
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

fn values_equal(l: &Value, r: &Value) -> CoreResult<bool> {
    match (l, r) {
        (Value::Text(a), Value::Text(b)) => Ok(a == b),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        _ => Ok(l.as_f64()? == r.as_f64()?),
    }
}

/// Arithmetic preserving integer types where both sides are integral.
fn numeric(l: &Value, r: &Value, op: impl Fn(f64, f64) -> f64) -> CoreResult<Value> {
    let result = op(l.as_f64()?, r.as_f64()?);
    match (l, r) {
        (Value::UInt64(_), Value::UInt64(_)) if result >= 0.0 => Ok(Value::UInt64(result as u64)),
        (Value::Int32(_), Value::Int32(_)) => Ok(Value::Int32(result as i32)),
        (Value::Int32(_) | Value::Int64(_), Value::Int32(_) | Value::Int64(_)) => {
            Ok(Value::Int64(result as i64))
        }
        _ => Ok(Value::Float64(result)),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Field(name) => write!(f, "{name}"),
            Expr::Literal(v) => match v {
                Value::Text(s) => write!(f, "\"{s}\""),
                other => write!(f, "{other}"),
            },
            Expr::Unary { op, expr } => match op {
                UnaryOp::Not => write!(f, "!({expr})"),
                UnaryOp::Neg => write!(f, "-({expr})"),
            },
            Expr::Binary { op, lhs, rhs } => {
                write!(f, "({lhs}{}{rhs})", op.symbol())
            }
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TestRow(HashMap<String, Value>);

    impl FieldResolver for TestRow {
        fn resolve(&self, name: &str) -> Option<Value> {
            self.0.get(name).cloned()
        }
    }

    fn row(pairs: &[(&str, Value)]) -> TestRow {
        TestRow(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn evaluates_comparison() {
        let expr = Expr::field("value").lt(Expr::lit(42i64));
        let r = row(&[("value", Value::Int64(7))]);
        assert_eq!(expr.evaluate(&r).unwrap(), Value::Bool(true));
        let r = row(&[("value", Value::Int64(99))]);
        assert_eq!(expr.evaluate(&r).unwrap(), Value::Bool(false));
    }

    #[test]
    fn short_circuits_logical_ops() {
        // rhs would fail on the missing field if it were evaluated
        let expr = Expr::lit(false).and(Expr::field("missing").gt(Expr::lit(0i64)));
        assert_eq!(expr.evaluate(&row(&[])).unwrap(), Value::Bool(false));
    }

    #[test]
    fn unknown_field_is_a_data_error() {
        let expr = Expr::field("nope").eq(Expr::lit(1i64));
        assert!(matches!(
            expr.evaluate(&row(&[])),
            Err(CoreError::RuntimeData(_))
        ));
    }

    #[test]
    fn substitute_inlines_map_expression() {
        // filter(y > 10) pushed below map(y = x * 2) becomes filter(x * 2 > 10)
        let mut pred = Expr::field("y").gt(Expr::lit(10i64));
        let assignment = Expr::field("x").mul(Expr::lit(2i64));
        pred.substitute("y", &assignment);
        assert_eq!(pred.referenced_fields().into_iter().collect::<Vec<_>>(), vec!["x"]);
        let r = row(&[("x", Value::Int64(6))]);
        assert_eq!(pred.evaluate(&r).unwrap(), Value::Bool(true));
    }

    #[test]
    fn rename_rewrites_all_occurrences() {
        let mut e = Expr::field("a$k").lt(Expr::field("a$k").add(Expr::lit(1i64)));
        e.rename_field("a$k", "b$k");
        assert!(e.referenced_fields().contains("b$k"));
        assert!(!e.referenced_fields().contains("a$k"));
    }

    #[test]
    fn conjunct_split_and_join() {
        let e = Expr::field("a")
            .lt(Expr::lit(1i64))
            .and(Expr::field("b").gt(Expr::lit(2i64)))
            .and(Expr::field("c").eq(Expr::lit(3i64)));
        assert_eq!(e.conjuncts().len(), 3);
        let rejoined = Expr::conjoin(e.conjuncts().into_iter().cloned().collect()).unwrap();
        assert_eq!(rejoined.conjuncts().len(), 3);
    }

    #[test]
    fn canonical_form_is_deterministic() {
        let a = Expr::field("value").lt(Expr::lit(42i64));
        let b = Expr::field("value").lt(Expr::lit(42i64));
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.canonical(), "(value<42)");
    }
}
