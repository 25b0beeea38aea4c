//! Fluent construction of logical plans.
//!
//! `Query::from("sensors").filter(..).sink(..)` builds the operator DAG the
//! coordinator rewrites and deploys. Windowed aggregations and joins go
//! through small staged builders so the call shape reads like the query:
//! `.window(..).by_key(..).apply(..)` and
//! `.join_with(..).where_field(..).equals_to(..).window(..)`.
//!
//! Windowed operators need a watermark; if the query did not assign one
//! explicitly, a default event-time assigner with zero allowed lateness is
//! inserted right below the windowed operator.

use dse_core::{Expr, OperatorId, QueryId};

use crate::operator::{
    AggregationType, JoinDescriptor, JoinStrategy, OperatorKind, SinkDescriptor,
    SourceDescriptor, TimeCharacteristic, WatermarkDescriptor, WindowDescriptor, WindowType,
};
use crate::plan::QueryPlan;

/// A query under construction; `head` is the operator the next stage
/// consumes.
#[derive(Debug, Clone)]
pub struct Query {
    plan: QueryPlan,
    head: OperatorId,
}

impl Query {
    /// Start from a logical source. The schema is attached later from the
    /// source catalog (or directly in tests).
    pub fn from(logical_name: impl Into<String>) -> Query {
        let mut plan = QueryPlan::new(QueryId::INVALID);
        let head = plan.add(OperatorKind::Source(SourceDescriptor {
            logical_name: logical_name.into(),
            schema: Default::default(),
            physical: None,
            origin: dse_core::OriginId::INVALID,
        }));
        Query { plan, head }
    }

    fn push(mut self, kind: OperatorKind) -> Query {
        let id = self.plan.add(kind);
        self.plan.connect(id, self.head);
        self.head = id;
        self
    }

    pub fn filter(self, predicate: Expr) -> Query {
        self.push(OperatorKind::Filter { predicate })
    }

    pub fn map(self, field: impl Into<String>, expr: Expr) -> Query {
        self.push(OperatorKind::Map {
            field: field.into(),
            expr,
        })
    }

    /// Project to the given fields; `(name, Some(rename))` renames.
    pub fn project(self, fields: &[(&str, Option<&str>)]) -> Query {
        self.push(OperatorKind::Project {
            fields: fields
                .iter()
                .map(|(n, r)| (n.to_string(), r.map(str::to_string)))
                .collect(),
        })
    }

    pub fn assign_watermark(self, time: TimeCharacteristic, allowed_lateness_ms: u64) -> Query {
        self.push(OperatorKind::WatermarkAssign(WatermarkDescriptor {
            time,
            allowed_lateness_ms,
        }))
    }

    pub fn union_with(mut self, other: Query) -> Query {
        let mapping = self.plan.absorb(&other.plan);
        let union = self.plan.add(OperatorKind::Union);
        self.plan.connect(union, self.head);
        self.plan.connect(union, mapping[&other.head]);
        self.head = union;
        self
    }

    pub fn window(self, window: WindowType, time: TimeCharacteristic) -> WindowedQuery {
        WindowedQuery {
            query: self,
            window,
            time,
            key: None,
        }
    }

    /// Pattern iteration: count occurrences per window and keep windows
    /// with `min ..= max` matches.
    pub fn times(self, min: u64, max: u64) -> IterationBuilder {
        IterationBuilder {
            query: self,
            min,
            max,
        }
    }

    pub fn join_with(self, other: Query) -> JoinWith {
        JoinWith { left: self, other }
    }

    pub fn sink(self, sink: SinkDescriptor) -> Query {
        self.push(OperatorKind::Sink(sink))
    }

    /// Finish building; the plan is still untyped until inference runs.
    pub fn into_plan(self) -> QueryPlan {
        self.plan
    }

    pub fn head(&self) -> OperatorId {
        self.head
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// Insert a default watermark assigner below the head unless the head
    /// already is one.
    fn ensure_watermark(self, time: &TimeCharacteristic) -> Query {
        if matches!(
            self.plan.node(self.head).kind,
            OperatorKind::WatermarkAssign(_)
        ) {
            return self;
        }
        self.push(OperatorKind::WatermarkAssign(WatermarkDescriptor {
            time: time.clone(),
            allowed_lateness_ms: 0,
        }))
    }
}

/// `.window(..)` stage; finished by `.apply(..)`.
pub struct WindowedQuery {
    query: Query,
    window: WindowType,
    time: TimeCharacteristic,
    key: Option<String>,
}

impl WindowedQuery {
    pub fn by_key(mut self, field: impl Into<String>) -> WindowedQuery {
        self.key = Some(field.into());
        self
    }

    pub fn apply(self, aggregation: AggregationType, on_field: impl Into<String>) -> Query {
        let query = self.query.ensure_watermark(&self.time);
        query.push(OperatorKind::Window(WindowDescriptor {
            window: self.window,
            time: self.time,
            key: self.key,
            aggregation,
            on_field: on_field.into(),
        }))
    }
}

/// `.times(..)` stage; finished by `.window(..)`.
pub struct IterationBuilder {
    query: Query,
    min: u64,
    max: u64,
}

impl IterationBuilder {
    pub fn window(self, window: WindowType, time: TimeCharacteristic) -> Query {
        let query = self.query.ensure_watermark(&time);
        let counted = query.push(OperatorKind::Window(WindowDescriptor {
            window,
            time,
            key: None,
            aggregation: AggregationType::Count,
            on_field: String::new(),
        }));
        counted.filter(
            Expr::field("count")
                .ge(Expr::lit(self.min))
                .and(Expr::field("count").le(Expr::lit(self.max))),
        )
    }
}

/// `.join_with(..)` stage; `.where_field(..).equals_to(..).window(..)`.
pub struct JoinWith {
    left: Query,
    other: Query,
}

impl JoinWith {
    pub fn where_field(self, left_key: impl Into<String>) -> JoinOn {
        JoinOn {
            left: self.left,
            other: self.other,
            left_key: left_key.into(),
        }
    }
}

pub struct JoinOn {
    left: Query,
    other: Query,
    left_key: String,
}

impl JoinOn {
    pub fn equals_to(self, right_key: impl Into<String>) -> JoinKeyed {
        JoinKeyed {
            left: self.left,
            other: self.other,
            left_key: self.left_key,
            right_key: right_key.into(),
            strategy: JoinStrategy::NestedLoop,
        }
    }
}

pub struct JoinKeyed {
    left: Query,
    other: Query,
    left_key: String,
    right_key: String,
    strategy: JoinStrategy,
}

impl JoinKeyed {
    /// Switch to the hash-partitioned join implementation.
    pub fn partitioned(mut self, partitions: usize) -> JoinKeyed {
        self.strategy = JoinStrategy::HashPartitioned { partitions };
        self
    }

    pub fn window(self, window: WindowType, time: TimeCharacteristic) -> Query {
        let left = self.left.ensure_watermark(&time);
        let other = self.other.ensure_watermark(&time);
        let mut query = left;
        let mapping = query.plan.absorb(&other.plan);
        let join = query.plan.add(OperatorKind::Join(JoinDescriptor {
            left_key: self.left_key,
            right_key: self.right_key,
            window,
            time,
            strategy: self.strategy,
        }));
        let left_head = query.head;
        query.plan.connect(join, left_head);
        query.plan.connect(join, mapping[&other.head]);
        query.head = join;
        query
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::OperatorKind;

    #[test]
    fn linear_query_shape() {
        let plan = Query::from("default_logical")
            .filter(Expr::field("value").lt(Expr::lit(42i64)))
            .sink(SinkDescriptor::Print)
            .into_plan();
        assert_eq!(plan.len(), 3);
        let order = plan.topological().unwrap();
        assert!(matches!(
            plan.node(order[0]).kind,
            OperatorKind::Source(_)
        ));
        assert!(matches!(plan.node(order[2]).kind, OperatorKind::Sink(_)));
        plan.validate().unwrap();
    }

    #[test]
    fn window_inserts_default_watermark() {
        let plan = Query::from("window")
            .window(
                WindowType::Tumbling { size_ms: 1000 },
                TimeCharacteristic::EventTime {
                    field: "timestamp".into(),
                },
            )
            .by_key("id")
            .apply(AggregationType::Sum, "value")
            .sink(SinkDescriptor::Print)
            .into_plan();
        let kinds: Vec<&'static str> = plan
            .topological()
            .unwrap()
            .into_iter()
            .map(|id| plan.node(id).kind.name())
            .collect();
        assert_eq!(
            kinds,
            vec!["source", "watermark_assign", "window", "sink"]
        );
    }

    #[test]
    fn explicit_watermark_is_not_duplicated() {
        let time = TimeCharacteristic::EventTime {
            field: "ts".into(),
        };
        let plan = Query::from("s")
            .assign_watermark(time.clone(), 50)
            .window(WindowType::Tumbling { size_ms: 100 }, time)
            .apply(AggregationType::Count, "")
            .into_plan();
        let watermarks = plan
            .ids()
            .filter(|id| matches!(plan.node(*id).kind, OperatorKind::WatermarkAssign(_)))
            .count();
        assert_eq!(watermarks, 1);
    }

    #[test]
    fn join_has_ordered_branches() {
        let time = TimeCharacteristic::EventTime {
            field: "ts".into(),
        };
        let plan = Query::from("a")
            .join_with(Query::from("b"))
            .where_field("a$k")
            .equals_to("b$k")
            .window(WindowType::Tumbling { size_ms: 1000 }, time)
            .sink(SinkDescriptor::Print)
            .into_plan();
        let join = plan
            .ids()
            .find(|id| matches!(plan.node(*id).kind, OperatorKind::Join(_)))
            .unwrap();
        assert_eq!(plan.node(join).children.len(), 2);
        plan.validate().unwrap();
    }

    #[test]
    fn times_expands_to_count_window_and_filter() {
        let plan = Query::from("QnV")
            .filter(Expr::field("velocity").gt(Expr::lit(70.0)))
            .times(3, 10)
            .window(
                WindowType::Sliding {
                    size_ms: 600_000,
                    slide_ms: 120_000,
                },
                TimeCharacteristic::EventTime {
                    field: "timestamp".into(),
                },
            )
            .sink(SinkDescriptor::Print)
            .into_plan();
        let kinds: Vec<&'static str> = plan
            .topological()
            .unwrap()
            .into_iter()
            .map(|id| plan.node(id).kind.name())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "source",
                "filter",
                "watermark_assign",
                "window",
                "filter",
                "sink"
            ]
        );
    }
}
