//! Plan rewrite phases.
//!
//! Phases run on a freshly inferred plan and leave it ready for
//! re-inference: `FilterPushDownPhase` moves predicates as close to the
//! sources as they commute, `ProjectionPushDownPhase` narrows schemas
//! early. Both preserve operator arity and the branch order of binary
//! operators.
//!
//! Push-down rules, per operator the filter meets on its way down:
//! - another filter or a watermark assigner: pass through,
//! - map: inline the assignment if the predicate reads the written field,
//! - projection: rewrite predicate fields through the renames,
//! - union: duplicate into both branches,
//! - join: push to whichever side covers the referenced fields; a predicate
//!   on the join key is replicated to both sides with the key renamed,
//! - window: pass only if every referenced field is the grouping key,
//! - sources and anything unknown: stop and insert right above.

use tracing::debug;

use dse_core::{CoreResult, Expr, OperatorId, Schema};

use crate::inference::infer_schemas;
use crate::operator::OperatorKind;
use crate::plan::QueryPlan;

/// Rename every referenced field to its full schema name so later
/// comparisons are textual.
fn canonicalize(pred: &mut Expr, schema: &Schema) {
    for name in pred.referenced_fields() {
        if let Some(i) = schema.field_index(&name) {
            let full = schema.fields[i].name.clone();
            if full != name {
                pred.rename_field(&name, &full);
            }
        }
    }
}

fn covers(schema: &Schema, pred: &Expr) -> bool {
    pred.referenced_fields().iter().all(|f| schema.has_field(f))
}

pub struct FilterPushDownPhase;

impl FilterPushDownPhase {
    /// Push every filter as far toward the sources as it commutes.
    /// Schemas are re-inferred afterwards.
    pub fn apply(plan: &mut QueryPlan) -> CoreResult<()> {
        let filters: Vec<OperatorId> = plan
            .bfs_from_roots()
            .into_iter()
            .filter(|id| matches!(plan.node(*id).kind, OperatorKind::Filter { .. }))
            .collect();

        for filter in filters {
            // The filter may already have been consumed by a union/join
            // duplication of an earlier iteration.
            if !plan.contains(filter) {
                continue;
            }
            let OperatorKind::Filter { predicate } = plan.node(filter).kind.clone() else {
                continue;
            };
            let input = plan.node(filter).children[0];
            let mut pred = predicate;
            canonicalize(&mut pred, &plan.node(input).output_schema);

            plan.detach_unary(filter)?;
            plan.remove(filter);
            Self::push(plan, pred, input);
        }

        infer_schemas(plan)?;
        Self::replicate_join_key_filters(plan)?;
        infer_schemas(plan)
    }

    /// A filter that constrains the join key on one input branch holds for
    /// the other branch too (matching pairs share the key value), so it is
    /// mirrored there with the key renamed.
    fn replicate_join_key_filters(plan: &mut QueryPlan) -> CoreResult<()> {
        let joins: Vec<OperatorId> = plan
            .ids()
            .filter(|id| matches!(plan.node(*id).kind, OperatorKind::Join(_)))
            .collect();
        for join in joins {
            let node = plan.node(join).clone();
            let OperatorKind::Join(desc) = &node.kind else {
                continue;
            };
            let keys = [
                resolve_name(&plan.node(node.children[0]).output_schema, &desc.left_key),
                resolve_name(&plan.node(node.children[1]).output_schema, &desc.right_key),
            ];
            for side in 0..2 {
                let other = 1 - side;
                let subtree = Self::subtree(plan, node.children[side]);
                let other_preds: Vec<String> = Self::subtree(plan, node.children[other])
                    .into_iter()
                    .filter_map(|id| match &plan.node(id).kind {
                        OperatorKind::Filter { predicate } => Some(predicate.canonical()),
                        _ => None,
                    })
                    .collect();
                for id in subtree {
                    let OperatorKind::Filter { predicate } = plan.node(id).kind.clone() else {
                        continue;
                    };
                    if !predicate.referenced_fields().iter().all(|f| *f == keys[side]) {
                        continue;
                    }
                    let mut mirrored = predicate;
                    mirrored.rename_field(&keys[side], &keys[other]);
                    if other_preds.contains(&mirrored.canonical()) {
                        continue;
                    }
                    debug!(join = %join, predicate = %mirrored, "replicating join key filter");
                    Self::push(plan, mirrored, node.children[other]);
                }
            }
        }
        Ok(())
    }

    fn subtree(plan: &QueryPlan, from: OperatorId) -> Vec<OperatorId> {
        let mut queue = vec![from];
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        while let Some(id) = queue.pop() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id);
            queue.extend(plan.node(id).children.iter().copied());
        }
        out
    }

    /// Sink `pred` below `at` if the rules allow, else insert right above.
    fn push(plan: &mut QueryPlan, mut pred: Expr, at: OperatorId) {
        let node = plan.node(at).clone();
        match &node.kind {
            OperatorKind::Filter { .. } | OperatorKind::WatermarkAssign(_) => {
                Self::push(plan, pred, node.children[0]);
            }
            OperatorKind::Map { field, expr } => {
                let written = node
                    .output_schema
                    .field(field)
                    .map(|f| f.name.clone())
                    .unwrap_or_else(|| field.clone());
                if pred.referenced_fields().contains(&written) {
                    let mut inlined = expr.clone();
                    canonicalize(
                        &mut inlined,
                        &plan.node(node.children[0]).output_schema,
                    );
                    pred.substitute(&written, &inlined);
                }
                Self::push(plan, pred, node.children[0]);
            }
            OperatorKind::Project { fields } => {
                let input_schema = plan.node(node.children[0]).output_schema.clone();
                for (i, (input_name, rename)) in fields.iter().enumerate() {
                    if rename.is_none() {
                        continue;
                    }
                    let output_name = node.output_schema.fields[i].name.clone();
                    if let Some(idx) = input_schema.field_index(input_name) {
                        pred.rename_field(&output_name, &input_schema.fields[idx].name);
                    }
                }
                Self::push(plan, pred, node.children[0]);
            }
            OperatorKind::Union => {
                // union branches align by position; remap field names before
                // handing the copy to each branch
                for &branch in &node.children {
                    let branch_schema = plan.node(branch).output_schema.clone();
                    let mut branch_pred = pred.clone();
                    for (i, field) in node.output_schema.fields.iter().enumerate() {
                        let target = &branch_schema.fields[i].name;
                        if &field.name != target {
                            branch_pred.rename_field(&field.name, target);
                        }
                    }
                    Self::push(plan, branch_pred, branch);
                }
            }
            OperatorKind::Join(desc) => {
                let left_schema = plan.node(node.children[0]).output_schema.clone();
                let right_schema = plan.node(node.children[1]).output_schema.clone();
                let left_key = resolve_name(&left_schema, &desc.left_key);
                let right_key = resolve_name(&right_schema, &desc.right_key);

                let refs = pred.referenced_fields();
                let only_key = refs
                    .iter()
                    .all(|f| *f == left_key || *f == right_key);
                if only_key {
                    // replicate a join-key predicate to both sides
                    let mut left_pred = pred.clone();
                    left_pred.rename_field(&right_key, &left_key);
                    let mut right_pred = pred;
                    right_pred.rename_field(&left_key, &right_key);
                    Self::push(plan, left_pred, node.children[0]);
                    Self::push(plan, right_pred, node.children[1]);
                } else if covers(&left_schema, &pred) {
                    Self::push(plan, pred, node.children[0]);
                } else if covers(&right_schema, &pred) {
                    Self::push(plan, pred, node.children[1]);
                } else {
                    Self::insert_above(plan, pred, at);
                }
            }
            OperatorKind::Window(desc) => {
                let grouping: Option<String> = desc
                    .key
                    .as_ref()
                    .map(|k| resolve_name(&plan.node(node.children[0]).output_schema, k));
                let allowed = match grouping {
                    Some(key) => pred.referenced_fields().iter().all(|f| *f == key),
                    None => false,
                };
                if allowed {
                    Self::push(plan, pred, node.children[0]);
                } else {
                    Self::insert_above(plan, pred, at);
                }
            }
            OperatorKind::Source(_)
            | OperatorKind::NetworkSource(_)
            | OperatorKind::Sink(_)
            | OperatorKind::NetworkSink(_) => {
                Self::insert_above(plan, pred, at);
            }
        }
    }

    fn insert_above(plan: &mut QueryPlan, pred: Expr, at: OperatorId) {
        debug!(operator = %at, predicate = %pred, "filter settles");
        let filter = plan.add(OperatorKind::Filter { predicate: pred });
        for parent in plan.node(at).parents.clone() {
            plan.replace_child(parent, at, filter);
        }
        plan.connect(filter, at);
    }
}

fn resolve_name(schema: &Schema, name: &str) -> String {
    schema
        .field(name)
        .map(|f| f.name.clone())
        .unwrap_or_else(|| name.to_string())
}

pub struct ProjectionPushDownPhase;

impl ProjectionPushDownPhase {
    /// Move projections below filters and watermark assigners where every
    /// field those operators read survives the projection.
    pub fn apply(plan: &mut QueryPlan) -> CoreResult<()> {
        let mut changed = true;
        while changed {
            changed = false;
            let projects: Vec<OperatorId> = plan
                .bfs_from_roots()
                .into_iter()
                .filter(|id| matches!(plan.node(*id).kind, OperatorKind::Project { .. }))
                .collect();
            for project in projects {
                if Self::push_once(plan, project)? {
                    changed = true;
                }
            }
        }
        infer_schemas(plan)
    }

    fn push_once(plan: &mut QueryPlan, project: OperatorId) -> CoreResult<bool> {
        let child = plan.node(project).children[0];
        let child_node = plan.node(child).clone();
        let project_out = plan.node(project).output_schema.clone();
        let OperatorKind::Project { fields } = plan.node(project).kind.clone() else {
            return Ok(false);
        };

        let input_schema = plan.node(child_node.children[0]).output_schema.clone();
        // full names of the input fields the projection keeps
        let kept: Vec<String> = fields
            .iter()
            .filter_map(|(name, _)| {
                input_schema
                    .field_index(name)
                    .map(|i| input_schema.fields[i].name.clone())
            })
            .collect();

        let passes = match &child_node.kind {
            OperatorKind::Filter { predicate } => {
                // every referenced field must survive the projection
                predicate.referenced_fields().iter().all(|f| {
                    input_schema
                        .field_index(f)
                        .map(|i| kept.contains(&input_schema.fields[i].name))
                        .unwrap_or(false)
                })
            }
            OperatorKind::WatermarkAssign(desc) => desc
                .time
                .field()
                .map(|f| project_out.has_field(f))
                .unwrap_or(true),
            _ => false,
        };
        if !passes {
            return Ok(false);
        }

        // rewrite the child's field references through the renames
        if let OperatorKind::Filter { predicate } = &mut plan.node_mut(child).kind {
            canonicalize(predicate, &input_schema);
            for (i, (input_name, _)) in fields.iter().enumerate() {
                if let Some(idx) = input_schema.field_index(input_name) {
                    let old = input_schema.fields[idx].name.clone();
                    let new = project_out.fields[i].name.clone();
                    if old != new {
                        predicate.rename_field(&old, &new);
                    }
                }
            }
        }

        let grandchild = child_node.children[0];
        plan.detach_unary(project)?;
        plan.insert_between(child, grandchild, project);
        infer_schemas(plan)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Query;
    use crate::inference::attach_source_schemas;
    use crate::operator::{SinkDescriptor, TimeCharacteristic, WindowType};
    use dse_core::types::{DataType, Field};

    fn keyed_schema() -> Schema {
        Schema::new(vec![
            Field::new("k", DataType::Int64),
            Field::new("v", DataType::Int64),
            Field::new("ts", DataType::UInt64),
        ])
    }

    fn prepared(mut plan: QueryPlan) -> QueryPlan {
        attach_source_schemas(&mut plan, |_| Some(keyed_schema())).unwrap();
        infer_schemas(&mut plan).unwrap();
        plan
    }

    fn kinds_topo(plan: &QueryPlan) -> Vec<&'static str> {
        plan.topological()
            .unwrap()
            .into_iter()
            .map(|id| plan.node(id).kind.name())
            .collect()
    }

    #[test]
    fn filter_passes_watermark_and_map() {
        let plan = Query::from("s")
            .map("doubled", Expr::field("v").mul(Expr::lit(2i64)))
            .assign_watermark(
                TimeCharacteristic::EventTime { field: "ts".into() },
                0,
            )
            .filter(Expr::field("v").lt(Expr::lit(10i64)))
            .sink(SinkDescriptor::Print)
            .into_plan();
        let mut plan = prepared(plan);
        FilterPushDownPhase::apply(&mut plan).unwrap();
        assert_eq!(
            kinds_topo(&plan),
            vec!["source", "filter", "map", "watermark_assign", "sink"]
        );
    }

    #[test]
    fn filter_on_map_output_is_inlined() {
        let plan = Query::from("s")
            .map("doubled", Expr::field("v").mul(Expr::lit(2i64)))
            .filter(Expr::field("doubled").gt(Expr::lit(10i64)))
            .sink(SinkDescriptor::Print)
            .into_plan();
        let mut plan = prepared(plan);
        FilterPushDownPhase::apply(&mut plan).unwrap();
        assert_eq!(kinds_topo(&plan), vec!["source", "filter", "map", "sink"]);

        let filter = plan
            .ids()
            .find(|id| matches!(plan.node(*id).kind, OperatorKind::Filter { .. }))
            .unwrap();
        let OperatorKind::Filter { predicate } = &plan.node(filter).kind else {
            unreachable!()
        };
        // the predicate now reads the map input, not its output
        assert!(predicate.referenced_fields().contains("s$v"));
        assert!(!predicate.referenced_fields().contains("doubled"));
    }

    #[test]
    fn filter_duplicates_below_union() {
        let plan = Query::from("a")
            .union_with(Query::from("b"))
            .filter(Expr::field("v").lt(Expr::lit(5i64)))
            .sink(SinkDescriptor::Print)
            .into_plan();
        let mut plan = prepared(plan);
        FilterPushDownPhase::apply(&mut plan).unwrap();
        let filters = plan
            .ids()
            .filter(|id| matches!(plan.node(*id).kind, OperatorKind::Filter { .. }))
            .count();
        assert_eq!(filters, 2);
        // both filters sit directly above a source
        for id in plan.ids().collect::<Vec<_>>() {
            if matches!(plan.node(id).kind, OperatorKind::Filter { .. }) {
                let child = plan.node(id).children[0];
                assert!(plan.node(child).kind.is_source());
            }
        }
    }

    #[test]
    fn join_key_filter_is_replicated_to_both_sides() {
        let time = TimeCharacteristic::EventTime { field: "ts".into() };
        let plan = Query::from("a")
            .filter(Expr::field("a$k").lt(Expr::lit(10i64)))
            .join_with(Query::from("b"))
            .where_field("a$k")
            .equals_to("b$k")
            .window(WindowType::Tumbling { size_ms: 1000 }, time)
            .sink(SinkDescriptor::Print)
            .into_plan();
        let mut plan = prepared(plan);
        FilterPushDownPhase::apply(&mut plan).unwrap();

        let mut found = Vec::new();
        for id in plan.ids().collect::<Vec<_>>() {
            if let OperatorKind::Filter { predicate } = &plan.node(id).kind {
                let child = plan.node(id).children[0];
                assert!(plan.node(child).kind.is_source());
                found.push(predicate.canonical());
            }
        }
        found.sort();
        assert_eq!(found, vec!["(a$k<10)", "(b$k<10)"]);
    }

    #[test]
    fn side_local_filter_pushes_to_one_branch() {
        let time = TimeCharacteristic::EventTime { field: "ts".into() };
        let plan = Query::from("a")
            .join_with(Query::from("b"))
            .where_field("a$k")
            .equals_to("b$k")
            .window(WindowType::Tumbling { size_ms: 1000 }, time)
            .filter(Expr::field("b$v").gt(Expr::lit(0i64)))
            .sink(SinkDescriptor::Print)
            .into_plan();
        let mut plan = prepared(plan);
        FilterPushDownPhase::apply(&mut plan).unwrap();

        let filters: Vec<OperatorId> = plan
            .ids()
            .filter(|id| matches!(plan.node(*id).kind, OperatorKind::Filter { .. }))
            .collect();
        assert_eq!(filters.len(), 1);
        let child = plan.node(filters[0]).children[0];
        let OperatorKind::Source(desc) = &plan.node(child).kind else {
            panic!("filter should sit on a source");
        };
        assert_eq!(desc.logical_name, "b");
        // the join keeps its ordered branches
        let join = plan
            .ids()
            .find(|id| matches!(plan.node(*id).kind, OperatorKind::Join(_)))
            .unwrap();
        assert_eq!(plan.node(join).children.len(), 2);
    }

    #[test]
    fn filter_stops_at_window_unless_on_grouping_key() {
        let time = TimeCharacteristic::EventTime { field: "ts".into() };
        let plan = Query::from("s")
            .window(WindowType::Tumbling { size_ms: 1000 }, time.clone())
            .by_key("k")
            .apply(crate::operator::AggregationType::Sum, "v")
            .filter(Expr::field("v").gt(Expr::lit(3i64)))
            .sink(SinkDescriptor::Print)
            .into_plan();
        let mut plan = prepared(plan);
        FilterPushDownPhase::apply(&mut plan).unwrap();
        // aggregate output filter must stay above the window
        let filter = plan
            .ids()
            .find(|id| matches!(plan.node(*id).kind, OperatorKind::Filter { .. }))
            .unwrap();
        let child = plan.node(filter).children[0];
        assert!(matches!(plan.node(child).kind, OperatorKind::Window(_)));

        // but a grouping-key filter passes through
        let plan2 = Query::from("s")
            .window(WindowType::Tumbling { size_ms: 1000 }, time)
            .by_key("k")
            .apply(crate::operator::AggregationType::Sum, "v")
            .filter(Expr::field("k").gt(Expr::lit(0i64)))
            .sink(SinkDescriptor::Print)
            .into_plan();
        let mut plan2 = prepared(plan2);
        FilterPushDownPhase::apply(&mut plan2).unwrap();
        let filter2 = plan2
            .ids()
            .find(|id| matches!(plan2.node(*id).kind, OperatorKind::Filter { .. }))
            .unwrap();
        let child2 = plan2.node(filter2).children[0];
        assert!(plan2.node(child2).kind.is_source());
    }

    #[test]
    fn projection_pushes_below_filter_with_rename_rewrite() {
        let plan = Query::from("s")
            .filter(Expr::field("k").gt(Expr::lit(0i64)))
            .project(&[("k", Some("key2"))])
            .sink(SinkDescriptor::Print)
            .into_plan();
        let mut plan = prepared(plan);
        ProjectionPushDownPhase::apply(&mut plan).unwrap();
        assert_eq!(kinds_topo(&plan), vec!["source", "project", "filter", "sink"]);
        let filter = plan
            .ids()
            .find(|id| matches!(plan.node(*id).kind, OperatorKind::Filter { .. }))
            .unwrap();
        let OperatorKind::Filter { predicate } = &plan.node(filter).kind else {
            unreachable!()
        };
        assert!(predicate.referenced_fields().contains("s$key2"));
    }

    #[test]
    fn projection_stays_when_filter_needs_pruned_field() {
        let plan = Query::from("s")
            .filter(Expr::field("v").gt(Expr::lit(0i64)))
            .project(&[("k", None)])
            .sink(SinkDescriptor::Print)
            .into_plan();
        let mut plan = prepared(plan);
        ProjectionPushDownPhase::apply(&mut plan).unwrap();
        assert_eq!(kinds_topo(&plan), vec!["source", "filter", "project", "sink"]);
    }
}
