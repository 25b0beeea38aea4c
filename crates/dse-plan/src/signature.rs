//! Canonical operator signatures.
//!
//! A signature is a deterministic string over an operator's payload and the
//! signatures of its inputs, so equal signatures imply equal subtrees.
//! Union branches are order-normalized (union is commutative); join
//! branches are not.

use std::collections::HashMap;

use dse_core::OperatorId;

use crate::operator::{OperatorKind, TimeCharacteristic, WindowType};
use crate::plan::QueryPlan;

fn time_sig(time: &TimeCharacteristic) -> String {
    match time {
        TimeCharacteristic::EventTime { field } => format!("event({field})"),
        TimeCharacteristic::IngestionTime => "ingestion".to_string(),
    }
}

fn window_sig(window: &WindowType) -> String {
    match window {
        WindowType::Tumbling { size_ms } => format!("tumbling({size_ms})"),
        WindowType::Sliding { size_ms, slide_ms } => {
            format!("sliding({size_ms},{slide_ms})")
        }
        WindowType::Threshold {
            predicate,
            min_count,
        } => format!("threshold({},{min_count})", predicate.canonical()),
    }
}

/// Signatures for every operator of the plan, inputs first.
pub fn signatures(plan: &QueryPlan) -> HashMap<OperatorId, String> {
    let mut sigs: HashMap<OperatorId, String> = HashMap::new();
    let order = plan
        .topological()
        .expect("signatures require an acyclic plan");
    for id in order {
        let node = plan.node(id);
        let child_sig = |i: usize| sigs[&node.children[i]].clone();
        let sig = match &node.kind {
            OperatorKind::Source(desc) => format!("source({})", desc.logical_name),
            OperatorKind::NetworkSource(desc) => format!("netsource({})", desc.partition),
            OperatorKind::Filter { predicate } => {
                format!("filter({})[{}]", predicate.canonical(), child_sig(0))
            }
            OperatorKind::Map { field, expr } => {
                format!("map({field}={})[{}]", expr.canonical(), child_sig(0))
            }
            OperatorKind::Project { fields } => {
                let list: Vec<String> = fields
                    .iter()
                    .map(|(n, r)| match r {
                        Some(r) => format!("{n}->{r}"),
                        None => n.clone(),
                    })
                    .collect();
                format!("project({})[{}]", list.join(","), child_sig(0))
            }
            OperatorKind::Union => {
                let mut branches = [child_sig(0), child_sig(1)];
                branches.sort();
                format!("union[{}|{}]", branches[0], branches[1])
            }
            OperatorKind::Join(desc) => format!(
                "join({}={},{},{})[{}|{}]",
                desc.left_key,
                desc.right_key,
                window_sig(&desc.window),
                time_sig(&desc.time),
                child_sig(0),
                child_sig(1)
            ),
            OperatorKind::Window(desc) => format!(
                "window({},{},{:?},{:?},{})[{}]",
                window_sig(&desc.window),
                time_sig(&desc.time),
                desc.key,
                desc.aggregation,
                desc.on_field,
                child_sig(0)
            ),
            OperatorKind::WatermarkAssign(desc) => format!(
                "watermark({},{})[{}]",
                time_sig(&desc.time),
                desc.allowed_lateness_ms,
                child_sig(0)
            ),
            // sinks are per-query and never merged, but still need a stable
            // signature for bookkeeping
            OperatorKind::Sink(_) => format!("sink#{id}[{}]", child_sig(0)),
            OperatorKind::NetworkSink(desc) => {
                format!("netsink({})[{}]", desc.partition, child_sig(0))
            }
        };
        sigs.insert(id, sig);
    }
    sigs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Query;
    use crate::operator::SinkDescriptor;
    use dse_core::Expr;

    fn sample() -> QueryPlan {
        Query::from("s")
            .filter(Expr::field("v").lt(Expr::lit(42i64)))
            .sink(SinkDescriptor::Print)
            .into_plan()
    }

    #[test]
    fn identical_plans_share_signatures() {
        let a = sample();
        let b = sample();
        let sa = signatures(&a);
        let sb = signatures(&b);
        let filter_a = a
            .ids()
            .find(|id| matches!(a.node(*id).kind, OperatorKind::Filter { .. }))
            .unwrap();
        let filter_b = b
            .ids()
            .find(|id| matches!(b.node(*id).kind, OperatorKind::Filter { .. }))
            .unwrap();
        assert_eq!(sa[&filter_a], sb[&filter_b]);
        assert_eq!(sa[&filter_a], "filter((v<42))[source(s)]");
    }

    #[test]
    fn union_signature_is_branch_order_invariant() {
        let ab = Query::from("a").union_with(Query::from("b")).into_plan();
        let ba = Query::from("b").union_with(Query::from("a")).into_plan();
        let union_of = |p: &QueryPlan| {
            let id = p
                .ids()
                .find(|id| matches!(p.node(*id).kind, OperatorKind::Union))
                .unwrap();
            signatures(p)[&id].clone()
        };
        assert_eq!(union_of(&ab), union_of(&ba));
    }

    #[test]
    fn sink_signatures_stay_distinct() {
        let plan = sample();
        let sigs = signatures(&plan);
        let sink = plan.roots()[0];
        assert!(sigs[&sink].starts_with("sink#"));
    }
}
