//! Signature-based query merging and shared plans.
//!
//! A shared query plan is the union of several user queries over the same
//! source set and placement strategy. Merging walks the candidate plan from
//! its sinks downward: the first node whose signature already exists in the
//! host is redirected onto the host node, sharing the whole subtree below.
//! Filters additionally merge under containment: when one predicate's
//! conjuncts are a subset of the other's, the stronger filter re-reads the
//! weaker filter's output through the residual conjuncts. Union and join
//! nodes only ever merge under exact signature equality, which keeps their
//! branch structure intact. Window grafts pass a compatibility check: the
//! window's event-time field must still exist in the graft target's output.
//!
//! Every merge appends to the shared plan's change log, which the
//! deployment phase consumes to compute incremental updates.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use dse_core::{
    Expr, OperatorId, PlacementStrategy, QueryId, Schema, SharedQueryId, SharedQueryStatus,
};

use crate::operator::OperatorKind;
use crate::plan::QueryPlan;
use crate::signature::signatures;

/// Log of sink additions/removals since the last deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChangeLogEntry {
    QueryAdded {
        query_id: QueryId,
        sinks: Vec<OperatorId>,
    },
    QueryRemoved {
        query_id: QueryId,
        sinks: Vec<OperatorId>,
    },
}

/// The source names a plan reads; merging requires equal source sets.
pub fn source_set(plan: &QueryPlan) -> BTreeSet<String> {
    plan.ids()
        .filter_map(|id| match &plan.node(id).kind {
            OperatorKind::Source(desc) => Some(desc.logical_name.clone()),
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedQueryPlan {
    pub id: SharedQueryId,
    pub strategy: PlacementStrategy,
    pub plan: QueryPlan,
    pub status: SharedQueryStatus,
    /// Sinks owned by each contributing query.
    pub query_sinks: HashMap<QueryId, Vec<OperatorId>>,
    pub change_log: Vec<ChangeLogEntry>,
}

impl SharedQueryPlan {
    /// Host a first query.
    pub fn new(
        id: SharedQueryId,
        strategy: PlacementStrategy,
        query_id: QueryId,
        plan: QueryPlan,
    ) -> Self {
        let sinks = plan.roots();
        let mut query_sinks = HashMap::new();
        query_sinks.insert(query_id, sinks.clone());
        Self {
            id,
            strategy,
            plan,
            status: SharedQueryStatus::Created,
            query_sinks,
            change_log: vec![ChangeLogEntry::QueryAdded {
                query_id,
                sinks,
            }],
        }
    }

    pub fn query_ids(&self) -> Vec<QueryId> {
        self.query_sinks.keys().copied().collect()
    }

    pub fn contains_query(&self, query_id: QueryId) -> bool {
        self.query_sinks.contains_key(&query_id)
    }

    pub fn is_empty(&self) -> bool {
        self.query_sinks.is_empty()
    }

    /// Whether `candidate` may merge into this plan at all.
    pub fn accepts(&self, candidate: &QueryPlan, strategy: PlacementStrategy) -> bool {
        self.strategy == strategy && source_set(&self.plan) == source_set(candidate)
    }

    /// Merge a candidate query. The candidate must have passed
    /// [`SharedQueryPlan::accepts`]; its operators are absorbed and every
    /// duplicate subtree is shared.
    pub fn merge(&mut self, query_id: QueryId, candidate: &QueryPlan) {
        let host_sigs = signatures(&self.plan);
        let mut by_sig: HashMap<String, OperatorId> = host_sigs
            .iter()
            .map(|(id, sig)| (sig.clone(), *id))
            .collect();

        let candidate_sigs = signatures(candidate);
        let mapping = self.plan.absorb(candidate);

        // Walk the absorbed nodes from the candidate sinks downward and
        // stop descending at the first shared subtree.
        let mut visited: HashSet<OperatorId> = HashSet::new();
        let mut stack: Vec<OperatorId> = candidate.roots().to_vec();
        while let Some(old_id) = stack.pop() {
            if !visited.insert(old_id) {
                continue;
            }
            let new_id = mapping[&old_id];
            let sig = &candidate_sigs[&old_id];
            let node_kind = candidate.node(old_id).kind.clone();

            if !node_kind.is_sink() {
                if let Some(&host_id) = by_sig.get(sig) {
                    if host_id != new_id {
                        debug!(from = %new_id, to = %host_id, "equality merge");
                        self.plan.redirect_parents(new_id, host_id);
                        continue;
                    }
                }
                if let Some(grafted) = self.try_containment_graft(new_id, &by_sig) {
                    debug!(from = %new_id, onto = %grafted, "containment graft");
                    continue;
                }
            }
            // not shared: remember the absorbed node for later candidates
            by_sig.entry(sig.clone()).or_insert(new_id);
            stack.extend(candidate.node(old_id).children.iter().copied());
        }

        self.prune_orphans();

        let sinks: Vec<OperatorId> = candidate.roots().iter().map(|r| mapping[r]).collect();
        self.query_sinks.insert(query_id, sinks.clone());
        self.change_log.push(ChangeLogEntry::QueryAdded {
            query_id,
            sinks,
        });
        if self.status == SharedQueryStatus::Deployed {
            self.status = SharedQueryStatus::Updated;
        }
        info!(shared = %self.id, query = %query_id, operators = self.plan.len(), "query merged");
    }

    /// Filter containment: if a host filter over the same input is weaker
    /// (its conjuncts are a subset), the absorbed filter re-reads the host
    /// filter's output through the residual conjuncts.
    fn try_containment_graft(
        &mut self,
        new_id: OperatorId,
        by_sig: &HashMap<String, OperatorId>,
    ) -> Option<OperatorId> {
        let OperatorKind::Filter { predicate } = self.plan.node(new_id).kind.clone() else {
            return None;
        };
        let sigs = signatures(&self.plan);
        let my_input_sig = &sigs[&self.plan.node(new_id).children[0]];

        let my_conjuncts: BTreeSet<String> = predicate
            .conjuncts()
            .iter()
            .map(|c| c.canonical())
            .collect();

        // candidates: host filters whose input subtree matches
        let host_candidates: Vec<OperatorId> = by_sig.values().copied().collect();
        for host_id in host_candidates {
            if host_id == new_id || !self.plan.contains(host_id) {
                continue;
            }
            let OperatorKind::Filter {
                predicate: host_pred,
            } = self.plan.node(host_id).kind.clone()
            else {
                continue;
            };
            if &sigs[&self.plan.node(host_id).children[0]] != my_input_sig {
                continue;
            }
            let host_conjuncts: BTreeSet<String> = host_pred
                .conjuncts()
                .iter()
                .map(|c| c.canonical())
                .collect();
            if !host_conjuncts.is_subset(&my_conjuncts) || host_conjuncts == my_conjuncts {
                continue;
            }
            if !self.window_compatible(new_id, host_id) {
                continue;
            }
            // residual = mine minus host's
            let residual: Vec<Expr> = predicate
                .conjuncts()
                .into_iter()
                .filter(|c| !host_conjuncts.contains(&c.canonical()))
                .cloned()
                .collect();
            let residual =
                Expr::conjoin(residual).expect("containment is strict, residual is non-empty");
            let old_child = self.plan.node(new_id).children[0];
            if let OperatorKind::Filter { predicate } = &mut self.plan.node_mut(new_id).kind {
                *predicate = residual;
            }
            self.plan.disconnect(new_id, old_child);
            self.plan.connect(new_id, host_id);
            return Some(host_id);
        }
        None
    }

    /// Windowed consumers of the grafted node must still find their
    /// event-time field in the graft target's output schema.
    fn window_compatible(&self, grafted: OperatorId, target: OperatorId) -> bool {
        let target_schema: &Schema = &self.plan.node(target).output_schema;
        let mut stack = vec![grafted];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let node = self.plan.node(id);
            let time = match &node.kind {
                OperatorKind::Window(desc) => Some(&desc.time),
                OperatorKind::Join(desc) => Some(&desc.time),
                OperatorKind::WatermarkAssign(desc) => Some(&desc.time),
                _ => None,
            };
            if let Some(time) = time {
                if let Some(field) = time.field() {
                    if !target_schema.has_field(field) {
                        return false;
                    }
                }
            }
            stack.extend(node.parents.iter().copied());
        }
        true
    }

    /// Remove a contributing query: drop its sinks and prune everything no
    /// other query reaches.
    pub fn remove_query(&mut self, query_id: QueryId) -> bool {
        let Some(sinks) = self.query_sinks.remove(&query_id) else {
            return false;
        };
        for sink in &sinks {
            self.plan.remove(*sink);
        }
        self.prune_orphans();
        self.change_log.push(ChangeLogEntry::QueryRemoved {
            query_id,
            sinks,
        });
        if self.query_sinks.is_empty() {
            self.status = SharedQueryStatus::Stopped;
        } else if self.status == SharedQueryStatus::Deployed {
            self.status = SharedQueryStatus::Updated;
        }
        true
    }

    /// Drop nodes no sink reaches anymore.
    fn prune_orphans(&mut self) {
        loop {
            let orphans: Vec<OperatorId> = self
                .plan
                .ids()
                .filter(|&id| {
                    let node = self.plan.node(id);
                    node.parents.is_empty() && !node.kind.is_sink()
                })
                .collect();
            if orphans.is_empty() {
                return;
            }
            for id in orphans {
                self.plan.remove(id);
            }
        }
    }

    pub fn drain_change_log(&mut self) -> Vec<ChangeLogEntry> {
        std::mem::take(&mut self.change_log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Query;
    use crate::inference::{attach_source_schemas, infer_schemas};
    use crate::operator::SinkDescriptor;
    use dse_core::types::{DataType, Field};

    fn typed(mut plan: QueryPlan, query_id: QueryId) -> QueryPlan {
        plan.query_id = query_id;
        attach_source_schemas(&mut plan, |_| {
            Some(Schema::new(vec![
                Field::new("k", DataType::Int64),
                Field::new("v", DataType::Int64),
                Field::new("ts", DataType::UInt64),
            ]))
        })
        .unwrap();
        infer_schemas(&mut plan).unwrap();
        plan
    }

    fn filter_query(limit: i64, qid: u64) -> QueryPlan {
        typed(
            Query::from("s")
                .filter(Expr::field("v").lt(Expr::lit(limit)))
                .sink(SinkDescriptor::Print)
                .into_plan(),
            QueryId::new(qid),
        )
    }

    #[test]
    fn equal_queries_share_everything_but_sinks() {
        let a = filter_query(42, 1);
        let b = filter_query(42, 2);
        let mut shared =
            SharedQueryPlan::new(SharedQueryId::new(1), PlacementStrategy::BottomUp, QueryId::new(1), a);
        assert!(shared.accepts(&b, PlacementStrategy::BottomUp));
        shared.merge(QueryId::new(2), &b);

        // one source, one filter, two sinks
        assert_eq!(shared.plan.len(), 4);
        let filters = shared
            .plan
            .ids()
            .filter(|id| matches!(shared.plan.node(*id).kind, OperatorKind::Filter { .. }))
            .count();
        assert_eq!(filters, 1);
        assert_eq!(shared.plan.roots().len(), 2);
        assert_eq!(shared.query_ids().len(), 2);
        shared.plan.validate().unwrap();
    }

    #[test]
    fn contained_filter_reads_residual_from_container() {
        // host keeps v < 42; candidate asks v < 42 && k > 0, which is
        // contained and grafts with residual k > 0
        let host = filter_query(42, 1);
        let candidate = typed(
            Query::from("s")
                .filter(
                    Expr::field("v")
                        .lt(Expr::lit(42i64))
                        .and(Expr::field("k").gt(Expr::lit(0i64))),
                )
                .sink(SinkDescriptor::Print)
                .into_plan(),
            QueryId::new(2),
        );
        let mut shared = SharedQueryPlan::new(
            SharedQueryId::new(1),
            PlacementStrategy::BottomUp,
            QueryId::new(1),
            host,
        );
        shared.merge(QueryId::new(2), &candidate);

        // one source, the weak filter, the residual filter, two sinks
        assert_eq!(shared.plan.len(), 5);
        let residual = shared
            .plan
            .ids()
            .find(|id| {
                matches!(
                    &shared.plan.node(*id).kind,
                    OperatorKind::Filter { predicate } if predicate.canonical().contains("k")
                )
            })
            .expect("residual filter");
        let container = shared.plan.node(residual).children[0];
        assert!(matches!(
            shared.plan.node(container).kind,
            OperatorKind::Filter { .. }
        ));
        shared.plan.validate().unwrap();
    }

    #[test]
    fn distinct_predicates_stay_distinct() {
        let a = filter_query(42, 1);
        let b = filter_query(7, 2);
        let mut shared = SharedQueryPlan::new(
            SharedQueryId::new(1),
            PlacementStrategy::BottomUp,
            QueryId::new(1),
            a,
        );
        shared.merge(QueryId::new(2), &b);
        let filters = shared
            .plan
            .ids()
            .filter(|id| matches!(shared.plan.node(*id).kind, OperatorKind::Filter { .. }))
            .count();
        // no containment between v<42 and v<7 syntactically: both stay,
        // sharing the source
        assert_eq!(filters, 2);
        let sources = shared
            .plan
            .ids()
            .filter(|id| shared.plan.node(*id).kind.is_source())
            .count();
        assert_eq!(sources, 1);
    }

    #[test]
    fn strategy_mismatch_is_rejected() {
        let a = filter_query(42, 1);
        let b = filter_query(42, 2);
        let shared = SharedQueryPlan::new(
            SharedQueryId::new(1),
            PlacementStrategy::BottomUp,
            QueryId::new(1),
            a,
        );
        assert!(!shared.accepts(&b, PlacementStrategy::TopDown));
    }

    #[test]
    fn removing_last_query_stops_the_plan() {
        let a = filter_query(42, 1);
        let b = filter_query(42, 2);
        let mut shared = SharedQueryPlan::new(
            SharedQueryId::new(1),
            PlacementStrategy::BottomUp,
            QueryId::new(1),
            a,
        );
        shared.merge(QueryId::new(2), &b);

        assert!(shared.remove_query(QueryId::new(1)));
        // the other query keeps the plan alive
        assert_eq!(shared.plan.roots().len(), 1);
        assert!(!shared.is_empty());
        assert_ne!(shared.status, SharedQueryStatus::Stopped);

        assert!(shared.remove_query(QueryId::new(2)));
        assert!(shared.is_empty());
        assert_eq!(shared.status, SharedQueryStatus::Stopped);
        assert!(!shared.remove_query(QueryId::new(2)));
    }
}
