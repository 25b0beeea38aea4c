//! Decomposed subplans: the unit of deployment.
//!
//! Placement partitions a shared plan over topology nodes and cuts the
//! crossing edges into network sink/source pairs; each worker then receives
//! one `DecomposedPlan` per shared plan, serialized as JSON inside the
//! register RPC.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use dse_core::{CoreError, CoreResult, OperatorId, QueryId, SharedQueryId, SubPlanId, TopologyNodeId};

use crate::operator::OperatorKind;
use crate::plan::QueryPlan;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposedPlan {
    pub subplan_id: SubPlanId,
    pub shared_query_id: SharedQueryId,
    /// Queries contributing to the shared plan; failures are reported
    /// against these.
    pub query_ids: Vec<QueryId>,
    /// Topology node this subplan was placed on.
    pub worker_id: TopologyNodeId,
    pub plan: QueryPlan,
}

impl DecomposedPlan {
    /// Extract the operators in `keep` from the shared plan.
    pub fn extract(
        subplan_id: SubPlanId,
        shared_query_id: SharedQueryId,
        query_ids: Vec<QueryId>,
        worker_id: TopologyNodeId,
        shared: &QueryPlan,
        keep: &HashSet<OperatorId>,
    ) -> CoreResult<DecomposedPlan> {
        let plan = shared.extract(keep);
        let decomposed = DecomposedPlan {
            subplan_id,
            shared_query_id,
            query_ids,
            worker_id,
            plan,
        };
        decomposed.validate()?;
        Ok(decomposed)
    }

    /// A deployable subplan starts at sources (logical or network) and ends
    /// at sinks (user or network).
    pub fn validate(&self) -> CoreResult<()> {
        self.plan.validate()?;
        for id in self.plan.ids().collect::<Vec<_>>() {
            let node = self.plan.node(id);
            if node.children.is_empty() && !node.kind.is_source() {
                return Err(CoreError::Deployment(format!(
                    "subplan {} has dangling input at {} ({})",
                    self.subplan_id,
                    id,
                    node.kind.name()
                )));
            }
            if node.parents.is_empty() && !node.kind.is_sink() {
                return Err(CoreError::Deployment(format!(
                    "subplan {} has dangling output at {} ({})",
                    self.subplan_id,
                    id,
                    node.kind.name()
                )));
            }
        }
        Ok(())
    }

    pub fn source_operators(&self) -> Vec<OperatorId> {
        self.plan
            .ids()
            .filter(|&id| self.plan.node(id).kind.is_source())
            .collect()
    }

    pub fn sink_operators(&self) -> Vec<OperatorId> {
        self.plan
            .ids()
            .filter(|&id| self.plan.node(id).kind.is_sink())
            .collect()
    }

    /// Serialize for the register RPC body.
    pub fn to_json(&self) -> CoreResult<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| CoreError::Deployment(format!("subplan serialization: {e}")))
    }

    pub fn from_json(value: serde_json::Value) -> CoreResult<DecomposedPlan> {
        serde_json::from_value(value)
            .map_err(|e| CoreError::Validation(format!("subplan deserialization: {e}")))
    }
}

/// True if the operator must break a pipeline: blocking state, network
/// boundary, or fan-in.
pub fn is_pipeline_breaker(kind: &OperatorKind) -> bool {
    matches!(
        kind,
        OperatorKind::Window(_)
            | OperatorKind::Join(_)
            | OperatorKind::Union
            | OperatorKind::Source(_)
            | OperatorKind::NetworkSource(_)
            | OperatorKind::Sink(_)
            | OperatorKind::NetworkSink(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Query;
    use crate::operator::SinkDescriptor;
    use dse_core::Expr;

    #[test]
    fn roundtrips_through_json() {
        let plan = Query::from("s")
            .filter(Expr::field("v").lt(Expr::lit(3i64)))
            .sink(SinkDescriptor::Print)
            .into_plan();
        let keep: HashSet<OperatorId> = plan.ids().collect();
        let dp = DecomposedPlan::extract(
            SubPlanId::new(1),
            SharedQueryId::new(1),
            vec![QueryId::new(1)],
            TopologyNodeId::new(2),
            &plan,
            &keep,
        )
        .unwrap();
        let json = dp.to_json().unwrap();
        let back = DecomposedPlan::from_json(json).unwrap();
        assert_eq!(back.plan.len(), 3);
        assert_eq!(back.subplan_id, SubPlanId::new(1));
    }

    #[test]
    fn dangling_edges_are_rejected() {
        let plan = Query::from("s")
            .filter(Expr::field("v").lt(Expr::lit(3i64)))
            .sink(SinkDescriptor::Print)
            .into_plan();
        // keep only the filter and sink: the filter input dangles
        let keep: HashSet<OperatorId> = plan
            .ids()
            .filter(|&id| !plan.node(id).kind.is_source())
            .collect();
        let result = DecomposedPlan::extract(
            SubPlanId::new(1),
            SharedQueryId::new(1),
            vec![QueryId::new(1)],
            TopologyNodeId::new(2),
            &plan,
            &keep,
        );
        assert!(result.is_err());
    }
}
