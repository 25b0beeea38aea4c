//! The global query plan: every shared plan the coordinator runs.

use std::collections::HashMap;

use tracing::info;

use dse_core::{CoreError, CoreResult, IdGenerator, PlacementStrategy, QueryId, SharedQueryId};
use dse_plan::{QueryPlan, SharedQueryPlan};

#[derive(Default)]
pub struct GlobalQueryPlan {
    shared: HashMap<SharedQueryId, SharedQueryPlan>,
    ids: IdGenerator,
}

impl GlobalQueryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the query into an accepting shared plan or open a new one.
    /// Returns the hosting shared plan id.
    pub fn add_query(
        &mut self,
        query_id: QueryId,
        plan: QueryPlan,
        strategy: PlacementStrategy,
    ) -> SharedQueryId {
        let host = self
            .shared
            .values_mut()
            .filter(|s| !s.is_empty())
            .find(|s| s.accepts(&plan, strategy));
        if let Some(host) = host {
            host.merge(query_id, &plan);
            return host.id;
        }
        let id: SharedQueryId = self.ids.next();
        info!(shared = %id, query = %query_id, "new shared plan");
        self.shared
            .insert(id, SharedQueryPlan::new(id, strategy, query_id, plan));
        id
    }

    /// Drop a query from its shared plan. Returns the shared id and
    /// whether the plan is now empty.
    pub fn remove_query(&mut self, query_id: QueryId) -> CoreResult<(SharedQueryId, bool)> {
        let shared = self
            .shared
            .values_mut()
            .find(|s| s.contains_query(query_id))
            .ok_or_else(|| CoreError::NotFound(format!("query {query_id} in global plan")))?;
        shared.remove_query(query_id);
        Ok((shared.id, shared.is_empty()))
    }

    pub fn get(&self, id: SharedQueryId) -> Option<&SharedQueryPlan> {
        self.shared.get(&id)
    }

    pub fn get_mut(&mut self, id: SharedQueryId) -> Option<&mut SharedQueryPlan> {
        self.shared.get_mut(&id)
    }

    pub fn shared_of_query(&self, query_id: QueryId) -> Option<&SharedQueryPlan> {
        self.shared.values().find(|s| s.contains_query(query_id))
    }

    pub fn remove_shared(&mut self, id: SharedQueryId) -> Option<SharedQueryPlan> {
        self.shared.remove(&id)
    }

    pub fn shared_ids(&self) -> Vec<SharedQueryId> {
        let mut ids: Vec<SharedQueryId> = self.shared.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dse_core::types::{DataType, Field, Schema};
    use dse_core::Expr;
    use dse_plan::{attach_source_schemas, infer_schemas, Query, SinkDescriptor};

    fn typed_plan(qid: u64) -> QueryPlan {
        let mut plan = Query::from("default_logical")
            .filter(Expr::field("value").lt(Expr::lit(42i64)))
            .sink(SinkDescriptor::Print)
            .into_plan();
        plan.query_id = QueryId::new(qid);
        attach_source_schemas(&mut plan, |_| {
            Some(Schema::new(vec![Field::new("value", DataType::Int64)]))
        })
        .unwrap();
        infer_schemas(&mut plan).unwrap();
        plan
    }

    #[test]
    fn identical_queries_share_one_plan() {
        let mut global = GlobalQueryPlan::new();
        let s1 = global.add_query(QueryId::new(1), typed_plan(1), PlacementStrategy::BottomUp);
        let s2 = global.add_query(QueryId::new(2), typed_plan(2), PlacementStrategy::BottomUp);
        assert_eq!(s1, s2);
        assert_eq!(global.len(), 1);
        assert_eq!(global.get(s1).unwrap().query_ids().len(), 2);
    }

    #[test]
    fn different_strategy_means_different_shared_plan() {
        let mut global = GlobalQueryPlan::new();
        let s1 = global.add_query(QueryId::new(1), typed_plan(1), PlacementStrategy::BottomUp);
        let s2 = global.add_query(QueryId::new(2), typed_plan(2), PlacementStrategy::TopDown);
        assert_ne!(s1, s2);
        assert_eq!(global.len(), 2);
    }

    #[test]
    fn removal_empties_and_keeps_other_queries() {
        let mut global = GlobalQueryPlan::new();
        let shared = global.add_query(QueryId::new(1), typed_plan(1), PlacementStrategy::BottomUp);
        global.add_query(QueryId::new(2), typed_plan(2), PlacementStrategy::BottomUp);

        let (id, empty) = global.remove_query(QueryId::new(1)).unwrap();
        assert_eq!(id, shared);
        assert!(!empty);
        let (_, empty) = global.remove_query(QueryId::new(2)).unwrap();
        assert!(empty);
        assert!(global.remove_query(QueryId::new(3)).is_err());
    }
}
