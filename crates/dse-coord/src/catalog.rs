//! Source and query catalogs.
//!
//! Each catalog serializes its updates behind one mutex owned by the
//! coordinator; cross-catalog operations take locks in the fixed order
//! topology, then shared plans, then query catalog.

use std::collections::HashMap;

use dse_core::types::Schema;
use dse_core::{
    CoreError, CoreResult, FaultToleranceType, LineageType, PlacementStrategy, QueryId,
    QueryStatus, SharedQueryId, TopologyNodeId,
};

/// A physical source instance hosted by one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalSourceEntry {
    pub logical_name: String,
    pub physical_name: String,
    pub source_type: String,
    pub worker: TopologyNodeId,
}

/// Logical source names to schemas, physical sources to owning workers.
#[derive(Default)]
pub struct SourceCatalog {
    logical: HashMap<String, Schema>,
    physical: Vec<PhysicalSourceEntry>,
}

impl SourceCatalog {
    pub fn register_logical(&mut self, name: impl Into<String>, schema: Schema) -> CoreResult<()> {
        let name = name.into();
        if self.logical.contains_key(&name) {
            return Err(CoreError::Validation(format!(
                "logical source {name} already registered"
            )));
        }
        self.logical.insert(name, schema);
        Ok(())
    }

    pub fn unregister_logical(&mut self, name: &str) -> CoreResult<()> {
        self.logical
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("logical source {name}")))?;
        self.physical.retain(|p| p.logical_name != name);
        Ok(())
    }

    pub fn schema_of(&self, name: &str) -> Option<Schema> {
        self.logical.get(name).cloned()
    }

    pub fn register_physical(&mut self, entry: PhysicalSourceEntry) -> CoreResult<()> {
        if !self.logical.contains_key(&entry.logical_name) {
            return Err(CoreError::NotFound(format!(
                "logical source {}",
                entry.logical_name
            )));
        }
        if self
            .physical
            .iter()
            .any(|p| p.physical_name == entry.physical_name && p.worker == entry.worker)
        {
            return Err(CoreError::Validation(format!(
                "physical source {} already registered on worker {}",
                entry.physical_name, entry.worker
            )));
        }
        self.physical.push(entry);
        Ok(())
    }

    pub fn unregister_physical(
        &mut self,
        worker: TopologyNodeId,
        logical_name: &str,
        physical_name: &str,
    ) -> CoreResult<()> {
        let before = self.physical.len();
        self.physical.retain(|p| {
            !(p.worker == worker
                && p.logical_name == logical_name
                && p.physical_name == physical_name)
        });
        if self.physical.len() == before {
            return Err(CoreError::NotFound(format!(
                "physical source {physical_name} on worker {worker}"
            )));
        }
        Ok(())
    }

    pub fn unregister_worker(&mut self, worker: TopologyNodeId) {
        self.physical.retain(|p| p.worker != worker);
    }

    /// Workers hosting physical instances of a logical source.
    pub fn providers_of(&self, logical_name: &str) -> Vec<TopologyNodeId> {
        let mut workers: Vec<TopologyNodeId> = self
            .physical
            .iter()
            .filter(|p| p.logical_name == logical_name)
            .map(|p| p.worker)
            .collect();
        workers.sort();
        workers.dedup();
        workers
    }
}

#[derive(Debug, Clone)]
pub struct QueryEntry {
    pub id: QueryId,
    pub query_string: String,
    pub placement: PlacementStrategy,
    pub fault_tolerance: FaultToleranceType,
    pub lineage: LineageType,
    pub status: QueryStatus,
    pub shared_query_id: SharedQueryId,
    pub failure_reason: Option<String>,
}

#[derive(Default)]
pub struct QueryCatalog {
    entries: HashMap<QueryId, QueryEntry>,
}

impl QueryCatalog {
    pub fn insert(&mut self, entry: QueryEntry) {
        self.entries.insert(entry.id, entry);
    }

    pub fn get(&self, id: QueryId) -> Option<&QueryEntry> {
        self.entries.get(&id)
    }

    pub fn status_of(&self, id: QueryId) -> CoreResult<QueryStatus> {
        self.entries
            .get(&id)
            .map(|e| e.status)
            .ok_or_else(|| CoreError::NotFound(format!("query {id}")))
    }

    pub fn set_status(&mut self, id: QueryId, status: QueryStatus) -> CoreResult<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("query {id}")))?;
        entry.status = status;
        Ok(())
    }

    pub fn set_failed(&mut self, id: QueryId, reason: impl Into<String>) -> CoreResult<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("query {id}")))?;
        entry.status = QueryStatus::Failed;
        entry.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn queries_of_shared(&self, shared: SharedQueryId) -> Vec<QueryId> {
        let mut ids: Vec<QueryId> = self
            .entries
            .values()
            .filter(|e| e.shared_query_id == shared)
            .map(|e| e.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dse_core::types::{DataType, Field};

    fn schema() -> Schema {
        Schema::new(vec![Field::new("value", DataType::Int64)])
    }

    #[test]
    fn logical_registration_is_unique() {
        let mut catalog = SourceCatalog::default();
        catalog.register_logical("default_logical", schema()).unwrap();
        assert!(catalog.register_logical("default_logical", schema()).is_err());
        assert!(catalog.schema_of("default_logical").is_some());
        catalog.unregister_logical("default_logical").unwrap();
        assert!(catalog.schema_of("default_logical").is_none());
    }

    #[test]
    fn physical_requires_logical_and_tracks_providers() {
        let mut catalog = SourceCatalog::default();
        let entry = PhysicalSourceEntry {
            logical_name: "default_logical".into(),
            physical_name: "default_physical".into(),
            source_type: "generator".into(),
            worker: TopologyNodeId::new(2),
        };
        assert!(catalog.register_physical(entry.clone()).is_err());
        catalog.register_logical("default_logical", schema()).unwrap();
        catalog.register_physical(entry.clone()).unwrap();
        assert!(catalog.register_physical(entry).is_err());
        assert_eq!(
            catalog.providers_of("default_logical"),
            vec![TopologyNodeId::new(2)]
        );
        catalog.unregister_worker(TopologyNodeId::new(2));
        assert!(catalog.providers_of("default_logical").is_empty());
    }

    #[test]
    fn query_status_lifecycle() {
        let mut catalog = QueryCatalog::default();
        catalog.insert(QueryEntry {
            id: QueryId::new(1),
            query_string: "Query::from(\"x\")".into(),
            placement: PlacementStrategy::BottomUp,
            fault_tolerance: FaultToleranceType::None,
            lineage: LineageType::None,
            status: QueryStatus::Registered,
            shared_query_id: SharedQueryId::new(1),
            failure_reason: None,
        });
        catalog.set_status(QueryId::new(1), QueryStatus::Running).unwrap();
        assert_eq!(catalog.status_of(QueryId::new(1)).unwrap(), QueryStatus::Running);
        catalog.set_failed(QueryId::new(1), "worker lost").unwrap();
        assert_eq!(catalog.status_of(QueryId::new(1)).unwrap(), QueryStatus::Failed);
        assert!(catalog.status_of(QueryId::new(9)).is_err());
    }
}
