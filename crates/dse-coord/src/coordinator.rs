//! Coordinator services: the control-plane brain.
//!
//! Owns the topology, the source and query catalogs and the global query
//! plan, and drives placement and deployment. Cross-catalog operations
//! take locks in the order topology, then shared plans, then the query
//! catalog; no lock is held across a worker RPC.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use dse_core::rpc::{GeoLocation, RegisterWorkerRequest};
use dse_core::types::Schema;
use dse_core::{
    CoreError, CoreResult, FaultToleranceType, IdGenerator, LineageType, PlacementStrategy,
    QueryId, QueryStatus, SharedQueryId, SharedQueryStatus, TerminationType, TopologyNodeId,
};
use dse_plan::{
    attach_source_schemas, infer_schemas, FilterPushDownPhase, ProjectionPushDownPhase,
    QueryPlan,
};

use crate::catalog::{PhysicalSourceEntry, QueryCatalog, QueryEntry, SourceCatalog};
use crate::deploy::{DeploymentPhase, WorkerControl, WorkerEndpoint};
use crate::global_plan::GlobalQueryPlan;
use crate::parser::parse_query;
use crate::placement::{GlobalExecutionPlan, PlacementPhase};
use crate::topology::Topology;

/// A mobile worker's announced future reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledReconnect {
    pub worker: TopologyNodeId,
    pub new_parent: TopologyNodeId,
    pub location: GeoLocation,
    pub reconnect_at: u64,
}

pub struct Coordinator {
    topology: Mutex<Topology>,
    global_plan: Mutex<GlobalQueryPlan>,
    query_catalog: Mutex<QueryCatalog>,
    source_catalog: Mutex<SourceCatalog>,
    executions: Mutex<HashMap<SharedQueryId, GlobalExecutionPlan>>,
    reconnects: Mutex<Vec<ScheduledReconnect>>,
    control: Arc<dyn WorkerControl>,
    query_ids: IdGenerator,
    subplan_ids: IdGenerator,
}

impl Coordinator {
    pub fn new(topology: Topology, control: Arc<dyn WorkerControl>) -> Self {
        Self {
            topology: Mutex::new(topology),
            global_plan: Mutex::new(GlobalQueryPlan::new()),
            query_catalog: Mutex::new(QueryCatalog::default()),
            source_catalog: Mutex::new(SourceCatalog::default()),
            executions: Mutex::new(HashMap::new()),
            reconnects: Mutex::new(Vec::new()),
            control,
            query_ids: IdGenerator::new(),
            subplan_ids: IdGenerator::new(),
        }
    }

    // ------------------------------------------------------------------
    // sources & workers
    // ------------------------------------------------------------------

    pub fn register_logical_source(&self, name: &str, schema_text: &str) -> CoreResult<()> {
        let schema = Schema::parse(schema_text)?;
        self.source_catalog.lock().register_logical(name, schema)
    }

    pub fn unregister_logical_source(&self, name: &str) -> CoreResult<()> {
        self.source_catalog.lock().unregister_logical(name)
    }

    pub fn register_worker(&self, request: RegisterWorkerRequest) -> TopologyNodeId {
        self.topology.lock().register_worker(
            request.worker_id,
            request.address,
            request.control_port,
            request.data_port,
            request.slots,
            request.capabilities,
            request.location,
        )
    }

    /// Remove a worker and fail every query with a subplan placed on it.
    pub async fn unregister_worker(&self, worker: TopologyNodeId) -> CoreResult<()> {
        let affected: Vec<SharedQueryId> = {
            let execs = self.executions.lock();
            execs
                .values()
                .filter(|e| e.nodes.contains_key(&worker))
                .map(|e| e.shared_query_id)
                .collect()
        };
        {
            let mut topology = self.topology.lock();
            topology.remove_node(worker)?;
            self.source_catalog.lock().unregister_worker(worker);
        }
        for shared in affected {
            self.fail_shared(shared, &format!("worker {worker} unregistered"))
                .await;
        }
        Ok(())
    }

    pub fn register_physical_sources(
        &self,
        worker: TopologyNodeId,
        sources: Vec<(String, String, String)>,
    ) -> CoreResult<()> {
        let mut catalog = self.source_catalog.lock();
        for (logical_name, physical_name, source_type) in sources {
            catalog.register_physical(PhysicalSourceEntry {
                logical_name,
                physical_name,
                source_type,
                worker,
            })?;
        }
        Ok(())
    }

    pub fn unregister_physical_source(
        &self,
        worker: TopologyNodeId,
        logical_name: &str,
        physical_name: &str,
    ) -> CoreResult<()> {
        self.source_catalog
            .lock()
            .unregister_physical(worker, logical_name, physical_name)
    }

    // ------------------------------------------------------------------
    // query lifecycle
    // ------------------------------------------------------------------

    /// Validate and accept a submission. Produces the documented messages
    /// for the 400 cases.
    pub async fn submit_query(
        &self,
        user_query: Option<&str>,
        query_plan: Option<serde_json::Value>,
        placement: Option<&str>,
        fault_tolerance: Option<&str>,
        lineage: Option<&str>,
    ) -> CoreResult<QueryId> {
        if user_query.map(str::trim).filter(|q| !q.is_empty()).is_none() && query_plan.is_none() {
            return Err(CoreError::Validation(
                "Incorrect or missing key word for user query".into(),
            ));
        }
        let placement_value = placement.unwrap_or_default();
        let strategy: PlacementStrategy = placement_value.parse().map_err(|_| {
            CoreError::Validation(format!("Invalid Placement Strategy: {placement_value}"))
        })?;
        let fault_tolerance = match fault_tolerance {
            None => FaultToleranceType::default(),
            Some(value) => serde_json::from_value(serde_json::Value::String(value.into()))
                .map_err(|_| {
                    CoreError::Validation(format!("Invalid Fault Tolerance Type: {value}"))
                })?,
        };
        let lineage = match lineage {
            None => LineageType::default(),
            Some(value) => serde_json::from_value(serde_json::Value::String(value.into()))
                .map_err(|_| CoreError::Validation(format!("Invalid Lineage Mode: {value}")))?,
        };

        let plan = match (user_query, query_plan) {
            (Some(text), _) if !text.trim().is_empty() => parse_query(text)?,
            (_, Some(serialized)) => serde_json::from_value::<QueryPlan>(serialized)
                .map_err(|e| CoreError::Validation(format!("invalid query plan: {e}")))?,
            _ => unreachable!("validated above"),
        };

        self.add_query(
            user_query.unwrap_or("<serialized plan>"),
            plan,
            strategy,
            fault_tolerance,
            lineage,
        )
        .await
    }

    /// Rewrite, merge and deploy an already parsed plan.
    pub async fn add_query(
        &self,
        query_text: &str,
        mut plan: QueryPlan,
        strategy: PlacementStrategy,
        fault_tolerance: FaultToleranceType,
        lineage: LineageType,
    ) -> CoreResult<QueryId> {
        let query_id: QueryId = self.query_ids.next();
        plan.query_id = query_id;

        {
            let catalog = self.source_catalog.lock();
            attach_source_schemas(&mut plan, |name| catalog.schema_of(name))?;
        }
        infer_schemas(&mut plan)?;
        FilterPushDownPhase::apply(&mut plan)?;
        ProjectionPushDownPhase::apply(&mut plan)?;

        let shared_id = {
            let mut global = self.global_plan.lock();
            let shared_id = global.add_query(query_id, plan, strategy);
            let mut catalog = self.query_catalog.lock();
            catalog.insert(QueryEntry {
                id: query_id,
                query_string: query_text.to_string(),
                placement: strategy,
                fault_tolerance,
                lineage,
                status: QueryStatus::Optimizing,
                shared_query_id: shared_id,
                failure_reason: None,
            });
            shared_id
        };

        if let Err(e) = self.redeploy_shared(shared_id).await {
            error!(query = %query_id, error = %e, "deployment failed");
            let _ = self.global_plan.lock().remove_query(query_id);
            self.query_catalog
                .lock()
                .set_failed(query_id, e.to_string())?;
            return Err(e);
        }

        info!(query = %query_id, shared = %shared_id, "query running");
        Ok(query_id)
    }

    /// Tear down the previous deployment of a shared plan (if any), place
    /// the current version and deploy it.
    async fn redeploy_shared(&self, shared_id: SharedQueryId) -> CoreResult<()> {
        // undeploy the stale version first; take it out before awaiting
        let previous = self.executions.lock().remove(&shared_id);
        if let Some(previous) = previous {
            let endpoints = {
                let topology = self.topology.lock();
                DeploymentPhase::endpoints(&previous, &topology)?
            };
            if let Err(e) = DeploymentPhase::undeploy(
                &previous,
                &endpoints,
                self.control.as_ref(),
                TerminationType::HardStop,
            )
            .await
            {
                warn!(shared = %shared_id, error = %e, "undeploy of stale plan failed");
            }
            self.release_slots(&previous);
        }

        let (execution, endpoints) = {
            let topology = self.topology.lock();
            let global = self.global_plan.lock();
            let shared = global
                .get(shared_id)
                .ok_or_else(|| CoreError::NotFound(format!("shared plan {shared_id}")))?;
            let sources = self.source_catalog.lock();
            let execution =
                PlacementPhase::place(shared, &topology, &sources, &self.subplan_ids)?;
            let endpoints = DeploymentPhase::endpoints(&execution, &topology)?;
            (execution, endpoints)
        };

        DeploymentPhase::deploy(&execution, &endpoints, self.control.as_ref()).await?;

        {
            let mut topology = self.topology.lock();
            for (&node, &count) in &execution.slots_by_node {
                for _ in 0..count {
                    let _ = topology.occupy_slot(node);
                }
            }
        }
        {
            let mut global = self.global_plan.lock();
            if let Some(shared) = global.get_mut(shared_id) {
                shared.status = SharedQueryStatus::Deployed;
                shared.drain_change_log();
            }
            let mut catalog = self.query_catalog.lock();
            for query in catalog.queries_of_shared(shared_id) {
                catalog.set_status(query, QueryStatus::Running)?;
            }
        }
        self.executions.lock().insert(shared_id, execution);
        Ok(())
    }

    /// Soft-stop a query. The shared plan keeps running while other
    /// queries still use it.
    pub async fn stop_query(&self, query_id: QueryId) -> CoreResult<()> {
        {
            let catalog = self.query_catalog.lock();
            let status = catalog.status_of(query_id)?;
            if status.is_terminal() {
                return Err(CoreError::Validation(format!(
                    "query {query_id} is already {status:?}"
                )));
            }
        }
        self.query_catalog
            .lock()
            .set_status(query_id, QueryStatus::MarkedForSoftStop)?;

        let (shared_id, now_empty) = self.global_plan.lock().remove_query(query_id)?;
        if now_empty {
            let execution = self.executions.lock().remove(&shared_id);
            if let Some(execution) = execution {
                let endpoints = {
                    let topology = self.topology.lock();
                    DeploymentPhase::endpoints(&execution, &topology)?
                };
                DeploymentPhase::undeploy(
                    &execution,
                    &endpoints,
                    self.control.as_ref(),
                    TerminationType::Graceful,
                )
                .await?;
                self.release_slots(&execution);
            }
            self.global_plan.lock().remove_shared(shared_id);
        } else {
            self.redeploy_shared(shared_id).await?;
        }
        self.query_catalog
            .lock()
            .set_status(query_id, QueryStatus::Stopped)?;
        info!(query = %query_id, "query stopped");
        Ok(())
    }

    /// Fail every query of a shared plan and drop it from the global plan.
    async fn fail_shared(&self, shared_id: SharedQueryId, reason: &str) {
        let queries = self.query_catalog.lock().queries_of_shared(shared_id);
        let execution = self.executions.lock().remove(&shared_id);
        if let Some(execution) = execution {
            let endpoints = {
                let topology = self.topology.lock();
                DeploymentPhase::endpoints(&execution, &topology)
            };
            if let Ok(endpoints) = endpoints {
                let _ = DeploymentPhase::undeploy(
                    &execution,
                    &endpoints,
                    self.control.as_ref(),
                    TerminationType::Failure,
                )
                .await;
            }
            self.release_slots(&execution);
        }
        self.global_plan.lock().remove_shared(shared_id);
        let mut catalog = self.query_catalog.lock();
        for query in queries {
            let _ = catalog.set_failed(query, reason);
        }
        warn!(shared = %shared_id, reason, "shared plan failed");
    }

    /// A worker reported a runtime failure for one subplan.
    pub async fn notify_query_failure(
        &self,
        query_id: QueryId,
        reason: &str,
    ) -> CoreResult<()> {
        let shared_id = self
            .query_catalog
            .lock()
            .get(query_id)
            .map(|e| e.shared_query_id)
            .ok_or_else(|| CoreError::NotFound(format!("query {query_id}")))?;
        self.fail_shared(shared_id, reason).await;
        Ok(())
    }

    pub fn query_status(&self, query_id: QueryId) -> CoreResult<QueryStatus> {
        self.query_catalog.lock().status_of(query_id)
    }

    pub fn query_failure_reason(&self, query_id: QueryId) -> Option<String> {
        self.query_catalog
            .lock()
            .get(query_id)
            .and_then(|e| e.failure_reason.clone())
    }

    fn release_slots(&self, execution: &GlobalExecutionPlan) {
        let mut topology = self.topology.lock();
        for (&node, &count) in &execution.slots_by_node {
            topology.release_slots(node, count);
        }
    }

    // ------------------------------------------------------------------
    // epochs & lineage
    // ------------------------------------------------------------------

    /// Push an epoch barrier to every worker running the query.
    pub async fn propagate_epoch(&self, query_id: QueryId, timestamp: u64) -> CoreResult<()> {
        let shared_id = self
            .query_catalog
            .lock()
            .get(query_id)
            .map(|e| e.shared_query_id)
            .ok_or_else(|| CoreError::NotFound(format!("query {query_id}")))?;
        let endpoints: Vec<WorkerEndpoint> = {
            let executions = self.executions.lock();
            let execution = executions
                .get(&shared_id)
                .ok_or_else(|| CoreError::NotFound(format!("execution of {shared_id}")))?;
            let topology = self.topology.lock();
            DeploymentPhase::endpoints(execution, &topology)?
                .into_values()
                .collect()
        };
        for endpoint in endpoints {
            self.control
                .inject_epoch_barrier(&endpoint, timestamp, query_id)
                .await?;
        }
        Ok(())
    }

    pub fn notify_epoch_termination(&self, query_id: QueryId, timestamp: u64) {
        info!(query = %query_id, timestamp, "epoch terminated, lineage trimmed");
    }

    // ------------------------------------------------------------------
    // topology edges & mobility
    // ------------------------------------------------------------------

    pub fn add_parent(&self, child: TopologyNodeId, parent: TopologyNodeId) -> CoreResult<()> {
        self.topology.lock().add_link(parent, child)
    }

    pub fn remove_parent(&self, child: TopologyNodeId, parent: TopologyNodeId) -> CoreResult<()> {
        self.topology.lock().remove_link(parent, child)
    }

    pub fn replace_parent(
        &self,
        child: TopologyNodeId,
        old_parent: TopologyNodeId,
        new_parent: TopologyNodeId,
    ) -> CoreResult<()> {
        self.topology.lock().replace_parent(child, old_parent, new_parent)
    }

    pub fn parents_of(&self, node: TopologyNodeId) -> CoreResult<Vec<TopologyNodeId>> {
        self.topology.lock().parents_of(node)
    }

    pub fn update_location(&self, worker: TopologyNodeId, location: GeoLocation) -> CoreResult<()> {
        self.topology.lock().set_location(worker, location)
    }

    /// Record an announced reconnect. Latitude and longitude each land in
    /// their own field.
    pub fn schedule_reconnect(
        &self,
        worker: TopologyNodeId,
        new_parent: TopologyNodeId,
        location: GeoLocation,
        reconnect_at: u64,
    ) -> CoreResult<()> {
        self.topology.lock().node(worker)?;
        self.reconnects.lock().push(ScheduledReconnect {
            worker,
            new_parent,
            location: GeoLocation::new(location.latitude, location.longitude),
            reconnect_at,
        });
        Ok(())
    }

    pub fn scheduled_reconnects(&self) -> Vec<ScheduledReconnect> {
        self.reconnects.lock().clone()
    }

    pub fn nodes_in_range(
        &self,
        center: GeoLocation,
        radius_km: f64,
    ) -> Vec<(TopologyNodeId, GeoLocation)> {
        self.topology.lock().nodes_in_range(&center, radius_km)
    }

    pub fn topology_len(&self) -> usize {
        self.topology.lock().len()
    }

    pub fn shared_plan_count(&self) -> usize {
        self.global_plan.lock().len()
    }

    pub fn shared_of_query(&self, query_id: QueryId) -> Option<SharedQueryId> {
        self.query_catalog
            .lock()
            .get(query_id)
            .map(|e| e.shared_query_id)
    }
}
