//! The worker node engine.
//!
//! Owns the buffer pool, the exchange transport and the query manager, and
//! implements the coordinator-facing lifecycle: register a decomposed plan
//! (attach local physical sources, compile, bind network edges), start it,
//! stop it with a termination type, tear it down. A registered plan is
//! watched in the background; if it fails at runtime the coordinator is
//! notified with `NotifyQueryFailure`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dse_core::config::WorkerConfig;
use dse_core::{
    BufferManager, CoreError, CoreResult, ExecutionStatus, OperatorId, SubPlanId,
    TerminationType, TopologyNodeId,
};
use dse_net::{ChannelConfig, NetworkTransport, PartitionRegistry};
use dse_plan::{DecomposedPlan, OperatorKind};
use dse_runtime::{compile, CompileContext, QueryManager};

use crate::client::CoordinatorClient;

/// Default deadline a graceful stop may drain before hard promotion.
const SOFT_STOP_DEADLINE: Duration = Duration::from_secs(600);

pub struct NodeEngine {
    pub worker_id: TopologyNodeId,
    config: WorkerConfig,
    manager: QueryManager,
    registry: PartitionRegistry,
    transport: Mutex<Option<NetworkTransport>>,
    cancel: CancellationToken,
    client: Arc<CoordinatorClient>,
    /// Query ids per registered subplan, for failure reporting.
    registered: Mutex<HashMap<SubPlanId, Vec<dse_core::QueryId>>>,
}

impl NodeEngine {
    /// Bring up transport and manager. The worker id must already be
    /// assigned (see [`crate::bootstrap`]).
    pub async fn start(
        worker_id: TopologyNodeId,
        config: WorkerConfig,
        client: Arc<CoordinatorClient>,
        cancel: CancellationToken,
    ) -> CoreResult<Arc<NodeEngine>> {
        let buffers = BufferManager::new(config.buffer_size, config.buffers_in_pool);
        let registry = PartitionRegistry::new();
        let transport = NetworkTransport::start(
            &format!("{}:{}", config.local_host, config.data_port),
            config.network_handler_threads,
            buffers.clone(),
            registry.clone(),
            cancel.child_token(),
        )
        .await
        .map_err(|e| CoreError::RuntimeSystem(format!("exchange transport: {e}")))?;

        let manager = QueryManager::new(
            config.queue_mode.clone(),
            config.worker_threads,
            buffers,
        );
        info!(%worker_id, data_port = config.data_port, "node engine started");
        Ok(Arc::new(NodeEngine {
            worker_id,
            config,
            manager,
            registry,
            transport: Mutex::new(Some(transport)),
            cancel,
            client,
            registered: Mutex::new(HashMap::new()),
        }))
    }

    pub fn manager(&self) -> &QueryManager {
        &self.manager
    }

    /// Attach this worker's physical source implementations to the plan's
    /// logical sources.
    fn attach_physical_sources(&self, plan: &mut DecomposedPlan) -> CoreResult<()> {
        for id in plan.plan.ids().collect::<Vec<_>>() {
            if let OperatorKind::Source(desc) = &mut plan.plan.node_mut(id).kind {
                if desc.physical.is_some() {
                    continue;
                }
                let configured = self
                    .config
                    .physical_sources
                    .iter()
                    .find(|p| p.logical_source_name == desc.logical_name)
                    .ok_or_else(|| {
                        CoreError::Deployment(format!(
                            "no physical source configured for {}",
                            desc.logical_name
                        ))
                    })?;
                desc.physical = Some(configured.source.clone());
            }
        }
        Ok(())
    }

    /// Register phase: compile pipelines, create handlers, bind network
    /// edges.
    pub async fn register_query(self: &Arc<Self>, plan_json: serde_json::Value) -> CoreResult<()> {
        let mut decomposed = DecomposedPlan::from_json(plan_json)?;
        self.attach_physical_sources(&mut decomposed)?;

        let lineage_enabled = false;
        let context = CompileContext {
            registry: self.registry.clone(),
            channel_config: ChannelConfig::default(),
            cancel: self.cancel.child_token(),
            lineage_enabled,
        };
        let executable = compile(&decomposed, &context)?;
        let subplan_id = executable.subplan_id;
        self.manager.register(Arc::clone(&executable))?;
        self.registered
            .lock()
            .insert(subplan_id, decomposed.query_ids.clone());

        // report runtime failures upstream
        let engine = Arc::clone(self);
        let mut status_rx = executable.subscribe();
        tokio::spawn(async move {
            loop {
                let status = *status_rx.borrow_and_update();
                if status == ExecutionStatus::Failed {
                    engine.report_failure(subplan_id).await;
                    return;
                }
                if status.is_terminal() || status_rx.changed().await.is_err() {
                    return;
                }
            }
        });
        info!(subplan = %subplan_id, "subplan registered");
        Ok(())
    }

    async fn report_failure(&self, subplan: SubPlanId) {
        let query_ids = self
            .registered
            .lock()
            .get(&subplan)
            .cloned()
            .unwrap_or_default();
        for query_id in query_ids {
            if let Err(e) = self
                .client
                .notify_query_failure(
                    query_id,
                    subplan,
                    self.worker_id,
                    OperatorId::INVALID,
                    "subplan failed at runtime".to_string(),
                )
                .await
            {
                warn!(subplan = %subplan, error = %e, "failure notification failed");
            }
        }
    }

    pub async fn start_query(&self, subplan: SubPlanId) -> CoreResult<()> {
        self.manager.start(subplan).await
    }

    pub async fn stop_query(
        &self,
        subplan: SubPlanId,
        termination: TerminationType,
    ) -> CoreResult<()> {
        match self
            .manager
            .stop(subplan, termination, SOFT_STOP_DEADLINE)
            .await
        {
            // a drained plan has already unregistered itself
            Err(CoreError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn unregister_query(&self, subplan: SubPlanId) -> CoreResult<()> {
        self.manager.unregister(subplan).await?;
        self.registered.lock().remove(&subplan);
        Ok(())
    }

    pub async fn inject_epoch_barrier(
        &self,
        subplans: Vec<SubPlanId>,
        timestamp: u64,
        query_id: u64,
    ) {
        let mut propagated = false;
        for subplan in subplans {
            match self
                .manager
                .propagate_epoch(subplan, timestamp, query_id)
                .await
            {
                Ok(()) => propagated = true,
                Err(e) => warn!(subplan = %subplan, error = %e, "epoch propagation failed"),
            }
        }
        if propagated {
            // acknowledge the trim so coordinator-side lineage can advance
            if let Err(e) = self
                .client
                .notify_epoch_termination(dse_core::QueryId::new(query_id), timestamp)
                .await
            {
                warn!(query_id, error = %e, "epoch acknowledgment failed");
            }
        }
    }

    /// Subplans registered for a given query id.
    pub fn subplans_of_query(&self, query_id: dse_core::QueryId) -> Vec<SubPlanId> {
        self.registered
            .lock()
            .iter()
            .filter(|(_, queries)| queries.contains(&query_id))
            .map(|(subplan, _)| *subplan)
            .collect()
    }

    pub fn monitoring_snapshot(&self) -> serde_json::Value {
        let mut snapshot = self.manager.monitoring_snapshot();
        if let Some(object) = snapshot.as_object_mut() {
            object.insert(
                "workerId".to_string(),
                serde_json::json!(self.worker_id.raw()),
            );
            object.insert(
                "registeredPartitions".to_string(),
                serde_json::json!(self.registry.len()),
            );
        }
        snapshot
    }

    pub fn location(&self) -> Option<dse_core::rpc::GeoLocation> {
        self.config.location
    }

    /// Graceful node shutdown: stop plans, drain the transport, join the
    /// workers.
    pub async fn shutdown(&self) {
        for subplan in self.manager.registered_subplans() {
            if let Err(e) = self
                .manager
                .stop(subplan, TerminationType::HardStop, Duration::from_secs(5))
                .await
            {
                error!(subplan = %subplan, error = %e, "stop during shutdown failed");
            }
        }
        self.cancel.cancel();
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.shutdown();
            transport.wait_terminated().await;
        }
        self.manager.shutdown().await;
        info!(worker = %self.worker_id, "node engine stopped");
    }
}
