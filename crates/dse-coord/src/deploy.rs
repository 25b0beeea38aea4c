//! Two-phase deployment of a placed shared plan.
//!
//! Phase one registers every subplan on its worker (the worker compiles
//! pipelines and binds network edges); phase two starts the subplans,
//! root-side receivers first so partitions are announced before senders
//! connect. A failure during start rolls the already started subplans back
//! with a hard stop. Each RPC retries on transient errors only, with
//! exponential backoff and jitter.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{error, info, warn};

use dse_core::rpc::{
    BeginBufferRequest, InjectEpochBarrierRequest, RegisterQueryRequest, StartQueryRequest,
    StatusReply, StopQueryRequest, UnregisterQueryRequest,
};
use dse_core::{CoreError, CoreResult, QueryId, SubPlanId, TerminationType, TopologyNodeId};
use dse_plan::DecomposedPlan;

use crate::placement::GlobalExecutionPlan;
use crate::topology::Topology;

/// RPC coordinates of one worker.
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    pub id: TopologyNodeId,
    pub control_url: String,
}

/// The coordinator-side view of the worker control RPC surface.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    async fn register_query(
        &self,
        worker: &WorkerEndpoint,
        plan: &DecomposedPlan,
    ) -> CoreResult<()>;
    async fn start_query(&self, worker: &WorkerEndpoint, subplan: SubPlanId) -> CoreResult<()>;
    async fn stop_query(
        &self,
        worker: &WorkerEndpoint,
        subplan: SubPlanId,
        termination: TerminationType,
    ) -> CoreResult<()>;
    async fn unregister_query(&self, worker: &WorkerEndpoint, subplan: SubPlanId)
        -> CoreResult<()>;
    async fn inject_epoch_barrier(
        &self,
        worker: &WorkerEndpoint,
        timestamp: u64,
        query_id: QueryId,
    ) -> CoreResult<()>;
    async fn begin_buffer(
        &self,
        worker: &WorkerEndpoint,
        query_id: QueryId,
        subplan: SubPlanId,
    ) -> CoreResult<()>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            request_timeout: Duration::from_secs(3),
        }
    }
}

/// JSON-over-HTTP implementation of [`WorkerControl`] with bounded retry.
pub struct HttpWorkerControl {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl HttpWorkerControl {
    pub fn new(policy: RetryPolicy) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(policy.request_timeout)
            .build()
            .map_err(|e| CoreError::RuntimeSystem(format!("http client: {e}")))?;
        Ok(Self { client, policy })
    }

    /// POST with retry on transient failures. Connection errors, 503 and
    /// 501 retry; anything else aborts immediately.
    async fn post<B: serde::Serialize>(&self, url: &str, body: &B) -> CoreResult<StatusReply> {
        let mut backoff = self.policy.initial_backoff;
        let mut last_error = CoreError::TransientRpc(format!("{url}: no attempt made"));
        for attempt in 1..=self.policy.attempts {
            match self.client.post(url).json(body).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<StatusReply>().await.map_err(|e| {
                            CoreError::RuntimeSystem(format!("{url}: bad reply: {e}"))
                        });
                    }
                    let transient = matches!(status.as_u16(), 501 | 503);
                    let message = response.text().await.unwrap_or_default();
                    if !transient {
                        return Err(CoreError::Deployment(format!(
                            "{url}: {status}: {message}"
                        )));
                    }
                    last_error = CoreError::TransientRpc(format!("{url}: {status}: {message}"));
                }
                Err(e) => {
                    last_error = CoreError::TransientRpc(format!("{url}: {e}"));
                }
            }
            if attempt < self.policy.attempts {
                warn!(%url, attempt, error = %last_error, "rpc retry");
                let jitter = rand::thread_rng()
                    .gen_range(0..=backoff.as_millis() as u64 / 4);
                tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                backoff = (backoff * 2).min(self.policy.max_backoff);
            }
        }
        Err(last_error)
    }

    async fn call<B: serde::Serialize>(
        &self,
        worker: &WorkerEndpoint,
        method: &str,
        body: &B,
    ) -> CoreResult<()> {
        let url = format!("{}/rpc/{method}", worker.control_url);
        let reply = self.post(&url, body).await?;
        if reply.success {
            Ok(())
        } else {
            Err(CoreError::Deployment(format!(
                "{method} on worker {}: {}",
                worker.id,
                reply.message.unwrap_or_default()
            )))
        }
    }
}

#[async_trait]
impl WorkerControl for HttpWorkerControl {
    async fn register_query(
        &self,
        worker: &WorkerEndpoint,
        plan: &DecomposedPlan,
    ) -> CoreResult<()> {
        let body = RegisterQueryRequest {
            plan: plan.to_json()?,
        };
        self.call(worker, "register-query", &body).await
    }

    async fn start_query(&self, worker: &WorkerEndpoint, subplan: SubPlanId) -> CoreResult<()> {
        self.call(worker, "start-query", &StartQueryRequest { subplan_id: subplan })
            .await
    }

    async fn stop_query(
        &self,
        worker: &WorkerEndpoint,
        subplan: SubPlanId,
        termination: TerminationType,
    ) -> CoreResult<()> {
        self.call(
            worker,
            "stop-query",
            &StopQueryRequest {
                subplan_id: subplan,
                termination,
            },
        )
        .await
    }

    async fn unregister_query(
        &self,
        worker: &WorkerEndpoint,
        subplan: SubPlanId,
    ) -> CoreResult<()> {
        self.call(
            worker,
            "unregister-query",
            &UnregisterQueryRequest {
                subplan_id: subplan,
            },
        )
        .await
    }

    async fn inject_epoch_barrier(
        &self,
        worker: &WorkerEndpoint,
        timestamp: u64,
        query_id: QueryId,
    ) -> CoreResult<()> {
        self.call(
            worker,
            "inject-epoch-barrier",
            &InjectEpochBarrierRequest {
                timestamp,
                query_id,
            },
        )
        .await
    }

    async fn begin_buffer(
        &self,
        worker: &WorkerEndpoint,
        query_id: QueryId,
        subplan: SubPlanId,
    ) -> CoreResult<()> {
        self.call(
            worker,
            "begin-buffer",
            &BeginBufferRequest {
                query_id,
                subplan_id: subplan,
            },
        )
        .await
    }
}

pub struct DeploymentPhase;

impl DeploymentPhase {
    /// Register then start every subplan; roll back on a partial start.
    /// Endpoints are resolved by the caller while it holds the topology
    /// lock; deployment itself runs without it.
    pub async fn deploy(
        execution: &GlobalExecutionPlan,
        endpoints: &HashMap<TopologyNodeId, WorkerEndpoint>,
        control: &dyn WorkerControl,
    ) -> CoreResult<()> {
        for subplan in execution.subplans() {
            let endpoint = &endpoints[&subplan.worker_id];
            control.register_query(endpoint, subplan).await.map_err(|e| {
                CoreError::Deployment(format!(
                    "register of subplan {} on worker {} failed: {e}",
                    subplan.subplan_id, subplan.worker_id
                ))
            })?;
        }
        info!(shared = %execution.shared_query_id, "all subplans registered");

        // receivers (closer to the root) start before senders so every
        // partition is announced when its channel connects
        let mut ordered: Vec<&DecomposedPlan> = execution.subplans().collect();
        ordered.sort_by_key(|p| p.worker_id);

        let mut started: Vec<&DecomposedPlan> = Vec::new();
        for subplan in ordered {
            let endpoint = &endpoints[&subplan.worker_id];
            match control.start_query(endpoint, subplan.subplan_id).await {
                Ok(()) => started.push(subplan),
                Err(e) => {
                    error!(
                        subplan = %subplan.subplan_id,
                        worker = %subplan.worker_id,
                        error = %e,
                        "start failed, rolling back"
                    );
                    for rollback in started {
                        let endpoint = &endpoints[&rollback.worker_id];
                        if let Err(e) = control
                            .stop_query(
                                endpoint,
                                rollback.subplan_id,
                                TerminationType::HardStop,
                            )
                            .await
                        {
                            warn!(subplan = %rollback.subplan_id, error = %e, "rollback stop failed");
                        }
                        let _ = control
                            .unregister_query(endpoint, rollback.subplan_id)
                            .await;
                    }
                    return Err(CoreError::Deployment(format!(
                        "start of subplan {} failed: {e}",
                        subplan.subplan_id
                    )));
                }
            }
        }
        info!(shared = %execution.shared_query_id, "all subplans started");
        Ok(())
    }

    /// Stop and unregister every subplan of a deployed plan.
    pub async fn undeploy(
        execution: &GlobalExecutionPlan,
        endpoints: &HashMap<TopologyNodeId, WorkerEndpoint>,
        control: &dyn WorkerControl,
        termination: TerminationType,
    ) -> CoreResult<()> {
        let mut first_error: Option<CoreError> = None;
        // stop the sender side (leaf workers) first so receivers can drain;
        // the reverse of the start order
        let mut ordered: Vec<&DecomposedPlan> = execution.subplans().collect();
        ordered.sort_by_key(|p| std::cmp::Reverse(p.worker_id));
        for subplan in ordered {
            let endpoint = &endpoints[&subplan.worker_id];
            if let Err(e) = control
                .stop_query(endpoint, subplan.subplan_id, termination)
                .await
            {
                warn!(subplan = %subplan.subplan_id, error = %e, "stop failed");
                first_error.get_or_insert(e);
            }
            if let Err(e) = control.unregister_query(endpoint, subplan.subplan_id).await {
                warn!(subplan = %subplan.subplan_id, error = %e, "unregister failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolve worker RPC endpoints; call while holding the topology lock.
    pub fn endpoints(
        execution: &GlobalExecutionPlan,
        topology: &Topology,
    ) -> CoreResult<HashMap<TopologyNodeId, WorkerEndpoint>> {
        execution
            .worker_ids()
            .into_iter()
            .map(|id| {
                let node = topology.node(id)?;
                Ok((
                    id,
                    WorkerEndpoint {
                        id,
                        control_url: node.control_url(),
                    },
                ))
            })
            .collect()
    }
}

pub mod testing {
    //! A recording in-memory worker control for coordinator tests.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Register(TopologyNodeId, SubPlanId),
        Start(TopologyNodeId, SubPlanId),
        Stop(TopologyNodeId, SubPlanId, TerminationType),
        Unregister(TopologyNodeId, SubPlanId),
        Epoch(TopologyNodeId, u64, QueryId),
    }

    #[derive(Default)]
    pub struct MockWorkerControl {
        pub calls: Mutex<Vec<Call>>,
        /// Workers whose start calls should fail.
        pub fail_start_on: Mutex<Vec<TopologyNodeId>>,
    }

    impl MockWorkerControl {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl WorkerControl for MockWorkerControl {
        async fn register_query(
            &self,
            worker: &WorkerEndpoint,
            plan: &DecomposedPlan,
        ) -> CoreResult<()> {
            self.calls
                .lock()
                .push(Call::Register(worker.id, plan.subplan_id));
            Ok(())
        }

        async fn start_query(
            &self,
            worker: &WorkerEndpoint,
            subplan: SubPlanId,
        ) -> CoreResult<()> {
            if self.fail_start_on.lock().contains(&worker.id) {
                return Err(CoreError::Deployment(format!(
                    "injected start failure on worker {}",
                    worker.id
                )));
            }
            self.calls.lock().push(Call::Start(worker.id, subplan));
            Ok(())
        }

        async fn stop_query(
            &self,
            worker: &WorkerEndpoint,
            subplan: SubPlanId,
            termination: TerminationType,
        ) -> CoreResult<()> {
            self.calls
                .lock()
                .push(Call::Stop(worker.id, subplan, termination));
            Ok(())
        }

        async fn unregister_query(
            &self,
            worker: &WorkerEndpoint,
            subplan: SubPlanId,
        ) -> CoreResult<()> {
            self.calls.lock().push(Call::Unregister(worker.id, subplan));
            Ok(())
        }

        async fn inject_epoch_barrier(
            &self,
            worker: &WorkerEndpoint,
            timestamp: u64,
            query_id: QueryId,
        ) -> CoreResult<()> {
            self.calls
                .lock()
                .push(Call::Epoch(worker.id, timestamp, query_id));
            Ok(())
        }

        async fn begin_buffer(
            &self,
            _worker: &WorkerEndpoint,
            _query_id: QueryId,
            _subplan: SubPlanId,
        ) -> CoreResult<()> {
            Ok(())
        }
    }
}
