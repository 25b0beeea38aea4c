//! Worker-side client for the coordinator RPC surface.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use dse_core::rpc::{
    NotifyEpochTerminationRequest, NotifyQueryFailureRequest, NotifySoftStopCompletedRequest,
    NotifySourceStopTriggeredRequest, PhysicalSourceDef, RegisterPhysicalSourcesRequest,
    RegisterWorkerReply, RegisterWorkerRequest, SendErrorsRequest, SendLocationUpdateRequest,
    StatusReply, UnregisterWorkerRequest,
};
use dse_core::{CoreError, CoreResult, OperatorId, QueryId, SubPlanId, TopologyNodeId};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            request_timeout: Duration::from_secs(3),
        }
    }
}

pub struct CoordinatorClient {
    base_url: String,
    client: reqwest::Client,
    config: ClientConfig,
}

impl CoordinatorClient {
    pub fn new(host: &str, port: u16, config: ClientConfig) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CoreError::RuntimeSystem(format!("http client: {e}")))?;
        Ok(Self {
            base_url: format!("http://{host}:{port}"),
            client,
            config,
        })
    }

    /// POST with bounded retry on transient failures.
    async fn post<B, R>(&self, method: &str, body: &B) -> CoreResult<R>
    where
        B: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let url = format!("{}/rpc/{method}", self.base_url);
        let mut backoff = self.config.initial_backoff;
        let mut last_error = CoreError::TransientRpc(format!("{url}: no attempt made"));
        for attempt in 1..=self.config.attempts {
            match self.client.post(&url).json(body).send().await {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<R>()
                        .await
                        .map_err(|e| CoreError::RuntimeSystem(format!("{url}: bad reply: {e}")));
                }
                Ok(response) => {
                    let status = response.status();
                    let message = response.text().await.unwrap_or_default();
                    if !matches!(status.as_u16(), 501 | 503) {
                        return Err(CoreError::RuntimeSystem(format!(
                            "{url}: {status}: {message}"
                        )));
                    }
                    last_error = CoreError::TransientRpc(format!("{url}: {status}"));
                }
                Err(e) => last_error = CoreError::TransientRpc(format!("{url}: {e}")),
            }
            if attempt < self.config.attempts {
                warn!(%url, attempt, error = %last_error, "coordinator rpc retry");
                let jitter =
                    rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                backoff = (backoff * 2).min(self.config.max_backoff);
            }
        }
        Err(last_error)
    }

    pub async fn register_worker(
        &self,
        request: RegisterWorkerRequest,
    ) -> CoreResult<TopologyNodeId> {
        let reply: RegisterWorkerReply = self.post("register-worker", &request).await?;
        Ok(reply.worker_id)
    }

    pub async fn unregister_worker(&self, worker_id: TopologyNodeId) -> CoreResult<()> {
        let _: StatusReply = self
            .post("unregister-worker", &UnregisterWorkerRequest { worker_id })
            .await?;
        Ok(())
    }

    pub async fn register_physical_sources(
        &self,
        worker_id: TopologyNodeId,
        sources: Vec<PhysicalSourceDef>,
    ) -> CoreResult<()> {
        let reply: StatusReply = self
            .post(
                "register-physical-sources",
                &RegisterPhysicalSourcesRequest { worker_id, sources },
            )
            .await?;
        if reply.success {
            Ok(())
        } else {
            Err(CoreError::Validation(reply.message.unwrap_or_default()))
        }
    }

    pub async fn notify_query_failure(
        &self,
        query_id: QueryId,
        subplan_id: SubPlanId,
        worker_id: TopologyNodeId,
        operator_id: OperatorId,
        error_msg: String,
    ) -> CoreResult<()> {
        let _: StatusReply = self
            .post(
                "notify-query-failure",
                &NotifyQueryFailureRequest {
                    query_id,
                    subplan_id,
                    worker_id,
                    operator_id,
                    error_msg,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn notify_source_stop_triggered(
        &self,
        query_id: QueryId,
        subplan_id: SubPlanId,
    ) -> CoreResult<()> {
        let _: StatusReply = self
            .post(
                "notify-source-stop-triggered",
                &NotifySourceStopTriggeredRequest {
                    query_id,
                    subplan_id,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn notify_soft_stop_completed(
        &self,
        query_id: QueryId,
        subplan_id: SubPlanId,
    ) -> CoreResult<()> {
        let _: StatusReply = self
            .post(
                "notify-soft-stop-completed",
                &NotifySoftStopCompletedRequest {
                    query_id,
                    subplan_id,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn notify_epoch_termination(
        &self,
        query_id: QueryId,
        timestamp: u64,
    ) -> CoreResult<()> {
        let _: StatusReply = self
            .post(
                "notify-epoch-termination",
                &NotifyEpochTerminationRequest {
                    timestamp,
                    query_id,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn send_errors(
        &self,
        worker_id: TopologyNodeId,
        error_msg: String,
    ) -> CoreResult<()> {
        let _: StatusReply = self
            .post(
                "send-errors",
                &SendErrorsRequest {
                    worker_id,
                    error_msg,
                },
            )
            .await?;
        Ok(())
    }

    pub async fn send_location_update(
        &self,
        request: SendLocationUpdateRequest,
    ) -> CoreResult<()> {
        let _: StatusReply = self.post("send-location-update", &request).await?;
        Ok(())
    }
}
