//! Coordinator HTTP surface: query submission plus the worker-facing RPC
//! routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::info;

use dse_core::rpc::{
    ErrorReply, GetNodesInRangeReply, GetNodesInRangeRequest, GetParentsReply,
    GetParentsRequest, NodeInRange, NotifyEpochTerminationRequest, NotifyQueryFailureRequest,
    NotifySoftStopCompletedRequest, NotifySourceStopTriggeredRequest, ParentLinkRequest,
    RegisterLogicalSourceRequest, RegisterPhysicalSourcesRequest, RegisterWorkerReply,
    RegisterWorkerRequest, ReplaceParentRequest, RequestSoftStopRequest,
    ScheduledReconnectRequest, SendErrorsRequest, SendLocationUpdateRequest, StatusReply,
    SubmitQueryReply, SubmitQueryRequest, UnregisterLogicalSourceRequest,
    UnregisterPhysicalSourceRequest, UnregisterWorkerRequest,
};
use dse_core::{CoreError, QueryId};

use crate::coordinator::Coordinator;

fn error_response(error: CoreError) -> Response {
    let status = match &error {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorReply {
            message: error.to_string(),
        }),
    )
        .into_response()
}

fn status_reply(result: dse_core::CoreResult<()>) -> Response {
    match result {
        Ok(()) => Json(StatusReply::ok()).into_response(),
        Err(e) => error_response(e),
    }
}

async fn execute_query(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<SubmitQueryRequest>,
) -> Response {
    match coordinator
        .submit_query(
            request.user_query.as_deref(),
            request.query_plan,
            request.placement.as_deref(),
            request.fault_tolerance.as_deref(),
            request.lineage.as_deref(),
        )
        .await
    {
        Ok(query_id) => (
            StatusCode::ACCEPTED,
            Json(SubmitQueryReply {
                query_id: query_id.raw(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn query_status(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<u64>,
) -> Response {
    match coordinator.query_status(QueryId::new(id)) {
        Ok(status) => Json(serde_json::json!({
            "queryId": id,
            "status": format!("{status:?}"),
            "failureReason": coordinator.query_failure_reason(QueryId::new(id)),
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn stop_query(
    State(coordinator): State<Arc<Coordinator>>,
    Path(id): Path<u64>,
) -> Response {
    status_reply(coordinator.stop_query(QueryId::new(id)).await)
}

async fn register_worker(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<RegisterWorkerRequest>,
) -> Response {
    let worker_id = coordinator.register_worker(request);
    Json(RegisterWorkerReply { worker_id }).into_response()
}

async fn unregister_worker(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<UnregisterWorkerRequest>,
) -> Response {
    status_reply(coordinator.unregister_worker(request.worker_id).await)
}

async fn register_logical_source(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<RegisterLogicalSourceRequest>,
) -> Response {
    status_reply(coordinator.register_logical_source(&request.name, &request.schema_text))
}

async fn unregister_logical_source(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<UnregisterLogicalSourceRequest>,
) -> Response {
    status_reply(coordinator.unregister_logical_source(&request.name))
}

async fn register_physical_sources(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<RegisterPhysicalSourcesRequest>,
) -> Response {
    let sources = request
        .sources
        .into_iter()
        .map(|s| (s.logical_name, s.physical_name, s.source_type))
        .collect();
    status_reply(coordinator.register_physical_sources(request.worker_id, sources))
}

async fn unregister_physical_source(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<UnregisterPhysicalSourceRequest>,
) -> Response {
    status_reply(coordinator.unregister_physical_source(
        request.worker_id,
        &request.logical_name,
        &request.physical_name,
    ))
}

async fn add_parent(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<ParentLinkRequest>,
) -> Response {
    status_reply(coordinator.add_parent(request.child_id, request.parent_id))
}

async fn remove_parent(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<ParentLinkRequest>,
) -> Response {
    status_reply(coordinator.remove_parent(request.child_id, request.parent_id))
}

async fn replace_parent(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<ReplaceParentRequest>,
) -> Response {
    status_reply(coordinator.replace_parent(
        request.child_id,
        request.old_parent,
        request.new_parent,
    ))
}

async fn get_parents(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<GetParentsRequest>,
) -> Response {
    match coordinator.parents_of(request.node_id) {
        Ok(parents) => Json(GetParentsReply { parents }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn notify_query_failure(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<NotifyQueryFailureRequest>,
) -> Response {
    status_reply(
        coordinator
            .notify_query_failure(request.query_id, &request.error_msg)
            .await,
    )
}

async fn request_soft_stop(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<RequestSoftStopRequest>,
) -> Response {
    status_reply(coordinator.stop_query(request.query_id).await)
}

async fn notify_source_stop_triggered(
    Json(request): Json<NotifySourceStopTriggeredRequest>,
) -> Response {
    info!(query = %request.query_id, subplan = %request.subplan_id, "source stop triggered");
    Json(StatusReply::ok()).into_response()
}

async fn notify_soft_stop_completed(
    Json(request): Json<NotifySoftStopCompletedRequest>,
) -> Response {
    info!(query = %request.query_id, subplan = %request.subplan_id, "soft stop completed");
    Json(StatusReply::ok()).into_response()
}

async fn notify_epoch_termination(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<NotifyEpochTerminationRequest>,
) -> Response {
    coordinator.notify_epoch_termination(request.query_id, request.timestamp);
    Json(StatusReply::ok()).into_response()
}

async fn send_errors(Json(request): Json<SendErrorsRequest>) -> Response {
    tracing::error!(worker = %request.worker_id, "worker error: {}", request.error_msg);
    Json(StatusReply::ok()).into_response()
}

async fn send_location_update(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<SendLocationUpdateRequest>,
) -> Response {
    status_reply(coordinator.update_location(request.worker_id, request.location))
}

async fn send_scheduled_reconnect(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<ScheduledReconnectRequest>,
) -> Response {
    status_reply(coordinator.schedule_reconnect(
        request.worker_id,
        request.new_parent,
        request.location,
        request.reconnect_at,
    ))
}

async fn get_nodes_in_range(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<GetNodesInRangeRequest>,
) -> Response {
    let nodes = coordinator
        .nodes_in_range(request.location, request.radius_km)
        .into_iter()
        .map(|(node_id, location)| NodeInRange { node_id, location })
        .collect();
    Json(GetNodesInRangeReply { nodes }).into_response()
}

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/execute-query", post(execute_query))
        .route("/query/:id/status", get(query_status))
        .route("/query/:id/stop", post(stop_query))
        .route("/rpc/register-worker", post(register_worker))
        .route("/rpc/unregister-worker", post(unregister_worker))
        .route("/rpc/register-logical-source", post(register_logical_source))
        .route(
            "/rpc/unregister-logical-source",
            post(unregister_logical_source),
        )
        .route(
            "/rpc/register-physical-sources",
            post(register_physical_sources),
        )
        .route(
            "/rpc/unregister-physical-source",
            post(unregister_physical_source),
        )
        .route("/rpc/add-parent", post(add_parent))
        .route("/rpc/remove-parent", post(remove_parent))
        .route("/rpc/replace-parent", post(replace_parent))
        .route("/rpc/get-parents", post(get_parents))
        .route("/rpc/notify-query-failure", post(notify_query_failure))
        .route("/rpc/request-soft-stop", post(request_soft_stop))
        .route(
            "/rpc/notify-source-stop-triggered",
            post(notify_source_stop_triggered),
        )
        .route(
            "/rpc/notify-soft-stop-completed",
            post(notify_soft_stop_completed),
        )
        .route(
            "/rpc/notify-epoch-termination",
            post(notify_epoch_termination),
        )
        .route("/rpc/send-errors", post(send_errors))
        .route("/rpc/send-location-update", post(send_location_update))
        .route(
            "/rpc/send-scheduled-reconnect",
            post(send_scheduled_reconnect),
        )
        .route("/rpc/get-nodes-in-range", post(get_nodes_in_range))
        .with_state(coordinator)
}

/// Bind and serve until the token cancels. Returns the bound address.
pub async fn serve(
    coordinator: Arc<Coordinator>,
    bind_addr: &str,
    cancel: CancellationToken,
) -> dse_core::CoreResult<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| CoreError::RuntimeSystem(format!("bind {bind_addr}: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| CoreError::RuntimeSystem(e.to_string()))?;
    let app = router(coordinator);
    let handle = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "coordinator rpc server failed");
        }
    });
    info!(%addr, "coordinator rpc server listening");
    Ok((addr, handle))
}
