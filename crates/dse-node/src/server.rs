//! Worker control RPC surface, called by the coordinator's deployment
//! phase.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dse_core::rpc::{
    BeginBufferRequest, GetLocationReply, InjectEpochBarrierRequest, MonitoringDataReply,
    RegisterQueryRequest, StartQueryRequest, StatusReply, StopQueryRequest,
    UnregisterQueryRequest, UpdateNetworkSinkRequest,
};
use dse_core::CoreResult;

use crate::engine::NodeEngine;

fn status_reply(result: CoreResult<()>) -> Response {
    match result {
        Ok(()) => Json(StatusReply::ok()).into_response(),
        Err(e) => Json(StatusReply::error(e.to_string())).into_response(),
    }
}

async fn register_query(
    State(engine): State<Arc<NodeEngine>>,
    Json(request): Json<RegisterQueryRequest>,
) -> Response {
    status_reply(engine.register_query(request.plan).await)
}

async fn start_query(
    State(engine): State<Arc<NodeEngine>>,
    Json(request): Json<StartQueryRequest>,
) -> Response {
    status_reply(engine.start_query(request.subplan_id).await)
}

async fn stop_query(
    State(engine): State<Arc<NodeEngine>>,
    Json(request): Json<StopQueryRequest>,
) -> Response {
    status_reply(
        engine
            .stop_query(request.subplan_id, request.termination)
            .await,
    )
}

async fn unregister_query(
    State(engine): State<Arc<NodeEngine>>,
    Json(request): Json<UnregisterQueryRequest>,
) -> Response {
    status_reply(engine.unregister_query(request.subplan_id).await)
}

async fn inject_epoch_barrier(
    State(engine): State<Arc<NodeEngine>>,
    Json(request): Json<InjectEpochBarrierRequest>,
) -> Response {
    let subplans = engine.subplans_of_query(request.query_id);
    engine
        .inject_epoch_barrier(subplans, request.timestamp, request.query_id.raw())
        .await;
    Json(StatusReply::ok()).into_response()
}

async fn begin_buffer(Json(request): Json<BeginBufferRequest>) -> Response {
    info!(query = %request.query_id, subplan = %request.subplan_id, "buffering requested");
    Json(StatusReply::ok()).into_response()
}

async fn update_network_sink(Json(request): Json<UpdateNetworkSinkRequest>) -> Response {
    // live re-binding lands with the mobility work; record the intent
    warn!(
        subplan = %request.subplan_id,
        operator = %request.operator_id,
        target = %format!("{}:{}", request.new_address, request.new_data_port),
        "network sink update deferred until restart"
    );
    Json(StatusReply::ok()).into_response()
}

async fn get_location(State(engine): State<Arc<NodeEngine>>) -> Response {
    Json(GetLocationReply {
        location: engine.location(),
    })
    .into_response()
}

async fn get_monitoring_data(State(engine): State<Arc<NodeEngine>>) -> Response {
    Json(MonitoringDataReply {
        metrics: engine.monitoring_snapshot(),
    })
    .into_response()
}

pub fn router(engine: Arc<NodeEngine>) -> Router {
    Router::new()
        .route("/rpc/register-query", post(register_query))
        .route("/rpc/start-query", post(start_query))
        .route("/rpc/stop-query", post(stop_query))
        .route("/rpc/unregister-query", post(unregister_query))
        .route("/rpc/inject-epoch-barrier", post(inject_epoch_barrier))
        .route("/rpc/begin-buffer", post(begin_buffer))
        .route("/rpc/update-network-sink", post(update_network_sink))
        .route("/rpc/get-location", get(get_location))
        .route("/rpc/get-monitoring-data", get(get_monitoring_data))
        .with_state(engine)
}

/// Bind and serve the worker control surface until cancelled.
pub async fn serve(
    engine: Arc<NodeEngine>,
    bind_addr: &str,
    cancel: CancellationToken,
) -> CoreResult<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| dse_core::CoreError::RuntimeSystem(format!("bind {bind_addr}: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| dse_core::CoreError::RuntimeSystem(e.to_string()))?;
    let app = router(engine);
    let handle = tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "worker rpc server failed");
        }
    });
    info!(%addr, "worker rpc server listening");
    Ok((addr, handle))
}
