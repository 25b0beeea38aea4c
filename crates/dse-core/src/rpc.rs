//! Request and reply bodies of the coordinator/worker RPC surface.
//!
//! Both control services speak JSON over HTTP. The plan payload inside
//! [`RegisterQueryRequest`] stays an opaque JSON value here so this crate
//! does not depend on the plan representation; the worker deserializes it
//! into its decomposed plan type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{OperatorId, QueryId, SubPlanId, TopologyNodeId};
use crate::query::TerminationType;

/// WGS84 position of a (mobile) worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in kilometers.
    pub fn distance_km(&self, other: &GeoLocation) -> f64 {
        const EARTH_RADIUS_KM: f64 = 6371.0;
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlng = (other.longitude - self.longitude).to_radians();
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Uniform success/failure reply for calls without a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// worker -> coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    /// Previously assigned id, if the worker restarts with one persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<TopologyNodeId>,
    pub address: String,
    pub control_port: u16,
    pub data_port: u16,
    pub slots: u16,
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerReply {
    pub worker_id: TopologyNodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterWorkerRequest {
    pub worker_id: TopologyNodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterLogicalSourceRequest {
    pub name: String,
    /// `name:type,name:type` field list.
    pub schema_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterLogicalSourceRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalSourceDef {
    pub logical_name: String,
    pub physical_name: String,
    pub source_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPhysicalSourcesRequest {
    pub worker_id: TopologyNodeId,
    pub sources: Vec<PhysicalSourceDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterPhysicalSourceRequest {
    pub worker_id: TopologyNodeId,
    pub logical_name: String,
    pub physical_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentLinkRequest {
    pub child_id: TopologyNodeId,
    pub parent_id: TopologyNodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceParentRequest {
    pub child_id: TopologyNodeId,
    pub old_parent: TopologyNodeId,
    pub new_parent: TopologyNodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetParentsRequest {
    pub node_id: TopologyNodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetParentsReply {
    pub parents: Vec<TopologyNodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyQueryFailureRequest {
    pub query_id: QueryId,
    pub subplan_id: SubPlanId,
    pub worker_id: TopologyNodeId,
    pub operator_id: OperatorId,
    pub error_msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSoftStopRequest {
    pub query_id: QueryId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySourceStopTriggeredRequest {
    pub query_id: QueryId,
    pub subplan_id: SubPlanId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySoftStopCompletedRequest {
    pub query_id: QueryId,
    pub subplan_id: SubPlanId,
}

/// Workers acknowledge that all buffers up to `timestamp` are processed,
/// letting lineage storage trim up to that epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyEpochTerminationRequest {
    pub timestamp: u64,
    pub query_id: QueryId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendErrorsRequest {
    pub worker_id: TopologyNodeId,
    pub error_msg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendLocationUpdateRequest {
    pub worker_id: TopologyNodeId,
    pub location: GeoLocation,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledReconnectRequest {
    pub worker_id: TopologyNodeId,
    pub new_parent: TopologyNodeId,
    pub location: GeoLocation,
    pub reconnect_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNodesInRangeRequest {
    pub location: GeoLocation,
    pub radius_km: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInRange {
    pub node_id: TopologyNodeId,
    pub location: GeoLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNodesInRangeReply {
    pub nodes: Vec<NodeInRange>,
}

// ---------------------------------------------------------------------------
// coordinator -> worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterQueryRequest {
    /// Serialized decomposed plan; opaque at this layer.
    pub plan: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterQueryRequest {
    pub subplan_id: SubPlanId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartQueryRequest {
    pub subplan_id: SubPlanId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopQueryRequest {
    pub subplan_id: SubPlanId,
    pub termination: TerminationType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectEpochBarrierRequest {
    pub timestamp: u64,
    pub query_id: QueryId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginBufferRequest {
    pub query_id: QueryId,
    pub subplan_id: SubPlanId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNetworkSinkRequest {
    pub subplan_id: SubPlanId,
    pub operator_id: OperatorId,
    pub new_address: String,
    pub new_data_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLocationReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringDataReply {
    pub metrics: serde_json::Value,
}

// ---------------------------------------------------------------------------
// query submission
// ---------------------------------------------------------------------------

/// Body of `POST /execute-query`.
///
/// Everything is optional at the serde layer; the coordinator validates and
/// produces the documented 400 messages itself rather than letting a parse
/// error shadow them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitQueryRequest {
    #[serde(rename = "userQuery", default, skip_serializing_if = "Option::is_none")]
    pub user_query: Option<String>,
    #[serde(rename = "queryPlan", default, skip_serializing_if = "Option::is_none")]
    pub query_plan: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
    #[serde(
        rename = "faultTolerance",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub fault_tolerance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitQueryReply {
    #[serde(rename = "queryId")]
    pub query_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_request_uses_wire_field_names() {
        let req: SubmitQueryRequest = serde_json::from_str(
            r#"{"userQuery":"Query::from(\"x\")","placement":"BottomUp","faultTolerance":"NONE"}"#,
        )
        .unwrap();
        assert_eq!(req.user_query.as_deref(), Some("Query::from(\"x\")"));
        assert_eq!(req.placement.as_deref(), Some("BottomUp"));

        let reply = serde_json::to_string(&SubmitQueryReply { query_id: 3 }).unwrap();
        assert_eq!(reply, r#"{"queryId":3}"#);
    }

    #[test]
    fn haversine_is_symmetric_and_zero_on_self() {
        let berlin = GeoLocation::new(52.52, 13.405);
        let potsdam = GeoLocation::new(52.39, 13.064);
        assert!(berlin.distance_km(&berlin) < 1e-9);
        let d1 = berlin.distance_km(&potsdam);
        let d2 = potsdam.distance_km(&berlin);
        assert!((d1 - d2).abs() < 1e-9);
        assert!(d1 > 20.0 && d1 < 40.0);
    }
}
