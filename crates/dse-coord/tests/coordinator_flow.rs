//! Coordinator lifecycle flows against a recording in-memory worker
//! control: sharing, deployment, rollback, validation and mobility.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use dse_core::rpc::{GeoLocation, RegisterWorkerRequest, SubmitQueryRequest};
use dse_core::{CoreError, QueryId, QueryStatus, TerminationType, TopologyNodeId};
use dse_coord::deploy::testing::{Call, MockWorkerControl};
use dse_coord::{Coordinator, Topology};

fn worker_request(port: u16) -> RegisterWorkerRequest {
    RegisterWorkerRequest {
        worker_id: None,
        address: "127.0.0.1".into(),
        control_port: port,
        data_port: port + 500,
        slots: 8,
        capabilities: BTreeMap::new(),
        location: None,
    }
}

fn coordinator_with_mock() -> (Arc<Coordinator>, Arc<MockWorkerControl>) {
    let topology = Topology::new("127.0.0.1".into(), 8081, 8082, 64);
    let control = Arc::new(MockWorkerControl::default());
    let coordinator = Arc::new(Coordinator::new(topology, control.clone()));
    (coordinator, control)
}

async fn setup_default_source(coordinator: &Coordinator) -> TopologyNodeId {
    let worker = coordinator.register_worker(worker_request(9000));
    coordinator
        .register_logical_source("default_logical", "id:i32, value:i64")
        .unwrap();
    coordinator
        .register_physical_sources(
            worker,
            vec![(
                "default_logical".into(),
                "default_physical".into(),
                "generator".into(),
            )],
        )
        .unwrap();
    worker
}

const QUERY: &str = r#"Query::from("default_logical").filter(value < 42).sink(print)"#;

#[tokio::test]
async fn workers_receive_ids_two_and_three() {
    let (coordinator, _) = coordinator_with_mock();
    let w1 = coordinator.register_worker(worker_request(9000));
    let w2 = coordinator.register_worker(worker_request(9001));
    assert_eq!(w1.raw(), 2);
    assert_eq!(w2.raw(), 3);
    assert_eq!(coordinator.topology_len(), 3);
}

#[tokio::test]
async fn submitted_query_reaches_running() {
    let (coordinator, control) = coordinator_with_mock();
    setup_default_source(&coordinator).await;

    let query_id = coordinator
        .submit_query(Some(QUERY), None, Some("BottomUp"), None, None)
        .await
        .unwrap();
    assert_eq!(
        coordinator.query_status(query_id).unwrap(),
        QueryStatus::Running
    );

    let calls = control.calls();
    let registers = calls
        .iter()
        .filter(|c| matches!(c, Call::Register(..)))
        .count();
    let starts = calls.iter().filter(|c| matches!(c, Call::Start(..))).count();
    // one subplan on the worker, one at the root
    assert_eq!(registers, 2);
    assert_eq!(starts, 2);
    // every register precedes every start
    let last_register = calls
        .iter()
        .rposition(|c| matches!(c, Call::Register(..)))
        .unwrap();
    let first_start = calls
        .iter()
        .position(|c| matches!(c, Call::Start(..)))
        .unwrap();
    assert!(last_register < first_start);
}

#[tokio::test]
async fn identical_queries_share_one_plan_and_cancel_keeps_it_running() {
    let (coordinator, _control) = coordinator_with_mock();
    setup_default_source(&coordinator).await;

    let q1 = coordinator
        .submit_query(Some(QUERY), None, Some("BottomUp"), None, None)
        .await
        .unwrap();
    let q2 = coordinator
        .submit_query(Some(QUERY), None, Some("BottomUp"), None, None)
        .await
        .unwrap();
    assert_ne!(q1, q2);
    // one shared plan hosts both query entries
    assert_eq!(coordinator.shared_plan_count(), 1);
    assert_eq!(coordinator.shared_of_query(q1), coordinator.shared_of_query(q2));
    assert_eq!(coordinator.query_status(q1).unwrap(), QueryStatus::Running);
    assert_eq!(coordinator.query_status(q2).unwrap(), QueryStatus::Running);

    // canceling one leaves the shared plan (and the other query) running
    coordinator.stop_query(q1).await.unwrap();
    assert_eq!(coordinator.query_status(q1).unwrap(), QueryStatus::Stopped);
    assert_eq!(coordinator.query_status(q2).unwrap(), QueryStatus::Running);
    assert_eq!(coordinator.shared_plan_count(), 1);

    coordinator.stop_query(q2).await.unwrap();
    assert_eq!(coordinator.query_status(q2).unwrap(), QueryStatus::Stopped);
    assert_eq!(coordinator.shared_plan_count(), 0);
}

#[tokio::test]
async fn partial_start_rolls_back_with_hard_stop() {
    let (coordinator, control) = coordinator_with_mock();
    setup_default_source(&coordinator).await;

    // the worker starts after the root node, so the root's subplan is
    // already running when the failure hits
    control
        .fail_start_on
        .lock()
        .push(TopologyNodeId::new(2));
    let err = coordinator
        .submit_query(Some(QUERY), None, Some("BottomUp"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Deployment(_)));

    let calls = control.calls();
    let rolled_back = calls
        .iter()
        .any(|c| matches!(c, Call::Stop(_, _, TerminationType::HardStop)));
    assert!(rolled_back, "calls: {calls:?}");
    // the query surfaces as failed with a reason
    assert_eq!(
        coordinator.query_status(QueryId::new(1)).unwrap(),
        QueryStatus::Failed
    );
    assert!(coordinator
        .query_failure_reason(QueryId::new(1))
        .is_some());
}

#[tokio::test]
async fn submission_validation_messages() {
    let (coordinator, _) = coordinator_with_mock();
    setup_default_source(&coordinator).await;

    let err = coordinator
        .submit_query(None, None, Some("BottomUp"), None, None)
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .contains("Incorrect or missing key word for user query"));

    let err = coordinator
        .submit_query(Some(QUERY), None, Some("SideWays"), None, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Invalid Placement Strategy: SideWays"));

    let err = coordinator
        .submit_query(Some(QUERY), None, Some("BottomUp"), Some("TWICE"), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Invalid Fault Tolerance Type: TWICE"));

    // unknown query id surfaces as not found
    assert!(matches!(
        coordinator.query_status(QueryId::new(99)),
        Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn losing_a_worker_fails_its_queries() {
    let (coordinator, _control) = coordinator_with_mock();
    let worker = setup_default_source(&coordinator).await;

    let query_id = coordinator
        .submit_query(Some(QUERY), None, Some("BottomUp"), None, None)
        .await
        .unwrap();
    coordinator.unregister_worker(worker).await.unwrap();

    assert_eq!(
        coordinator.query_status(query_id).unwrap(),
        QueryStatus::Failed
    );
    assert!(coordinator
        .query_failure_reason(query_id)
        .unwrap()
        .contains("unregistered"));
    assert_eq!(coordinator.shared_plan_count(), 0);
}

#[tokio::test]
async fn epoch_barriers_reach_every_involved_worker() {
    let (coordinator, control) = coordinator_with_mock();
    setup_default_source(&coordinator).await;
    let query_id = coordinator
        .submit_query(Some(QUERY), None, Some("BottomUp"), None, None)
        .await
        .unwrap();

    coordinator.propagate_epoch(query_id, 777).await.unwrap();
    let epochs = control
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Epoch(_, 777, q) if *q == query_id))
        .count();
    assert_eq!(epochs, 2);
}

#[tokio::test]
async fn scheduled_reconnect_keeps_latitude_and_longitude_apart() {
    let (coordinator, _) = coordinator_with_mock();
    let worker = coordinator.register_worker(worker_request(9000));

    let location = GeoLocation::new(52.52, 13.405);
    coordinator
        .schedule_reconnect(worker, TopologyNodeId::new(1), location, 12345)
        .unwrap();
    let stored = &coordinator.scheduled_reconnects()[0];
    assert_eq!(stored.location.latitude, 52.52);
    assert_eq!(stored.location.longitude, 13.405);
    assert_ne!(stored.location.longitude, stored.location.latitude);
}

#[tokio::test]
async fn rest_surface_speaks_the_documented_contract() {
    let (coordinator, _control) = coordinator_with_mock();
    setup_default_source(&coordinator).await;

    let cancel = CancellationToken::new();
    let (addr, handle) = dse_coord::serve(coordinator, "127.0.0.1:0", cancel.clone())
        .await
        .unwrap();
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    // missing user query -> 400 with the documented message
    let resp = client
        .post(format!("{base}/execute-query"))
        .json(&serde_json::json!({"placement": "BottomUp"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Incorrect or missing key word for user query"));

    // unknown placement -> 400
    let resp = client
        .post(format!("{base}/execute-query"))
        .json(&serde_json::json!({"userQuery": QUERY, "placement": "Elsewhere"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Invalid Placement Strategy:"));

    // valid request -> 202 with an integer query id
    let request = SubmitQueryRequest {
        user_query: Some(QUERY.into()),
        query_plan: None,
        placement: Some("BottomUp".into()),
        fault_tolerance: None,
        lineage: None,
    };
    let resp = client
        .post(format!("{base}/execute-query"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["queryId"].as_u64().unwrap() >= 1);

    // unknown id -> 404
    let resp = client
        .get(format!("{base}/query/999/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    cancel.cancel();
    let _ = handle.await;
}
