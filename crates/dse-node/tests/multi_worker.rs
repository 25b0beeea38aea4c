//! Full in-process cluster: a coordinator with its embedded node, two
//! workers registering over HTTP, a query deployed across the network
//! exchange, stopped again, and the workers still connected afterwards.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use dse_core::config::WorkerConfig;
use dse_coord::{Coordinator, HttpWorkerControl, RetryPolicy, Topology};
use dse_node::{ClientConfig, CoordinatorClient, NodeEngine};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn worker_config_yaml(
    dir: &tempfile::TempDir,
    name: &str,
    coordinator_port: u16,
    rpc_port: u16,
    data_port: u16,
    with_source: bool,
) -> std::path::PathBuf {
    let path = dir.path().join(format!("{name}.yaml"));
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "coordinatorHost: 127.0.0.1").unwrap();
    writeln!(f, "coordinatorPort: {coordinator_port}").unwrap();
    writeln!(f, "localHost: 127.0.0.1").unwrap();
    writeln!(f, "rpcPort: {rpc_port}").unwrap();
    writeln!(f, "dataPort: {data_port}").unwrap();
    writeln!(f, "workerThreads: 2").unwrap();
    if with_source {
        writeln!(f, "physicalSources:").unwrap();
        writeln!(f, "  - logicalSourceName: default_logical").unwrap();
        writeln!(f, "    physicalSourceName: default_physical").unwrap();
        writeln!(f, "    type: generator").unwrap();
        writeln!(f, "    tuples: 10").unwrap();
    }
    path
}

struct TestWorker {
    engine: Arc<NodeEngine>,
    id: dse_core::TopologyNodeId,
    server: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

async fn spawn_worker(
    dir: &tempfile::TempDir,
    name: &str,
    coordinator_port: u16,
    with_source: bool,
) -> TestWorker {
    let rpc_port = free_port();
    let data_port = free_port();
    let path = worker_config_yaml(dir, name, coordinator_port, rpc_port, data_port, with_source);
    let config = dse_node::load_config(&path).unwrap();
    assert!(config.worker_id.is_none());

    let client = Arc::new(
        CoordinatorClient::new("127.0.0.1", coordinator_port, ClientConfig::default()).unwrap(),
    );
    let (id, config) = dse_node::register(&client, &path, config).await.unwrap();
    // the assigned id is persisted into the yaml
    let reloaded = dse_node::load_config(&path).unwrap();
    assert_eq!(reloaded.worker_id, Some(id.raw()));

    let cancel = CancellationToken::new();
    let engine = NodeEngine::start(id, config, client, cancel.clone())
        .await
        .unwrap();
    let (_, server) = dse_node::serve(
        Arc::clone(&engine),
        &format!("127.0.0.1:{rpc_port}"),
        cancel.clone(),
    )
    .await
    .unwrap();
    TestWorker {
        engine,
        id,
        server,
        cancel,
    }
}

#[tokio::test]
async fn multi_worker_query_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator_port = free_port();
    let root_rpc_port = free_port();
    let root_data_port = free_port();

    // coordinator with its embedded node as topology root
    let topology = Topology::new("127.0.0.1".into(), root_rpc_port, root_data_port, 64);
    let control = Arc::new(HttpWorkerControl::new(RetryPolicy::default()).unwrap());
    let coordinator = Arc::new(Coordinator::new(topology, control));
    coordinator
        .register_logical_source("default_logical", "id:i32, value:i64")
        .unwrap();

    let coord_cancel = CancellationToken::new();
    let (_, coord_server) = dse_coord::serve(
        Arc::clone(&coordinator),
        &format!("127.0.0.1:{coordinator_port}"),
        coord_cancel.clone(),
    )
    .await
    .unwrap();

    // embedded root node engine (runs the user sinks)
    let root_cancel = CancellationToken::new();
    let root_client = Arc::new(
        CoordinatorClient::new("127.0.0.1", coordinator_port, ClientConfig::default()).unwrap(),
    );
    let root_config: WorkerConfig = serde_yaml::from_str(&format!(
        "coordinatorHost: 127.0.0.1\ncoordinatorPort: {coordinator_port}\nlocalHost: 127.0.0.1\nrpcPort: {root_rpc_port}\ndataPort: {root_data_port}\nworkerThreads: 2\n"
    ))
    .unwrap();
    let root_engine = NodeEngine::start(
        dse_core::TopologyNodeId::new(1),
        root_config,
        root_client,
        root_cancel.clone(),
    )
    .await
    .unwrap();
    let (_, root_server) = dse_node::serve(
        Arc::clone(&root_engine),
        &format!("127.0.0.1:{root_rpc_port}"),
        root_cancel.clone(),
    )
    .await
    .unwrap();

    // two workers come up with no persisted identity
    let w1 = spawn_worker(&dir, "w1", coordinator_port, true).await;
    let w2 = spawn_worker(&dir, "w2", coordinator_port, false).await;
    assert_eq!(w1.id.raw(), 2);
    assert_eq!(w2.id.raw(), 3);
    assert_eq!(coordinator.topology_len(), 3);

    // submit and watch the query reach Running
    let client = reqwest::Client::new();
    let base = format!("http://127.0.0.1:{coordinator_port}");
    let resp = client
        .post(format!("{base}/execute-query"))
        .json(&serde_json::json!({
            "userQuery": "Query::from(\"default_logical\").filter(value < 42).sink(print)",
            "placement": "BottomUp",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 202);
    let body: serde_json::Value = resp.json().await.unwrap();
    let query_id = body["queryId"].as_u64().unwrap();

    let status: serde_json::Value = client
        .get(format!("{base}/query/{query_id}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "Running");

    // give the generator time to push buffers through the exchange
    tokio::time::sleep(Duration::from_millis(300)).await;

    // stop the query; both workers stay connected
    let resp = client
        .post(format!("{base}/query/{query_id}/stop"))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success(), "stop failed: {resp:?}");
    let status: serde_json::Value = client
        .get(format!("{base}/query/{query_id}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "Stopped");
    assert_eq!(coordinator.topology_len(), 3);

    // orderly teardown: workers first, then the coordinator
    w1.engine.shutdown().await;
    w2.engine.shutdown().await;
    w1.cancel.cancel();
    w2.cancel.cancel();
    let _ = w1.server.await;
    let _ = w2.server.await;
    root_engine.shutdown().await;
    root_cancel.cancel();
    let _ = root_server.await;
    coord_cancel.cancel();
    let _ = coord_server.await;
}
