//! End-to-end pipeline execution on a single worker: compile a decomposed
//! plan, run it through the query manager, observe the sink output and the
//! termination bookkeeping.

use std::collections::HashSet;
use std::io::Write;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use dse_core::config::{QueueMode, SourceKind};
use dse_core::types::{DataType, Field, Schema};
use dse_core::{
    BufferManager, ExecutionStatus, Expr, QueryId, SharedQueryId, SubPlanId, TerminationType,
    TopologyNodeId,
};
use dse_net::{ChannelConfig, PartitionRegistry};
use dse_plan::{
    attach_source_schemas, infer_schemas, AggregationType, DecomposedPlan, OperatorKind, Query,
    SinkDescriptor, TimeCharacteristic, WindowType,
};
use dse_runtime::{compile, CompileContext, QueryManager};

fn compile_context() -> CompileContext {
    CompileContext {
        registry: PartitionRegistry::new(),
        channel_config: ChannelConfig::default(),
        cancel: CancellationToken::new(),
        lineage_enabled: false,
    }
}

/// Turn a built query into a single-worker decomposed plan with the given
/// source schema and physical source.
fn decompose(
    query: Query,
    schema: Schema,
    physical: SourceKind,
) -> DecomposedPlan {
    let mut plan = query.into_plan();
    plan.query_id = QueryId::new(1);
    attach_source_schemas(&mut plan, |_| Some(schema.clone())).unwrap();
    infer_schemas(&mut plan).unwrap();
    for id in plan.ids().collect::<Vec<_>>() {
        if let OperatorKind::Source(desc) = &mut plan.node_mut(id).kind {
            desc.physical = Some(physical.clone());
        }
    }
    let keep: HashSet<_> = plan.ids().collect();
    DecomposedPlan::extract(
        SubPlanId::new(1),
        SharedQueryId::new(1),
        vec![QueryId::new(1)],
        TopologyNodeId::new(2),
        &plan,
        &keep,
    )
    .unwrap()
}

async fn run_to_completion(manager: &QueryManager, decomposed: &DecomposedPlan) {
    let executable = compile(decomposed, &compile_context()).unwrap();
    manager.register(executable.clone()).unwrap();
    manager.start(decomposed.subplan_id).await.unwrap();
    assert!(
        executable.wait_terminal(Duration::from_secs(10)).await,
        "plan did not terminate"
    );
}

#[tokio::test]
async fn project_rename_writes_header_and_ten_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rename.csv");

    let query = Query::from("default_logical")
        .project(&[("id", Some("NewName"))])
        .sink(SinkDescriptor::File {
            path: path.display().to_string(),
            append: false,
        });
    let schema = Schema::new(vec![
        Field::new("id", DataType::Int32),
        Field::new("value", DataType::Int64),
    ]);
    let decomposed = decompose(
        query,
        schema,
        SourceKind::Generator {
            tuples: 10,
            interval_ms: 0,
        },
    );

    let manager = QueryManager::new(QueueMode::Dynamic, 2, BufferManager::new(4096, 64));
    run_to_completion(&manager, &decomposed).await;
    manager.shutdown().await;

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines[0], "default_logical$NewName:INTEGER(32 bits)");
    assert_eq!(lines.len(), 11);
    assert!(lines[1..].iter().all(|l| *l == "1"));
}

#[tokio::test]
async fn tumbling_event_time_window_sums_per_key() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("window.csv");
    let out = dir.path().join("window_out.csv");
    {
        let mut f = std::fs::File::create(&data).unwrap();
        writeln!(f, "value,id,timestamp").unwrap();
        // window (1000, 2000): key 1 sums to 1
        writeln!(f, "1,1,1000").unwrap();
        // window (2000, 3000): key 1 sums to 2
        writeln!(f, "2,1,2000").unwrap();
        // late trailer so the graceful flush covers both windows
        writeln!(f, "5,2,4000").unwrap();
    }

    let query = Query::from("window")
        .window(
            WindowType::Tumbling { size_ms: 1000 },
            TimeCharacteristic::EventTime {
                field: "timestamp".into(),
            },
        )
        .by_key("id")
        .apply(AggregationType::Sum, "value")
        .sink(SinkDescriptor::File {
            path: out.display().to_string(),
            append: false,
        });
    let schema = Schema::new(vec![
        Field::new("value", DataType::UInt64),
        Field::new("id", DataType::UInt64),
        Field::new("timestamp", DataType::UInt64),
    ]);
    let decomposed = decompose(
        query,
        schema,
        SourceKind::Csv {
            path: data.display().to_string(),
            has_header: true,
            interval_ms: 0,
        },
    );

    let manager = QueryManager::new(QueueMode::Dynamic, 2, BufferManager::new(4096, 64));
    run_to_completion(&manager, &decomposed).await;
    manager.shutdown().await;

    let content = std::fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert!(lines[0].starts_with("start:"), "header: {}", lines[0]);
    assert!(content.contains("1000,2000,1,1"), "content:\n{content}");
    assert!(content.contains("2000,3000,1,2"), "content:\n{content}");
}

#[tokio::test]
async fn iteration_pattern_counts_matches_in_sliding_window() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("qnv.csv");
    let out = dir.path().join("pattern_out.csv");
    {
        let mut f = std::fs::File::create(&data).unwrap();
        // velocity, timestamp; three fast readings inside (0, 60000]
        writeln!(f, "80,10000").unwrap();
        writeln!(f, "90,20000").unwrap();
        writeln!(f, "85,30000").unwrap();
        writeln!(f, "10,40000").unwrap();
        // fast trailer far ahead: pushes the watermark past the first
        // window but forms a lone match that the count filter drops
        writeln!(f, "99,200000").unwrap();
    }

    let query = Query::from("QnV")
        .filter(Expr::field("velocity").gt(Expr::lit(70.0)))
        .times(3, 10)
        .window(
            WindowType::Tumbling { size_ms: 60_000 },
            TimeCharacteristic::EventTime {
                field: "timestamp".into(),
            },
        )
        .sink(SinkDescriptor::File {
            path: out.display().to_string(),
            append: false,
        });
    let schema = Schema::new(vec![
        Field::new("velocity", DataType::Float64),
        Field::new("timestamp", DataType::UInt64),
    ]);
    let decomposed = decompose(
        query,
        schema,
        SourceKind::Csv {
            path: data.display().to_string(),
            has_header: false,
            interval_ms: 0,
        },
    );

    let manager = QueryManager::new(QueueMode::Dynamic, 2, BufferManager::new(4096, 64));
    run_to_completion(&manager, &decomposed).await;
    manager.shutdown().await;

    let content = std::fs::read_to_string(&out).unwrap();
    // exactly three matches in (0, 60000]: count 3, default key 0
    assert!(content.contains("0,60000,3,0"), "content:\n{content}");
}

#[tokio::test]
async fn termination_tokens_are_conserved() {
    let query = Query::from("default_logical")
        .filter(Expr::field("value").lt(Expr::lit(42i64)))
        .sink(SinkDescriptor::Null);
    let schema = Schema::new(vec![
        Field::new("id", DataType::Int32),
        Field::new("value", DataType::Int64),
    ]);
    let decomposed = decompose(
        query,
        schema,
        SourceKind::Generator {
            tuples: 100,
            interval_ms: 0,
        },
    );

    let manager = QueryManager::new(QueueMode::Dynamic, 3, BufferManager::new(4096, 64));
    let executable = compile(&decomposed, &compile_context()).unwrap();
    let expected_tokens = 1
        + executable.sources.len() as u64
        + executable.pipelines.len() as u64
        + executable.sinks.len() as u64;
    assert_eq!(executable.tokens_initial(), expected_tokens);

    let mut status_rx = executable.subscribe();
    manager.register(executable.clone()).unwrap();
    manager.start(decomposed.subplan_id).await.unwrap();
    assert!(executable.wait_terminal(Duration::from_secs(10)).await);

    // all tokens consumed exactly once, terminal reached exactly once
    assert_eq!(executable.tokens_remaining(), 0);
    let mut terminal_transitions = 0;
    loop {
        if status_rx.borrow_and_update().is_terminal() {
            terminal_transitions += 1;
        }
        if status_rx.changed().await.is_err() || terminal_transitions > 0 {
            break;
        }
    }
    assert_eq!(terminal_transitions, 1);
    assert_eq!(executable.status(), ExecutionStatus::Finished);
    manager.shutdown().await;
}

#[tokio::test]
async fn graceful_stop_drains_before_terminal() {
    // endless source; only the stop reconfiguration ends it
    let query = Query::from("default_logical")
        .filter(Expr::field("value").lt(Expr::lit(42i64)))
        .sink(SinkDescriptor::Null);
    let schema = Schema::new(vec![
        Field::new("id", DataType::Int32),
        Field::new("value", DataType::Int64),
    ]);
    let decomposed = decompose(
        query,
        schema,
        SourceKind::Generator {
            tuples: u64::MAX,
            interval_ms: 1,
        },
    );

    let manager = QueryManager::new(QueueMode::Dynamic, 2, BufferManager::new(4096, 64));
    let executable = compile(&decomposed, &compile_context()).unwrap();
    manager.register(executable.clone()).unwrap();
    manager.start(decomposed.subplan_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager
        .stop(
            decomposed.subplan_id,
            TerminationType::Graceful,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert_eq!(executable.status(), ExecutionStatus::Finished);
    assert_eq!(executable.tokens_remaining(), 0);
    // the manager forgets terminal plans
    assert!(manager.plan(decomposed.subplan_id).is_none());
    manager.shutdown().await;
}

#[tokio::test]
async fn failure_stop_marks_plan_failed() {
    let query = Query::from("default_logical").sink(SinkDescriptor::Null);
    let schema = Schema::new(vec![Field::new("id", DataType::Int32)]);
    let decomposed = decompose(
        query,
        schema,
        SourceKind::Generator {
            tuples: u64::MAX,
            interval_ms: 1,
        },
    );

    let manager = QueryManager::new(QueueMode::Dynamic, 2, BufferManager::new(4096, 64));
    let executable = compile(&decomposed, &compile_context()).unwrap();
    manager.register(executable.clone()).unwrap();
    manager.start(decomposed.subplan_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    manager
        .stop(
            decomposed.subplan_id,
            TerminationType::Failure,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert_eq!(executable.status(), ExecutionStatus::Failed);
    manager.shutdown().await;
}

#[tokio::test]
async fn per_query_queues_isolate_registrations() {
    let manager = QueryManager::new(
        QueueMode::PerQuery { queues: 2 },
        4,
        BufferManager::new(4096, 64),
    );
    let schema = Schema::new(vec![Field::new("id", DataType::Int32)]);
    for subplan in 1..=2u64 {
        let query = Query::from("default_logical").sink(SinkDescriptor::Null);
        let mut decomposed = decompose(
            query,
            schema.clone(),
            SourceKind::Generator {
                tuples: 5,
                interval_ms: 0,
            },
        );
        decomposed.subplan_id = SubPlanId::new(subplan);
        let executable = compile(&decomposed, &compile_context()).unwrap();
        manager.register(executable.clone()).unwrap();
        manager.start(decomposed.subplan_id).await.unwrap();
        assert!(executable.wait_terminal(Duration::from_secs(10)).await);
    }
    manager.shutdown().await;
}
