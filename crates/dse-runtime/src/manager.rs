//! The per-worker query manager.
//!
//! Owns the task queues and the worker tasks that drain them. Two layouts:
//! `Dynamic` runs one shared queue for everything; `PerQuery` partitions
//! queries over `K` queues, each with its own slice of workers.
//!
//! Control-plane changes travel as reconfiguration messages: the manager
//! enqueues one copy per worker of the owning queue, every worker that
//! dequeues a copy parks on the message's barrier, and the barrier leader
//! applies the change. Because each worker consumes exactly one copy
//! before passing the barrier, no worker can run a data task enqueued
//! after the reconfiguration until it has observed the reconfiguration
//! itself.
//!
//! End-of-stream markers ride the data queues, so FIFO order makes every
//! buffer ahead of a marker visible to the pipeline before it closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Barrier;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use dse_core::config::QueueMode;
use dse_core::{BufferManager, CoreError, CoreResult, SubPlanId, TerminationType};

use crate::executable::{Destination, ExecutableQueryPlan, TaskPayload};
use crate::kernels::KernelContext;

/// How long a promoted hard stop may take before we give up waiting.
const HARD_STOP_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigurationType {
    Initialize,
    SoftEndOfStream,
    HardEndOfStream,
    FailEndOfStream,
    Destroy,
    PropagateEpoch { timestamp: u64, query_id: u64 },
    /// Internal: consume the plan's self token and transition.
    Terminal,
}

pub struct Reconfiguration {
    pub rtype: ReconfigurationType,
    pub plan: Arc<ExecutableQueryPlan>,
    barrier: Barrier,
}

enum WorkItem {
    Data {
        plan: Arc<ExecutableQueryPlan>,
        dest: Destination,
        payload: TaskPayload,
    },
    Reconfigure(Arc<Reconfiguration>),
    Poison,
}

struct Inner {
    queues: Vec<async_channel::Sender<WorkItem>>,
    workers_per_queue: usize,
    buffers: BufferManager,
    plans: Mutex<HashMap<SubPlanId, Arc<ExecutableQueryPlan>>>,
    assignments: Mutex<HashMap<SubPlanId, usize>>,
    next_assignment: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Keeps the copies of one reconfiguration contiguous in the queue;
    /// interleaved copies of two messages would park workers on two
    /// different barriers at once.
    broadcast_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct QueryManager {
    inner: Arc<Inner>,
}

impl QueryManager {
    pub fn new(mode: QueueMode, worker_threads: usize, buffers: BufferManager) -> QueryManager {
        let (queue_count, workers_per_queue) = match mode {
            QueueMode::Dynamic => (1, worker_threads.max(1)),
            QueueMode::PerQuery { queues } => {
                let queues = queues.max(1);
                (queues, (worker_threads / queues).max(1))
            }
        };

        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..queue_count {
            let (tx, rx) = async_channel::bounded::<WorkItem>(4096);
            senders.push(tx);
            receivers.push(rx);
        }

        let inner = Arc::new(Inner {
            queues: senders,
            workers_per_queue,
            buffers,
            plans: Mutex::new(HashMap::new()),
            assignments: Mutex::new(HashMap::new()),
            next_assignment: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
            broadcast_lock: tokio::sync::Mutex::new(()),
        });

        let mut handles = Vec::new();
        for (queue_id, rx) in receivers.into_iter().enumerate() {
            for worker_id in 0..workers_per_queue {
                let inner = Arc::clone(&inner);
                let rx = rx.clone();
                handles.push(tokio::spawn(async move {
                    worker_loop(inner, rx, queue_id, worker_id).await;
                }));
            }
        }
        *inner.handles.lock() = handles;
        info!(
            queues = queue_count,
            workers_per_queue, "query manager started"
        );
        QueryManager { inner }
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.inner.buffers
    }

    pub fn plan(&self, subplan: SubPlanId) -> Option<Arc<ExecutableQueryPlan>> {
        self.inner.plans.lock().get(&subplan).cloned()
    }

    pub fn registered_subplans(&self) -> Vec<SubPlanId> {
        self.inner.plans.lock().keys().copied().collect()
    }

    /// Register a compiled plan and bind it to a queue.
    pub fn register(&self, plan: Arc<ExecutableQueryPlan>) -> CoreResult<()> {
        let subplan = plan.subplan_id;
        let mut plans = self.inner.plans.lock();
        if plans.contains_key(&subplan) {
            return Err(CoreError::Validation(format!(
                "subplan {subplan} already registered"
            )));
        }
        let queue = self.inner.next_assignment.fetch_add(1, Ordering::Relaxed)
            % self.inner.queues.len();
        self.inner.assignments.lock().insert(subplan, queue);
        plans.insert(subplan, plan);
        debug!(%subplan, queue, "subplan registered");
        Ok(())
    }

    /// Start a registered plan: bind sinks, set up kernels via an
    /// Initialize reconfiguration, then let the sources run.
    pub async fn start(&self, subplan: SubPlanId) -> CoreResult<()> {
        let plan = self
            .plan(subplan)
            .ok_or_else(|| CoreError::NotFound(format!("subplan {subplan}")))?;
        for sink in &plan.sinks {
            sink.open().await?;
        }
        self.broadcast(Arc::clone(&plan), ReconfigurationType::Initialize)
            .await?;
        for (runner, dests) in self.source_destinations(&plan) {
            let inner = Arc::clone(&self.inner);
            let plan = Arc::clone(&plan);
            tokio::spawn(async move {
                drive_source(inner, plan, runner, dests).await;
            });
        }
        plan.set_running();
        info!(%subplan, "subplan started");
        Ok(())
    }

    fn source_destinations(
        &self,
        plan: &Arc<ExecutableQueryPlan>,
    ) -> Vec<(Arc<crate::sources::SourceRunner>, Vec<Destination>)> {
        plan.sources
            .iter()
            .map(|runner| {
                let dests = plan
                    .source_successors(runner.operator)
                    .unwrap_or_default();
                (Arc::clone(runner), dests)
            })
            .collect()
    }

    /// Stop with the spec'd semantics per termination type. A graceful
    /// stop that misses `deadline` is promoted to a hard stop.
    pub async fn stop(
        &self,
        subplan: SubPlanId,
        termination: TerminationType,
        deadline: Duration,
    ) -> CoreResult<()> {
        let plan = self
            .plan(subplan)
            .ok_or_else(|| CoreError::NotFound(format!("subplan {subplan}")))?;
        match termination {
            TerminationType::Graceful => {
                self.broadcast(Arc::clone(&plan), ReconfigurationType::SoftEndOfStream)
                    .await?;
                if !plan.wait_terminal(deadline).await {
                    warn!(%subplan, "graceful stop timed out, promoting to hard stop");
                    self.broadcast(Arc::clone(&plan), ReconfigurationType::HardEndOfStream)
                        .await?;
                    plan.wait_terminal(HARD_STOP_DEADLINE).await;
                }
            }
            TerminationType::HardStop => {
                self.broadcast(Arc::clone(&plan), ReconfigurationType::HardEndOfStream)
                    .await?;
                plan.wait_terminal(deadline).await;
            }
            TerminationType::Failure => {
                self.broadcast(Arc::clone(&plan), ReconfigurationType::FailEndOfStream)
                    .await?;
                plan.wait_terminal(deadline).await;
            }
        }
        Ok(())
    }

    /// Fail a plan from outside the data path.
    pub async fn fail(&self, subplan: SubPlanId) -> CoreResult<()> {
        let plan = self
            .plan(subplan)
            .ok_or_else(|| CoreError::NotFound(format!("subplan {subplan}")))?;
        self.broadcast(plan, ReconfigurationType::FailEndOfStream)
            .await
    }

    /// Remove a terminal plan.
    pub async fn unregister(&self, subplan: SubPlanId) -> CoreResult<()> {
        let Some(plan) = self.plan(subplan) else {
            return Ok(());
        };
        self.broadcast(plan, ReconfigurationType::Destroy).await
    }

    /// Propagate an epoch barrier to every network sink of the plan.
    pub async fn propagate_epoch(
        &self,
        subplan: SubPlanId,
        timestamp: u64,
        query_id: u64,
    ) -> CoreResult<()> {
        let plan = self
            .plan(subplan)
            .ok_or_else(|| CoreError::NotFound(format!("subplan {subplan}")))?;
        self.broadcast(
            plan,
            ReconfigurationType::PropagateEpoch {
                timestamp,
                query_id,
            },
        )
        .await
    }

    /// Enqueue one copy of the reconfiguration per worker of the plan's
    /// queue.
    async fn broadcast(
        &self,
        plan: Arc<ExecutableQueryPlan>,
        rtype: ReconfigurationType,
    ) -> CoreResult<()> {
        let queue = self.queue_of(plan.subplan_id);
        let workers = self.inner.workers_per_queue;
        let message = Arc::new(Reconfiguration {
            rtype,
            plan,
            barrier: Barrier::new(workers),
        });
        let _contiguous = self.inner.broadcast_lock.lock().await;
        for _ in 0..workers {
            self.inner.queues[queue]
                .send(WorkItem::Reconfigure(Arc::clone(&message)))
                .await
                .map_err(|_| CoreError::Terminated)?;
        }
        Ok(())
    }

    fn queue_of(&self, subplan: SubPlanId) -> usize {
        self.inner
            .assignments
            .lock()
            .get(&subplan)
            .copied()
            .unwrap_or(0)
    }

    /// Runtime counters for the monitoring endpoint.
    pub fn monitoring_snapshot(&self) -> serde_json::Value {
        let plans = self.inner.plans.lock();
        serde_json::json!({
            "registeredSubplans": plans.len(),
            "queueDepths": self.inner.queues.iter().map(|q| q.len()).collect::<Vec<_>>(),
            "pooledBuffersAvailable": self.inner.buffers.available(),
            "subplans": plans.values().map(|p| {
                serde_json::json!({
                    "subplanId": p.subplan_id.raw(),
                    "status": format!("{:?}", p.status()),
                    "tokensRemaining": p.tokens_remaining(),
                })
            }).collect::<Vec<_>>(),
        })
    }

    /// Poison every worker and join them.
    pub async fn shutdown(&self) {
        for queue in &self.inner.queues {
            for _ in 0..self.inner.workers_per_queue {
                let _ = queue.send(WorkItem::Poison).await;
            }
        }
        let handles: Vec<JoinHandle<()>> = self.inner.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("query manager stopped");
    }
}

/// Submit helper shared by workers and source drivers.
async fn submit(
    inner: &Arc<Inner>,
    plan: &Arc<ExecutableQueryPlan>,
    dest: Destination,
    payload: TaskPayload,
) -> CoreResult<()> {
    let queue = inner
        .assignments
        .lock()
        .get(&plan.subplan_id)
        .copied()
        .unwrap_or(0);
    inner.queues[queue]
        .send(WorkItem::Data {
            plan: Arc::clone(plan),
            dest,
            payload,
        })
        .await
        .map_err(|_| CoreError::Terminated)
}

async fn worker_loop(
    inner: Arc<Inner>,
    rx: async_channel::Receiver<WorkItem>,
    queue_id: usize,
    worker_id: usize,
) {
    let ctx = KernelContext::new(inner.buffers.clone());
    while let Ok(item) = rx.recv().await {
        match item {
            WorkItem::Poison => break,
            WorkItem::Reconfigure(message) => {
                // every worker of this queue consumes exactly one copy;
                // the last one through the barrier applies the change
                let leader = message.barrier.wait().await.is_leader();
                if leader {
                    apply_reconfiguration(&inner, &message, &ctx).await;
                }
            }
            WorkItem::Data {
                plan,
                dest,
                payload,
            } => {
                if let Err(e) = process_data(&inner, &plan, dest, payload, &ctx).await {
                    if matches!(e, CoreError::Terminated) {
                        continue;
                    }
                    error!(
                        subplan = %plan.subplan_id,
                        queue_id, worker_id, error = %e,
                        "task failed, failing subplan"
                    );
                    plan.mark_termination(TerminationType::Failure);
                    for source in &plan.sources {
                        source.stop(TerminationType::Failure);
                    }
                }
            }
        }
    }
    debug!(queue_id, worker_id, "worker stopped");
}

async fn process_data(
    inner: &Arc<Inner>,
    plan: &Arc<ExecutableQueryPlan>,
    dest: Destination,
    payload: TaskPayload,
    ctx: &KernelContext,
) -> CoreResult<()> {
    match dest {
        Destination::Pipeline(pipeline) => match payload {
            TaskPayload::Buffer(buffer) => {
                let outputs = pipeline.execute_buffer(&buffer, ctx)?;
                for output in outputs {
                    for succ in pipeline.successors() {
                        submit(inner, plan, succ, TaskPayload::Buffer(output.clone())).await?;
                    }
                }
                Ok(())
            }
            TaskPayload::EndOfStream(termination) => {
                if !pipeline.input_closed() {
                    return Ok(());
                }
                let drained = pipeline.flush(termination, ctx)?;
                for output in drained {
                    for succ in pipeline.successors() {
                        submit(inner, plan, succ, TaskPayload::Buffer(output.clone())).await?;
                    }
                }
                for succ in pipeline.successors() {
                    submit(inner, plan, succ, TaskPayload::EndOfStream(termination)).await?;
                }
                finish_entity(inner, plan).await;
                Ok(())
            }
        },
        Destination::Sink(sink) => match payload {
            TaskPayload::Buffer(buffer) => sink.write(&buffer).await,
            TaskPayload::EndOfStream(termination) => {
                sink.finish(termination).await?;
                finish_entity(inner, plan).await;
                Ok(())
            }
        },
    }
}

/// Token bookkeeping after an entity completed.
async fn finish_entity(inner: &Arc<Inner>, plan: &Arc<ExecutableQueryPlan>) {
    if plan.consume_token() {
        // only the plan's self token remains: post the terminal
        // reconfiguration on the plan's queue
        let manager = QueryManager {
            inner: Arc::clone(inner),
        };
        if let Err(e) = manager
            .broadcast(Arc::clone(plan), ReconfigurationType::Terminal)
            .await
        {
            error!(subplan = %plan.subplan_id, error = %e, "terminal broadcast failed");
        }
    }
}

async fn apply_reconfiguration(
    inner: &Arc<Inner>,
    message: &Reconfiguration,
    ctx: &KernelContext,
) {
    let plan = &message.plan;
    debug!(subplan = %plan.subplan_id, rtype = ?message.rtype, "post reconfiguration");
    match message.rtype {
        ReconfigurationType::Initialize => {
            for pipeline in &plan.pipelines {
                if let Err(e) = pipeline.setup(ctx) {
                    error!(subplan = %plan.subplan_id, error = %e, "pipeline setup failed");
                    plan.mark_termination(TerminationType::Failure);
                }
            }
        }
        ReconfigurationType::SoftEndOfStream => {
            plan.mark_termination(TerminationType::Graceful);
            // graceful: only leaf sources stop; network edges drain on
            // their own once the upstream closes
            for source in &plan.sources {
                if source.leaf {
                    source.stop(TerminationType::Graceful);
                }
            }
        }
        ReconfigurationType::HardEndOfStream => {
            plan.mark_termination(TerminationType::HardStop);
            for source in &plan.sources {
                source.stop(TerminationType::HardStop);
            }
        }
        ReconfigurationType::FailEndOfStream => {
            plan.mark_termination(TerminationType::Failure);
            for source in &plan.sources {
                source.stop(TerminationType::Failure);
            }
        }
        ReconfigurationType::Destroy => {
            inner.plans.lock().remove(&plan.subplan_id);
            inner.assignments.lock().remove(&plan.subplan_id);
            for pipeline in &plan.pipelines {
                pipeline.close(ctx);
            }
        }
        ReconfigurationType::PropagateEpoch {
            timestamp,
            query_id,
        } => {
            for sink in &plan.sinks {
                if let Err(e) = sink.propagate_epoch(timestamp, query_id).await {
                    warn!(subplan = %plan.subplan_id, error = %e, "epoch propagation failed");
                }
            }
        }
        ReconfigurationType::Terminal => {
            if plan.transition_terminal(ctx) {
                inner.plans.lock().remove(&plan.subplan_id);
                inner.assignments.lock().remove(&plan.subplan_id);
            }
        }
    }
}

async fn drive_source(
    inner: Arc<Inner>,
    plan: Arc<ExecutableQueryPlan>,
    runner: Arc<crate::sources::SourceRunner>,
    dests: Vec<Destination>,
) {
    loop {
        match runner.next_batch(&inner.buffers).await {
            Ok(Some(buffer)) => {
                for dest in &dests {
                    let payload = TaskPayload::Buffer(buffer.clone());
                    if submit(&inner, &plan, dest.clone(), payload).await.is_err() {
                        return;
                    }
                }
                let pace = runner.interval_ms();
                if pace > 0 {
                    tokio::time::sleep(Duration::from_millis(pace)).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(source = %runner.operator, error = %e, "source failed");
                plan.mark_termination(TerminationType::Failure);
                runner.stop(TerminationType::Failure);
                break;
            }
        }
    }
    let termination = runner.termination();
    debug!(source = %runner.operator, ?termination, "source completed");
    for dest in &dests {
        let _ = submit(
            &inner,
            &plan,
            dest.clone(),
            TaskPayload::EndOfStream(termination),
        )
        .await;
    }
    finish_entity(&inner, &plan).await;
}
