//! Executable form of a deployed subplan.
//!
//! A subplan compiles into source runners, operator pipelines and sinks.
//! Data tasks carry either a sealed buffer or an end-of-stream marker;
//! markers flow the same queues as data, so FIFO order guarantees every
//! buffer ahead of the marker is processed first.
//!
//! Termination tokens: a plan starts with `1 + |sources| + |pipelines| +
//! |sinks|` tokens. Every entity returns its token exactly once when it
//! finishes; when only the plan's own token remains the manager posts the
//! terminal reconfiguration, which consumes that last token and moves the
//! status to Finished, Stopped or Failed depending on how termination was
//! initiated. The status transition happens once, guarded by the token
//! countdown reaching zero exactly once.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info};

use dse_core::{
    CoreResult, ExecutionStatus, PipelineId, QueryId, SharedQueryId, SubPlanId, TerminationType,
    TupleBuffer,
};

use crate::kernels::{KernelContext, OperatorKernel};
use crate::sinks::ExecutableSink;
use crate::sources::SourceRunner;

/// What a data task carries.
#[derive(Debug, Clone)]
pub enum TaskPayload {
    Buffer(TupleBuffer),
    EndOfStream(TerminationType),
}

/// Where a pipeline or source delivers its output.
#[derive(Clone)]
pub enum Destination {
    Pipeline(Arc<ExecutablePipeline>),
    Sink(Arc<ExecutableSink>),
}

impl Destination {
    pub fn describe(&self) -> String {
        match self {
            Destination::Pipeline(p) => format!("pipeline {}", p.id),
            Destination::Sink(s) => format!("sink {}", s.operator),
        }
    }
}

/// A fused chain of operator kernels executed as one task.
pub struct ExecutablePipeline {
    pub id: PipelineId,
    pub subplan: SubPlanId,
    kernels: Vec<Box<dyn OperatorKernel>>,
    successors: RwLock<Vec<Destination>>,
    /// Upstream units still alive; end-of-stream completes at zero.
    pending_inputs: AtomicUsize,
}

impl ExecutablePipeline {
    pub fn new(id: PipelineId, subplan: SubPlanId, kernels: Vec<Box<dyn OperatorKernel>>) -> Self {
        Self {
            id,
            subplan,
            kernels,
            successors: RwLock::new(Vec::new()),
            pending_inputs: AtomicUsize::new(0),
        }
    }

    pub fn set_successors(&self, successors: Vec<Destination>) {
        *self.successors.write() = successors;
    }

    pub fn add_pending_input(&self) {
        self.pending_inputs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn successors(&self) -> Vec<Destination> {
        self.successors.read().clone()
    }

    pub fn setup(&self, ctx: &KernelContext) -> CoreResult<()> {
        for kernel in &self.kernels {
            kernel.setup(ctx)?;
        }
        Ok(())
    }

    /// Run one buffer through the kernel chain.
    pub fn execute_buffer(
        &self,
        buffer: &TupleBuffer,
        ctx: &KernelContext,
    ) -> CoreResult<Vec<TupleBuffer>> {
        let mut current = vec![buffer.clone()];
        for kernel in &self.kernels {
            let mut next = Vec::new();
            for buf in &current {
                next.extend(kernel.execute(buf, ctx)?);
            }
            if next.is_empty() {
                return Ok(Vec::new());
            }
            current = next;
        }
        Ok(current)
    }

    /// Account one upstream end-of-stream; `true` once all inputs closed.
    pub fn input_closed(&self) -> bool {
        self.pending_inputs.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Drain stateful kernels after the last end-of-stream. Output flushed
    /// by an earlier kernel still passes through the rest of the chain.
    pub fn flush(
        &self,
        termination: TerminationType,
        ctx: &KernelContext,
    ) -> CoreResult<Vec<TupleBuffer>> {
        let mut drained = Vec::new();
        for i in 0..self.kernels.len() {
            let mut current = self.kernels[i].flush(termination, ctx)?;
            for later in &self.kernels[i + 1..] {
                if current.is_empty() {
                    break;
                }
                let mut next = Vec::new();
                for buf in &current {
                    next.extend(later.execute(buf, ctx)?);
                }
                current = next;
            }
            drained.extend(current);
        }
        Ok(drained)
    }

    pub fn close(&self, ctx: &KernelContext) {
        for kernel in &self.kernels {
            kernel.close(ctx);
        }
    }
}

/// One deployed subplan with its termination accounting.
pub struct ExecutableQueryPlan {
    pub subplan_id: SubPlanId,
    pub shared_query_id: SharedQueryId,
    pub query_ids: Vec<QueryId>,
    pub sources: Vec<Arc<SourceRunner>>,
    pub pipelines: Vec<Arc<ExecutablePipeline>>,
    pub sinks: Vec<Arc<ExecutableSink>>,
    tokens: AtomicU64,
    tokens_initial: u64,
    /// How termination was initiated; decides the terminal status.
    termination: Mutex<TerminationType>,
    status_tx: watch::Sender<ExecutionStatus>,
    /// Source operator -> the units its buffers feed.
    source_routes: RwLock<std::collections::HashMap<dse_core::OperatorId, Vec<Destination>>>,
}

impl ExecutableQueryPlan {
    pub fn new(
        subplan_id: SubPlanId,
        shared_query_id: SharedQueryId,
        query_ids: Vec<QueryId>,
        sources: Vec<Arc<SourceRunner>>,
        pipelines: Vec<Arc<ExecutablePipeline>>,
        sinks: Vec<Arc<ExecutableSink>>,
    ) -> Arc<Self> {
        let tokens_initial =
            1 + sources.len() as u64 + pipelines.len() as u64 + sinks.len() as u64;
        let (status_tx, _) = watch::channel(ExecutionStatus::Created);
        Arc::new(Self {
            subplan_id,
            shared_query_id,
            query_ids,
            sources,
            pipelines,
            sinks,
            tokens: AtomicU64::new(tokens_initial),
            tokens_initial,
            termination: Mutex::new(TerminationType::Graceful),
            status_tx,
            source_routes: RwLock::new(std::collections::HashMap::new()),
        })
    }

    pub fn set_source_successors(
        &self,
        routes: std::collections::HashMap<dse_core::OperatorId, Vec<Destination>>,
    ) {
        *self.source_routes.write() = routes;
    }

    pub fn source_successors(&self, operator: dse_core::OperatorId) -> Option<Vec<Destination>> {
        self.source_routes.read().get(&operator).cloned()
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionStatus> {
        self.status_tx.subscribe()
    }

    pub fn set_running(&self) {
        let _ = self.status_tx.send(ExecutionStatus::Running);
    }

    pub fn tokens_initial(&self) -> u64 {
        self.tokens_initial
    }

    pub fn tokens_remaining(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }

    /// Record how termination was initiated; failure wins over stop.
    pub fn mark_termination(&self, termination: TerminationType) {
        let mut current = self.termination.lock();
        if *current != TerminationType::Failure {
            *current = termination;
        }
    }

    pub fn termination(&self) -> TerminationType {
        *self.termination.lock()
    }

    /// An entity (source, pipeline, sink) returned its token. `true` when
    /// only the plan's own token is left and the terminal reconfiguration
    /// must be posted.
    pub fn consume_token(&self) -> bool {
        let before = self.tokens.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(before > 1, "token counter underflow");
        debug!(
            subplan = %self.subplan_id,
            remaining = before - 1,
            "termination token consumed"
        );
        before - 1 == 1
    }

    /// Consume the plan's own token and transition exactly once.
    pub fn transition_terminal(&self, ctx: &KernelContext) -> bool {
        if self
            .tokens
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        for pipeline in &self.pipelines {
            pipeline.close(ctx);
        }
        let status = ExecutionStatus::terminal_for(self.termination());
        let _ = self.status_tx.send(status);
        info!(subplan = %self.subplan_id, ?status, "subplan terminal");
        true
    }

    /// Wait until the plan reaches a terminal status.
    pub async fn wait_terminal(&self, deadline: Duration) -> bool {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(deadline, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dse_core::BufferManager;

    fn empty_plan() -> Arc<ExecutableQueryPlan> {
        ExecutableQueryPlan::new(
            SubPlanId::new(1),
            SharedQueryId::new(1),
            vec![QueryId::new(1)],
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn terminal_transition_happens_once() {
        let plan = empty_plan();
        let ctx = KernelContext::new(BufferManager::new(64, 1));
        assert_eq!(plan.tokens_initial(), 1);
        assert!(plan.transition_terminal(&ctx));
        assert!(!plan.transition_terminal(&ctx));
        assert_eq!(plan.status(), ExecutionStatus::Finished);
        assert_eq!(plan.tokens_remaining(), 0);
    }

    #[test]
    fn failure_termination_wins() {
        let plan = empty_plan();
        plan.mark_termination(TerminationType::Failure);
        plan.mark_termination(TerminationType::Graceful);
        assert_eq!(plan.termination(), TerminationType::Failure);
    }

    #[tokio::test]
    async fn wait_terminal_times_out_then_succeeds() {
        let plan = empty_plan();
        assert!(!plan.wait_terminal(Duration::from_millis(10)).await);
        let ctx = KernelContext::new(BufferManager::new(64, 1));
        plan.transition_terminal(&ctx);
        assert!(plan.wait_terminal(Duration::from_millis(10)).await);
    }
}
