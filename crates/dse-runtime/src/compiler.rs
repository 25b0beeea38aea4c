//! Lowers a decomposed subplan into an executable plan.
//!
//! Operators are grouped into execution units: source runners, fused
//! kernel pipelines and sinks. Consecutive unary row kernels (filter, map,
//! project, watermark assign) fuse into one pipeline; stateful operators
//! (window, union merge points) get their own pipeline; a join becomes two
//! build pipelines, one per input branch, sharing one join state.
//!
//! After unit assignment, every cross-unit plan edge becomes a successor
//! route and one pending-input count on its destination, which is exactly
//! the accounting end-of-stream propagation runs on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use dse_core::{
    CoreError, CoreResult, IdGenerator, OperatorId, OriginId, PipelineId, TupleBuffer,
};
use dse_net::{ChannelConfig, PartitionRegistry};
use dse_plan::{DecomposedPlan, OperatorKind};

use crate::executable::{Destination, ExecutablePipeline, ExecutableQueryPlan};
use crate::join::{JoinBuildKernel, JoinSide, JoinState};
use crate::kernels::{
    FilterKernel, MapKernel, OperatorKernel, OutputStream, PassthroughKernel, ProjectKernel,
    WatermarkAssignKernel,
};
use crate::sinks::ExecutableSink;
use crate::sources::SourceRunner;
use crate::window::WindowAggKernel;

/// Ambient services the compiler binds network edges against.
pub struct CompileContext {
    pub registry: PartitionRegistry,
    pub channel_config: ChannelConfig,
    pub cancel: CancellationToken,
    pub lineage_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum UnitId {
    Source(OperatorId),
    Pipeline(usize),
    Sink(OperatorId),
}

struct Units {
    sources: HashMap<OperatorId, Arc<SourceRunner>>,
    pipelines: Vec<Arc<ExecutablePipeline>>,
    sinks: HashMap<OperatorId, Arc<ExecutableSink>>,
}

/// Origin of buffers originating at this operator.
fn origin_of(id: OperatorId, kind: &OperatorKind) -> OriginId {
    match kind {
        OperatorKind::Source(desc) if desc.origin.is_valid() => desc.origin,
        _ => OriginId::new(id.raw()),
    }
}

/// All origins observable below `of` within this subplan.
fn upstream_origins(plan: &dse_plan::QueryPlan, of: OperatorId) -> HashSet<OriginId> {
    let mut origins = HashSet::new();
    let mut stack = plan.node(of).children.clone();
    let mut seen: HashSet<OperatorId> = stack.iter().copied().collect();
    while let Some(id) = stack.pop() {
        let node = plan.node(id);
        match &node.kind {
            OperatorKind::Source(_) => {
                origins.insert(origin_of(id, &node.kind));
            }
            OperatorKind::NetworkSource(desc) => {
                origins.extend(desc.origins.iter().copied());
            }
            // a windowed operator re-originates its output stream
            OperatorKind::Window(_) | OperatorKind::Join(_) => {
                origins.insert(OriginId::new(id.raw()));
                continue;
            }
            _ => {}
        }
        for child in &node.children {
            if seen.insert(*child) {
                stack.push(*child);
            }
        }
    }
    origins
}

pub fn compile(
    decomposed: &DecomposedPlan,
    ctx: &CompileContext,
) -> CoreResult<Arc<ExecutableQueryPlan>> {
    decomposed.validate()?;
    let plan = &decomposed.plan;
    let order = plan.topological()?;
    let pipeline_ids = IdGenerator::new();

    let mut unit_of: HashMap<OperatorId, UnitId> = HashMap::new();
    // join operators route each branch to its own build pipeline
    let mut join_units: HashMap<OperatorId, (usize, usize)> = HashMap::new();
    let mut pipeline_kernels: Vec<Vec<Box<dyn OperatorKernel>>> = Vec::new();
    let mut units = Units {
        sources: HashMap::new(),
        pipelines: Vec::new(),
        sinks: HashMap::new(),
    };

    for id in &order {
        let node = plan.node(*id);
        let in_schema = node
            .children
            .first()
            .map(|c| plan.node(*c).output_schema.clone())
            .unwrap_or_default();
        match &node.kind {
            OperatorKind::Source(desc) => {
                let physical = desc.physical.as_ref().ok_or_else(|| {
                    CoreError::Deployment(format!(
                        "source {} has no physical implementation attached",
                        desc.logical_name
                    ))
                })?;
                let runner = Arc::new(SourceRunner::physical(
                    *id,
                    origin_of(*id, &node.kind),
                    node.output_schema.clone(),
                    physical,
                ));
                units.sources.insert(*id, runner);
                unit_of.insert(*id, UnitId::Source(*id));
            }
            OperatorKind::NetworkSource(desc) => {
                let rx = ctx.registry.register(desc.partition, 64);
                let runner = Arc::new(SourceRunner::network(
                    *id,
                    OriginId::INVALID,
                    desc.schema.clone(),
                    desc.partition,
                    ctx.registry.clone(),
                    rx,
                ));
                units.sources.insert(*id, runner);
                unit_of.insert(*id, UnitId::Source(*id));
            }
            OperatorKind::Sink(desc) => {
                let sink = match desc {
                    dse_plan::SinkDescriptor::Print => Arc::new(ExecutableSink::print(
                        *id,
                        decomposed.subplan_id,
                        node.output_schema.clone(),
                    )),
                    dse_plan::SinkDescriptor::File { path, append } => {
                        Arc::new(ExecutableSink::file(
                            *id,
                            decomposed.subplan_id,
                            node.output_schema.clone(),
                            path.clone(),
                            *append,
                        ))
                    }
                    dse_plan::SinkDescriptor::Null => Arc::new(ExecutableSink::null(
                        *id,
                        decomposed.subplan_id,
                        node.output_schema.clone(),
                    )),
                };
                units.sinks.insert(*id, sink);
                unit_of.insert(*id, UnitId::Sink(*id));
            }
            OperatorKind::NetworkSink(desc) => {
                let sink = Arc::new(ExecutableSink::network(
                    *id,
                    decomposed.subplan_id,
                    node.output_schema.clone(),
                    desc.clone(),
                    ctx.channel_config.clone(),
                    ctx.cancel.clone(),
                    ctx.lineage_enabled,
                ));
                units.sinks.insert(*id, sink);
                unit_of.insert(*id, UnitId::Sink(*id));
            }
            OperatorKind::Filter { predicate } => {
                let kernel = Box::new(FilterKernel::new(predicate.clone(), in_schema));
                fuse_or_start(*id, kernel, plan, &mut unit_of, &mut pipeline_kernels);
            }
            OperatorKind::Map { field, expr } => {
                let kernel = Box::new(MapKernel::new(
                    field.clone(),
                    expr.clone(),
                    in_schema,
                    node.output_schema.clone(),
                ));
                fuse_or_start(*id, kernel, plan, &mut unit_of, &mut pipeline_kernels);
            }
            OperatorKind::Project { fields } => {
                let kernel = Box::new(ProjectKernel::new(
                    fields,
                    in_schema,
                    node.output_schema.clone(),
                )?);
                fuse_or_start(*id, kernel, plan, &mut unit_of, &mut pipeline_kernels);
            }
            OperatorKind::WatermarkAssign(desc) => {
                let kernel = Box::new(WatermarkAssignKernel::new(
                    desc.time.clone(),
                    desc.allowed_lateness_ms,
                    in_schema,
                ));
                fuse_or_start(*id, kernel, plan, &mut unit_of, &mut pipeline_kernels);
            }
            OperatorKind::Union => {
                // merge point: own pipeline so both branches feed one unit
                let index = pipeline_kernels.len();
                pipeline_kernels.push(vec![Box::new(PassthroughKernel)]);
                unit_of.insert(*id, UnitId::Pipeline(index));
            }
            OperatorKind::Window(desc) => {
                let kernel = Box::new(WindowAggKernel::new(
                    desc.clone(),
                    in_schema,
                    node.output_schema.clone(),
                    upstream_origins(plan, *id),
                    OutputStream::new(OriginId::new(id.raw())),
                )?);
                let index = pipeline_kernels.len();
                pipeline_kernels.push(vec![kernel]);
                unit_of.insert(*id, UnitId::Pipeline(index));
            }
            OperatorKind::Join(desc) => {
                let left_schema = plan.node(node.children[0]).output_schema.clone();
                let right_schema = plan.node(node.children[1]).output_schema.clone();
                let state = Arc::new(JoinState::new(
                    desc.clone(),
                    left_schema,
                    right_schema,
                    node.output_schema.clone(),
                    upstream_origins(plan, *id),
                    OutputStream::new(OriginId::new(id.raw())),
                )?);
                let left_index = pipeline_kernels.len();
                pipeline_kernels.push(vec![Box::new(JoinBuildKernel::new(
                    JoinSide::Left,
                    Arc::clone(&state),
                ))]);
                let right_index = pipeline_kernels.len();
                pipeline_kernels.push(vec![Box::new(JoinBuildKernel::new(
                    JoinSide::Right,
                    state,
                ))]);
                join_units.insert(*id, (left_index, right_index));
                // outgoing edges resolve through the join id itself
                unit_of.insert(*id, UnitId::Pipeline(left_index));
            }
        }
    }

    // materialize pipelines
    for kernels in pipeline_kernels {
        let pipeline = Arc::new(ExecutablePipeline::new(
            pipeline_ids.next::<PipelineId>(),
            decomposed.subplan_id,
            kernels,
        ));
        units.pipelines.push(pipeline);
    }

    // edge routing: where does data flowing from `child` into `parent` go?
    let dest_unit = |parent: OperatorId, child: OperatorId| -> UnitId {
        if let Some((left, right)) = join_units.get(&parent) {
            let branches = &plan.node(parent).children;
            if branches.first() == Some(&child) {
                return UnitId::Pipeline(*left);
            }
            return UnitId::Pipeline(*right);
        }
        unit_of[&parent]
    };
    // a join's outgoing edges originate from both of its build pipelines
    let units_of_op = |id: OperatorId| -> Vec<UnitId> {
        match join_units.get(&id) {
            Some((left, right)) => vec![UnitId::Pipeline(*left), UnitId::Pipeline(*right)],
            None => vec![unit_of[&id]],
        }
    };

    let mut successors: HashMap<UnitId, Vec<UnitId>> = HashMap::new();
    let mut feeders: HashMap<UnitId, HashSet<UnitId>> = HashMap::new();
    for id in &order {
        let node = plan.node(*id);
        for parent in &node.parents {
            let to = dest_unit(*parent, *id);
            for from in units_of_op(*id) {
                if from == to {
                    continue;
                }
                let entry = successors.entry(from).or_default();
                if !entry.contains(&to) {
                    entry.push(to);
                }
                feeders.entry(to).or_default().insert(from);
            }
        }
    }

    let as_destination = |unit: &UnitId| -> Destination {
        match unit {
            UnitId::Pipeline(i) => Destination::Pipeline(Arc::clone(&units.pipelines[*i])),
            UnitId::Sink(op) => Destination::Sink(Arc::clone(&units.sinks[op])),
            UnitId::Source(_) => unreachable!("sources are never destinations"),
        }
    };

    for (unit, succs) in &successors {
        if let UnitId::Pipeline(i) = unit {
            units.pipelines[*i].set_successors(succs.iter().map(&as_destination).collect());
        }
    }
    for (unit, feeding) in &feeders {
        if let UnitId::Pipeline(i) = unit {
            for _ in 0..feeding.len() {
                units.pipelines[*i].add_pending_input();
            }
        }
    }

    let mut source_routes: HashMap<OperatorId, Vec<Destination>> = HashMap::new();
    for (op, _) in &units.sources {
        let succs = successors
            .get(&UnitId::Source(*op))
            .map(|s| s.iter().map(&as_destination).collect())
            .unwrap_or_default();
        source_routes.insert(*op, succs);
    }

    let sources: Vec<Arc<SourceRunner>> = units.sources.values().cloned().collect();
    let sinks: Vec<Arc<ExecutableSink>> = units.sinks.values().cloned().collect();
    debug!(
        subplan = %decomposed.subplan_id,
        sources = sources.len(),
        pipelines = units.pipelines.len(),
        sinks = sinks.len(),
        "subplan compiled"
    );
    let executable = ExecutableQueryPlan::new(
        decomposed.subplan_id,
        decomposed.shared_query_id,
        decomposed.query_ids.clone(),
        sources,
        units.pipelines.clone(),
        sinks,
    );
    executable.set_source_successors(source_routes);
    Ok(executable)
}

/// Append a unary row kernel to its input's pipeline when that input ends
/// a chain this operator solely consumes; otherwise start a new pipeline.
fn fuse_or_start(
    id: OperatorId,
    kernel: Box<dyn OperatorKernel>,
    plan: &dse_plan::QueryPlan,
    unit_of: &mut HashMap<OperatorId, UnitId>,
    pipeline_kernels: &mut Vec<Vec<Box<dyn OperatorKernel>>>,
) {
    let child = plan.node(id).children[0];
    let fusable = matches!(
        plan.node(child).kind,
        OperatorKind::Filter { .. }
            | OperatorKind::Map { .. }
            | OperatorKind::Project { .. }
            | OperatorKind::WatermarkAssign(_)
    ) && plan.node(child).parents.len() == 1;
    if fusable {
        if let Some(UnitId::Pipeline(index)) = unit_of.get(&child) {
            let index = *index;
            pipeline_kernels[index].push(kernel);
            unit_of.insert(id, UnitId::Pipeline(index));
            return;
        }
    }
    let index = pipeline_kernels.len();
    pipeline_kernels.push(vec![kernel]);
    unit_of.insert(id, UnitId::Pipeline(index));
}

/// Convenience for tests: drain every buffer a compiled plan's sinks saw.
pub fn collect_buffer_rows(
    buffer: &TupleBuffer,
    schema: &dse_core::Schema,
) -> Vec<Vec<dse_core::Value>> {
    dse_core::rows(buffer, schema)
        .filter_map(|r| r.values().ok())
        .collect()
}
