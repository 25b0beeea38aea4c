//! Operator placement over the topology.
//!
//! Placement maps every operator of a shared plan onto exactly one
//! topology node, honoring slot budgets, then cuts each edge between
//! differently placed operators into a network sink/source pair bound to a
//! fresh partition. The result is one decomposed subplan per involved
//! worker; their union reconstructs the shared plan's operator set exactly
//! once.
//!
//! `BottomUp` pins sources to the workers hosting their physical
//! instances and keeps every downstream operator beside its input as long
//! as a slot is free, climbing toward the root otherwise. `TopDown` pins
//! sinks (and everything that is not a source) near the root and pushes
//! only the pinned sources out. The remaining strategy tags accepted at
//! submission fall back to one of these two.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use dse_core::{
    CoreError, CoreResult, IdGenerator, OperatorId, OriginId, Partition, PartitionId,
    PlacementStrategy, SubPlanId, TopologyNodeId,
};
use dse_plan::{
    DecomposedPlan, NetworkSinkDescriptor, NetworkSourceDescriptor, OperatorKind, QueryPlan,
    SharedQueryPlan,
};

use crate::catalog::SourceCatalog;
use crate::topology::Topology;

/// Subplans placed on one topology node.
#[derive(Debug, Clone)]
pub struct ExecutionNode {
    pub worker: TopologyNodeId,
    pub subplans: Vec<DecomposedPlan>,
}

/// The deployable outcome of placing one shared plan.
#[derive(Debug)]
pub struct GlobalExecutionPlan {
    pub shared_query_id: dse_core::SharedQueryId,
    pub nodes: HashMap<TopologyNodeId, ExecutionNode>,
    /// Operators placed per node, for slot bookkeeping.
    pub slots_by_node: HashMap<TopologyNodeId, u16>,
}

impl GlobalExecutionPlan {
    pub fn subplans(&self) -> impl Iterator<Item = &DecomposedPlan> {
        self.nodes.values().flat_map(|n| n.subplans.iter())
    }

    pub fn worker_ids(&self) -> Vec<TopologyNodeId> {
        let mut ids: Vec<TopologyNodeId> = self.nodes.keys().copied().collect();
        ids.sort();
        ids
    }
}

/// Map the submitted strategy onto an implemented placement behavior.
fn effective_strategy(strategy: PlacementStrategy) -> PlacementStrategy {
    match strategy {
        PlacementStrategy::BottomUp
        | PlacementStrategy::Ifcop
        | PlacementStrategy::ManualPlacement
        | PlacementStrategy::Ilp
        | PlacementStrategy::ElegantEnergy => PlacementStrategy::BottomUp,
        PlacementStrategy::TopDown
        | PlacementStrategy::ElegantPerformance
        | PlacementStrategy::ElegantBalanced => PlacementStrategy::TopDown,
    }
}

pub struct PlacementPhase;

impl PlacementPhase {
    pub fn place(
        shared: &SharedQueryPlan,
        topology: &Topology,
        sources: &SourceCatalog,
        subplan_ids: &IdGenerator,
    ) -> CoreResult<GlobalExecutionPlan> {
        let mut plan = shared.plan.clone();
        assign_source_origins(&mut plan);

        let strategy = effective_strategy(shared.strategy);
        let assignment = assign_operators(&plan, topology, sources, strategy)?;

        // one subplan id per involved node, known before edges are cut so
        // partitions can name their receiving subplan
        let mut subplan_of: HashMap<TopologyNodeId, SubPlanId> = HashMap::new();
        for node in assignment.values() {
            subplan_of
                .entry(*node)
                .or_insert_with(|| subplan_ids.next());
        }

        let mut slots_by_node: HashMap<TopologyNodeId, u16> = HashMap::new();
        for node in assignment.values() {
            *slots_by_node.entry(*node).or_insert(0) += 1;
        }

        let assignment = cut_network_edges(&mut plan, assignment, topology, &subplan_of)?;

        let query_ids = shared.query_ids();
        let mut nodes: HashMap<TopologyNodeId, ExecutionNode> = HashMap::new();
        for (&worker, &subplan_id) in &subplan_of {
            let keep: HashSet<OperatorId> = assignment
                .iter()
                .filter(|(_, n)| **n == worker)
                .map(|(op, _)| *op)
                .collect();
            let decomposed = DecomposedPlan::extract(
                subplan_id,
                shared.id,
                query_ids.clone(),
                worker,
                &plan,
                &keep,
            )?;
            nodes.insert(
                worker,
                ExecutionNode {
                    worker,
                    subplans: vec![decomposed],
                },
            );
        }

        debug!(
            shared = %shared.id,
            workers = nodes.len(),
            operators = plan.len(),
            "placement finished"
        );
        Ok(GlobalExecutionPlan {
            shared_query_id: shared.id,
            nodes,
            slots_by_node,
        })
    }
}

/// Sources originate streams; stamp their origin ids before decomposition.
fn assign_source_origins(plan: &mut QueryPlan) {
    for id in plan.ids().collect::<Vec<_>>() {
        if let OperatorKind::Source(desc) = &mut plan.node_mut(id).kind {
            if !desc.origin.is_valid() {
                desc.origin = OriginId::new(id.raw());
            }
        }
    }
}

fn assign_operators(
    plan: &QueryPlan,
    topology: &Topology,
    sources: &SourceCatalog,
    strategy: PlacementStrategy,
) -> CoreResult<HashMap<OperatorId, TopologyNodeId>> {
    let root = topology.root();
    let mut assignment: HashMap<OperatorId, TopologyNodeId> = HashMap::new();
    // local slot accounting on top of what the topology already uses
    let mut used: HashMap<TopologyNodeId, u16> = HashMap::new();
    let mut has_slot = |node: &Topology, id: TopologyNodeId, used: &mut HashMap<_, u16>| -> bool {
        let free = node
            .get(id)
            .map(|n| n.available_slots())
            .unwrap_or(0);
        let taken = used.entry(id).or_insert(0);
        if *taken < free || id == node.root() {
            *taken += 1;
            true
        } else {
            false
        }
    };

    for id in plan.topological()? {
        let node = plan.node(id);
        let placed = match &node.kind {
            OperatorKind::Source(desc) => {
                let providers: Vec<TopologyNodeId> = sources
                    .providers_of(&desc.logical_name)
                    .into_iter()
                    .filter(|w| {
                        topology
                            .get(*w)
                            .map(|n| !n.maintenance)
                            .unwrap_or(false)
                    })
                    .collect();
                let worker = providers.first().copied().ok_or_else(|| {
                    CoreError::NotFound(format!(
                        "no worker provides physical source for {}",
                        desc.logical_name
                    ))
                })?;
                let _ = has_slot(topology, worker, &mut used);
                worker
            }
            OperatorKind::Sink(_) | OperatorKind::NetworkSink(_) => {
                // user sinks run beside the coordinator
                let _ = has_slot(topology, root, &mut used);
                root
            }
            _ => match strategy {
                PlacementStrategy::BottomUp => {
                    let child_nodes: HashSet<TopologyNodeId> = node
                        .children
                        .iter()
                        .map(|c| assignment[c])
                        .collect();
                    if child_nodes.len() == 1 {
                        let candidate = *child_nodes.iter().next().expect("one element");
                        if has_slot(topology, candidate, &mut used) {
                            candidate
                        } else {
                            let _ = has_slot(topology, root, &mut used);
                            root
                        }
                    } else {
                        // branches meet at their lowest common ancestor;
                        // with star topologies that is the root
                        let _ = has_slot(topology, root, &mut used);
                        root
                    }
                }
                _ => {
                    let _ = has_slot(topology, root, &mut used);
                    root
                }
            },
        };
        assignment.insert(id, placed);
    }
    Ok(assignment)
}

/// Replace every cross-node edge with a network sink/source pair.
fn cut_network_edges(
    plan: &mut QueryPlan,
    mut assignment: HashMap<OperatorId, TopologyNodeId>,
    topology: &Topology,
    subplan_of: &HashMap<TopologyNodeId, SubPlanId>,
) -> CoreResult<HashMap<OperatorId, TopologyNodeId>> {
    let partition_ids = IdGenerator::new();
    let edges: Vec<(OperatorId, OperatorId)> = plan
        .ids()
        .flat_map(|id| {
            plan.node(id)
                .parents
                .iter()
                .map(move |p| (id, *p))
                .collect::<Vec<_>>()
        })
        .collect();

    for (child, parent) in edges {
        let from = assignment[&child];
        let to = assignment[&parent];
        if from == to {
            continue;
        }
        let receiver = topology.node(to)?;
        let receiver_subplan = subplan_of[&to];

        let schema = plan.node(child).output_schema.clone();
        let origins = origins_below(plan, child);

        let net_source = plan.add(OperatorKind::NetworkSource(NetworkSourceDescriptor {
            partition: Partition::new(receiver_subplan, OperatorId::INVALID, PartitionId::INVALID),
            schema: schema.clone(),
            origins,
        }));
        // the partition names the network source operator itself
        let partition = Partition::new(
            receiver_subplan,
            net_source,
            partition_ids.next::<PartitionId>(),
        );
        if let OperatorKind::NetworkSource(desc) = &mut plan.node_mut(net_source).kind {
            desc.partition = partition;
        }
        let net_sink = plan.add(OperatorKind::NetworkSink(NetworkSinkDescriptor {
            partition,
            target_host: receiver.address.clone(),
            target_port: receiver.data_port,
        }));
        plan.node_mut(net_source).output_schema = schema.clone();
        plan.node_mut(net_sink).output_schema = schema;

        // child -> net_sink | net_source -> parent
        plan.insert_between(parent, child, net_source);
        plan.connect(net_sink, child);
        assignment.insert(net_sink, from);
        assignment.insert(net_source, to);
        debug!(%child, %parent, %partition, "network edge inserted");
    }
    Ok(assignment)
}

/// Origins whose buffers can reach `of`'s output within this plan.
fn origins_below(plan: &QueryPlan, of: OperatorId) -> Vec<OriginId> {
    let mut origins = HashSet::new();
    let mut stack = vec![of];
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let node = plan.node(id);
        match &node.kind {
            OperatorKind::Source(desc) => {
                origins.insert(desc.origin);
                continue;
            }
            OperatorKind::NetworkSource(desc) => {
                origins.extend(desc.origins.iter().copied());
                continue;
            }
            OperatorKind::Window(_) | OperatorKind::Join(_) if id != of => {
                origins.insert(OriginId::new(id.raw()));
                continue;
            }
            _ => {}
        }
        stack.extend(node.children.iter().copied());
    }
    let mut out: Vec<OriginId> = origins.into_iter().collect();
    out.sort();
    out
}

/// Debug check: the union of the placed subplans is the shared plan's
/// operator set, each exactly once.
pub fn verify_exactly_once(
    shared_ops: &HashSet<OperatorId>,
    execution: &GlobalExecutionPlan,
) -> CoreResult<()> {
    let mut seen: HashMap<OperatorId, usize> = HashMap::new();
    for subplan in execution.subplans() {
        for id in subplan.plan.ids() {
            *seen.entry(id).or_insert(0) += 1;
        }
    }
    for op in shared_ops {
        match seen.get(op) {
            Some(1) => {}
            Some(n) => {
                return Err(CoreError::Deployment(format!(
                    "operator {op} placed {n} times"
                )))
            }
            None => {
                return Err(CoreError::Deployment(format!("operator {op} not placed")))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PhysicalSourceEntry;
    use dse_core::types::{DataType, Field, Schema};
    use dse_core::{Expr, QueryId, SharedQueryId};
    use dse_plan::{attach_source_schemas, infer_schemas, Query, SinkDescriptor};
    use std::collections::BTreeMap;

    fn setup() -> (Topology, SourceCatalog, Vec<TopologyNodeId>) {
        let mut topology = Topology::new("127.0.0.1".into(), 8081, 8082, 64);
        let workers: Vec<TopologyNodeId> = (0..2)
            .map(|i| {
                topology.register_worker(
                    None,
                    "127.0.0.1".into(),
                    9000 + i,
                    9500 + i,
                    8,
                    BTreeMap::new(),
                    None,
                )
            })
            .collect();
        let mut sources = SourceCatalog::default();
        sources
            .register_logical(
                "default_logical",
                Schema::new(vec![
                    Field::new("id", DataType::Int32),
                    Field::new("value", DataType::Int64),
                ]),
            )
            .unwrap();
        sources
            .register_physical(PhysicalSourceEntry {
                logical_name: "default_logical".into(),
                physical_name: "default_physical".into(),
                source_type: "generator".into(),
                worker: workers[0],
            })
            .unwrap();
        (topology, sources, workers)
    }

    fn shared_plan() -> SharedQueryPlan {
        let mut plan = Query::from("default_logical")
            .filter(Expr::field("value").lt(Expr::lit(42i64)))
            .sink(SinkDescriptor::Print)
            .into_plan();
        plan.query_id = QueryId::new(1);
        attach_source_schemas(&mut plan, |_| {
            Some(Schema::new(vec![
                Field::new("id", DataType::Int32),
                Field::new("value", DataType::Int64),
            ]))
        })
        .unwrap();
        infer_schemas(&mut plan).unwrap();
        SharedQueryPlan::new(
            SharedQueryId::new(1),
            dse_core::PlacementStrategy::BottomUp,
            QueryId::new(1),
            plan,
        )
    }

    #[test]
    fn bottom_up_splits_at_the_sink_and_cuts_the_edge() {
        let (topology, sources, workers) = setup();
        let shared = shared_plan();
        let shared_ops: HashSet<OperatorId> = shared.plan.ids().collect();
        let ids = IdGenerator::new();

        let execution = PlacementPhase::place(&shared, &topology, &sources, &ids).unwrap();
        // source + filter on the worker, sink at the root
        assert_eq!(execution.worker_ids(), vec![topology.root(), workers[0]]);
        verify_exactly_once(&shared_ops, &execution).unwrap();

        let worker_subplan = &execution.nodes[&workers[0]].subplans[0];
        let kinds: Vec<&str> = worker_subplan
            .plan
            .topological()
            .unwrap()
            .iter()
            .map(|id| worker_subplan.plan.node(*id).kind.name())
            .collect();
        assert_eq!(kinds, vec!["source", "filter", "network_sink"]);

        let root_subplan = &execution.nodes[&topology.root()].subplans[0];
        let kinds: Vec<&str> = root_subplan
            .plan
            .topological()
            .unwrap()
            .iter()
            .map(|id| root_subplan.plan.node(*id).kind.name())
            .collect();
        assert_eq!(kinds, vec!["network_source", "sink"]);

        // the cut pair agrees on the partition
        let sink_partition = worker_subplan
            .plan
            .ids()
            .find_map(|id| match &worker_subplan.plan.node(id).kind {
                OperatorKind::NetworkSink(d) => Some(d.partition),
                _ => None,
            })
            .unwrap();
        let source_partition = root_subplan
            .plan
            .ids()
            .find_map(|id| match &root_subplan.plan.node(id).kind {
                OperatorKind::NetworkSource(d) => Some(d.partition),
                _ => None,
            })
            .unwrap();
        assert_eq!(sink_partition, source_partition);
        assert_eq!(sink_partition.subplan, root_subplan.subplan_id);
    }

    #[test]
    fn missing_physical_source_fails_placement() {
        let (topology, _empty_sources, _) = setup();
        let shared = shared_plan();
        let ids = IdGenerator::new();
        let empty = SourceCatalog::default();
        let err = PlacementPhase::place(&shared, &topology, &empty, &ids).unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn network_source_carries_upstream_origins() {
        let (topology, sources, workers) = setup();
        let shared = shared_plan();
        let ids = IdGenerator::new();
        let execution = PlacementPhase::place(&shared, &topology, &sources, &ids).unwrap();
        let root_subplan = &execution.nodes[&topology.root()].subplans[0];
        let origins = root_subplan
            .plan
            .ids()
            .find_map(|id| match &root_subplan.plan.node(id).kind {
                OperatorKind::NetworkSource(d) => Some(d.origins.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(origins.len(), 1);
        let _ = workers;
    }

    #[test]
    fn slot_budget_pushes_operators_to_the_root() {
        let (mut topology, sources, workers) = setup();
        // exhaust the worker's slots: only the pinned source stays
        topology.get_mut(workers[0]).unwrap().slots_total = 1;
        let shared = shared_plan();
        let ids = IdGenerator::new();
        let execution = PlacementPhase::place(&shared, &topology, &sources, &ids).unwrap();
        let worker_subplan = &execution.nodes[&workers[0]].subplans[0];
        let kinds: Vec<&str> = worker_subplan
            .plan
            .topological()
            .unwrap()
            .iter()
            .map(|id| worker_subplan.plan.node(*id).kind.name())
            .collect();
        // filter no longer fits beside the source
        assert_eq!(kinds, vec!["source", "network_sink"]);
    }
}
