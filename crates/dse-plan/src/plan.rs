//! The logical plan arena.
//!
//! Operators live in a slot vector addressed by their `OperatorId`;
//! parent/child edges are id lists on the nodes. Traversal uses explicit
//! work queues, removal unlinks a node from every neighbor, and edge
//! surgery keeps the branch order of binary operators intact.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use dse_core::{CoreError, CoreResult, OperatorId, QueryId};

use crate::operator::{OperatorKind, OperatorNode};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPlan {
    pub query_id: QueryId,
    /// Slot arena; tombstones stay `None` so ids remain stable.
    nodes: Vec<Option<OperatorNode>>,
    /// Next operator id, continuing after deserialization.
    next_id: u64,
}

impl QueryPlan {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            nodes: Vec::new(),
            next_id: 1,
        }
    }

    fn slot(&self, id: OperatorId) -> usize {
        // INVALID (0) maps past the arena and resolves to None.
        id.raw()
            .checked_sub(1)
            .map(|v| v as usize)
            .unwrap_or(usize::MAX)
    }

    pub fn add(&mut self, kind: OperatorKind) -> OperatorId {
        let id = OperatorId::new(self.next_id);
        self.next_id += 1;
        self.nodes.push(Some(OperatorNode {
            id,
            kind,
            parents: Vec::new(),
            children: Vec::new(),
            output_schema: Default::default(),
        }));
        id
    }

    pub fn get(&self, id: OperatorId) -> Option<&OperatorNode> {
        self.nodes.get(self.slot(id)).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: OperatorId) -> Option<&mut OperatorNode> {
        let slot = self.slot(id);
        self.nodes.get_mut(slot).and_then(|s| s.as_mut())
    }

    pub fn node(&self, id: OperatorId) -> &OperatorNode {
        self.get(id).expect("operator id not in plan")
    }

    pub fn node_mut(&mut self, id: OperatorId) -> &mut OperatorNode {
        self.get_mut(id).expect("operator id not in plan")
    }

    pub fn contains(&self, id: OperatorId) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> impl Iterator<Item = OperatorId> + '_ {
        self.nodes.iter().flatten().map(|n| n.id)
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sinks and any other node nothing consumes.
    pub fn roots(&self) -> Vec<OperatorId> {
        self.nodes
            .iter()
            .flatten()
            .filter(|n| n.parents.is_empty())
            .map(|n| n.id)
            .collect()
    }

    /// Sources: nodes with no inputs.
    pub fn leaves(&self) -> Vec<OperatorId> {
        self.nodes
            .iter()
            .flatten()
            .filter(|n| n.children.is_empty())
            .map(|n| n.id)
            .collect()
    }

    /// Connect `child`'s output into `parent`'s inputs (appended as the
    /// last branch).
    pub fn connect(&mut self, parent: OperatorId, child: OperatorId) {
        if !self.node(parent).children.contains(&child) {
            self.node_mut(parent).children.push(child);
        }
        if !self.node(child).parents.contains(&parent) {
            self.node_mut(child).parents.push(parent);
        }
    }

    pub fn disconnect(&mut self, parent: OperatorId, child: OperatorId) {
        self.node_mut(parent).children.retain(|&c| c != child);
        self.node_mut(child).parents.retain(|&p| p != parent);
    }

    /// Swap `old` for `new` in `parent`'s child list, keeping the branch
    /// position. Required below binary operators where order is meaning.
    pub fn replace_child(&mut self, parent: OperatorId, old: OperatorId, new: OperatorId) {
        let children = &mut self.node_mut(parent).children;
        if let Some(pos) = children.iter().position(|&c| c == old) {
            children[pos] = new;
        }
        self.node_mut(old).parents.retain(|&p| p != parent);
        if !self.node(new).parents.contains(&parent) {
            self.node_mut(new).parents.push(parent);
        }
    }

    /// Splice `node` onto the edge `parent -> child`.
    pub fn insert_between(&mut self, parent: OperatorId, child: OperatorId, node: OperatorId) {
        self.replace_child(parent, child, node);
        self.connect(node, child);
    }

    /// Detach a unary node, wiring its parents directly to its input while
    /// keeping every parent's branch position.
    pub fn detach_unary(&mut self, id: OperatorId) -> CoreResult<()> {
        let node = self.node(id).clone();
        if node.children.len() != 1 {
            return Err(CoreError::Validation(format!(
                "cannot detach operator {id} with {} inputs",
                node.children.len()
            )));
        }
        let child = node.children[0];
        for parent in node.parents.clone() {
            self.replace_child(parent, id, child);
        }
        self.disconnect(id, child);
        Ok(())
    }

    /// Remove a node entirely, unlinking it from all neighbors.
    pub fn remove(&mut self, id: OperatorId) {
        let Some(node) = self.get(id).cloned() else {
            return;
        };
        for parent in node.parents {
            self.node_mut(parent).children.retain(|&c| c != id);
        }
        for child in node.children {
            self.node_mut(child).parents.retain(|&p| p != id);
        }
        let slot = self.slot(id);
        self.nodes[slot] = None;
    }

    /// Redirect every consumer of `from` to `to` (equality merge).
    pub fn redirect_parents(&mut self, from: OperatorId, to: OperatorId) {
        let parents = self.node(from).parents.clone();
        for parent in parents {
            self.replace_child(parent, from, to);
        }
    }

    /// Breadth-first walk from the roots down through inputs.
    pub fn bfs_from_roots(&self) -> Vec<OperatorId> {
        self.bfs(self.roots(), |n| n.children.clone())
    }

    /// Breadth-first walk from the sources up through consumers.
    pub fn bfs_from_leaves(&self) -> Vec<OperatorId> {
        self.bfs(self.leaves(), |n| n.parents.clone())
    }

    fn bfs(
        &self,
        start: Vec<OperatorId>,
        next: impl Fn(&OperatorNode) -> Vec<OperatorId>,
    ) -> Vec<OperatorId> {
        let mut queue: VecDeque<OperatorId> = start.into();
        let mut seen: HashSet<OperatorId> = queue.iter().copied().collect();
        let mut order = Vec::new();
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for n in next(self.node(id)) {
                if seen.insert(n) {
                    queue.push_back(n);
                }
            }
        }
        order
    }

    /// Inputs-before-consumers order; errors on a cycle.
    pub fn topological(&self) -> CoreResult<Vec<OperatorId>> {
        let mut in_degree: Vec<(OperatorId, usize)> = self
            .nodes
            .iter()
            .flatten()
            .map(|n| (n.id, n.children.len()))
            .collect();
        let mut queue: VecDeque<OperatorId> = in_degree
            .iter()
            .filter(|(_, d)| *d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::new();
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for parent in self.node(id).parents.clone() {
                let entry = in_degree
                    .iter_mut()
                    .find(|(pid, _)| *pid == parent)
                    .expect("parent in arena");
                entry.1 -= 1;
                if entry.1 == 0 {
                    queue.push_back(parent);
                }
            }
        }
        if order.len() != self.len() {
            return Err(CoreError::Validation("plan graph is cyclic".into()));
        }
        Ok(order)
    }

    /// Structural invariants: acyclic, non-sources have inputs, binary
    /// operators have exactly two ordered branches.
    pub fn validate(&self) -> CoreResult<()> {
        self.topological()?;
        for node in self.nodes.iter().flatten() {
            if !node.kind.is_source() && node.children.is_empty() {
                return Err(CoreError::Validation(format!(
                    "{} operator {} has no input",
                    node.kind.name(),
                    node.id
                )));
            }
            if node.kind.is_binary() && node.children.len() != 2 {
                return Err(CoreError::Validation(format!(
                    "{} operator {} needs two branches, has {}",
                    node.kind.name(),
                    node.id,
                    node.children.len()
                )));
            }
            if node.kind.is_source() && !node.children.is_empty() {
                return Err(CoreError::Validation(format!(
                    "source operator {} must not have inputs",
                    node.id
                )));
            }
        }
        Ok(())
    }

    /// Copy the subgraph `keep` into a fresh plan, preserving operator ids
    /// and dropping edges that leave the set.
    pub fn extract(&self, keep: &HashSet<OperatorId>) -> QueryPlan {
        let mut out = QueryPlan::new(self.query_id);
        out.next_id = self.next_id;
        out.nodes = self
            .nodes
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .filter(|n| keep.contains(&n.id))
                    .map(|n| {
                        let mut n = n.clone();
                        n.parents.retain(|p| keep.contains(p));
                        n.children.retain(|c| keep.contains(c));
                        n
                    })
            })
            .collect();
        out
    }

    /// Absorb every node of `other`, remapping its ids to fresh ones.
    /// Returns the id mapping so callers can track roots across the move.
    pub fn absorb(&mut self, other: &QueryPlan) -> std::collections::HashMap<OperatorId, OperatorId> {
        let mut mapping = std::collections::HashMap::new();
        for node in other.nodes.iter().flatten() {
            let new_id = self.add(node.kind.clone());
            self.node_mut(new_id).output_schema = node.output_schema.clone();
            mapping.insert(node.id, new_id);
        }
        for node in other.nodes.iter().flatten() {
            for child in &node.children {
                self.connect(mapping[&node.id], mapping[child]);
            }
        }
        mapping
    }
}
