//! The worker topology.
//!
//! A DAG of worker nodes rooted at the coordinator's own node (id 1).
//! Every node carries its RPC coordinates, a slot budget for placed
//! operators, a property map and an optional geolocation for mobile
//! workers. Nodes under maintenance stay in the graph but are skipped by
//! path search and placement.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::{info, warn};

use dse_core::rpc::GeoLocation;
use dse_core::{CoreError, CoreResult, IdGenerator, TopologyNodeId};

#[derive(Debug, Clone)]
pub struct TopologyNode {
    pub id: TopologyNodeId,
    pub address: String,
    pub control_port: u16,
    pub data_port: u16,
    pub slots_total: u16,
    pub slots_used: u16,
    pub properties: BTreeMap<String, String>,
    pub maintenance: bool,
    pub location: Option<GeoLocation>,
    pub parents: Vec<TopologyNodeId>,
    pub children: Vec<TopologyNodeId>,
}

impl TopologyNode {
    pub fn available_slots(&self) -> u16 {
        self.slots_total.saturating_sub(self.slots_used)
    }

    pub fn control_url(&self) -> String {
        format!("http://{}:{}", self.address, self.control_port)
    }
}

pub struct Topology {
    nodes: HashMap<TopologyNodeId, TopologyNode>,
    root: TopologyNodeId,
    ids: IdGenerator,
}

impl Topology {
    /// Create the topology with the coordinator's own node as root.
    pub fn new(root_address: String, control_port: u16, data_port: u16, root_slots: u16) -> Self {
        let ids = IdGenerator::new();
        let root: TopologyNodeId = ids.next();
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            TopologyNode {
                id: root,
                address: root_address,
                control_port,
                data_port,
                slots_total: root_slots,
                slots_used: 0,
                properties: BTreeMap::new(),
                maintenance: false,
                location: None,
                parents: Vec::new(),
                children: Vec::new(),
            },
        );
        Self { nodes, root, ids }
    }

    pub fn root(&self) -> TopologyNodeId {
        self.root
    }

    pub fn get(&self, id: TopologyNodeId) -> Option<&TopologyNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: TopologyNodeId) -> Option<&mut TopologyNode> {
        self.nodes.get_mut(&id)
    }

    pub fn node(&self, id: TopologyNodeId) -> CoreResult<&TopologyNode> {
        self.nodes
            .get(&id)
            .ok_or_else(|| CoreError::NotFound(format!("topology node {id}")))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = TopologyNodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Register a worker below the root. A worker restarting with a known
    /// id keeps it; an unknown or absent id gets a fresh one.
    pub fn register_worker(
        &mut self,
        requested: Option<TopologyNodeId>,
        address: String,
        control_port: u16,
        data_port: u16,
        slots: u16,
        properties: BTreeMap<String, String>,
        location: Option<GeoLocation>,
    ) -> TopologyNodeId {
        if let Some(id) = requested.filter(|id| self.nodes.contains_key(id)) {
            let node = self.nodes.get_mut(&id).expect("checked above");
            node.address = address;
            node.control_port = control_port;
            node.data_port = data_port;
            node.slots_total = slots;
            node.location = location;
            info!(%id, "worker re-registered");
            return id;
        }
        let id: TopologyNodeId = self.ids.next();
        self.nodes.insert(
            id,
            TopologyNode {
                id,
                address,
                control_port,
                data_port,
                slots_total: slots,
                slots_used: 0,
                properties,
                maintenance: false,
                location,
                parents: vec![self.root],
                children: Vec::new(),
            },
        );
        self.nodes
            .get_mut(&self.root)
            .expect("root exists")
            .children
            .push(id);
        info!(%id, "worker registered");
        id
    }

    /// Remove a node and unlink it from every neighbor. The root cannot be
    /// removed.
    pub fn remove_node(&mut self, id: TopologyNodeId) -> CoreResult<()> {
        if id == self.root {
            return Err(CoreError::Validation("cannot remove the root node".into()));
        }
        let node = self
            .nodes
            .remove(&id)
            .ok_or_else(|| CoreError::NotFound(format!("topology node {id}")))?;
        for parent in node.parents {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.retain(|&c| c != id);
            }
        }
        for child in node.children {
            if let Some(c) = self.nodes.get_mut(&child) {
                c.parents.retain(|&p| p != id);
            }
        }
        info!(%id, "worker removed");
        Ok(())
    }

    pub fn add_link(&mut self, parent: TopologyNodeId, child: TopologyNodeId) -> CoreResult<()> {
        self.node(parent)?;
        self.node(child)?;
        let p = self.nodes.get_mut(&parent).expect("checked");
        if !p.children.contains(&child) {
            p.children.push(child);
        }
        let c = self.nodes.get_mut(&child).expect("checked");
        if !c.parents.contains(&parent) {
            c.parents.push(parent);
        }
        Ok(())
    }

    pub fn remove_link(&mut self, parent: TopologyNodeId, child: TopologyNodeId) -> CoreResult<()> {
        self.node(parent)?;
        self.node(child)?;
        self.nodes
            .get_mut(&parent)
            .expect("checked")
            .children
            .retain(|&c| c != child);
        self.nodes
            .get_mut(&child)
            .expect("checked")
            .parents
            .retain(|&p| p != parent);
        Ok(())
    }

    /// Swap a mobile worker's uplink. Only single-parent workers are
    /// supported on this path.
    pub fn replace_parent(
        &mut self,
        child: TopologyNodeId,
        old_parent: TopologyNodeId,
        new_parent: TopologyNodeId,
    ) -> CoreResult<()> {
        let parents = self.node(child)?.parents.clone();
        if parents.len() > 1 {
            warn!(%child, "replace_parent on a multi-parent worker; only the given link moves");
        }
        if !parents.contains(&old_parent) {
            return Err(CoreError::NotFound(format!(
                "{old_parent} is not a parent of {child}"
            )));
        }
        self.remove_link(old_parent, child)?;
        self.add_link(new_parent, child)
    }

    pub fn parents_of(&self, id: TopologyNodeId) -> CoreResult<Vec<TopologyNodeId>> {
        Ok(self.node(id)?.parents.clone())
    }

    /// Breadth-first path from `from` up to `to`, skipping nodes under
    /// maintenance.
    pub fn find_path(
        &self,
        from: TopologyNodeId,
        to: TopologyNodeId,
    ) -> Option<Vec<TopologyNodeId>> {
        let mut queue = VecDeque::from([from]);
        let mut visited: HashSet<TopologyNodeId> = HashSet::from([from]);
        let mut came_from: HashMap<TopologyNodeId, TopologyNodeId> = HashMap::new();
        while let Some(id) = queue.pop_front() {
            if id == to {
                let mut path = vec![to];
                let mut cursor = to;
                while let Some(&prev) = came_from.get(&cursor) {
                    path.push(prev);
                    cursor = prev;
                }
                path.reverse();
                return Some(path);
            }
            let node = self.nodes.get(&id)?;
            for &parent in &node.parents {
                let skip = self
                    .nodes
                    .get(&parent)
                    .map(|p| p.maintenance && parent != to)
                    .unwrap_or(true);
                if !skip && visited.insert(parent) {
                    came_from.insert(parent, id);
                    queue.push_back(parent);
                }
            }
        }
        None
    }

    pub fn occupy_slot(&mut self, id: TopologyNodeId) -> CoreResult<()> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("topology node {id}")))?;
        if node.available_slots() == 0 {
            return Err(CoreError::Deployment(format!(
                "node {id} has no free slots"
            )));
        }
        node.slots_used += 1;
        Ok(())
    }

    pub fn release_slots(&mut self, id: TopologyNodeId, count: u16) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.slots_used = node.slots_used.saturating_sub(count);
        }
    }

    pub fn set_location(&mut self, id: TopologyNodeId, location: GeoLocation) -> CoreResult<()> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("topology node {id}")))?
            .location = Some(location);
        Ok(())
    }

    /// Every node with a known position within `radius_km` of `center`.
    pub fn nodes_in_range(
        &self,
        center: &GeoLocation,
        radius_km: f64,
    ) -> Vec<(TopologyNodeId, GeoLocation)> {
        let mut result: Vec<(TopologyNodeId, GeoLocation)> = self
            .nodes
            .values()
            .filter_map(|n| {
                let loc = n.location?;
                (loc.distance_km(center) <= radius_km).then_some((n.id, loc))
            })
            .collect();
        result.sort_by_key(|(id, _)| *id);
        result
    }
}
