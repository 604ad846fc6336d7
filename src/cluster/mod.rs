// Cluster mapping: which node carries which partition in which role.
//
// The mapper holds this node's identity, the route table and the
// partition map. Map changes always arrive as a full snapshot broadcast
// by the acting sentinel and are applied under the global suspend
// barrier; local partitions that fall out of the map are retired through
// the zombie list.

pub mod sentinel;

use crate::common::{hash_str, now_ms};
use crate::Services;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Free,
    ActiveOwner,
    ActiveClone,
    ActivePlaceholder,
    Failed,
}

impl NodeState {
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            NodeState::ActiveOwner | NodeState::ActiveClone | NodeState::ActivePlaceholder
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteInfo {
    pub node_id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub failed_since: i64,
}

impl RouteInfo {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Full-cluster state shipped in map broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapSnapshot {
    pub partition_max: usize,
    pub partitions: Vec<(usize, i64, NodeState)>,
    pub routes: Vec<RouteInfo>,
    pub stamp: i64,
}

#[derive(Default)]
pub struct PartitionMap {
    cells: RwLock<HashMap<usize, HashMap<i64, NodeState>>>,
}

impl PartitionMap {
    pub fn set_state(&self, partition: usize, node: i64, state: NodeState) {
        self.cells
            .write()
            .entry(partition)
            .or_default()
            .insert(node, state);
    }

    /// Make `node` the owner, demoting any existing owner to clone.
    pub fn set_owner(&self, partition: usize, node: i64) {
        let mut cells = self.cells.write();
        let entry = cells.entry(partition).or_default();
        for (existing, state) in entry.iter_mut() {
            if *state == NodeState::ActiveOwner && *existing != node {
                *state = NodeState::ActiveClone;
            }
        }
        entry.insert(node, NodeState::ActiveOwner);
    }

    pub fn remove(&self, partition: usize, node: i64) {
        if let Some(entry) = self.cells.write().get_mut(&partition) {
            entry.remove(&node);
        }
    }

    pub fn get_state(&self, partition: usize, node: i64) -> NodeState {
        self.cells
            .read()
            .get(&partition)
            .and_then(|entry| entry.get(&node))
            .copied()
            .unwrap_or(NodeState::Free)
    }

    pub fn is_mapped(&self, partition: usize, node: i64) -> bool {
        self.get_state(partition, node).is_live()
    }

    pub fn owner_of(&self, partition: usize) -> Option<i64> {
        self.cells.read().get(&partition).and_then(|entry| {
            entry
                .iter()
                .find(|(_, state)| **state == NodeState::ActiveOwner)
                .map(|(node, _)| *node)
        })
    }

    pub fn nodes_by_partition(&self, partition: usize) -> Vec<(i64, NodeState)> {
        self.cells
            .read()
            .get(&partition)
            .map(|entry| entry.iter().map(|(n, s)| (*n, *s)).collect())
            .unwrap_or_default()
    }

    pub fn partitions_by_node(&self, node: i64) -> Vec<usize> {
        self.cells
            .read()
            .iter()
            .filter(|(_, entry)| entry.get(&node).map(|s| s.is_live()).unwrap_or(false))
            .map(|(partition, _)| *partition)
            .collect()
    }

    /// Partitions lacking `replicas` nodes in any of `states`.
    pub fn missing_partitions(
        &self,
        partition_max: usize,
        states: &[NodeState],
        replicas: usize,
    ) -> Vec<usize> {
        let cells = self.cells.read();
        (0..partition_max)
            .filter(|partition| {
                let found = cells
                    .get(partition)
                    .map(|entry| {
                        entry
                            .values()
                            .filter(|state| states.contains(state))
                            .count()
                    })
                    .unwrap_or(0);
                found < replicas
            })
            .collect()
    }

    pub fn is_complete(&self, partition_max: usize, states: &[NodeState], replicas: usize) -> bool {
        self.missing_partitions(partition_max, states, replicas)
            .is_empty()
    }

    /// Count of partitions in `state` per node.
    pub fn counts_by_node(&self, state: NodeState) -> HashMap<i64, usize> {
        let mut counts = HashMap::new();
        for entry in self.cells.read().values() {
            for (node, node_state) in entry {
                if *node_state == state {
                    *counts.entry(*node).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    pub fn purge_node(&self, node: i64) {
        for entry in self.cells.write().values_mut() {
            entry.remove(&node);
        }
    }

    pub fn purge_by_state(&self, state: NodeState) {
        for entry in self.cells.write().values_mut() {
            entry.retain(|_, s| *s != state);
        }
    }

    pub fn snapshot(&self) -> Vec<(usize, i64, NodeState)> {
        let mut out = Vec::new();
        for (partition, entry) in self.cells.read().iter() {
            for (node, state) in entry {
                out.push((*partition, *node, *state));
            }
        }
        out.sort();
        out
    }

    pub fn replace(&self, snapshot: &[(usize, i64, NodeState)]) {
        let mut cells = HashMap::new();
        for (partition, node, state) in snapshot {
            cells
                .entry(*partition)
                .or_insert_with(HashMap::new)
                .insert(*node, *state);
        }
        *self.cells.write() = cells;
    }
}

pub struct Mapper {
    node_id: AtomicI64,
    node_name: RwLock<String>,
    pub partition_map: PartitionMap,
    routes: RwLock<HashMap<i64, RouteInfo>>,
    last_map_change: AtomicI64,
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Mapper {
    pub fn new() -> Self {
        Self {
            node_id: AtomicI64::new(0),
            node_name: RwLock::new(String::new()),
            partition_map: PartitionMap::default(),
            routes: RwLock::new(HashMap::new()),
            last_map_change: AtomicI64::new(0),
        }
    }

    /// Node identity is the hash of its advertised name (host:port).
    pub fn set_identity(&self, host: &str, port: u16) -> i64 {
        let name = format!("{host}:{port}");
        let node_id = hash_str(&name);
        self.node_id.store(node_id, Ordering::SeqCst);
        *self.node_name.write() = name;
        node_id
    }

    pub fn node_id(&self) -> i64 {
        self.node_id.load(Ordering::SeqCst)
    }

    pub fn node_name(&self) -> String {
        self.node_name.read().clone()
    }

    pub fn is_mapped_locally(&self, partition: usize) -> bool {
        self.partition_map.is_mapped(partition, self.node_id())
    }

    pub fn local_state(&self, partition: usize) -> NodeState {
        self.partition_map.get_state(partition, self.node_id())
    }

    pub fn add_route(&self, route: RouteInfo) {
        self.routes.write().insert(route.node_id, route);
    }

    pub fn remove_route(&self, node_id: i64) {
        self.routes.write().remove(&node_id);
    }

    pub fn get_route(&self, node_id: i64) -> Option<RouteInfo> {
        self.routes.read().get(&node_id).cloned()
    }

    pub fn routes(&self) -> Vec<RouteInfo> {
        self.routes.read().values().cloned().collect()
    }

    pub fn count_routes(&self) -> usize {
        self.routes.read().len()
    }

    pub fn count_active_routes(&self) -> usize {
        self.routes.read().values().filter(|r| !r.failed).count()
    }

    pub fn mark_route_failed(&self, node_id: i64) {
        if let Some(route) = self.routes.write().get_mut(&node_id) {
            if !route.failed {
                route.failed = true;
                route.failed_since = now_ms();
            }
        }
    }

    pub fn clear_route_failure(&self, node_id: i64) {
        if let Some(route) = self.routes.write().get_mut(&node_id) {
            route.failed = false;
            route.failed_since = 0;
        }
    }

    pub fn failed_routes(&self) -> Vec<RouteInfo> {
        self.routes
            .read()
            .values()
            .filter(|r| r.failed)
            .cloned()
            .collect()
    }

    /// The acting sentinel is the live node with the lowest id.
    pub fn sentinel_id(&self) -> i64 {
        self.routes
            .read()
            .values()
            .filter(|r| !r.failed)
            .map(|r| r.node_id)
            .min()
            .unwrap_or(self.node_id())
    }

    pub fn set_map_changed(&self) {
        self.last_map_change.store(now_ms(), Ordering::SeqCst);
    }

    /// Did a map change land inside [start, end]? Queries overlapping a
    /// change are re-forked.
    pub fn was_during_map_change(&self, start: i64, end: i64) -> bool {
        let changed = self.last_map_change.load(Ordering::SeqCst);
        changed >= start && changed <= end
    }

    pub fn make_snapshot(&self, partition_max: usize) -> MapSnapshot {
        MapSnapshot {
            partition_max,
            partitions: self.partition_map.snapshot(),
            routes: self.routes(),
            stamp: now_ms(),
        }
    }
}

/// Apply a broadcast snapshot: suspend the pool, diff partitions in and
/// out, swap routes, resume. Local partitions leaving the map are moved
/// to the zombie list via `free_partition`.
pub fn apply_map_snapshot(services: &Arc<Services>, snapshot: &MapSnapshot) {
    let mapper = &services.mapper;
    let node_id = mapper.node_id();

    services.pool.suspend_async();

    let before: HashSet<usize> = mapper
        .partition_map
        .partitions_by_node(node_id)
        .into_iter()
        .collect();

    mapper.partition_map.replace(&snapshot.partitions);
    {
        let mut routes = mapper.routes.write();
        routes.clear();
        for route in &snapshot.routes {
            routes.insert(route.node_id, route.clone());
        }
    }
    services.pool.set_partition_max(snapshot.partition_max);

    let after: HashSet<usize> = mapper
        .partition_map
        .partitions_by_node(node_id)
        .into_iter()
        .collect();

    for &partition in after.difference(&before) {
        services.pool.init_partition(partition);
        for table in services.db.tables() {
            table.get_partition_objects(services, partition, true);
        }
    }
    for &partition in before.difference(&after) {
        services.pool.free_partition(partition);
        for table in services.db.tables() {
            table.release_partition(partition);
        }
    }

    mapper.set_map_changed();
    services.pool.resume_async();

    if let Some(dir) = &services.config.data_dir {
        if let Ok(body) = serde_json::to_vec_pretty(snapshot) {
            let _ = std::fs::write(dir.join("cluster.json"), body);
        }
    }
    info!(
        partitions = snapshot.partition_max,
        routes = snapshot.routes.len(),
        "applied cluster map"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_promotion_demotes_previous() {
        let map = PartitionMap::default();
        map.set_owner(0, 100);
        map.set_state(0, 200, NodeState::ActiveClone);
        map.set_owner(0, 200);
        assert_eq!(map.get_state(0, 200), NodeState::ActiveOwner);
        assert_eq!(map.get_state(0, 100), NodeState::ActiveClone);
        assert_eq!(map.owner_of(0), Some(200));
    }

    #[test]
    fn test_missing_partitions() {
        let map = PartitionMap::default();
        map.set_owner(0, 100);
        map.set_owner(2, 100);
        let missing = map.missing_partitions(3, &[NodeState::ActiveOwner], 1);
        assert_eq!(missing, vec![1]);
        assert!(!map.is_complete(3, &[NodeState::ActiveOwner], 1));
    }

    #[test]
    fn test_snapshot_replace_round_trip() {
        let map = PartitionMap::default();
        map.set_owner(0, 100);
        map.set_state(1, 200, NodeState::ActiveClone);
        let snapshot = map.snapshot();

        let other = PartitionMap::default();
        other.replace(&snapshot);
        assert_eq!(other.snapshot(), snapshot);
    }

    #[test]
    fn test_sentinel_is_lowest_live_node() {
        let mapper = Mapper::new();
        for (id, port) in [(500i64, 1u16), (100, 2), (300, 3)] {
            mapper.add_route(RouteInfo {
                node_id: id,
                name: format!("n{id}"),
                host: "localhost".into(),
                port,
                failed: false,
                failed_since: 0,
            });
        }
        assert_eq!(mapper.sentinel_id(), 100);
        mapper.mark_route_failed(100);
        assert_eq!(mapper.sentinel_id(), 300);
    }
}
