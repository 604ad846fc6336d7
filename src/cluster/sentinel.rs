// The sentinel: every node runs the thread, the live node with the
// lowest id acts. A ~100 ms cadence state machine keeps the map healthy:
// verify and purge failed routes, keep every partition owned, meet the
// replica target, and keep owner/clone counts level across nodes.

use super::{apply_map_snapshot, NodeState};
use crate::common::now_ms;
use crate::partition::PartitionTransfer;
use crate::Services;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const CADENCE_MS: u64 = 100;
const FAIL_VERIFY_MS: i64 = 500;

/// Payload for partition transfer between nodes: every table's slice of
/// the partition.
#[derive(Serialize, Deserialize)]
pub struct TransferDoc {
    pub partition: usize,
    pub tables: Vec<(String, PartitionTransfer)>,
}

pub fn start(services: Arc<Services>) {
    std::thread::spawn(move || run(services));
}

fn run(services: Arc<Services>) {
    let client = match reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "sentinel cannot build http client");
            return;
        }
    };

    let mut acting = false;

    loop {
        std::thread::sleep(Duration::from_millis(CADENCE_MS));
        if !services.is_running() {
            return;
        }

        let mapper = &services.mapper;
        if mapper.count_routes() <= 1 {
            continue; // single node; nothing to supervise
        }

        if fail_check(&services, &client) {
            continue;
        }

        if mapper.sentinel_id() != mapper.node_id() {
            if acting {
                acting = false;
                info!("no longer cluster sentinel");
            }
            continue;
        }
        if !acting {
            acting = true;
            info!("promoted to cluster sentinel");
            // placeholders from an interrupted balance are garbage now
            mapper.partition_map.purge_by_state(NodeState::ActivePlaceholder);
            broadcast(&services, &client);
            continue;
        }

        let partition_max = services.pool.partition_max();
        if partition_max == 0 {
            continue;
        }

        if owners_check(&services, &client, partition_max) {
            continue;
        }
        if replicas_check(&services, &client, partition_max) {
            continue;
        }
        if balance_owners(&services, &client) {
            continue;
        }
        balance_clones(&services, &client, partition_max);
    }
}

/// Verify routes marked failed; purge the node once the failure holds
/// past the verification window. Returns true when the map changed.
fn fail_check(services: &Arc<Services>, client: &reqwest::blocking::Client) -> bool {
    let mapper = &services.mapper;
    let now = now_ms();
    for route in mapper.failed_routes() {
        if now - route.failed_since < FAIL_VERIFY_MS {
            continue;
        }
        let alive = client
            .get(format!("{}/v1/internode/is_member", route.base_url()))
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        if alive {
            mapper.clear_route_failure(route.node_id);
            continue;
        }

        warn!(node = %route.name, "purging dead node from cluster");
        mapper.partition_map.purge_node(route.node_id);
        mapper.remove_route(route.node_id);
        if mapper.sentinel_id() == mapper.node_id() {
            broadcast(services, client);
        }
        return true;
    }
    false
}

/// Every partition needs exactly one active owner; promote clones into
/// any gap. No candidate at all is unrecoverable cluster loss.
fn owners_check(
    services: &Arc<Services>,
    client: &reqwest::blocking::Client,
    partition_max: usize,
) -> bool {
    let mapper = &services.mapper;
    let missing =
        mapper
            .partition_map
            .missing_partitions(partition_max, &[NodeState::ActiveOwner], 1);
    if missing.is_empty() {
        return false;
    }

    for partition in missing {
        let candidates = mapper.partition_map.nodes_by_partition(partition);
        let promoted = candidates
            .iter()
            .find(|(_, state)| *state == NodeState::ActiveClone)
            .map(|(node, _)| *node);
        match promoted {
            Some(node) => {
                info!(partition, node, "promoting clone to owner");
                mapper.partition_map.set_owner(partition, node);
            }
            None => {
                error!(partition, "cluster is broken: no replica to promote");
                return true;
            }
        }
    }
    // anything not owner or clone after promotion is dirty
    mapper.partition_map.purge_by_state(NodeState::Failed);
    broadcast(services, client);
    true
}

/// Desired clone count: 2, dropping to 1 at three nodes or fewer, 0 on a
/// single node.
fn replica_target(services: &Arc<Services>) -> usize {
    let routes = services.mapper.count_routes();
    if routes <= 1 {
        0
    } else if routes <= 3 {
        1
    } else {
        services.config.replica_target
    }
}

fn replicas_check(
    services: &Arc<Services>,
    client: &reqwest::blocking::Client,
    partition_max: usize,
) -> bool {
    let mapper = &services.mapper;
    let target = replica_target(services);
    if target == 0 {
        return false;
    }

    let replica_states = [NodeState::ActiveClone, NodeState::ActivePlaceholder];
    let missing = mapper
        .partition_map
        .missing_partitions(partition_max, &replica_states, target);
    let Some(&partition) = missing.first() else {
        return false;
    };

    let holders = mapper.partition_map.nodes_by_partition(partition);
    let source = holders
        .iter()
        .find(|(_, state)| matches!(state, NodeState::ActiveOwner | NodeState::ActiveClone))
        .map(|(node, _)| *node);
    let Some(source) = source else {
        warn!(partition, "no source node for replication");
        return false;
    };

    // least-loaded node that does not already carry the partition
    let holder_ids: Vec<i64> = holders.iter().map(|(node, _)| *node).collect();
    let clone_counts = mapper.partition_map.counts_by_node(NodeState::ActiveClone);
    let target_node = mapper
        .routes()
        .into_iter()
        .filter(|route| !route.failed && !holder_ids.contains(&route.node_id))
        .min_by_key(|route| clone_counts.get(&route.node_id).copied().unwrap_or(0))
        .map(|route| route.node_id);
    let Some(target_node) = target_node else {
        return false;
    };

    info!(partition, source, target_node, "placing new replica");
    mapper
        .partition_map
        .set_state(partition, target_node, NodeState::ActivePlaceholder);
    broadcast(services, client);

    if transfer(services, client, partition, source, target_node) {
        mapper
            .partition_map
            .set_state(partition, target_node, NodeState::ActiveClone);
        broadcast(services, client);
    } else {
        warn!(partition, target_node, "replica transfer failed");
        mapper.partition_map.remove(partition, target_node);
        broadcast(services, client);
    }
    true
}

/// Keep owner counts level: when max - min > 1, swap ownership with a
/// clone already resident on the light node.
fn balance_owners(services: &Arc<Services>, client: &reqwest::blocking::Client) -> bool {
    let mapper = &services.mapper;
    let counts = mapper.partition_map.counts_by_node(NodeState::ActiveOwner);
    if counts.len() < 2 {
        return false;
    }
    let (&max_node, &max_count) = counts.iter().max_by_key(|(_, c)| **c).unwrap();
    let light_nodes: Vec<i64> = mapper
        .routes()
        .iter()
        .filter(|r| !r.failed)
        .map(|r| r.node_id)
        .collect();
    let (&min_node, min_count) = match light_nodes
        .iter()
        .map(|node| (node, counts.get(node).copied().unwrap_or(0)))
        .min_by_key(|(_, c)| *c)
    {
        Some(pair) => pair,
        None => return false,
    };
    if max_count.saturating_sub(min_count) <= 1 {
        return false;
    }

    // a partition owned by the heavy node with a clone on the light one
    for partition in mapper.partition_map.partitions_by_node(max_node) {
        if mapper.partition_map.get_state(partition, max_node) != NodeState::ActiveOwner {
            continue;
        }
        if mapper.partition_map.get_state(partition, min_node) == NodeState::ActiveClone {
            info!(partition, from = max_node, to = min_node, "swapping owner with clone");
            mapper.partition_map.set_owner(partition, min_node);
            broadcast(services, client);
            return true;
        }
    }
    false
}

/// Same leveling for clones, using the placeholder state while the copy
/// is in flight.
fn balance_clones(
    services: &Arc<Services>,
    client: &reqwest::blocking::Client,
    partition_max: usize,
) -> bool {
    let mapper = &services.mapper;
    if replica_target(services) == 0 || partition_max == 0 {
        return false;
    }
    let counts = mapper.partition_map.counts_by_node(NodeState::ActiveClone);
    if counts.len() < 2 {
        return false;
    }
    let (&max_node, &max_count) = counts.iter().max_by_key(|(_, c)| **c).unwrap();
    let live: Vec<i64> = mapper
        .routes()
        .iter()
        .filter(|r| !r.failed)
        .map(|r| r.node_id)
        .collect();
    let (&min_node, min_count) = match live
        .iter()
        .map(|node| (node, counts.get(node).copied().unwrap_or(0)))
        .min_by_key(|(_, c)| *c)
    {
        Some(pair) => pair,
        None => return false,
    };
    if max_count.saturating_sub(min_count) <= 1 {
        return false;
    }

    for partition in mapper.partition_map.partitions_by_node(max_node) {
        if mapper.partition_map.get_state(partition, max_node) != NodeState::ActiveClone {
            continue;
        }
        if mapper.partition_map.get_state(partition, min_node) != NodeState::Free {
            continue;
        }
        info!(partition, from = max_node, to = min_node, "moving clone");
        mapper
            .partition_map
            .set_state(partition, min_node, NodeState::ActivePlaceholder);
        broadcast(services, client);
        if transfer(services, client, partition, max_node, min_node) {
            mapper
                .partition_map
                .set_state(partition, min_node, NodeState::ActiveClone);
            mapper.partition_map.remove(partition, max_node);
        } else {
            mapper.partition_map.remove(partition, min_node);
        }
        broadcast(services, client);
        return true;
    }
    false
}

/// Send the current map to every peer and apply it locally.
pub fn broadcast(services: &Arc<Services>, client: &reqwest::blocking::Client) -> bool {
    let mapper = &services.mapper;
    let snapshot = mapper.make_snapshot(services.pool.partition_max());
    apply_map_snapshot(services, &snapshot);

    let mut all_ok = true;
    for route in mapper.routes() {
        if route.node_id == mapper.node_id() || route.failed {
            continue;
        }
        let ok = client
            .post(format!("{}/v1/internode/map_change", route.base_url()))
            .json(&snapshot)
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        if !ok {
            mapper.mark_route_failed(route.node_id);
            all_ok = false;
        }
    }
    all_ok
}

/// Serialize one partition (every table's slice plus the side-log tail)
/// and PUT it at the target node. When the source is a peer, the peer is
/// asked to push instead.
pub fn transfer(
    services: &Arc<Services>,
    client: &reqwest::blocking::Client,
    partition: usize,
    source: i64,
    target: i64,
) -> bool {
    let mapper = &services.mapper;
    let Some(target_route) = mapper.get_route(target) else {
        return false;
    };

    if source != mapper.node_id() {
        let Some(source_route) = mapper.get_route(source) else {
            return false;
        };
        return client
            .post(format!(
                "{}/v1/internode/push_transfer?partition={}&target={}",
                source_route.base_url(),
                partition,
                target
            ))
            .send()
            .map(|r| r.status().is_success())
            .unwrap_or(false);
    }

    let Some(doc) = build_transfer(services, partition) else {
        return false;
    };
    let Ok(body) = bincode::serde::encode_to_vec(&doc, bincode::config::standard()) else {
        return false;
    };
    client
        .put(format!(
            "{}/v1/internode/transfer?partition={}",
            target_route.base_url(),
            partition
        ))
        .body(body)
        .send()
        .map(|r| r.status().is_success())
        .unwrap_or(false)
}

pub fn build_transfer(services: &Arc<Services>, partition: usize) -> Option<TransferDoc> {
    let mut tables = Vec::new();
    for table in services.db.tables() {
        let Some(parts) = table.get_partition_objects(services, partition, false) else {
            continue;
        };
        let sidelog = services.log.serialize_block(table.name(), partition);
        let transfer = parts.lock().to_transfer(sidelog);
        tables.push((table.name().to_string(), transfer));
    }
    Some(TransferDoc { partition, tables })
}

pub fn apply_transfer(services: &Arc<Services>, doc: TransferDoc) {
    for (table_name, mut transfer) in doc.tables {
        let Some(table) = services.db.get_table(&table_name) else {
            continue;
        };
        let Some(parts) = table.get_partition_objects(services, doc.partition, true) else {
            continue;
        };
        let sidelog = std::mem::take(&mut transfer.sidelog);
        parts.lock().from_transfer(transfer);
        if !sidelog.is_empty() {
            let _ = services
                .log
                .append_block(&table_name, doc.partition, &sidelog);
        }
    }
    info!(partition = doc.partition, "received partition transfer");
}
