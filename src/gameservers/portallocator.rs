/*
 * Copyright 2023 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *       http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Hands out host ports to game servers with dynamically allocated ports.
//!
//! Every schedulable node has one row of `min_port..=max_port`, a port being
//! taken in a row when some game server holds it. Ports are handed out from
//! the first free slots, scanning the rows in order.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Weak},
};

use k8s_openapi::api::core::v1::Node;
use parking_lot::RwLock;

use crate::{
    apis::GameServer,
    k8s::{Change, Informers},
    signal::ShutdownRx,
    workqueue::WorkQueue,
};

const SYNC_ALL_KEY: &str = "SYNC+ALL";

#[derive(Debug, thiserror::Error)]
#[error("unable to allocate a port")]
pub struct PortNotAllocatable;

type PortAllocation = BTreeMap<u16, bool>;

#[derive(Default)]
struct Allocations {
    nodes: Vec<PortAllocation>,
    /// The game servers holding ports allocated by this allocator.
    game_servers: HashSet<String>,
    /// The nodes which have a row.
    node_registry: HashSet<String>,
}

impl Allocations {
    /// Marks `port` in the first row where it is not already `taken`.
    fn set(&mut self, port: u16, taken: bool) {
        if let Some(slot) = self
            .nodes
            .iter_mut()
            .filter_map(|row| row.get_mut(&port))
            .find(|slot| **slot != taken)
        {
            *slot = taken;
        }
    }
}

pub struct PortAllocator {
    min_port: u16,
    max_port: u16,
    allocations: RwLock<Allocations>,
    informers: Informers,
    queue: Arc<WorkQueue>,
}

fn registry_key(gs: &GameServer) -> String {
    gs.metadata
        .uid
        .clone()
        .unwrap_or_else(|| crate::apis::key_of(gs))
}

impl PortAllocator {
    pub fn new(min_port: u16, max_port: u16, informers: &Informers) -> Arc<Self> {
        tracing::info!(min_port, max_port, "starting port allocator");
        let allocator = Arc::new(Self {
            min_port,
            max_port,
            allocations: <_>::default(),
            informers: informers.clone(),
            queue: WorkQueue::with_default_delays("agones.dev.PortAllocator"),
        });

        let weak = Arc::downgrade(&allocator);
        informers.game_servers.add_handler(move |change| {
            if let (Change::Deleted(gs), Some(allocator)) = (change, Weak::upgrade(&weak)) {
                allocator.deallocate(gs);
            }
        });

        let weak = Arc::downgrade(&allocator);
        informers.nodes.add_handler(move |change| {
            let Some(allocator) = Weak::upgrade(&weak) else {
                return;
            };

            match change {
                Change::Added(node) => {
                    allocator
                        .queue
                        .enqueue(node.metadata.name.clone().unwrap_or_default());
                }
                Change::Updated { old, new } if unschedulable(old) != unschedulable(new) => {
                    allocator.queue.enqueue(SYNC_ALL_KEY);
                }
                Change::Updated { .. } => {}
                Change::Deleted(_) => allocator.queue.enqueue(SYNC_ALL_KEY),
            }
        });

        allocator
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Waits for the caches, rebuilds the allocations from them and then
    /// keeps them current until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownRx) -> crate::Result<()> {
        tracing::debug!("running port allocator");
        tokio::join!(
            self.informers.game_servers.wait_for_sync(),
            self.informers.nodes.wait_for_sync(),
        );

        self.sync_all();

        let allocator = self.clone();
        self.queue
            .clone()
            .run(
                1,
                move |key| {
                    let allocator = allocator.clone();
                    async move { allocator.sync_ports(&key) }
                },
                shutdown,
            )
            .await;

        Ok(())
    }

    fn sync_ports(&self, key: &str) -> crate::Result<()> {
        if key == SYNC_ALL_KEY {
            self.sync_all();
            return Ok(());
        }

        let node = self
            .informers
            .nodes
            .get_cluster(key)
            .ok_or_else(|| eyre::eyre!("error retrieving node {key}"))?;
        self.sync_add_node(&node);
        Ok(())
    }

    /// Returns a copy of `gs` with a host port assigned to each of its
    /// Dynamic and Passthrough ports.
    pub fn allocate(&self, gs: &GameServer) -> Result<GameServer, PortNotAllocatable> {
        let mut allocations = self.allocations.write();
        let amount = gs.count_ports(|policy| policy.is_allocated());

        let open: Vec<(usize, u16)> = allocations
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(row, ports)| {
                ports
                    .iter()
                    .filter(|(_, taken)| !**taken)
                    .map(move |(port, _)| (row, *port))
            })
            .take(amount)
            .collect();

        if open.len() < amount {
            crate::metrics::port_allocations_total("error").inc();
            return Err(PortNotAllocatable);
        }

        let mut gs = gs.clone();
        let mut open = open.into_iter();
        for port in gs
            .spec
            .ports
            .iter_mut()
            .filter(|port| port.port_policy.is_allocated())
        {
            if let Some((row, host_port)) = open.next() {
                allocations.nodes[row].insert(host_port, true);
                port.host_port = Some(host_port);
            }
        }

        allocations.game_servers.insert(registry_key(&gs));
        crate::metrics::port_allocations_total("success").inc();
        Ok(gs)
    }

    /// Returns the ports held by `gs` to the pool.
    pub fn deallocate(&self, gs: &GameServer) {
        let mut allocations = self.allocations.write();
        if !allocations.game_servers.remove(&registry_key(gs)) {
            tracing::debug!(
                gameserver = gs.name(),
                "did not allocate this game server, ignoring for deallocation"
            );
            return;
        }

        for port in gs
            .spec
            .ports
            .iter()
            .filter(|port| port.port_policy.is_allocated())
            .filter_map(|port| port.host_port)
            .filter(|port| (self.min_port..=self.max_port).contains(port))
        {
            allocations.set(port, false);
        }
    }

    fn new_row(&self) -> PortAllocation {
        (self.min_port..=self.max_port)
            .map(|port| (port, false))
            .collect()
    }

    fn sync_add_node(&self, node: &Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        let mut allocations = self.allocations.write();
        if allocations.node_registry.contains(&name) {
            tracing::debug!(node = %name, "node already has port allocations, skipping");
            return;
        }

        tracing::info!(node = %name, "adding node to port allocations");
        let row = self.new_row();
        allocations.nodes.push(row);
        allocations.node_registry.insert(name);
    }

    /// Rebuilds every row from the nodes and game servers in the caches.
    pub(crate) fn sync_all(&self) {
        let mut allocations = self.allocations.write();
        tracing::info!("resetting port allocation");

        let mut node_registry = HashSet::new();
        let mut node_ports: HashMap<String, PortAllocation> = HashMap::new();
        let mut node_order = Vec::new();
        for node in self.informers.nodes.list() {
            let name = node.metadata.name.clone().unwrap_or_default();
            node_registry.insert(name.clone());
            if !unschedulable(&node) {
                node_ports.insert(name.clone(), self.new_row());
                node_order.push(name);
            }
        }
        node_order.sort();

        let mut game_servers = HashSet::new();
        let mut unscheduled_ports = Vec::new();
        for gs in self.informers.game_servers.list() {
            let node_name = gs
                .status
                .as_ref()
                .map(|status| status.node_name.as_str())
                .unwrap_or_default();

            for port in gs
                .spec
                .ports
                .iter()
                .filter(|port| port.port_policy.is_allocated())
            {
                game_servers.insert(registry_key(&gs));
                let host_port = port.host_port.unwrap_or_default();
                match node_ports.get_mut(node_name) {
                    Some(row) if !node_name.is_empty() => {
                        row.insert(host_port, true);
                    }
                    _ if host_port != 0 => unscheduled_ports.push(host_port),
                    _ => {}
                }
            }
        }

        allocations.nodes = node_order
            .into_iter()
            .filter_map(|name| node_ports.remove(&name))
            .collect();
        for port in unscheduled_ports {
            allocations.set(port, true);
        }
        allocations.game_servers = game_servers;
        allocations.node_registry = node_registry;
    }

    /// The number of free ports in each row, for tests and diagnostics.
    pub fn free_ports(&self) -> Vec<usize> {
        self.allocations
            .read()
            .nodes
            .iter()
            .map(|row| row.values().filter(|taken| !**taken).count())
            .collect()
    }
}

fn unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::NodeSpec;
    use kube::runtime::watcher::Event;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::apis::{GameServerPort, GameServerSpec, GameServerState, PortPolicy};

    fn node(name: &str, unschedulable: bool) -> Node {
        Node {
            metadata: kube::core::ObjectMeta {
                name: Some(name.into()),
                uid: Some(format!("{name}-uid")),
                ..<_>::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(unschedulable),
                ..<_>::default()
            }),
            status: None,
        }
    }

    fn game_server(name: &str, policies: &[PortPolicy]) -> GameServer {
        let mut gs = GameServer::new(
            name,
            GameServerSpec {
                ports: policies
                    .iter()
                    .enumerate()
                    .map(|(i, policy)| GameServerPort {
                        name: format!("p{i}"),
                        port_policy: *policy,
                        container_port: Some(7777),
                        ..<_>::default()
                    })
                    .collect(),
                ..<_>::default()
            },
        );
        gs.metadata.namespace = Some("default".into());
        gs.metadata.uid = Some(format!("{name}-uid"));
        gs
    }

    fn allocator(min: u16, max: u16, nodes: Vec<Node>) -> (Informers, Arc<PortAllocator>) {
        let informers = Informers::default();
        informers.nodes.apply(Event::Restarted(nodes));
        informers.game_servers.apply(Event::Restarted(Vec::new()));
        let allocator = PortAllocator::new(min, max, &informers);
        allocator.sync_all();
        (informers, allocator)
    }

    fn host_ports(gs: &GameServer) -> Vec<u16> {
        gs.spec
            .ports
            .iter()
            .filter_map(|port| port.host_port)
            .collect()
    }

    #[tokio::test]
    async fn allocate_and_exhaust() {
        let (_, allocator) = allocator(10, 12, vec![node("n1", false), node("n2", false)]);

        let gs = allocator
            .allocate(&game_server("gs1", &[PortPolicy::Dynamic, PortPolicy::Static]))
            .unwrap();
        assert_eq!(vec![10], host_ports(&gs));
        assert_eq!(vec![2, 3], allocator.free_ports());

        let gs2 = allocator
            .allocate(&game_server(
                "gs2",
                &[PortPolicy::Dynamic, PortPolicy::Passthrough, PortPolicy::Dynamic],
            ))
            .unwrap();
        assert_eq!(vec![11, 12, 10], host_ports(&gs2));
        assert_eq!(vec![0, 2], allocator.free_ports());

        assert!(allocator
            .allocate(&game_server("gs3", &[PortPolicy::Dynamic; 3]))
            .is_err());
        assert_eq!(vec![0, 2], allocator.free_ports());

        // Ports are returned to the first row holding them.
        allocator.deallocate(&gs2);
        assert_eq!(vec![3, 2], allocator.free_ports());

        // Unknown game servers are ignored.
        allocator.deallocate(&gs2);
        assert_eq!(vec![3, 2], allocator.free_ports());
    }

    #[tokio::test]
    async fn unschedulable_nodes_have_no_ports() {
        let (_, allocator) = allocator(10, 10, vec![node("n1", true)]);
        assert!(allocator
            .allocate(&game_server("gs1", &[PortPolicy::Dynamic]))
            .is_err());
    }

    #[tokio::test]
    async fn sync_all_keeps_existing_ports() {
        let informers = Informers::default();
        let mut scheduled = game_server("gs1", &[PortPolicy::Dynamic]);
        scheduled.spec.ports[0].host_port = Some(11);
        scheduled.set_state(GameServerState::Ready);
        scheduled.status_mut().node_name = "n2".into();

        let mut unscheduled = game_server("gs2", &[PortPolicy::Dynamic]);
        unscheduled.spec.ports[0].host_port = Some(10);

        informers
            .nodes
            .apply(Event::Restarted(vec![node("n1", false), node("n2", false)]));
        informers
            .game_servers
            .apply(Event::Restarted(vec![scheduled.clone(), unscheduled]));

        let allocator = PortAllocator::new(10, 11, &informers);
        allocator.sync_all();
        assert_eq!(vec![1, 1], allocator.free_ports());

        // Ports of game servers found on sync are returned on deletion.
        informers.game_servers.apply(Event::Deleted(scheduled));
        assert_eq!(vec![1, 2], allocator.free_ports());
    }

    #[tokio::test(start_paused = true)]
    async fn node_changes_resync() {
        let (informers, allocator) = allocator(10, 10, vec![node("n1", false)]);
        let (shutdown_tx, shutdown_rx) = crate::signal::channel(Default::default());
        tokio::spawn(allocator.clone().run(shutdown_rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        informers.nodes.apply(Event::Applied(node("n2", false)));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(vec![1, 1], allocator.free_ports());

        informers.nodes.apply(Event::Applied(node("n2", true)));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(vec![1], allocator.free_ports());

        informers.nodes.apply(Event::Deleted(node("n1", false)));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(allocator.free_ports().is_empty());

        shutdown_tx.send(crate::signal::ShutdownKind::Testing).unwrap();
    }
}
