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

//! Watches for game server pods that come back on a different node, or on a
//! node whose address changed, such as after a node is recreated under the
//! same name.

use std::sync::{Arc, Weak};

use eyre::WrapErr;

use crate::{
    apis::{pod::is_game_server_pod, split_key, GameServerState},
    k8s::{Change, Client, EventType, Informers},
    signal::ShutdownRx,
    workqueue::WorkQueue,
};

pub struct MigrationController {
    client: Arc<dyn Client>,
    informers: Informers,
    queue: Arc<WorkQueue>,
}

impl MigrationController {
    pub fn new(client: Arc<dyn Client>, informers: &Informers) -> Arc<Self> {
        let controller = Arc::new(Self {
            client,
            informers: informers.clone(),
            queue: WorkQueue::with_default_delays("agones.dev.MigrationController"),
        });

        let weak = Arc::downgrade(&controller);
        informers.pods.add_handler(move |change| {
            let Some(controller) = Weak::upgrade(&weak) else {
                return;
            };

            if let Change::Added(pod) | Change::Updated { new: pod, .. } = change {
                if is_game_server_pod(pod) {
                    controller.queue.enqueue(crate::apis::key_of(&**pod));
                }
            }
        });

        controller
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub async fn run(self: Arc<Self>, shutdown: ShutdownRx) -> crate::Result<()> {
        tokio::join!(
            self.informers.game_servers.wait_for_sync(),
            self.informers.pods.wait_for_sync(),
            self.informers.nodes.wait_for_sync(),
        );

        let controller = self.clone();
        self.queue
            .clone()
            .run(
                1,
                move |key| {
                    let controller = controller.clone();
                    async move { controller.sync_pod(&key).await }
                },
                shutdown,
            )
            .await;
        Ok(())
    }

    /// Checks the pod named by `key` still runs on the node, and at the
    /// address, recorded on its game server.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn sync_pod(&self, key: &str) -> crate::Result<()> {
        let (namespace, name) = match split_key(key) {
            Ok(parts) => parts,
            Err(error) => {
                tracing::error!(%error, "invalid resource key");
                return Ok(());
            }
        };

        let Some(pod) = self.informers.pods.get(namespace, name) else {
            tracing::debug!("pod is no longer available for syncing");
            return Ok(());
        };

        let Some(node_name) = super::pod_node_name(&pod) else {
            return Ok(());
        };
        if pod.metadata.deletion_timestamp.is_some() || !is_game_server_pod(&pod) {
            return Ok(());
        }

        let Some(gs) = self.informers.game_servers.get(namespace, name) else {
            return Ok(());
        };
        let status_node = gs
            .status
            .as_ref()
            .map(|status| status.node_name.as_str())
            .unwrap_or_default();
        // The game server controller populates the node the first time.
        if status_node.is_empty() || gs.is_being_deleted() || gs.is_state(GameServerState::Unhealthy)
        {
            return Ok(());
        }

        let Some(node) = self.informers.nodes.get_cluster(node_name) else {
            return Err(eyre::eyre!(
                "error retrieving node {node_name} for Pod {name}"
            ));
        };
        if node.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        let address = gs
            .status
            .as_ref()
            .map(|status| status.address.as_str())
            .unwrap_or_default();
        let address_unchanged = node
            .status
            .iter()
            .flat_map(|status| status.addresses.iter().flatten())
            .any(|node_address| node_address.address == address);
        if status_node == node_name && address_unchanged {
            return Ok(());
        }

        tracing::debug!(node = %node_name, "game server pod migrated");
        let mut updated = (*gs).clone();
        let message = if gs.is_before_ready() {
            super::apply_address_and_ports(&mut updated, &node, &pod)?;
            "Address updated due to Node migration"
        } else {
            updated.set_state(GameServerState::Unhealthy);
            "Node migration occurred"
        };

        let updated = super::update_game_server(&*self.client, &updated, gs.state())
            .await
            .wrap_err_with(|| format!("error updating GameServer {name} after node migration"))?;
        super::record_event(&*self.client, &updated, EventType::Warning, message).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        apis::GameServer,
        test::{game_server_fixture, node_fixture, FakeCluster},
    };

    async fn scheduled(cluster: &FakeCluster, state: GameServerState) -> GameServer {
        cluster.add_node(node_fixture("node-1", "12.12.12.12"));
        let mut gs = game_server_fixture();
        gs.apply_defaults();
        gs.set_state(state);
        let status = gs.status_mut();
        status.node_name = "node-1".into();
        status.address = "12.12.12.12".into();
        let gs = cluster.add_game_server(gs);
        cluster.create_pod(&gs.pod(Vec::new()).unwrap()).await.unwrap();
        cluster.run_pod("default", "test", "node-1", "10.1.0.5");
        gs
    }

    #[tokio::test]
    async fn unchanged_node_does_nothing() {
        let cluster = FakeCluster::new();
        let controller = MigrationController::new(cluster.clone(), cluster.informers());
        scheduled(&cluster, GameServerState::Ready).await;

        controller.sync_pod("default/test").await.unwrap();
        assert!(cluster.actions_for("gameservers").is_empty());
    }

    #[tokio::test]
    async fn ready_game_server_becomes_unhealthy() {
        let cluster = FakeCluster::new();
        let controller = MigrationController::new(cluster.clone(), cluster.informers());
        scheduled(&cluster, GameServerState::Ready).await;

        cluster.add_node(node_fixture("node-2", "13.13.13.13"));
        cluster.run_pod("default", "test", "node-2", "10.1.0.6");
        controller.sync_pod("default/test").await.unwrap();

        assert_eq!(
            Some(GameServerState::Unhealthy),
            cluster.game_server("default", "test").unwrap().state()
        );
        assert!(cluster.has_event("Warning Unhealthy Node migration occurred"));
    }

    #[tokio::test]
    async fn scheduled_game_server_moves_address() {
        let cluster = FakeCluster::new();
        let controller = MigrationController::new(cluster.clone(), cluster.informers());
        scheduled(&cluster, GameServerState::Scheduled).await;

        // Recreated under the same name with a new address.
        cluster.add_node(node_fixture("node-1", "14.14.14.14"));
        controller.sync_pod("default/test").await.unwrap();

        let gs = cluster.game_server("default", "test").unwrap();
        let status = gs.status.unwrap();
        assert_eq!(GameServerState::Scheduled, status.state);
        assert_eq!("14.14.14.14", status.address);
        assert!(cluster.has_event("Warning Scheduled Address updated due to Node migration"));
    }

    #[tokio::test]
    async fn deleting_node_is_ignored() {
        let cluster = FakeCluster::new();
        let controller = MigrationController::new(cluster.clone(), cluster.informers());
        scheduled(&cluster, GameServerState::Ready).await;

        let mut node = node_fixture("node-2", "13.13.13.13");
        node.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            k8s_openapi::chrono::Utc::now(),
        ));
        cluster.add_node(node);
        cluster.run_pod("default", "test", "node-2", "10.1.0.6");

        controller.sync_pod("default/test").await.unwrap();
        assert!(cluster.actions_for("gameservers").is_empty());
    }
}
