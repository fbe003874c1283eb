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

use std::sync::{Arc, Weak};

use eyre::WrapErr;

use crate::{
    apis::{pod::is_game_server_pod, split_key, GameServer, GameServerState},
    k8s::{Change, Client, EventType, Informers},
    signal::ShutdownRx,
    workqueue::WorkQueue,
};

/// Marks game servers whose pod has disappeared as Unhealthy.
pub struct MissingPodController {
    client: Arc<dyn Client>,
    informers: Informers,
    queue: Arc<WorkQueue>,
}

/// Whether `gs` is expected to have a pod that should be checked for.
fn should_have_pod(gs: &GameServer) -> bool {
    gs.dev_address().is_none()
        && !super::is_before_pod_created(gs)
        && !gs.is_being_deleted()
        && !matches!(
            gs.state(),
            Some(GameServerState::Unhealthy | GameServerState::Error)
        )
}

impl MissingPodController {
    pub fn new(client: Arc<dyn Client>, informers: &Informers) -> Arc<Self> {
        let controller = Arc::new(Self {
            client,
            informers: informers.clone(),
            queue: WorkQueue::with_default_delays("agones.dev.MissingPodController"),
        });

        let weak = Arc::downgrade(&controller);
        informers.game_servers.add_handler(move |change| {
            let Some(controller) = Weak::upgrade(&weak) else {
                return;
            };

            if let Change::Updated { new, .. } = change {
                if should_have_pod(new) {
                    controller.queue.enqueue(crate::apis::key_of(&**new));
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
        );

        let controller = self.clone();
        self.queue
            .clone()
            .run(
                1,
                move |key| {
                    let controller = controller.clone();
                    async move { controller.sync_game_server(&key).await }
                },
                shutdown,
            )
            .await;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn sync_game_server(&self, key: &str) -> crate::Result<()> {
        let (namespace, name) = match split_key(key) {
            Ok(parts) => parts,
            Err(error) => {
                tracing::error!(%error, "invalid resource key");
                return Ok(());
            }
        };

        if self
            .informers
            .pods
            .get(namespace, name)
            .is_some_and(|pod| is_game_server_pod(&pod))
        {
            return Ok(());
        }

        let Some(gs) = self.informers.game_servers.get(namespace, name) else {
            tracing::debug!("game server is no longer available for syncing");
            return Ok(());
        };
        if !should_have_pod(&gs) {
            return Ok(());
        }

        tracing::debug!("pod is missing, marking game server as unhealthy");
        let mut unhealthy = (*gs).clone();
        unhealthy.set_state(GameServerState::Unhealthy);
        let unhealthy = super::update_game_server(&*self.client, &unhealthy, gs.state())
            .await
            .wrap_err_with(|| format!("error updating GameServer {name} to unhealthy"))?;

        super::record_event(&*self.client, &unhealthy, EventType::Warning, "Pod is missing")
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test::{game_server_fixture, FakeCluster};

    fn game_server(state: GameServerState) -> GameServer {
        let mut gs = game_server_fixture();
        gs.apply_defaults();
        gs.set_state(state);
        gs
    }

    #[test]
    fn pod_expectations() {
        assert!(should_have_pod(&game_server(GameServerState::Ready)));
        assert!(should_have_pod(&game_server(GameServerState::Scheduled)));
        assert!(!should_have_pod(&game_server(GameServerState::Creating)));
        assert!(!should_have_pod(&game_server(GameServerState::Shutdown)));
        assert!(!should_have_pod(&game_server(GameServerState::Error)));

        let mut dev = game_server(GameServerState::Ready);
        dev.annotations_mut()
            .insert(crate::apis::DEV_ADDRESS_ANNOTATION.into(), "1.1.1.1".into());
        assert!(!should_have_pod(&dev));
    }

    #[tokio::test]
    async fn missing_pod_is_unhealthy() {
        let cluster = FakeCluster::new();
        let controller = MissingPodController::new(cluster.clone(), cluster.informers());
        cluster.add_game_server(game_server(GameServerState::Ready));

        controller.sync_game_server("default/test").await.unwrap();
        assert_eq!(
            Some(GameServerState::Unhealthy),
            cluster.game_server("default", "test").unwrap().state()
        );
        assert!(cluster.has_event("Warning Unhealthy Pod is missing"));
    }

    #[tokio::test]
    async fn present_pod_is_left_alone() {
        let cluster = FakeCluster::new();
        let controller = MissingPodController::new(cluster.clone(), cluster.informers());
        let gs = cluster.add_game_server(game_server(GameServerState::Allocated));
        cluster.create_pod(&gs.pod(Vec::new()).unwrap()).await.unwrap();

        controller.sync_game_server("default/test").await.unwrap();
        assert!(cluster.actions_for("gameservers").is_empty());
    }
}
