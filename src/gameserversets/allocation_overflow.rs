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

//! Labels and annotates the Allocated game servers of a set that are beyond
//! its desired replicas, so that they can be told apart once the set is
//! scaled down underneath them.

use std::sync::{Arc, Weak};

use eyre::WrapErr;

use crate::{
    apis::{split_key, GameServerSet, GameServerState},
    gameservers::PerNodeCounter,
    k8s::{Change, Client, Informers},
    signal::ShutdownRx,
    workqueue::WorkQueue,
};

pub struct AllocationOverflowController {
    client: Arc<dyn Client>,
    informers: Informers,
    per_node_counter: Arc<PerNodeCounter>,
    queue: Arc<WorkQueue>,
}

fn has_overflow(gss: &GameServerSet) -> bool {
    let Some(overflow) = &gss.spec.allocation_overflow else {
        return false;
    };
    if overflow.labels.is_empty() && overflow.annotations.is_empty() {
        return false;
    }

    gss.status
        .as_ref()
        .is_some_and(|status| status.allocated_replicas > gss.spec.replicas)
}

impl AllocationOverflowController {
    pub fn new(
        client: Arc<dyn Client>,
        informers: &Informers,
        per_node_counter: Arc<PerNodeCounter>,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            client,
            informers: informers.clone(),
            per_node_counter,
            queue: WorkQueue::with_default_delays("agones.dev.GameServerSetController.AllocationOverflow"),
        });

        let weak = Arc::downgrade(&controller);
        informers.game_server_sets.add_handler(move |change| {
            let Some(controller) = Weak::upgrade(&weak) else {
                return;
            };

            if let Change::Updated { new, .. } = change {
                if has_overflow(new) {
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
            self.informers.game_server_sets.wait_for_sync(),
        );

        let controller = self.clone();
        self.queue
            .clone()
            .run(
                1,
                move |key| {
                    let controller = controller.clone();
                    async move { controller.sync_game_server_set(&key).await }
                },
                shutdown,
            )
            .await;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn sync_game_server_set(&self, key: &str) -> crate::Result<()> {
        let (namespace, name) = match split_key(key) {
            Ok(parts) => parts,
            Err(error) => {
                tracing::error!(%error, "invalid resource key");
                return Ok(());
            }
        };

        let Some(gss) = self.informers.game_server_sets.get(namespace, name) else {
            return Ok(());
        };
        let (Some(overflow), true) = (&gss.spec.allocation_overflow, has_overflow(&gss)) else {
            return Ok(());
        };

        let allocated_replicas = gss
            .status
            .as_ref()
            .map(|status| status.allocated_replicas)
            .unwrap_or_default();
        let excess = usize::try_from(allocated_replicas - gss.spec.replicas).unwrap_or_default();

        let (matching, rest): (Vec<_>, Vec<_>) = super::list_game_servers_by_owner(&self.informers, &gss)
            .into_iter()
            .filter(|gs| gs.is_state(GameServerState::Allocated) && !gs.is_being_deleted())
            .partition(|gs| overflow.matches(gs));

        if matching.len() >= excess {
            return Ok(());
        }

        let rest = super::sort_game_servers_by_strategy(
            gss.spec.scheduling,
            rest,
            &self.per_node_counter.counts(),
            &gss.spec.priorities,
        );

        for gs in rest.into_iter().take(excess - matching.len()) {
            let mut updated = (*gs).clone();
            overflow.apply(&mut updated);
            self.client
                .update_game_server(&updated)
                .await
                .wrap_err_with(|| {
                    format!("error applying allocation overflow to GameServer {}", gs.name())
                })?;
            tracing::info!(gs = gs.name(), "applied allocation overflow");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        apis::{
            AllocationOverflow, GameServerSetSpec, GameServerSetStatus, GameServerTemplateSpec,
        },
        test::{game_server_fixture, FakeCluster},
    };

    #[tokio::test]
    async fn labels_excess_allocated() {
        let cluster = FakeCluster::new();
        let controller = AllocationOverflowController::new(
            cluster.clone(),
            cluster.informers(),
            PerNodeCounter::new(cluster.informers()),
        );

        let mut gss = GameServerSet::new(
            "fleet",
            GameServerSetSpec {
                replicas: 1,
                allocation_overflow: Some(AllocationOverflow {
                    labels: BTreeMap::from([("overflow".into(), "true".into())]),
                    annotations: BTreeMap::new(),
                }),
                template: GameServerTemplateSpec {
                    metadata: None,
                    spec: game_server_fixture().spec,
                },
                ..<_>::default()
            },
        );
        gss.metadata.namespace = Some("default".into());
        let mut gss = cluster.add_game_server_set(gss).unwrap();

        for (name, state) in [
            ("gs1", GameServerState::Allocated),
            ("gs2", GameServerState::Allocated),
            ("gs3", GameServerState::Allocated),
            ("gs4", GameServerState::Ready),
        ] {
            let mut gs = gss.game_server();
            gs.metadata.name = Some(name.into());
            gs.apply_defaults();
            gs.set_state(state);
            cluster.add_game_server(gs);
        }

        gss.status = Some(GameServerSetStatus {
            replicas: 4,
            allocated_replicas: 3,
            ready_replicas: 1,
            ..<_>::default()
        });
        cluster.update_game_server_set_status(&gss).await.unwrap();

        controller.sync_game_server_set("default/fleet").await.unwrap();

        let labelled: Vec<_> = cluster
            .informers()
            .game_servers
            .list()
            .into_iter()
            .filter(|gs| {
                gs.metadata
                    .labels
                    .as_ref()
                    .is_some_and(|labels| labels.contains_key("overflow"))
            })
            .collect();
        assert_eq!(2, labelled.len());
        assert!(labelled
            .iter()
            .all(|gs| gs.is_state(GameServerState::Allocated)));

        // Already labelled enough.
        let updates = cluster.actions_for("gameservers").len();
        controller.sync_game_server_set("default/fleet").await.unwrap();
        assert_eq!(updates, cluster.actions_for("gameservers").len());
    }
}
