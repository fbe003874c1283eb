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
use futures::{stream, StreamExt};

use super::{
    cache::{Entry, GameServerStateCache},
    AllocationOverflowController,
};
use crate::{
    apis::{controller_of, split_key, GameServer, GameServerSet, GameServerState},
    gameservers::PerNodeCounter,
    k8s::{object_reference, Change, Client, EventType, Informers},
    signal::ShutdownRx,
    workqueue::WorkQueue,
};

/// The most game servers created in a single sync.
const MAX_CREATIONS_PER_BATCH: usize = 64;
/// The most game servers deleted in a single sync.
const MAX_DELETIONS_PER_BATCH: usize = 64;
/// The most game servers of a set allowed to wait for their pod at once.
const MAX_POD_PENDING_COUNT: usize = 5000;

const CREATION_PARALLELISM: usize = 16;
const DELETION_PARALLELISM: usize = 64;

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// The number of workers syncing sets.
    pub workers: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { workers: 64 }
    }
}

/// Creates and deletes the game servers of each set until it has the
/// replicas it asks for, and keeps its status up to date.
pub struct Controller {
    client: Arc<dyn Client>,
    informers: Informers,
    config: ControllerConfig,
    queue: Arc<WorkQueue>,
    per_node_counter: Arc<PerNodeCounter>,
    state_cache: GameServerStateCache,
    allocation_overflow: Arc<AllocationOverflowController>,
}

impl Controller {
    pub fn new(
        client: Arc<dyn Client>,
        informers: &Informers,
        per_node_counter: Arc<PerNodeCounter>,
        config: ControllerConfig,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            allocation_overflow: AllocationOverflowController::new(
                client.clone(),
                informers,
                per_node_counter.clone(),
            ),
            queue: WorkQueue::with_default_delays("agones.dev.GameServerSetController"),
            state_cache: GameServerStateCache::default(),
            informers: informers.clone(),
            per_node_counter,
            client,
            config,
        });

        let weak = Arc::downgrade(&controller);
        informers.game_server_sets.add_handler(move |change| {
            let Some(controller) = Weak::upgrade(&weak) else {
                return;
            };

            match change {
                Change::Added(gss) => controller.queue.enqueue(crate::apis::key_of(&**gss)),
                Change::Updated { old, new } if old.spec.replicas != new.spec.replicas => {
                    controller.queue.enqueue(crate::apis::key_of(&**new));
                }
                Change::Deleted(gss) => controller.state_cache.delete_game_server_set(gss),
                _ => {}
            }
        });

        let weak = Arc::downgrade(&controller);
        informers.game_servers.add_handler(move |change| {
            let Some(controller) = Weak::upgrade(&weak) else {
                return;
            };

            let gs = match change {
                Change::Added(gs) | Change::Deleted(gs) => gs,
                Change::Updated { new, .. } if new.metadata.deletion_timestamp.is_none() => new,
                Change::Updated { .. } => return,
            };

            if let Some(key) = controller.owner_key(gs) {
                controller.queue.enqueue(key);
            }
        });

        controller
    }

    /// The key of the set controlling `gs`, when the set is still cached.
    fn owner_key(&self, gs: &GameServer) -> Option<String> {
        let owner = controller_of(gs)?;
        if owner.kind != "GameServerSet" {
            return None;
        }

        self.informers
            .game_server_sets
            .get(gs.namespace(), &owner.name)
            .map(|gss| crate::apis::key_of(&*gss))
    }

    pub fn queues(&self) -> Vec<Arc<WorkQueue>> {
        vec![self.queue.clone(), self.allocation_overflow.queue().clone()]
    }

    pub async fn run(self: Arc<Self>, shutdown: ShutdownRx) -> crate::Result<()> {
        tracing::debug!("waiting for cache sync");
        tokio::join!(
            self.informers.game_servers.wait_for_sync(),
            self.informers.game_server_sets.wait_for_sync(),
        );

        let controller = self.clone();
        let handler = move |key: String| {
            let controller = controller.clone();
            async move { controller.sync_game_server_set(&key).await }
        };

        let (overflow, ()) = tokio::join!(
            self.allocation_overflow.clone().run(shutdown.clone()),
            self.queue
                .clone()
                .run(self.config.workers, handler, shutdown),
        );

        overflow
    }

    /// Creates and deletes the game servers of the set named by `key`, then
    /// updates its status.
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
            tracing::debug!("game server set is no longer available for syncing");
            return Ok(());
        };

        let entry = self.state_cache.for_game_server_set(&gss);
        let list = entry.reconcile_with_updated_server_list(super::list_game_servers_by_owner(
            &self.informers,
            &gss,
        ));

        let mut action = super::compute_reconciliation_action(
            gss.spec.scheduling,
            &list,
            &self.per_node_counter.counts(),
            usize::try_from(gss.spec.replicas).unwrap_or_default(),
            MAX_CREATIONS_PER_BATCH,
            MAX_DELETIONS_PER_BATCH,
            MAX_POD_PENDING_COUNT,
            &gss.spec.priorities,
        );

        if gss.metadata.deletion_timestamp.is_some() {
            action.to_add = 0;
        }

        if action.partial {
            // Picks up the next batch once this one is done.
            self.queue.enqueue_immediately(key);
        }

        let mut errors = Vec::new();
        if action.to_add > 0 {
            tracing::debug!(count = action.to_add, "adding game servers");
            errors.extend(self.add_game_servers(&gss, &entry, action.to_add).await);
        }

        if !action.to_delete.is_empty() {
            tracing::debug!(count = action.to_delete.len(), "deleting game servers");
            errors.extend(
                self.delete_game_servers(&gss, &entry, &action.to_delete)
                    .await,
            );
        }

        self.sync_game_server_set_status(&gss, &list)
            .await
            .wrap_err_with(|| format!("error updating status of GameServerSet {name}"))?;

        combine_errors(errors)
    }

    /// Returns the error of every creation that failed.
    async fn add_game_servers(
        &self,
        gss: &GameServerSet,
        entry: &Entry,
        count: usize,
    ) -> Vec<eyre::Report> {
        let template = &gss.game_server();
        let reference = &object_reference(gss);

        stream::iter(0..count)
            .map(|_| async move {
                let gs = self
                    .client
                    .create_game_server(template)
                    .await
                    .map_err(|error| {
                        eyre::Report::new(error)
                            .wrap_err(format!("error creating gameserver for GameServerSet {}", gss.name()))
                    })?;

                entry.created(&gs);
                self.client
                    .record_event(
                        reference.clone(),
                        EventType::Normal,
                        "SuccessfulCreate",
                        &format!("Created gameserver: {}", gs.name()),
                    )
                    .await;
                Ok::<_, eyre::Report>(())
            })
            .buffer_unordered(CREATION_PARALLELISM)
            .filter_map(|result| async move { result.err() })
            .collect()
            .await
    }

    /// Game servers are deleted by moving them to Shutdown, which leaves the
    /// game server controller to remove their pod and finalizer. Returns the
    /// error of every update that failed.
    async fn delete_game_servers(
        &self,
        gss: &GameServerSet,
        entry: &Entry,
        to_delete: &[Arc<GameServer>],
    ) -> Vec<eyre::Report> {
        let reference = &object_reference(gss);

        stream::iter(to_delete.iter().cloned())
            .map(|gs| async move {
                let mut shutdown = (*gs).clone();
                shutdown.set_state(GameServerState::Shutdown);
                let updated = self
                    .client
                    .update_game_server(&shutdown)
                    .await
                    .map_err(|error| {
                        eyre::Report::new(error)
                            .wrap_err(format!("error updating gameserver {} to Shutdown", gs.name()))
                    })?;

                entry.deleted(&updated);
                let state = gs
                    .state()
                    .map(|state| state.to_string())
                    .unwrap_or_default();
                self.client
                    .record_event(
                        reference.clone(),
                        EventType::Normal,
                        "SuccessfulDelete",
                        &format!("Deleted gameserver in state {state}: {}", gs.name()),
                    )
                    .await;
                Ok::<_, eyre::Report>(())
            })
            .buffer_unordered(DELETION_PARALLELISM)
            .filter_map(|result| async move { result.err() })
            .collect()
            .await
    }

    async fn sync_game_server_set_status(
        &self,
        gss: &GameServerSet,
        list: &[Arc<GameServer>],
    ) -> crate::Result<()> {
        let status = super::compute_status(list);
        if gss.status.as_ref() == Some(&status) {
            return Ok(());
        }

        let mut updated = gss.clone();
        updated.status = Some(status);
        self.client
            .update_game_server_set_status(&updated)
            .await?;
        Ok(())
    }
}

/// Folds the failures of a sync into one error. The first failure stays in
/// the chain so conflicts are still recognised by the work queue.
fn combine_errors(errors: Vec<eyre::Report>) -> crate::Result<()> {
    let mut errors = errors.into_iter();
    let Some(first) = errors.next() else {
        return Ok(());
    };

    let rest: Vec<_> = errors.map(|error| format!("{error:#}")).collect();
    if rest.is_empty() {
        return Err(first);
    }

    Err(first.wrap_err(format!(
        "and {} more errors: {}",
        rest.len(),
        rest.join("; ")
    )))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
    use kube::runtime::watcher::Event;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        apis::{GameServerSetSpec, GameServerTemplateSpec, SchedulingStrategy},
        k8s::ApiError,
        signal::ShutdownKind,
        test::{game_server_fixture, node_fixture, FakeCluster, Verb},
    };

    fn game_server_set(replicas: i32, scheduling: SchedulingStrategy) -> GameServerSet {
        let mut gss = GameServerSet::new(
            "fleet",
            GameServerSetSpec {
                replicas,
                scheduling,
                template: GameServerTemplateSpec {
                    metadata: None,
                    spec: game_server_fixture().spec,
                },
                ..<_>::default()
            },
        );
        gss.metadata.namespace = Some("default".into());
        gss
    }

    fn controller(cluster: &Arc<FakeCluster>) -> Arc<Controller> {
        Controller::new(
            cluster.clone(),
            cluster.informers(),
            PerNodeCounter::new(cluster.informers()),
            ControllerConfig::default(),
        )
    }

    fn children(cluster: &FakeCluster) -> Vec<GameServer> {
        cluster
            .informers()
            .game_servers
            .list()
            .into_iter()
            .filter(|gs| !gs.is_being_deleted())
            .map(|gs| (*gs).clone())
            .collect()
    }

    #[tokio::test]
    async fn scales_up() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);
        let gss = cluster
            .add_game_server_set(game_server_set(3, SchedulingStrategy::Packed))
            .unwrap();

        controller.sync_game_server_set("default/fleet").await.unwrap();

        let children = children(&cluster);
        assert_eq!(3, children.len());
        for gs in &children {
            assert!(gs.name().starts_with("fleet-"));
            assert!(crate::apis::is_controlled_by(gs, &gss));
        }
        assert_eq!(
            3,
            cluster
                .events()
                .iter()
                .filter(|event| event.message.starts_with("Created gameserver: fleet-"))
                .count()
        );

        // The pending creations are not created again.
        controller.sync_game_server_set("default/fleet").await.unwrap();
        assert_eq!(3, cluster.actions_for("gameservers").len());

        let status = cluster
            .informers()
            .game_server_sets
            .get("default", "fleet")
            .and_then(|gss| gss.status.clone())
            .unwrap();
        assert_eq!(3, status.replicas);
    }

    #[tokio::test]
    async fn scales_down_to_shutdown() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);
        cluster
            .add_game_server_set(game_server_set(3, SchedulingStrategy::Packed))
            .unwrap();
        controller.sync_game_server_set("default/fleet").await.unwrap();

        let mut gss = (*cluster
            .informers()
            .game_server_sets
            .get("default", "fleet")
            .unwrap())
        .clone();
        gss.spec.replicas = 1;
        cluster.update_game_server_set(gss).unwrap();
        controller.sync_game_server_set("default/fleet").await.unwrap();

        let shutdown: Vec<_> = cluster
            .informers()
            .game_servers
            .list()
            .into_iter()
            .filter(|gs| gs.is_state(GameServerState::Shutdown))
            .collect();
        assert_eq!(2, shutdown.len());
        assert!(cluster.has_event("Normal SuccessfulDelete Deleted gameserver in state"));
        assert!(cluster
            .actions_for("gameservers")
            .iter()
            .all(|action| action.verb != Verb::Delete));

        let status = cluster
            .informers()
            .game_server_sets
            .get("default", "fleet")
            .and_then(|gss| gss.status.clone())
            .unwrap();
        assert_eq!(3, status.replicas);

        // The next sync observes the deletions.
        controller.sync_game_server_set("default/fleet").await.unwrap();
        let status = cluster
            .informers()
            .game_server_sets
            .get("default", "fleet")
            .and_then(|gss| gss.status.clone())
            .unwrap();
        assert_eq!(1, status.replicas);
        assert_eq!(2, status.shutdown_replicas);
    }

    #[tokio::test]
    async fn packed_consolidates_on_fullest_node() {
        let cluster = FakeCluster::new();
        cluster.add_node(node_fixture("n1", "1.1.1.1"));
        cluster.add_node(node_fixture("n2", "2.2.2.2"));
        let counter = PerNodeCounter::new(cluster.informers());
        let controller = Controller::new(
            cluster.clone(),
            cluster.informers(),
            counter.clone(),
            ControllerConfig::default(),
        );
        let gss = cluster
            .add_game_server_set(game_server_set(2, SchedulingStrategy::Packed))
            .unwrap();

        for (name, node) in [("gs1", "n1"), ("gs2", "n1"), ("gs3", "n2"), ("gs4", "n2")] {
            let mut gs = gss.game_server();
            gs.metadata.name = Some(name.into());
            gs.apply_defaults();
            gs.set_state(GameServerState::Ready);
            gs.status_mut().node_name = node.into();
            cluster.add_game_server(gs);
        }
        let mut outside = game_server_fixture();
        outside.metadata.name = Some("gsA".into());
        outside.apply_defaults();
        outside.set_state(GameServerState::Allocated);
        outside.status_mut().node_name = "n2".into();
        cluster.add_game_server(outside);

        controller.sync_game_server_set("default/fleet").await.unwrap();

        let mut shutdown: Vec<_> = cluster
            .informers()
            .game_servers
            .list()
            .into_iter()
            .filter(|gs| gs.is_state(GameServerState::Shutdown))
            .map(|gs| gs.name().to_owned())
            .collect();
        shutdown.sort();
        assert_eq!(vec!["gs1", "gs2"], shutdown);
    }

    #[tokio::test]
    async fn failed_creations_are_retried() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);
        cluster
            .add_game_server_set(game_server_set(2, SchedulingStrategy::Packed))
            .unwrap();
        cluster.fail_next(Verb::Create, "gameservers", || {
            ApiError::Forbidden("quota exceeded".into())
        });

        let error = controller
            .sync_game_server_set("default/fleet")
            .await
            .unwrap_err();
        assert!(format!("{error:#}").contains("quota exceeded"));
        assert_eq!(1, children(&cluster).len());

        // The status is still written when a creation fails.
        let status = cluster
            .informers()
            .game_server_sets
            .get("default", "fleet")
            .and_then(|gss| gss.status.clone());
        assert!(status.is_some());

        controller.sync_game_server_set("default/fleet").await.unwrap();
        assert_eq!(2, children(&cluster).len());
    }

    fn verb_count(cluster: &FakeCluster, verb: Verb) -> usize {
        cluster
            .actions_for("gameservers")
            .iter()
            .filter(|action| action.verb == verb)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn failed_creation_is_requeued() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);
        cluster.fail_next(Verb::Create, "gameservers", || {
            ApiError::Forbidden("quota exceeded".into())
        });

        let (shutdown_tx, shutdown_rx) = crate::signal::channel(ShutdownKind::Testing);
        let task = tokio::spawn(controller.run(shutdown_rx));
        cluster
            .add_game_server_set(game_server_set(1, SchedulingStrategy::Packed))
            .unwrap();

        assert!(cluster.wait_for(|cluster| children(cluster).len() == 1).await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(1, children(&cluster).len());
        assert_eq!(2, verb_count(&cluster, Verb::Create));

        shutdown_tx.send(ShutdownKind::Testing).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn conflicting_shutdown_is_requeued() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);

        let (shutdown_tx, shutdown_rx) = crate::signal::channel(ShutdownKind::Testing);
        let task = tokio::spawn(controller.run(shutdown_rx));
        cluster
            .add_game_server_set(game_server_set(2, SchedulingStrategy::Packed))
            .unwrap();
        assert!(cluster.wait_for(|cluster| children(cluster).len() == 2).await);

        cluster.fail_next(Verb::Update, "gameservers", || {
            ApiError::Conflict("the object has been modified".into())
        });
        let mut gss = (*cluster
            .informers()
            .game_server_sets
            .get("default", "fleet")
            .unwrap())
        .clone();
        gss.spec.replicas = 1;
        cluster.update_game_server_set(gss).unwrap();

        let shutdown_count = |cluster: &FakeCluster| {
            children(cluster)
                .iter()
                .filter(|gs| gs.is_state(GameServerState::Shutdown))
                .count()
        };
        assert!(cluster.wait_for(|cluster| shutdown_count(cluster) == 1).await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(1, shutdown_count(&cluster));
        assert_eq!(2, verb_count(&cluster, Verb::Update));
        assert!(cluster.has_event("Normal SuccessfulDelete Deleted gameserver in state"));

        shutdown_tx.send(ShutdownKind::Testing).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn deleted_set_creates_nothing() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);
        let mut gss = cluster
            .add_game_server_set(game_server_set(2, SchedulingStrategy::Packed))
            .unwrap();
        gss.metadata.deletion_timestamp = Some(Time(Utc::now()));
        cluster
            .informers()
            .game_server_sets
            .apply(Event::Applied(gss));

        controller.sync_game_server_set("default/fleet").await.unwrap();
        assert!(children(&cluster).is_empty());
    }
}
