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
use k8s_openapi::chrono::{SecondsFormat, Utc};

use super::{
    health::HealthController, migration::MigrationController, missing::MissingPodController,
    succeeded::SucceededController, PerNodeCounter, PortAllocator, SidecarConfig,
};
use crate::{
    apis::{
        pod::container_status, split_key, GameServer, GameServerState, ERRORED_AT_ANNOTATION,
        READY_CONTAINER_ID_ANNOTATION,
    },
    k8s::{trace_error, ApiError, Change, Client, EventType, Informers},
    signal::ShutdownRx,
    workqueue::WorkQueue,
};

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// The lowest host port handed out to Dynamic and Passthrough ports.
    pub min_port: u16,
    pub max_port: u16,
    pub sidecar: SidecarConfig,
    /// The number of workers syncing game servers.
    pub workers: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min_port: 7000,
            max_port: 8000,
            sidecar: SidecarConfig::default(),
            workers: 64,
        }
    }
}

/// Syncs the state of game servers with their pods, and the pods with the
/// game servers.
pub struct Controller {
    client: Arc<dyn Client>,
    informers: Informers,
    config: ControllerConfig,
    queue: Arc<WorkQueue>,
    port_allocator: Arc<PortAllocator>,
    per_node_counter: Arc<PerNodeCounter>,
    health: Arc<HealthController>,
    migration: Arc<MigrationController>,
    missing: Arc<MissingPodController>,
    succeeded: Arc<SucceededController>,
}

impl Controller {
    pub fn new(client: Arc<dyn Client>, informers: &Informers, config: ControllerConfig) -> Arc<Self> {
        let controller = Arc::new(Self {
            port_allocator: PortAllocator::new(config.min_port, config.max_port, informers),
            per_node_counter: PerNodeCounter::new(informers),
            health: HealthController::new(client.clone(), informers),
            migration: MigrationController::new(client.clone(), informers),
            missing: MissingPodController::new(client.clone(), informers),
            succeeded: SucceededController::new(client.clone(), informers),
            queue: WorkQueue::with_default_delays("agones.dev.GameServerController"),
            informers: informers.clone(),
            client,
            config,
        });

        let weak = Arc::downgrade(&controller);
        informers.game_servers.add_handler(move |change| {
            let Some(controller) = Weak::upgrade(&weak) else {
                return;
            };

            match change {
                Change::Added(gs) => controller.queue.enqueue(crate::apis::key_of(&**gs)),
                Change::Updated { old, new }
                    if old.state() != new.state()
                        || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp =>
                {
                    controller.queue.enqueue(crate::apis::key_of(&**new));
                }
                _ => {}
            }
        });

        let weak = Arc::downgrade(&controller);
        informers.pods.add_handler(move |change| {
            let Some(controller) = Weak::upgrade(&weak) else {
                return;
            };

            let changed = match change {
                Change::Added(_) | Change::Deleted(_) => true,
                Change::Updated { old, new } => {
                    old.spec.as_ref().and_then(|spec| spec.node_name.as_ref())
                        != new.spec.as_ref().and_then(|spec| spec.node_name.as_ref())
                        || old.status != new.status
                }
            };

            if let Some(key) = changed.then(|| super::owner_key(change.object())).flatten() {
                controller.queue.enqueue(key);
            }
        });

        controller
    }

    /// Every work queue owned by the controller, for health checks.
    pub fn queues(&self) -> Vec<Arc<WorkQueue>> {
        vec![
            self.queue.clone(),
            self.port_allocator.queue().clone(),
            self.health.queue().clone(),
            self.migration.queue().clone(),
            self.missing.queue().clone(),
            self.succeeded.queue().clone(),
        ]
    }

    pub fn port_allocator(&self) -> &Arc<PortAllocator> {
        &self.port_allocator
    }

    pub fn per_node_counter(&self) -> &Arc<PerNodeCounter> {
        &self.per_node_counter
    }

    /// Waits for the caches, then runs the port allocator, the per node
    /// counter, the pod controllers and the game server workers until
    /// `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownRx) -> crate::Result<()> {
        tracing::debug!("waiting for cache sync");
        tokio::join!(
            self.informers.game_servers.wait_for_sync(),
            self.informers.pods.wait_for_sync(),
            self.informers.nodes.wait_for_sync(),
        );

        let controller = self.clone();
        let handler = move |key: String| {
            let controller = controller.clone();
            async move { controller.sync_game_server(&key).await }
        };

        let (allocator, counter, health, migration, missing, succeeded, ()) = tokio::join!(
            self.port_allocator.clone().run(shutdown.clone()),
            self.per_node_counter.clone().run(),
            self.health.clone().run(shutdown.clone()),
            self.migration.clone().run(shutdown.clone()),
            self.missing.clone().run(shutdown.clone()),
            self.succeeded.clone().run(shutdown.clone()),
            self.queue
                .clone()
                .run(self.config.workers, handler, shutdown),
        );

        allocator.wrap_err("error running the port allocator")?;
        counter.wrap_err("error running the per node counter")?;
        health?;
        migration?;
        missing?;
        succeeded?;
        Ok(())
    }

    /// Moves the game server named by `key` along its lifecycle for as many
    /// states as it can go without waiting on the cluster.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn sync_game_server(&self, key: &str) -> crate::Result<()> {
        let (namespace, name) = match split_key(key) {
            Ok(parts) => parts,
            Err(error) => {
                tracing::error!(%error, "invalid resource key");
                return Ok(());
            }
        };

        let Some(gs) = self.informers.game_servers.get(namespace, name) else {
            tracing::debug!("game server is no longer available for syncing");
            return Ok(());
        };

        let mut gs = (*gs).clone();
        if gs.metadata.deletion_timestamp.is_some() {
            return self.sync_deletion_timestamp(&gs).await;
        }

        loop {
            let state = gs.state();
            gs = match state {
                Some(GameServerState::PortAllocation) => self.sync_port_allocation_state(gs).await?,
                Some(GameServerState::Creating | GameServerState::RequestReady)
                    if gs.dev_address().is_some() =>
                {
                    self.sync_development_game_server(gs).await?
                }
                Some(GameServerState::Creating) => self.sync_creating_state(gs).await?,
                Some(GameServerState::Starting) => self.sync_starting_state(gs).await?,
                Some(GameServerState::RequestReady) => self.sync_request_ready_state(gs).await?,
                Some(GameServerState::Shutdown) => return self.sync_shutdown_state(&gs).await,
                _ => return Ok(()),
            };

            if gs.state() == state {
                return Ok(());
            }
        }
    }

    /// Deletes the backing pod, then releases the game server by removing
    /// its finalizer once the pod is gone.
    async fn sync_deletion_timestamp(&self, gs: &GameServer) -> crate::Result<()> {
        tracing::debug!("syncing with deletion timestamp");

        if gs.dev_address().is_none() {
            if let Some(pod) = super::game_server_pod(&self.informers, gs) {
                let pod_name = pod.metadata.name.clone().unwrap_or_default();
                if pod.metadata.deletion_timestamp.is_none() {
                    tracing::debug!(pod = %pod_name, "found pod, deleting");
                    match self.client.delete_pod(gs.namespace(), &pod_name).await {
                        Ok(()) => {}
                        Err(error) if error.is_not_found() => {}
                        Err(error) => {
                            return Err(error).wrap_err_with(|| {
                                format!(
                                    "error deleting pod for GameServer {}, {pod_name}",
                                    gs.name()
                                )
                            })
                        }
                    }
                    super::record_event(
                        &*self.client,
                        gs,
                        EventType::Normal,
                        &format!("Deleting Pod {pod_name}"),
                    )
                    .await;
                }

                return Err(trace_error(format!(
                    "waiting for pod {pod_name} to be deleted"
                )));
            }
        }

        if !gs.has_finalizer() {
            return Ok(());
        }

        let mut gs = gs.clone();
        gs.remove_finalizer();
        tracing::debug!("no pods found, removing finalizer");
        match self.client.update_game_server(&gs).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error).wrap_err_with(|| {
                format!("error removing finalizer for GameServer {}", gs.name())
            }),
        }
    }

    async fn sync_port_allocation_state(&self, gs: GameServer) -> crate::Result<GameServer> {
        tracing::debug!("syncing port allocation state");
        let mut allocated = self
            .port_allocator
            .allocate(&gs)
            .wrap_err_with(|| format!("error allocating port for GameServer {}", gs.name()))?;
        allocated.set_state(GameServerState::Creating);

        match super::update_game_server(&*self.client, &allocated, gs.state()).await {
            Ok(updated) => {
                super::record_event(&*self.client, &updated, EventType::Normal, "Port allocated")
                    .await;
                Ok(updated)
            }
            Err(error) => {
                self.port_allocator.deallocate(&allocated);
                Err(error).wrap_err_with(|| {
                    format!("error updating GameServer {} to default values", gs.name())
                })
            }
        }
    }

    async fn sync_creating_state(&self, gs: GameServer) -> crate::Result<GameServer> {
        tracing::debug!("syncing create state");

        let mut gs = gs;
        if super::game_server_pod(&self.informers, &gs).is_none() {
            gs = self.create_game_server_pod(gs).await?;
            if gs.is_state(GameServerState::Error) {
                return Ok(gs);
            }
        }

        let previous = gs.state();
        gs.set_state(GameServerState::Starting);
        super::update_game_server(&*self.client, &gs, previous)
            .await
            .wrap_err_with(|| format!("error updating GameServer {} to Starting state", gs.name()))
    }

    async fn create_game_server_pod(&self, gs: GameServer) -> crate::Result<GameServer> {
        let pod = match self.config.sidecar.pod(&gs) {
            Ok(pod) => pod,
            Err(error) => {
                tracing::error!(%error, "error creating pod from game server");
                return self.move_to_error_state(gs, &error.to_string()).await;
            }
        };

        tracing::debug!(pod = ?pod.metadata.name, "creating pod for game server");
        match self.client.create_pod(&pod).await {
            Ok(pod) => {
                let message = format!(
                    "Pod {} created",
                    pod.metadata.name.as_deref().unwrap_or_default()
                );
                super::record_event(&*self.client, &gs, EventType::Normal, &message).await;
                Ok(gs)
            }
            Err(error) if error.is_already_exists() => Ok(gs),
            Err(ApiError::Invalid(message)) => {
                tracing::error!(%message, "pod created is invalid");
                self.move_to_error_state(gs, &format!("Pod created is invalid: {message}"))
                    .await
            }
            Err(ApiError::Forbidden(message)) => {
                tracing::error!(%message, "pod creation is forbidden");
                self.move_to_error_state(gs, &format!("Pod creation is forbidden: {message}"))
                    .await
            }
            Err(error) => Err(error)
                .wrap_err_with(|| format!("error creating Pod for GameServer {}", gs.name())),
        }
    }

    async fn sync_starting_state(&self, gs: GameServer) -> crate::Result<GameServer> {
        tracing::debug!("syncing starting state");

        let pod = super::game_server_pod(&self.informers, &gs).ok_or_else(|| {
            trace_error(format!("pod for GameServer {} not yet in the cache", gs.name()))
        })?;
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let node_name = super::pod_node_name(&pod)
            .ok_or_else(|| trace_error(format!("node not yet populated for Pod {pod_name}")))?;
        if super::pod_ips(&pod).is_empty() {
            return Err(trace_error(format!(
                "pod IP not yet populated for Pod {pod_name}"
            )));
        }

        let node = self
            .informers
            .nodes
            .get_cluster(node_name)
            .ok_or_else(|| eyre::eyre!("error retrieving node {node_name} for Pod {pod_name}"))?;

        let mut updated = gs.clone();
        super::apply_address_and_ports(&mut updated, &node, &pod)?;
        updated.set_state(GameServerState::Scheduled);

        let updated = super::update_game_server(&*self.client, &updated, gs.state())
            .await
            .wrap_err_with(|| {
                format!("error updating GameServer {} to Scheduled state", gs.name())
            })?;
        super::record_event(
            &*self.client,
            &updated,
            EventType::Normal,
            "Address and port populated",
        )
        .await;
        Ok(updated)
    }

    async fn sync_request_ready_state(&self, gs: GameServer) -> crate::Result<GameServer> {
        tracing::debug!("syncing request ready state");

        let pod = super::game_server_pod(&self.informers, &gs).ok_or_else(|| {
            trace_error(format!("pod for GameServer {} not yet in the cache", gs.name()))
        })?;
        let pod_name = pod.metadata.name.clone().unwrap_or_default();

        let mut updated = gs.clone();

        // The SDK can ask for Ready before the address has been populated.
        let populate_address = gs
            .status
            .as_ref()
            .map_or(true, |status| status.node_name.is_empty());
        if populate_address {
            let node_name = super::pod_node_name(&pod)
                .ok_or_else(|| trace_error(format!("node not yet populated for Pod {pod_name}")))?;
            let node = self
                .informers
                .nodes
                .get_cluster(node_name)
                .ok_or_else(|| {
                    eyre::eyre!("error retrieving node {node_name} for Pod {pod_name}")
                })?;
            super::apply_address_and_ports(&mut updated, &node, &pod)?;
        }

        let status = container_status(&pod, &gs.spec.container).ok_or_else(|| {
            trace_error(format!(
                "game server container for GameServer {} has no status yet",
                gs.name()
            ))
        })?;
        if status.state.as_ref().and_then(|state| state.running.as_ref()).is_none() {
            return Err(trace_error(format!(
                "game server container for GameServer {} in namespace {} is not currently running, try again",
                gs.name(),
                gs.namespace()
            )));
        }

        if gs.annotation(READY_CONTAINER_ID_ANNOTATION).is_none() {
            updated.annotations_mut().insert(
                READY_CONTAINER_ID_ANNOTATION.into(),
                status.container_id.clone().unwrap_or_default(),
            );
        }

        let pod_has_annotation = pod
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|annotations| annotations.contains_key(READY_CONTAINER_ID_ANNOTATION));
        if !pod_has_annotation {
            let mut pod = (*pod).clone();
            pod.metadata.annotations.get_or_insert_with(Default::default).insert(
                READY_CONTAINER_ID_ANNOTATION.into(),
                updated
                    .annotation(READY_CONTAINER_ID_ANNOTATION)
                    .unwrap_or_default()
                    .into(),
            );
            self.client
                .update_pod(&pod)
                .await
                .wrap_err_with(|| format!("error updating ready annotation on Pod: {pod_name}"))?;
        }

        updated.set_state(GameServerState::Ready);
        let updated = super::update_game_server(&*self.client, &updated, gs.state())
            .await
            .wrap_err_with(|| {
                format!(
                    "error setting Ready, Port and address on GameServer {} Status",
                    gs.name()
                )
            })?;

        if populate_address {
            super::record_event(
                &*self.client,
                &updated,
                EventType::Normal,
                "Address and port populated",
            )
            .await;
        }
        super::record_event(
            &*self.client,
            &updated,
            EventType::Normal,
            "SDK.Ready() executed",
        )
        .await;
        Ok(updated)
    }

    /// Development game servers run outside the cluster, so they go straight
    /// to Ready with the annotated address and their static ports.
    async fn sync_development_game_server(&self, gs: GameServer) -> crate::Result<GameServer> {
        let address = gs.dev_address().unwrap_or_default().to_owned();
        tracing::debug!(%address, "syncing development game server");

        let mut updated = gs.clone();
        let ports = gs.spec.ports.iter().map(|port| port.status()).collect();
        let status = updated.status_mut();
        status.ports = ports;
        status.address = address.clone();
        status.addresses = vec![k8s_openapi::api::core::v1::NodeAddress {
            type_: "ExternalIP".into(),
            address: address.clone(),
        }];
        status.node_name = address;
        status.state = GameServerState::Ready;

        let updated = super::update_game_server(&*self.client, &updated, gs.state())
            .await
            .wrap_err_with(|| {
                format!("error updating development GameServer {} to Ready", gs.name())
            })?;
        super::record_event(
            &*self.client,
            &updated,
            EventType::Normal,
            "Address and port populated",
        )
        .await;
        Ok(updated)
    }

    async fn sync_shutdown_state(&self, gs: &GameServer) -> crate::Result<()> {
        tracing::debug!("syncing shutdown state");
        match self
            .client
            .delete_game_server(gs.namespace(), gs.name())
            .await
        {
            Ok(()) => {}
            Err(error) if error.is_not_found() => return Ok(()),
            Err(error) => {
                return Err(error)
                    .wrap_err_with(|| format!("error deleting Game Server {}", gs.name()))
            }
        }

        super::record_event(&*self.client, gs, EventType::Normal, "Deletion started").await;
        Ok(())
    }

    /// Moves `gs` to the terminal Error state, recording `message`.
    async fn move_to_error_state(&self, gs: GameServer, message: &str) -> crate::Result<GameServer> {
        let mut updated = gs.clone();
        updated.annotations_mut().insert(
            ERRORED_AT_ANNOTATION.into(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        updated.set_state(GameServerState::Error);

        let updated = super::update_game_server(&*self.client, &updated, gs.state())
            .await
            .wrap_err_with(|| format!("error moving GameServer {} to Error State", gs.name()))?;
        super::record_event(&*self.client, &updated, EventType::Warning, message).await;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        apis::{PortPolicy, DEV_ADDRESS_ANNOTATION},
        test::{game_server_fixture, node_fixture, FakeCluster, Verb},
    };

    fn controller(cluster: &Arc<FakeCluster>) -> Arc<Controller> {
        Controller::new(
            cluster.clone(),
            cluster.informers(),
            ControllerConfig {
                min_port: 10,
                max_port: 20,
                workers: 2,
                ..<_>::default()
            },
        )
    }

    async fn create(cluster: &FakeCluster, gs: GameServer) -> GameServer {
        cluster.create_game_server(&gs).await.unwrap()
    }

    #[tokio::test]
    async fn walks_the_lifecycle() {
        let cluster = FakeCluster::new();
        cluster.add_node(node_fixture("node-1", "12.12.12.12"));
        let controller = controller(&cluster);
        controller.port_allocator().sync_all();

        // Runs until the pod has to be scheduled.
        create(&cluster, game_server_fixture()).await;
        let error = controller.sync_game_server("default/test").await.unwrap_err();
        assert!(crate::k8s::is_trace(&error));

        let gs = cluster.game_server("default", "test").unwrap();
        assert_eq!(Some(GameServerState::Starting), gs.state());
        let host_port = gs.spec.ports[0].host_port.unwrap();
        assert!((10..=20).contains(&host_port));

        cluster.run_pod("default", "test", "node-1", "10.1.0.5");
        controller.sync_game_server("default/test").await.unwrap();
        let gs = cluster.game_server("default", "test").unwrap();
        let status = gs.status.clone().unwrap();
        assert_eq!(GameServerState::Scheduled, status.state);
        assert_eq!("12.12.12.12", status.address);
        assert_eq!("node-1", status.node_name);
        assert_eq!(host_port, status.ports[0].port);

        let mut ready = gs.clone();
        ready.set_state(GameServerState::RequestReady);
        cluster.update_game_server(&ready).await.unwrap();
        controller.sync_game_server("default/test").await.unwrap();

        let gs = cluster.game_server("default", "test").unwrap();
        assert_eq!(Some(GameServerState::Ready), gs.state());
        let container_id = gs.annotation(READY_CONTAINER_ID_ANNOTATION).unwrap();
        assert_eq!("containerd://container-test", container_id);
        let pod = cluster.pod("default", "test").unwrap();
        assert_eq!(
            Some(container_id),
            pod.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(READY_CONTAINER_ID_ANNOTATION))
                .map(String::as_str)
        );

        assert!(cluster.has_event("Normal Creating Port allocated"));
        assert!(cluster.has_event("Normal Creating Pod test created"));
        assert!(cluster.has_event("Normal Scheduled Address and port populated"));
        assert!(cluster.has_event("Normal Ready SDK.Ready() executed"));

        let mut shutdown = gs.clone();
        shutdown.set_state(GameServerState::Shutdown);
        cluster.update_game_server(&shutdown).await.unwrap();
        controller.sync_game_server("default/test").await.unwrap();
        assert!(cluster.has_event("Normal Shutdown Deletion started"));

        // The finalizer keeps the game server around until its pod is gone.
        let gs = cluster.game_server("default", "test").unwrap();
        assert!(gs.metadata.deletion_timestamp.is_some());
        let error = controller.sync_game_server("default/test").await.unwrap_err();
        assert!(crate::k8s::is_trace(&error));
        assert!(cluster.pod("default", "test").is_none());

        controller.sync_game_server("default/test").await.unwrap();
        assert!(cluster.game_server("default", "test").is_none());
    }

    #[tokio::test]
    async fn ready_container_id_is_kept() {
        let cluster = FakeCluster::new();
        cluster.add_node(node_fixture("node-1", "12.12.12.12"));
        let controller = controller(&cluster);
        controller.port_allocator().sync_all();

        create(&cluster, game_server_fixture()).await;
        let _ = controller.sync_game_server("default/test").await;
        cluster.run_pod("default", "test", "node-1", "10.1.0.5");
        controller.sync_game_server("default/test").await.unwrap();

        let request_ready = |cluster: &FakeCluster| {
            let mut gs = cluster.game_server("default", "test").unwrap();
            gs.set_state(GameServerState::RequestReady);
            gs
        };
        cluster.update_game_server(&request_ready(&cluster)).await.unwrap();
        controller.sync_game_server("default/test").await.unwrap();
        let gs = cluster.game_server("default", "test").unwrap();
        let first_id = gs.annotation(READY_CONTAINER_ID_ANNOTATION).unwrap().to_owned();

        // The game server container restarts and asks to be Ready again.
        cluster.modify_pod("default", "test", |pod| {
            for status in pod
                .status
                .iter_mut()
                .flat_map(|status| status.container_statuses.iter_mut().flatten())
            {
                status.container_id = Some(format!("containerd://{}-restarted", status.name));
            }
        });
        let pod_updates = cluster
            .actions_for("pods")
            .iter()
            .filter(|action| action.verb == Verb::Update)
            .count();
        cluster.update_game_server(&request_ready(&cluster)).await.unwrap();
        controller.sync_game_server("default/test").await.unwrap();

        let gs = cluster.game_server("default", "test").unwrap();
        assert_eq!(Some(GameServerState::Ready), gs.state());
        assert_eq!(Some(first_id.as_str()), gs.annotation(READY_CONTAINER_ID_ANNOTATION));

        let pod = cluster.pod("default", "test").unwrap();
        assert_eq!(
            Some(&first_id),
            pod.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(READY_CONTAINER_ID_ANNOTATION))
        );
        assert_eq!(
            pod_updates,
            cluster
                .actions_for("pods")
                .iter()
                .filter(|action| action.verb == Verb::Update)
                .count()
        );
    }

    #[tokio::test]
    async fn no_ports_skips_allocation() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);

        let mut gs = game_server_fixture();
        gs.spec.ports[0].port_policy = PortPolicy::Static;
        gs.spec.ports[0].host_port = Some(7777);
        let gs = create(&cluster, gs).await;
        assert_eq!(Some(GameServerState::Creating), gs.state());

        let error = controller.sync_game_server("default/test").await.unwrap_err();
        assert!(crate::k8s::is_trace(&error));
        assert_eq!(
            Some(GameServerState::Starting),
            cluster.game_server("default", "test").unwrap().state()
        );
        assert_eq!(1, cluster.actions_for("pods").len());
    }

    #[tokio::test]
    async fn invalid_pod_moves_to_error() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);
        cluster.fail_next(Verb::Create, "pods", || {
            ApiError::Invalid("spec.containers: Required value".into())
        });

        let mut gs = game_server_fixture();
        gs.spec.ports[0].port_policy = PortPolicy::Static;
        gs.spec.ports[0].host_port = Some(7777);
        create(&cluster, gs).await;

        controller.sync_game_server("default/test").await.unwrap();
        let gs = cluster.game_server("default", "test").unwrap();
        assert_eq!(Some(GameServerState::Error), gs.state());
        assert!(gs.annotation(ERRORED_AT_ANNOTATION).is_some());
        assert!(cluster.has_event("Warning Error Pod created is invalid"));

        // Error is terminal.
        controller.sync_game_server("default/test").await.unwrap();
        assert_eq!(
            Some(GameServerState::Error),
            cluster.game_server("default", "test").unwrap().state()
        );
    }

    #[tokio::test]
    async fn failed_update_returns_ports() {
        let cluster = FakeCluster::new();
        cluster.add_node(node_fixture("node-1", "12.12.12.12"));
        let controller = controller(&cluster);
        controller.port_allocator().sync_all();

        create(&cluster, game_server_fixture()).await;
        cluster.fail_next(Verb::Update, "gameservers", || ApiError::Conflict("stale".into()));

        let error = controller.sync_game_server("default/test").await.unwrap_err();
        assert!(crate::k8s::is_conflict(&error));
        assert_eq!(vec![11], controller.port_allocator().free_ports());
    }

    #[tokio::test]
    async fn development_game_server() {
        let cluster = FakeCluster::new();
        let controller = controller(&cluster);

        let mut gs = game_server_fixture();
        gs.annotations_mut()
            .insert(DEV_ADDRESS_ANNOTATION.into(), "1.1.1.1".into());
        gs.spec.ports[0].port_policy = PortPolicy::Static;
        gs.spec.ports[0].host_port = Some(7777);
        create(&cluster, gs).await;

        controller.sync_game_server("default/test").await.unwrap();
        let gs = cluster.game_server("default", "test").unwrap();
        let status = gs.status.unwrap();
        assert_eq!(GameServerState::Ready, status.state);
        assert_eq!("1.1.1.1", status.address);
        assert_eq!(7777, status.ports[0].port);
        assert!(cluster.actions_for("pods").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_drives_game_servers() {
        let cluster = FakeCluster::new();
        cluster.add_node(node_fixture("node-1", "12.12.12.12"));
        let controller = controller(&cluster);
        let (shutdown_tx, shutdown_rx) = crate::signal::channel(Default::default());
        let run = tokio::spawn(controller.clone().run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;

        create(&cluster, game_server_fixture()).await;
        assert!(
            cluster
                .wait_for_state("default", "test", GameServerState::Starting)
                .await
        );

        cluster.run_pending_pods("node-1", "10.1.0.5");
        assert!(
            cluster
                .wait_for_state("default", "test", GameServerState::Scheduled)
                .await
        );

        shutdown_tx.send(crate::signal::ShutdownKind::Testing).unwrap();
        run.await.unwrap().unwrap();
    }
}
