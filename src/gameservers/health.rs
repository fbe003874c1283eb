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

//! Marks game servers Unhealthy when their pod can no longer run them: the
//! pod could not be scheduled for lack of host ports, or the game server
//! container has terminated or been restarted since it became Ready.

use std::sync::{Arc, Weak};

use eyre::WrapErr;
use k8s_openapi::api::core::v1::Pod;

use crate::{
    apis::{
        pod::container_status, split_key, GameServerState, GAME_SERVER_CONTAINER_ANNOTATION,
        READY_CONTAINER_ID_ANNOTATION,
    },
    k8s::{trace_error, Change, Client, EventType, Informers},
    signal::ShutdownRx,
    workqueue::WorkQueue,
};

pub struct HealthController {
    client: Arc<dyn Client>,
    informers: Informers,
    queue: Arc<WorkQueue>,
}

/// Whether the pod failed to schedule for lack of free host ports.
fn is_unschedulable_for_ports(pod: &Pod) -> bool {
    pod.status
        .iter()
        .flat_map(|status| status.conditions.iter().flatten())
        .any(|condition| {
            condition.type_ == "PodScheduled"
                && condition.reason.as_deref() == Some("Unschedulable")
                && condition
                    .message
                    .as_deref()
                    .is_some_and(|message| message.contains("free ports"))
        })
}

fn pod_annotation<'pod>(pod: &'pod Pod, key: &str) -> Option<&'pod str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// Whether the game server container terminated, or is no longer the
/// container which was running when the game server became Ready.
fn is_game_server_container_down(pod: &Pod) -> bool {
    let Some(container) = pod_annotation(pod, GAME_SERVER_CONTAINER_ANNOTATION) else {
        return false;
    };
    let Some(status) = container_status(pod, container) else {
        return false;
    };

    if status
        .state
        .as_ref()
        .is_some_and(|state| state.terminated.is_some())
    {
        return true;
    }

    pod_annotation(pod, READY_CONTAINER_ID_ANNOTATION)
        .is_some_and(|ready_id| Some(ready_id) != status.container_id.as_deref())
}

pub(crate) fn is_unhealthy(pod: &Pod) -> bool {
    is_unschedulable_for_ports(pod) || is_game_server_container_down(pod)
}

impl HealthController {
    pub fn new(client: Arc<dyn Client>, informers: &Informers) -> Arc<Self> {
        let controller = Arc::new(Self {
            client,
            informers: informers.clone(),
            queue: WorkQueue::with_default_delays("agones.dev.HealthController"),
        });

        let weak = Arc::downgrade(&controller);
        informers.pods.add_handler(move |change| {
            let Some(controller) = Weak::upgrade(&weak) else {
                return;
            };

            let pod = match change {
                Change::Added(pod) | Change::Updated { new: pod, .. } => pod,
                Change::Deleted(_) => return,
            };

            if let Some(key) = super::owner_key(pod).filter(|_| is_unhealthy(pod)) {
                tracing::debug!(%key, "pod is unhealthy, queueing game server");
                controller.queue.enqueue(key);
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

        let Some(gs) = self.informers.game_servers.get(namespace, name) else {
            tracing::debug!("game server is no longer available for syncing");
            return Ok(());
        };

        if gs.is_being_deleted()
            || matches!(
                gs.state(),
                Some(GameServerState::Unhealthy | GameServerState::Error)
            )
        {
            return Ok(());
        }

        let Some(pod) = super::game_server_pod(&self.informers, &gs) else {
            // The missing pod controller takes care of this.
            return Ok(());
        };

        // A pod update that has not reached the cache yet.
        if let Some(ready_id) = gs.annotation(READY_CONTAINER_ID_ANNOTATION) {
            if pod_annotation(&pod, READY_CONTAINER_ID_ANNOTATION) != Some(ready_id) {
                return Err(trace_error(format!(
                    "pod {name} has not caught up with the ready container id of its GameServer"
                )));
            }
        }

        tracing::debug!("issue with game server pod, marking as unhealthy");
        let mut unhealthy = (*gs).clone();
        unhealthy.set_state(GameServerState::Unhealthy);
        let unhealthy = super::update_game_server(&*self.client, &unhealthy, gs.state())
            .await
            .wrap_err_with(|| format!("error updating GameServer {name} to unhealthy"))?;

        super::record_event(
            &*self.client,
            &unhealthy,
            EventType::Warning,
            "Issue with Gameserver pod",
        )
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodCondition, PodStatus,
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::test::{game_server_fixture, FakeCluster};

    fn pod_with_container(state: ContainerState, id: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.annotations = Some(
            [(GAME_SERVER_CONTAINER_ANNOTATION.to_owned(), "container".to_owned())]
                .into_iter()
                .collect(),
        );
        pod.status = Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "container".into(),
                container_id: Some(id.into()),
                state: Some(state),
                ..<_>::default()
            }]),
            ..<_>::default()
        });
        pod
    }

    #[test]
    fn unhealthy_pods() {
        assert!(!is_unhealthy(&Pod::default()));

        let mut pod = Pod::default();
        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "PodScheduled".into(),
                status: "False".into(),
                reason: Some("Unschedulable".into()),
                message: Some("0/3 nodes are available: 3 node(s) didn't have free ports for the requested pod ports.".into()),
                ..<_>::default()
            }]),
            ..<_>::default()
        });
        assert!(is_unhealthy(&pod));

        let terminated = ContainerState {
            terminated: Some(ContainerStateTerminated::default()),
            ..<_>::default()
        };
        assert!(is_unhealthy(&pod_with_container(terminated, "a")));

        let running = ContainerState::default();
        let mut pod = pod_with_container(running, "b");
        assert!(!is_unhealthy(&pod));

        pod.metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(READY_CONTAINER_ID_ANNOTATION.into(), "a".into());
        assert!(is_unhealthy(&pod));
    }

    #[tokio::test]
    async fn marks_unhealthy() {
        let cluster = FakeCluster::new();
        let controller = HealthController::new(cluster.clone(), cluster.informers());

        let mut gs = game_server_fixture();
        gs.apply_defaults();
        gs.set_state(GameServerState::Ready);
        let gs = cluster.add_game_server(gs);
        let pod = gs.pod(Vec::new()).unwrap();
        cluster.create_pod(&pod).await.unwrap();

        controller.sync_game_server("default/test").await.unwrap();
        assert_eq!(
            Some(GameServerState::Unhealthy),
            cluster.game_server("default", "test").unwrap().state()
        );
        assert!(cluster.has_event("Warning Unhealthy Issue with Gameserver pod"));

        // Already unhealthy, nothing more to do.
        controller.sync_game_server("default/test").await.unwrap();
        assert_eq!(1, cluster.events().len());
    }

    #[tokio::test]
    async fn waits_for_ready_container_id() {
        let cluster = FakeCluster::new();
        let controller = HealthController::new(cluster.clone(), cluster.informers());

        let mut gs = game_server_fixture();
        gs.apply_defaults();
        gs.set_state(GameServerState::Ready);
        gs.annotations_mut()
            .insert(READY_CONTAINER_ID_ANNOTATION.into(), "containerd://1".into());
        let gs = cluster.add_game_server(gs);
        cluster.create_pod(&gs.pod(Vec::new()).unwrap()).await.unwrap();

        let error = controller.sync_game_server("default/test").await.unwrap_err();
        assert!(crate::k8s::is_trace(&error));
        assert_eq!(
            Some(GameServerState::Ready),
            cluster.game_server("default", "test").unwrap().state()
        );
    }

    #[tokio::test]
    async fn skips_deleted_and_missing() {
        let cluster = FakeCluster::new();
        let controller = HealthController::new(cluster.clone(), cluster.informers());

        controller.sync_game_server("default/nope").await.unwrap();

        let mut gs = game_server_fixture();
        gs.apply_defaults();
        gs.set_state(GameServerState::Shutdown);
        cluster.add_game_server(gs);
        controller.sync_game_server("default/test").await.unwrap();
        assert!(cluster.actions_for("gameservers").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_container_is_queued() {
        let cluster = FakeCluster::new();
        let controller = HealthController::new(cluster.clone(), cluster.informers());
        let (shutdown_tx, shutdown_rx) = crate::signal::channel(Default::default());
        tokio::spawn(controller.clone().run(shutdown_rx));

        let mut gs = game_server_fixture();
        gs.apply_defaults();
        gs.set_state(GameServerState::Ready);
        let gs = cluster.add_game_server(gs);
        cluster.create_pod(&gs.pod(Vec::new()).unwrap()).await.unwrap();
        cluster.run_pod("default", "test", "node-1", "10.1.0.5");
        cluster.modify_pod("default", "test", |pod| {
            let statuses = pod
                .status
                .as_mut()
                .and_then(|status| status.container_statuses.as_mut())
                .unwrap();
            statuses[0].state = Some(ContainerState {
                terminated: Some(ContainerStateTerminated::default()),
                ..<_>::default()
            });
        });

        assert!(
            cluster
                .wait_for_state("default", "test", GameServerState::Unhealthy)
                .await
        );
        shutdown_tx.send(crate::signal::ShutdownKind::Testing).unwrap();
    }
}
