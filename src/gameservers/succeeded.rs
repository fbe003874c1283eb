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

//! Shuts down game servers whose pod ran to completion, which happens when
//! every container of a pod with `restartPolicy: Never` exits cleanly.

use std::sync::{Arc, Weak};

use eyre::WrapErr;
use k8s_openapi::api::core::v1::Pod;

use crate::{
    apis::{pod::is_game_server_pod, split_key, GameServerState},
    k8s::{Change, Client, EventType, Informers},
    signal::ShutdownRx,
    workqueue::WorkQueue,
};

const SUCCEEDED_PHASE: &str = "Succeeded";

pub struct SucceededController {
    client: Arc<dyn Client>,
    informers: Informers,
    queue: Arc<WorkQueue>,
}

fn is_succeeded(pod: &Pod) -> bool {
    is_game_server_pod(pod)
        && pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some(SUCCEEDED_PHASE)
}

impl SucceededController {
    pub fn new(client: Arc<dyn Client>, informers: &Informers) -> Arc<Self> {
        let controller = Arc::new(Self {
            client,
            informers: informers.clone(),
            queue: WorkQueue::with_default_delays("agones.dev.SucceededController"),
        });

        let weak = Arc::downgrade(&controller);
        informers.pods.add_handler(move |change| {
            let Some(controller) = Weak::upgrade(&weak) else {
                return;
            };

            if let Change::Added(pod) | Change::Updated { new: pod, .. } = change {
                if is_succeeded(pod) {
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

    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn sync_pod(&self, key: &str) -> crate::Result<()> {
        let (namespace, name) = match split_key(key) {
            Ok(parts) => parts,
            Err(error) => {
                tracing::error!(%error, "invalid resource key");
                return Ok(());
            }
        };

        if !self
            .informers
            .pods
            .get(namespace, name)
            .is_some_and(|pod| is_succeeded(&pod))
        {
            return Ok(());
        }

        let Some(gs) = self.informers.game_servers.get(namespace, name) else {
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

        tracing::debug!("pod succeeded, shutting down game server");
        let mut shutdown = (*gs).clone();
        shutdown.set_state(GameServerState::Shutdown);
        let shutdown = super::update_game_server(&*self.client, &shutdown, gs.state())
            .await
            .wrap_err_with(|| format!("error updating GameServer {name} to Shutdown"))?;

        super::record_event(
            &*self.client,
            &shutdown,
            EventType::Normal,
            "Pod is in Succeeded state",
        )
        .await;
        Ok(())
    }
}
