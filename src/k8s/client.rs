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

use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use kube::{
    api::{DeleteParams, PostParams},
    runtime::events::{Event, EventType, Recorder, Reporter},
    Api,
};

use super::ApiError;
use crate::apis::{GameServer, GameServerSet};

/// The writes the controllers and the SDK server make against the cluster.
/// Reads always go through the informer caches.
#[async_trait::async_trait]
pub trait Client: Send + Sync + 'static {
    async fn get_game_server(&self, namespace: &str, name: &str) -> Result<GameServer, ApiError>;
    async fn create_game_server(&self, gs: &GameServer) -> Result<GameServer, ApiError>;
    /// Replaces the game server, failing with [`ApiError::Conflict`] when its
    /// resource version is stale.
    async fn update_game_server(&self, gs: &GameServer) -> Result<GameServer, ApiError>;
    /// Deletes the game server with background propagation.
    async fn delete_game_server(&self, namespace: &str, name: &str) -> Result<(), ApiError>;

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ApiError>;
    async fn update_pod(&self, pod: &Pod) -> Result<Pod, ApiError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ApiError>;

    async fn update_game_server_set_status(
        &self,
        gss: &GameServerSet,
    ) -> Result<GameServerSet, ApiError>;

    /// Records a kubernetes event against `object`. Failures are logged, not
    /// returned.
    async fn record_event(
        &self,
        object: ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    );
}

/// A [`Client`] talking to the kubernetes API server.
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
    reporter: Reporter,
}

impl KubeClient {
    pub fn new(client: kube::Client, controller: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.into(),
                instance: std::env::var("HOSTNAME").ok(),
            },
        }
    }

    fn game_servers(&self, namespace: &str) -> Api<GameServer> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_and_name<K: kube::Resource>(object: &K) -> Result<(&str, &str), ApiError> {
    let meta = object.meta();
    let namespace = meta.namespace.as_deref().unwrap_or("default");
    let name = meta
        .name
        .as_deref()
        .ok_or_else(|| ApiError::Invalid("object has no name".into()))?;
    Ok((namespace, name))
}

#[async_trait::async_trait]
impl Client for KubeClient {
    async fn get_game_server(&self, namespace: &str, name: &str) -> Result<GameServer, ApiError> {
        Ok(self.game_servers(namespace).get(name).await?)
    }

    async fn create_game_server(&self, gs: &GameServer) -> Result<GameServer, ApiError> {
        let namespace = gs.metadata.namespace.as_deref().unwrap_or("default");
        Ok(self
            .game_servers(namespace)
            .create(&PostParams::default(), gs)
            .await?)
    }

    async fn update_game_server(&self, gs: &GameServer) -> Result<GameServer, ApiError> {
        let (namespace, name) = namespace_and_name(gs)?;
        Ok(self
            .game_servers(namespace)
            .replace(name, &PostParams::default(), gs)
            .await?)
    }

    async fn delete_game_server(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        self.game_servers(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ApiError> {
        let (namespace, _) = namespace_and_name(pod)?;
        Ok(self
            .pods(namespace)
            .create(&PostParams::default(), pod)
            .await?)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, ApiError> {
        let (namespace, name) = namespace_and_name(pod)?;
        Ok(self
            .pods(namespace)
            .replace(name, &PostParams::default(), pod)
            .await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn update_game_server_set_status(
        &self,
        gss: &GameServerSet,
    ) -> Result<GameServerSet, ApiError> {
        let (namespace, name) = namespace_and_name(gss)?;
        let api: Api<GameServerSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace_status(name, &PostParams::default(), serde_json::to_vec(gss)?)
            .await?)
    }

    async fn record_event(
        &self,
        object: ObjectReference,
        type_: EventType,
        reason: &str,
        message: &str,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object);
        let event = Event {
            type_,
            reason: reason.into(),
            note: Some(message.into()),
            action: reason.into(),
            secondary: None,
        };

        if let Err(error) = recorder.publish(event).await {
            tracing::warn!(%error, %reason, "failed to record event");
        }
    }
}
