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

//! Plumbing between the controllers and the kubernetes API.

pub mod client;
pub mod error;
pub mod informer;

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{runtime::watcher, Api};

pub use self::{
    client::{Client, KubeClient},
    error::{is_conflict, is_trace, trace_error, ApiError, TraceError},
    informer::{Change, Informer},
};
pub use kube::runtime::events::EventType;

use crate::{
    apis::{GameServer, GameServerSet},
    signal::ShutdownRx,
};

/// The caches shared by every controller.
#[derive(Clone)]
pub struct Informers {
    pub game_servers: Arc<Informer<GameServer>>,
    pub game_server_sets: Arc<Informer<GameServerSet>>,
    pub pods: Arc<Informer<Pod>>,
    pub nodes: Arc<Informer<Node>>,
}

impl Default for Informers {
    fn default() -> Self {
        Self {
            game_servers: Informer::new(),
            game_server_sets: Informer::new(),
            pods: Informer::new(),
            nodes: Informer::new(),
        }
    }
}

impl Informers {
    /// Starts watching the cluster. Game servers, sets and pods are watched
    /// in `namespace`, or every namespace when `None`.
    pub fn spawn(
        &self,
        client: kube::Client,
        namespace: Option<&str>,
        shutdown: &ShutdownRx,
    ) -> Vec<tokio::task::JoinHandle<crate::Result<()>>> {
        fn api<K>(client: &kube::Client, namespace: Option<&str>) -> Api<K>
        where
            K: kube::Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>,
        {
            match namespace {
                Some(namespace) => Api::namespaced(client.clone(), namespace),
                None => Api::all(client.clone()),
            }
        }

        vec![
            tokio::spawn(self.game_servers.clone().run(
                api(&client, namespace),
                watcher::Config::default(),
                shutdown.clone(),
            )),
            tokio::spawn(self.game_server_sets.clone().run(
                api(&client, namespace),
                watcher::Config::default(),
                shutdown.clone(),
            )),
            tokio::spawn(self.pods.clone().run(
                api(&client, namespace),
                watcher::Config::default(),
                shutdown.clone(),
            )),
            tokio::spawn(self.nodes.clone().run(
                Api::all(client),
                watcher::Config::default(),
                shutdown.clone(),
            )),
        ]
    }

    pub async fn wait_for_sync(&self) {
        tokio::join!(
            self.game_servers.wait_for_sync(),
            self.game_server_sets.wait_for_sync(),
            self.pods.wait_for_sync(),
            self.nodes.wait_for_sync(),
        );
    }

    pub fn has_synced(&self) -> bool {
        self.game_servers.has_synced()
            && self.game_server_sets.has_synced()
            && self.pods.has_synced()
            && self.nodes.has_synced()
    }
}

/// The reference used to record events against `object`.
pub fn object_reference<K: kube::Resource<DynamicType = ()>>(
    object: &K,
) -> k8s_openapi::api::core::v1::ObjectReference {
    object.object_ref(&())
}
