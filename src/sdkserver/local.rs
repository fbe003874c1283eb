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

//! An SDK that never leaves the process, for developing game servers
//! without a cluster.

use std::{collections::HashMap, sync::Arc, time::Duration};

use k8s_openapi::chrono::Utc;
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};
use tonic::{Request, Response, Status, Streaming};

use super::WatchStream;
use crate::{
    apis::{GameServerState, Health, NODE_POD_IP_ADDRESS_TYPE, SDK_METADATA_PREFIX},
    generated::agones::dev::sdk::{
        self,
        game_server::{spec, status, ObjectMeta, Spec, Status as GameServerStatus},
        sdk_server::Sdk,
        Empty, KeyValue,
    },
};

/// The game server served in local mode.
pub fn default_game_server() -> sdk::GameServer {
    sdk::GameServer {
        object_meta: Some(ObjectMeta {
            name: "local".into(),
            namespace: "default".into(),
            uid: "1234".into(),
            resource_version: "v1".into(),
            generation: 1,
            creation_timestamp: Utc::now().timestamp(),
            deletion_timestamp: 0,
            annotations: HashMap::from([("annotation".into(), "true".into())]),
            labels: HashMap::from([("islocal".into(), "true".into())]),
        }),
        spec: Some(Spec {
            health: Some(spec::Health {
                disabled: false,
                period_seconds: Health::DEFAULT_PERIOD_SECONDS,
                failure_threshold: Health::DEFAULT_FAILURE_THRESHOLD,
                initial_delay_seconds: Health::DEFAULT_INITIAL_DELAY_SECONDS,
            }),
        }),
        status: Some(GameServerStatus {
            state: GameServerState::Ready.to_string(),
            address: "127.0.0.1".into(),
            addresses: vec![status::Address {
                r#type: NODE_POD_IP_ADDRESS_TYPE.into(),
                address: "127.0.0.1".into(),
            }],
            ports: vec![status::Port {
                name: "default".into(),
                port: 7777,
            }],
            counters: HashMap::new(),
            lists: HashMap::new(),
        }),
    }
}

struct Shared {
    gs: Mutex<sdk::GameServer>,
    updates: broadcast::Sender<sdk::GameServer>,
}

impl Shared {
    fn update(&self, f: impl FnOnce(&mut sdk::GameServer)) {
        let gs = {
            let mut gs = self.gs.lock();
            f(&mut gs);
            gs.clone()
        };
        let _ = self.updates.send(gs);
    }

    fn set_state(&self, state: GameServerState) {
        tracing::info!(%state, "setting local game server state");
        self.update(|gs| {
            gs.status.get_or_insert_with(Default::default).state = state.to_string();
        });
    }
}

/// Keeps a game server in memory and applies the SDK calls to it directly.
pub struct LocalSdk {
    shared: Arc<Shared>,
    reserve_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Default for LocalSdk {
    fn default() -> Self {
        Self::new(default_game_server())
    }
}

impl LocalSdk {
    pub fn new(gs: sdk::GameServer) -> Self {
        let (updates, _) = broadcast::channel(32);
        Self {
            shared: Arc::new(Shared {
                gs: Mutex::new(gs),
                updates,
            }),
            reserve_timer: Mutex::new(None),
        }
    }

    pub fn game_server(&self) -> sdk::GameServer {
        self.shared.gs.lock().clone()
    }

    fn stop_reserve_timer(&self) {
        if let Some(timer) = self.reserve_timer.lock().take() {
            timer.abort();
        }
    }

    fn set_metadata(&self, kv: KeyValue, label: bool) {
        tracing::info!(key = %kv.key, value = %kv.value, label, "setting local game server metadata");
        self.shared.update(|gs| {
            let meta = gs.object_meta.get_or_insert_with(Default::default);
            let map = if label {
                &mut meta.labels
            } else {
                &mut meta.annotations
            };
            map.insert(format!("{SDK_METADATA_PREFIX}{}", kv.key), kv.value);
        });
    }
}

#[tonic::async_trait]
impl Sdk for LocalSdk {
    async fn ready(&self, _: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.stop_reserve_timer();
        self.shared.set_state(GameServerState::Ready);
        Ok(Response::new(Empty {}))
    }

    async fn allocate(&self, _: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.stop_reserve_timer();
        self.shared.set_state(GameServerState::Allocated);
        Ok(Response::new(Empty {}))
    }

    async fn shutdown(&self, _: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.stop_reserve_timer();
        self.shared.set_state(GameServerState::Shutdown);
        Ok(Response::new(Empty {}))
    }

    async fn health(&self, request: Request<Streaming<Empty>>) -> Result<Response<Empty>, Status> {
        let mut stream = request.into_inner();
        while stream.message().await?.is_some() {
            tracing::info!("health ping received");
        }
        Ok(Response::new(Empty {}))
    }

    async fn get_game_server(
        &self,
        _: Request<Empty>,
    ) -> Result<Response<sdk::GameServer>, Status> {
        Ok(Response::new(self.game_server()))
    }

    type WatchGameServerStream = WatchStream;

    async fn watch_game_server(
        &self,
        _: Request<Empty>,
    ) -> Result<Response<Self::WatchGameServerStream>, Status> {
        let mut updates = self.shared.updates.subscribe();
        let current = self.game_server();

        let stream = async_stream::stream! {
            yield Ok(current);
            loop {
                match updates.recv().await {
                    Ok(gs) => yield Ok(gs),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "watcher fell behind, skipping updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }

    async fn set_label(&self, request: Request<KeyValue>) -> Result<Response<Empty>, Status> {
        self.set_metadata(request.into_inner(), true);
        Ok(Response::new(Empty {}))
    }

    async fn set_annotation(&self, request: Request<KeyValue>) -> Result<Response<Empty>, Status> {
        self.set_metadata(request.into_inner(), false);
        Ok(Response::new(Empty {}))
    }

    async fn reserve(&self, request: Request<sdk::Duration>) -> Result<Response<Empty>, Status> {
        let seconds = u64::try_from(request.into_inner().seconds).unwrap_or_default();
        self.stop_reserve_timer();
        self.shared.set_state(GameServerState::Reserved);

        if seconds > 0 {
            let shared = self.shared.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                shared.set_state(GameServerState::Ready);
            });
            *self.reserve_timer.lock() = Some(timer);
        }

        Ok(Response::new(Empty {}))
    }
}

impl Drop for LocalSdk {
    fn drop(&mut self) {
        self.stop_reserve_timer();
    }
}
