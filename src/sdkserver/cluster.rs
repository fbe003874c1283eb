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

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use eyre::WrapErr;
use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::{SecondsFormat, Utc},
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};
use tonic::{Request, Response, Status, Streaming};

use super::{convert, HealthTracker, WatchStream};
use crate::{
    apis::{GameServer, GameServerState, LAST_ALLOCATED_ANNOTATION, SDK_METADATA_PREFIX},
    gameservers::{record_event, update_game_server},
    generated::agones::dev::sdk::{self, sdk_server::Sdk, Empty, KeyValue},
    k8s::{trace_error, Change, Client, EventType, Informer},
    signal::ShutdownRx,
    workqueue::WorkQueue,
};

const STATE_PREFIX: &str = "state/";
const LABEL_PREFIX: &str = "updateLabel/";
const ANNOTATION_PREFIX: &str = "updateAnnotation/";

/// A write queued by an SDK call.
#[derive(Debug, PartialEq, Eq)]
enum Update<'a> {
    State(GameServerState),
    Label { key: &'a str, value: &'a str },
    Annotation { key: &'a str, value: &'a str },
}

fn state_key(state: GameServerState) -> String {
    format!("{STATE_PREFIX}{state}")
}

fn metadata_key(prefix: &str, key: &str, value: &str) -> String {
    format!("{prefix}{SDK_METADATA_PREFIX}{key}/{value}")
}

fn parse_metadata<'a>(key: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    key.strip_prefix(prefix)?
        .strip_prefix(SDK_METADATA_PREFIX)?
        .split_once('/')
}

fn parse_key(key: &str) -> Option<Update<'_>> {
    if let Some(state) = key.strip_prefix(STATE_PREFIX) {
        return state.parse().ok().map(Update::State);
    }
    if let Some((key, value)) = parse_metadata(key, LABEL_PREFIX) {
        return Some(Update::Label { key, value });
    }
    parse_metadata(key, ANNOTATION_PREFIX).map(|(key, value)| Update::Annotation { key, value })
}

fn validate_metadata_key(key: &str) -> Result<(), Status> {
    if key.is_empty() || key.contains('/') {
        return Err(Status::invalid_argument(format!("invalid metadata key {key:?}")));
    }
    Ok(())
}

/// The SDK of a game server running in a cluster.
///
/// Every write goes through a single worker queue, so the calls of the
/// game server are applied one at a time and in order.
pub struct GameServerSdk {
    name: String,
    namespace: String,
    client: Arc<dyn Client>,
    game_servers: Arc<Informer<GameServer>>,
    queue: Arc<WorkQueue>,
    health: OnceCell<HealthTracker>,
    reserve_duration: Mutex<Option<Duration>>,
    reserve_timer: Mutex<Option<JoinHandle<()>>>,
    updates: broadcast::Sender<Arc<GameServer>>,
}

impl GameServerSdk {
    /// `game_servers` is expected to watch the game server named `name`.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        client: Arc<dyn Client>,
        game_servers: Arc<Informer<GameServer>>,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(32);
        let sdk = Arc::new(Self {
            name: name.into(),
            namespace: namespace.into(),
            client,
            game_servers: game_servers.clone(),
            queue: WorkQueue::with_default_delays("agones.dev.SDKServer"),
            health: OnceCell::new(),
            reserve_duration: Mutex::new(None),
            reserve_timer: Mutex::new(None),
            updates,
        });

        let weak = Arc::downgrade(&sdk);
        game_servers.add_handler(move |change| {
            let Some(sdk) = Weak::upgrade(&weak) else {
                return;
            };

            if let Change::Added(gs) | Change::Updated { new: gs, .. } = change {
                if gs.name() == sdk.name && gs.namespace() == sdk.namespace {
                    // Nobody watching is fine.
                    let _ = sdk.updates.send(gs.clone());
                }
            }
        });

        sdk
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Whether the game server is sending its health pings in time. Always
    /// true until [`GameServerSdk::run`] started tracking them.
    pub fn healthy(&self) -> bool {
        self.health.get().map_or(true, HealthTracker::healthy)
    }

    fn game_server(&self) -> crate::Result<Arc<GameServer>> {
        self.game_servers
            .get(&self.namespace, &self.name)
            .ok_or_else(|| {
                trace_error(format!(
                    "GameServer {}/{} is not in the cache",
                    self.namespace, self.name
                ))
            })
    }

    /// Waits for the game server to be cached, then tracks health and
    /// applies the queued writes until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownRx) -> crate::Result<()> {
        self.game_servers.wait_for_sync().await;
        let gs = self
            .game_servers
            .get(&self.namespace, &self.name)
            .ok_or_else(|| eyre::eyre!("GameServer {}/{} not found", self.namespace, self.name))?;

        let health = self.health.get_or_init(|| HealthTracker::new(&gs.spec.health));
        tracing::info!(
            gs = gs.name(),
            disabled = health.disabled(),
            period = ?health.period(),
            "starting sdk server"
        );

        let reserved_until = gs
            .status
            .as_ref()
            .filter(|status| status.state == GameServerState::Reserved)
            .and_then(|status| status.reserved_until.as_ref());
        if let Some(until) = reserved_until {
            self.reset_reserve_after((until.0 - Utc::now()).to_std().unwrap_or_default());
        }

        let health_checks = {
            let sdk = self.clone();
            let mut shutdown = shutdown.clone();
            let period = health.period();
            let enabled = !health.disabled() && !period.is_zero();
            async move {
                if !enabled {
                    return;
                }

                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => sdk.check_health(),
                        _ = shutdown.changed() => return,
                    }
                }
            }
        };

        let sdk = self.clone();
        let handler = move |key: String| {
            let sdk = sdk.clone();
            async move { sdk.sync(&key).await }
        };

        tokio::join!(
            health_checks,
            self.queue.clone().run(1, handler, shutdown),
        );
        self.stop_reserve_timer();
        Ok(())
    }

    fn check_health(&self) {
        let Some(health) = self.health.get() else {
            return;
        };

        health.check();
        if !health.healthy() {
            tracing::debug!("health check failure threshold reached");
            self.queue
                .enqueue_immediately(state_key(GameServerState::Unhealthy));
        }
    }

    fn enqueue_state(&self, state: GameServerState) {
        tracing::debug!(%state, "adding state update to queue");
        self.queue.enqueue_immediately(state_key(state));
    }

    fn reset_reserve_after(&self, duration: Duration) {
        let queue = Arc::downgrade(&self.queue);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(queue) = Weak::upgrade(&queue) {
                tracing::debug!("reservation expired");
                queue.enqueue_immediately(state_key(GameServerState::RequestReady));
            }
        });

        if let Some(previous) = self.reserve_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    fn stop_reserve_timer(&self) {
        if let Some(timer) = self.reserve_timer.lock().take() {
            timer.abort();
        }
    }

    /// Applies the write queued under `key`.
    #[tracing::instrument(skip_all, fields(key = %key))]
    pub async fn sync(&self, key: &str) -> crate::Result<()> {
        match parse_key(key) {
            Some(Update::State(state)) => self.update_state(state).await,
            Some(Update::Label { key, value }) => {
                let mut gs = (*self.game_server()?).clone();
                gs.labels_mut()
                    .insert(format!("{SDK_METADATA_PREFIX}{key}"), value.into());
                self.client
                    .update_game_server(&gs)
                    .await
                    .wrap_err("error updating GameServer label")?;
                Ok(())
            }
            Some(Update::Annotation { key, value }) => {
                let mut gs = (*self.game_server()?).clone();
                gs.annotations_mut()
                    .insert(format!("{SDK_METADATA_PREFIX}{key}"), value.into());
                self.client
                    .update_game_server(&gs)
                    .await
                    .wrap_err("error updating GameServer annotation")?;
                Ok(())
            }
            None => {
                tracing::error!("invalid sdk queue key");
                Ok(())
            }
        }
    }

    async fn update_state(&self, state: GameServerState) -> crate::Result<()> {
        let gs = self.game_server()?;

        // Shutdown and Unhealthy are final.
        if gs.is_being_deleted() || gs.is_state(GameServerState::Unhealthy) {
            tracing::debug!(current = ?gs.state(), %state, "ignoring state update");
            return Ok(());
        }

        let reserve_duration = *self.reserve_duration.lock();
        let mut updated = (*gs).clone();
        updated.set_state(state);
        updated.status_mut().reserved_until = match (state, reserve_duration) {
            (GameServerState::Reserved, Some(duration)) => Some(Time(
                Utc::now() + k8s_openapi::chrono::Duration::from_std(duration)?,
            )),
            _ => None,
        };
        if state == GameServerState::Allocated {
            updated.annotations_mut().insert(
                LAST_ALLOCATED_ANNOTATION.into(),
                Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            );
        }

        let updated = update_game_server(&*self.client, &updated, gs.state())
            .await
            .wrap_err("error updating GameServer state")?;

        let (type_, message) = match state {
            GameServerState::Unhealthy => (EventType::Warning, "Health check failure".to_owned()),
            GameServerState::Reserved => match reserve_duration {
                Some(duration) => {
                    self.reset_reserve_after(duration);
                    (EventType::Normal, format!("SDK state change, for {duration:?}"))
                }
                None => (EventType::Normal, "SDK state change".to_owned()),
            },
            _ => (EventType::Normal, "SDK state change".to_owned()),
        };
        record_event(&*self.client, &updated, type_, &message).await;
        Ok(())
    }

    fn set_metadata(&self, prefix: &str, kv: KeyValue) -> Result<Response<Empty>, Status> {
        validate_metadata_key(&kv.key)?;
        tracing::debug!(key = %kv.key, value = %kv.value, "adding metadata update to queue");
        self.queue
            .enqueue_immediately(metadata_key(prefix, &kv.key, &kv.value));
        Ok(Response::new(Empty {}))
    }
}

#[tonic::async_trait]
impl Sdk for GameServerSdk {
    async fn ready(&self, _: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.stop_reserve_timer();
        self.enqueue_state(GameServerState::RequestReady);
        Ok(Response::new(Empty {}))
    }

    async fn allocate(&self, _: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.stop_reserve_timer();
        self.enqueue_state(GameServerState::Allocated);
        Ok(Response::new(Empty {}))
    }

    async fn shutdown(&self, _: Request<Empty>) -> Result<Response<Empty>, Status> {
        self.stop_reserve_timer();
        self.enqueue_state(GameServerState::Shutdown);
        Ok(Response::new(Empty {}))
    }

    async fn health(&self, request: Request<Streaming<Empty>>) -> Result<Response<Empty>, Status> {
        let mut stream = request.into_inner();
        while stream.message().await?.is_some() {
            tracing::trace!("health ping received");
            if let Some(health) = self.health.get() {
                health.touch();
            }
        }

        tracing::debug!("health stream closed");
        Ok(Response::new(Empty {}))
    }

    async fn get_game_server(
        &self,
        _: Request<Empty>,
    ) -> Result<Response<sdk::GameServer>, Status> {
        self.game_server()
            .map(|gs| Response::new(convert(&gs)))
            .map_err(|error| Status::unavailable(error.to_string()))
    }

    type WatchGameServerStream = WatchStream;

    async fn watch_game_server(
        &self,
        _: Request<Empty>,
    ) -> Result<Response<Self::WatchGameServerStream>, Status> {
        let mut updates = self.updates.subscribe();
        let current = self.game_servers.get(&self.namespace, &self.name);

        let stream = async_stream::stream! {
            if let Some(gs) = current {
                yield Ok(convert(&gs));
            }

            loop {
                match updates.recv().await {
                    Ok(gs) => yield Ok(convert(&gs)),
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
        self.set_metadata(LABEL_PREFIX, request.into_inner())
    }

    async fn set_annotation(&self, request: Request<KeyValue>) -> Result<Response<Empty>, Status> {
        self.set_metadata(ANNOTATION_PREFIX, request.into_inner())
    }

    async fn reserve(&self, request: Request<sdk::Duration>) -> Result<Response<Empty>, Status> {
        let seconds = u64::try_from(request.into_inner().seconds).unwrap_or_default();
        self.stop_reserve_timer();
        *self.reserve_duration.lock() = (seconds > 0).then(|| Duration::from_secs(seconds));
        self.enqueue_state(GameServerState::Reserved);
        Ok(Response::new(Empty {}))
    }
}
