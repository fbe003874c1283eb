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

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use eyre::WrapErr;
use kube::{runtime::watcher, Api};
use tokio::net::TcpListener;

use crate::{
    apis::{GameServer, SdkServerLogLevel},
    k8s::{Informer, KubeClient},
    sdkserver::{self, http, GameServerSdk, LocalSdk},
    signal::{ShutdownKind, ShutdownRx},
};

/// Run the SDK server next to a game server.
#[derive(clap::Args, Clone, Debug)]
pub struct SdkServer {
    /// Serve an in-memory game server instead of connecting to a cluster.
    #[clap(long, env = "LOCAL")]
    pub local: bool,
    #[clap(long, env = "SDK_GRPC_PORT", default_value_t = 59357)]
    pub grpc_port: u16,
    #[clap(long, env = "SDK_HTTP_PORT", default_value_t = 9358)]
    pub http_port: u16,
    /// The address the gRPC and HTTP servers bind to.
    #[clap(long, env = "ADDRESS", default_value = "localhost")]
    pub address: String,
    /// Seconds to wait before starting.
    #[clap(long, env = "DELAY", default_value_t = 0)]
    pub delay: u64,
    /// Seconds to run before shutting down. Runs until signalled when zero.
    #[clap(long, env = "TIMEOUT", default_value_t = 0)]
    pub timeout: u64,
    #[clap(long, env = "GAMESERVER_NAME")]
    pub gameserver_name: Option<String>,
    #[clap(long, env = "POD_NAMESPACE", default_value = "default")]
    pub pod_namespace: String,
    /// The port serving `/healthz` and `/gshealthz` to the kubelet.
    #[clap(long, env = "HEALTH_PORT", default_value_t = 8080)]
    pub health_port: u16,
    #[clap(long, env = "LOG_LEVEL", default_value = "Info")]
    pub log_level: SdkServerLogLevel,
}

impl SdkServer {
    /// Serves the SDK until `shutdown_rx` fires or the timeout elapses.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, mut shutdown_rx: ShutdownRx) -> crate::Result<()> {
        if self.delay > 0 {
            tracing::info!(seconds = self.delay, "delaying start");
            tokio::time::sleep(Duration::from_secs(self.delay)).await;
        }

        let (shutdown_tx, shutdown) = crate::signal::channel(ShutdownKind::Normal);
        let timeout = self.timeout;
        tokio::spawn(async move {
            let timeout = async {
                if timeout > 0 {
                    tokio::time::sleep(Duration::from_secs(timeout)).await;
                    tracing::info!(seconds = timeout, "timeout reached, shutting down");
                } else {
                    std::future::pending::<()>().await;
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {}
                _ = timeout => {}
            }
            shutdown_tx.send(ShutdownKind::Normal).ok();
        });

        let grpc = TcpListener::bind((self.address.as_str(), self.grpc_port))
            .await
            .wrap_err_with(|| format!("failed to bind the sdk grpc port {}", self.grpc_port))?;
        let gateway = TcpListener::bind((self.address.as_str(), self.http_port))
            .await
            .wrap_err_with(|| format!("failed to bind the sdk http port {}", self.http_port))?;
        let grpc_address = grpc.local_addr()?;

        if self.local {
            tracing::info!("Starting SDK server in local mode");
            let sdk = Arc::new(LocalSdk::default());
            tokio::try_join!(
                sdkserver::serve(sdk, grpc, shutdown.clone()),
                http::serve_gateway(gateway, grpc_address, shutdown),
            )?;
            return Ok(());
        }

        let name = self
            .gameserver_name
            .clone()
            .ok_or_else(|| eyre::eyre!("--gameserver-name is required outside of local mode"))?;
        let health = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.health_port))
            .await
            .wrap_err_with(|| format!("failed to bind the health port {}", self.health_port))?;

        let kube_client = kube::Client::try_default()
            .await
            .wrap_err("failed to create the kubernetes client")?;
        tracing::info!(gameserver = %name, namespace = %self.pod_namespace, "Starting SDK server");

        let game_servers = Informer::<GameServer>::new();
        let watch = tokio::spawn(game_servers.clone().run(
            Api::namespaced(kube_client.clone(), &self.pod_namespace),
            watcher::Config::default().fields(&format!("metadata.name={name}")),
            shutdown.clone(),
        ));

        let sdk = GameServerSdk::new(
            name,
            self.pod_namespace.clone(),
            Arc::new(KubeClient::new(kube_client, "gameserver-sidecar")),
            game_servers,
        );

        let healthy: http::HealthCheck = {
            let sdk = sdk.clone();
            Arc::new(move || sdk.healthy())
        };

        tokio::try_join!(
            sdk.clone().run(shutdown.clone()),
            sdkserver::serve(sdk, grpc, shutdown.clone()),
            http::serve_gateway(gateway, grpc_address, shutdown.clone()),
            http::serve_health(health, healthy, shutdown),
            async move { watch.await? },
        )?;

        Ok(())
    }
}
