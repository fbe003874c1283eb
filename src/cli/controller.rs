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

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use eyre::WrapErr;

use crate::{
    admin,
    apis::SdkServerLogLevel,
    gameservers::{self, SidecarConfig},
    gameserversets,
    k8s::{Client, Informers, KubeClient},
    signal::ShutdownRx,
    webhooks::{self, WebhookConfig},
};

/// Gates the pod mutation rewriting passthrough container ports.
const PASSTHROUGH_PORT_POLICY: &str = "PassthroughPortPolicy";

/// Run the GameServer and GameServerSet controllers along with the
/// admission webhooks.
#[derive(clap::Args, Clone, Debug)]
pub struct Controller {
    /// The lowest host port handed out to Dynamic and Passthrough ports.
    #[clap(long, env = "MIN_PORT", default_value_t = 7000)]
    pub min_port: u16,
    /// The highest host port handed out to Dynamic and Passthrough ports.
    #[clap(long, env = "MAX_PORT", default_value_t = 8000)]
    pub max_port: u16,
    /// The image of the SDK server sidecar added to every game server pod.
    #[clap(long, env = "SIDECAR_IMAGE")]
    pub sidecar_image: Option<String>,
    #[clap(long, env = "SIDECAR_CPU_REQUEST")]
    pub sidecar_cpu_request: Option<String>,
    #[clap(long, env = "SIDECAR_CPU_LIMIT")]
    pub sidecar_cpu_limit: Option<String>,
    #[clap(long, env = "SIDECAR_MEMORY_REQUEST")]
    pub sidecar_memory_request: Option<String>,
    #[clap(long, env = "SIDECAR_MEMORY_LIMIT")]
    pub sidecar_memory_limit: Option<String>,
    #[clap(long, env = "SIDECAR_RUN_AS_USER", default_value_t = 1000)]
    pub sidecar_run_as_user: i64,
    /// Always pull the sidecar image, rather than only when missing.
    #[clap(long, env = "ALWAYS_PULL_SIDECAR")]
    pub always_pull_sidecar: bool,
    /// The service account of game server pods which do not set one.
    #[clap(long, env = "SDK_SERVICE_ACCOUNT", default_value = "agones-sdk")]
    pub sdk_service_account: String,
    /// The number of workers of each controller.
    #[clap(long, env = "NUM_WORKERS", default_value_t = 64)]
    pub num_workers: usize,
    /// The address the admission webhooks listen on.
    #[clap(long, env = "WEBHOOK_ADDRESS", default_value = "[::]:8081")]
    pub webhook_address: SocketAddr,
    /// Feature gates, formatted as `Name=true&Other=false`.
    #[clap(long, env = "FEATURE_GATES", default_value = "")]
    pub feature_gates: String,
    #[clap(long, env = "LOG_LEVEL", default_value = "Info")]
    pub log_level: SdkServerLogLevel,
    /// The namespace to watch. Every namespace when empty.
    #[clap(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,
}

/// Parses `Name=true&Other=false` into the value of each gate.
pub fn parse_feature_gates(gates: &str) -> crate::Result<HashMap<String, bool>> {
    gates
        .split('&')
        .map(str::trim)
        .filter(|gate| !gate.is_empty())
        .map(|gate| {
            let Some((name, enabled)) = gate.split_once('=') else {
                eyre::bail!("feature gate `{gate}` is invalid, it must have a `=` separator")
            };

            let enabled = enabled
                .parse()
                .wrap_err_with(|| format!("feature gate `{name}` is not a boolean"))?;
            Ok((name.to_owned(), enabled))
        })
        .collect()
}

impl Controller {
    fn sidecar_config(&self) -> SidecarConfig {
        let defaults = SidecarConfig::default();
        SidecarConfig {
            image: self.sidecar_image.clone().unwrap_or(defaults.image),
            always_pull: self.always_pull_sidecar,
            cpu_request: self.sidecar_cpu_request.clone(),
            cpu_limit: self.sidecar_cpu_limit.clone(),
            memory_request: self.sidecar_memory_request.clone(),
            memory_limit: self.sidecar_memory_limit.clone(),
            run_as_user: self.sidecar_run_as_user,
            service_account: self.sdk_service_account.clone(),
            feature_gates: self.feature_gates.clone(),
        }
    }

    /// Watches the cluster and runs every controller until `shutdown_rx`
    /// fires.
    #[tracing::instrument(skip_all)]
    pub async fn run(
        self,
        admin_address: Option<SocketAddr>,
        shutdown_rx: ShutdownRx,
    ) -> crate::Result<()> {
        if self.min_port > self.max_port {
            eyre::bail!(
                "--min-port {} is greater than --max-port {}",
                self.min_port,
                self.max_port
            );
        }

        let gates = parse_feature_gates(&self.feature_gates)?;
        let webhook_config = WebhookConfig {
            passthrough_port_policy: gates
                .get(PASSTHROUGH_PORT_POLICY)
                .copied()
                .unwrap_or_default(),
        };

        let kube_client = kube::Client::try_default()
            .await
            .wrap_err("failed to create the kubernetes client")?;
        let namespace = Some(self.namespace.as_str()).filter(|namespace| !namespace.is_empty());
        tracing::info!(
            namespace = namespace.unwrap_or("*"),
            min_port = self.min_port,
            max_port = self.max_port,
            workers = self.num_workers,
            "Starting controller"
        );

        let informers = Informers::default();
        let client: Arc<dyn Client> = Arc::new(KubeClient::new(kube_client.clone(), "gameserver-controller"));

        let game_servers = gameservers::Controller::new(
            client.clone(),
            &informers,
            gameservers::ControllerConfig {
                min_port: self.min_port,
                max_port: self.max_port,
                sidecar: self.sidecar_config(),
                workers: self.num_workers,
            },
        );
        let game_server_sets = gameserversets::Controller::new(
            client,
            &informers,
            game_servers.per_node_counter().clone(),
            gameserversets::ControllerConfig {
                workers: self.num_workers,
            },
        );

        let watchers = informers.spawn(kube_client, namespace, &shutdown_rx);

        let mut queues = game_servers.queues();
        queues.extend(game_server_sets.queues());
        let admin = admin::server(
            admin::Health::new(queues, informers.clone()),
            admin_address,
            shutdown_rx.clone(),
        );

        tokio::try_join!(
            game_servers.run(shutdown_rx.clone()),
            game_server_sets.run(shutdown_rx.clone()),
            webhooks::serve(self.webhook_address, webhook_config, shutdown_rx.clone()),
            async move {
                for watcher in watchers {
                    watcher.await??;
                }
                Ok::<_, eyre::Report>(())
            },
            async move { admin.await?.map_err(eyre::Report::from) },
        )?;

        Ok(())
    }
}
