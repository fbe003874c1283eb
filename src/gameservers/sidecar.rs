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

//! The SDK server sidecar, and the changes made to a game server's pod so
//! its game server process can reach it.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        Container, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector, Pod, Probe,
        ResourceRequirements, SecurityContext,
    },
    apimachinery::pkg::{api::resource::Quantity, util::intstr::IntOrString},
};

use crate::apis::{GameServer, PortPolicy};

pub const SIDECAR_CONTAINER_NAME: &str = "sidecar";
pub const GRPC_PORT_ENV: &str = "AGONES_SDK_GRPC_PORT";
pub const HTTP_PORT_ENV: &str = "AGONES_SDK_HTTP_PORT";
/// The port the sidecar serves `/healthz` and `/gshealthz` on.
pub const HEALTH_PORT: i32 = 8080;

/// How the sidecar container of every game server pod is configured.
#[derive(Clone, Debug)]
pub struct SidecarConfig {
    pub image: String,
    pub always_pull: bool,
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
    pub run_as_user: i64,
    /// Used for pods which do not name a service account.
    pub service_account: String,
    pub feature_gates: String,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            image: concat!("gcr.io/agones-images/agones-sdk:", env!("CARGO_PKG_VERSION")).into(),
            always_pull: false,
            cpu_request: None,
            cpu_limit: None,
            memory_request: None,
            memory_limit: None,
            run_as_user: 1000,
            service_account: "agones-sdk".into(),
            feature_gates: String::new(),
        }
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn quantities(cpu: &Option<String>, memory: &Option<String>) -> Option<BTreeMap<String, Quantity>> {
    let map: BTreeMap<String, Quantity> = [("cpu", cpu), ("memory", memory)]
        .into_iter()
        .filter_map(|(name, value)| {
            value
                .as_ref()
                .filter(|value| !value.is_empty())
                .map(|value| (name.to_owned(), Quantity(value.clone())))
        })
        .collect();

    (!map.is_empty()).then_some(map)
}

impl SidecarConfig {
    /// The sidecar container running the SDK server for `gs`.
    pub fn container(&self, gs: &GameServer) -> Container {
        let mut env_vars = vec![
            env("GAMESERVER_NAME", gs.name()),
            EnvVar {
                name: "POD_NAMESPACE".into(),
                value: None,
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "metadata.namespace".into(),
                        api_version: None,
                    }),
                    ..<_>::default()
                }),
            },
            env("FEATURE_GATES", &*self.feature_gates),
            env("LOG_LEVEL", gs.spec.sdk_server.log_level.as_ref()),
        ];

        if gs.has_port_policy(PortPolicy::Passthrough) {
            env_vars.push(env("PASSTHROUGH", "TRUE"));
        }

        let mut args = Vec::new();
        if gs.spec.sdk_server.grpc_port != 0 {
            args.push(format!("--grpc-port={}", gs.spec.sdk_server.grpc_port));
        }
        if gs.spec.sdk_server.http_port != 0 {
            args.push(format!("--http-port={}", gs.spec.sdk_server.http_port));
        }

        let requests = quantities(&self.cpu_request, &self.memory_request);
        let limits = quantities(&self.cpu_limit, &self.memory_limit);

        Container {
            name: SIDECAR_CONTAINER_NAME.into(),
            image: Some(self.image.clone()),
            image_pull_policy: self.always_pull.then(|| "Always".into()),
            env: Some(env_vars),
            args: (!args.is_empty()).then_some(args),
            resources: (requests.is_some() || limits.is_some()).then(|| ResourceRequirements {
                requests,
                limits,
                ..<_>::default()
            }),
            liveness_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/healthz".into()),
                    port: IntOrString::Int(HEALTH_PORT),
                    ..<_>::default()
                }),
                initial_delay_seconds: Some(3),
                period_seconds: Some(3),
                ..<_>::default()
            }),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                run_as_non_root: Some(true),
                run_as_user: Some(self.run_as_user),
                ..<_>::default()
            }),
            ..<_>::default()
        }
    }

    /// Builds the pod backing `gs`, sidecar included.
    pub fn pod(&self, gs: &GameServer) -> crate::Result<Pod> {
        let mut gs = gs.clone();
        gs.spec.split_tcp_udp_ports();

        let mut pod = gs.pod(vec![self.container(&gs)])?;

        // Pods naming their own service account keep its token.
        let spec = pod.spec.get_or_insert_with(Default::default);
        if spec.service_account_name.as_deref().map_or(true, str::is_empty) {
            spec.service_account_name = Some(self.service_account.clone());
            gs.disable_service_account(&mut pod)?;
        }

        add_health_check(&gs, &mut pod)?;
        add_sdk_server_env(&gs, &mut pod);
        Ok(pod)
    }
}

/// Adds the `/gshealthz` liveness probe to the game server container, unless
/// health checking is off or the container already has a probe.
fn add_health_check(gs: &GameServer, pod: &mut Pod) -> crate::Result<()> {
    if gs.spec.health.disabled {
        return Ok(());
    }

    let health = &gs.spec.health;
    gs.apply_to_pod_container(pod, &gs.spec.container, |container| {
        container.liveness_probe.get_or_insert_with(|| Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/gshealthz".into()),
                port: IntOrString::Int(HEALTH_PORT),
                ..<_>::default()
            }),
            initial_delay_seconds: Some(health.initial_delay_seconds),
            period_seconds: Some(health.period_seconds),
            failure_threshold: Some(health.failure_threshold),
            ..<_>::default()
        });
    })
}

/// Tells every container other than the sidecar where the SDK server
/// listens, replacing any user supplied values.
fn add_sdk_server_env(gs: &GameServer, pod: &mut Pod) {
    let grpc = gs.spec.sdk_server.grpc_port.to_string();
    let http = gs.spec.sdk_server.http_port.to_string();

    for container in pod
        .spec
        .iter_mut()
        .flat_map(|spec| spec.containers.iter_mut())
        .filter(|container| container.name != SIDECAR_CONTAINER_NAME)
    {
        let env_vars = container.env.get_or_insert_with(Vec::new);
        env_vars.retain(|var| var.name != GRPC_PORT_ENV && var.name != HTTP_PORT_ENV);
        env_vars.push(env(GRPC_PORT_ENV, &*grpc));
        env_vars.push(env(HTTP_PORT_ENV, &*http));
    }
}
