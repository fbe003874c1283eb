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

//! Fabrication of the pod backing a [`GameServer`].

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        Affinity, Container, ContainerPort, EmptyDirVolumeSource, Pod, PodAffinity,
        PodAffinityTerm, PodSpec, Volume, VolumeMount, WeightedPodAffinityTerm,
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::Resource;

use super::{
    EvictionSafe, GameServer, GameServerPort, GameServerSpec, PortPolicy, Protocol,
    SchedulingStrategy,
};

const SERVICE_ACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Container name to the indices of its passthrough ports, as stored in the
/// passthrough port assignment annotation.
pub type PassthroughAssignment = BTreeMap<String, Vec<usize>>;

/// Whether `pod` was created for a game server.
pub fn is_game_server_pod(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(super::ROLE_LABEL))
        .is_some_and(|role| role == super::GAME_SERVER_LABEL_ROLE)
}

/// The container statuses of the named container in `pod`.
pub fn container_status<'pod>(
    pod: &'pod Pod,
    name: &str,
) -> Option<&'pod k8s_openapi::api::core::v1::ContainerStatus> {
    pod.status
        .as_ref()?
        .container_statuses
        .iter()
        .flatten()
        .find(|status| status.name == name)
}

/// Rewrites each passthrough container port to match its host port, using
/// the assignment annotation set at creation. Returns whether any port
/// changed.
pub fn apply_passthrough_ports(pod: &mut Pod) -> crate::Result<bool> {
    let Some(raw) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(super::PASSTHROUGH_PORT_ASSIGNMENT_ANNOTATION))
    else {
        return Ok(false);
    };

    let assignment: PassthroughAssignment = serde_json::from_str(raw)?;
    let mut changed = false;

    for container in pod
        .spec
        .iter_mut()
        .flat_map(|spec| spec.containers.iter_mut())
    {
        let Some(indices) = assignment.get(&container.name) else {
            continue;
        };

        for index in indices {
            let Some(port) = container.ports.as_mut().and_then(|ports| ports.get_mut(*index))
            else {
                tracing::warn!(container = %container.name, index, "passthrough port index out of range");
                continue;
            };

            if let Some(host_port) = port.host_port {
                if port.container_port != host_port {
                    port.container_port = host_port;
                    changed = true;
                }
            }
        }
    }

    Ok(changed)
}

impl GameServerSpec {
    /// Replaces every `TCPUDP` port with a `TCP` port suffixed `-tcp` and an
    /// appended `UDP` port suffixed `-udp`, sharing the same host port.
    pub fn split_tcp_udp_ports(&mut self) {
        let mut udp = Vec::new();
        for port in self
            .ports
            .iter_mut()
            .filter(|port| port.protocol == Protocol::TcpUdp)
        {
            let name = std::mem::take(&mut port.name);
            port.name = format!("{name}-tcp");
            port.protocol = Protocol::Tcp;
            udp.push(GameServerPort {
                name: format!("{name}-udp"),
                protocol: Protocol::Udp,
                ..port.clone()
            });
        }
        self.ports.extend(udp);
    }
}

impl GameServer {
    /// Builds the pod backing this game server. `sidecars` are placed ahead
    /// of the template's containers so they start first.
    pub fn pod(&self, sidecars: Vec<Container>) -> crate::Result<Pod> {
        let mut pod = Pod {
            metadata: self.spec.template.metadata.clone().unwrap_or_default(),
            spec: Some(self.spec.template.spec.clone().unwrap_or_default()),
            status: None,
        };

        self.pod_object_meta(&mut pod);

        let spec = pod.spec.get_or_insert_with(PodSpec::default);
        if spec.hostname.as_deref().map_or(true, str::is_empty) {
            spec.hostname = Some(self.name().replace('.', "-"));
        }

        let mut passthrough = PassthroughAssignment::new();
        for port in &self.spec.ports {
            let container_port = ContainerPort {
                container_port: port.container_port.unwrap_or_default().into(),
                host_port: match port.port_policy {
                    PortPolicy::None => None,
                    _ => port.host_port.map(Into::into),
                },
                protocol: Some(port.protocol.as_str().into()),
                ..<_>::default()
            };

            let container = port.container.as_deref().unwrap_or(&self.spec.container);
            self.apply_to_pod_container(&mut pod, container, |c| {
                let ports = c.ports.get_or_insert_with(Vec::new);
                if port.port_policy == PortPolicy::Passthrough {
                    passthrough
                        .entry(c.name.clone())
                        .or_default()
                        .push(ports.len());
                }
                ports.push(container_port);
            })?;
        }

        if !passthrough.is_empty() {
            pod.metadata.annotations.get_or_insert_with(Default::default).insert(
                super::PASSTHROUGH_PORT_ASSIGNMENT_ANNOTATION.into(),
                serde_json::to_string(&passthrough)?,
            );
        }

        let spec = pod.spec.get_or_insert_with(PodSpec::default);
        let containers = std::mem::take(&mut spec.containers);
        spec.containers = sidecars.into_iter().chain(containers).collect();

        self.pod_scheduling(&mut pod);

        Ok(pod)
    }

    fn pod_object_meta(&self, pod: &mut Pod) {
        let meta = &mut pod.metadata;
        meta.generate_name = None;
        meta.name = Some(self.name().into());
        meta.namespace = self.metadata.namespace.clone();
        meta.resource_version = None;
        meta.uid = None;

        let labels = meta.labels.get_or_insert_with(Default::default);
        labels.insert(super::ROLE_LABEL.into(), super::GAME_SERVER_LABEL_ROLE.into());
        labels.insert(super::GAME_SERVER_POD_LABEL.into(), self.name().into());

        let annotations = meta.annotations.get_or_insert_with(Default::default);
        annotations.insert(
            super::GAME_SERVER_CONTAINER_ANNOTATION.into(),
            self.spec.container.clone(),
        );
        annotations.insert(
            super::SDK_VERSION_ANNOTATION.into(),
            env!("CARGO_PKG_VERSION").into(),
        );

        let safe_to_evict = self
            .status
            .as_ref()
            .and_then(|status| status.eviction.as_ref())
            .is_some_and(|eviction| eviction.safe == EvictionSafe::Always);
        annotations
            .entry(super::POD_SAFE_TO_EVICT_ANNOTATION.into())
            .or_insert_with(|| safe_to_evict.to_string());

        if let Some(owner) = self.controller_owner_ref(&()) {
            meta.owner_references
                .get_or_insert_with(Vec::new)
                .push(owner);
        }
    }

    fn pod_scheduling(&self, pod: &mut Pod) {
        if self.spec.scheduling != SchedulingStrategy::Packed {
            return;
        }

        let term = WeightedPodAffinityTerm {
            weight: 100,
            pod_affinity_term: PodAffinityTerm {
                topology_key: HOSTNAME_TOPOLOGY_KEY.into(),
                label_selector: Some(LabelSelector {
                    match_labels: Some(
                        [(
                            super::ROLE_LABEL.to_owned(),
                            super::GAME_SERVER_LABEL_ROLE.to_owned(),
                        )]
                        .into(),
                    ),
                    ..<_>::default()
                }),
                ..<_>::default()
            },
        };

        pod.spec
            .get_or_insert_with(PodSpec::default)
            .affinity
            .get_or_insert_with(Affinity::default)
            .pod_affinity
            .get_or_insert_with(PodAffinity::default)
            .preferred_during_scheduling_ignored_during_execution
            .get_or_insert_with(Vec::new)
            .push(term);
    }

    /// Runs `f` against the named container of `pod`.
    pub fn apply_to_pod_container(
        &self,
        pod: &mut Pod,
        name: &str,
        f: impl FnOnce(&mut Container),
    ) -> crate::Result<()> {
        let container = pod
            .spec
            .iter_mut()
            .flat_map(|spec| spec.containers.iter_mut())
            .find(|container| container.name == name)
            .ok_or_else(|| eyre::eyre!("failed to find container named {name} in pod spec"))?;

        f(container);
        Ok(())
    }

    /// Stops the service account token from being mounted into the game
    /// server container, by shadowing it with an empty volume.
    pub fn disable_service_account(&self, pod: &mut Pod) -> crate::Result<()> {
        let volume = Volume {
            name: "empty".into(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..<_>::default()
        };
        let mount = VolumeMount {
            mount_path: SERVICE_ACCOUNT_MOUNT_PATH.into(),
            name: volume.name.clone(),
            read_only: Some(true),
            ..<_>::default()
        };

        pod.spec
            .get_or_insert_with(PodSpec::default)
            .volumes
            .get_or_insert_with(Vec::new)
            .push(volume);

        self.apply_to_pod_container(pod, &self.spec.container, |c| {
            c.volume_mounts.get_or_insert_with(Vec::new).push(mount);
        })
    }
}
