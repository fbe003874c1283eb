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

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{Container, NodeAddress, PodTemplateSpec},
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    custom_resource, deserialize_null_default, Cause, Priority, PriorityOrder, PriorityType,
    SchedulingStrategy,
};

pub const ERR_CONTAINER_REQUIRED: &str =
    "Container is required when using multiple containers in the pod template";
pub const ERR_HOST_PORT: &str = "HostPort cannot be specified with a Dynamic or Passthrough PortPolicy";
pub const ERR_PORT_POLICY_STATIC: &str = "PortPolicy must be Static";
pub const ERR_CONTAINER_PORT_REQUIRED: &str =
    "ContainerPort must be defined for Dynamic and Static PortPolicies";
pub const ERR_CONTAINER_PORT_PASSTHROUGH: &str =
    "ContainerPort cannot be specified with Passthrough PortPolicy";
pub const ERR_CONTAINER_NAME_INVALID: &str =
    "Container must be empty or the name of a container in the pod template";
pub const ERR_HOST_PORT_REQUIRED: &str = "HostPort must be specified with a Static PortPolicy";

/// A single dedicated game server process, backed by one pod.
#[derive(Clone, Debug, PartialEq)]
pub struct GameServer {
    pub metadata: ObjectMeta,
    pub spec: GameServerSpec,
    pub status: Option<GameServerStatus>,
}

custom_resource!(
    GameServer,
    GameServerInner,
    kind = "GameServer",
    plural = "gameservers",
    singular = "gameserver",
    spec = GameServerSpec,
    status = GameServerStatus,
    subresources = []
);

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    /// Container specifies which Pod container is the game server. Only
    /// required if there is more than one container defined.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
    /// Ports are the array of ports that can be exposed via the game server
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub ports: Vec<GameServerPort>,
    /// Configures health checking
    #[serde(default)]
    pub health: Health,
    /// Scheduling strategy. Defaults to "Packed"
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Specifies parameters for the SDK Server sidecar container.
    #[serde(default)]
    pub sdk_server: SdkServer,
    /// Describes the Pod that will be created for the [`GameServer`].
    #[serde(default)]
    pub template: PodTemplateSpec,
    /// Whether the game server may be evicted by the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction: Option<Eviction>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, CounterStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, ListStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    /// Whether health checking is disabled or not
    #[serde(default)]
    pub disabled: bool,
    /// The number of seconds each health ping has to occur in
    #[serde(default)]
    pub period_seconds: i32,
    /// How many failures in a row constitutes unhealthy
    #[serde(default)]
    pub failure_threshold: i32,
    /// Initial delay before checking health
    #[serde(default)]
    pub initial_delay_seconds: i32,
}

impl Health {
    pub const DEFAULT_PERIOD_SECONDS: i32 = 5;
    pub const DEFAULT_FAILURE_THRESHOLD: i32 = 3;
    pub const DEFAULT_INITIAL_DELAY_SECONDS: i32 = 5;

    fn apply_defaults(&mut self) {
        if self.disabled {
            return;
        }

        if self.period_seconds <= 0 {
            self.period_seconds = Self::DEFAULT_PERIOD_SECONDS;
        }
        if self.failure_threshold <= 0 {
            self.failure_threshold = Self::DEFAULT_FAILURE_THRESHOLD;
        }
        if self.initial_delay_seconds <= 0 {
            self.initial_delay_seconds = Self::DEFAULT_INITIAL_DELAY_SECONDS;
        }
    }
}

/// Defines a set of Ports that are to be exposed via the [`GameServer`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerPort {
    /// Name is the descriptive name of the port
    pub name: String,
    /// Defines the policy for how the [`Self::host_port`] is populated.
    #[serde(default)]
    pub port_policy: PortPolicy,
    /// The name of the container on which to open the port. Defaults to the
    /// game server container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    /// The port that is being opened on the specified container's process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,
    /// The port exposed on the host for clients to connect to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    /// Protocol is the network protocol being used. Defaults to UDP. TCP and TCPUDP are other options.
    #[serde(default)]
    pub protocol: Protocol,
}

impl GameServerPort {
    /// The port reported to clients for this port.
    pub fn status(&self) -> GameServerStatusPort {
        let port = match self.port_policy {
            PortPolicy::None => self.container_port,
            _ => self.host_port,
        };

        GameServerStatusPort {
            name: self.name.clone(),
            port: port.unwrap_or_default(),
        }
    }
}

/// The status for a [`GameServer`] resource.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    /// The current state of a [`GameServer`].
    pub state: GameServerState,
    #[serde(
        default,
        deserialize_with = "deserialize_null_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub ports: Vec<GameServerStatusPort>,
    #[serde(default)]
    pub address: String,
    #[serde(
        default,
        deserialize_with = "deserialize_null_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub addresses: Vec<NodeAddress>,
    #[serde(default)]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_until: Option<Time>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, CounterStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, ListStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction: Option<Eviction>,
}

impl GameServerStatus {
    pub fn new(state: GameServerState) -> Self {
        Self {
            state,
            ports: Vec::new(),
            address: String::new(),
            addresses: Vec::new(),
            node_name: String::new(),
            reserved_until: None,
            counters: BTreeMap::new(),
            lists: BTreeMap::new(),
            eviction: None,
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
)]
pub enum GameServerState {
    /// A dynamically allocating [`GameServer`] is being created, an open port needs
    /// to be allocated
    PortAllocation,
    /// The Pod for the [`GameServer`] is being created.
    Creating,
    /// The Pods for the [`GameServer`] are being created but are not yet Scheduled
    Starting,
    /// We have determined that the Pod has been scheduled in the cluster --
    /// basically, we have a `NodeName`
    Scheduled,
    /// The [`GameServer`] has declared that it is ready
    RequestReady,
    /// The [`GameServer`] is ready to take connections from game clients.
    Ready,
    /// The [`GameServer`] has shutdown and everything needs to be deleted from the cluster
    Shutdown,
    /// Something has gone wrong with the [`GameServer`] and it cannot be resolved
    Error,
    /// The [`GameServer`] has failed its health checks
    Unhealthy,
    /// The [`GameServer`] is reserved and therefore can be allocated but not removed
    Reserved,
    /// The [`GameServer`] has been allocated to a session
    Allocated,
}

/// The port that was allocated to a [`GameServer`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct GameServerStatusPort {
    pub name: String,
    pub port: u16,
}

/// Parameters for the SDK Server sidecar container
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SdkServer {
    /// The log level for SDK server (sidecar) logs. Defaults to [`SdkServerLogLevel::Info`]
    #[serde(default)]
    pub log_level: SdkServerLogLevel,
    /// The port on which the SDK Server binds the gRPC server to accept incoming connections
    #[serde(default = "default_sdk_grpc_port")]
    pub grpc_port: u16,
    /// The port on which the SDK Server binds the HTTP gRPC gateway server to accept incoming connections
    #[serde(default = "default_sdk_http_port")]
    pub http_port: u16,
}

fn default_sdk_grpc_port() -> u16 {
    9357
}
fn default_sdk_http_port() -> u16 {
    9358
}

impl Default for SdkServer {
    fn default() -> Self {
        Self {
            log_level: Default::default(),
            grpc_port: default_sdk_grpc_port(),
            http_port: default_sdk_http_port(),
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
    strum_macros::AsRefStr,
    strum_macros::EnumString,
)]
pub enum SdkServerLogLevel {
    /// Output all messages except for debug messages.
    #[default]
    Info,
    /// Output all messages including debug messages.
    Debug,
    /// Only output error messages.
    Error,
    /// Output everything, including the content of every request.
    Trace,
}

impl SdkServerLogLevel {
    pub fn level_filter(self) -> tracing_subscriber::filter::LevelFilter {
        use tracing_subscriber::filter::LevelFilter;
        match self {
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Error => LevelFilter::ERROR,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum PortPolicy {
    /// The user defines the host port to be used in the configuration.
    Static,
    /// The system will choose an open port for the [`GameServer`] in question.
    #[default]
    Dynamic,
    /// Dynamically sets the container port to the same value as the dynamically
    /// selected host port. This will mean that users will need to lookup what
    /// port has been opened through the server side SDK.
    Passthrough,
    /// The port is not exposed on the host, only on the container.
    None,
}

impl PortPolicy {
    /// Whether the allocator picks a host port for this policy.
    pub fn is_allocated(self) -> bool {
        matches!(self, Self::Dynamic | Self::Passthrough)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum Protocol {
    #[default]
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "TCPUDP")]
    TcpUdp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
            Self::TcpUdp => "TCPUDP",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Eviction {
    #[serde(default)]
    pub safe: EvictionSafe,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum EvictionSafe {
    /// The game server may be evicted at any time.
    Always,
    /// The game server may be evicted during cluster upgrades only.
    OnUpgrade,
    /// The game server should run to completion.
    #[default]
    Never,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct CounterStatus {
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub capacity: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ListStatus {
    #[serde(default)]
    pub capacity: i64,
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub values: Vec<String>,
}

impl GameServer {
    pub fn new(name: &str, spec: GameServerSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// The current state, `None` when no status has been recorded yet.
    pub fn state(&self) -> Option<GameServerState> {
        self.status.as_ref().map(|status| status.state)
    }

    pub fn is_state(&self, state: GameServerState) -> bool {
        self.state() == Some(state)
    }

    pub fn status_mut(&mut self) -> &mut GameServerStatus {
        let initial = self.initial_state();
        self.status
            .get_or_insert_with(|| GameServerStatus::new(initial))
    }

    pub fn set_state(&mut self, state: GameServerState) {
        self.status_mut().state = state;
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            .map(String::as_str)
    }

    pub fn annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.metadata.annotations.get_or_insert_with(Default::default)
    }

    pub fn labels_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.metadata.labels.get_or_insert_with(Default::default)
    }

    /// The address of a development game server, which has no backing pod.
    pub fn dev_address(&self) -> Option<&str> {
        self.annotation(super::DEV_ADDRESS_ANNOTATION)
    }

    /// The state a freshly created game server starts in.
    fn initial_state(&self) -> GameServerState {
        if self.spec.ports.iter().any(|p| p.port_policy.is_allocated()) {
            GameServerState::PortAllocation
        } else {
            GameServerState::Creating
        }
    }

    /// Applies default values to the game server if they are not already
    /// populated.
    pub fn apply_defaults(&mut self) {
        self.annotations_mut().insert(
            super::SDK_VERSION_ANNOTATION.into(),
            env!("CARGO_PKG_VERSION").into(),
        );

        let finalizers = self.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == super::FINALIZER_NAME) {
            finalizers.push(super::FINALIZER_NAME.into());
        }

        self.spec.apply_defaults();

        // Must run after the port defaults.
        let eviction = self.eviction_status();
        let counters = self.spec.counters.clone();
        let lists = self.spec.lists.clone();
        let status = self.status_mut();
        status.eviction = eviction;
        if status.counters.is_empty() {
            status.counters = counters;
        }
        if status.lists.is_empty() {
            status.lists = lists;
        }
    }

    fn eviction_status(&self) -> Option<Eviction> {
        let safe_to_evict = self
            .spec
            .template
            .metadata
            .as_ref()
            .and_then(|meta| meta.annotations.as_ref())
            .and_then(|annotations| annotations.get(super::POD_SAFE_TO_EVICT_ANNOTATION))
            .is_some_and(|value| value == "true");

        if safe_to_evict {
            Some(Eviction {
                safe: EvictionSafe::Always,
            })
        } else {
            self.spec.eviction.clone()
        }
    }

    /// Validates the game server, returning every failed check.
    pub fn validate(&self) -> Vec<Cause> {
        let mut causes = super::validate_name("GameServer", self.name());
        causes.extend(self.spec.validate(self.dev_address(), "spec"));
        causes
    }

    /// Allocated and reserved game servers may only be deleted once their
    /// deletion has already been requested.
    pub fn is_deletable(&self) -> bool {
        match self.state() {
            Some(GameServerState::Allocated | GameServerState::Reserved) => {
                self.metadata.deletion_timestamp.is_some()
            }
            _ => true,
        }
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some() || self.is_state(GameServerState::Shutdown)
    }

    /// Whether the game server has yet to reach Ready in its lifecycle.
    pub fn is_before_ready(&self) -> bool {
        matches!(
            self.state(),
            Some(
                GameServerState::PortAllocation
                    | GameServerState::Creating
                    | GameServerState::Starting
                    | GameServerState::Scheduled
                    | GameServerState::RequestReady
            )
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            Some(GameServerState::Ready | GameServerState::Reserved | GameServerState::Allocated)
        )
    }

    pub fn has_port_policy(&self, policy: PortPolicy) -> bool {
        self.spec.ports.iter().any(|port| port.port_policy == policy)
    }

    pub fn count_ports(&self, f: impl Fn(PortPolicy) -> bool) -> usize {
        self.spec
            .ports
            .iter()
            .filter(|port| f(port.port_policy))
            .count()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .iter()
            .flatten()
            .any(|f| f == super::FINALIZER_NAME)
    }

    pub fn remove_finalizer(&mut self) {
        if let Some(finalizers) = self.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != super::FINALIZER_NAME);
        }
    }

    /// Compares two game servers by the available capacity of the counters
    /// and lists named in `priorities`. `Some(true)` when `self` sorts first,
    /// `Some(false)` when `other` does, and `None` when no priority decides.
    pub fn compare_count_and_list_priorities(
        &self,
        priorities: &[Priority],
        other: &Self,
    ) -> Option<bool> {
        priorities.iter().find_map(|priority| {
            self.compare_count_and_list_priority(priority, other)
                .map(|less| match priority.order {
                    PriorityOrder::Descending => !less,
                    PriorityOrder::Ascending => less,
                })
        })
    }

    fn compare_count_and_list_priority(&self, priority: &Priority, other: &Self) -> Option<bool> {
        let available = |gs: &Self| -> Option<i64> {
            let status = gs.status.as_ref()?;
            match priority.kind {
                PriorityType::Counter => status
                    .counters
                    .get(&priority.key)
                    .map(|counter| counter.capacity - counter.count),
                PriorityType::List => status
                    .lists
                    .get(&priority.key)
                    .map(|list| list.capacity - list.values.len() as i64),
            }
        };

        match (available(self), available(other)) {
            (Some(this), Some(that)) => match this.cmp(&that) {
                std::cmp::Ordering::Less => Some(true),
                std::cmp::Ordering::Greater => Some(false),
                std::cmp::Ordering::Equal => None,
            },
            // Whichever server has the priority sorts ahead of the one
            // without, once the final order has been applied.
            (Some(_), None) => Some(priority.order == PriorityOrder::Ascending),
            (None, Some(_)) => Some(priority.order == PriorityOrder::Descending),
            (None, None) => None,
        }
    }
}

impl GameServerSpec {
    /// Applies default values to the spec if they are not already populated.
    pub fn apply_defaults(&mut self) {
        if let Some(spec) = &self.template.spec {
            if spec.containers.len() == 1 {
                self.container = spec.containers[0].name.clone();
            }
        }

        for port in &mut self.ports {
            if port.container.as_deref().map_or(true, str::is_empty) {
                port.container = Some(self.container.clone());
            }
        }

        self.health.apply_defaults();

        self.eviction.get_or_insert_with(Eviction::default);

        if self.sdk_server.grpc_port == 0 {
            self.sdk_server.grpc_port = default_sdk_grpc_port();
        }
        if self.sdk_server.http_port == 0 {
            self.sdk_server.http_port = default_sdk_http_port();
        }
    }

    /// Returns the index and definition of the named template container.
    pub fn find_container(&self, name: &str) -> Option<(usize, &Container)> {
        self.template
            .spec
            .as_ref()?
            .containers
            .iter()
            .enumerate()
            .find(|(_, container)| container.name == name)
    }

    fn container_count(&self) -> usize {
        self.template
            .spec
            .as_ref()
            .map_or(0, |spec| spec.containers.len())
    }

    /// Validates the spec. `path` is the field path prefix used in the
    /// returned causes.
    pub fn validate(&self, dev_address: Option<&str>, path: &str) -> Vec<Cause> {
        let mut causes = Vec::new();
        let template_meta = self.template.metadata.clone().unwrap_or_default();

        if let Some(address) = dev_address {
            if address.parse::<std::net::IpAddr>().is_err() {
                causes.push(Cause::invalid(
                    format!("metadata.annotations.{}", super::DEV_ADDRESS_ANNOTATION),
                    "must be a valid IP address",
                ));
            }

            for (i, port) in self.ports.iter().enumerate() {
                if port.host_port.unwrap_or_default() == 0 {
                    causes.push(Cause::required(
                        format!("{path}.ports[{i}].hostPort"),
                        ERR_HOST_PORT_REQUIRED,
                    ));
                }
                if port.port_policy != PortPolicy::Static {
                    causes.push(Cause::required(
                        format!("{path}.ports[{i}].portPolicy"),
                        ERR_PORT_POLICY_STATIC,
                    ));
                }
            }

            causes.extend(super::validate_object_meta(&template_meta));
            return causes;
        }

        if self.container.is_empty() && self.container_count() > 1 {
            causes.push(Cause::required(
                format!("{path}.container"),
                ERR_CONTAINER_REQUIRED,
            ));
        }

        if self.find_container(&self.container).is_none() {
            causes.push(Cause::invalid(
                format!("{path}.container"),
                format!("Could not find a container named {}", self.container),
            ));
        }

        for (i, port) in self.ports.iter().enumerate() {
            let port_path = format!("{path}.ports[{i}]");
            let container_port = port.container_port.unwrap_or_default();
            let host_port = port.host_port.unwrap_or_default();

            match port.port_policy {
                PortPolicy::Dynamic | PortPolicy::Static if container_port == 0 => {
                    causes.push(Cause::required(
                        format!("{port_path}.containerPort"),
                        ERR_CONTAINER_PORT_REQUIRED,
                    ));
                }
                PortPolicy::Passthrough if container_port > 0 => {
                    causes.push(Cause::required(
                        format!("{port_path}.containerPort"),
                        ERR_CONTAINER_PORT_PASSTHROUGH,
                    ));
                }
                _ => {}
            }

            if host_port > 0 && port.port_policy.is_allocated() {
                causes.push(Cause::forbidden(
                    format!("{port_path}.hostPort"),
                    ERR_HOST_PORT,
                ));
            }

            if host_port == 0 && port.port_policy == PortPolicy::Static {
                causes.push(Cause::required(
                    format!("{port_path}.hostPort"),
                    ERR_HOST_PORT_REQUIRED,
                ));
            }

            if let Some(container) = port.container.as_deref() {
                if !self.container.is_empty() && self.find_container(container).is_none() {
                    causes.push(Cause::invalid(
                        format!("{port_path}.container"),
                        ERR_CONTAINER_NAME_INVALID,
                    ));
                }
            }
        }

        if self.health.period_seconds < 0
            || self.health.failure_threshold < 0
            || self.health.initial_delay_seconds < 0
        {
            causes.push(Cause::invalid(
                format!("{path}.health"),
                "health check values must not be negative",
            ));
        }

        causes.extend(super::validate_object_meta(&template_meta));
        causes
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodSpec;
    use pretty_assertions::assert_eq;

    use super::*;

    fn spec_with_containers(names: &[&str]) -> GameServerSpec {
        GameServerSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: names
                        .iter()
                        .map(|name| Container {
                            name: name.to_string(),
                            image: Some("container/image".into()),
                            ..<_>::default()
                        })
                        .collect(),
                    ..<_>::default()
                }),
            },
            ..<_>::default()
        }
    }

    fn port(policy: PortPolicy, container_port: Option<u16>, host_port: Option<u16>) -> GameServerPort {
        GameServerPort {
            name: "default".into(),
            port_policy: policy,
            container_port,
            host_port,
            ..<_>::default()
        }
    }

    #[test]
    fn deserialize_agones_json() {
        let gs: GameServer = serde_json::from_value(serde_json::json!({
            "apiVersion": "agones.dev/v1",
            "kind": "GameServer",
            "metadata": { "name": "gs1", "namespace": "default" },
            "spec": {
                "ports": [{ "name": "game", "containerPort": 7654, "protocol": "TCPUDP" }],
                "template": { "spec": { "containers": [{ "name": "runner", "image": "runner:1" }] } }
            },
            "status": { "state": "Ready", "address": "1.2.3.4", "ports": [{ "name": "game", "port": 7000 }], "nodeName": "n1" }
        }))
        .unwrap();

        assert_eq!("gs1", gs.name());
        assert_eq!(Protocol::TcpUdp, gs.spec.ports[0].protocol);
        assert_eq!(PortPolicy::Dynamic, gs.spec.ports[0].port_policy);
        assert_eq!(Some(GameServerState::Ready), gs.state());

        let value = serde_json::to_value(&gs).unwrap();
        assert_eq!("agones.dev/v1", value["apiVersion"]);
        assert_eq!("GameServer", value["kind"]);
    }

    #[test]
    fn apply_defaults() {
        let mut gs = GameServer::new("gs1", spec_with_containers(&["runner"]));
        gs.spec.ports.push(port(PortPolicy::Dynamic, Some(7777), None));
        gs.apply_defaults();

        assert_eq!("runner", gs.spec.container);
        assert_eq!(Some("runner".into()), gs.spec.ports[0].container);
        assert_eq!(Protocol::Udp, gs.spec.ports[0].protocol);
        assert_eq!(
            Health {
                disabled: false,
                period_seconds: 5,
                failure_threshold: 3,
                initial_delay_seconds: 5,
            },
            gs.spec.health
        );
        assert_eq!(SchedulingStrategy::Packed, gs.spec.scheduling);
        assert_eq!(9357, gs.spec.sdk_server.grpc_port);
        assert_eq!(9358, gs.spec.sdk_server.http_port);
        assert_eq!(Some(GameServerState::PortAllocation), gs.state());
        assert!(gs.has_finalizer());
        assert_eq!(
            Some(Eviction {
                safe: EvictionSafe::Never
            }),
            gs.status.as_ref().unwrap().eviction
        );

        // Idempotent.
        let once = gs.clone();
        gs.apply_defaults();
        assert_eq!(once, gs);
    }

    #[test]
    fn apply_defaults_seeds_counter_status() {
        let mut gs = GameServer::new("gs1", spec_with_containers(&["runner"]));
        gs.spec.counters.insert(
            "rooms".into(),
            CounterStatus {
                count: 1,
                capacity: 10,
            },
        );
        gs.apply_defaults();

        let status = gs.status.as_ref().unwrap();
        assert_eq!(gs.spec.counters, status.counters);

        // Status counters are not reset by later defaulting.
        gs.status_mut().counters.insert(
            "rooms".into(),
            CounterStatus {
                count: 5,
                capacity: 10,
            },
        );
        gs.apply_defaults();
        assert_eq!(5, gs.status.as_ref().unwrap().counters["rooms"].count);
    }

    #[test]
    fn apply_defaults_static_and_disabled_health() {
        let mut gs = GameServer::new("gs1", spec_with_containers(&["a", "b"]));
        gs.spec.health.disabled = true;
        gs.spec.ports.push(port(PortPolicy::Static, Some(7777), Some(7777)));
        gs.apply_defaults();

        assert_eq!("", gs.spec.container);
        assert_eq!(0, gs.spec.health.period_seconds);
        assert_eq!(Some(GameServerState::Creating), gs.state());
    }

    #[test]
    fn validate_ports() {
        let mut gs = GameServer::new("gs1", spec_with_containers(&["runner"]));
        gs.spec.ports = vec![
            port(PortPolicy::Dynamic, None, Some(10)),
            port(PortPolicy::Passthrough, Some(7777), None),
            port(PortPolicy::Static, Some(7777), None),
        ];
        gs.apply_defaults();

        let messages: Vec<_> = gs
            .validate()
            .into_iter()
            .map(|cause| (cause.field, cause.message))
            .collect();

        assert_eq!(
            vec![
                (
                    "spec.ports[0].containerPort".to_owned(),
                    ERR_CONTAINER_PORT_REQUIRED.to_owned()
                ),
                ("spec.ports[0].hostPort".to_owned(), ERR_HOST_PORT.to_owned()),
                (
                    "spec.ports[1].containerPort".to_owned(),
                    ERR_CONTAINER_PORT_PASSTHROUGH.to_owned()
                ),
                (
                    "spec.ports[2].hostPort".to_owned(),
                    ERR_HOST_PORT_REQUIRED.to_owned()
                ),
            ],
            messages
        );
    }

    #[test]
    fn validate_containers() {
        let mut gs = GameServer::new("gs1", spec_with_containers(&["a", "b"]));
        gs.apply_defaults();
        let causes = gs.validate();
        assert_eq!(ERR_CONTAINER_REQUIRED, causes[0].message);

        let mut gs = GameServer::new("gs1", spec_with_containers(&["a", "b"]));
        gs.spec.container = "a".into();
        let mut p = port(PortPolicy::Dynamic, Some(7777), None);
        p.container = Some("missing".into());
        gs.spec.ports.push(p);
        gs.apply_defaults();
        let causes = gs.validate();
        assert_eq!(1, causes.len());
        assert_eq!(ERR_CONTAINER_NAME_INVALID, causes[0].message);
    }

    #[test]
    fn validate_dev_address() {
        let mut gs = GameServer::new("gs1", spec_with_containers(&["runner"]));
        gs.annotations_mut()
            .insert(crate::apis::DEV_ADDRESS_ANNOTATION.into(), "not-an-ip".into());
        gs.spec.ports.push(port(PortPolicy::Dynamic, Some(7777), None));
        gs.apply_defaults();

        let fields: Vec<_> = gs.validate().into_iter().map(|c| c.field).collect();
        assert_eq!(
            vec![
                "metadata.annotations.agones.dev/dev-address".to_owned(),
                "spec.ports[0].hostPort".to_owned(),
                "spec.ports[0].portPolicy".to_owned(),
            ],
            fields
        );

        gs.annotations_mut()
            .insert(crate::apis::DEV_ADDRESS_ANNOTATION.into(), "1.1.1.1".into());
        gs.spec.ports[0] = port(PortPolicy::Static, Some(7777), Some(7777));
        assert!(gs.validate().is_empty());
    }

    #[test]
    fn deletable_and_deleting() {
        let mut gs = GameServer::new("gs1", spec_with_containers(&["runner"]));
        gs.set_state(GameServerState::Allocated);
        assert!(!gs.is_deletable());
        assert!(!gs.is_being_deleted());

        gs.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        assert!(gs.is_deletable());
        assert!(gs.is_being_deleted());

        let mut gs = GameServer::new("gs2", spec_with_containers(&["runner"]));
        gs.set_state(GameServerState::Shutdown);
        assert!(gs.is_being_deleted());
        gs.set_state(GameServerState::RequestReady);
        assert!(gs.is_before_ready());
        gs.set_state(GameServerState::Ready);
        assert!(!gs.is_before_ready());
    }

    #[test]
    fn port_status() {
        let mut p = port(PortPolicy::Dynamic, Some(7777), Some(10));
        assert_eq!(10, p.status().port);
        p.port_policy = PortPolicy::None;
        assert_eq!(7777, p.status().port);
    }

    #[test]
    fn priorities() {
        let counter = |count, capacity| {
            let mut gs = GameServer::new("gs", GameServerSpec::default());
            gs.set_state(GameServerState::Ready);
            gs.status_mut()
                .counters
                .insert("rooms".into(), CounterStatus { count, capacity });
            gs
        };
        let ascending = [Priority {
            kind: PriorityType::Counter,
            key: "rooms".into(),
            order: PriorityOrder::Ascending,
        }];
        let descending = [Priority {
            order: PriorityOrder::Descending,
            ..ascending[0].clone()
        }];

        let full = counter(9, 10);
        let empty = counter(0, 10);
        let none = GameServer::new("none", GameServerSpec::default());

        assert_eq!(Some(true), full.compare_count_and_list_priorities(&ascending, &empty));
        assert_eq!(Some(false), full.compare_count_and_list_priorities(&descending, &empty));
        assert_eq!(None, full.compare_count_and_list_priorities(&ascending, &full));
        assert_eq!(Some(true), full.compare_count_and_list_priorities(&ascending, &none));
        assert_eq!(Some(false), none.compare_count_and_list_priorities(&ascending, &full));
        assert_eq!(Some(true), full.compare_count_and_list_priorities(&descending, &none));
        assert_eq!(None, none.compare_count_and_list_priorities(&ascending, &none));
    }
}
