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

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    custom_resource, deserialize_null_default, Cause, GameServer, GameServerSpec,
    SchedulingStrategy,
};

/// A set of identical [`GameServer`]s kept at a desired number of replicas.
#[derive(Clone, Debug, PartialEq)]
pub struct GameServerSet {
    pub metadata: ObjectMeta,
    pub spec: GameServerSetSpec,
    pub status: Option<GameServerSetStatus>,
}

custom_resource!(
    GameServerSet,
    GameServerSetInner,
    kind = "GameServerSet",
    plural = "gameserversets",
    singular = "gameserverset",
    spec = GameServerSetSpec,
    status = GameServerSetStatus,
    subresources = ["status"]
);

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetSpec {
    /// The number of game servers to keep in the set.
    #[serde(default)]
    pub replicas: i32,
    /// Labels and annotations applied to allocated game servers that are in
    /// excess of `replicas`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_overflow: Option<AllocationOverflow>,
    #[serde(default)]
    pub scheduling: SchedulingStrategy,
    /// Ordering applied to game servers when choosing which to remove,
    /// after the scheduling strategy.
    #[serde(
        default,
        deserialize_with = "deserialize_null_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub priorities: Vec<Priority>,
    pub template: GameServerTemplateSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct GameServerTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    pub spec: GameServerSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetStatus {
    /// Total number of game servers in the set, excluding those being deleted.
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub reserved_replicas: i32,
    #[serde(default)]
    pub allocated_replicas: i32,
    /// Game servers that are shutting down or being deleted.
    #[serde(default)]
    pub shutdown_replicas: i32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, AggregatedCounterStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, AggregatedListStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedCounterStatus {
    #[serde(default)]
    pub allocated_count: i64,
    #[serde(default)]
    pub allocated_capacity: i64,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub capacity: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedListStatus {
    #[serde(default)]
    pub allocated_count: i64,
    #[serde(default)]
    pub allocated_capacity: i64,
    #[serde(default)]
    pub count: i64,
    #[serde(default)]
    pub capacity: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Priority {
    #[serde(rename = "type")]
    pub kind: PriorityType,
    pub key: String,
    #[serde(default)]
    pub order: PriorityOrder,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PriorityType {
    Counter,
    List,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PriorityOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct AllocationOverflow {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl AllocationOverflow {
    /// Whether `gs` already carries every overflow label and annotation.
    pub fn matches(&self, gs: &GameServer) -> bool {
        let contains = |actual: &Option<BTreeMap<String, String>>,
                        expected: &BTreeMap<String, String>| {
            expected.iter().all(|(key, value)| {
                actual
                    .as_ref()
                    .and_then(|map| map.get(key))
                    .is_some_and(|actual| actual == value)
            })
        };

        contains(&gs.metadata.labels, &self.labels)
            && contains(&gs.metadata.annotations, &self.annotations)
    }

    /// Splits `list` into the number of game servers which match, and the
    /// ones which don't.
    pub fn count_matches<'gs>(&self, list: &'gs [GameServer]) -> (usize, Vec<&'gs GameServer>) {
        let (matching, rest): (Vec<_>, Vec<_>) = list.iter().partition(|gs| self.matches(gs));
        (matching.len(), rest)
    }

    /// Merges the overflow labels and annotations into `gs`.
    pub fn apply(&self, gs: &mut GameServer) {
        if !self.labels.is_empty() {
            gs.labels_mut().extend(self.labels.clone());
        }
        if !self.annotations.is_empty() {
            gs.annotations_mut().extend(self.annotations.clone());
        }
    }

    fn validate(&self) -> Vec<Cause> {
        let meta = ObjectMeta {
            labels: Some(self.labels.clone()),
            annotations: Some(self.annotations.clone()),
            ..<_>::default()
        };

        super::validate_object_meta(&meta)
            .into_iter()
            .map(|cause| Cause {
                field: format!("spec.allocationOverflow.{}", cause.field),
                ..cause
            })
            .collect()
    }
}

impl GameServerSet {
    pub fn new(name: &str, spec: GameServerSetSpec) -> Self {
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

    /// Builds a new, unnamed child game server from the set's template.
    pub fn game_server(&self) -> GameServer {
        let mut gs = GameServer {
            metadata: self.spec.template.metadata.clone().unwrap_or_default(),
            spec: self.spec.template.spec.clone(),
            status: None,
        };

        gs.spec.scheduling = self.spec.scheduling;
        gs.metadata.name = None;
        gs.metadata.generate_name = Some(format!("{}-", self.name()));
        gs.metadata.namespace = self.metadata.namespace.clone();
        gs.metadata.resource_version = None;
        gs.metadata.uid = None;
        gs.metadata.owner_references = self.controller_owner_ref(&()).map(|owner| vec![owner]);
        gs.labels_mut()
            .insert(super::GAME_SERVER_SET_LABEL.into(), self.name().into());

        gs
    }

    /// Validates a newly submitted set.
    pub fn validate(&self) -> Vec<Cause> {
        let mut causes = super::validate_name("GameServerSet", self.name());

        if self.spec.replicas < 0 {
            causes.push(Cause::invalid("spec.replicas", "replicas must not be negative"));
        }

        let mut gs = GameServer {
            metadata: self.spec.template.metadata.clone().unwrap_or_default(),
            spec: self.spec.template.spec.clone(),
            status: None,
        };
        gs.apply_defaults();
        causes.extend(gs.spec.validate(gs.dev_address(), "spec.template.spec"));

        if let Some(meta) = &self.spec.template.metadata {
            causes.extend(
                super::validate_object_meta(meta)
                    .into_iter()
                    .map(|cause| Cause {
                        field: format!("spec.template.metadata.{}", cause.field),
                        ..cause
                    }),
            );
        }

        if let Some(overflow) = &self.spec.allocation_overflow {
            causes.extend(overflow.validate());
        }

        causes
    }

    /// Validates an update of `old` into `self`.
    pub fn validate_update(&self, old: &Self) -> Vec<Cause> {
        let mut causes = super::validate_name("GameServerSet", self.name());

        if self.spec.template != old.spec.template {
            causes.push(Cause::invalid(
                "spec.template",
                "GameServerSet template cannot be updated",
            ));
        }

        causes
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::apis::{GameServerPort, PortPolicy};

    fn game_server_set() -> GameServerSet {
        let mut gss = GameServerSet::new(
            "fleet-a",
            GameServerSetSpec {
                replicas: 2,
                scheduling: SchedulingStrategy::Distributed,
                template: GameServerTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some([("app".to_owned(), "game".to_owned())].into()),
                        ..<_>::default()
                    }),
                    spec: GameServerSpec {
                        ports: vec![GameServerPort {
                            name: "game".into(),
                            port_policy: PortPolicy::Dynamic,
                            container_port: Some(7654),
                            ..<_>::default()
                        }],
                        template: PodTemplateSpec {
                            metadata: None,
                            spec: Some(PodSpec {
                                containers: vec![Container {
                                    name: "runner".into(),
                                    image: Some("runner:1".into()),
                                    ..<_>::default()
                                }],
                                ..<_>::default()
                            }),
                        },
                        ..<_>::default()
                    },
                },
                ..<_>::default()
            },
        );
        gss.metadata.namespace = Some("default".into());
        gss.metadata.uid = Some("1234".into());
        gss
    }

    #[test]
    fn game_server_from_template() {
        let gss = game_server_set();
        let gs = gss.game_server();

        assert_eq!(None, gs.metadata.name);
        assert_eq!(Some("fleet-a-"), gs.metadata.generate_name.as_deref());
        assert_eq!("default", gs.namespace());
        assert_eq!(SchedulingStrategy::Distributed, gs.spec.scheduling);
        let labels = gs.metadata.labels.clone().unwrap();
        assert_eq!("fleet-a", labels[crate::apis::GAME_SERVER_SET_LABEL]);
        assert_eq!("game", labels["app"]);
        assert!(crate::apis::is_controlled_by(&gs, &gss));
    }

    #[test]
    fn validate() {
        let mut gss = game_server_set();
        assert!(gss.validate().is_empty());

        gss.spec.replicas = -1;
        gss.spec.template.spec.ports[0].container_port = None;
        let fields: Vec<_> = gss.validate().into_iter().map(|c| c.field).collect();
        assert_eq!(
            vec![
                "spec.replicas".to_owned(),
                "spec.template.spec.ports[0].containerPort".to_owned()
            ],
            fields
        );
    }

    #[test]
    fn validate_update() {
        let old = game_server_set();
        let mut new = old.clone();
        new.spec.replicas = 10;
        new.spec.scheduling = SchedulingStrategy::Packed;
        assert!(new.validate_update(&old).is_empty());

        new.spec.template.spec.ports[0].container_port = Some(1);
        let causes = new.validate_update(&old);
        assert_eq!(1, causes.len());
        assert_eq!("GameServerSet template cannot be updated", causes[0].message);
    }

    #[test]
    fn allocation_overflow() {
        let overflow = AllocationOverflow {
            labels: [("colour".to_owned(), "green".to_owned())].into(),
            annotations: [("overflow".to_owned(), "true".to_owned())].into(),
        };

        let gss = game_server_set();
        let mut a = gss.game_server();
        let b = gss.game_server();
        overflow.apply(&mut a);

        let list = vec![a, b];
        let (count, rest) = overflow.count_matches(&list);
        assert_eq!(1, count);
        assert_eq!(1, rest.len());
        assert!(!overflow.matches(rest[0]));
    }

    #[test]
    fn deserialize_priorities() {
        let priority: Priority = serde_json::from_value(serde_json::json!({
            "type": "List",
            "key": "players",
        }))
        .unwrap();

        assert_eq!(PriorityType::List, priority.kind);
        assert_eq!(PriorityOrder::Ascending, priority.order);
    }
}
