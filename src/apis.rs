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

//! The `agones.dev/v1` resources managed by the controllers, along with the
//! well-known labels and annotations shared between the controllers, the
//! SDK server and the admission webhooks.

pub mod gameserver;
pub mod gameserverset;
pub mod pod;

use serde::{Deserialize, Serialize};

pub use self::{
    gameserver::{
        CounterStatus, Eviction, EvictionSafe, GameServer, GameServerPort, GameServerSpec, GameServerState,
        GameServerStatus, GameServerStatusPort, Health, ListStatus, PortPolicy, Protocol,
        SdkServer, SdkServerLogLevel,
    },
    gameserverset::{
        AggregatedCounterStatus, AggregatedListStatus, AllocationOverflow, GameServerSet, GameServerSetSpec, GameServerSetStatus,
        GameServerTemplateSpec, Priority, PriorityOrder, PriorityType,
    },
};

pub const GROUP: &str = "agones.dev";
pub const VERSION: &str = "v1";
pub const API_VERSION: &str = "agones.dev/v1";

/// Finalizer placed on every [`GameServer`] so it outlives its backing pod.
pub const FINALIZER_NAME: &str = GROUP;
/// Label marking a pod as a game server pod.
pub const ROLE_LABEL: &str = "agones.dev/role";
pub const GAME_SERVER_LABEL_ROLE: &str = "gameserver";
/// Label on a pod holding the name of its owning [`GameServer`].
pub const GAME_SERVER_POD_LABEL: &str = "agones.dev/gameserver";
/// Label on a [`GameServer`] holding the name of its owning [`GameServerSet`].
pub const GAME_SERVER_SET_LABEL: &str = "agones.dev/gameserverset";
/// Annotation on a pod naming the game server container.
pub const GAME_SERVER_CONTAINER_ANNOTATION: &str = "agones.dev/container";
pub const DEV_ADDRESS_ANNOTATION: &str = "agones.dev/dev-address";
pub const READY_CONTAINER_ID_ANNOTATION: &str = "agones.dev/ready-container-id";
pub const ERRORED_AT_ANNOTATION: &str = "agones.dev/errored-at";
pub const PASSTHROUGH_PORT_ASSIGNMENT_ANNOTATION: &str =
    "agones.dev/container-passthrough-port-assignment";
pub const SDK_VERSION_ANNOTATION: &str = "agones.dev/sdk-version";
pub const LAST_ALLOCATED_ANNOTATION: &str = "gameserver.agones.dev/last-allocated";
pub const POD_SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";
/// Prefix applied to labels and annotations set through the SDK.
pub const SDK_METADATA_PREFIX: &str = "agones.dev/sdk-";
/// Address type used for the pod IP entries in [`GameServerStatus::addresses`].
pub const NODE_POD_IP_ADDRESS_TYPE: &str = "PodIP";

/// The maximum length of a label value, which bounds the names of resources
/// used as label values.
pub const LABEL_VALUE_MAX_LENGTH: usize = 63;

/// The strategy used when scheduling and scaling down game servers.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, schemars::JsonSchema,
)]
pub enum SchedulingStrategy {
    /// Prioritise nodes with the most allocated, then ready game servers,
    /// bin packing as many game servers onto a single node as possible.
    #[default]
    Packed,
    /// Prioritise nodes with the least allocated game servers, spreading
    /// them across as many nodes as possible.
    Distributed,
}

/// A single reason an object failed validation, shaped like the
/// `StatusCause` of an admission response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Cause {
    pub reason: CauseReason,
    pub field: String,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum_macros::AsRefStr)]
pub enum CauseReason {
    FieldValueInvalid,
    FieldValueRequired,
    FieldValueForbidden,
}

impl Cause {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CauseReason::FieldValueInvalid, field, message)
    }

    pub fn required(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CauseReason::FieldValueRequired, field, message)
    }

    pub fn forbidden(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CauseReason::FieldValueForbidden, field, message)
    }

    fn new(reason: CauseReason, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<Cause> for kube::core::response::StatusCause {
    fn from(cause: Cause) -> Self {
        Self {
            reason: cause.reason.as_ref().to_owned(),
            message: cause.message,
            field: cause.field,
        }
    }
}

/// Checks `name` fits in a label value, as children carry their owner's name
/// in a label.
pub(crate) fn validate_name(kind: &str, name: &str) -> Vec<Cause> {
    if name.len() > LABEL_VALUE_MAX_LENGTH {
        vec![Cause::invalid(
            "Name",
            format!("Length of {kind} '{name}' name should be no more than 63 characters."),
        )]
    } else {
        Vec::new()
    }
}

/// Validates the labels and annotations of a pod template's metadata.
pub(crate) fn validate_object_meta(
    meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
) -> Vec<Cause> {
    use once_cell::sync::Lazy;
    use regex::Regex;

    static QUALIFIED_NAME: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$")
            .unwrap()
    });
    static LABEL_VALUE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").unwrap());

    let mut causes = Vec::new();
    for (key, value) in meta.labels.iter().flatten() {
        if !QUALIFIED_NAME.is_match(key) {
            causes.push(Cause::invalid(
                "labels",
                format!("labels: Invalid value: {key:?}: name part must consist of alphanumeric characters, '-', '_' or '.'"),
            ));
        }
        if value.len() > LABEL_VALUE_MAX_LENGTH || !LABEL_VALUE.is_match(value) {
            causes.push(Cause::invalid(
                "labels",
                format!("labels: Invalid value: {value:?}: a valid label must be 63 characters or less and consist of alphanumeric characters, '-', '_' or '.'"),
            ));
        }
    }

    for key in meta.annotations.iter().flat_map(|a| a.keys()) {
        if !QUALIFIED_NAME.is_match(key) {
            causes.push(Cause::invalid(
                "annotations",
                format!("annotations: Invalid value: {key:?}: name part must consist of alphanumeric characters, '-', '_' or '.'"),
            ));
        }
    }

    causes
}

pub(crate) fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: serde::de::Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// Implements the kubernetes resource plumbing for an `agones.dev/v1` custom
/// resource with `metadata`, `spec` and optional `status` fields: serde with
/// `apiVersion`/`kind`, [`kube::Resource`], [`kube::core::object::HasSpec`],
/// [`kube::core::object::HasStatus`] and
/// [`kube::core::crd::v1::CustomResourceExt`].
macro_rules! custom_resource {
    (
        $ty:ident, $inner:ident,
        kind = $kind:literal,
        plural = $plural:literal,
        singular = $singular:literal,
        spec = $spec:ty,
        status = $status:ty,
        subresources = [$($subresource:literal),*]
    ) => {
        #[derive(Clone, Debug, serde::Deserialize, schemars::JsonSchema)]
        #[serde(rename_all = "camelCase")]
        struct $inner {
            #[schemars(skip)]
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
            spec: $spec,
            #[serde(default)]
            status: Option<$status>,
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
                use serde::{de::Error, Deserialize};
                let value = serde_json::Value::deserialize(de)?;

                serde_json::from_value::<$inner>(value.clone())
                    .map_err(|error| {
                        tracing::trace!(%error, %value, kind = $kind, "failed to deserialize resource");
                        Error::custom(error)
                    })
                    .map(|$inner { metadata, spec, status }| Self {
                        metadata,
                        spec,
                        status,
                    })
            }
        }

        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
                use kube::core::Resource;
                use serde::ser::SerializeStruct;
                let mut obj = ser.serialize_struct($kind, 5)?;
                obj.serialize_field("apiVersion", &<$ty>::api_version(&()))?;
                obj.serialize_field("kind", &<$ty>::kind(&()))?;
                obj.serialize_field("metadata", &self.metadata)?;
                obj.serialize_field("spec", &self.spec)?;
                obj.serialize_field("status", &self.status)?;
                obj.end()
            }
        }

        impl kube::core::Resource for $ty {
            type DynamicType = ();
            type Scope = kube::core::NamespaceResourceScope;

            fn group(_: &()) -> std::borrow::Cow<'_, str> {
                $crate::apis::GROUP.into()
            }

            fn kind(_: &()) -> std::borrow::Cow<'_, str> {
                $kind.into()
            }

            fn version(_: &()) -> std::borrow::Cow<'_, str> {
                $crate::apis::VERSION.into()
            }

            fn api_version(_: &()) -> std::borrow::Cow<'_, str> {
                $crate::apis::API_VERSION.into()
            }

            fn plural(_: &()) -> std::borrow::Cow<'_, str> {
                $plural.into()
            }

            fn meta(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(
                &mut self,
            ) -> &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &mut self.metadata
            }
        }

        impl kube::core::object::HasSpec for $ty {
            type Spec = $spec;

            fn spec(&self) -> &$spec {
                &self.spec
            }

            fn spec_mut(&mut self) -> &mut $spec {
                &mut self.spec
            }
        }

        impl kube::core::object::HasStatus for $ty {
            type Status = $status;

            fn status(&self) -> Option<&$status> {
                self.status.as_ref()
            }

            fn status_mut(&mut self) -> &mut Option<$status> {
                &mut self.status
            }
        }

        impl kube::core::crd::v1::CustomResourceExt for $ty {
            fn crd() -> k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition {
                use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
                    CustomResourceDefinition, CustomResourceDefinitionNames,
                    CustomResourceDefinitionSpec, CustomResourceDefinitionVersion,
                    CustomResourceSubresources, CustomResourceValidation,
                };

                let schema = schemars::gen::SchemaSettings::openapi3()
                    .with(|s| {
                        s.inline_subschemas = true;
                        s.meta_schema = None;
                    })
                    .with_visitor(kube_core::schema::StructuralSchemaRewriter)
                    .into_generator()
                    .into_root_schema_for::<$inner>();

                // k8s and schemars have different root JSON schema types, so
                // convert between them through JSON.
                let open_api_v3_schema = serde_json::to_value(&schema)
                    .and_then(serde_json::from_value)
                    .ok();

                let subresources = [$($subresource),*];
                let subresources = (!subresources.is_empty()).then(|| CustomResourceSubresources {
                    status: subresources
                        .contains(&"status")
                        .then(|| k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceSubresourceStatus(serde_json::json!({}))),
                    ..<_>::default()
                });

                CustomResourceDefinition {
                    metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                        name: Some(Self::crd_name().into()),
                        ..<_>::default()
                    },
                    spec: CustomResourceDefinitionSpec {
                        group: $crate::apis::GROUP.into(),
                        scope: "Namespaced".into(),
                        names: CustomResourceDefinitionNames {
                            plural: $plural.into(),
                            singular: Some($singular.into()),
                            kind: $kind.into(),
                            ..<_>::default()
                        },
                        versions: vec![CustomResourceDefinitionVersion {
                            name: $crate::apis::VERSION.into(),
                            served: true,
                            storage: true,
                            schema: Some(CustomResourceValidation {
                                open_api_v3_schema,
                            }),
                            subresources,
                            ..<_>::default()
                        }],
                        ..<_>::default()
                    },
                    status: None,
                }
            }

            fn crd_name() -> &'static str {
                concat!($plural, ".agones.dev")
            }

            fn api_resource() -> kube::core::dynamic::ApiResource {
                kube::core::dynamic::ApiResource::erase::<Self>(&())
            }

            fn shortnames() -> &'static [&'static str] {
                &[]
            }
        }
    };
}

pub(crate) use custom_resource;

/// Returns `namespace/name`, the key used by the work queues for namespaced
/// objects.
pub fn key_of<K: kube::Resource>(object: &K) -> String {
    let meta = object.meta();
    match meta.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => {
            format!("{namespace}/{}", meta.name.as_deref().unwrap_or_default())
        }
        _ => meta.name.clone().unwrap_or_default(),
    }
}

/// Splits a work queue key into its namespace and name.
pub fn split_key(key: &str) -> crate::Result<(&str, &str)> {
    match key.split_once('/') {
        Some((namespace, name)) if !name.contains('/') => Ok((namespace, name)),
        None if !key.is_empty() => Ok(("", key)),
        _ => Err(eyre::eyre!("unexpected key format: {key:?}")),
    }
}

/// Returns whether `owner` is the controller of `object`.
pub fn is_controlled_by<O: kube::Resource, K: kube::Resource<DynamicType = ()>>(
    object: &O,
    owner: &K,
) -> bool {
    let Some(uid) = owner.meta().uid.as_deref() else {
        return false;
    };

    controller_of(object).is_some_and(|reference| {
        reference.uid == uid && reference.kind == K::kind(&())
    })
}

/// Returns the controller owner reference of `object`, if any.
pub fn controller_of<O: kube::Resource>(
    object: &O,
) -> Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference> {
    object
        .meta()
        .owner_references
        .iter()
        .flatten()
        .find(|reference| reference.controller == Some(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys() {
        assert_eq!(("default", "gs1"), split_key("default/gs1").unwrap());
        assert_eq!(("", "node-1"), split_key("node-1").unwrap());
        assert!(split_key("a/b/c").is_err());
        assert!(split_key("").is_err());
    }

    #[test]
    fn name_length() {
        assert!(validate_name("GameServer", &"a".repeat(63)).is_empty());
        let causes = validate_name("GameServer", &"a".repeat(64));
        assert_eq!(1, causes.len());
        assert_eq!("Name", causes[0].field);
        assert!(causes[0]
            .message
            .starts_with("Length of GameServer 'aaaa"));
    }

    #[test]
    fn object_meta() {
        let mut meta = k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta::default();
        meta.labels = Some([("agones.dev/sdk-foo".to_owned(), "bar".to_owned())].into());
        assert!(validate_object_meta(&meta).is_empty());

        meta.labels = Some([("bad key!".to_owned(), "bar".to_owned())].into());
        meta.annotations = Some([("also bad!".to_owned(), "anything / goes".to_owned())].into());
        let causes = validate_object_meta(&meta);
        assert_eq!(2, causes.len());
        assert_eq!("labels", causes[0].field);
        assert_eq!("annotations", causes[1].field);
    }
}
