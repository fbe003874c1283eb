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

//! The SDK server running next to every game server, in the same pod.
//!
//! The game server talks to it over gRPC, or over the HTTP gateway in front
//! of it, to move itself through its lifecycle, send health pings and edit
//! its own metadata.

pub mod cluster;
pub mod health;
pub mod http;
pub mod local;

use std::{collections::HashMap, pin::Pin};

use futures::Stream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

pub use self::{cluster::GameServerSdk, health::HealthTracker, local::LocalSdk};

use crate::{
    apis::GameServer,
    generated::agones::dev::sdk::{
        self,
        game_server::{spec, status},
        sdk_server::{Sdk, SdkServer},
    },
    signal::ShutdownRx,
};

/// The stream of game server snapshots sent to `WatchGameServer()` callers.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<sdk::GameServer, tonic::Status>> + Send>>;

/// Serves `sdk` over gRPC on `listener` until `shutdown` fires.
pub async fn serve<S: Sdk>(
    sdk: std::sync::Arc<S>,
    listener: tokio::net::TcpListener,
    mut shutdown: ShutdownRx,
) -> crate::Result<()> {
    tracing::info!(address = %listener.local_addr()?, "serving sdk grpc");
    tonic::transport::Server::builder()
        .add_service(SdkServer::from_arc(sdk))
        .serve_with_incoming_shutdown(
            tokio_stream::wrappers::TcpListenerStream::new(listener),
            async move {
                let _ = shutdown.changed().await;
            },
        )
        .await?;
    Ok(())
}

fn unix_seconds(time: Option<&Time>) -> i64 {
    time.map(|time| time.0.timestamp()).unwrap_or_default()
}

/// The SDK view of `gs`.
pub fn convert(gs: &GameServer) -> sdk::GameServer {
    let meta = &gs.metadata;
    let object_meta = sdk::game_server::ObjectMeta {
        name: gs.name().into(),
        namespace: gs.namespace().into(),
        uid: meta.uid.clone().unwrap_or_default(),
        resource_version: meta.resource_version.clone().unwrap_or_default(),
        generation: meta.generation.unwrap_or_default(),
        creation_timestamp: unix_seconds(meta.creation_timestamp.as_ref()),
        deletion_timestamp: unix_seconds(meta.deletion_timestamp.as_ref()),
        annotations: meta
            .annotations
            .iter()
            .flatten()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        labels: meta
            .labels
            .iter()
            .flatten()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    };

    let health = &gs.spec.health;
    let spec = sdk::game_server::Spec {
        health: Some(spec::Health {
            disabled: health.disabled,
            period_seconds: health.period_seconds,
            failure_threshold: health.failure_threshold,
            initial_delay_seconds: health.initial_delay_seconds,
        }),
    };

    let status = gs.status.as_ref().map(|gs_status| sdk::game_server::Status {
        state: gs_status.state.to_string(),
        address: gs_status.address.clone(),
        addresses: gs_status
            .addresses
            .iter()
            .map(|address| status::Address {
                r#type: address.type_.clone(),
                address: address.address.clone(),
            })
            .collect(),
        ports: gs_status
            .ports
            .iter()
            .map(|port| status::Port {
                name: port.name.clone(),
                port: port.port.into(),
            })
            .collect(),
        counters: gs_status
            .counters
            .iter()
            .map(|(name, counter)| {
                (
                    name.clone(),
                    status::CounterStatus {
                        count: counter.count,
                        capacity: counter.capacity,
                    },
                )
            })
            .collect::<HashMap<_, _>>(),
        lists: gs_status
            .lists
            .iter()
            .map(|(name, list)| {
                (
                    name.clone(),
                    status::ListStatus {
                        capacity: list.capacity,
                        values: list.values.clone(),
                    },
                )
            })
            .collect::<HashMap<_, _>>(),
    });

    sdk::GameServer {
        object_meta: Some(object_meta),
        spec: Some(spec),
        status,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{api::core::v1::NodeAddress, chrono::TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        apis::{CounterStatus, GameServerState, GameServerStatusPort},
        test::game_server_fixture,
    };

    #[test]
    fn convert_game_server() {
        let mut gs = game_server_fixture();
        gs.apply_defaults();
        gs.metadata.uid = Some("1234".into());
        gs.metadata.creation_timestamp = Some(Time(
            k8s_openapi::chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        ));
        gs.labels_mut().insert("mode".into(), "ranked".into());
        gs.set_state(GameServerState::Ready);
        let status = gs.status_mut();
        status.address = "1.2.3.4".into();
        status.addresses = vec![NodeAddress {
            type_: "ExternalIP".into(),
            address: "1.2.3.4".into(),
        }];
        status.ports = vec![GameServerStatusPort {
            name: "default".into(),
            port: 7001,
        }];
        status.counters.insert(
            "rooms".into(),
            CounterStatus {
                count: 1,
                capacity: 10,
            },
        );

        let converted = convert(&gs);
        let meta = converted.object_meta.unwrap();
        assert_eq!("test", meta.name);
        assert_eq!("default", meta.namespace);
        assert_eq!("1234", meta.uid);
        assert_eq!(1_700_000_000, meta.creation_timestamp);
        assert_eq!(0, meta.deletion_timestamp);
        assert_eq!(Some(&"ranked".to_owned()), meta.labels.get("mode"));

        let health = converted.spec.unwrap().health.unwrap();
        assert_eq!(5, health.period_seconds);
        assert_eq!(3, health.failure_threshold);

        let status = converted.status.unwrap();
        assert_eq!("Ready", status.state);
        assert_eq!("1.2.3.4", status.address);
        assert_eq!("ExternalIP", status.addresses[0].r#type);
        assert_eq!(
            vec![status::Port {
                name: "default".into(),
                port: 7001
            }],
            status.ports
        );
        assert_eq!(10, status.counters["rooms"].capacity);
    }
}
