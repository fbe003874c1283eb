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

//! Drives each [`GameServer`] through its lifecycle, from port allocation to
//! deletion, along with the controllers reacting to its backing pod.

pub mod controller;
pub mod health;
pub mod migration;
pub mod missing;
pub mod pernodecounter;
pub mod portallocator;
pub mod sidecar;
pub mod succeeded;

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, NodeAddress, Pod};

pub use self::{
    controller::{Controller, ControllerConfig},
    pernodecounter::{NodeCount, PerNodeCounter},
    portallocator::{PortAllocator, PortNotAllocatable},
    sidecar::SidecarConfig,
};

use crate::{
    apis::{GameServer, GameServerState, NODE_POD_IP_ADDRESS_TYPE},
    k8s::{object_reference, ApiError, Client, EventType, Informers},
};

const EXTERNAL_IP: &str = "ExternalIP";
const INTERNAL_IP: &str = "InternalIP";
const EXTERNAL_DNS: &str = "ExternalDNS";
const INTERNAL_DNS: &str = "InternalDNS";

/// Picks the address a game server on `node` is reachable at, returning it
/// with every address of the node.
///
/// A valid ExternalIP wins, then a valid InternalIP, then an ExternalDNS and
/// finally an InternalDNS name.
pub fn node_address(node: &Node) -> crate::Result<(String, Vec<NodeAddress>)> {
    let addresses: Vec<NodeAddress> = node
        .status
        .iter()
        .flat_map(|status| status.addresses.iter().flatten())
        .cloned()
        .collect();

    let find = |type_: &str, ip_only: bool| {
        addresses
            .iter()
            .find(|a| {
                a.type_ == type_ && (!ip_only || a.address.parse::<std::net::IpAddr>().is_ok())
            })
            .map(|a| a.address.clone())
    };

    let address = find(EXTERNAL_IP, true)
        .or_else(|| {
            tracing::debug!(
                node = node.metadata.name.as_deref(),
                "could not find ExternalIP, falling back to InternalIP"
            );
            find(INTERNAL_IP, true)
        })
        .or_else(|| find(EXTERNAL_DNS, false))
        .or_else(|| find(INTERNAL_DNS, false))
        .ok_or_else(|| {
            eyre::eyre!(
                "could not find an address for Node: {}",
                node.metadata.name.as_deref().unwrap_or_default()
            )
        })?;

    Ok((address, addresses))
}

/// Fills in the address, node and ports of `gs` from the node its pod runs
/// on.
pub fn apply_address_and_ports(gs: &mut GameServer, node: &Node, pod: &Pod) -> crate::Result<()> {
    let (address, mut addresses) = node_address(node).map_err(|error| {
        error.wrap_err(format!(
            "error getting external address for GameServer {}",
            gs.name()
        ))
    })?;

    addresses.extend(pod_ips(pod).into_iter().map(|ip| NodeAddress {
        type_: NODE_POD_IP_ADDRESS_TYPE.into(),
        address: ip,
    }));

    let ports = gs.spec.ports.iter().map(|port| port.status()).collect();
    let status = gs.status_mut();
    status.address = address;
    status.addresses = addresses;
    status.node_name = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_name.clone())
        .unwrap_or_default();
    status.ports = ports;
    Ok(())
}

/// Every IP assigned to `pod`.
pub(crate) fn pod_ips(pod: &Pod) -> Vec<String> {
    let Some(status) = pod.status.as_ref() else {
        return Vec::new();
    };

    let ips: Vec<String> = status
        .pod_ips
        .iter()
        .flatten()
        .filter_map(|ip| ip.ip.clone())
        .collect();

    if ips.is_empty() {
        status.pod_ip.iter().cloned().collect()
    } else {
        ips
    }
}

pub(crate) fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.node_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// The key of the game server owning `pod`, if the pod belongs to one.
pub(crate) fn owner_key(pod: &Pod) -> Option<String> {
    if !crate::apis::pod::is_game_server_pod(pod) {
        return None;
    }

    let owner = crate::apis::controller_of(pod).filter(|owner| owner.kind == "GameServer")?;
    Some(format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        owner.name
    ))
}

/// The pod backing `gs`: the pod sharing its name, controlled by it.
pub(crate) fn game_server_pod(informers: &Informers, gs: &GameServer) -> Option<Arc<Pod>> {
    informers
        .pods
        .get(gs.namespace(), gs.name())
        .filter(|pod| crate::apis::is_controlled_by(&**pod, gs))
}

/// Whether `gs` has yet to get a pod.
pub(crate) fn is_before_pod_created(gs: &GameServer) -> bool {
    matches!(
        gs.state(),
        Some(
            GameServerState::PortAllocation | GameServerState::Creating | GameServerState::Starting
        )
    )
}

/// Writes `gs`, counting a state transition when its state moved away from
/// `previous`.
pub(crate) async fn update_game_server(
    client: &dyn Client,
    gs: &GameServer,
    previous: Option<GameServerState>,
) -> Result<GameServer, ApiError> {
    let updated = client.update_game_server(gs).await?;
    if let Some(state) = updated.state().filter(|state| Some(*state) != previous) {
        crate::metrics::gameserver_state_transitions_total(state.as_ref()).inc();
    }
    Ok(updated)
}

/// Records an event against `gs`, with its current state as the reason.
pub(crate) async fn record_event(
    client: &dyn Client,
    gs: &GameServer,
    type_: EventType,
    message: &str,
) {
    let reason = gs.state().map(|state| state.to_string()).unwrap_or_default();
    client
        .record_event(object_reference(gs), type_, &reason, message)
        .await;
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{NodeStatus, PodIP, PodSpec, PodStatus};
    use pretty_assertions::assert_eq;

    use super::*;

    fn node(addresses: &[(&str, &str)]) -> Node {
        let mut node = Node {
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|(type_, address)| NodeAddress {
                            type_: (*type_).into(),
                            address: (*address).into(),
                        })
                        .collect(),
                ),
                ..<_>::default()
            }),
            ..<_>::default()
        };
        node.metadata.name = Some("node-1".into());
        node
    }

    #[test]
    fn address_preference() {
        let (address, all) = node_address(&node(&[
            ("InternalIP", "10.0.0.1"),
            ("ExternalDNS", "node.example.com"),
            ("ExternalIP", "12.12.12.12"),
        ]))
        .unwrap();
        assert_eq!("12.12.12.12", address);
        assert_eq!(3, all.len());

        let (address, _) =
            node_address(&node(&[("ExternalIP", "bogus"), ("InternalIP", "10.0.0.1")])).unwrap();
        assert_eq!("10.0.0.1", address);

        let (address, _) = node_address(&node(&[
            ("InternalDNS", "internal.example.com"),
            ("ExternalDNS", "node.example.com"),
        ]))
        .unwrap();
        assert_eq!("node.example.com", address);

        assert!(node_address(&node(&[("Hostname", "node-1")])).is_err());
    }

    #[test]
    fn address_and_ports_from_pod() {
        let mut gs = crate::test::game_server_fixture();
        gs.apply_defaults();
        gs.spec.ports[0].host_port = Some(7000);

        let pod = Pod {
            spec: Some(PodSpec {
                node_name: Some("node-1".into()),
                ..<_>::default()
            }),
            status: Some(PodStatus {
                pod_ips: Some(vec![PodIP {
                    ip: Some("10.1.0.5".into()),
                }]),
                ..<_>::default()
            }),
            ..<_>::default()
        };

        apply_address_and_ports(&mut gs, &node(&[("ExternalIP", "12.12.12.12")]), &pod).unwrap();

        let status = gs.status.unwrap();
        assert_eq!("12.12.12.12", status.address);
        assert_eq!("node-1", status.node_name);
        assert_eq!(7000, status.ports[0].port);
        assert_eq!(
            vec![
                NodeAddress {
                    type_: "ExternalIP".into(),
                    address: "12.12.12.12".into(),
                },
                NodeAddress {
                    type_: "PodIP".into(),
                    address: "10.1.0.5".into(),
                },
            ],
            status.addresses
        );
    }
}
