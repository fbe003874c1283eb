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

use std::{sync::Arc, time::Duration};

use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::{self, Utc},
};
use kube::runtime::watcher::Event;
use pretty_assertions::assert_eq;

use agones::{
    apis::{
        GameServerSet, GameServerSetSpec, GameServerSetStatus, GameServerState,
        GameServerTemplateSpec, SchedulingStrategy,
    },
    gameservers, gameserversets,
    signal::ShutdownKind,
    test::{game_server_fixture, node_fixture, FakeCluster},
};

/// Two nodes with two Ready children of `fleet-a` each, and an Allocated
/// game server outside the set on `n2`.
fn layout(cluster: &FakeCluster, scheduling: SchedulingStrategy) {
    cluster.add_node(node_fixture("n1", "1.1.1.1"));
    cluster.add_node(node_fixture("n2", "2.2.2.2"));

    let mut gss = GameServerSet::new(
        "fleet-a",
        GameServerSetSpec {
            replicas: 2,
            scheduling,
            template: GameServerTemplateSpec {
                metadata: None,
                spec: game_server_fixture().spec,
            },
            ..<_>::default()
        },
    );
    gss.metadata.namespace = Some("default".into());
    let gss = cluster.add_game_server_set(gss).unwrap();

    let created = Utc::now() - chrono::Duration::hours(1);
    let children = [("gs1", "n1"), ("gs2", "n1"), ("gs3", "n2"), ("gs4", "n2")];
    for (minutes, (name, node)) in (0..).zip(children) {
        let mut gs = gss.game_server();
        gs.metadata.name = Some(name.into());
        gs.apply_defaults();
        gs.set_state(GameServerState::Ready);
        gs.status_mut().node_name = node.into();

        let mut gs = cluster.add_game_server(gs);
        gs.metadata.creation_timestamp = Some(Time(created + chrono::Duration::minutes(minutes)));
        cluster.informers().game_servers.apply(Event::Applied(gs));
    }

    let mut outside = game_server_fixture();
    outside.metadata.name = Some("gsA".into());
    outside.apply_defaults();
    outside.set_state(GameServerState::Allocated);
    outside.status_mut().node_name = "n2".into();
    cluster.add_game_server(outside);
}

fn status(cluster: &FakeCluster) -> GameServerSetStatus {
    cluster
        .informers()
        .game_server_sets
        .get("default", "fleet-a")
        .and_then(|gss| gss.status.clone())
        .unwrap_or_default()
}

/// Runs both controllers over `layout` until the set settles, returning the
/// names of its remaining children.
async fn scale_down(scheduling: SchedulingStrategy) -> (Arc<FakeCluster>, Vec<String>) {
    let cluster = FakeCluster::new();
    let game_servers = gameservers::Controller::new(
        cluster.clone(),
        cluster.informers(),
        gameservers::ControllerConfig {
            workers: 4,
            ..<_>::default()
        },
    );
    let game_server_sets = gameserversets::Controller::new(
        cluster.clone(),
        cluster.informers(),
        game_servers.per_node_counter().clone(),
        gameserversets::ControllerConfig { workers: 4 },
    );
    layout(&cluster, scheduling);

    let (shutdown_tx, shutdown_rx) = agones::signal::channel(ShutdownKind::Testing);
    let tasks = [
        tokio::spawn(game_servers.run(shutdown_rx.clone())),
        tokio::spawn(game_server_sets.run(shutdown_rx)),
    ];

    assert!(
        cluster
            .wait_for(|cluster| {
                let status = status(cluster);
                let settled = cluster.informers().game_servers.list().len() == 3;
                settled && status.replicas == 2 && status.ready_replicas == 2
            })
            .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    shutdown_tx.send(ShutdownKind::Testing).unwrap();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let mut remaining: Vec<_> = cluster
        .informers()
        .game_servers
        .list()
        .into_iter()
        .map(|gs| gs.name().to_owned())
        .filter(|name| name != "gsA")
        .collect();
    remaining.sort();
    (cluster, remaining)
}

#[tokio::test(start_paused = true)]
async fn packed_scale_down() {
    let (cluster, remaining) = scale_down(SchedulingStrategy::Packed).await;

    assert_eq!(vec!["gs3", "gs4"], remaining);
    assert!(cluster.has_event("Normal SuccessfulDelete Deleted gameserver in state Ready: gs1"));
    assert!(cluster.has_event("Normal SuccessfulDelete Deleted gameserver in state Ready: gs2"));

    let status = status(&cluster);
    assert_eq!(2, status.replicas);
    assert_eq!(2, status.ready_replicas);
    assert_eq!(0, status.allocated_replicas);
}

#[tokio::test(start_paused = true)]
async fn distributed_scale_down() {
    let (cluster, remaining) = scale_down(SchedulingStrategy::Distributed).await;

    assert_eq!(vec!["gs1", "gs2"], remaining);
    assert!(cluster.has_event("Normal SuccessfulDelete Deleted gameserver in state Ready: gs4"));
    assert!(cluster.has_event("Normal SuccessfulDelete Deleted gameserver in state Ready: gs3"));

    let status = status(&cluster);
    assert_eq!(2, status.replicas);
    assert_eq!(2, status.ready_replicas);
}
