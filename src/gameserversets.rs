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

//! Keeps each [`GameServerSet`] at its desired number of game servers.

pub mod allocation_overflow;
pub mod cache;
pub mod controller;
pub mod reconcile;

use std::{cmp::Ordering, collections::HashMap, sync::Arc};

pub use self::{
    allocation_overflow::AllocationOverflowController,
    controller::{Controller, ControllerConfig},
    reconcile::{compute_reconciliation_action, compute_status, ReconciliationAction},
};

use crate::{
    apis::{
        is_controlled_by, GameServer, GameServerSet, Priority, SchedulingStrategy,
        GAME_SERVER_SET_LABEL,
    },
    gameservers::NodeCount,
    k8s::Informers,
};

/// The game servers labelled with, and controlled by, `gss`.
pub fn list_game_servers_by_owner(informers: &Informers, gss: &GameServerSet) -> Vec<Arc<GameServer>> {
    informers
        .game_servers
        .list_namespaced(gss.namespace())
        .into_iter()
        .filter(|gs| {
            gs.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(GAME_SERVER_SET_LABEL))
                .is_some_and(|set| set == gss.name())
        })
        .filter(|gs| is_controlled_by(&**gs, gss))
        .collect()
}

/// Orders `list` so that the game servers to remove first come first.
pub fn sort_game_servers_by_strategy(
    strategy: SchedulingStrategy,
    mut list: Vec<Arc<GameServer>>,
    counts: &HashMap<String, NodeCount>,
    priorities: &[Priority],
) -> Vec<Arc<GameServer>> {
    match strategy {
        SchedulingStrategy::Packed => {
            list.sort_by(|a, b| least_full_nodes_first(a, b, counts, priorities))
        }
        SchedulingStrategy::Distributed => {
            list.sort_by(|a, b| newest_first(a, b, priorities))
        }
    }
    list
}

fn node_name(gs: &GameServer) -> &str {
    gs.status
        .as_ref()
        .map(|status| status.node_name.as_str())
        .unwrap_or_default()
}

fn priority_ordering(a: &GameServer, b: &GameServer, priorities: &[Priority]) -> Option<Ordering> {
    a.compare_count_and_list_priorities(priorities, b)
        .map(|less| if less { Ordering::Less } else { Ordering::Greater })
}

/// Game servers without a known node come first, then those on the nodes
/// with the fewest Ready and Allocated game servers, emptying one node at a
/// time. Within a node, game servers that are not Ready yet go first.
fn least_full_nodes_first(
    a: &GameServer,
    b: &GameServer,
    counts: &HashMap<String, NodeCount>,
    priorities: &[Priority],
) -> Ordering {
    let total = |gs: &GameServer| {
        counts
            .get(node_name(gs))
            .map(|count| count.ready + count.allocated)
    };

    match (total(a), total(b)) {
        (None, None) => return a.name().cmp(b.name()),
        (None, Some(_)) => return Ordering::Less,
        (Some(_), None) => return Ordering::Greater,
        (Some(a_total), Some(b_total)) if node_name(a) != node_name(b) => {
            return a_total
                .cmp(&b_total)
                .then_with(|| node_name(a).cmp(node_name(b)));
        }
        _ => {}
    }

    b.is_before_ready()
        .cmp(&a.is_before_ready())
        .then_with(|| priority_ordering(a, b, priorities).unwrap_or(Ordering::Equal))
        .then_with(|| a.name().cmp(b.name()))
}

fn newest_first(a: &GameServer, b: &GameServer, priorities: &[Priority]) -> Ordering {
    priority_ordering(a, b, priorities).unwrap_or_else(|| {
        b.metadata
            .creation_timestamp
            .cmp(&a.metadata.creation_timestamp)
            .then_with(|| b.name().cmp(a.name()))
    })
}
