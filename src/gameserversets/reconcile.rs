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

use std::{collections::HashMap, sync::Arc};

use crate::{
    apis::{
        AggregatedCounterStatus, AggregatedListStatus, CounterStatus, GameServer,
        GameServerSetStatus, GameServerState, ListStatus, Priority, SchedulingStrategy,
    },
    gameservers::NodeCount,
};

/// What a set needs to do to get closer to its desired replicas.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconciliationAction {
    pub to_add: usize,
    pub to_delete: Vec<Arc<GameServer>>,
    /// Whether the action was capped, so another sync should follow straight
    /// away.
    pub partial: bool,
}

/// Decides how many game servers to create and which to delete so that
/// `list` reaches `target_replicas`, with at most `max_creations` creations,
/// `max_deletions` deletions and `max_pending` game servers without a
/// running pod.
///
/// Allocated and Reserved game servers are never deleted. Error and
/// Unhealthy ones always are.
#[allow(clippy::too_many_arguments)]
pub fn compute_reconciliation_action(
    strategy: SchedulingStrategy,
    list: &[Arc<GameServer>],
    counts: &HashMap<String, NodeCount>,
    target_replicas: usize,
    max_creations: usize,
    max_deletions: usize,
    max_pending: usize,
    priorities: &[Priority],
) -> ReconciliationAction {
    let mut up = 0;
    let mut delete_count = 0;
    let mut pod_pending = 0;
    let mut potential_deletions = Vec::new();
    let mut to_delete = Vec::new();

    // Allocated and Reserved game servers can't be touched, so they are
    // counted before anything else.
    up += list.iter().filter(|gs| !gs.is_deletable()).count();

    for gs in list.iter().filter(|gs| gs.is_deletable()) {
        // On its way out, so it no longer counts towards the replicas.
        if gs.is_being_deleted() {
            continue;
        }

        let mut game_server_up = |gs: &Arc<GameServer>| {
            if up >= target_replicas {
                delete_count += 1;
            } else {
                up += 1;
            }
            potential_deletions.push(gs.clone());
        };

        match gs.state() {
            Some(
                GameServerState::PortAllocation
                | GameServerState::Creating
                | GameServerState::Starting
                | GameServerState::Scheduled,
            ) => {
                pod_pending += 1;
                game_server_up(gs);
            }
            Some(GameServerState::Error | GameServerState::Unhealthy) => {
                to_delete.push(gs.clone());
            }
            // RequestReady, Ready and Reserved, along with anything unknown.
            _ => game_server_up(gs),
        }
    }

    let mut partial = false;
    let mut to_add = 0;
    if up < target_replicas {
        let wanted = target_replicas - up;
        to_add = wanted
            .min(max_creations)
            .min(max_pending.saturating_sub(pod_pending));
        partial = to_add != wanted;
    }

    if delete_count > 0 {
        let sorted = super::sort_game_servers_by_strategy(
            strategy,
            potential_deletions,
            counts,
            priorities,
        );
        to_delete.extend(sorted.into_iter().take(delete_count));
    }

    if to_delete.len() > max_deletions {
        to_delete.truncate(max_deletions);
        partial = true;
    }

    ReconciliationAction {
        to_add,
        to_delete,
        partial,
    }
}

fn aggregate_counters(
    aggregated: &mut std::collections::BTreeMap<String, AggregatedCounterStatus>,
    counters: &std::collections::BTreeMap<String, CounterStatus>,
    allocated: bool,
) {
    for (name, counter) in counters {
        let entry = aggregated.entry(name.clone()).or_default();
        entry.count += counter.count;
        entry.capacity += counter.capacity;
        if allocated {
            entry.allocated_count += counter.count;
            entry.allocated_capacity += counter.capacity;
        }
    }
}

fn aggregate_lists(
    aggregated: &mut std::collections::BTreeMap<String, AggregatedListStatus>,
    lists: &std::collections::BTreeMap<String, ListStatus>,
    allocated: bool,
) {
    for (name, list) in lists {
        let count = list.values.len() as i64;
        let entry = aggregated.entry(name.clone()).or_default();
        entry.count += count;
        entry.capacity += list.capacity;
        if allocated {
            entry.allocated_count += count;
            entry.allocated_capacity += list.capacity;
        }
    }
}

/// The status of a set made up of the game servers in `list`.
pub fn compute_status(list: &[Arc<GameServer>]) -> GameServerSetStatus {
    let mut status = GameServerSetStatus::default();

    for gs in list {
        if gs.is_being_deleted() {
            status.shutdown_replicas += 1;
            continue;
        }

        status.replicas += 1;
        match gs.state() {
            Some(GameServerState::Ready) => status.ready_replicas += 1,
            Some(GameServerState::Allocated) => status.allocated_replicas += 1,
            Some(GameServerState::Reserved) => status.reserved_replicas += 1,
            _ => {}
        }

        if let Some(gs_status) = &gs.status {
            let allocated = gs_status.state == GameServerState::Allocated;
            aggregate_counters(&mut status.counters, &gs_status.counters, allocated);
            aggregate_lists(&mut status.lists, &gs_status.lists, allocated);
        }
    }

    status
}
