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

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::RwLock;

use crate::{
    apis::{GameServer, GameServerState},
    k8s::{Change, Informer, Informers},
};

/// The number of Ready and Allocated game servers on a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeCount {
    pub ready: i64,
    pub allocated: i64,
}

#[derive(Clone, Debug)]
struct Processed {
    resource_version: Option<String>,
    state: Option<GameServerState>,
    node_name: String,
}

impl From<&GameServer> for Processed {
    fn from(gs: &GameServer) -> Self {
        Self {
            resource_version: gs.metadata.resource_version.clone(),
            state: gs.state(),
            node_name: node_name(gs).to_owned(),
        }
    }
}

#[derive(Default)]
struct Counts {
    nodes: HashMap<String, NodeCount>,
    /// The last version of each game server that was counted, by uid.
    processed: HashMap<String, Processed>,
}

impl Counts {
    fn inc(&mut self, node: &str, ready: i64, allocated: i64) {
        let count = self.nodes.entry(node.to_owned()).or_default();
        count.ready += ready;
        count.allocated += allocated;

        if count.allocated < 0 {
            tracing::warn!(%node, "allocated count went negative, resetting to 0");
            count.allocated = 0;
        }
        if count.ready < 0 {
            count.ready = 0;
        }
    }
}

/// A live count of Ready and Allocated game servers per node, used to order
/// game servers when packing.
pub struct PerNodeCounter {
    counts: RwLock<Counts>,
    game_servers: Arc<Informer<GameServer>>,
}

fn node_name(gs: &GameServer) -> &str {
    gs.status
        .as_ref()
        .map(|status| status.node_name.as_str())
        .unwrap_or_default()
}

fn uid(gs: &GameServer) -> String {
    gs.metadata
        .uid
        .clone()
        .unwrap_or_else(|| crate::apis::key_of(gs))
}

/// The change in Ready and Allocated counts when moving from `old` to `new`.
fn transition(old: Option<GameServerState>, new: Option<GameServerState>) -> (i64, i64) {
    let delta = |state| match (old == Some(state), new == Some(state)) {
        (true, false) => -1,
        (false, true) => 1,
        _ => 0,
    };

    (delta(GameServerState::Ready), delta(GameServerState::Allocated))
}

impl PerNodeCounter {
    pub fn new(informers: &Informers) -> Arc<Self> {
        let counter = Arc::new(Self {
            counts: <_>::default(),
            game_servers: informers.game_servers.clone(),
        });

        let weak = Arc::downgrade(&counter);
        informers.game_servers.add_handler(move |change| {
            if let Some(counter) = Weak::upgrade(&weak) {
                counter.on_game_server(change);
            }
        });

        let weak = Arc::downgrade(&counter);
        informers.nodes.add_handler(move |change| {
            if let (Change::Deleted(node), Some(counter)) = (change, Weak::upgrade(&weak)) {
                let name = node.metadata.name.as_deref().unwrap_or_default();
                counter.counts.write().nodes.remove(name);
            }
        });

        counter
    }

    fn on_game_server(&self, change: &Change<GameServer>) {
        let mut counts = self.counts.write();
        match change {
            Change::Added(gs) => {
                let key = uid(gs);
                if let Some(processed) = counts.processed.get(&key).cloned() {
                    if processed.state != gs.state() {
                        let (ready, allocated) = transition(processed.state, gs.state());
                        counts.processed.insert(key, Processed::from(&**gs));
                        counts.inc(node_name(gs), ready, allocated);
                    }
                    return;
                }

                counts.processed.insert(key, Processed::from(&**gs));
                let (ready, allocated) = transition(None, gs.state());
                counts.inc(node_name(gs), ready, allocated);
            }
            Change::Updated { old, new } => {
                let key = uid(new);
                let old_state = match counts.processed.get(&key) {
                    Some(processed)
                        if processed.resource_version == new.metadata.resource_version =>
                    {
                        return;
                    }
                    Some(processed) => processed.state,
                    None => old.state(),
                };

                let (ready, allocated) = transition(old_state, new.state());
                counts.processed.insert(key, Processed::from(&**new));
                counts.inc(node_name(new), ready, allocated);
            }
            Change::Deleted(gs) => {
                let key = uid(gs);
                let (state, node) = match counts.processed.remove(&key) {
                    Some(processed) => (processed.state, processed.node_name),
                    None => (gs.state(), node_name(gs).to_owned()),
                };

                let (ready, allocated) = transition(state, None);
                counts.inc(&node, ready, allocated);
            }
        }
    }

    /// Waits for the game server cache, then replaces the counts with a
    /// full count of it.
    pub async fn run(self: Arc<Self>) -> crate::Result<()> {
        tracing::debug!("running per node counter");
        self.game_servers.wait_for_sync().await;

        let mut counts = Counts::default();
        for gs in self.game_servers.list() {
            let (ready, allocated) = transition(None, gs.state());
            counts.inc(node_name(&gs), ready, allocated);
            counts.processed.insert(uid(&gs), Processed::from(&*gs));
        }

        *self.counts.write() = counts;
        Ok(())
    }

    /// A snapshot of the counts of every node.
    pub fn counts(&self) -> HashMap<String, NodeCount> {
        self.counts.read().nodes.clone()
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Node;
    use kube::runtime::watcher::Event;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::apis::GameServerSpec;

    fn game_server(name: &str, node: &str, state: GameServerState, version: &str) -> GameServer {
        let mut gs = GameServer::new(name, GameServerSpec::default());
        gs.metadata.namespace = Some("default".into());
        gs.metadata.uid = Some(format!("{name}-uid"));
        gs.metadata.resource_version = Some(version.into());
        gs.set_state(state);
        gs.status_mut().node_name = node.into();
        gs
    }

    fn count(ready: i64, allocated: i64) -> NodeCount {
        NodeCount { ready, allocated }
    }

    #[tokio::test]
    async fn counts_follow_game_servers() {
        let informers = Informers::default();
        let counter = PerNodeCounter::new(&informers);

        informers.game_servers.apply(Event::Restarted(vec![
            game_server("gs1", "n1", GameServerState::Ready, "1"),
            game_server("gs2", "n1", GameServerState::Allocated, "1"),
            game_server("gs3", "n2", GameServerState::Scheduled, "1"),
        ]));
        counter.clone().run().await.unwrap();

        let counts = counter.counts();
        assert_eq!(count(1, 1), counts["n1"]);
        assert_eq!(count(0, 0), counts["n2"]);

        informers.game_servers.apply(Event::Applied(game_server(
            "gs3",
            "n2",
            GameServerState::Ready,
            "2",
        )));
        informers.game_servers.apply(Event::Applied(game_server(
            "gs1",
            "n1",
            GameServerState::Allocated,
            "2",
        )));
        // Same version again is ignored.
        informers.game_servers.apply(Event::Applied(game_server(
            "gs1",
            "n1",
            GameServerState::Allocated,
            "2",
        )));

        let counts = counter.counts();
        assert_eq!(count(0, 2), counts["n1"]);
        assert_eq!(count(1, 0), counts["n2"]);

        informers.game_servers.apply(Event::Deleted(game_server(
            "gs2",
            "n1",
            GameServerState::Allocated,
            "1",
        )));
        assert_eq!(count(0, 1), counter.counts()["n1"]);

        let mut node = Node::default();
        node.metadata.name = Some("n2".into());
        informers.nodes.apply(Event::Deleted(node));
        assert!(!counter.counts().contains_key("n2"));
    }

    #[test]
    fn transitions() {
        use GameServerState::*;
        assert_eq!((1, 0), transition(None, Some(Ready)));
        assert_eq!((-1, 1), transition(Some(Ready), Some(Allocated)));
        assert_eq!((0, -1), transition(Some(Allocated), Some(Shutdown)));
        assert_eq!((0, 0), transition(Some(Ready), Some(Ready)));
    }
}
