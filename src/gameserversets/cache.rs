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

//! The writes made by the set controller that the game server cache has not
//! observed yet, so that back to back syncs of a set do not create or delete
//! the same game servers twice.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use dashmap::DashMap;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
use parking_lot::Mutex;

use crate::apis::{GameServer, GameServerSet};

#[derive(Default)]
struct Pending {
    creation: HashMap<String, Arc<GameServer>>,
    deletion: HashMap<String, Arc<GameServer>>,
}

/// The pending writes of a single set.
#[derive(Default)]
pub struct Entry {
    pending: Mutex<Pending>,
}

impl Entry {
    /// Records a game server that was just created.
    pub fn created(&self, gs: &GameServer) {
        self.pending
            .lock()
            .creation
            .insert(gs.name().to_owned(), Arc::new(gs.clone()));
    }

    /// Records a game server that was just deleted, stamping the copy held
    /// with a deletion timestamp.
    pub fn deleted(&self, gs: &GameServer) {
        let mut pending = self.pending.lock();
        pending.creation.remove(gs.name());

        let mut deleted = gs.clone();
        deleted.metadata.deletion_timestamp = Some(Time(Utc::now()));
        pending
            .deletion
            .insert(gs.name().to_owned(), Arc::new(deleted));
    }

    /// Merges the pending writes into `list`, as observed from the cache.
    ///
    /// Pending deletions replace the observed game server until the cache
    /// shows it being deleted, and are forgotten once it is gone from the
    /// cache. Pending creations are added until the cache shows them.
    pub fn reconcile_with_updated_server_list(
        &self,
        list: Vec<Arc<GameServer>>,
    ) -> Vec<Arc<GameServer>> {
        let mut pending = self.pending.lock();
        let mut found = HashSet::new();
        let mut result = Vec::with_capacity(list.len() + pending.creation.len());

        for gs in list {
            let name = gs.name().to_owned();
            match pending.deletion.get(&name).cloned() {
                Some(deleted) => {
                    if gs.metadata.deletion_timestamp.is_some() {
                        pending.deletion.remove(&name);
                    }
                    result.push(deleted);
                }
                None => result.push(gs),
            }

            pending.creation.remove(&name);
            found.insert(name);
        }

        pending.deletion.retain(|name, _| found.contains(name));
        result.extend(pending.creation.values().cloned());
        result
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize) {
        let pending = self.pending.lock();
        (pending.creation.len(), pending.deletion.len())
    }
}

/// The pending writes of every set, keyed by `namespace/name`.
#[derive(Default)]
pub struct GameServerStateCache {
    sets: DashMap<String, Arc<Entry>>,
}

impl GameServerStateCache {
    pub fn for_game_server_set(&self, gss: &GameServerSet) -> Arc<Entry> {
        self.sets
            .entry(crate::apis::key_of(gss))
            .or_default()
            .clone()
    }

    pub fn delete_game_server_set(&self, gss: &GameServerSet) {
        self.sets.remove(&crate::apis::key_of(gss));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::apis::GameServerSpec;

    fn game_server(name: &str) -> Arc<GameServer> {
        Arc::new(GameServer::new(name, GameServerSpec::default()))
    }

    fn names(list: &[Arc<GameServer>]) -> Vec<String> {
        let mut names: Vec<_> = list.iter().map(|gs| gs.name().to_owned()).collect();
        names.sort();
        names
    }

    #[test]
    fn pending_creations_until_observed() {
        let entry = Entry::default();
        entry.created(&game_server("gs1"));
        entry.created(&game_server("gs2"));

        let result = entry.reconcile_with_updated_server_list(vec![game_server("gs1")]);
        assert_eq!(vec!["gs1", "gs2"], names(&result));
        assert_eq!((1, 0), entry.counts());

        let result = entry.reconcile_with_updated_server_list(vec![
            game_server("gs1"),
            game_server("gs2"),
        ]);
        assert_eq!(vec!["gs1", "gs2"], names(&result));
        assert_eq!((0, 0), entry.counts());
    }

    #[test]
    fn pending_deletions_until_observed() {
        let entry = Entry::default();
        entry.created(&game_server("gs1"));
        entry.deleted(&game_server("gs1"));
        entry.deleted(&game_server("gs2"));
        assert_eq!((0, 2), entry.counts());

        // Not observed as deleted yet.
        let result = entry.reconcile_with_updated_server_list(vec![
            game_server("gs1"),
            game_server("gs2"),
        ]);
        assert!(result
            .iter()
            .all(|gs| gs.metadata.deletion_timestamp.is_some()));
        assert_eq!((0, 2), entry.counts());

        // gs1 is being deleted, gs2 is fully gone.
        let mut deleting = (*game_server("gs1")).clone();
        deleting.metadata.deletion_timestamp = Some(Time(Utc::now()));
        let result = entry.reconcile_with_updated_server_list(vec![Arc::new(deleting)]);
        assert_eq!(vec!["gs1"], names(&result));
        assert!(result[0].metadata.deletion_timestamp.is_some());
        assert_eq!((0, 0), entry.counts());
    }

    #[test]
    fn reconciliation_is_idempotent() {
        let entry = Entry::default();
        entry.created(&game_server("gs3"));
        entry.deleted(&game_server("gs1"));
        let observed = vec![game_server("gs1"), game_server("gs2")];

        let once = entry.reconcile_with_updated_server_list(observed.clone());
        let twice = entry.reconcile_with_updated_server_list(observed);
        assert_eq!(names(&once), names(&twice));
    }

    #[test]
    fn entries_per_set() {
        let cache = GameServerStateCache::default();
        let mut gss = GameServerSet::new("fleet", Default::default());
        gss.metadata.namespace = Some("default".into());

        cache.for_game_server_set(&gss).created(&game_server("gs1"));
        assert_eq!((1, 0), cache.for_game_server_set(&gss).counts());

        cache.delete_game_server_set(&gss);
        assert_eq!((0, 0), cache.for_game_server_set(&gss).counts());
    }
}
