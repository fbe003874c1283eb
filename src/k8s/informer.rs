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

//! A watch backed cache of kubernetes objects which notifies registered
//! handlers of every change it observes.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use futures::StreamExt;
use kube::{
    runtime::{
        reflector::{store::Writer, ObjectRef, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Resource,
};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;

use crate::signal::ShutdownRx;

/// A change observed by an [`Informer`].
#[derive(Debug)]
pub enum Change<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> Change<K> {
    /// The most recent version of the object.
    pub fn object(&self) -> &Arc<K> {
        match self {
            Self::Added(object) | Self::Deleted(object) => object,
            Self::Updated { new, .. } => new,
        }
    }
}

type Handler<K> = Arc<dyn Fn(&Change<K>) + Send + Sync>;

pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    writer: Mutex<Writer<K>>,
    store: Store<K>,
    handlers: RwLock<Vec<Handler<K>>>,
    synced: tokio::sync::watch::Sender<bool>,
}

impl<K> Default for Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn default() -> Self {
        let writer = Writer::default();
        let store = writer.as_reader();
        Self {
            writer: Mutex::new(writer),
            store,
            handlers: <_>::default(),
            synced: tokio::sync::watch::channel(false).0,
        }
    }
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a handler which is called synchronously for every change.
    /// Handlers must not block.
    pub fn add_handler(&self, handler: impl Fn(&Change<K>) + Send + Sync + 'static) {
        self.handlers.write().push(Arc::new(handler));
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let mut reference = ObjectRef::new(name);
        if !namespace.is_empty() {
            reference = reference.within(namespace);
        }
        self.store.get(&reference)
    }

    /// Looks up a cluster scoped object.
    pub fn get_cluster(&self, name: &str) -> Option<Arc<K>> {
        self.get("", name)
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.state()
    }

    pub fn list_namespaced(&self, namespace: &str) -> Vec<Arc<K>> {
        self.store
            .state()
            .into_iter()
            .filter(|object| object.meta().namespace.as_deref().unwrap_or_default() == namespace)
            .collect()
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Waits until the first full listing has been observed.
    pub async fn wait_for_sync(&self) {
        let mut synced = self.synced.subscribe();
        // The sender lives as long as `self`.
        let _ = synced.wait_for(|synced| *synced).await;
    }

    /// Applies a watch event to the cache, then notifies every handler of
    /// the resulting changes.
    pub fn apply(&self, event: Event<K>) {
        let changes = {
            let mut writer = self.writer.lock();
            let changes = self.diff(&event);
            writer.apply_watcher_event(&event);
            changes
        };

        if matches!(event, Event::Restarted(_)) {
            self.synced.send_replace(true);
        }

        let handlers = self.handlers.read().clone();
        for change in &changes {
            for handler in &handlers {
                handler(change);
            }
        }
    }

    fn diff(&self, event: &Event<K>) -> Vec<Change<K>> {
        match event {
            Event::Applied(object) => vec![self.applied(object)],
            Event::Deleted(object) => {
                let old = self
                    .store
                    .get(&ObjectRef::from_obj(object))
                    .unwrap_or_else(|| Arc::new(object.clone()));
                vec![Change::Deleted(old)]
            }
            Event::Restarted(objects) => {
                let mut previous: HashMap<ObjectRef<K>, Arc<K>> = self
                    .store
                    .state()
                    .into_iter()
                    .map(|object| (ObjectRef::from_obj(&*object), object))
                    .collect();

                let mut changes: Vec<_> = objects
                    .iter()
                    .map(|object| {
                        let new = Arc::new(object.clone());
                        match previous.remove(&ObjectRef::from_obj(object)) {
                            Some(old) => Change::Updated { old, new },
                            None => Change::Added(new),
                        }
                    })
                    .collect();

                changes.extend(previous.into_values().map(Change::Deleted));
                changes
            }
        }
    }

    fn applied(&self, object: &K) -> Change<K> {
        let new = Arc::new(object.clone());
        match self.store.get(&ObjectRef::from_obj(object)) {
            Some(old) => Change::Updated { old, new },
            None => Change::Added(new),
        }
    }

    /// Watches `api`, feeding every event into the cache until `shutdown`
    /// fires.
    pub async fn run(
        self: Arc<Self>,
        api: kube::Api<K>,
        config: watcher::Config,
        mut shutdown: ShutdownRx,
    ) -> crate::Result<()>
    where
        K: DeserializeOwned,
    {
        let kind = K::kind(&()).into_owned();
        let stream = watcher::watcher(api, config).default_backoff();
        tokio::pin!(stream);

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(error)) => {
                        tracing::warn!(%error, %kind, "watch failed, retrying");
                    }
                    None => return Err(eyre::eyre!("{kind} watch stream ended")),
                },
                _ = shutdown.changed() => {
                    tracing::debug!(%kind, "stopping informer");
                    return Ok(());
                }
            }
        }
    }
}
