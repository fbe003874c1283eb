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

//! Named, rate limited queues of object keys processed by a pool of workers.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::signal::ShutdownRx;

/// Retries of a key up to this count use the fast delay.
const MAX_FAST_ATTEMPTS: u32 = 5;

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, queued or not.
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// A queue of keys where a key is processed by at most one worker at a
/// time. A key added while in flight is processed once more afterwards.
pub struct WorkQueue {
    name: String,
    fast_delay: Duration,
    slow_delay: Duration,
    state: Mutex<State>,
    notify: Notify,
    configured_workers: AtomicUsize,
    running_workers: AtomicUsize,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, fast_delay: Duration, slow_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fast_delay,
            slow_delay,
            state: <_>::default(),
            notify: Notify::new(),
            configured_workers: AtomicUsize::new(0),
            running_workers: AtomicUsize::new(0),
        })
    }

    /// A queue retrying after 20ms, then every 500ms.
    pub fn with_default_delays(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, Duration::from_millis(20), Duration::from_millis(500))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds `key` after the rate limited delay for it.
    pub fn enqueue(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            *failures += 1;
            if *failures <= MAX_FAST_ATTEMPTS {
                self.fast_delay
            } else {
                self.slow_delay
            }
        };

        self.enqueue_after(key, delay);
    }

    /// Adds `key` bypassing the rate limiter.
    pub fn enqueue_immediately(&self, key: impl Into<String>) {
        self.add(key.into());
    }

    pub fn enqueue_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = Weak::upgrade(&queue) {
                queue.add(key);
            }
        });
    }

    /// Clears the rate limiter history of `key`.
    pub fn forget(&self, key: &str) {
        self.state.lock().failures.remove(key);
    }

    /// The number of keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every configured worker is running.
    pub fn healthy(&self) -> bool {
        self.running_workers.load(Ordering::SeqCst)
            == self.configured_workers.load(Ordering::SeqCst)
    }

    fn add(&self, key: String) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }

        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            self.notify.notify_one();
        }
    }

    async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }

                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_owned());
            self.notify.notify_one();
        }
    }

    /// Stops accepting keys and wakes every idle worker so it can exit.
    pub fn shut_down(&self) {
        let mut state = self.state.lock();
        state.shutting_down = true;
        state.queue.clear();
        state.dirty.clear();
        drop(state);
        self.notify.notify_waiters();
    }

    /// Processes keys with `workers` concurrent workers until `shutdown`
    /// fires, then shuts the queue down and waits for in flight keys.
    pub async fn run<H, F>(self: Arc<Self>, workers: usize, handler: H, mut shutdown: ShutdownRx)
    where
        H: Fn(String) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = crate::Result<()>> + Send + 'static,
    {
        self.configured_workers.store(workers, Ordering::SeqCst);
        tracing::debug!(queue = %self.name, workers, "starting workers");

        let tasks: Vec<_> = (0..workers)
            .map(|_| {
                let queue = self.clone();
                let handler = handler.clone();
                tokio::spawn(async move { queue.worker(handler).await })
            })
            .collect();

        let _ = shutdown.changed().await;
        tracing::debug!(queue = %self.name, "shutting down workers");
        self.shut_down();

        for task in tasks {
            if let Err(error) = task.await {
                tracing::error!(queue = %self.name, %error, "worker failed");
            }
        }
    }

    async fn worker<H, F>(self: Arc<Self>, handler: H)
    where
        H: Fn(String) -> F,
        F: Future<Output = crate::Result<()>>,
    {
        let _running = RunningGuard::new(&self.running_workers);

        while let Some(key) = self.get().await {
            self.process(&handler, key).await;
        }
    }

    #[tracing::instrument(skip_all, fields(queue = %self.name, key = %key))]
    async fn process<H, F>(self: &Arc<Self>, handler: &H, key: String)
    where
        H: Fn(String) -> F,
        F: Future<Output = crate::Result<()>>,
    {
        let result = handler(key.clone()).await;
        crate::metrics::workqueue_processed_total(&self.name, crate::metrics::result_label(&result))
            .inc();

        match result {
            Ok(()) => self.forget(&key),
            Err(error) => {
                if crate::k8s::is_trace(&error) || crate::k8s::is_conflict(&error) {
                    tracing::trace!(%error, "retrying key");
                } else {
                    tracing::error!(%error, "failed to process key");
                }
                self.enqueue(key.clone());
            }
        }

        self.done(&key);
    }
}

/// Counts a worker as running for as long as it is alive, including when it
/// unwinds from a panic.
struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
