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
    panic,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc,
    },
};

use hyper::{Body, Response, StatusCode};

use crate::{k8s::Informers, workqueue::WorkQueue};

#[derive(Clone)]
pub struct Health {
    healthy: Arc<AtomicBool>,
    queues: Arc<[Arc<WorkQueue>]>,
    informers: Informers,
}

impl Health {
    pub fn new(queues: Vec<Arc<WorkQueue>>, informers: Informers) -> Self {
        let health = Self {
            healthy: Arc::new(AtomicBool::new(true)),
            queues: queues.into(),
            informers,
        };

        let healthy = health.healthy.clone();
        let default_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            tracing::error!(%panic_info, "panic has occurred, moving to unhealthy");
            healthy.swap(false, Relaxed);
            default_hook(panic_info);
        }));

        health
    }

    pub fn is_live(&self) -> bool {
        if !self.healthy.load(Relaxed) {
            return false;
        }

        match self.queues.iter().find(|queue| !queue.healthy()) {
            Some(queue) => {
                tracing::warn!(queue = queue.name(), "work queue is not healthy");
                false
            }
            None => true,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.informers.has_synced()
    }

    /// Returns a HTTP 200 response if no worker panicked and every queue
    /// has all of its workers running.
    pub fn check_liveness(&self) -> Response<Body> {
        status_response(self.is_live())
    }

    /// Returns a HTTP 200 response once every cache has synced.
    pub fn check_readiness(&self) -> Response<Body> {
        status_response(self.is_ready())
    }
}

fn status_response(ok: bool) -> Response<Body> {
    if ok {
        return Response::new("ok".into());
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
