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

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Registry};

pub(crate) const QUEUE_LABEL: &str = "queue";
pub(crate) const RESULT_LABEL: &str = "result";
pub(crate) const STATE_LABEL: &str = "state";

static REGISTRY: Lazy<Registry> =
    Lazy::new(|| Registry::new_custom(Some("agones".into()), None).unwrap());

/// Returns the [`Registry`] containing every metric of the crate.
#[inline]
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// The result label value of an operation.
pub(crate) fn result_label<T, E>(result: &Result<T, E>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(_) => "error",
    }
}

pub(crate) fn shutdown_initiated() -> &'static IntGauge {
    static SHUTDOWN_INITATED: Lazy<IntGauge> = Lazy::new(|| {
        prometheus::register_int_gauge_with_registry! {
            prometheus::opts! {
                "shutdown_initiated",
                "Shutdown process has been started",
            },
            registry(),
        }
        .unwrap()
    });

    &SHUTDOWN_INITATED
}

pub(crate) fn workqueue_processed_total(queue: &str, result: &str) -> IntCounter {
    static METRIC: Lazy<IntCounterVec> = Lazy::new(|| {
        prometheus::register_int_counter_vec_with_registry! {
            prometheus::opts! {
                "workqueue_processed_total",
                "Total number of keys processed by a work queue, by result.",
            },
            &[QUEUE_LABEL, RESULT_LABEL],
            registry(),
        }
        .unwrap()
    });

    METRIC.with_label_values(&[queue, result])
}

pub(crate) fn gameserver_state_transitions_total(state: &str) -> IntCounter {
    static METRIC: Lazy<IntCounterVec> = Lazy::new(|| {
        prometheus::register_int_counter_vec_with_registry! {
            prometheus::opts! {
                "gameserver_state_transitions_total",
                "Total number of game server state transitions made by the controllers, by target state.",
            },
            &[STATE_LABEL],
            registry(),
        }
        .unwrap()
    });

    METRIC.with_label_values(&[state])
}

pub(crate) fn port_allocations_total(result: &str) -> IntCounter {
    static METRIC: Lazy<IntCounterVec> = Lazy::new(|| {
        prometheus::register_int_counter_vec_with_registry! {
            prometheus::opts! {
                "port_allocations_total",
                "Total number of dynamic host port allocations, by result.",
            },
            &[RESULT_LABEL],
            registry(),
        }
        .unwrap()
    });

    METRIC.with_label_values(&[result])
}
