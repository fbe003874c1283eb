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

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::apis::Health;

struct State {
    last_updated: Instant,
    failures: i32,
}

/// Tracks the pings a game server sends through `Health()`.
///
/// A check fails when no ping arrived for a whole period, and the game
/// server stays healthy until `failure_threshold` checks in a row failed.
/// Nothing is counted during the initial delay.
pub struct HealthTracker {
    disabled: bool,
    period: Duration,
    failure_threshold: i32,
    state: Mutex<State>,
}

fn seconds(value: i32) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or_default())
}

impl HealthTracker {
    pub fn new(health: &Health) -> Self {
        Self {
            disabled: health.disabled,
            period: seconds(health.period_seconds),
            failure_threshold: health.failure_threshold,
            state: Mutex::new(State {
                last_updated: Instant::now() + seconds(health.initial_delay_seconds),
                failures: 0,
            }),
        }
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    /// How often [`HealthTracker::check`] should run.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Records a ping.
    pub fn touch(&self) {
        let mut state = self.state.lock();
        state.last_updated = Instant::now();
        state.failures = 0;
    }

    /// Counts a failure when the last ping is more than a period old.
    pub fn check(&self) {
        let mut state = self.state.lock();
        if Instant::now() > state.last_updated + self.period {
            state.failures += 1;
            tracing::debug!(failures = state.failures, "health check failed");
        }
    }

    pub fn healthy(&self) -> bool {
        self.disabled || self.state.lock().failures < self.failure_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn health(disabled: bool) -> Health {
        Health {
            disabled,
            period_seconds: 5,
            failure_threshold: 2,
            initial_delay_seconds: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initial_delay_is_not_counted() {
        let tracker = HealthTracker::new(&health(false));

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(5)).await;
            tracker.check();
        }
        assert!(tracker.healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_after_threshold() {
        let tracker = HealthTracker::new(&health(false));
        tokio::time::advance(Duration::from_secs(16)).await;

        tracker.check();
        assert!(tracker.healthy());
        tracker.check();
        assert!(!tracker.healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn pings_reset_failures() {
        let tracker = HealthTracker::new(&health(false));
        tokio::time::advance(Duration::from_secs(16)).await;
        tracker.check();

        tracker.touch();
        tokio::time::advance(Duration::from_secs(4)).await;
        tracker.check();
        tracker.check();
        assert!(tracker.healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_is_always_healthy() {
        let tracker = HealthTracker::new(&health(true));
        tokio::time::advance(Duration::from_secs(60)).await;
        for _ in 0..5 {
            tracker.check();
        }
        assert!(tracker.healthy());
    }
}
