// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backend reachability derived from the writer's recent commit attempts.
//!
//! There is no separate probe: every commit attempt (including retries) is a
//! sample in a fixed-size window, and the backend counts as reachable while the
//! success ratio of that window stays at or above the configured threshold.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_HEALTH_WINDOW: usize = 20;
pub const DEFAULT_MIN_SUCCESS_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthReport {
    pub reachable: bool,
    pub success_ratio: f64,
    pub samples: usize,
}

#[derive(Debug)]
pub struct HealthMonitor {
    window: Mutex<VecDeque<bool>>,
    capacity: usize,
    min_success_ratio: f64,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_WINDOW, DEFAULT_MIN_SUCCESS_RATIO)
    }
}

impl HealthMonitor {
    #[must_use]
    pub fn new(capacity: usize, min_success_ratio: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            min_success_ratio,
        }
    }

    pub fn record_success(&self) {
        self.push(true);
    }

    pub fn record_failure(&self) {
        self.push(false);
    }

    /// With no samples yet the backend is reported unreachable: nothing has
    /// proven it is there, not even the index initialization.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let window = self
            .window
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let samples = window.len();
        if samples == 0 {
            return HealthReport {
                reachable: false,
                success_ratio: 0.0,
                samples,
            };
        }
        let successes = window.iter().filter(|ok| **ok).count();
        #[allow(clippy::cast_precision_loss)]
        let success_ratio = successes as f64 / samples as f64;
        HealthReport {
            reachable: success_ratio >= self.min_success_ratio,
            success_ratio,
            samples,
        }
    }

    fn push(&self, outcome: bool) {
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(outcome);
    }
}
