//! Failure-window health tracking per endpoint.
//!
//! An endpoint accumulating `failures` consecutive failures within
//! `window` enters a cooldown and is excluded from selection until the
//! cooldown elapses. A success clears the failure streak. State is keyed
//! by the endpoint key so it survives snapshot refreshes and worker
//! resets.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    time::{Duration, Instant},
};

use serde::Deserialize;

const fn default_failures() -> u32 {
    5
}

const fn default_window_ms() -> u64 {
    30_000
}

const fn default_cooldown_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct HealthConfig {
    #[serde(default = "default_failures")]
    pub failures: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failures: default_failures(),
            window_ms: default_window_ms(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Default)]
struct NodeHealth {
    recent_failures: Vec<Instant>,
    down_until: Option<Instant>,
}

pub struct HealthTable {
    nodes: RefCell<HashMap<String, NodeHealth>>,
    config: Cell<HealthConfig>,
}

impl HealthTable {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            nodes: RefCell::new(HashMap::new()),
            config: Cell::new(config),
        }
    }

    /// Update thresholds without dropping accumulated state.
    pub fn set_config(&self, config: HealthConfig) {
        self.config.set(config);
    }

    pub fn is_healthy(&self, key: &str) -> bool {
        let mut nodes = self.nodes.borrow_mut();
        let Some(node) = nodes.get_mut(key) else {
            return true;
        };
        match node.down_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // cooldown elapsed, endpoint is eligible again
                node.down_until = None;
                node.recent_failures.clear();
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self, key: &str) {
        if let Some(node) = self.nodes.borrow_mut().get_mut(key) {
            node.recent_failures.clear();
        }
    }

    pub fn record_failure(&self, key: &str) {
        let config = self.config.get();
        let now = Instant::now();
        let window = Duration::from_millis(config.window_ms);
        let mut nodes = self.nodes.borrow_mut();
        let node = nodes.entry(key.to_string()).or_default();
        node.recent_failures
            .retain(|at| now.duration_since(*at) <= window);
        node.recent_failures.push(now);
        if node.recent_failures.len() as u32 >= config.failures {
            node.down_until = Some(now + Duration::from_millis(config.cooldown_ms));
            node.recent_failures.clear();
            tracing::warn!(
                endpoint = key,
                cooldown_ms = config.cooldown_ms,
                "endpoint marked unhealthy"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(failures: u32, window_ms: u64, cooldown_ms: u64) -> HealthTable {
        HealthTable::new(HealthConfig {
            failures,
            window_ms,
            cooldown_ms,
        })
    }

    #[test]
    fn failures_within_window_trigger_cooldown() {
        let table = table(3, 1_000, 50);
        for _ in 0..2 {
            table.record_failure("a:80");
        }
        assert!(table.is_healthy("a:80"));
        table.record_failure("a:80");
        assert!(!table.is_healthy("a:80"));

        std::thread::sleep(Duration::from_millis(60));
        assert!(table.is_healthy("a:80"));
    }

    #[test]
    fn success_clears_the_streak() {
        let table = table(2, 1_000, 1_000);
        table.record_failure("a:80");
        table.record_success("a:80");
        table.record_failure("a:80");
        assert!(table.is_healthy("a:80"));
    }

    #[test]
    fn stale_failures_age_out_of_the_window() {
        let table = table(2, 10, 1_000);
        table.record_failure("a:80");
        std::thread::sleep(Duration::from_millis(20));
        table.record_failure("a:80");
        assert!(table.is_healthy("a:80"));
    }

    #[test]
    fn unknown_endpoints_are_healthy() {
        let table = table(5, 1_000, 1_000);
        assert!(table.is_healthy("never-seen:80"));
    }
}
