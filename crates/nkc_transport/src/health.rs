//! Route-health signals consulted by transport selection.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::config::TransportKind;

/// Route-health controller. The router feeds it every attempt outcome.
pub trait RouteHealth: Send + Sync {
    fn is_healthy(&self, kind: TransportKind, device_id: &str) -> bool;
    fn record_success(&self, kind: TransportKind, device_id: &str);
    fn record_failure(&self, kind: TransportKind, device_id: &str);
}

/// Marks a route unhealthy after `threshold` consecutive failures; one
/// success clears it.
pub struct MemoryRouteHealth {
    threshold: u32,
    failures: Mutex<HashMap<(TransportKind, String), u32>>,
}

impl MemoryRouteHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn failures(&self, kind: TransportKind, device_id: &str) -> u32 {
        self.failures
            .lock()
            .get(&(kind, device_id.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

impl Default for MemoryRouteHealth {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RouteHealth for MemoryRouteHealth {
    fn is_healthy(&self, kind: TransportKind, device_id: &str) -> bool {
        self.failures(kind, device_id) < self.threshold
    }

    fn record_success(&self, kind: TransportKind, device_id: &str) {
        self.failures.lock().remove(&(kind, device_id.to_string()));
    }

    fn record_failure(&self, kind: TransportKind, device_id: &str) {
        *self
            .failures
            .lock()
            .entry((kind, device_id.to_string()))
            .or_insert(0) += 1;
    }
}
