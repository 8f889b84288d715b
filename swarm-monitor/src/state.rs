//! In-memory service inventory cache and the bounded log ring backing
//! `/v1/private/stream` (spec §4.5).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Starting,
    Down,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceState {
    pub name: String,
    pub running: u32,
    pub desired: u32,
    pub preparing: u32,
    pub failed: u32,
    pub status: ServiceStatus,
    pub mode: String,
    pub nodes: Vec<String>,
    pub containers: Vec<String>,
}

impl ServiceState {
    pub fn derive_status(running: u32, desired: u32, preparing: u32) -> ServiceStatus {
        if desired == 0 {
            ServiceStatus::Unknown
        } else if running == desired {
            ServiceStatus::Healthy
        } else if running > 0 {
            ServiceStatus::Degraded
        } else if preparing > 0 {
            ServiceStatus::Starting
        } else {
            ServiceStatus::Down
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub service: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SseEvent {
    Status(ServiceState),
    Log(LogEntry),
}

const LOG_RING_CAPACITY: usize = 500;

pub struct ServiceStateCache {
    services: DashMap<String, ServiceState>,
    log_ring: Mutex<VecDeque<LogEntry>>,
}

impl ServiceStateCache {
    pub fn new() -> Self {
        Self { services: DashMap::new(), log_ring: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)) }
    }

    /// Only services prefixed `<stack>_` or `infra_` are tracked; see
    /// spec §4.5. Returns the events that should be fanned out to SSE
    /// clients: a `Status` event whenever a service is new or changed.
    pub fn reconcile(&self, stack: &str, incoming: Vec<ServiceState>) -> Vec<SseEvent> {
        let prefix = format!("{stack}_");
        let mut seen: HashSet<String> = HashSet::new();
        let mut events = Vec::new();

        for state in incoming {
            if !(state.name.starts_with(&prefix) || state.name.starts_with("infra_")) {
                continue;
            }
            seen.insert(state.name.clone());
            let changed = match self.services.get(&state.name) {
                Some(existing) => {
                    existing.running != state.running
                        || existing.desired != state.desired
                        || existing.preparing != state.preparing
                        || existing.failed != state.failed
                        || existing.status != state.status
                }
                None => true,
            };
            if changed {
                events.push(SseEvent::Status(state.clone()));
            }
            self.services.insert(state.name.clone(), state);
        }

        self.services.retain(|name, _| seen.contains(name));
        events
    }

    pub fn snapshot(&self) -> Vec<ServiceState> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<ServiceState> {
        self.services.get(name).map(|e| e.value().clone())
    }

    pub fn push_log(&self, entry: LogEntry) {
        let mut ring = self.log_ring.lock().expect("log ring mutex poisoned");
        if ring.len() == LOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(entry);
    }

    pub fn recent_logs(&self) -> Vec<LogEntry> {
        self.log_ring.lock().expect("log ring mutex poisoned").iter().cloned().collect()
    }
}

impl Default for ServiceStateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(name: &str, running: u32, desired: u32) -> ServiceState {
        ServiceState {
            name: name.to_string(),
            running,
            desired,
            preparing: 0,
            failed: 0,
            status: ServiceState::derive_status(running, desired, 0),
            mode: "replicated".to_string(),
            nodes: vec![],
            containers: vec![],
        }
    }

    #[test]
    fn derive_status_matches_the_spec_states() {
        assert_eq!(ServiceState::derive_status(2, 2, 0), ServiceStatus::Healthy);
        assert_eq!(ServiceState::derive_status(1, 2, 0), ServiceStatus::Degraded);
        assert_eq!(ServiceState::derive_status(0, 2, 1), ServiceStatus::Starting);
        assert_eq!(ServiceState::derive_status(0, 2, 0), ServiceStatus::Down);
        assert_eq!(ServiceState::derive_status(0, 0, 0), ServiceStatus::Unknown);
    }

    #[test]
    fn reconcile_filters_by_stack_prefix_and_drops_stale_services() {
        let cache = ServiceStateCache::new();
        let events = cache.reconcile("acme", vec![state("acme_core", 2, 2), state("other_thing", 1, 1)]);
        assert_eq!(events.len(), 1);
        assert_eq!(cache.snapshot().len(), 1);

        cache.reconcile("acme", vec![]);
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn log_ring_is_bounded() {
        let cache = ServiceStateCache::new();
        for i in 0..600 {
            cache.push_log(LogEntry { service: "acme_core".into(), message: format!("line {i}") });
        }
        assert_eq!(cache.recent_logs().len(), LOG_RING_CAPACITY);
        assert_eq!(cache.recent_logs().first().unwrap().message, "line 100");
    }
}
