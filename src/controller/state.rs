use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::RegistryWorker;
use crate::runtime::{ContainerStatus, RuntimeWorker};
use crate::scaling::CIRCUIT_BREAKER_THRESHOLD;

/// A worker this controller launched or adopted.
#[derive(Clone, Debug, Serialize)]
pub struct ManagedWorker {
    pub created_at: DateTime<Utc>,
    pub last_seen_state: ContainerStatus,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Metrics {
    pub total_created: u64,
    pub total_destroyed: u64,
    pub current_queue_length: u64,
    pub last_scale_action: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub failed_scale_attempts: u64,
    pub circuit_breaker_active: bool,
    /// Matching workers found at startup that we took over rather than
    /// created.
    pub ignored_existing: u64,
    /// Times the minimum-floor provisioner wanted more workers than
    /// MAX_RUNNERS allowed.
    pub min_floor_capped: u64,
}

/// In-memory controller state. Single writer: the controller, under its
/// action lock; readers get short-lived snapshots.
#[derive(Clone, Debug, Serialize)]
pub struct ControllerState {
    pub workers: HashMap<String, ManagedWorker>,
    pub metrics: Metrics,
    pub last_scale_up_at: Option<DateTime<Utc>>,
    pub registry_healthy: bool,
    pub runtime_healthy: bool,
    /// False when the scope cannot report queued-run counts (org scope).
    pub queue_signal: bool,
    #[serde(skip)]
    consecutive_capacity_denials: u32,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            workers: HashMap::new(),
            metrics: Metrics::default(),
            last_scale_up_at: None,
            registry_healthy: true,
            runtime_healthy: true,
            queue_signal: true,
            consecutive_capacity_denials: 0,
        }
    }
}

impl ControllerState {
    /// Record a creation attempt denied for capacity. Five in a row latch
    /// the circuit breaker.
    pub fn note_capacity_denial(&mut self) {
        self.metrics.failed_scale_attempts += 1;
        self.consecutive_capacity_denials += 1;
        if self.consecutive_capacity_denials >= CIRCUIT_BREAKER_THRESHOLD
            && !self.metrics.circuit_breaker_active
        {
            tracing::warn!(
                "circuit breaker latched after {} capacity denials",
                self.consecutive_capacity_denials
            );
            self.metrics.circuit_breaker_active = true;
        }
    }

    /// Record a creation attempt that failed for non-capacity reasons
    /// (token fetch, container create). Counts toward the metric only.
    pub fn note_scale_failure(&mut self) {
        self.metrics.failed_scale_attempts += 1;
    }

    pub fn note_scale_success(&mut self) {
        self.consecutive_capacity_denials = 0;
    }

    /// Called with every fresh runtime count; headroom clears the breaker.
    pub fn observe_capacity(&mut self, runtime_count: u32, max_runners: u32) {
        if runtime_count < max_runners {
            if self.metrics.circuit_breaker_active {
                tracing::info!("capacity freed below MAX_RUNNERS, circuit breaker cleared");
            }
            self.metrics.circuit_breaker_active = false;
            self.consecutive_capacity_denials = 0;
        }
    }

    pub fn breaker_active(&self) -> bool {
        self.metrics.circuit_breaker_active
    }
}

/// One worker as seen from both sides. Either view may be missing:
/// runtime-only means the registration has not landed yet (or never will);
/// registry-only means the container is gone.
#[derive(Clone, Debug, Serialize)]
pub struct PairedWorker {
    pub name: String,
    pub runtime: Option<RuntimeWorker>,
    pub registry: Option<RegistryWorker>,
}

impl PairedWorker {
    pub fn busy(&self) -> bool {
        self.registry.as_ref().is_some_and(|r| r.busy)
    }

    /// Eligible for work right now: registered online, not busy, and the
    /// container is actually running.
    pub fn available(&self) -> bool {
        self.registry.as_ref().is_some_and(|r| r.available())
            && self
                .runtime
                .as_ref()
                .is_some_and(|rt| rt.container_status.is_running())
    }
}

/// Join the two views on worker name, deterministically ordered.
pub fn pair_views(runtime: &[RuntimeWorker], registry: &[RegistryWorker]) -> Vec<PairedWorker> {
    let mut joined: BTreeMap<String, PairedWorker> = BTreeMap::new();
    for rt in runtime {
        joined.insert(
            rt.worker_name.clone(),
            PairedWorker {
                name: rt.worker_name.clone(),
                runtime: Some(rt.clone()),
                registry: None,
            },
        );
    }
    for reg in registry {
        joined
            .entry(reg.name.clone())
            .and_modify(|p| p.registry = Some(reg.clone()))
            .or_insert_with(|| PairedWorker {
                name: reg.name.clone(),
                runtime: None,
                registry: Some(reg.clone()),
            });
    }
    joined.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryWorkerStatus;

    fn runtime_worker(name: &str) -> RuntimeWorker {
        RuntimeWorker {
            container_id: format!("c-{name}"),
            container_name: format!("github-runner-{name}"),
            container_status: ContainerStatus::Running,
            worker_name: name.to_string(),
            image: "github-runner:latest".into(),
            created_at: Utc::now(),
            labels: Default::default(),
        }
    }

    fn registry_worker(name: &str, busy: bool) -> RegistryWorker {
        RegistryWorker {
            id: 7,
            name: name.to_string(),
            status: RegistryWorkerStatus::Online,
            busy,
            labels: vec![],
        }
    }

    #[test]
    fn pairing_joins_on_worker_name() {
        let paired = pair_views(
            &[runtime_worker("orchestrated-a"), runtime_worker("orchestrated-b")],
            &[registry_worker("orchestrated-a", false), registry_worker("orchestrated-c", false)],
        );
        assert_eq!(paired.len(), 3);

        let a = paired.iter().find(|p| p.name == "orchestrated-a").unwrap();
        assert!(a.runtime.is_some() && a.registry.is_some());

        let b = paired.iter().find(|p| p.name == "orchestrated-b").unwrap();
        assert!(b.runtime.is_some() && b.registry.is_none());

        let c = paired.iter().find(|p| p.name == "orchestrated-c").unwrap();
        assert!(c.runtime.is_none() && c.registry.is_some());
    }

    #[test]
    fn availability_requires_both_views() {
        let paired = pair_views(&[], &[registry_worker("orchestrated-a", false)]);
        assert!(!paired[0].available());

        let paired = pair_views(
            &[runtime_worker("orchestrated-a")],
            &[registry_worker("orchestrated-a", false)],
        );
        assert!(paired[0].available());

        let paired = pair_views(
            &[runtime_worker("orchestrated-a")],
            &[registry_worker("orchestrated-a", true)],
        );
        assert!(paired[0].busy());
        assert!(!paired[0].available());
    }

    #[test]
    fn breaker_latches_after_five_consecutive_denials() {
        let mut state = ControllerState::default();
        for _ in 0..4 {
            state.note_capacity_denial();
        }
        assert!(!state.breaker_active());
        state.note_capacity_denial();
        assert!(state.breaker_active());
        assert_eq!(state.metrics.failed_scale_attempts, 5);
    }

    #[test]
    fn success_resets_the_denial_streak() {
        let mut state = ControllerState::default();
        for _ in 0..4 {
            state.note_capacity_denial();
        }
        state.note_scale_success();
        state.note_capacity_denial();
        assert!(!state.breaker_active());
    }

    #[test]
    fn headroom_clears_the_breaker() {
        let mut state = ControllerState::default();
        for _ in 0..5 {
            state.note_capacity_denial();
        }
        assert!(state.breaker_active());

        state.observe_capacity(10, 10);
        assert!(state.breaker_active());

        state.observe_capacity(9, 10);
        assert!(!state.breaker_active());
    }

    #[test]
    fn non_capacity_failures_do_not_latch_the_breaker() {
        let mut state = ControllerState::default();
        for _ in 0..10 {
            state.note_scale_failure();
        }
        assert!(!state.breaker_active());
        assert_eq!(state.metrics.failed_scale_attempts, 10);
    }
}
