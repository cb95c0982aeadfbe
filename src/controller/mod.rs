use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AdapterError, AppError};
use crate::registry::{PendingWork, RegistryApi, RegistryWorker};
use crate::runtime::{ContainerRuntime, RuntimeWorker, WorkerSpec};
use crate::scaling::{self, PolicyInputs, ScaleDecision};

pub mod state;
pub mod tasks;

use state::{ControllerState, ManagedWorker, PairedWorker, pair_views};

/// Grace given to a stopping worker so its shutdown hook can deregister.
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Both views of the world at one instant, taken under the action lock.
pub struct Snapshot {
    pub runtime: Vec<RuntimeWorker>,
    pub registry: Vec<RegistryWorker>,
    pub paired: Vec<PairedWorker>,
    pub now: DateTime<Utc>,
}

impl Snapshot {
    pub fn runtime_count(&self) -> u32 {
        self.runtime.len() as u32
    }

    pub fn online(&self) -> u32 {
        self.registry.iter().filter(|r| r.online()).count() as u32
    }

    pub fn busy(&self) -> u32 {
        self.registry.iter().filter(|r| r.busy).count() as u32
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScaleSource {
    Queue,
    Util,
    Min,
    Manual,
}

impl ScaleSource {
    fn up_label(self) -> &'static str {
        match self {
            ScaleSource::Min => "provision",
            ScaleSource::Manual => "manual_scale_up",
            _ => "scale_up",
        }
    }

    fn down_label(self) -> &'static str {
        match self {
            ScaleSource::Manual => "manual_scale_down",
            _ => "scale_down",
        }
    }

    /// Floor maintenance does not count as demand-driven growth, so it
    /// leaves the scale-up cooldown untouched.
    fn sets_cooldown(self) -> bool {
        !matches!(self, ScaleSource::Min)
    }

    /// Demand-driven scale-ups honor the cooldown no matter which decider
    /// produced them. Manual triggers bypass it; floor restoration must not
    /// wait on it.
    fn respects_cooldown(self) -> bool {
        matches!(self, ScaleSource::Queue | ScaleSource::Util)
    }
}

/// Owns the state and arbitrates every scaling action.
pub struct Controller {
    config: Config,
    registry: Arc<dyn RegistryApi>,
    runtime: Arc<dyn ContainerRuntime>,
    state: RwLock<ControllerState>,
    /// Serializes snapshot -> decide -> execute -> update across the
    /// periodic tasks and the manual endpoints. Two tasks can never both
    /// decide to create workers off the same stale count.
    action: Mutex<()>,
}

impl Controller {
    pub fn new(
        config: Config,
        registry: Arc<dyn RegistryApi>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            runtime,
            state: RwLock::new(ControllerState::default()),
            action: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn observe(&self) -> Result<Snapshot, AdapterError> {
        let runtime = self.runtime.list_workers().await;
        self.state.write().await.runtime_healthy = runtime.is_ok();
        let runtime = runtime?;
        let registry = self.registry.list_workers().await;
        self.state.write().await.registry_healthy = registry.is_ok();
        let registry = registry?;
        Ok(Snapshot {
            paired: pair_views(&runtime, &registry),
            runtime,
            registry,
            now: Utc::now(),
        })
    }

    async fn pending_work(&self) -> Result<PendingWork, AdapterError> {
        let pending = self.registry.list_pending_work().await;
        if pending.is_err() {
            self.state.write().await.registry_healthy = false;
        }
        pending
    }

    async fn policy_inputs(&self, snapshot: &Snapshot, pending: Option<&PendingWork>) -> PolicyInputs {
        let last_scale_up_at = self.state.read().await.last_scale_up_at;
        PolicyInputs {
            queued: pending.and_then(|p| p.queued),
            in_progress: pending.map(|p| p.in_progress).unwrap_or(0),
            online: snapshot.online(),
            busy: snapshot.busy(),
            runtime_count: snapshot.runtime_count(),
            last_scale_up_at,
            now: snapshot.now,
        }
    }

    /// T1: poll demand and apply the queue decider.
    pub async fn queue_tick(&self) -> Result<(), AdapterError> {
        let _guard = self.action.lock().await;
        let snapshot = self.observe().await?;
        let pending = self.pending_work().await?;
        {
            let mut state = self.state.write().await;
            state.metrics.last_poll_at = Some(snapshot.now);
            state.metrics.current_queue_length =
                pending.queued.unwrap_or(0) + pending.in_progress;
            state.queue_signal = pending.queued.is_some();
            state.observe_capacity(snapshot.runtime_count(), self.config.max_runners);
        }
        let inputs = self.policy_inputs(&snapshot, Some(&pending)).await;
        let decision = scaling::decide_queue(&inputs, &self.config);
        self.execute(decision, &snapshot, ScaleSource::Queue).await;
        Ok(())
    }

    /// T2: keep the online floor at MIN_RUNNERS.
    pub async fn min_tick(&self) -> Result<(), AdapterError> {
        let _guard = self.action.lock().await;
        let snapshot = self.observe().await?;
        self.state
            .write()
            .await
            .observe_capacity(snapshot.runtime_count(), self.config.max_runners);
        let inputs = self.policy_inputs(&snapshot, None).await;
        let decision = scaling::decide_min(&inputs, &self.config);
        self.execute(decision, &snapshot, ScaleSource::Min).await;
        Ok(())
    }

    /// T3: refresh the runtime view into state, adopting matching workers
    /// we do not know and dropping the ones whose containers vanished.
    pub async fn runtime_tick(&self) -> Result<(), AdapterError> {
        let _guard = self.action.lock().await;
        let runtime = self.runtime.list_workers().await;
        self.state.write().await.runtime_healthy = runtime.is_ok();
        let runtime = runtime?;

        let mut state = self.state.write().await;
        for worker in &runtime {
            if !worker.worker_name.starts_with(&self.config.runner_prefix) {
                continue;
            }
            match state.workers.get_mut(&worker.worker_name) {
                Some(managed) => managed.last_seen_state = worker.container_status,
                None => {
                    tracing::info!("adopting existing worker {}", worker.worker_name);
                    state.workers.insert(
                        worker.worker_name.clone(),
                        ManagedWorker {
                            created_at: worker.created_at,
                            last_seen_state: worker.container_status,
                        },
                    );
                    state.metrics.ignored_existing += 1;
                }
            }
        }
        let live: HashSet<&str> = runtime.iter().map(|w| w.worker_name.as_str()).collect();
        let before = state.workers.len();
        state.workers.retain(|name, _| live.contains(name.as_str()));
        let dropped = before - state.workers.len();
        if dropped > 0 {
            tracing::info!("dropped {dropped} vanished worker(s) from state");
        }
        Ok(())
    }

    /// T4: reap orphans on both sides.
    pub async fn reconcile_tick(&self) -> Result<(), AdapterError> {
        let _guard = self.action.lock().await;
        let snapshot = self.observe().await?;
        let grace = self.config.registration_grace();
        for worker in &snapshot.paired {
            match (&worker.runtime, &worker.registry) {
                (None, Some(reg)) if !reg.online() && !reg.busy => {
                    tracing::info!("removing orphan registration {} ({})", reg.name, reg.id);
                    if let Err(e) = self.registry.delete_worker(reg.id).await {
                        tracing::warn!("failed to remove orphan registration {}: {e}", reg.name);
                    }
                }
                (Some(rt), None) if rt.age(snapshot.now) > grace => {
                    tracing::info!(
                        "tearing down container {} that never registered",
                        rt.container_name
                    );
                    if let Err(e) = self.teardown(&worker.name, &rt.container_id).await {
                        tracing::warn!("failed to tear down {}: {e}", worker.name);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// T5: remove exited and dead containers plus their volumes.
    pub async fn reap_tick(&self) -> Result<(), AdapterError> {
        let _guard = self.action.lock().await;
        let reaped = self.runtime.reap_dead().await;
        self.state.write().await.runtime_healthy = reaped.is_ok();
        let reaped = reaped?;
        if reaped > 0 {
            tracing::info!("reaped {reaped} dead container(s)");
        }
        Ok(())
    }

    /// T6: apply the utilization decider.
    pub async fn util_tick(&self) -> Result<(), AdapterError> {
        let _guard = self.action.lock().await;
        let snapshot = self.observe().await?;
        let pending = self.pending_work().await?;
        self.state
            .write()
            .await
            .observe_capacity(snapshot.runtime_count(), self.config.max_runners);
        let inputs = self.policy_inputs(&snapshot, Some(&pending)).await;
        let decision = scaling::decide_util(&inputs, &self.config);
        self.execute(decision, &snapshot, ScaleSource::Util).await;
        Ok(())
    }

    async fn execute(&self, decision: ScaleDecision, snapshot: &Snapshot, source: ScaleSource) {
        if matches!(decision, ScaleDecision::Up(n) if n > 0) && source.respects_cooldown() {
            let last_scale_up_at = self.state.read().await.last_scale_up_at;
            if !scaling::cooldown_elapsed(
                last_scale_up_at,
                snapshot.now,
                self.config.scale_up_cooldown(),
            ) {
                tracing::debug!("scale-up suppressed: cooldown in effect");
                return;
            }
        }
        let breaker = self.state.read().await.breaker_active();
        let gated = scaling::gate(
            decision,
            snapshot.runtime_count(),
            self.config.max_runners,
            breaker,
        );
        if gated.capacity_denied {
            tracing::warn!(
                "scale-up denied: already at MAX_RUNNERS ({})",
                self.config.max_runners
            );
            let mut state = self.state.write().await;
            state.note_capacity_denial();
            if source == ScaleSource::Min {
                state.metrics.min_floor_capped += 1;
            }
            return;
        }
        match gated.decision {
            ScaleDecision::Up(batch) => {
                if let ScaleDecision::Up(requested) = decision {
                    if source == ScaleSource::Min && requested > batch {
                        tracing::warn!(
                            "minimum floor capped by MAX_RUNNERS: wanted {requested}, creating {batch}"
                        );
                        self.state.write().await.metrics.min_floor_capped += 1;
                    }
                }
                self.scale_up(batch, snapshot, source).await;
            }
            ScaleDecision::Down(_) => self.scale_down(snapshot, source).await,
            ScaleDecision::NoOp => {}
        }
    }

    async fn scale_up(&self, batch: u32, snapshot: &Snapshot, source: ScaleSource) {
        let mut created = 0u32;
        let mut failures = 0u32;
        while created < batch {
            if snapshot.runtime_count() + created >= self.config.max_runners {
                self.state.write().await.note_capacity_denial();
                break;
            }
            match self.provision_one().await {
                Ok(name) => {
                    tracing::info!("provisioned worker {name}");
                    created += 1;
                    failures = 0;
                }
                Err(e) => {
                    tracing::warn!("worker provisioning failed: {e}");
                    self.state.write().await.note_scale_failure();
                    failures += 1;
                    if failures >= 2 {
                        tracing::warn!("two consecutive creation failures, aborting this tick");
                        break;
                    }
                }
            }
        }
        if created > 0 {
            let mut state = self.state.write().await;
            state.note_scale_success();
            if source.sets_cooldown() {
                state.last_scale_up_at = Some(Utc::now());
            }
            state.metrics.last_scale_action = Some(format!("{}({created})", source.up_label()));
        }
    }

    async fn provision_one(&self) -> Result<String, AdapterError> {
        let token = self.registry.fetch_registration_token().await;
        if token.is_err() {
            self.state.write().await.registry_healthy = false;
        }
        let token = token?;

        let suffix = Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", self.config.runner_prefix, &suffix[..12]);
        let spec = WorkerSpec {
            name: name.clone(),
            scope_url: self.config.scope_url(),
            reg_token: token.token,
            labels: self.config.registration_labels(),
            image: self.config.runner_image.clone(),
            network: self.config.runner_network.clone(),
            memory_bytes: None,
            nano_cpus: None,
        };
        let worker = self.runtime.create_worker(&spec).await?;

        let mut state = self.state.write().await;
        state.workers.insert(
            name.clone(),
            ManagedWorker {
                created_at: worker.created_at,
                last_seen_state: worker.container_status,
            },
        );
        state.metrics.total_created += 1;
        Ok(name)
    }

    async fn scale_down(&self, snapshot: &Snapshot, source: ScaleSource) {
        if source != ScaleSource::Manual {
            // The floor wins over any scale-down on the same snapshot.
            let inputs = self.policy_inputs(snapshot, None).await;
            if matches!(
                scaling::decide_min(&inputs, &self.config),
                ScaleDecision::Up(_)
            ) {
                tracing::debug!("skipping scale-down: below the minimum floor");
                return;
            }
        }
        let min_age = if source == ScaleSource::Manual {
            Duration::ZERO
        } else {
            self.config.idle_timeout()
        };
        let Some(victim) = scaling::select_victim(&snapshot.paired, snapshot.now, min_age) else {
            tracing::debug!("no eligible scale-down victim");
            return;
        };
        let Some(rt) = &victim.runtime else {
            return;
        };
        tracing::info!("scaling down worker {}", victim.name);
        match self.teardown(&victim.name, &rt.container_id).await {
            Ok(()) => {
                self.state.write().await.metrics.last_scale_action =
                    Some(format!("{}(1)", source.down_label()));
            }
            Err(e) => tracing::warn!("scale-down of {} failed: {e}", victim.name),
        }
    }

    /// Graceful teardown: stop (the worker's shutdown hook deregisters),
    /// sweep any leftover registration, then remove the container and its
    /// volumes.
    async fn teardown(&self, name: &str, container_id: &str) -> Result<(), AdapterError> {
        self.runtime.stop_worker(container_id, STOP_GRACE).await?;
        match self.registry.list_workers().await {
            Ok(remaining) => {
                if let Some(reg) = remaining.iter().find(|r| r.name == name) {
                    tracing::info!("worker {name} did not deregister itself, removing registration");
                    if let Err(e) = self.registry.delete_worker(reg.id).await {
                        tracing::warn!("failed to delete registration for {name}: {e}");
                    }
                }
            }
            Err(e) => tracing::warn!("could not verify deregistration of {name}: {e}"),
        }
        self.runtime.remove_worker(container_id, true).await?;
        let mut state = self.state.write().await;
        state.workers.remove(name);
        state.metrics.total_destroyed += 1;
        Ok(())
    }

    /// Manual trigger: bypasses the cooldown, still bounded by MAX_RUNNERS
    /// and the circuit breaker.
    pub async fn manual_scale_up(&self) -> Result<String, AppError> {
        let _guard = self.action.lock().await;
        let snapshot = self.observe().await?;
        {
            let mut state = self.state.write().await;
            state.observe_capacity(snapshot.runtime_count(), self.config.max_runners);
            if state.breaker_active() {
                return Err(AppError::Conflict(
                    "circuit breaker active, provisioning suspended".into(),
                ));
            }
            if snapshot.runtime_count() >= self.config.max_runners {
                state.note_capacity_denial();
                return Err(AppError::Conflict(format!(
                    "already at MAX_RUNNERS ({})",
                    self.config.max_runners
                )));
            }
        }
        match self.provision_one().await {
            Ok(name) => {
                let mut state = self.state.write().await;
                state.note_scale_success();
                state.last_scale_up_at = Some(Utc::now());
                state.metrics.last_scale_action = Some("manual_scale_up(1)".into());
                Ok(name)
            }
            Err(e) => {
                self.state.write().await.note_scale_failure();
                Err(AppError::Adapter(e))
            }
        }
    }

    /// Manual drain: ignores the idle-age floor and MIN_RUNNERS, never
    /// touches a busy worker.
    pub async fn manual_scale_down(&self) -> Result<String, AppError> {
        let _guard = self.action.lock().await;
        let snapshot = self.observe().await?;
        let victim = scaling::select_victim(&snapshot.paired, snapshot.now, Duration::ZERO)
            .ok_or_else(|| AppError::Conflict("no idle worker available for scale-down".into()))?;
        let name = victim.name.clone();
        let container_id = victim
            .runtime
            .as_ref()
            .map(|rt| rt.container_id.clone())
            .ok_or_else(|| AppError::Conflict("selected worker has no container".into()))?;
        self.teardown(&name, &container_id).await?;
        self.state.write().await.metrics.last_scale_action = Some("manual_scale_down(1)".into());
        Ok(name)
    }

    pub async fn teardown_by_name(&self, name: &str) -> Result<(), AppError> {
        let _guard = self.action.lock().await;
        let snapshot = self.observe().await?;
        let worker = snapshot
            .paired
            .iter()
            .find(|p| p.name == name)
            .ok_or(AppError::NotFound)?;
        if worker.busy() {
            return Err(AppError::Conflict(format!("worker {name} is busy")));
        }
        match (&worker.runtime, &worker.registry) {
            (Some(rt), _) => {
                self.teardown(name, &rt.container_id).await?;
            }
            (None, Some(reg)) => {
                self.registry.delete_worker(reg.id).await?;
                self.state.write().await.workers.remove(name);
            }
            (None, None) => return Err(AppError::NotFound),
        }
        Ok(())
    }

    pub async fn worker_logs(&self, name: &str, tail: u32) -> Result<String, AppError> {
        let workers = self.runtime.list_workers().await?;
        let worker = workers
            .iter()
            .find(|w| w.worker_name == name)
            .ok_or(AppError::NotFound)?;
        Ok(self.runtime.get_logs(&worker.container_id, tail).await?)
    }

    pub async fn joined_workers(&self) -> Result<Vec<PairedWorker>, AppError> {
        let snapshot = self.observe().await?;
        Ok(snapshot.paired)
    }

    /// Always responds: adapter failures degrade the report rather than
    /// failing it.
    pub async fn status_report(&self) -> StatusReport {
        let runtime = self.runtime.list_workers().await.ok();
        let registry = self.registry.list_workers().await.ok();
        {
            let mut state = self.state.write().await;
            state.runtime_healthy = runtime.is_some();
            state.registry_healthy = registry.is_some();
        }
        let state = self.state.read().await.clone();

        let running: Vec<&RuntimeWorker> = runtime
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .filter(|w| w.container_status.is_running())
            .collect();
        let registered: HashSet<&str> = registry
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        let active = running.len() as u32;
        let registered_running = running
            .iter()
            .filter(|w| registered.contains(w.worker_name.as_str()))
            .count() as u32;

        let failing = match (state.registry_healthy, state.runtime_healthy) {
            (false, false) => Some("registry,runtime".to_string()),
            (false, true) => Some("registry".to_string()),
            (true, false) => Some("runtime".to_string()),
            (true, true) => None,
        };
        StatusReport {
            active,
            registered_running,
            unregistered_running: active - registered_running,
            degraded: Degraded {
                degraded: failing.is_some(),
                failing,
                queue_signal: state.queue_signal,
            },
            state,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub state: ControllerState,
    pub active: u32,
    pub registered_running: u32,
    pub unregistered_running: u32,
    pub degraded: Degraded,
}

#[derive(Debug, Serialize)]
pub struct Degraded {
    pub degraded: bool,
    pub failing: Option<String>,
    pub queue_signal: bool,
}
