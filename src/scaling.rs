//! Scaling policy: pure functions from an observed snapshot to a decision.
//!
//! Nothing here touches an adapter or the controller state; the controller
//! feeds in a snapshot and executes whatever comes back. That keeps every
//! rule testable with plain values.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::controller::state::PairedWorker;

/// Most workers a single queue-driven decision may add.
pub const SCALE_UP_BATCH: u32 = 2;
/// Consecutive capacity denials before the circuit breaker latches.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;

const UTIL_HIGH_WATER: f64 = 0.80;
const UTIL_LOW_WATER: f64 = 0.20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleDecision {
    Up(u32),
    Down(u32),
    NoOp,
}

/// Point-in-time observation the deciders run over.
#[derive(Clone, Copy, Debug)]
pub struct PolicyInputs {
    pub queued: Option<u64>,
    pub in_progress: u64,
    pub online: u32,
    pub busy: u32,
    pub runtime_count: u32,
    pub last_scale_up_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

impl PolicyInputs {
    fn available(&self) -> u32 {
        self.online.saturating_sub(self.busy)
    }

    fn queue_total(&self) -> u64 {
        self.queued.unwrap_or(0) + self.in_progress
    }

    fn cooldown_elapsed(&self, cooldown: Duration) -> bool {
        cooldown_elapsed(self.last_scale_up_at, self.now, cooldown)
    }
}

/// True once the scale-up cooldown has run out. The controller applies this
/// to every demand-driven scale-up, whichever decider produced it.
pub fn cooldown_elapsed(
    last_scale_up_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> bool {
    match last_scale_up_at {
        None => true,
        Some(at) => now - at >= chrono::Duration::from_std(cooldown).unwrap_or_default(),
    }
}

/// Queue-driven decision: effective pressure is demand minus idle capacity.
///
/// Without a queued-count signal (org scope) this decider stands down and
/// leaves scaling to the utilization path.
pub fn decide_queue(inputs: &PolicyInputs, config: &Config) -> ScaleDecision {
    let Some(queued) = inputs.queued else {
        return ScaleDecision::NoOp;
    };
    let queue = queued + inputs.in_progress;
    let pressure = queue as i64 - inputs.available() as i64;

    if pressure >= config.scale_up_threshold as i64 {
        if !inputs.cooldown_elapsed(config.scale_up_cooldown()) {
            return ScaleDecision::NoOp;
        }
        let batch = (pressure as u64).min(SCALE_UP_BATCH as u64) as u32;
        return ScaleDecision::Up(batch);
    }
    if pressure <= config.scale_down_threshold as i64 && inputs.runtime_count > config.min_runners {
        return ScaleDecision::Down(1);
    }
    ScaleDecision::NoOp
}

/// Utilization-driven decision over busy/online ratio.
pub fn decide_util(inputs: &PolicyInputs, config: &Config) -> ScaleDecision {
    let utilization = inputs.busy as f64 / inputs.online.max(1) as f64;
    if utilization >= UTIL_HIGH_WATER && inputs.queue_total() > 0 {
        return ScaleDecision::Up(1);
    }
    if utilization <= UTIL_LOW_WATER && inputs.online > config.min_runners {
        return ScaleDecision::Down(1);
    }
    ScaleDecision::NoOp
}

/// Minimum-floor decision: provision whatever is missing below MIN_RUNNERS.
pub fn decide_min(inputs: &PolicyInputs, config: &Config) -> ScaleDecision {
    let need = config.min_runners.saturating_sub(inputs.online);
    if need == 0 {
        return ScaleDecision::NoOp;
    }
    ScaleDecision::Up(need)
}

/// Outcome of the capacity gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GatedDecision {
    pub decision: ScaleDecision,
    /// The decision wanted capacity that MAX_RUNNERS does not allow.
    pub capacity_denied: bool,
}

/// Coerce any decision that would exceed MAX_RUNNERS. A latched circuit
/// breaker silences scale-ups entirely without counting further denials.
pub fn gate(
    decision: ScaleDecision,
    runtime_count: u32,
    max_runners: u32,
    breaker_active: bool,
) -> GatedDecision {
    match decision {
        ScaleDecision::Up(n) if n > 0 => {
            if breaker_active {
                return GatedDecision {
                    decision: ScaleDecision::NoOp,
                    capacity_denied: false,
                };
            }
            let headroom = max_runners.saturating_sub(runtime_count);
            if headroom == 0 {
                GatedDecision {
                    decision: ScaleDecision::NoOp,
                    capacity_denied: true,
                }
            } else {
                GatedDecision {
                    decision: ScaleDecision::Up(n.min(headroom)),
                    capacity_denied: false,
                }
            }
        }
        ScaleDecision::Up(_) => GatedDecision {
            decision: ScaleDecision::NoOp,
            capacity_denied: false,
        },
        other => GatedDecision {
            decision: other,
            capacity_denied: false,
        },
    }
}

/// Pick the scale-down victim: online, not busy, container older than
/// `min_age`, oldest first. Busy workers are never eligible.
pub fn select_victim<'a>(
    paired: &'a [PairedWorker],
    now: DateTime<Utc>,
    min_age: Duration,
) -> Option<&'a PairedWorker> {
    paired
        .iter()
        .filter(|w| w.available())
        .filter(|w| {
            w.runtime
                .as_ref()
                .is_some_and(|rt| rt.age(now) >= min_age)
        })
        .min_by_key(|w| w.runtime.as_ref().map(|rt| rt.created_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryWorker, RegistryWorkerStatus};
    use crate::runtime::{ContainerStatus, RuntimeWorker};

    fn test_config() -> Config {
        Config {
            token: "ghp_test".into(),
            org: None,
            repo: Some("acme/widgets".into()),
            min_runners: 2,
            max_runners: 10,
            scale_up_threshold: 3,
            scale_down_threshold: 1,
            idle_timeout_secs: 300,
            poll_interval_secs: 30,
            registration_grace_secs: 120,
            scale_up_cooldown_secs: 60,
            runner_prefix: "orchestrated".into(),
            runner_name_prefix: "github-runner".into(),
            controller_id: "runner-controller".into(),
            runner_image: "github-runner:latest".into(),
            runner_network: "github-runners".into(),
            runner_labels: String::new(),
            docker_socket: None,
            port: 8080,
            log_level: "info".into(),
            structured_logging: false,
        }
    }

    fn inputs(queued: Option<u64>, in_progress: u64, online: u32, busy: u32, count: u32) -> PolicyInputs {
        PolicyInputs {
            queued,
            in_progress,
            online,
            busy,
            runtime_count: count,
            last_scale_up_at: None,
            now: Utc::now(),
        }
    }

    #[test]
    fn queue_pressure_scales_up_in_batches() {
        let config = test_config();
        // queue 5, nobody available: pressure 5, batch capped at 2
        let decision = decide_queue(&inputs(Some(4), 1, 2, 2, 2), &config);
        assert_eq!(decision, ScaleDecision::Up(2));
    }

    #[test]
    fn queue_pressure_below_threshold_is_noop() {
        let config = test_config();
        let decision = decide_queue(&inputs(Some(2), 0, 3, 3, 3), &config);
        assert_eq!(decision, ScaleDecision::NoOp);
    }

    #[test]
    fn idle_capacity_above_min_scales_down() {
        let config = test_config();
        // queue 0, 4 idle workers online: pressure -4
        let decision = decide_queue(&inputs(Some(0), 0, 4, 0, 4), &config);
        assert_eq!(decision, ScaleDecision::Down(1));
    }

    #[test]
    fn scale_down_never_goes_below_min() {
        let config = test_config();
        let decision = decide_queue(&inputs(Some(0), 0, 2, 0, 2), &config);
        assert_eq!(decision, ScaleDecision::NoOp);
    }

    #[test]
    fn cooldown_blocks_queue_scale_up() {
        let config = test_config();
        let mut i = inputs(Some(10), 0, 2, 2, 2);
        i.last_scale_up_at = Some(i.now - chrono::Duration::seconds(10));
        assert_eq!(decide_queue(&i, &config), ScaleDecision::NoOp);

        i.last_scale_up_at = Some(i.now - chrono::Duration::seconds(61));
        assert_eq!(decide_queue(&i, &config), ScaleDecision::Up(2));
    }

    #[test]
    fn missing_queue_signal_is_noop() {
        let config = test_config();
        assert_eq!(decide_queue(&inputs(None, 5, 2, 2, 2), &config), ScaleDecision::NoOp);
    }

    #[test]
    fn high_utilization_with_pending_work_scales_up() {
        let config = test_config();
        assert_eq!(decide_util(&inputs(None, 4, 5, 4, 5), &config), ScaleDecision::Up(1));
    }

    #[test]
    fn high_utilization_without_work_is_noop() {
        let config = test_config();
        assert_eq!(decide_util(&inputs(Some(0), 0, 5, 4, 5), &config), ScaleDecision::NoOp);
    }

    #[test]
    fn low_utilization_above_min_scales_down() {
        let config = test_config();
        assert_eq!(decide_util(&inputs(Some(0), 0, 5, 1, 5), &config), ScaleDecision::Down(1));
    }

    #[test]
    fn low_utilization_at_min_is_noop() {
        let config = test_config();
        assert_eq!(decide_util(&inputs(Some(0), 0, 2, 0, 2), &config), ScaleDecision::NoOp);
    }

    #[test]
    fn zero_online_does_not_divide_by_zero() {
        let config = test_config();
        assert_eq!(decide_util(&inputs(Some(3), 0, 0, 0, 0), &config), ScaleDecision::NoOp);
    }

    #[test]
    fn min_decider_fills_the_floor() {
        let config = test_config();
        assert_eq!(decide_min(&inputs(None, 0, 0, 0, 0), &config), ScaleDecision::Up(2));
        assert_eq!(decide_min(&inputs(None, 0, 1, 0, 1), &config), ScaleDecision::Up(1));
        assert_eq!(decide_min(&inputs(None, 0, 2, 0, 2), &config), ScaleDecision::NoOp);
    }

    #[test]
    fn gate_caps_batch_at_headroom() {
        let gated = gate(ScaleDecision::Up(5), 8, 10, false);
        assert_eq!(gated.decision, ScaleDecision::Up(2));
        assert!(!gated.capacity_denied);
    }

    #[test]
    fn gate_denies_at_capacity() {
        let gated = gate(ScaleDecision::Up(1), 10, 10, false);
        assert_eq!(gated.decision, ScaleDecision::NoOp);
        assert!(gated.capacity_denied);
    }

    #[test]
    fn gate_silences_scale_up_while_breaker_latched() {
        let gated = gate(ScaleDecision::Up(1), 3, 10, true);
        assert_eq!(gated.decision, ScaleDecision::NoOp);
        assert!(!gated.capacity_denied);
    }

    #[test]
    fn gate_passes_scale_down_through() {
        let gated = gate(ScaleDecision::Down(1), 10, 10, true);
        assert_eq!(gated.decision, ScaleDecision::Down(1));
        assert!(!gated.capacity_denied);
    }

    fn paired(name: &str, age_secs: i64, online: bool, busy: bool, now: DateTime<Utc>) -> PairedWorker {
        PairedWorker {
            name: name.to_string(),
            runtime: Some(RuntimeWorker {
                container_id: format!("c-{name}"),
                container_name: format!("github-runner-{name}"),
                container_status: ContainerStatus::Running,
                worker_name: name.to_string(),
                image: "github-runner:latest".into(),
                created_at: now - chrono::Duration::seconds(age_secs),
                labels: Default::default(),
            }),
            registry: Some(RegistryWorker {
                id: 1,
                name: name.to_string(),
                status: if online {
                    RegistryWorkerStatus::Online
                } else {
                    RegistryWorkerStatus::Offline
                },
                busy,
                labels: vec![],
            }),
        }
    }

    #[test]
    fn victim_is_the_oldest_idle_worker() {
        let now = Utc::now();
        let workers = vec![
            paired("orchestrated-young", 400, true, false, now),
            paired("orchestrated-old", 4000, true, false, now),
            paired("orchestrated-busy", 9000, true, true, now),
        ];
        let victim = select_victim(&workers, now, Duration::from_secs(300)).unwrap();
        assert_eq!(victim.name, "orchestrated-old");
    }

    #[test]
    fn busy_workers_are_never_victims() {
        let now = Utc::now();
        let workers = vec![paired("orchestrated-busy", 9000, true, true, now)];
        assert!(select_victim(&workers, now, Duration::ZERO).is_none());
    }

    #[test]
    fn offline_workers_are_never_victims() {
        let now = Utc::now();
        let workers = vec![paired("orchestrated-gone", 9000, false, false, now)];
        assert!(select_victim(&workers, now, Duration::ZERO).is_none());
    }

    #[test]
    fn young_workers_are_spared_until_idle_timeout() {
        let now = Utc::now();
        let workers = vec![paired("orchestrated-new", 30, true, false, now)];
        assert!(select_victim(&workers, now, Duration::from_secs(300)).is_none());
        // manual scale-down passes a zero floor
        assert!(select_victim(&workers, now, Duration::ZERO).is_some());
    }
}
