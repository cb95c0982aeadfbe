//! The six periodic loops. Each tick is panic-guarded and per-tick errors
//! never kill a task; the next tick retries from a fresh snapshot.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Controller;
use crate::error::AdapterError;

const MIN_MAINTAIN_INTERVAL: Duration = Duration::from_secs(60);
const RUNTIME_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(120);
const REAP_INTERVAL: Duration = Duration::from_secs(300);
const UTILIZATION_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn all periodic tasks. They stop when `shutdown` is cancelled;
/// running workers are deliberately left behind for re-adoption.
pub fn spawn_all(controller: Arc<Controller>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    let poll = controller.config().poll_interval();
    vec![
        spawn_periodic("queue-monitor", poll, shutdown.clone(), {
            let controller = controller.clone();
            move || {
                let controller = controller.clone();
                async move { controller.queue_tick().await }
            }
        }),
        spawn_periodic("min-maintainer", MIN_MAINTAIN_INTERVAL, shutdown.clone(), {
            let controller = controller.clone();
            move || {
                let controller = controller.clone();
                async move { controller.min_tick().await }
            }
        }),
        spawn_periodic("runtime-manager", RUNTIME_REFRESH_INTERVAL, shutdown.clone(), {
            let controller = controller.clone();
            move || {
                let controller = controller.clone();
                async move { controller.runtime_tick().await }
            }
        }),
        spawn_periodic("reconciler", RECONCILE_INTERVAL, shutdown.clone(), {
            let controller = controller.clone();
            move || {
                let controller = controller.clone();
                async move { controller.reconcile_tick().await }
            }
        }),
        spawn_periodic("dead-cleaner", REAP_INTERVAL, shutdown.clone(), {
            let controller = controller.clone();
            move || {
                let controller = controller.clone();
                async move { controller.reap_tick().await }
            }
        }),
        spawn_periodic("utilization-monitor", UTILIZATION_INTERVAL, shutdown, {
            let controller = controller.clone();
            move || {
                let controller = controller.clone();
                async move { controller.util_tick().await }
            }
        }),
    ]
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), AdapterError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("{name} task stopped");
                    return;
                }
                _ = interval.tick() => {}
            }
            match std::panic::AssertUnwindSafe(tick()).catch_unwind().await {
                Ok(Ok(())) => tracing::debug!("{name} tick completed"),
                Ok(Err(e)) => tracing::error!("{name} tick failed: {e}"),
                Err(_) => tracing::error!("{name} tick panicked, continuing"),
            }
        }
    })
}
