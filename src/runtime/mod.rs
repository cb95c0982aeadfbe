use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::AdapterError;

mod docker;
pub use docker::DockerRuntime;

pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const COMPONENT_LABEL: &str = "component";
pub const WORKER_NAME_LABEL: &str = "worker-name";

/// Mount point for the worker's job tree; backed by an anonymous volume.
pub const WORKDIR: &str = "/runner/work";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    pub fn from_docker(state: &str) -> Self {
        match state {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "restarting" => ContainerStatus::Restarting,
            "paused" => ContainerStatus::Paused,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }

    pub fn is_running(self) -> bool {
        self == ContainerStatus::Running
    }

    /// Terminal states eligible for reaping.
    pub fn is_terminal(self) -> bool {
        matches!(self, ContainerStatus::Exited | ContainerStatus::Dead)
    }
}

/// The container runtime's view of a worker.
#[derive(Clone, Debug, Serialize)]
pub struct RuntimeWorker {
    pub container_id: String,
    pub container_name: String,
    pub container_status: ContainerStatus,
    pub worker_name: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub labels: HashMap<String, String>,
}

impl RuntimeWorker {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Everything needed to launch one worker container.
#[derive(Clone, Debug)]
pub struct WorkerSpec {
    pub name: String,
    pub scope_url: String,
    pub reg_token: String,
    pub labels: Vec<String>,
    pub image: String,
    pub network: String,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

/// Operations against the local container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start one worker container.
    async fn create_worker(&self, spec: &WorkerSpec) -> Result<RuntimeWorker, AdapterError>;

    /// All containers carrying our `managed-by` label and name prefix,
    /// whatever state they are in.
    async fn list_workers(&self) -> Result<Vec<RuntimeWorker>, AdapterError>;

    /// SIGTERM, then SIGKILL once `grace` elapses. The worker's shutdown
    /// hook deregisters from the remote service inside the grace window.
    async fn stop_worker(&self, container_id: &str, grace: Duration) -> Result<(), AdapterError>;

    /// Remove the container and its anonymous volumes.
    async fn remove_worker(&self, container_id: &str, force: bool) -> Result<(), AdapterError>;

    /// Remove managed containers in terminal states. Returns the count.
    async fn reap_dead(&self) -> Result<u32, AdapterError>;

    async fn get_logs(&self, container_id: &str, tail: u32) -> Result<String, AdapterError>;

    /// Idempotently create the dedicated bridge network.
    async fn ensure_network(&self, name: &str) -> Result<(), AdapterError>;
}
