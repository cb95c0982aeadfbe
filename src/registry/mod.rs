use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;

mod github;
pub use github::GithubRegistry;

/// The remote service's view of a registered worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryWorker {
    pub id: i64,
    pub name: String,
    pub status: RegistryWorkerStatus,
    pub busy: bool,
    pub labels: Vec<String>,
}

impl RegistryWorker {
    pub fn online(&self) -> bool {
        self.status == RegistryWorkerStatus::Online
    }

    /// Online and not currently executing a job.
    pub fn available(&self) -> bool {
        self.online() && !self.busy
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryWorkerStatus {
    Online,
    #[serde(other)]
    Offline,
}

/// Short-lived credential a fresh worker uses to register itself.
#[derive(Clone, Debug, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Counts of workflow units waiting or running in the configured scope.
///
/// `queued` is `None` at organization scope, where the API does not expose
/// queued-run counts; the policy then falls back to utilization scaling.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PendingWork {
    pub queued: Option<u64>,
    pub in_progress: u64,
}

/// Operations against the remote workflow service.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// All registrations in scope whose name carries the identity prefix.
    async fn list_workers(&self) -> Result<Vec<RegistryWorker>, AdapterError>;

    async fn fetch_registration_token(&self) -> Result<RegistrationToken, AdapterError>;

    /// Remove a registration. Already-gone counts as success.
    async fn delete_worker(&self, id: i64) -> Result<(), AdapterError>;

    async fn list_pending_work(&self) -> Result<PendingWork, AdapterError>;
}
