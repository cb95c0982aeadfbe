use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{
    ContainerSummary, EndpointSettings, HostConfig, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::{API_DEFAULT_VERSION, Docker};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;

use super::{
    COMPONENT_LABEL, ContainerRuntime, ContainerStatus, MANAGED_BY_LABEL, RuntimeWorker, WORKDIR,
    WORKER_NAME_LABEL, WorkerSpec,
};
use crate::config::Config;
use crate::error::AdapterError;

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
/// Covers the 30 s stop grace plus daemon overhead.
const CLIENT_TIMEOUT_SECS: u64 = 60;

/// Docker implementation of the runtime adapter.
pub struct DockerRuntime {
    docker: Docker,
    controller_id: String,
    name_prefix: String,
}

impl DockerRuntime {
    pub fn connect(config: &Config) -> Result<Self, AdapterError> {
        let socket = config.docker_socket.as_deref().unwrap_or(DEFAULT_SOCKET);
        let docker = Docker::connect_with_unix(socket, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)?;
        Ok(Self {
            docker,
            controller_id: config.controller_id.clone(),
            name_prefix: config.runner_name_prefix.clone(),
        })
    }

    fn managed_label(&self) -> String {
        format!("{MANAGED_BY_LABEL}={}", self.controller_id)
    }

    fn worker_labels(&self, worker_name: &str) -> HashMap<String, String> {
        HashMap::from([
            (MANAGED_BY_LABEL.to_string(), self.controller_id.clone()),
            (COMPONENT_LABEL.to_string(), "worker".to_string()),
            (WORKER_NAME_LABEL.to_string(), worker_name.to_string()),
        ])
    }
}

/// Stop/remove of an already-gone container is success, not failure.
fn ignore_missing(result: Result<(), bollard::errors::Error>) -> Result<(), AdapterError> {
    match result {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
            if status_code == 404 || status_code == 304 =>
        {
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn worker_from_summary(summary: ContainerSummary, name_prefix: &str) -> Option<RuntimeWorker> {
    let container_name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())?;
    if !container_name.starts_with(name_prefix) {
        return None;
    }
    let labels = summary.labels.unwrap_or_default();
    let worker_name = labels
        .get(WORKER_NAME_LABEL)
        .cloned()
        .or_else(|| {
            container_name
                .strip_prefix(name_prefix)
                .map(|rest| rest.trim_start_matches('-').to_string())
        })
        .filter(|n| !n.is_empty())?;
    Some(RuntimeWorker {
        container_id: summary.id.unwrap_or_default(),
        container_name,
        container_status: summary
            .state
            .as_deref()
            .map(ContainerStatus::from_docker)
            .unwrap_or(ContainerStatus::Unknown),
        worker_name,
        image: summary.image.unwrap_or_default(),
        created_at: DateTime::<Utc>::from_timestamp(summary.created.unwrap_or_default(), 0)
            .unwrap_or_else(Utc::now),
        labels,
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_worker(&self, spec: &WorkerSpec) -> Result<RuntimeWorker, AdapterError> {
        let container_name = format!("{}-{}", self.name_prefix, spec.name);
        let labels = self.worker_labels(&spec.name);

        let env = vec![
            format!("REPO_URL={}", spec.scope_url),
            format!("RUNNER_TOKEN={}", spec.reg_token),
            format!("RUNNER_NAME={}", spec.name),
            format!("RUNNER_LABELS={}", spec.labels.join(",")),
            format!("RUNNER_WORKDIR={WORKDIR}"),
        ];

        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels.clone()),
            // Anonymous volume for the job tree; removed with the container.
            volumes: Some(HashMap::from([(WORKDIR.to_string(), HashMap::new())])),
            host_config: Some(HostConfig {
                // The runner image hosts its own container engine.
                privileged: Some(true),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                memory: spec.memory_bytes,
                nano_cpus: spec.nano_cpus,
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    spec.network.clone(),
                    EndpointSettings::default(),
                )]),
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: &container_name,
                    platform: None,
                }),
                container_config,
            )
            .await?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;

        tracing::info!("started worker container {container_name} ({})", created.id);

        Ok(RuntimeWorker {
            container_id: created.id,
            container_name,
            container_status: ContainerStatus::Running,
            worker_name: spec.name.clone(),
            image: spec.image.clone(),
            created_at: Utc::now(),
            labels,
        })
    }

    async fn list_workers(&self) -> Result<Vec<RuntimeWorker>, AdapterError> {
        let filters = HashMap::from([("label".to_string(), vec![self.managed_label()])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| worker_from_summary(c, &self.name_prefix))
            .collect())
    }

    async fn stop_worker(&self, container_id: &str, grace: Duration) -> Result<(), AdapterError> {
        ignore_missing(
            self.docker
                .stop_container(
                    container_id,
                    Some(StopContainerOptions {
                        t: grace.as_secs() as i64,
                    }),
                )
                .await,
        )
    }

    async fn remove_worker(&self, container_id: &str, force: bool) -> Result<(), AdapterError> {
        ignore_missing(
            self.docker
                .remove_container(
                    container_id,
                    Some(RemoveContainerOptions {
                        force,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await,
        )
    }

    async fn reap_dead(&self) -> Result<u32, AdapterError> {
        let dead: Vec<RuntimeWorker> = self
            .list_workers()
            .await?
            .into_iter()
            .filter(|w| w.container_status.is_terminal())
            .collect();
        let count = dead.len() as u32;
        for worker in dead {
            tracing::info!(
                "reaping dead container {} ({:?})",
                worker.container_name,
                worker.container_status
            );
            self.remove_worker(&worker.container_id, true).await?;
        }
        Ok(count)
    }

    async fn get_logs(&self, container_id: &str, tail: u32) -> Result<String, AdapterError> {
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            out.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(out)
    }

    async fn ensure_network(&self, name: &str) -> Result<(), AdapterError> {
        let filters = HashMap::from([("name".to_string(), vec![name.to_string()])]);
        let existing = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;
        // The name filter matches substrings; check for the exact network.
        if existing
            .iter()
            .any(|n| n.name.as_deref() == Some(name))
        {
            return Ok(());
        }
        let result = self
            .docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                labels: HashMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    self.controller_id.clone(),
                )]),
                ..Default::default()
            })
            .await;
        match result {
            Ok(_) => {
                tracing::info!("created runner network {name}");
                Ok(())
            }
            // Lost a creation race; the network exists, which is all we want.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
