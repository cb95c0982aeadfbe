use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    routing::get,
};
use chrono::Utc;
use http_body_util::BodyExt;
use tower::ServiceExt;

use runner_controller::api::{self, AppState};
use runner_controller::config::Config;
use runner_controller::controller::Controller;
use runner_controller::error::AdapterError;
use runner_controller::registry::{
    PendingWork, RegistrationToken, RegistryApi, RegistryWorker, RegistryWorkerStatus,
};
use runner_controller::runtime::{ContainerRuntime, ContainerStatus, RuntimeWorker, WorkerSpec};

struct FakeRegistry {
    workers: Mutex<Vec<RegistryWorker>>,
    pending: Mutex<PendingWork>,
}

impl FakeRegistry {
    fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            pending: Mutex::new(PendingWork {
                queued: Some(0),
                in_progress: 0,
            }),
        }
    }

    fn add(&self, id: i64, name: &str, busy: bool) {
        self.workers.lock().unwrap().push(RegistryWorker {
            id,
            name: name.to_string(),
            status: RegistryWorkerStatus::Online,
            busy,
            labels: vec![],
        });
    }
}

#[async_trait]
impl RegistryApi for FakeRegistry {
    async fn list_workers(&self) -> Result<Vec<RegistryWorker>, AdapterError> {
        Ok(self.workers.lock().unwrap().clone())
    }

    async fn fetch_registration_token(&self) -> Result<RegistrationToken, AdapterError> {
        Ok(RegistrationToken {
            token: "AAATOKEN".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn delete_worker(&self, _id: i64) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn list_pending_work(&self) -> Result<PendingWork, AdapterError> {
        Ok(*self.pending.lock().unwrap())
    }
}

struct FakeRuntime {
    containers: Mutex<Vec<RuntimeWorker>>,
    unreachable: AtomicBool,
}

impl FakeRuntime {
    fn new() -> Self {
        Self {
            containers: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
        }
    }

    fn add(&self, name: &str, status: ContainerStatus) {
        let n = self.containers.lock().unwrap().len() + 1;
        self.containers.lock().unwrap().push(RuntimeWorker {
            container_id: format!("c{n}"),
            container_name: format!("github-runner-{name}"),
            container_status: status,
            worker_name: name.to_string(),
            image: "github-runner:latest".into(),
            created_at: Utc::now(),
            labels: HashMap::new(),
        });
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_worker(&self, spec: &WorkerSpec) -> Result<RuntimeWorker, AdapterError> {
        let worker = RuntimeWorker {
            container_id: format!("c{}", self.containers.lock().unwrap().len() + 1),
            container_name: format!("github-runner-{}", spec.name),
            container_status: ContainerStatus::Running,
            worker_name: spec.name.clone(),
            image: spec.image.clone(),
            created_at: Utc::now(),
            labels: HashMap::new(),
        };
        self.containers.lock().unwrap().push(worker.clone());
        Ok(worker)
    }

    async fn list_workers(&self) -> Result<Vec<RuntimeWorker>, AdapterError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AdapterError::Transient("docker socket gone".into()));
        }
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn stop_worker(&self, _container_id: &str, _grace: Duration) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn remove_worker(&self, _container_id: &str, _force: bool) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn reap_dead(&self) -> Result<u32, AdapterError> {
        Ok(0)
    }

    async fn get_logs(&self, _container_id: &str, _tail: u32) -> Result<String, AdapterError> {
        Ok(String::new())
    }

    async fn ensure_network(&self, _name: &str) -> Result<(), AdapterError> {
        Ok(())
    }
}

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
        port: 0,
        log_level: "info".into(),
        structured_logging: false,
    }
}

fn test_state(
    registry: Arc<FakeRegistry>,
    runtime: Arc<FakeRuntime>,
) -> Arc<AppState> {
    let controller = Controller::new(test_config(), registry, runtime);
    Arc::new(AppState { controller })
}

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::status::health))
        .nest("/api/v1", api::status::router())
        .nest("/api/v1/workers", api::workers::router())
        .with_state(state)
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_reports_running() {
    let state = test_state(Arc::new(FakeRegistry::new()), Arc::new(FakeRuntime::new()));

    let response = app(state).oneshot(get_req("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["running"], true);
}

#[tokio::test]
async fn status_reports_counters_and_derived_counts() {
    let registry = Arc::new(FakeRegistry::new());
    let runtime = Arc::new(FakeRuntime::new());
    registry.add(1, "orchestrated-a", false);
    runtime.add("orchestrated-a", ContainerStatus::Running);
    runtime.add("orchestrated-pending", ContainerStatus::Running);
    let state = test_state(registry, runtime);

    let response = app(state).oneshot(get_req("/api/v1/status")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["active"], 2);
    assert_eq!(body["registered_running"], 1);
    assert_eq!(body["unregistered_running"], 1);
    assert_eq!(body["metrics"]["total_created"], 0);
    assert_eq!(body["degraded"]["degraded"], false);
    assert_eq!(body["degraded"]["queue_signal"], true);
}

#[tokio::test]
async fn status_degrades_when_the_runtime_is_unreachable() {
    let registry = Arc::new(FakeRegistry::new());
    let runtime = Arc::new(FakeRuntime::new());
    runtime.unreachable.store(true, Ordering::SeqCst);
    let state = test_state(registry, runtime);

    let response = app(state).oneshot(get_req("/api/v1/status")).await.unwrap();

    // degraded, but still answering
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["degraded"]["degraded"], true);
    assert_eq!(body["degraded"]["failing"], "runtime");
}

#[tokio::test]
async fn status_surfaces_a_missing_queue_signal() {
    let registry = Arc::new(FakeRegistry::new());
    let runtime = Arc::new(FakeRuntime::new());
    *registry.pending.lock().unwrap() = PendingWork {
        queued: None,
        in_progress: 2,
    };
    let state = test_state(registry, runtime);

    // one poll so the controller learns the scope has no queued counts
    state.controller.queue_tick().await.unwrap();

    let response = app(state).oneshot(get_req("/api/v1/status")).await.unwrap();
    let body = json_body(response).await;
    assert_eq!(body["degraded"]["queue_signal"], false);
    assert_eq!(body["metrics"]["current_queue_length"], 2);
}

#[tokio::test]
async fn metrics_render_the_scrape_format() {
    let registry = Arc::new(FakeRegistry::new());
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add("orchestrated-a", ContainerStatus::Running);
    let state = test_state(registry, runtime);

    let response = app(state).oneshot(get_req("/api/v1/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("# TYPE runner_controller_workers_created_total counter"));
    assert!(text.contains("runner_controller_active_workers 1"));
    assert!(text.contains("runner_controller_circuit_breaker_active 0"));
}
