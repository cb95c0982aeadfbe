use std::sync::Arc;

use axum::{Router, routing::get};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use runner_controller::api::{self, AppState};
use runner_controller::config::Config;
use runner_controller::controller::{Controller, tasks};
use runner_controller::registry::{GithubRegistry, RegistryApi};
use runner_controller::runtime::{ContainerRuntime, DockerRuntime};

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&config);

    let registry: Arc<dyn RegistryApi> = match GithubRegistry::new(&config) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!("failed to build github client: {e}");
            std::process::exit(1);
        }
    };
    // Fail fast on bad credentials; transient registry trouble is survivable.
    if let Err(e) = registry.list_workers().await {
        if e.is_auth() {
            tracing::error!("github authentication failed: {e}");
            std::process::exit(1);
        }
        tracing::warn!("registry probe failed, continuing degraded: {e}");
    }

    let runtime: Arc<dyn ContainerRuntime> = match DockerRuntime::connect(&config) {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            tracing::error!("failed to connect to container runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.ensure_network(&config.runner_network).await {
        tracing::error!("failed to ensure runner network {}: {e}", config.runner_network);
        std::process::exit(1);
    }

    let controller = Controller::new(config.clone(), registry, runtime);

    let shutdown = CancellationToken::new();
    let task_handles = tasks::spawn_all(controller.clone(), shutdown.clone());

    let state = Arc::new(AppState { controller });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(api::status::health))
        .nest("/api/v1", api::status::router())
        .nest("/api/v1/workers", api::workers::router())
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("controller API listening on {addr}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
    {
        tracing::error!("server error: {e}");
    }

    shutdown.cancel();
    futures_util::future::join_all(task_handles).await;
    // Workers stay up on purpose; the next controller run re-adopts them.
    tracing::info!("controller stopped");
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    if config.structured_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal(token: CancellationToken) {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("shutdown signal received, stopping...");
    token.cancel();
}
