// ABOUTME: Server entry point: logging, config, store migration, runtime
// connection, janitor spawn, HTTP serve

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use devbox_orchestrator::api::{self, AppState};
use devbox_orchestrator::auth::Auth;
use devbox_orchestrator::config::AppConfig;
use devbox_orchestrator::crypto::CredentialSealer;
use devbox_orchestrator::docker::{ContainerManager, DockerRuntime, SandboxConfig};
use devbox_orchestrator::janitor::Janitor;
use devbox_orchestrator::repo::RepoCache;
use devbox_orchestrator::session::SessionReconciler;
use devbox_orchestrator::store::Store;
use devbox_orchestrator::worktree::WorktreeCoordinator;

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let config = AppConfig::from_env().context("loading configuration")?;

    let store = Store::connect(&config.database_url)
        .await
        .context("connecting to database")?;

    let runtime = DockerRuntime::connect(config.docker_host.as_deref())
        .await
        .context("connecting to container runtime")?;

    let containers = Arc::new(ContainerManager::new(
        Arc::new(runtime),
        SandboxConfig {
            image: config.sandbox_image.clone(),
            memory_limit_mib: config.sandbox_memory_limit_mib,
            cpu_limit: config.sandbox_cpu_limit,
            data_root: config.data_root.clone(),
        },
    ));
    let worktrees = WorktreeCoordinator::new(Arc::clone(&containers));
    let repos = RepoCache::new(config.data_root.clone());
    let reconciler = Arc::new(SessionReconciler::new(
        store.clone(),
        repos.clone(),
        Arc::clone(&containers),
        worktrees,
    ));

    Janitor::new(
        store.clone(),
        Arc::clone(&containers),
        Duration::from_secs(config.janitor_interval_secs),
    )
    .spawn();

    let state = AppState {
        store,
        auth: Auth::new(&config.jwt_secret),
        sealer: CredentialSealer::new(&config.encryption_key),
        containers,
        reconciler,
        repos,
    };
    let app = api::router(state, config.cors_origin.as_deref());

    let addr = format!("0.0.0.0:{}", config.port);
    info!("orchestrator listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

fn setup_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = match std::env::var("LOG_LEVEL") {
        Ok(level) => EnvFilter::new(level),
        Err(_) => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("devbox_orchestrator=info,tower_http=info")),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .init();
}
