// ABOUTME: Route-level tests driving the axum router against the in-memory
// store and the scripted fake runtime

use std::path::Path;
use std::sync::Arc;

use crate::docker::runtime::Runtime;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use super::{router, AppState};
use crate::auth::Auth;
use crate::crypto::CredentialSealer;
use crate::docker::fake::{ExecScript, FakeRuntime};
use crate::docker::{labels, ContainerManager, SandboxConfig};
use crate::repo::RepoCache;
use crate::session::SessionReconciler;
use crate::store::Store;
use crate::worktree::WorktreeCoordinator;

struct TestServer {
    app: Router,
    token: String,
    user_id: Uuid,
    runtime: Arc<FakeRuntime>,
    store: Store,
    origin_url: String,
    _origin: TempDir,
    _data_root: TempDir,
}

async fn run_git(args: &[&str], cwd: &Path) {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

async fn init_origin(dir: &Path) {
    run_git(&["init", "-b", "main", "."], dir).await;
    run_git(&["config", "user.email", "test@example.com"], dir).await;
    run_git(&["config", "user.name", "Test"], dir).await;
    tokio::fs::write(dir.join("README.md"), "hi\n").await.unwrap();
    run_git(&["add", "."], dir).await;
    run_git(&["commit", "-m", "initial"], dir).await;
}

async fn server() -> TestServer {
    let origin = TempDir::new().unwrap();
    init_origin(origin.path()).await;
    let data_root = TempDir::new().unwrap();

    let runtime = Arc::new(FakeRuntime::new());
    runtime.script(ExecScript::ok("for-each-ref", "main\nfeat\n"));

    let store = Store::connect_in_memory().await.unwrap();
    let auth = Auth::new("test-secret");
    let user_id = Uuid::new_v4();
    let token = auth.mint(user_id, 3600).unwrap();

    let containers = Arc::new(ContainerManager::new(
        runtime.clone(),
        SandboxConfig {
            image: "sandbox:latest".to_string(),
            memory_limit_mib: 512,
            cpu_limit: 1.0,
            data_root: data_root.path().to_path_buf(),
        },
    ));
    let worktrees = WorktreeCoordinator::new(Arc::clone(&containers));
    let repos = RepoCache::new(data_root.path().to_path_buf());
    let reconciler = Arc::new(SessionReconciler::new(
        store.clone(),
        repos.clone(),
        Arc::clone(&containers),
        worktrees,
    ));

    let state = AppState {
        store: store.clone(),
        auth,
        sealer: CredentialSealer::new("test-secret"),
        containers,
        reconciler,
        repos,
    };

    TestServer {
        app: router(state, None),
        token,
        user_id,
        runtime,
        store,
        origin_url: origin.path().to_string_lossy().to_string(),
        _origin: origin,
        _data_root: data_root,
    }
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

impl TestServer {
    async fn create_environment(&self, name: &str) -> Value {
        let (status, body) = call(
            &self.app,
            "POST",
            "/api/environments",
            Some(&self.token),
            Some(json!({
                "user_id": self.user_id,
                "name": name,
                "repository_url": self.origin_url,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "env create failed: {body}");
        body["data"].clone()
    }

    async fn create_session(&self, env_id: &str, name: &str, branch: &str) -> (StatusCode, Value) {
        call(
            &self.app,
            "POST",
            "/api/sessions",
            Some(&self.token),
            Some(json!({
                "environment_id": env_id,
                "name": name,
                "branch": branch,
            })),
        )
        .await
    }
}

#[tokio::test]
async fn health_endpoint_answers() {
    let server = server().await;
    let (status, body) = call(&server.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
}

#[tokio::test]
async fn mutating_endpoints_require_bearer_tokens() {
    let server = server().await;
    let (status, body) = call(
        &server.app,
        "POST",
        "/api/environments",
        None,
        Some(json!({ "user_id": server.user_id, "name": "dev" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], json!("Unauthenticated"));
}

#[tokio::test]
async fn environment_create_conflict_carries_suggestions() {
    let server = server().await;
    server.create_environment("dev").await;

    let (status, body) = call(
        &server.app,
        "POST",
        "/api/environments",
        Some(&server.token),
        Some(json!({ "user_id": server.user_id, "name": "dev" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], json!("NameInUse"));
    assert!(body["suggestions"].as_array().is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn environment_create_rejects_missing_image() {
    let server = server().await;
    server.runtime.set_image_present(false);

    let (status, body) = call(
        &server.app,
        "POST",
        "/api/environments",
        Some(&server.token),
        Some(json!({ "user_id": server.user_id, "name": "dev" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("ImageMissing"));
    assert!(body["details"]
        .as_str()
        .is_some_and(|d| d.contains("sandbox:latest")));
}

#[tokio::test]
async fn session_create_reconciles_to_an_active_container() {
    let server = server().await;
    let env = server.create_environment("dev").await;

    let (status, body) = server
        .create_session(env["id"].as_str().unwrap(), "feat", "feat")
        .await;
    assert_eq!(status, StatusCode::OK, "session create failed: {body}");
    let session = &body["data"];
    assert_eq!(session["status"], json!("active"));
    assert!(session["container_id"].as_str().is_some());
    assert!(session["pty_mux_name"]
        .as_str()
        .is_some_and(|n| n.starts_with("feat-")));

    // One labeled container exists in the runtime.
    assert_eq!(server.runtime.container_count(), 1);
    let container_id = session["container_id"].as_str().unwrap();
    let spec = server.runtime.spec_for(container_id).unwrap();
    assert_eq!(
        spec.labels.get(labels::SESSION).map(String::as_str),
        session["id"].as_str()
    );
}

#[tokio::test]
async fn duplicate_branch_returns_conflict_with_existing_session() {
    let server = server().await;
    let env = server.create_environment("dev").await;
    let env_id = env["id"].as_str().unwrap();

    let (status, body) = server.create_session(env_id, "feat", "feat").await;
    assert_eq!(status, StatusCode::OK);
    let first_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = server.create_session(env_id, "feat2", "feat").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], json!("BRANCH_IN_USE"));
    assert_eq!(body["existingSession"]["id"], json!(first_id));
}

#[tokio::test]
async fn session_status_probes_the_runtime() {
    let server = server().await;
    let env = server.create_environment("dev").await;
    let (_, body) = server
        .create_session(env["id"].as_str().unwrap(), "feat", "feat")
        .await;
    let session_id = body["data"]["id"].as_str().unwrap().to_string();
    let container_id = body["data"]["container_id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &server.app,
        "GET",
        &format!("/api/sessions/{session_id}/status"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_realtime"], json!(true));
    assert_eq!(body["data"]["status"], json!("active"));

    // Kill the container behind the store's back: the probe notices.
    server.runtime.kill_container(&container_id);
    let (_, body) = call(
        &server.app,
        "GET",
        &format!("/api/sessions/{session_id}/status"),
        None,
        None,
    )
    .await;
    assert_eq!(body["data"]["is_realtime"], json!(false));
}

#[tokio::test]
async fn deleting_a_session_removes_row_and_container() {
    let server = server().await;
    let env = server.create_environment("dev").await;
    let (_, body) = server
        .create_session(env["id"].as_str().unwrap(), "feat", "feat")
        .await;
    let session_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &server.app,
        "DELETE",
        &format!("/api/sessions/{session_id}"),
        Some(&server.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "delete failed: {body}");
    assert_eq!(server.runtime.container_count(), 0);

    let (status, _) = call(
        &server.app,
        "GET",
        &format!("/api/sessions/{session_id}"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_an_environment_cascades() {
    let server = server().await;
    let env = server.create_environment("dev").await;
    let env_id = env["id"].as_str().unwrap().to_string();
    server.create_session(&env_id, "one", "main").await;
    server.create_session(&env_id, "two", "feat").await;
    assert_eq!(server.runtime.container_count(), 2);

    let (status, _) = call(
        &server.app,
        "DELETE",
        &format!("/api/environments/{env_id}"),
        Some(&server.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(server.runtime.container_count(), 0);
    assert!(server
        .store
        .list_sessions_for_environment(Uuid::parse_str(&env_id).unwrap())
        .await
        .unwrap()
        .is_empty());

    // Label-filtered runtime listing is empty too.
    let leftovers = server
        .runtime
        .list_by_label(labels::SESSION, None)
        .await
        .unwrap();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn name_and_branch_availability_endpoints() {
    let server = server().await;
    let env = server.create_environment("dev").await;
    let env_id = env["id"].as_str().unwrap().to_string();
    server.create_session(&env_id, "feat", "feat").await;

    let (_, body) = call(
        &server.app,
        "GET",
        &format!("/api/sessions/check-name/{env_id}/feat"),
        None,
        None,
    )
    .await;
    assert_eq!(body["data"]["available"], json!(false));

    let (_, body) = call(
        &server.app,
        "GET",
        &format!("/api/sessions/check-branch/{env_id}/other"),
        None,
        None,
    )
    .await;
    assert_eq!(body["data"]["available"], json!(true));

    let (_, body) = call(
        &server.app,
        "GET",
        &format!("/api/environments/check-name/{}/dev", server.user_id),
        None,
        None,
    )
    .await;
    assert_eq!(body["data"]["available"], json!(false));
    assert!(body["data"]["suggestions"]
        .as_array()
        .is_some_and(|s| !s.is_empty()));
}

#[tokio::test]
async fn user_environment_listing_embeds_sessions() {
    let server = server().await;
    let env = server.create_environment("dev").await;
    server
        .create_session(env["id"].as_str().unwrap(), "feat", "feat")
        .await;

    let (status, body) = call(
        &server.app,
        "GET",
        &format!("/api/environments/user/{}", server.user_id),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let envs = body["data"]["environments"].as_array().unwrap();
    assert_eq!(envs.len(), 1);
    assert_eq!(envs[0]["sessions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn sessions_in_error_environments_are_rejected() {
    let server = server().await;
    let env = server.create_environment("dev").await;
    let env_id = Uuid::parse_str(env["id"].as_str().unwrap()).unwrap();
    server
        .store
        .set_environment_status(env_id, crate::models::EnvironmentStatus::Error)
        .await
        .unwrap();

    let (status, body) = server
        .create_session(&env_id.to_string(), "feat", "feat")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("EnvironmentError"));
    assert!(body["details"]
        .as_str()
        .is_some_and(|d| d.contains("error state")));
}

#[tokio::test]
async fn agent_credentials_are_sealed_and_never_echoed() {
    let server = server().await;
    let (status, body) = call(
        &server.app,
        "POST",
        "/api/agents",
        Some(&server.token),
        Some(json!({
            "user_id": server.user_id,
            "name": "coder",
            "type": "claude",
            "credential": "sk-secret-token",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "agent create failed: {body}");
    let agent = &body["data"];
    assert_eq!(agent["name"], json!("coder"));
    assert!(agent.get("credential").is_none());

    // The stored blob is sealed, not the plaintext.
    let agent_id = Uuid::parse_str(agent["id"].as_str().unwrap()).unwrap();
    let stored = server
        .store
        .get_agent(agent_id)
        .await
        .unwrap()
        .unwrap()
        .credential
        .unwrap();
    assert_ne!(stored, b"sk-secret-token".to_vec());

    let (status, _) = call(
        &server.app,
        "DELETE",
        &format!("/api/agents/{agent_id}"),
        Some(&server.token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(server.store.get_agent(agent_id).await.unwrap().is_none());
}

#[tokio::test]
async fn missing_environment_for_session_create_is_404() {
    let server = server().await;
    let (status, body) = server
        .create_session(&Uuid::new_v4().to_string(), "feat", "feat")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], json!("NotFound"));
}
