//! HTTP surface tests against a real bound listener

use anyhow::Result;
use async_trait::async_trait;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use ralphd::gate::{GateReport, SyntaxGate};
use ralphd::llm::ChatBackend;
use ralphd::orchestrator::Orchestrator;
use ralphd::server;
use ralphd::store::Store;

struct NoopBackend;

#[async_trait]
impl ChatBackend for NoopBackend {
    fn name(&self) -> &str {
        "noop"
    }
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Ok(String::new())
    }
}

struct PassGate;

#[async_trait]
impl SyntaxGate for PassGate {
    async fn validate(&self, _root: &Path) -> GateReport {
        GateReport::pass()
    }
}

async fn spawn_server(tmp: &TempDir) -> SocketAddr {
    let store = Arc::new(Store::open(tmp.path().join("db.json")).await.unwrap());
    let orch = Orchestrator::new(
        store,
        Arc::new(NoopBackend),
        Arc::new(PassGate),
        tmp.path().join("Projects"),
    );

    let app = server::router(orch);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, app).into_future());
    addr
}

#[tokio::test]
async fn project_lifecycle_over_http() {
    let tmp = TempDir::new().unwrap();
    let addr = spawn_server(&tmp).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert!(health.status().is_success());

    let created = client
        .post(format!("{base}/api/projects"))
        .json(&serde_json::json!({"name": "web-demo"}))
        .send()
        .await
        .unwrap();
    assert!(created.status().is_success());
    let project: serde_json::Value = created.json().await.unwrap();
    assert_eq!(project["id"], "web-demo");
    assert_eq!(project["status"], "created");

    let listed: serde_json::Value = client
        .get(format!("{base}/api/projects"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let inited = client
        .post(format!("{base}/api/projects/web-demo/init"))
        .send()
        .await
        .unwrap();
    assert!(inited.status().is_success());
    assert!(tmp.path().join("Projects/web-demo/plans/prd.json").is_file());

    let duplicate = client
        .post(format!("{base}/api/projects"))
        .json(&serde_json::json!({"name": "web-demo"}))
        .send()
        .await
        .unwrap();
    assert!(duplicate.status().is_client_error());
}

#[tokio::test]
async fn settings_round_trip_and_closed_key_set() {
    let tmp = TempDir::new().unwrap();
    let addr = spawn_server(&tmp).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let settings: serde_json::Value = client
        .get(format!("{base}/api/settings"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(settings["codexPath"], "codex");

    let mut replacement = settings.clone();
    replacement["maxRetriesPerTask"] = serde_json::json!(7);
    let replaced = client
        .post(format!("{base}/api/settings"))
        .json(&replacement)
        .send()
        .await
        .unwrap();
    assert!(replaced.status().is_success());

    let reread: serde_json::Value = client
        .get(format!("{base}/api/settings"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reread["maxRetriesPerTask"], 7);

    // Unknown keys are rejected: the override set is closed.
    let mut bogus = reread.clone();
    bogus["definitelyNotASetting"] = serde_json::json!(true);
    let rejected = client
        .post(format!("{base}/api/settings"))
        .json(&bogus)
        .send()
        .await
        .unwrap();
    assert!(rejected.status().is_client_error());
}

#[tokio::test]
async fn lessons_endpoints_list_and_delete() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(Store::open(tmp.path().join("db.json")).await.unwrap());
    store
        .save_lesson(ralphd::store::Lesson {
            project: "p".to_string(),
            stage: "s".to_string(),
            task: "t".to_string(),
            error: "it broke".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        })
        .await
        .unwrap();

    let orch = Orchestrator::new(
        store,
        Arc::new(NoopBackend),
        Arc::new(PassGate),
        tmp.path().join("Projects"),
    );
    let app = server::router(orch);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(axum::serve(listener, app).into_future());

    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let lessons: serde_json::Value = client
        .get(format!("{base}/api/lessons"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(lessons.as_array().unwrap().len(), 1);

    let deleted = client
        .delete(format!("{base}/api/lessons/2026-01-01T00:00:00Z"))
        .send()
        .await
        .unwrap();
    assert!(deleted.status().is_success());

    let missing = client
        .delete(format!("{base}/api/lessons/2026-01-01T00:00:00Z"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);
}
