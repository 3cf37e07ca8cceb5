//! HTTP/WebSocket server - the dashboard surface
//!
//! Thin façade over the orchestrator: every route validates input, delegates,
//! and maps errors to plain `(status, message)` pairs. The WebSocket at `/`
//! greets each client with an info envelope and then streams broadcast
//! events until the client goes away.

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::orchestrator::Orchestrator;
use crate::plan::Plan;
use crate::store::{Lesson, Project, Settings};

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/health", get(health))
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/:id/start", post(start_project))
        .route("/api/projects/:id/stop", post(stop_project))
        .route("/api/projects/:id/init", post(init_project))
        .route("/api/projects/:id/generate-prd", post(generate_prd))
        .route("/api/projects/:id/update-prd", post(update_prd))
        .route("/api/projects/:id/update-settings", post(update_project_settings))
        .route("/api/lessons", get(list_lessons))
        .route("/api/lessons/:timestamp", delete(delete_lesson))
        .route("/api/settings", get(get_settings).post(replace_settings))
        .with_state(AppState { orchestrator })
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    orchestrator: Arc<Orchestrator>,
    hostname: &str,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(orchestrator);
    let addr = format!("{hostname}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Dashboard listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn list_projects(State(state): State<AppState>) -> Json<Vec<Project>> {
    Json(state.orchestrator.store().projects().await)
}

#[derive(Deserialize)]
struct CreateProjectRequest {
    name: String,
    path: Option<PathBuf>,
    prd: Option<serde_json::Value>,
}

async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<Project>, ApiError> {
    let plan = match req.prd {
        Some(value) => Some(serde_json::from_value::<Plan>(value).map_err(bad_request)?),
        None => None,
    };
    let project = state
        .orchestrator
        .create_project(&req.name, req.path, plan)
        .await
        .map_err(bad_request)?;
    Ok(Json(project))
}

async fn start_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .orchestrator
        .start_project(&id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({"ok": true})))
}

async fn stop_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .orchestrator
        .stop_project(&id)
        .await
        .map_err(bad_request)?;
    Ok(Json(json!({"ok": true})))
}

async fn init_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .orchestrator
        .init_project(&id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({"ok": true})))
}

#[derive(Deserialize)]
struct GeneratePrdRequest {
    prompt: String,
}

async fn generate_prd(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<GeneratePrdRequest>,
) -> Result<Json<Plan>, ApiError> {
    let plan = state
        .orchestrator
        .generate_plan(&id, &req.prompt)
        .await
        .map_err(internal)?;
    Ok(Json(plan))
}

#[derive(Deserialize)]
struct UpdatePrdRequest {
    prd: Plan,
}

async fn update_prd(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdatePrdRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .orchestrator
        .replace_plan(&id, req.prd)
        .await
        .map_err(internal)?;
    Ok(Json(json!({"ok": true})))
}

/// The per-project override set is closed; unknown keys are rejected.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ProjectSettingsPatch {
    use_human_review: Option<bool>,
}

#[derive(Deserialize)]
struct UpdateProjectSettingsRequest {
    updates: serde_json::Value,
}

async fn update_project_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProjectSettingsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let patch: ProjectSettingsPatch =
        serde_json::from_value(req.updates).map_err(bad_request)?;
    if let Some(value) = patch.use_human_review {
        state
            .orchestrator
            .store()
            .set_use_human_review(&id, value)
            .await
            .map_err(internal)?;
    }
    Ok(Json(json!({"ok": true})))
}

async fn list_lessons(State(state): State<AppState>) -> Json<Vec<Lesson>> {
    Json(state.orchestrator.store().lessons().await)
}

async fn delete_lesson(
    State(state): State<AppState>,
    Path(timestamp): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state
        .orchestrator
        .store()
        .delete_lesson(&timestamp)
        .await
        .map_err(internal)?;
    if !removed {
        return Err((StatusCode::NOT_FOUND, "no such lesson".to_string()));
    }
    Ok(Json(json!({"ok": true})))
}

async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.orchestrator.store().settings().await)
}

async fn replace_settings(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .orchestrator
        .store()
        .update_settings(settings)
        .await
        .map_err(internal)?;
    // New chat credentials take effect immediately.
    state.orchestrator.reinit_chat().await;
    Ok(Json(json!({"ok": true})))
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_session(state, socket))
}

async fn ws_session(state: AppState, mut socket: WebSocket) {
    let (id, mut rx) = state.orchestrator.events().subscribe();

    let greeting = json!({
        "type": "info",
        "projectId": "",
        "payload": {
            "message": "connected",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        },
    });
    if socket.send(Message::Text(greeting.to_string())).await.is_err() {
        state.orchestrator.events().unsubscribe(id);
        return;
    }

    loop {
        tokio::select! {
            envelope = rx.recv() => {
                match envelope {
                    Some(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                // Clients only listen; any close or error ends the session.
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.orchestrator.events().unsubscribe(id);
}
