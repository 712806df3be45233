//! Optional HTTP/SSE surface, gated behind the `http-server` feature.
//!
//! Route handlers are thin: deserialize the body, call one
//! [`Orchestrator`] method, serialize the typed result or map an
//! `OpdError` to a status code — state closed over per route, JSON in,
//! `(StatusCode, Json)` out.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseFrame, KeepAlive, Sse};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::capability::HealthStatus;
use crate::error::OpdError;
use crate::model::{CapabilityConfig, Project, ProjectCapabilityOverride, Story, StoryStatus, WorkspaceStatus};
use crate::orchestrator::{ClarificationAnswer, Orchestrator, ProjectUpdate};
use crate::sse::{Event, ReplayMode};

type JsonResponse = (StatusCode, Json<Value>);

fn ok<T: Serialize>(body: T) -> JsonResponse {
    (StatusCode::OK, Json(json!(body)))
}

fn err(e: OpdError) -> JsonResponse {
    let status = match &e {
        OpdError::Validation(_) | OpdError::Preflight(_) => StatusCode::BAD_REQUEST,
        OpdError::NotFound(_) => StatusCode::NOT_FOUND,
        OpdError::InvalidTransition { .. } => StatusCode::CONFLICT,
        OpdError::Cancellation | OpdError::Provider(_) | OpdError::Infra(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": e.to_string()})))
}

/// Build the full router, `with_state`-bound to a shared [`Orchestrator`].
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/api/projects", post(create_project).get(list_projects))
        .route("/api/projects/{id}", get(get_project).put(update_project))
        .route("/api/projects/{id}/init-workspace", post(init_workspace))
        .route("/api/projects/{id}/workspace-status", get(workspace_status))
        .route("/api/projects/verify-repo", post(verify_repo))
        .route("/api/settings/capabilities", get(list_capabilities).put(put_capability))
        .route("/api/settings/capabilities/{cap}", get(get_capability).put(put_capability_named))
        .route("/api/settings/capabilities/{cap}/test", post(test_capability))
        .route("/api/projects/{id}/capabilities", get(list_project_capabilities).put(put_project_capability))
        .route(
            "/api/projects/{id}/capabilities/{cap}",
            get(get_project_capability).put(put_project_capability_named),
        )
        .route("/api/projects/{id}/stories", post(create_story))
        .route("/api/stories/{id}", get(get_story))
        .route("/api/stories/{id}/confirm", post(confirm_stage))
        .route("/api/stories/{id}/reject", post(reject_stage))
        .route("/api/stories/{id}/rollback", post(rollback))
        .route("/api/stories/{id}/chat", post(chat))
        .route("/api/stories/{id}/answer", post(answer_clarifications))
        .route("/api/stories/{id}/docs/{filename}", put(update_doc))
        .route("/api/stories/{id}/stream", get(stream_story))
        .route("/api/stories/{id}/stop", post(stop_story))
        .route("/api/stories/{id}/iterate", post(iterate))
        .route("/api/stories/{id}/restart", post(restart))
        .route("/api/webhooks/github", post(github_webhook))
        .with_state(orchestrator)
}

// -- Projects ----------------------------------------------------------------

#[derive(Deserialize)]
struct CreateProjectBody {
    name: String,
    repo_url: String,
    description: Option<String>,
    tech_stack: Option<String>,
    architecture: Option<String>,
}

async fn create_project(State(o): State<Arc<Orchestrator>>, Json(body): Json<CreateProjectBody>) -> JsonResponse {
    let project = match o.create_project(body.name, body.repo_url).await {
        Ok(p) => p,
        Err(e) => return err(e),
    };
    if body.description.is_some() || body.tech_stack.is_some() || body.architecture.is_some() {
        let update = ProjectUpdate {
            description: body.description,
            tech_stack: body.tech_stack,
            architecture: body.architecture,
            ..Default::default()
        };
        if let Err(e) = o.update_project(project.id, update).await {
            return err(e);
        }
    }
    ok(json!({"id": project.id, "name": project.name}))
}

#[derive(Serialize)]
struct ProjectSummary {
    id: Uuid,
    name: String,
    repo_url: String,
    story_count: usize,
    workspace_status: WorkspaceStatus,
}

async fn list_projects(State(o): State<Arc<Orchestrator>>) -> JsonResponse {
    let projects = match o.list_projects().await {
        Ok(p) => p,
        Err(e) => return err(e),
    };
    let mut summaries = Vec::with_capacity(projects.len());
    for project in projects {
        let story_count = o.list_stories(project.id).await.map(|s| s.len()).unwrap_or(0);
        summaries.push(ProjectSummary {
            id: project.id,
            name: project.name,
            repo_url: project.repo_url,
            story_count,
            workspace_status: project.workspace_status,
        });
    }
    ok(summaries)
}

#[derive(Serialize)]
struct ProjectDetail {
    #[serde(flatten)]
    project: Project,
    stories: Vec<Story>,
}

async fn get_project(State(o): State<Arc<Orchestrator>>, Path(id): Path<Uuid>) -> JsonResponse {
    let project = match o.get_project(id).await {
        Ok(p) => p,
        Err(e) => return err(e),
    };
    let stories = match o.list_stories(id).await {
        Ok(s) => s,
        Err(e) => return err(e),
    };
    ok(ProjectDetail { project, stories })
}

#[derive(Deserialize, Default)]
struct UpdateProjectBody {
    name: Option<String>,
    repo_url: Option<String>,
    description: Option<String>,
    tech_stack: Option<String>,
    architecture: Option<String>,
}

async fn update_project(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateProjectBody>,
) -> JsonResponse {
    let update = ProjectUpdate {
        name: body.name,
        repo_url: body.repo_url,
        description: body.description,
        tech_stack: body.tech_stack,
        architecture: body.architecture,
    };
    match o.update_project(id, update).await {
        Ok(p) => ok(p),
        Err(e) => err(e),
    }
}

async fn init_workspace(State(o): State<Arc<Orchestrator>>, Path(id): Path<Uuid>) -> JsonResponse {
    match o.init_workspace(id).await {
        Ok(()) => ok(json!({})),
        Err(e) => err(e),
    }
}

async fn workspace_status(State(o): State<Arc<Orchestrator>>, Path(id): Path<Uuid>) -> JsonResponse {
    match o.workspace_status(id).await {
        Ok((status, error)) => ok(json!({"status": status, "error": error})),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct VerifyRepoBody {
    repo_url: String,
}

async fn verify_repo(State(o): State<Arc<Orchestrator>>, Json(body): Json<VerifyRepoBody>) -> JsonResponse {
    let health = o.verify_repo(&body.repo_url).await;
    ok(json!({"healthy": health.healthy, "message": health.message}))
}

// -- Capability settings -------------------------------------------------------

async fn list_capabilities(State(o): State<Arc<Orchestrator>>) -> JsonResponse {
    match o.list_capability_configs().await {
        Ok(configs) => ok(configs),
        Err(e) => err(e),
    }
}

async fn get_capability(State(o): State<Arc<Orchestrator>>, Path(cap): Path<String>) -> JsonResponse {
    match o.list_capability_configs().await {
        Ok(configs) => match configs.into_iter().find(|c| c.category == cap) {
            Some(config) => ok(config),
            None => err(OpdError::not_found(format!("capability [{cap}]"))),
        },
        Err(e) => err(e),
    }
}

async fn put_capability(State(o): State<Arc<Orchestrator>>, Json(config): Json<CapabilityConfig>) -> JsonResponse {
    match o.upsert_capability_config(config).await {
        Ok(()) => ok(json!({})),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct CapabilityConfigBody {
    provider: String,
    config: Option<HashMap<String, Value>>,
}

async fn put_capability_named(
    State(o): State<Arc<Orchestrator>>,
    Path(cap): Path<String>,
    Json(body): Json<CapabilityConfigBody>,
) -> JsonResponse {
    let config = CapabilityConfig { category: cap, provider: body.provider, config: body.config.unwrap_or_default() };
    match o.upsert_capability_config(config).await {
        Ok(()) => ok(json!({})),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct TestCapabilityBody {
    provider: String,
    config: Option<HashMap<String, Value>>,
}

async fn test_capability(
    State(o): State<Arc<Orchestrator>>,
    Path(cap): Path<String>,
    Json(body): Json<TestCapabilityBody>,
) -> JsonResponse {
    let health: HealthStatus = o.test_capability(&cap, &body.provider, body.config.unwrap_or_default()).await;
    ok(json!({"healthy": health.healthy, "message": health.message}))
}

async fn list_project_capabilities(State(o): State<Arc<Orchestrator>>, Path(id): Path<Uuid>) -> JsonResponse {
    match o.list_project_overrides(id).await {
        Ok(overrides) => ok(overrides),
        Err(e) => err(e),
    }
}

async fn get_project_capability(
    State(o): State<Arc<Orchestrator>>,
    Path((id, cap)): Path<(Uuid, String)>,
) -> JsonResponse {
    match o.list_project_overrides(id).await {
        Ok(overrides) => match overrides.into_iter().find(|ov| ov.category == cap) {
            Some(ov) => ok(ov),
            None => err(OpdError::not_found(format!("capability override [{cap}] for project {id}"))),
        },
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct ProjectOverrideBody {
    category: String,
    enabled: bool,
    provider_override: Option<String>,
    config_override: Option<HashMap<String, Value>>,
}

async fn put_project_capability(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ProjectOverrideBody>,
) -> JsonResponse {
    let ov = ProjectCapabilityOverride {
        project_id: id,
        category: body.category,
        enabled: body.enabled,
        provider_override: body.provider_override,
        config_override: body.config_override.unwrap_or_default(),
    };
    match o.upsert_project_override(ov).await {
        Ok(()) => ok(json!({})),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct ProjectOverrideNamedBody {
    enabled: bool,
    provider_override: Option<String>,
    config_override: Option<HashMap<String, Value>>,
}

async fn put_project_capability_named(
    State(o): State<Arc<Orchestrator>>,
    Path((id, cap)): Path<(Uuid, String)>,
    Json(body): Json<ProjectOverrideNamedBody>,
) -> JsonResponse {
    let ov = ProjectCapabilityOverride {
        project_id: id,
        category: cap,
        enabled: body.enabled,
        provider_override: body.provider_override,
        config_override: body.config_override.unwrap_or_default(),
    };
    match o.upsert_project_override(ov).await {
        Ok(()) => ok(json!({})),
        Err(e) => err(e),
    }
}

// -- Stories -------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateStoryBody {
    title: String,
    raw_input: String,
    feature_tag: Option<String>,
}

async fn create_story(
    State(o): State<Arc<Orchestrator>>,
    Path(project_id): Path<Uuid>,
    Json(body): Json<CreateStoryBody>,
) -> JsonResponse {
    match o.create_story(project_id, body.title, body.raw_input, body.feature_tag).await {
        Ok(story) => ok(json!({"id": story.id, "status": story.status})),
        Err(e) => err(e),
    }
}

async fn get_story(State(o): State<Arc<Orchestrator>>, Path(id): Path<Uuid>) -> JsonResponse {
    match o.story_detail(id).await {
        Ok(detail) => ok(json!({
            "story": detail.story,
            "round": detail.round,
            "clarifications": detail.clarifications,
            "docs": detail.docs,
            "ai_running": detail.ai_running,
        })),
        Err(e) => err(e),
    }
}

async fn confirm_stage(State(o): State<Arc<Orchestrator>>, Path(id): Path<Uuid>) -> JsonResponse {
    match o.confirm_stage(id).await {
        Ok(story) => ok(story),
        Err(e) => err(e),
    }
}

async fn reject_stage(State(o): State<Arc<Orchestrator>>, Path(id): Path<Uuid>) -> JsonResponse {
    match o.reject_stage(id).await {
        Ok(()) => ok(json!({})),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct RollbackBody {
    target_stage: StoryStatus,
}

async fn rollback(State(o): State<Arc<Orchestrator>>, Path(id): Path<Uuid>, Json(body): Json<RollbackBody>) -> JsonResponse {
    match o.rollback(id, body.target_stage).await {
        Ok(story) => ok(story),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct ChatBody {
    message: String,
}

async fn chat(State(o): State<Arc<Orchestrator>>, Path(id): Path<Uuid>, Json(body): Json<ChatBody>) -> JsonResponse {
    match o.chat(id, body.message).await {
        Ok(()) => ok(json!({"status": "processing"})),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct AnswerBody {
    answers: Vec<AnswerEntry>,
}

#[derive(Deserialize)]
struct AnswerEntry {
    id: Option<Uuid>,
    question: String,
    answer: String,
}

async fn answer_clarifications(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
    Json(body): Json<AnswerBody>,
) -> JsonResponse {
    let answers = body
        .answers
        .into_iter()
        .map(|a| ClarificationAnswer { id: a.id, question: a.question, answer: a.answer })
        .collect();
    match o.answer_clarifications(id, answers).await {
        Ok(()) => ok(json!({})),
        Err(e) => err(e),
    }
}

#[derive(Deserialize)]
struct DocBody {
    content: String,
}

async fn update_doc(
    State(o): State<Arc<Orchestrator>>,
    Path((id, filename)): Path<(Uuid, String)>,
    Json(body): Json<DocBody>,
) -> JsonResponse {
    match o.update_doc(id, &filename, body.content).await {
        Ok(()) => ok(json!({})),
        Err(e) => err(e),
    }
}

async fn stop_story(State(o): State<Arc<Orchestrator>>, Path(id): Path<Uuid>) -> JsonResponse {
    match o.stop(id).await {
        Ok(()) => ok(json!({})),
        Err(e) => err(e),
    }
}

async fn iterate(State(o): State<Arc<Orchestrator>>, Path(id): Path<Uuid>) -> JsonResponse {
    match o.iterate(id).await {
        Ok(story) => ok(story),
        Err(e) => err(e),
    }
}

async fn restart(State(o): State<Arc<Orchestrator>>, Path(id): Path<Uuid>) -> JsonResponse {
    match o.restart(id).await {
        Ok(story) => ok(story),
        Err(e) => err(e),
    }
}

// -- SSE stream ------------------------------------------------------------------

#[derive(Deserialize)]
struct StreamQuery {
    mode: Option<String>,
}

fn to_frame(event: Event) -> SseFrame {
    let event_type = match &event {
        Event::Assistant { .. } => "assistant",
        Event::Tool { .. } => "tool",
        Event::User { .. } => "user",
        Event::Workspace { .. } => "workspace",
        Event::DocUpdated { .. } => "doc_updated",
        Event::PrdUpdated { .. } => "prd_updated",
        Event::Done => "done",
        Event::Error { .. } => "error",
        Event::Info { .. } => "info",
    };
    SseFrame::default().event(event_type).data(serde_json::to_string(&event).unwrap_or_default())
}

async fn stream_story(
    State(o): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseFrame, Infallible>>>, JsonResponse> {
    let mode = match query.mode.as_deref() {
        Some("chat") => ReplayMode::Chat,
        _ => ReplayMode::Default,
    };
    let (replay, rx) = o.subscribe_stream(id, mode).await.map_err(err)?;

    let replay_stream = stream::iter(replay.into_iter().map(|e| Ok::<_, Infallible>(to_frame(e))));
    let live_stream = ReceiverStream::new(rx).map(|e| Ok::<_, Infallible>(to_frame(e)));
    let combined = replay_stream.chain(live_stream);

    let heartbeat_secs = crate::sse::HEARTBEAT_INTERVAL_SECS;
    Ok(Sse::new(combined).keep_alive(KeepAlive::new().interval(Duration::from_secs(heartbeat_secs)).text("heartbeat")))
}

// -- Webhook -----------------------------------------------------------------------

type HmacSha256 = Hmac<Sha256>;

fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else { return false };
    let Ok(expected) = hex::decode(hex_sig) else { return false };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else { return false };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

async fn github_webhook(State(o): State<Arc<Orchestrator>>, headers: HeaderMap, body: axum::body::Bytes) -> JsonResponse {
    if let Some(secret) = o.webhook_secret() {
        let signature = headers.get("X-Hub-Signature-256").and_then(|v| v.to_str().ok()).unwrap_or("");
        if !verify_signature(secret, &body, signature) {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid webhook signature"})));
        }
    }
    let event_type = headers.get("X-GitHub-Event").and_then(|v| v.to_str().ok()).unwrap_or("").to_string();
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid json body"}))),
    };
    match o.handle_github_webhook(&event_type, &payload).await {
        Ok(()) => ok(json!({})),
        Err(e) => err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_rejects_wrong_secret() {
        let body = b"{\"a\":1}";
        let mut mac = HmacSha256::new_from_slice(b"right").unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        assert!(!verify_signature("wrong", body, &sig));
    }

    #[test]
    fn signature_accepts_matching_secret() {
        let body = b"{\"a\":1}";
        let mut mac = HmacSha256::new_from_slice(b"shared").unwrap();
        mac.update(body);
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        assert!(verify_signature("shared", body, &sig));
    }

    #[test]
    fn signature_rejects_malformed_header() {
        assert!(!verify_signature("shared", b"body", "not-a-signature"));
    }
}
