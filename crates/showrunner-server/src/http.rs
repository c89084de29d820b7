use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use showrunner_core::runtime::AgentError;
use showrunner_types::{
    ApprovalAction, ErrorClass, Event, EventMetadata, EventType, GlobalSpec,
};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/project", post(create_project).get(list_projects))
        .route("/project/{id}", get(get_project))
        .route("/project/{id}/events", get(replay_events))
        .route("/project/{id}/budget", get(budget_status))
        .route("/project/{id}/stats", get(event_statistics))
        .route("/project/{id}/approvals", get(list_approvals))
        .route("/project/{id}/cancel", post(cancel_project))
        .route("/event", post(submit_event))
        .route("/approval/{id}", get(get_approval))
        .route("/approval/{id}/decision", post(decide_approval))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let class = self.0.class();
        let status = match class {
            ErrorClass::NotFound => StatusCode::NOT_FOUND,
            ErrorClass::Validation => StatusCode::BAD_REQUEST,
            ErrorClass::Conflict => StatusCode::CONFLICT,
            ErrorClass::Budget => StatusCode::PAYMENT_REQUIRED,
            ErrorClass::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.0.to_string(),
            "class": class.as_str(),
        }));
        (status, body).into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct CreateProjectRequest {
    global_spec: GlobalSpec,
    #[serde(default)]
    budget_total: Option<f64>,
}

async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<Value>, ApiError> {
    let project_id = state
        .engine
        .create_project(req.global_spec, req.budget_total)
        .await?;
    Ok(Json(json!({ "project_id": project_id })))
}

async fn list_projects(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let projects = state.engine.list_projects().await?;
    Ok(Json(json!({ "projects": projects })))
}

async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let doc = state.engine.get_project_state(&id).await?;
    Ok(Json(serde_json::to_value(doc).map_err(|err| {
        AgentError::Fatal(format!("serialize project: {err}"))
    })?))
}

#[derive(Deserialize)]
struct SubmitEventRequest {
    project_id: String,
    event_type: EventType,
    actor: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    metadata: Option<EventMetadata>,
    #[serde(default)]
    causation_id: Option<Uuid>,
}

async fn submit_event(
    State(state): State<AppState>,
    Json(req): Json<SubmitEventRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut event = Event::new(&req.project_id, req.event_type, &req.actor);
    event.payload = req.payload.unwrap_or_else(|| Value::Object(Map::new()));
    if let Some(metadata) = req.metadata {
        event.metadata = metadata;
    }
    event.causation_id = req.causation_id;
    let event_id = state.engine.submit_event(event).await?;
    Ok(Json(json!({ "event_id": event_id })))
}

#[derive(Deserialize)]
struct ReplayQuery {
    /// Comma-separated event-type names.
    #[serde(default)]
    types: Option<String>,
    #[serde(default)]
    since: Option<DateTime<Utc>>,
    #[serde(default)]
    until: Option<DateTime<Utc>>,
}

async fn replay_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> Result<Json<Value>, ApiError> {
    let types: Option<Vec<EventType>> = match &query.types {
        Some(raw) => {
            let mut parsed = Vec::new();
            for name in raw.split(',').filter(|s| !s.is_empty()) {
                let ty = EventType::parse(name.trim()).ok_or_else(|| {
                    AgentError::Validation(format!("unknown event type `{name}`"))
                })?;
                parsed.push(ty);
            }
            Some(parsed)
        }
        None => None,
    };
    let events = state
        .engine
        .replay_events(&id, types.as_deref(), query.since, query.until)
        .await?;
    Ok(Json(json!({ "events": events })))
}

async fn budget_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state.engine.budget_status(&id).await?;
    Ok(Json(serde_json::to_value(status).map_err(|err| {
        AgentError::Fatal(format!("serialize budget: {err}"))
    })?))
}

async fn event_statistics(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let stats = state.engine.event_statistics(&id).await?;
    Ok(Json(json!({ "statistics": stats })))
}

async fn list_approvals(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let approvals = state.engine.list_approvals(&id).await?;
    Ok(Json(json!({ "approvals": approvals })))
}

async fn get_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let approval = state.engine.get_approval(&id).await?;
    Ok(Json(serde_json::to_value(approval).map_err(|err| {
        AgentError::Fatal(format!("serialize approval: {err}"))
    })?))
}

#[derive(Deserialize)]
struct DecisionRequest {
    decision: ApprovalAction,
    #[serde(default)]
    notes: Option<String>,
}

async fn decide_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DecisionRequest>,
) -> Result<Json<Value>, ApiError> {
    let approval = state
        .engine
        .decide_approval(&id, req.decision, req.notes)
        .await?;
    Ok(Json(serde_json::to_value(approval).map_err(|err| {
        AgentError::Fatal(format!("serialize approval: {err}"))
    })?))
}

async fn cancel_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.engine.cancel_project(&id).await?;
    Ok(Json(json!({ "cancelled": id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use showrunner_core::CoreConfig;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_router() -> (Router, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = CoreConfig::default();
        config.blackboard.db_path = dir.path().join("showrunner.db");
        let engine = Arc::new(showrunner_core::Engine::new(config).await.unwrap());
        (build_router(AppState::new(engine)), dir)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let (router, _dir) = test_router().await;
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn create_project_allocates_and_reports_budget() {
        let (router, _dir) = test_router().await;
        let response = router
            .clone()
            .oneshot(post_json(
                "/project",
                json!({
                    "global_spec": {
                        "title": "Rain and Warmth",
                        "duration_seconds": 30.0,
                        "quality_tier": "balanced",
                    }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let project_id = body_json(response).await["project_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .oneshot(
                Request::get(format!("/project/{project_id}/budget"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let budget = body_json(response).await;
        assert_eq!(budget["total"], json!(90.0));
        assert_eq!(budget["status"], "HEALTHY");
    }

    #[tokio::test]
    async fn unknown_project_is_404() {
        let (router, _dir) = test_router().await;
        let response = router
            .oneshot(
                Request::get("/project/PROJ-missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn event_submission_feeds_replay() {
        let (router, _dir) = test_router().await;
        let response = router
            .clone()
            .oneshot(post_json(
                "/project",
                json!({
                    "global_spec": {"title": "t", "duration_seconds": 10.0}
                }),
            ))
            .await
            .unwrap();
        let project_id = body_json(response).await["project_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .clone()
            .oneshot(post_json(
                "/event",
                json!({
                    "project_id": project_id,
                    "event_type": "IMAGE_GENERATED",
                    "actor": "image_gen",
                    "payload": {"artifact_url": "s3://a/1.png"},
                    "metadata": {"cost": {"amount": 2.5, "currency": "USD"}},
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(
                Request::get(format!(
                    "/project/{project_id}/events?types=IMAGE_GENERATED"
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        let events = body_json(response).await;
        assert_eq!(events["events"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gate_decision_round_trips() {
        let (router, _dir) = test_router().await;
        let response = router
            .clone()
            .oneshot(post_json(
                "/project",
                json!({
                    "global_spec": {"title": "t", "duration_seconds": 10.0}
                }),
            ))
            .await
            .unwrap();
        let project_id = body_json(response).await["project_id"]
            .as_str()
            .unwrap()
            .to_string();

        // A consistency failure over the cost limit parks the project.
        router
            .clone()
            .oneshot(post_json(
                "/event",
                json!({
                    "project_id": project_id,
                    "event_type": "CONSISTENCY_FAILED",
                    "actor": "consistency_guardian",
                    "payload": {"cost_impact": 25.0},
                }),
            ))
            .await
            .unwrap();

        let response = router
            .clone()
            .oneshot(
                Request::get(format!("/project/{project_id}/approvals"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let approvals = body_json(response).await;
        let approval_id = approvals["approvals"][0]["approval_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .clone()
            .oneshot(post_json(
                &format!("/approval/{approval_id}/decision"),
                json!({"decision": "approve"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "APPROVED");

        // Deciding twice is a client error.
        let response = router
            .oneshot(post_json(
                &format!("/approval/{approval_id}/decision"),
                json!({"decision": "reject"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
