//! API route handlers for the gateway.
//!
//! Every `/api` route is scoped to the calling owner, taken from the
//! `x-user-id` header set by the authenticating proxy in front of us.

use axum::{
    Json,
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Timelike, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use sparkie_core::error::SparkieError;
use sparkie_scheduler::{
    ExecutorKind, NewTask, OutreachEvent, Resolution, StatusFilter, TriggerConfig, WorklogType,
};
use std::sync::Arc;

use crate::server::AppState;

pub const OWNER_HEADER: &str = "x-user-id";

/// JSON error response: `{"ok": false, "error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: format!("missing {OWNER_HEADER} header"),
        }
    }
}

impl From<SparkieError> for ApiError {
    fn from(e: SparkieError) -> Self {
        let status = match &e {
            SparkieError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            SparkieError::NotFound(_) => StatusCode::NOT_FOUND,
            SparkieError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if !e.is_client_error() {
            tracing::error!("request failed: {e}");
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"ok": false, "error": self.message}))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn owner_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// The authenticated owner of a request.
pub struct Owner(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        owner_from_headers(&parts.headers)
            .map(Owner)
            .ok_or_else(ApiError::unauthorized)
    }
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

// ---- Tasks ----

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub id: String,
    pub action: String,
    pub label: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub trigger_type: Option<String>,
    #[serde(default)]
    pub trigger_config: Option<Value>,
    #[serde(default)]
    pub scheduled_at: Option<String>,
    #[serde(default)]
    pub why_human: Option<String>,
}

impl CreateTaskBody {
    fn into_new_task(self, now: DateTime<Utc>, cron_offset_minutes: i32) -> Result<NewTask, SparkieError> {
        let executor = match self.executor.as_deref() {
            Some(e) => ExecutorKind::parse(e)?,
            None => ExecutorKind::Human,
        };
        let trigger = TriggerConfig::parse(
            self.trigger_type.as_deref().unwrap_or("manual"),
            self.trigger_config.as_ref().unwrap_or(&Value::Null),
        )?;
        let scheduled_at = match self.scheduled_at.as_deref() {
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| SparkieError::InvalidInput(format!("scheduled_at: {e}")))?
                    .with_timezone(&Utc),
            ),
            None => trigger.initial_schedule(now, cron_offset_minutes),
        };
        Ok(NewTask {
            id: self.id,
            action: self.action,
            label: self.label,
            payload: self.payload.unwrap_or_else(|| json!({})),
            executor,
            trigger,
            scheduled_at,
            why_human: self.why_human,
        })
    }
}

/// Create a task. Re-submitting an existing id is a no-op.
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Json(body): Json<CreateTaskBody>,
) -> ApiResult {
    let now = Utc::now();
    let task = body.into_new_task(now, state.cron_offset_minutes)?;
    let created = state.db.create_task(&owner, &task, now)?;
    if created {
        tracing::info!("📅 Task '{}' ({}) created for {owner}", task.label, task.id);
    }
    let stored = state.db.get_task(&owner, &task.id)?;
    Ok(Json(json!({
        "ok": true,
        "created": created,
        "task": stored.map(|t| t.to_json()),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let filter = StatusFilter::parse(query.status.as_deref().unwrap_or("all"))?;
    let tasks = state.db.list_tasks(
        &owner,
        filter,
        query.limit,
        query.offset.unwrap_or(0),
        Utc::now(),
    )?;
    let tasks: Vec<Value> = tasks.iter().map(|t| t.to_json()).collect();
    Ok(Json(json!({"ok": true, "count": tasks.len(), "tasks": tasks})))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult {
    let task = state
        .db
        .get_task(&owner, &id)?
        .ok_or_else(|| SparkieError::NotFound(format!("task '{id}'")))?;
    Ok(Json(json!({"ok": true, "task": task.to_json()})))
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub id: String,
    pub status: String,
}

/// Human decision on a task (approve / reject / reopen ...).
pub async fn resolve_task(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Json(body): Json<ResolveBody>,
) -> ApiResult {
    let resolution = Resolution::parse(&body.status)?;
    let task = state.db.resolve_task(&owner, &body.id, resolution, Utc::now())?;
    tracing::info!("Task {} resolved as {} by {owner}", task.id, task.status.as_str());
    Ok(Json(json!({"ok": true, "task": task.to_json()})))
}

// ---- Proactive outreach ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollBody {
    current_hour: Option<u32>,
}

/// Client poll. Always answers 200; anything unexpected is the empty event.
pub async fn poll_outreach(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<OutreachEvent> {
    let Some(owner) = owner_from_headers(&headers) else {
        return Json(OutreachEvent::none());
    };
    let body: PollBody = serde_json::from_slice(&body).unwrap_or_default();
    let hour = body
        .current_hour
        .filter(|h| *h < 24)
        .unwrap_or_else(|| Utc::now().hour());
    Json(state.outreach.poll(&owner, hour).await)
}

// ---- Worklog ----

#[derive(Debug, Default, Deserialize)]
pub struct WorklogQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn list_worklog(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Query(query): Query<WorklogQuery>,
) -> ApiResult {
    let entries = state
        .worklog
        .list(&owner, query.limit, query.offset.unwrap_or(0))?;
    let stats = state.worklog.stats_24h(&owner, Utc::now()).unwrap_or_else(|e| {
        tracing::warn!("worklog stats for {owner} unavailable: {e}");
        Default::default()
    });
    Ok(Json(json!({"entries": entries, "stats": stats})))
}

#[derive(Debug, Deserialize)]
pub struct AppendWorklogBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

pub async fn append_worklog(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Json(body): Json<AppendWorklogBody>,
) -> ApiResult {
    let kind = WorklogType::parse(&body.kind)?;
    let id = state.worklog.try_write_at(
        &owner,
        kind,
        &body.content,
        body.metadata.unwrap_or_else(|| json!({})),
        Utc::now(),
    )?;
    Ok(Json(json!({"id": id, "success": true})))
}

// ---- Activity ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityBody {
    message_count: Option<u32>,
}

/// Mark the owner as active; optionally record a batch of sent messages.
pub async fn record_activity(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    body: Bytes,
) -> ApiResult {
    let body: ActivityBody = serde_json::from_slice(&body).unwrap_or_default();
    let now = Utc::now();
    state.db.touch_activity(&owner, now)?;
    if let Some(count) = body.message_count.filter(|c| *c > 0) {
        state.worklog.write_message_batch(&owner, count, now)?;
    }
    Ok(Json(json!({"ok": true})))
}
