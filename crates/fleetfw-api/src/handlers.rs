use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use fleetfw_domain::{
    Credentials, Host, HostId, Plan, PlanId, PlanPolicy, PlanUpdateMode, UpdateArtifact,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.store.list_plans().await?;
    Ok(StatusCode::OK)
}

// ── Plans ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreatePlanBody {
    pub id: Option<String>,
    pub name: String,
    pub policy: PlanPolicy,
    pub targets: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<UpdateArtifact>,
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(body): Json<CreatePlanBody>,
) -> Result<Json<Value>, ApiError> {
    if body.targets.is_empty() {
        return Err(ApiError::unprocessable("plan has no target hosts"));
    }
    if body.policy.update_mode == PlanUpdateMode::SpecificUrl && body.artifacts.is_empty() {
        return Err(ApiError::unprocessable(
            "SPECIFIC_URL plans require at least one artifact",
        ));
    }
    let plan = Plan {
        id: PlanId::new(body.id.unwrap_or_else(|| Uuid::new_v4().to_string())),
        name: body.name,
        policy: body.policy,
        targets: body.targets.into_iter().map(HostId::new).collect(),
        artifacts: body.artifacts,
    };
    state.store.put_plan(&plan).await?;
    Ok(Json(json!({ "id": plan.id })))
}

pub async fn list_plans(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let plans = state.store.list_plans().await?;
    Ok(Json(json!(plans)))
}

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    #[serde(rename = "dryRun", default)]
    pub dry_run: bool,
}

pub async fn start_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StartQuery>,
) -> Result<Json<Value>, ApiError> {
    let plan_id = PlanId::new(id);
    let plan = state
        .store
        .get_plan(&plan_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("plan {} not found", plan_id)))?;

    if query.dry_run {
        return Ok(Json(json!({ "dryRun": true, "targets": plan.targets })));
    }

    let outcomes = state.scheduler.enqueue_plan(&plan).await?;
    let created = outcomes
        .iter()
        .filter(|o| matches!(o, fleetfw_store::EnqueueOutcome::Created(_)))
        .count();
    info!(plan_id = %plan.id, created, deduplicated = outcomes.len() - created, "plan started");
    Ok(Json(json!({ "started": true, "count": created })))
}

pub async fn plan_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let plan_id = PlanId::new(id);
    if state.store.get_plan(&plan_id).await?.is_none() {
        return Err(ApiError::not_found(format!("plan {} not found", plan_id)));
    }
    let mut runs = state.store.list_runs(Some(&plan_id)).await?;
    runs.sort_by(|a, b| a.host_id.as_str().cmp(b.host_id.as_str()));
    Ok(Json(json!(runs)))
}

// ── Host-runs ─────────────────────────────────────────────────────────────────

pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let run = state
        .store
        .get_run(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("run {} not found", id)))?;
    Ok(Json(json!(run)))
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let known = state.scheduler.cancel_host_run(id).await?;
    if !known {
        return Err(ApiError::not_found(format!("run {} not found", id)));
    }
    Ok(Json(json!({ "cancelled": true })))
}

// ── Hosts ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterHostBody {
    pub management_endpoint: String,
    pub model: Option<String>,
    pub service_tag: Option<String>,
    pub hypervisor_ref: Option<String>,
    pub host_ref: Option<String>,
}

pub async fn register_host(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RegisterHostBody>,
) -> Result<Json<Value>, ApiError> {
    if body.management_endpoint.is_empty() {
        return Err(ApiError::unprocessable("management_endpoint must not be empty"));
    }
    let host_id = HostId::new(&id);
    // The endpoint is immutable per host id.
    if let Some(existing) = state.store.get_host(&host_id).await? {
        if existing.management_endpoint != body.management_endpoint {
            return Err(ApiError::unprocessable(format!(
                "host {} already registered with endpoint {}",
                host_id, existing.management_endpoint
            )));
        }
    }
    let host = Host {
        id: host_id,
        management_endpoint: body.management_endpoint,
        model: body.model,
        service_tag: body.service_tag,
        generation: None,
        hypervisor_ref: body.hypervisor_ref,
        host_ref: body.host_ref,
    };
    state.store.put_host(&host).await?;
    Ok(Json(json!({ "id": host.id })))
}

pub async fn list_hosts(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mut hosts = state.store.list_hosts().await?;
    hosts.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
    Ok(Json(json!(hosts)))
}

#[derive(Debug, Deserialize)]
pub struct DiscoverBody {
    pub username: String,
    pub password: String,
}

/// One-off capability probe with caller-supplied credentials; nothing is
/// persisted and the password never leaves this request.
pub async fn discover_host(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DiscoverBody>,
) -> Result<Json<Value>, ApiError> {
    let host_id = HostId::new(&id);
    let host = state
        .store
        .get_host(&host_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("host {} not found", host_id)))?;
    let creds = Credentials::new(body.username, body.password);

    state.manager.invalidate(&host_id).await;
    let detection = state.manager.detect(&host, &creds).await.map_err(ApiError::from)?;
    let health = state.manager.health_check(&host, &creds).await;
    Ok(Json(json!({
        "healthiest": detection.healthiest,
        "candidates": detection.candidates,
        "capabilities": detection.capabilities,
        "health": health,
    })))
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub run_id: Option<Uuid>,
    pub limit: Option<u32>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let events = state
        .store
        .list_events(query.run_id, query.limit.unwrap_or(100))
        .await?;
    Ok(Json(json!(events)))
}
