use std::collections::BTreeMap;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use skiff_domain::Secret;
use skiff_driver::{
    managed_filter, ContainerDriver, ContainerSummary, LABEL_APP_ID, LABEL_SERVICE_ID,
};
use skiff_http::{CloudClient, CloudClientConfig};
use skiff_provision::ProvisionRequest;
use skiff_store::DeviceStore;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

// ── Health / status ───────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let identity = state.store.load_identity().await?;
    let target = state.reconciler.get_target();
    let current = state.reconciler.current_state().await?;

    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    for app in current.apps.values() {
        for svc in &app.services {
            *by_status.entry(svc.status.to_string()).or_default() += 1;
        }
    }

    Ok(Json(json!({
        "device": identity.as_ref().map(|id| json!({
            "uuid": id.uuid,
            "device_id": id.device_id,
            "device_name": id.device_name,
            "device_type": id.device_type,
            "provisioned": id.provisioned,
            "registered_at": id.registered_at,
        })),
        "connection": state.monitor.health(),
        "consecutive_failures": state.monitor.consecutive_failures(),
        "target": target.map(|t| json!({
            "version": t.version,
            "hash": t.hash,
            "services": t.target.service_count(),
        })),
        "services_by_status": by_status,
        "reconciliation_paused": state.reconciler.is_reconciliation_paused(),
    })))
}

/// Self-tests over every subsystem; `pass` is the conjunction.
pub async fn diagnostics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let store_check = state.store.load_identity().await.map(|_| ());
    let driver_check = state.driver.list_containers(&managed_filter()).await;
    let adapters = state.supervisor.health_snapshot();

    let store_ok = store_check.is_ok();
    let driver_ok = driver_check.is_ok();
    let pass = store_ok && driver_ok;

    Ok(Json(json!({
        "pass": pass,
        "checked_at": Utc::now(),
        "store": {
            "ok": store_ok,
            "error": store_check.err().map(|e| e.to_string()),
        },
        "container_runtime": {
            "ok": driver_ok,
            "driver": state.driver.name(),
            "containers": driver_check.as_ref().map(|c| c.len()).unwrap_or(0),
            "error": driver_check.err().map(|e| e.to_string()),
        },
        "connection": {
            "health": state.monitor.health(),
            "consecutive_failures": state.monitor.consecutive_failures(),
        },
        "adapters": adapters,
        "reconciler": {
            "paused": state.reconciler.is_reconciliation_paused(),
            "target_version": state.reconciler.get_target().map(|t| t.version),
        },
    })))
}

// ── Services ──────────────────────────────────────────────────────────────────

pub async fn list_services(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let current = state.reconciler.current_state().await?;
    let services: Vec<Value> = current
        .apps
        .values()
        .flat_map(|app| {
            app.services.iter().map(|svc| {
                json!({
                    "app_id": app.app_id,
                    "app_name": app.app_name,
                    "service_id": svc.service_id,
                    "service_name": svc.service_name,
                    "image_name": svc.image_name,
                    "desired_state": svc.desired_state,
                    "status": svc.status,
                    "container_id": svc.container_id,
                })
            })
        })
        .collect();
    Ok(Json(json!(services)))
}

async fn find_service_container(
    state: &AppState,
    service_id: &str,
) -> Result<ContainerSummary, ApiError> {
    let mut filter = managed_filter();
    filter.push((LABEL_SERVICE_ID.to_string(), service_id.to_string()));
    state
        .driver
        .list_containers(&filter)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::not_found(format!("no container for service '{service_id}'")))
}

async fn apply_container_action(
    state: &AppState,
    container_id: &str,
    action: &str,
) -> Result<(), ApiError> {
    let grace = Duration::from_secs(10);
    match action {
        "start" => state.driver.start(container_id).await?,
        "stop" => state.driver.stop(container_id, grace).await?,
        "restart" => {
            state.driver.stop(container_id, grace).await?;
            state.driver.start(container_id).await?;
        }
        "pause" => state.driver.pause(container_id).await?,
        "unpause" => state.driver.unpause(container_id).await?,
        other => return Err(ApiError::bad_request(format!("unknown action '{other}'"))),
    }
    Ok(())
}

pub async fn service_action(
    State(state): State<AppState>,
    Path((service_id, action)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let container = find_service_container(&state, &service_id).await?;
    apply_container_action(&state, &container.id, &action).await?;
    info!(service_id = %service_id, action = %action, "local service action");
    Ok(Json(json!({
        "service_id": service_id,
        "action": action,
        "container_id": container.id,
    })))
}

pub async fn app_action(
    State(state): State<AppState>,
    Path((app_id, action)): Path<(u32, String)>,
) -> Result<Json<Value>, ApiError> {
    if !matches!(action.as_str(), "start" | "stop" | "restart") {
        return Err(ApiError::bad_request(format!("unknown action '{action}'")));
    }
    let mut filter = managed_filter();
    filter.push((LABEL_APP_ID.to_string(), app_id.to_string()));
    let containers = state.driver.list_containers(&filter).await?;
    if containers.is_empty() {
        return Err(ApiError::not_found(format!("no containers for app {app_id}")));
    }
    let mut acted = Vec::new();
    for container in &containers {
        apply_container_action(&state, &container.id, &action).await?;
        acted.push(container.id.clone());
    }
    info!(app_id, action = %action, containers = acted.len(), "local app action");
    Ok(Json(json!({ "app_id": app_id, "action": action, "containers": acted })))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub follow: bool,
    pub tail: Option<usize>,
}

pub async fn service_logs(
    State(state): State<AppState>,
    Path(service_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let container = find_service_container(&state, &service_id).await?;

    if !query.follow {
        let lines = state
            .driver
            .container_logs(&container.id, query.tail)
            .await?;
        return Ok(Json(json!({ "service_id": service_id, "lines": lines })).into_response());
    }

    // follow: send the tail, then poll for new lines until the client hangs up
    let all = state.driver.container_logs(&container.id, None).await?;
    let start = query
        .tail
        .map(|n| all.len().saturating_sub(n))
        .unwrap_or(0);
    let first_chunk: String = all[start..].iter().map(|l| format!("{l}\n")).collect();
    let seen = all.len();

    let driver = state.driver.clone();
    let container_id = container.id.clone();
    let follow_stream = stream::unfold(
        (driver, container_id, seen),
        |(driver, container_id, mut seen)| async move {
            loop {
                match driver.container_logs(&container_id, None).await {
                    Ok(lines) if lines.len() > seen => {
                        let chunk: String =
                            lines[seen..].iter().map(|l| format!("{l}\n")).collect();
                        seen = lines.len();
                        return Some((
                            Ok::<Bytes, std::convert::Infallible>(Bytes::from(chunk)),
                            (driver, container_id, seen),
                        ));
                    }
                    Ok(_) => {}
                    // container went away: end the stream
                    Err(_) => return None,
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        },
    );
    let body = Body::from_stream(
        stream::iter([Ok::<Bytes, std::convert::Infallible>(Bytes::from(first_chunk))])
            .chain(follow_stream),
    );
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

// ── Reconciliation controls ───────────────────────────────────────────────────

pub async fn trigger_reconcile(State(state): State<AppState>) -> Json<Value> {
    let queued = state.reconciler.trigger_reconcile();
    Json(json!({ "queued": queued }))
}

pub async fn pause_reconciliation(State(state): State<AppState>) -> Json<Value> {
    state.reconciler.pause_reconciliation();
    Json(json!({ "paused": true }))
}

pub async fn resume_reconciliation(State(state): State<AppState>) -> Json<Value> {
    state.reconciler.resume_reconciliation();
    Json(json!({ "paused": false }))
}

// ── Provisioning ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ProvisionBody {
    pub provisioning_secret: String,
    pub api_endpoint: Option<String>,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
}

pub async fn provision(
    State(state): State<AppState>,
    Json(body): Json<ProvisionBody>,
) -> Result<Json<Value>, ApiError> {
    let defaults = &state.provision_defaults;
    let api_endpoint = body
        .api_endpoint
        .or_else(|| defaults.api_endpoint.clone())
        .ok_or_else(|| ApiError::bad_request("api_endpoint required"))?;
    let request = ProvisionRequest {
        api_endpoint,
        provisioning_secret: Secret::new(body.provisioning_secret),
        device_name: body.device_name.unwrap_or_else(|| defaults.device_name.clone()),
        device_type: body.device_type.unwrap_or_else(|| defaults.device_type.clone()),
    };
    let identity = skiff_provision::provision(state.store.clone(), &request).await?;
    Ok(Json(json!({
        "uuid": identity.uuid,
        "device_id": identity.device_id,
        "provisioned": identity.provisioned,
    })))
}

pub async fn deprovision(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let identity = state
        .store
        .load_identity()
        .await?
        .ok_or_else(|| ApiError::not_found("no identity to deprovision"))?;
    let client = CloudClient::new(CloudClientConfig::from_identity(&identity))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    skiff_provision::deprovision(state.store.clone(), &client).await?;
    Ok(Json(json!({ "deprovisioned": true })))
}

pub async fn factory_reset(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    skiff_provision::factory_reset(state.store.clone()).await?;
    state.reconciler.trigger_reconcile();
    Ok(Json(json!({ "reset": true })))
}

// ── Config ────────────────────────────────────────────────────────────────────

pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "log_level": state.log.as_ref().map(|l| l.level()),
        "poll_interval_ms": state.sync.poll_interval().as_millis() as u64,
        "report_interval_ms": state.sync.report_interval().as_millis() as u64,
        "reconciliation_interval_ms": state.reconciler.interval().as_millis() as u64,
    }))
}

/// Whitelisted keys only; anything else rejects the whole request.
pub async fn post_config(
    State(state): State<AppState>,
    Json(body): Json<BTreeMap<String, Value>>,
) -> Result<Json<Value>, ApiError> {
    for (key, value) in &body {
        match key.as_str() {
            "log_level" => {
                let directive = value
                    .as_str()
                    .ok_or_else(|| ApiError::bad_request("log_level must be a string"))?;
                let log = state
                    .log
                    .as_ref()
                    .ok_or_else(|| ApiError::unavailable("log reload not wired"))?;
                log.set_level(directive)
                    .map_err(|e| ApiError::bad_request(format!("bad log_level: {e}")))?;
            }
            "poll_interval_ms" | "report_interval_ms" | "reconciliation_interval_ms" => {
                let ms = value
                    .as_u64()
                    .filter(|ms| *ms >= 100)
                    .ok_or_else(|| {
                        ApiError::bad_request(format!("{key} must be an integer >= 100"))
                    })?;
                let interval = Duration::from_millis(ms);
                match key.as_str() {
                    "poll_interval_ms" => state.sync.set_poll_interval(interval),
                    "report_interval_ms" => state.sync.set_report_interval(interval),
                    _ => state.reconciler.set_interval(interval),
                }
            }
            other => {
                return Err(ApiError::bad_request(format!(
                    "unknown or read-only config key '{other}'"
                )))
            }
        }
    }
    info!(keys = ?body.keys().collect::<Vec<_>>(), "local config updated");
    Ok(get_config(State(state)).await)
}
