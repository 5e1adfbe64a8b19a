//! Technician-side API over the local cache. Reads and edits never touch the
//! network; only the sync, connection check and equipment enrichment routes do.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use dispo_core::{
    encode_equipment_lines, enrich_equipment_lines, parse_equipment_lines, serial_numbers, DateWindow,
    JobRecord,
};
use dispo_storage::{
    DispoRemote, HttpConnector, LocalStore, RemoteConnector, RemoteCredentials, RemoteTarget,
};
use dispo_sync::{ClientConfig, PullReconciler, PushReplayer, SyncError, SyncGate};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    absence_id, absence_input, body_id, json_error, json_object, job_update_from_body, parse_id,
    server_error, technician_id, window_from_params, Params,
};

#[derive(Clone)]
pub struct LocalState {
    pub store: LocalStore,
    pub connector: Arc<dyn RemoteConnector>,
    /// Fallbacks for requests that omit the remote target or technician.
    pub config: ClientConfig,
    pub gate: SyncGate,
}

impl LocalState {
    pub fn new(store: LocalStore, config: ClientConfig) -> Self {
        let connector = Arc::new(HttpConnector { config: config.http() });
        Self {
            store,
            connector,
            config,
            gate: SyncGate::new(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn RemoteConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Shares the gate with a scheduled [`dispo_sync::SyncCycle`] so manual
    /// and timed syncs never overlap.
    pub fn with_gate(mut self, gate: SyncGate) -> Self {
        self.gate = gate;
        self
    }

    fn technician(&self, params: &Params, headers: &HeaderMap) -> Result<i64, Response> {
        technician_id(params, headers)
            .or(self.config.technician_id)
            .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "technician_id is required"))
    }
}

pub fn local_app(state: LocalState) -> Router {
    Router::new()
        .route("/api/technician", get(technician_handler))
        .route("/api/my_jobs", get(my_jobs_handler))
        .route("/api/job", get(job_detail_handler).patch(job_update_handler))
        .route("/api/my_absences", get(my_absences_handler))
        .route(
            "/api/absence",
            post(absence_create_handler)
                .patch(absence_update_handler)
                .put(absence_update_handler)
                .delete(absence_delete_handler),
        )
        .route("/api/pending_changes", get(pending_changes_handler))
        .route("/api/check_connection", post(check_connection_handler))
        .route("/api/sync_pull", post(sync_pull_handler))
        .route("/api/sync_push", post(sync_push_handler))
        .with_state(Arc::new(state))
}

/// Serves the local API on the loopback interface only.
pub async fn serve_local(state: LocalState) -> anyhow::Result<()> {
    let port = state.config.local_port;
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("binding local port {port}"))?;
    info!(port, "local api listening");
    axum::serve(listener, local_app(state)).await?;
    Ok(())
}

async fn technician_handler(
    State(state): State<Arc<LocalState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let technician_id = state.technician(&params, &headers)?;
    let technician = state.store.technician(technician_id).await.map_err(server_error)?;
    let (full_name, username) = technician
        .map(|t| (t.full_name, t.username))
        .unwrap_or_default();
    Ok(Json(json!({
        "ok": true,
        "id": technician_id,
        "full_name": full_name,
        "username": username,
    }))
    .into_response())
}

async fn my_jobs_handler(
    State(state): State<Arc<LocalState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let technician_id = state.technician(&params, &headers)?;
    let window = window_from_params(&params)?;
    let jobs = state
        .store
        .jobs_for_technician(technician_id, &window)
        .await
        .map_err(server_error)?;
    Ok(Json(json!({ "ok": true, "technician_id": technician_id, "jobs": jobs })).into_response())
}

fn flag(params: &Params, key: &str) -> bool {
    params
        .get(key)
        .is_some_and(|v| matches!(v.trim(), "1" | "true"))
}

async fn job_detail_handler(
    State(state): State<Arc<LocalState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let technician_id = state.technician(&params, &headers)?;
    let job_id = params
        .get("id")
        .and_then(|raw| parse_id(raw))
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "id is required"))?;
    let mut job = state
        .store
        .job_for_technician(technician_id, job_id)
        .await
        .map_err(server_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "job not found"))?;

    let mut body = json!({ "ok": true });
    if flag(&params, "enrich_anlagenstamm") || flag(&params, "enrich") {
        let target = target_from_params(&state.config, &params);
        let report = enrich_job(state.connector.as_ref(), target.as_ref(), &mut job).await;
        if let Some(report) = report {
            body["equipment_lookup"] = report;
        }
    }
    body["job"] = json!(job);
    Ok(Json(body).into_response())
}

fn target_from_params(config: &ClientConfig, params: &Params) -> Option<RemoteTarget> {
    let base_url = params
        .get("base_url")
        .or_else(|| params.get("baseUrl"))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| config.base_url.clone())?;
    let credentials = match params.get("serverUsername") {
        Some(username) => RemoteCredentials::from_parts(
            Some(username.trim().to_string()),
            params.get("serverPassword").cloned(),
        ),
        None => config.credentials.clone(),
    };
    Some(RemoteTarget { base_url, credentials })
}

/// Fills blank equipment attributes of the job from the remote master data.
/// Returns a lookup report when a lookup was attempted. A failed lookup leaves
/// the job as cached.
async fn enrich_job(
    connector: &dyn RemoteConnector,
    target: Option<&RemoteTarget>,
    job: &mut JobRecord,
) -> Option<JsonValue> {
    let raw = job.fabrikationsnummern.as_deref()?;
    let lines = parse_equipment_lines(raw);
    let serials = serial_numbers(&lines);
    if serials.is_empty() {
        return None;
    }
    let Some(target) = target else {
        return Some(json!({
            "requested": serials,
            "matched": 0,
            "error": "no server url configured"
        }));
    };

    let masters = match connector.connect(target) {
        Ok(remote) => remote.equipment_by_serials(&serials).await.map_err(|err| err.to_string()),
        Err(err) => Err(format!("{err:#}")),
    };
    match masters {
        Ok(masters) => {
            if !masters.is_empty() {
                let enriched = enrich_equipment_lines(&lines, &masters);
                job.fabrikationsnummern = Some(encode_equipment_lines(&enriched));
            }
            Some(json!({ "requested": serials, "matched": masters.len() }))
        }
        Err(error) => {
            warn!(job_id = job.id, error = %error, "equipment lookup failed; serving cached lines");
            Some(json!({ "requested": serials, "matched": 0, "error": error }))
        }
    }
}

async fn job_update_handler(
    State(state): State<Arc<LocalState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Response> {
    let technician_id = state.technician(&params, &headers)?;
    let body = json_object(&body)?;
    let (job_id, update) = job_update_from_body(&body)?;
    let updated = state
        .store
        .update_job(technician_id, job_id, &update)
        .await
        .map_err(server_error)?;
    if !updated {
        return Err(json_error(StatusCode::NOT_FOUND, "job not found"));
    }
    Ok(Json(json!({ "ok": true, "updated": update.action().as_str() })).into_response())
}

async fn my_absences_handler(
    State(state): State<Arc<LocalState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let technician_id = state.technician(&params, &headers)?;
    let window = window_from_params(&params)?;
    let absences = state
        .store
        .absences_for_technician(technician_id, &window)
        .await
        .map_err(server_error)?;
    Ok(Json(json!({ "ok": true, "technician_id": technician_id, "absences": absences }))
        .into_response())
}

async fn absence_create_handler(
    State(state): State<Arc<LocalState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Response> {
    let technician_id = state.technician(&params, &headers)?;
    let body = json_object(&body)?;
    let input = absence_input(&body)?;
    let id = state
        .store
        .create_absence(technician_id, &input)
        .await
        .map_err(server_error)?;
    Ok(Json(json!({ "ok": true, "id": id })).into_response())
}

async fn absence_update_handler(
    State(state): State<Arc<LocalState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Response> {
    let technician_id = state.technician(&params, &headers)?;
    let body = json_object(&body)?;
    let id = absence_id(&body, &params)?;
    let input = absence_input(&body)?;
    let updated = state
        .store
        .update_absence(technician_id, id, &input)
        .await
        .map_err(server_error)?;
    if !updated {
        return Err(json_error(StatusCode::NOT_FOUND, "absence not found"));
    }
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn absence_delete_handler(
    State(state): State<Arc<LocalState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Response> {
    let technician_id = state.technician(&params, &headers)?;
    let id = params
        .get("id")
        .and_then(|raw| parse_id(raw))
        .or_else(|| json_object(&body).ok().and_then(|body| body_id(&body, "id")))
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "id is required"))?;
    let deleted = state
        .store
        .delete_absence(technician_id, id)
        .await
        .map_err(server_error)?;
    if !deleted {
        return Err(json_error(StatusCode::NOT_FOUND, "absence not found"));
    }
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn pending_changes_handler(
    State(state): State<Arc<LocalState>>,
) -> Result<Response, Response> {
    let pending = state.store.pending_mutations().await.map_err(server_error)?;
    Ok(Json(json!({ "ok": true, "pending": pending })).into_response())
}

/// Remote target, technician and window of a sync request. Body fields win;
/// missing ones come from the client configuration.
struct SyncRequest {
    target: Option<RemoteTarget>,
    technician_id: Option<i64>,
    window: DateWindow,
}

fn body_str<'a>(body: &'a JsonValue, key: &str) -> Option<&'a str> {
    body.get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn sync_request(config: &ClientConfig, body: &JsonValue) -> Result<SyncRequest, Response> {
    let base_url = body_str(body, "baseUrl")
        .map(str::to_string)
        .or_else(|| config.base_url.clone());
    let credentials = match body_str(body, "serverUsername") {
        Some(username) => RemoteCredentials::from_parts(
            Some(username.to_string()),
            body.get("serverPassword")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
        ),
        None => config.credentials.clone(),
    };

    let date = |key: &str| -> Result<Option<NaiveDate>, Response> {
        match body_str(body, key) {
            None => Ok(None),
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(Some)
                .map_err(|_| {
                    json_error(StatusCode::BAD_REQUEST, format!("{key} must be YYYY-MM-DD"))
                }),
        }
    };
    let (date_from, date_to) = (date("date_from")?, date("date_to")?);
    let window = if date_from.is_none() && date_to.is_none() {
        config.window(Utc::now().date_naive())
    } else {
        DateWindow::new(date_from, date_to)
    };

    Ok(SyncRequest {
        target: base_url.map(|base_url| RemoteTarget { base_url, credentials }),
        technician_id: body_id(body, "technicianId").or(config.technician_id),
        window,
    })
}

fn connect_required(
    state: &LocalState,
    request: &SyncRequest,
) -> Result<(Arc<dyn DispoRemote>, i64), Response> {
    let (Some(target), Some(technician_id)) = (request.target.as_ref(), request.technician_id)
    else {
        return Err(json_error(StatusCode::BAD_REQUEST, "baseUrl and technicianId are required"));
    };
    let remote = state
        .connector
        .connect(target)
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, format!("{err:#}")))?;
    Ok((remote, technician_id))
}

fn sync_failure(err: SyncError) -> Response {
    if err.is_remote() {
        warn!(error = %err, "manual sync failed");
        return json_error(StatusCode::BAD_GATEWAY, err.to_string());
    }
    server_error(err)
}

/// Always answers 200; the outcome is in `ok`/`error`.
async fn check_connection_handler(State(state): State<Arc<LocalState>>, body: Bytes) -> Response {
    let body = match json_object(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let request = match sync_request(&state.config, &body) {
        Ok(request) => request,
        Err(resp) => return resp,
    };
    let Some(target) = request.target.as_ref() else {
        return Json(json!({ "ok": false, "error": "server url is missing" })).into_response();
    };
    let Some(technician_id) = request.technician_id else {
        return Json(json!({ "ok": false, "error": "technician id is missing" })).into_response();
    };
    let outcome = match state.connector.connect(target) {
        Ok(remote) => remote
            .check_connection(technician_id)
            .await
            .map_err(|err| SyncError::from_remote(technician_id, err).to_string()),
        Err(err) => Err(format!("{err:#}")),
    };
    match outcome {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(error) => Json(json!({ "ok": false, "error": error })).into_response(),
    }
}

async fn sync_pull_handler(
    State(state): State<Arc<LocalState>>,
    body: Bytes,
) -> Result<Response, Response> {
    let body = json_object(&body)?;
    let request = sync_request(&state.config, &body)?;
    let (remote, technician_id) = connect_required(&state, &request)?;

    let _guard = state.gate.enter().await;
    let summary = PullReconciler::new(state.store.clone(), remote)
        .pull(technician_id, &request.window)
        .await
        .map_err(sync_failure)?;
    state.store.persist().await.map_err(server_error)?;
    Ok(Json(json!({ "ok": true, "pull": summary })).into_response())
}

async fn sync_push_handler(
    State(state): State<Arc<LocalState>>,
    body: Bytes,
) -> Result<Response, Response> {
    let body = json_object(&body)?;
    let request = sync_request(&state.config, &body)?;
    let (remote, technician_id) = connect_required(&state, &request)?;

    let _guard = state.gate.enter().await;
    let summary = PushReplayer::new(state.store.clone(), remote)
        .push(technician_id)
        .await
        .map_err(sync_failure)?;
    state.store.persist().await.map_err(server_error)?;
    Ok(Json(json!({ "ok": true, "push": summary })).into_response())
}
