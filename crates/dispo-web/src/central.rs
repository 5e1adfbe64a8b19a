//! Central dispatch API: batch import intake and the technician endpoints the
//! device sync talks to.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use dispo_storage::{CentralDb, DispoRepository};
use dispo_sync::{CentralConfig, ImportError, ImportService};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    absence_id, absence_input, body_id, json_error, json_object, job_update_from_body, parse_id,
    server_error, technician_id, window_from_params, Params,
};

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct CentralState {
    pub repo: DispoRepository,
    pub import: ImportService,
    /// When set, `/api/receive_dispo` requires this key.
    pub api_key: Option<String>,
}

impl CentralState {
    pub fn new(db: &CentralDb, api_key: Option<String>) -> Self {
        Self {
            repo: db.repository(),
            import: ImportService::new(db),
            api_key,
        }
    }
}

pub fn central_app(state: CentralState) -> Router {
    Router::new()
        .route("/api/receive_dispo", any(receive_dispo_handler))
        .route("/api/my_jobs", get(my_jobs_handler))
        .route("/api/my_absences", get(my_absences_handler))
        .route(
            "/api/job",
            get(job_detail_handler).patch(job_update_handler).post(job_update_handler),
        )
        .route(
            "/api/absence",
            post(absence_create_handler)
                .patch(absence_update_handler)
                .put(absence_update_handler)
                .delete(absence_delete_handler),
        )
        .route("/api/technician_info", get(technician_info_handler))
        .route("/api/anlagenstamm_by_fab", get(equipment_handler))
        .with_state(Arc::new(state))
}

/// Connects, migrates and serves the central API on `DISPO_WEB_PORT`.
pub async fn serve_central(config: &CentralConfig) -> anyhow::Result<()> {
    let db = CentralDb::connect(&config.database_url)
        .await
        .context("connecting central database")?;
    db.migrate().await.context("migrating central database")?;
    let state = CentralState::new(&db, config.api_key.clone());

    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "central api listening");
    axum::serve(listener, central_app(state)).await?;
    Ok(())
}

fn presented_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        let key = key.trim();
        if !key.is_empty() {
            return Some(key);
        }
    }
    let auth = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = auth.split_once(char::is_whitespace)?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

async fn receive_dispo_handler(
    State(state): State<Arc<CentralState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(expected) = state.api_key.as_deref() {
        if presented_api_key(&headers) != Some(expected) {
            return json_error(StatusCode::UNAUTHORIZED, "missing or invalid api key");
        }
    }
    if method != Method::POST {
        return json_error(StatusCode::METHOD_NOT_ALLOWED, "only POST is allowed");
    }
    if body.iter().all(u8::is_ascii_whitespace) {
        return json_error(StatusCode::BAD_REQUEST, "request body is empty");
    }
    let payload: JsonValue = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, format!("invalid JSON body: {err}")),
    };
    if !payload.is_object() {
        return json_error(StatusCode::BAD_REQUEST, "payload must be a JSON object");
    }

    match state.import.import_value(&payload).await {
        Ok(outcome) => {
            let mut body = json!({ "ok": true });
            if let (Some(target), Ok(JsonValue::Object(fields))) =
                (body.as_object_mut(), serde_json::to_value(&outcome))
            {
                target.extend(fields);
            }
            Json(body).into_response()
        }
        Err(err) => {
            match &err {
                ImportError::Normalize(_) => warn!(error = %err, "import payload rejected"),
                ImportError::Database(_) => warn!(error = %err, "import failed"),
            }
            json_error(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
    }
}

async fn authorize(
    state: &CentralState,
    params: &Params,
    headers: &HeaderMap,
) -> Result<i64, Response> {
    let Some(technician_id) = technician_id(params, headers) else {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "technician_id is required (query or X-Technician-Id header)",
        ));
    };
    match state.repo.is_technician(technician_id).await {
        Ok(true) => Ok(technician_id),
        Ok(false) => Err(json_error(
            StatusCode::FORBIDDEN,
            format!("user {technician_id} is not an active technician"),
        )),
        Err(err) => Err(server_error(err)),
    }
}

async fn my_jobs_handler(
    State(state): State<Arc<CentralState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let technician_id = authorize(&state, &params, &headers).await?;
    let window = window_from_params(&params)?;
    let jobs = state
        .repo
        .jobs_for_technician(technician_id, &window)
        .await
        .map_err(server_error)?;
    let technician = state.repo.technician(technician_id).await.map_err(server_error)?;
    let (full_name, username) = technician
        .map(|t| (t.full_name, t.username))
        .unwrap_or_default();
    Ok(Json(json!({
        "ok": true,
        "technician_id": technician_id,
        "technician_full_name": full_name,
        "technician_username": username,
        "jobs": jobs,
    }))
    .into_response())
}

async fn my_absences_handler(
    State(state): State<Arc<CentralState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let technician_id = authorize(&state, &params, &headers).await?;
    let window = window_from_params(&params)?;
    let absences = state
        .repo
        .absences_for_technician(technician_id, &window)
        .await
        .map_err(server_error)?;
    Ok(Json(json!({ "ok": true, "technician_id": technician_id, "absences": absences }))
        .into_response())
}

async fn job_detail_handler(
    State(state): State<Arc<CentralState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let technician_id = authorize(&state, &params, &headers).await?;
    let job_id = params
        .get("id")
        .and_then(|raw| parse_id(raw))
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "id is required"))?;
    match state
        .repo
        .job_for_technician(job_id, technician_id)
        .await
        .map_err(server_error)?
    {
        Some(job) => Ok(Json(json!({ "ok": true, "job": job })).into_response()),
        None => Err(json_error(StatusCode::NOT_FOUND, "job not found")),
    }
}

async fn job_update_handler(
    State(state): State<Arc<CentralState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Response> {
    let technician_id = authorize(&state, &params, &headers).await?;
    let body = json_object(&body)?;
    let (job_id, update) = job_update_from_body(&body)?;
    let updated = state
        .repo
        .update_job(job_id, technician_id, &update)
        .await
        .map_err(server_error)?;
    if !updated {
        return Err(json_error(StatusCode::NOT_FOUND, "job not found"));
    }
    info!(technician_id, job_id, action = %update.action(), "job updated");
    Ok(Json(json!({ "ok": true, "updated": update.action().as_str() })).into_response())
}

async fn absence_create_handler(
    State(state): State<Arc<CentralState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Response> {
    let technician_id = authorize(&state, &params, &headers).await?;
    let body = json_object(&body)?;
    let input = absence_input(&body)?;
    let id = state
        .repo
        .create_absence(technician_id, &input)
        .await
        .map_err(server_error)?;
    Ok(Json(json!({ "ok": true, "id": id })).into_response())
}

async fn absence_update_handler(
    State(state): State<Arc<CentralState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Response> {
    let technician_id = authorize(&state, &params, &headers).await?;
    let body = json_object(&body)?;
    let id = absence_id(&body, &params)?;
    let input = absence_input(&body)?;
    let updated = state
        .repo
        .update_absence(id, technician_id, &input)
        .await
        .map_err(server_error)?;
    if !updated {
        return Err(json_error(StatusCode::NOT_FOUND, "absence not found"));
    }
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn absence_delete_handler(
    State(state): State<Arc<CentralState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Response> {
    let technician_id = authorize(&state, &params, &headers).await?;
    let id = params
        .get("id")
        .and_then(|raw| parse_id(raw))
        .or_else(|| json_object(&body).ok().and_then(|body| body_id(&body, "id")))
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "id is required"))?;
    let deleted = state
        .repo
        .delete_absence(id, technician_id)
        .await
        .map_err(server_error)?;
    if !deleted {
        return Err(json_error(StatusCode::NOT_FOUND, "absence not found"));
    }
    Ok(Json(json!({ "ok": true })).into_response())
}

async fn technician_info_handler(
    State(state): State<Arc<CentralState>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Result<Response, Response> {
    let technician_id = authorize(&state, &params, &headers).await?;
    let technician = state
        .repo
        .technician(technician_id)
        .await
        .map_err(server_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "technician not found"))?;
    Ok(Json(json!({
        "ok": true,
        "id": technician.id,
        "username": technician.username.unwrap_or_default(),
        "full_name": technician.full_name.unwrap_or_default(),
    }))
    .into_response())
}

/// Distinct, trimmed, non-empty serials from a comma-separated list.
pub(crate) fn split_serials(raw: &str) -> Vec<String> {
    let mut serials: Vec<String> = Vec::new();
    for serial in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !serials.iter().any(|known| known == serial) {
            serials.push(serial.to_string());
        }
    }
    serials
}

async fn equipment_handler(
    State(state): State<Arc<CentralState>>,
    Query(params): Query<Params>,
) -> Result<Response, Response> {
    let serials = params.get("fabs").map(|raw| split_serials(raw)).unwrap_or_default();
    let data = state
        .repo
        .equipment_by_serials(&serials)
        .await
        .map_err(server_error)?;
    Ok(Json(json!({ "ok": true, "data": data })).into_response())
}
